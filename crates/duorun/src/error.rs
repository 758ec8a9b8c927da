//! # Runtime Errors
//!
//! Every fallible operation of a peer or connection returns [`Error`].
//!
//! Errors raised locally inside a handler travel to the caller as a
//! [`Failure`]; [`Error::to_failure`] decides which kind tag they carry.

use duorpc::Failure;
use duorpc::FailureKind;
use duorpc::TypeError;

use crate::transport;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The connection could not be established: connect failure, handshake
    /// timeout, or the remote side hung up or misbehaved mid-handshake.
    Dial(String),
    /// The credential was rejected.
    Auth(String),
    /// No response arrived before the deadline.
    Timeout,
    /// The remote peer has no handler for this method.
    MethodNotFound(String),
    /// An argument was extracted as the wrong type.
    ArgumentType(TypeError),
    /// The callback id is unknown to its owner, or was released.
    InvalidCallback(u64),
    /// The remote handler failed.
    Remote(Failure),
    /// The connection was torn down before the operation completed.
    ConnectionClosed,
    Transport(transport::Error),
    Codec(duorpc::Error),
    /// A local handler failed.
    Handler(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dial(msg) => write!(f, "Dial failed: {}", msg),
            Self::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            Self::Timeout => write!(f, "Request timed out"),
            Self::MethodNotFound(method) => write!(f, "Method not found: {}", method),
            Self::ArgumentType(e) => write!(f, "Argument type mismatch: {}", e),
            Self::InvalidCallback(id) => write!(f, "Invalid callback: #{}", id),
            Self::Remote(failure) => write!(f, "Remote failure: {}", failure),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Handler(msg) => write!(f, "Handler error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<duorpc::Error> for Error {
    fn from(e: duorpc::Error) -> Self {
        Self::Codec(e)
    }
}

impl From<TypeError> for Error {
    fn from(e: TypeError) -> Self {
        Self::ArgumentType(e)
    }
}

/// Lets handlers use `?` on a callback invocation.
impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure.kind {
            FailureKind::ConnectionClosed => Self::ConnectionClosed,
            FailureKind::Timeout => Self::Timeout,
            _ => Self::Remote(failure),
        }
    }
}

impl Error {
    /// The failure reported to the remote caller when a handler returns this error.
    ///
    /// A `MethodNotFound` or `Remote` error coming out of a nested call is the
    /// handler's own failure, not the outer caller's, so it is reported as `Handler`.
    pub fn to_failure(&self) -> Failure {
        let kind = match self {
            Self::ArgumentType(_) => FailureKind::ArgumentType,
            Self::InvalidCallback(id) => return Failure::invalid_callback(*id),
            Self::Timeout => FailureKind::Timeout,
            Self::ConnectionClosed => FailureKind::ConnectionClosed,
            Self::Codec(_) => FailureKind::Protocol,
            Self::Handler(msg) => return Failure::handler(msg.clone()),
            _ => FailureKind::Handler,
        };
        Failure::new(kind, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
