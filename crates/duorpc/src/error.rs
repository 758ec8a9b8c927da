//! # Error Definitions
//!
//! Protocol-level failures (`Error`) and the failures a remote peer reports
//! inside a response frame (`Failure`).

use duopack::Error as PackError;

/// Failures while encoding or decoding values and frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The underlying duopack serialization failed.
    Serialization(PackError),
    /// The frame structure was malformed (e.g., missing id header).
    ProtocolViolation(String),
    /// An unknown frame kind or failure tag was encountered.
    UnknownVariant(String),
    /// The nested depth of a value exceeded the safety limit.
    RecursionLimitExceeded,
    /// A callback reference appeared where none is allowed (e.g., the handshake).
    UnexpectedCallback,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::UnknownVariant(name) => write!(f, "Unknown variant: {}", name),
            Self::RecursionLimitExceeded => write!(f, "Value nesting exceeds recursion limit"),
            Self::UnexpectedCallback => write!(f, "Callback reference not allowed here"),
        }
    }
}

impl std::error::Error for Error {}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self { Self::Serialization(e) }
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable tag carried next to a failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No handler is registered under the requested method.
    MethodNotFound,
    /// A handler extracted an argument as the wrong type.
    ArgumentType,
    /// The callback id is unknown or no longer valid.
    InvalidCallback,
    /// The handler returned an error (or panicked).
    Handler,
    /// A nested call inside the handler timed out.
    Timeout,
    /// A connection used by the handler was torn down.
    ConnectionClosed,
    /// The remote side could not make sense of the frame.
    Protocol,
}

impl FailureKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::MethodNotFound => "MethodNotFound",
            Self::ArgumentType => "ArgumentType",
            Self::InvalidCallback => "InvalidCallback",
            Self::Handler => "Handler",
            Self::Timeout => "Timeout",
            Self::ConnectionClosed => "ConnectionClosed",
            Self::Protocol => "Protocol",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "MethodNotFound" => Ok(Self::MethodNotFound),
            "ArgumentType" => Ok(Self::ArgumentType),
            "InvalidCallback" => Ok(Self::InvalidCallback),
            "Handler" => Ok(Self::Handler),
            "Timeout" => Ok(Self::Timeout),
            "ConnectionClosed" => Ok(Self::ConnectionClosed),
            "Protocol" => Ok(Self::Protocol),
            _ => Err(Error::UnknownVariant(format!("Failure kind: {}", tag))),
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// The error side of a response frame.
///
/// Distinct from `Error`: a `Failure` is the *remote* side reporting that the
/// call did not succeed, whereas `Error` means the bytes themselves were bad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Handler, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(FailureKind::MethodNotFound, format!("method '{}' not found", method))
    }

    pub fn invalid_callback(id: u64) -> Self {
        Self::new(FailureKind::InvalidCallback, format!("callback #{} not found", id))
    }

    pub fn connection_closed() -> Self {
        Self::new(FailureKind::ConnectionClosed, "connection closed")
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}
