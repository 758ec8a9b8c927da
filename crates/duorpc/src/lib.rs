//! # Duorpc
//!
//! The wire protocol spoken between duplex peers.
//!
//! ## Architecture
//!
//! - `value`: the dynamically typed `Value` carried by calls, with embedded `Function`s.
//! - `codec`: `Value` <-> duopack, with functions exported and imported as callback ids.
//! - `frame`: the handshake, request, response and callback-invoke envelopes.
//! - `identity`: who a peer is and how it authenticates.

pub mod codec;
pub mod error;
pub mod frame;
pub mod identity;
pub mod value;

pub use codec::CallbackSink;
pub use codec::CallbackSource;
pub use codec::NoCallbacks;
pub use codec::decode_value;
pub use codec::encode_value;
pub use error::Error;
pub use error::Failure;
pub use error::FailureKind;
pub use error::Result;
pub use frame::Frame;
pub use frame::Header;
pub use frame::peek_header;
pub use identity::Credential;
pub use identity::Identity;
pub use value::Callable;
pub use value::Function;
pub use value::Kind;
pub use value::TypeError;
pub use value::Value;
