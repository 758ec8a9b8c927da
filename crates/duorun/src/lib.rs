//! # Duorun
//!
//! Duplex peer-to-peer RPC. Every peer serves named methods and calls methods on
//! other peers; a single connection carries calls in both directions, and
//! arguments may carry functions that the receiving side invokes remotely.
//!
//! ```no_run
//! use duorun::Config;
//! use duorun::Peer;
//! use duorun::Value;
//!
//! # async fn run() -> duorun::Result<()> {
//! let worker = Peer::new(Config::new("mathworker"));
//! worker.handle_func("square", |request| async move {
//!     let n = request.args().as_f64()?;
//!     Ok(Value::from(n * n))
//! });
//! let addr = worker.listen().await?;
//!
//! let client = Peer::new(Config::new("client"));
//! let connection = client.dial(&addr.to_string(), worker.credential()).await?;
//! assert_eq!(connection.call("square", 2).await?, Value::from(4.0));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod mock_transport;
pub mod peer;
pub mod request;
pub mod transport;

mod callbacks;
mod pending;

pub use auth::Authenticator;
pub use auth::SHARED_KEY_SCHEME;
pub use auth::SharedKey;
pub use config::Config;
pub use connection::Connection;
pub use dispatch::Handler;
pub use error::Error;
pub use error::Result;
pub use peer::Descriptor;
pub use peer::PING_METHOD;
pub use peer::Peer;
pub use request::Request;
pub use transport::TcpTransport;
pub use transport::Transport;

pub use duorpc::Credential;
pub use duorpc::Failure;
pub use duorpc::FailureKind;
pub use duorpc::Function;
pub use duorpc::Identity;
pub use duorpc::Kind;
pub use duorpc::TypeError;
pub use duorpc::Value;

#[cfg(test)]
mod tests;
