//! The context handed to a handler for one inbound call.

use duorpc::Identity;
use duorpc::Value;

use crate::connection::Connection;

/// One inbound call.
///
/// Holds the connection the call arrived on, so a handler can call back into
/// its caller while the original call is still in flight.
pub struct Request {
    method: String,
    args: Value,
    connection: Connection,
}

impl Request {
    pub(crate) fn new(method: String, args: Value, connection: Connection) -> Self {
        Self { method, args, connection }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn into_args(self) -> Value {
        self.args
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The identity the caller announced during the handshake.
    pub fn remote(&self) -> &Identity {
        self.connection.remote()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("remote", &self.remote().name)
            .finish()
    }
}
