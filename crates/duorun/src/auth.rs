//! # Authentication
//!
//! The listening side of a handshake selects an [`Authenticator`] by the
//! credential's scheme. Unknown schemes are rejected.

use duorpc::Credential;
use duorpc::Identity;

use crate::error::Error;
use crate::error::Result;

/// Scheme of the built-in authenticator every peer registers.
pub const SHARED_KEY_SCHEME: &str = "shared-key";

#[async_trait::async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Accepts or rejects a dialing peer. Rejections return `Error::Auth`
    /// with the reason sent back in the `Reject` frame.
    async fn authenticate(&self, remote: &Identity, credential: &Credential) -> Result<()>;
}

/// Accepts peers presenting the key this peer was configured with.
pub struct SharedKey {
    key: String,
}

impl SharedKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait::async_trait]
impl Authenticator for SharedKey {
    async fn authenticate(&self, _remote: &Identity, credential: &Credential) -> Result<()> {
        if constant_time_eq(self.key.as_bytes(), credential.key.as_bytes()) {
            Ok(())
        } else {
            Err(Error::Auth("invalid shared key".into()))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
