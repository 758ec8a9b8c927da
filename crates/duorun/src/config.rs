//! Peer configuration.
//!
//! Everything a peer needs to know about itself before it starts: the identity
//! it announces, where it listens, the key same-host peers share, and the
//! deadlines applied to dialing, handshaking and calling.

use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;

pub const DEFAULT_VERSION: &str = "0.1.0";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_REGION: &str = "localhost";
pub const DEFAULT_ENVIRONMENT: &str = "development";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const SHARED_KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct Config {
    pub name: String,
    pub version: String,
    /// Port to listen on. `0` picks an ephemeral port.
    pub port: u16,
    pub host: String,
    pub region: String,
    pub environment: String,
    /// Key accepted by the built-in `shared-key` authenticator.
    pub shared_key: String,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub max_frame_size: usize,
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: DEFAULT_VERSION.into(),
            port: 0,
            host: DEFAULT_HOST.into(),
            region: DEFAULT_REGION.into(),
            environment: DEFAULT_ENVIRONMENT.into(),
            shared_key: random_string(SHARED_KEY_LEN),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Peers that should trust each other on one host are given the same key.
    pub fn with_shared_key(mut self, key: impl Into<String>) -> Self {
        self.shared_key = key.into();
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("duorun")
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("port", &self.port)
            .field("host", &self.host)
            .field("region", &self.region)
            .field("environment", &self.environment)
            .field("shared_key", &"<redacted>")
            .field("dial_timeout", &self.dial_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

pub(crate) fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
