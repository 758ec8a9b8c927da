//! # Peers
//!
//! A peer serves named methods and calls methods on other peers. It owns the
//! dispatch table, the authenticators and its identity; every connection it
//! produces (by dialing out or by accepting) shares that dispatch table.
//!
//! Uses DashMap for registration and bookkeeping so handlers, authenticators
//! and hooks can be added while connections are live.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use duorpc::Credential;
use duorpc::Identity;
use duorpc::Value;

use crate::auth::Authenticator;
use crate::auth::SHARED_KEY_SCHEME;
use crate::auth::SharedKey;
use crate::config::Config;
use crate::config::random_string;
use crate::connection::Connection;
use crate::connection::accept_handshake;
use crate::connection::dial_handshake;
use crate::dispatch::DispatchTable;
use crate::dispatch::FnHandler;
use crate::dispatch::Handler;
use crate::error::Error;
use crate::error::Result;
use crate::request::Request;
use crate::transport;
use crate::transport::TcpTransport;
use crate::transport::Transport;

/// Method every peer answers with `"pong"`.
pub const PING_METHOD: &str = "duo.ping";

const INSTANCE_ID_LEN: usize = 20;

/// Pause after a failed `accept`, so errors like EMFILE do not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where a listening peer can be reached, and who it claims to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub identity: Identity,
    pub addr: SocketAddr,
}

type Hook = Arc<dyn Fn(&Connection) + Send + Sync>;

#[derive(Clone)]
pub struct Peer {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    identity: Identity,
    dispatch: Arc<DispatchTable>,
    authenticators: DashMap<String, Arc<dyn Authenticator>>,
    connections: DashMap<u64, Connection>,
    next_connection_id: AtomicU64,
    connect_hooks: DashMap<u64, Hook>,
    disconnect_hooks: DashMap<u64, Hook>,
    next_hook_id: AtomicU64,
    local_addr: OnceLock<SocketAddr>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Peer {
    /// Creates a peer with a fresh instance id, the `shared-key` authenticator
    /// for `config.shared_key`, and the built-in ping method.
    pub fn new(config: Config) -> Self {
        let identity = Identity {
            name: config.name.clone(),
            version: config.version.clone(),
            port: config.port,
            region: config.region.clone(),
            environment: config.environment.clone(),
            instance_id: random_string(INSTANCE_ID_LEN),
        };

        let authenticators: DashMap<String, Arc<dyn Authenticator>> = DashMap::new();
        authenticators.insert(
            SHARED_KEY_SCHEME.to_string(),
            Arc::new(SharedKey::new(config.shared_key.clone())),
        );

        let peer = Self {
            shared: Arc::new(Shared {
                config,
                identity,
                dispatch: Arc::new(DispatchTable::new()),
                authenticators,
                connections: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
                connect_hooks: DashMap::new(),
                disconnect_hooks: DashMap::new(),
                next_hook_id: AtomicU64::new(1),
                local_addr: OnceLock::new(),
                listener: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        };

        peer.handle_func(PING_METHOD, |_request| async { Ok(Value::from("pong")) });
        peer
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The credential other peers on this host use to reach this one.
    pub fn credential(&self) -> Credential {
        Credential::new(SHARED_KEY_SCHEME, self.shared.config.shared_key.clone())
    }

    // ============================================================================
    //  REGISTRATION
    // ============================================================================

    /// Registers an async closure for `method`. A later registration under the
    /// same name replaces this one.
    pub fn handle_func<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handle(method, FnHandler(handler));
    }

    pub fn handle(&self, method: impl Into<String>, handler: impl Handler) {
        let method = method.into();
        if self.shared.dispatch.register(method.clone(), Arc::new(handler)) {
            debug!(peer = %self.shared.identity.name, method = %method, "handler replaced");
        }
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        self.shared.dispatch.methods()
    }

    /// Accepts credentials of `scheme` through `authenticator`, replacing any
    /// earlier authenticator for that scheme.
    pub fn add_authenticator(&self, scheme: impl Into<String>, authenticator: impl Authenticator) {
        self.shared.authenticators.insert(scheme.into(), Arc::new(authenticator));
    }

    /// Runs `hook` for every connection once its handshake succeeds.
    pub fn on_connect(&self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        let id = self.shared.next_hook_id.fetch_add(1, Ordering::Relaxed);
        self.shared.connect_hooks.insert(id, Arc::new(hook));
    }

    /// Runs `hook` for every connection once it has been torn down.
    pub fn on_disconnect(&self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        let id = self.shared.next_hook_id.fetch_add(1, Ordering::Relaxed);
        self.shared.disconnect_hooks.insert(id, Arc::new(hook));
    }

    // ============================================================================
    //  CONNECTIONS
    // ============================================================================

    /// Dials over an already open transport: sends `Hello`, waits for `Welcome`.
    pub async fn connect(&self, transport: impl Transport, credential: Credential) -> Result<Connection> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let timeout = self.shared.config.handshake_timeout;

        match dial_handshake(transport.as_ref(), &self.shared.identity, credential, timeout).await {
            Ok(remote) => {
                info!(peer = %self.shared.identity.name, remote = %remote, "connected");
                self.register(transport, remote).await
            }
            Err(e) => {
                let _ = transport.close().await;
                warn!(peer = %self.shared.identity.name, error = %e, "handshake failed");
                Err(e)
            }
        }
    }

    /// Accepts a dialing peer over `transport`: authenticates its `Hello`
    /// and answers `Welcome` or `Reject`.
    pub async fn serve(&self, transport: impl Transport) -> Result<Connection> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let timeout = self.shared.config.handshake_timeout;

        let authenticate = |remote: Identity, credential: Credential| async move {
            let authenticator = self
                .shared
                .authenticators
                .get(&credential.scheme)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::Auth(format!("unknown scheme '{}'", credential.scheme)))?;
            authenticator.authenticate(&remote, &credential).await?;
            Ok(remote)
        };

        match accept_handshake(transport.as_ref(), &self.shared.identity, timeout, authenticate).await {
            Ok(remote) => {
                info!(peer = %self.shared.identity.name, remote = %remote, "accepted");
                self.register(transport, remote).await
            }
            Err(e) => {
                let _ = transport.close().await;
                warn!(peer = %self.shared.identity.name, error = %e, "rejected connection");
                Err(e)
            }
        }
    }

    /// Opens a TCP connection to `addr` (bounded by the dial timeout) and dials over it.
    pub async fn dial(&self, addr: &str, credential: Credential) -> Result<Connection> {
        let config = &self.shared.config;
        let connect = TcpTransport::connect(addr, config.max_frame_size);

        let transport = match tokio::time::timeout(config.dial_timeout, connect).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(Error::Dial(format!("{}: {}", addr, e))),
            Err(_) => return Err(Error::Dial(format!("{}: connect timed out", addr))),
        };

        self.connect(transport, credential).await
    }

    /// Dials a peer by descriptor and checks that the peer answering is the one described.
    pub async fn dial_peer(&self, descriptor: &Descriptor, credential: Credential) -> Result<Connection> {
        let connection = self.dial(&descriptor.addr.to_string(), credential).await?;

        let expected = &descriptor.identity.name;
        if &connection.remote().name != expected {
            let reached = connection.remote().name.clone();
            connection.close().await;
            return Err(Error::Dial(format!("expected peer '{}', reached '{}'", expected, reached)));
        }
        Ok(connection)
    }

    /// Binds the configured host and port and accepts connections in the
    /// background. Returns the bound address.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let config = &self.shared.config;
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(transport::Error::from)?;
        let addr = listener.local_addr().map_err(transport::Error::from)?;

        if self.shared.local_addr.set(addr).is_err() {
            return Err(Error::Transport(transport::Error::Io("peer is already listening".into())));
        }

        info!(peer = %self.shared.identity.name, %addr, "listening");
        let handle = tokio::spawn(self.clone().accept_loop(listener));
        *self.shared.listener.lock().await = Some(handle);
        Ok(addr)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(peer = %self.shared.identity.name, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            debug!(peer = %self.shared.identity.name, %remote_addr, "incoming connection");
            let peer = self.clone();
            tokio::spawn(async move {
                let transport = TcpTransport::new(stream, peer.shared.config.max_frame_size);
                // failures are logged by serve
                let _ = peer.serve(transport).await;
            });
        }
    }

    /// The address this peer listens on, once `listen` has succeeded.
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.shared.local_addr.get().map(|addr| Descriptor {
            identity: self.shared.identity.clone(),
            addr: *addr,
        })
    }

    /// Live connections, in no particular order.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting and closes every live connection. Handshakes still in
    /// flight fail with `ConnectionClosed` instead of producing a connection.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.shared.listener.lock().await.take() {
            handle.abort();
        }
        for connection in self.connections() {
            connection.close().await;
        }
    }

    async fn register(&self, transport: Arc<dyn Transport>, remote: Identity) -> Result<Connection> {
        if self.is_closed() {
            let _ = transport.close().await;
            debug!(peer = %self.shared.identity.name, remote = %remote, "dropping handshake finished after close");
            return Err(Error::ConnectionClosed);
        }

        let id = self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::start(
            id,
            transport,
            self.shared.identity.clone(),
            remote,
            self.shared.dispatch.clone(),
            self.shared.config.call_timeout,
        );

        self.shared.connections.insert(id, connection.clone());
        // close() may have listed the connections before this insert
        if self.is_closed() {
            self.shared.connections.remove(&id);
            connection.close().await;
            return Err(Error::ConnectionClosed);
        }

        for hook in self.hooks(&self.shared.connect_hooks) {
            hook(&connection);
        }

        let peer = self.clone();
        let watched = connection.clone();
        tokio::spawn(async move {
            watched.closed().await;
            peer.shared.connections.remove(&watched.id());
            for hook in peer.hooks(&peer.shared.disconnect_hooks) {
                hook(&watched);
            }
        });

        Ok(connection)
    }

    /// Snapshot so hooks run without holding a map lock.
    fn hooks(&self, table: &DashMap<u64, Hook>) -> Vec<Hook> {
        let mut hooks: Vec<(u64, Hook)> = table.iter().map(|e| (*e.key(), e.value().clone())).collect();
        hooks.sort_by_key(|(id, _)| *id);
        hooks.into_iter().map(|(_, hook)| hook).collect()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("identity", &self.shared.identity)
            .field("connections", &self.shared.connections.len())
            .finish()
    }
}
