//! # Connections
//!
//! One authenticated session over one transport, usable in both directions.
//!
//! A background pump reads frames and demultiplexes them:
//! - `Response` resolves an entry in the pending-call table.
//! - `Request` runs the registered handler on its own task.
//! - `Invoke` runs an exported callback on its own task.
//!
//! The pump never awaits a handler or callback, so a handler may call back into
//! its caller (or invoke a callback it was given) over the same connection
//! without deadlocking.
//!
//! ## Invariants
//! - **One Answer**: Every `Request` with `reply = true` and every `Invoke` gets
//!   exactly one `Response` carrying its id.
//! - **Teardown Is Final**: Once closed, all pending calls fail with
//!   `ConnectionClosed`, the callback registry is empty, and new calls fail
//!   immediately. Teardown happens at most once.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use duorpc::Callable;
use duorpc::CallbackSink;
use duorpc::CallbackSource;
use duorpc::Credential;
use duorpc::Failure;
use duorpc::FailureKind;
use duorpc::Frame;
use duorpc::Function;
use duorpc::Identity;
use duorpc::NoCallbacks;
use duorpc::Value;
use duorpc::peek_header;

use crate::callbacks::CallbackRegistry;
use crate::dispatch::DispatchTable;
use crate::error::Error;
use crate::error::Result;
use crate::pending::PendingCalls;
use crate::pending::Reply;
use crate::request::Request;
use crate::transport::Transport;

/// A live session with a remote peer. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    local: Identity,
    remote: Identity,
    transport: Arc<dyn Transport>,
    pending: PendingCalls,
    callbacks: CallbackRegistry,
    dispatch: Arc<DispatchTable>,
    call_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Wraps an authenticated transport and starts its pump.
    pub(crate) fn start(
        id: u64,
        transport: Arc<dyn Transport>,
        local: Identity,
        remote: Identity,
        dispatch: Arc<DispatchTable>,
        call_timeout: Duration,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let connection = Self {
            inner: Arc::new(Inner {
                id,
                local,
                remote,
                transport,
                pending: PendingCalls::new(),
                callbacks: CallbackRegistry::new(),
                dispatch,
                call_timeout,
                closed,
            }),
        };

        tokio::spawn(connection.clone().pump());
        connection
    }

    /// Identifies this connection within its peer.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The identity the remote side announced during the handshake.
    pub fn remote(&self) -> &Identity {
        &self.inner.remote
    }

    pub fn local(&self) -> &Identity {
        &self.inner.local
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the connection has been torn down, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Tears the connection down and closes the transport.
    pub async fn close(&self) {
        self.teardown("closed locally").await;
    }

    /// Calls `method` on the remote peer and waits for its result, bounded by
    /// the configured call timeout.
    pub async fn call(&self, method: &str, args: impl Into<Value>) -> Result<Value> {
        self.call_with_timeout(method, args, self.inner.call_timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: impl Into<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let (id, rx) = self.inner.pending.register();
        let frame = Frame::Request {
            id,
            method: method.to_string(),
            args: args.into(),
            reply: true,
        };

        match self.exchange(id, &frame, rx, timeout).await? {
            Ok(value) => Ok(value),
            Err(failure) if failure.kind == FailureKind::MethodNotFound => {
                Err(Error::MethodNotFound(method.to_string()))
            }
            Err(failure) => Err(Error::Remote(failure)),
        }
    }

    /// Sends a call without waiting for, or asking for, a result.
    ///
    /// Only local failures (closed connection, encoding, transport) are reported.
    pub async fn go(&self, method: &str, args: impl Into<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let frame = Frame::Request {
            id: self.inner.pending.next_id(),
            method: method.to_string(),
            args: args.into(),
            reply: false,
        };
        self.send_frame(&frame).await
    }

    /// Forgets an exported callback. Later invocations of it fail with `InvalidCallback`.
    pub fn release_callback(&self, id: u64) -> bool {
        self.inner.callbacks.release(id)
    }

    /// The id `function` is exported under on this connection, if it has been
    /// sent and not released. Clones of a function share one id.
    pub fn callback_id(&self, function: &Function) -> Option<u64> {
        self.inner.callbacks.id_of(function)
    }

    /// Releases `function` if it is exported here. Sending it again exports it
    /// under a new id.
    pub fn release_function(&self, function: &Function) -> bool {
        match self.callback_id(function) {
            Some(id) => self.release_callback(id),
            None => false,
        }
    }

    /// Number of exported callbacks still invokable by the remote side.
    pub fn exported_callbacks(&self) -> usize {
        self.inner.callbacks.len()
    }

    /// Number of outbound calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Invokes a callback exported by the remote side and waits for its acknowledgement.
    pub(crate) async fn invoke(&self, callback: u64, args: Value) -> Result<()> {
        let (id, rx) = self.inner.pending.register();
        let frame = Frame::Invoke { id, callback, args };

        match self.exchange(id, &frame, rx, self.inner.call_timeout).await? {
            Ok(_) => Ok(()),
            Err(failure) if failure.kind == FailureKind::InvalidCallback => {
                Err(Error::InvalidCallback(callback))
            }
            Err(failure) => Err(Error::Remote(failure)),
        }
    }

    /// Sends a frame whose pending entry `id` is already registered, then waits.
    /// Sending and waiting share one deadline.
    async fn exchange(
        &self,
        id: u64,
        frame: &Frame,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> Result<Reply> {
        let deadline = Instant::now() + timeout;

        // registered after teardown cleared the table: nobody would ever answer
        if self.is_closed() {
            self.inner.pending.remove(id);
            return Err(Error::ConnectionClosed);
        }

        let (bytes, fresh) = match self.encode_frame(frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.inner.pending.remove(id);
                return Err(e);
            }
        };

        match tokio::time::timeout_at(deadline, self.inner.transport.send(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.inner.pending.remove(id);
                self.unexport(&fresh);
                return Err(e.into());
            }
            Err(_) => {
                self.inner.pending.remove(id);
                self.unexport(&fresh);
                warn!(remote = %self.inner.remote.name, id, "send timed out, closing");
                // the frame may be half written, the stream is no longer usable
                let connection = self.clone();
                tokio::spawn(async move { connection.teardown("send timed out").await });
                return Err(Error::Timeout);
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.inner.pending.remove(id);
                debug!(remote = %self.inner.remote.name, id, "call timed out");
                Err(Error::Timeout)
            }
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let (bytes, fresh) = self.encode_frame(frame)?;
        if let Err(e) = self.inner.transport.send(&bytes).await {
            self.unexport(&fresh);
            return Err(e.into());
        }
        Ok(())
    }

    /// Encodes an outbound frame, exporting its functions. Returns the ids
    /// this frame registered for the first time so a failed send can undo them.
    fn encode_frame(&self, frame: &Frame) -> Result<(Vec<u8>, Vec<u64>)> {
        let exports = FrameExports {
            callbacks: &self.inner.callbacks,
            fresh: RefCell::new(Vec::new()),
        };
        let encoded = frame.encode(&exports);
        let fresh = exports.fresh.into_inner();
        match encoded {
            Ok(bytes) => Ok((bytes, fresh)),
            Err(e) => {
                self.unexport(&fresh);
                Err(e.into())
            }
        }
    }

    fn unexport(&self, ids: &[u64]) {
        for id in ids {
            self.inner.callbacks.release(*id);
        }
    }

    // ============================================================================
    //  PUMP
    // ============================================================================

    async fn pump(self) {
        let mut closed = self.inner.closed.subscribe();

        let reason = loop {
            let next = tokio::select! {
                _ = closed.wait_for(|c| *c) => return,
                next = self.inner.transport.recv() => next,
            };

            match next {
                Ok(Some(bytes)) => {
                    if let Err(e) = self.handle_frame(&bytes).await {
                        warn!(remote = %self.inner.remote.name, error = %e, "protocol violation");
                        break format!("protocol violation: {}", e);
                    }
                }
                Ok(None) => break "transport closed by remote".to_string(),
                Err(e) => break format!("transport error: {}", e),
            }
        };

        self.teardown(&reason).await;
    }

    async fn handle_frame(&self, bytes: &[u8]) -> Result<()> {
        let frame = match Frame::decode(bytes, self) {
            Ok(frame) => frame,
            Err(e) => return self.reject_frame(bytes, e).await,
        };

        match frame {
            Frame::Response { id, result } => {
                if !self.inner.pending.resolve(id, result) {
                    debug!(remote = %self.inner.remote.name, id, "discarding stale response");
                }
            }
            Frame::Request { id, method, args, reply } => {
                let connection = self.clone();
                tokio::spawn(async move {
                    connection.serve_request(id, method, args, reply).await;
                });
            }
            Frame::Invoke { id, callback, args } => {
                let connection = self.clone();
                tokio::spawn(async move {
                    connection.serve_invoke(id, callback, args).await;
                });
            }
            Frame::Hello { .. } | Frame::Welcome { .. } | Frame::Reject { .. } => {
                let message = format!("{} frame after handshake", frame.kind());
                return Err(duorpc::Error::ProtocolViolation(message).into());
            }
        }
        Ok(())
    }

    /// An undecodable frame. If it still names a call we answer it with a
    /// `Protocol` failure (unless the caller asked for no reply) and keep
    /// going; anything else ends the connection.
    async fn reject_frame(&self, bytes: &[u8], error: duorpc::Error) -> Result<()> {
        let Ok(header) = peek_header(bytes) else {
            return Err(error.into());
        };
        if header.kind != "Request" && header.kind != "Invoke" {
            return Err(error.into());
        }

        let id = header.id;
        if !header.reply {
            debug!(remote = %self.inner.remote.name, id, error = %error, "dropping undecodable fire-and-forget call");
            return Ok(());
        }
        debug!(remote = %self.inner.remote.name, id, error = %error, "answering undecodable {}", header.kind);
        let failure = Failure::new(FailureKind::Protocol, error.to_string());
        self.respond(id, Err(failure)).await;
        Ok(())
    }

    async fn serve_request(&self, id: u64, method: String, args: Value, reply: bool) {
        let result = match self.inner.dispatch.get(&method) {
            None => {
                debug!(remote = %self.inner.remote.name, id, method = %method, "method not found");
                Err(Failure::method_not_found(&method))
            }
            Some(handler) => {
                let request = Request::new(method.clone(), args, self.clone());
                match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e.to_failure()),
                    Err(panic) => {
                        warn!(remote = %self.inner.remote.name, id, method = %method, "handler panicked");
                        Err(Failure::handler(panic_message(&*panic)))
                    }
                }
            }
        };

        if !reply {
            if let Err(failure) = result {
                debug!(remote = %self.inner.remote.name, method = %method, %failure, "fire-and-forget call failed");
            }
            return;
        }
        self.respond(id, result).await;
    }

    async fn serve_invoke(&self, id: u64, callback: u64, args: Value) {
        let result = match self.inner.callbacks.get(callback) {
            None => {
                debug!(remote = %self.inner.remote.name, id, callback, "unknown callback");
                Err(Failure::invalid_callback(callback))
            }
            Some(function) => match AssertUnwindSafe(function.call(args)).catch_unwind().await {
                Ok(result) => result.map(|()| Value::Null),
                Err(panic) => {
                    warn!(remote = %self.inner.remote.name, id, callback, "callback panicked");
                    Err(Failure::handler(panic_message(&*panic)))
                }
            },
        };
        self.respond(id, result).await;
    }

    async fn respond(&self, id: u64, result: Reply) {
        let frame = Frame::Response { id, result };
        let encoded = match self.encode_frame(&frame) {
            Ok(encoded) => Ok(encoded),
            Err(e) => {
                // the result itself cannot be encoded, tell the caller why
                let failure = Failure::new(FailureKind::Protocol, e.to_string());
                Frame::Response { id, result: Err(failure) }
                    .encode(&NoCallbacks)
                    .map(|bytes| (bytes, Vec::new()))
                    .map_err(Error::from)
            }
        };

        let sent = match encoded {
            Ok((bytes, fresh)) => {
                let sent = self.inner.transport.send(&bytes).await.map_err(Error::from);
                if sent.is_err() {
                    self.unexport(&fresh);
                }
                sent
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(remote = %self.inner.remote.name, id, error = %e, "failed to send response");
        }
    }

    async fn teardown(&self, reason: &str) {
        if self.inner.closed.send_replace(true) {
            return;
        }

        self.inner.pending.close_all();
        self.inner.callbacks.clear();
        if let Err(e) = self.inner.transport.close().await {
            debug!(remote = %self.inner.remote.name, error = %e, "transport close failed");
        }

        info!(
            peer = %self.inner.local.name,
            remote = %self.inner.remote.name,
            connection = self.inner.id,
            reason,
            "connection closed"
        );
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
//  CALLBACK MARSHALING
// ============================================================================

/// Exports made while encoding one outbound frame.
struct FrameExports<'a> {
    callbacks: &'a CallbackRegistry,
    fresh: RefCell<Vec<u64>>,
}

impl CallbackSink for FrameExports<'_> {
    fn export(&self, function: &Function) -> duorpc::Result<u64> {
        let export = self.callbacks.register(function);
        if export.fresh {
            self.fresh.borrow_mut().push(export.id);
        }
        Ok(export.id)
    }
}

impl CallbackSource for Connection {
    fn import(&self, id: u64) -> duorpc::Result<Function> {
        Ok(Function::from_callable(RemoteCallback {
            id,
            connection: Arc::downgrade(&self.inner),
        }))
    }
}

/// A callback owned by the remote side. Invoking it sends an `Invoke` frame
/// back over the connection it arrived on, and only that one.
struct RemoteCallback {
    id: u64,
    connection: Weak<Inner>,
}

#[async_trait::async_trait]
impl Callable for RemoteCallback {
    async fn call(&self, args: Value) -> std::result::Result<(), Failure> {
        let Some(inner) = self.connection.upgrade() else {
            return Err(Failure::connection_closed());
        };
        let connection = Connection { inner };
        connection.invoke(self.id, args).await.map_err(|e| match e {
            Error::Remote(failure) => failure,
            other => other.to_failure(),
        })
    }

    fn remote_id(&self) -> Option<u64> {
        Some(self.id)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".to_string()
    }
}

// ============================================================================
//  HANDSHAKE
// ============================================================================

/// Dialing side: `Hello` out, `Welcome` or `Reject` back.
pub(crate) async fn dial_handshake(
    transport: &dyn Transport,
    local: &Identity,
    credential: Credential,
    timeout: Duration,
) -> Result<Identity> {
    let hello = Frame::Hello { identity: local.clone(), credential };
    let bytes = hello.encode(&NoCallbacks)?;
    transport
        .send(&bytes)
        .await
        .map_err(|e| Error::Dial(format!("failed to send hello: {}", e)))?;

    let reply = recv_handshake(transport, timeout).await?;
    match Frame::decode(&reply, &NoCallbacks) {
        Ok(Frame::Welcome { identity }) => Ok(identity),
        Ok(Frame::Reject { reason }) => Err(Error::Auth(reason)),
        Ok(other) => Err(Error::Dial(format!("unexpected {} frame during handshake", other.kind()))),
        Err(e) => Err(Error::Dial(format!("invalid handshake reply: {}", e))),
    }
}

/// Listening side: reads `Hello`, lets `authenticate` decide, answers.
pub(crate) async fn accept_handshake<F, Fut>(
    transport: &dyn Transport,
    local: &Identity,
    timeout: Duration,
    authenticate: F,
) -> Result<Identity>
where
    F: FnOnce(Identity, Credential) -> Fut,
    Fut: Future<Output = Result<Identity>>,
{
    let hello = recv_handshake(transport, timeout).await?;
    let (remote, credential) = match Frame::decode(&hello, &NoCallbacks) {
        Ok(Frame::Hello { identity, credential }) => (identity, credential),
        Ok(other) => return Err(Error::Dial(format!("expected hello, got {}", other.kind()))),
        Err(e) => return Err(Error::Dial(format!("invalid hello: {}", e))),
    };

    match authenticate(remote, credential).await {
        Ok(remote) => {
            let welcome = Frame::Welcome { identity: local.clone() }.encode(&NoCallbacks)?;
            transport.send(&welcome).await?;
            Ok(remote)
        }
        Err(e) => {
            let reason = match &e {
                Error::Auth(reason) => reason.clone(),
                other => other.to_string(),
            };
            let reject = Frame::Reject { reason: reason.clone() }.encode(&NoCallbacks)?;
            if let Err(send_err) = transport.send(&reject).await {
                debug!(error = %send_err, "failed to send reject");
            }
            Err(Error::Auth(reason))
        }
    }
}

async fn recv_handshake(transport: &dyn Transport, timeout: Duration) -> Result<Vec<u8>> {
    match tokio::time::timeout(timeout, transport.recv()).await {
        Ok(Ok(Some(bytes))) => Ok(bytes),
        Ok(Ok(None)) => Err(Error::Dial("connection closed during handshake".into())),
        Ok(Err(e)) => Err(Error::Dial(format!("transport error during handshake: {}", e))),
        Err(_) => Err(Error::Dial("handshake timed out".into())),
    }
}
