//! Tests for peers and connections over in-memory transports.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use duopack::Encoder;
use duorpc::Frame;
use duorpc::NoCallbacks;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::*;
use crate::mock_transport::DuplexChannelTransport;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connects `client` to `server` and returns both ends: (outbound, inbound).
async fn link(client: &Peer, server: &Peer) -> (Connection, Connection) {
    let (outbound, inbound) = try_link(client, server, server.credential()).await;
    (outbound.expect("connect"), inbound.expect("serve"))
}

async fn try_link(client: &Peer, server: &Peer, credential: Credential) -> (Result<Connection>, Result<Connection>) {
    init_tracing();
    let (a, b) = DuplexChannelTransport::pair();
    let accepting = server.clone();
    let accept = tokio::spawn(async move { accepting.serve(b).await });
    let outbound = client.connect(a, credential).await;
    let inbound = accept.await.expect("serve task panicked");
    (outbound, inbound)
}

fn mathworker() -> Peer {
    let peer = Peer::new(Config::new("mathworker"));
    peer.handle_func("square", |request| async move {
        let n = request.args().as_f64()?;
        Ok(Value::from(n * n))
    });
    peer
}

fn client() -> Peer {
    Peer::new(Config::new("client"))
}

fn remote_failure(err: Error) -> Failure {
    match err {
        Error::Remote(failure) => failure,
        other => panic!("expected remote failure, got {:?}", other),
    }
}

// ============================================================================
//  CALLS
// ============================================================================

#[tokio::test]
async fn test_call_returns_result() {
    let server = mathworker();
    let (conn, _inbound) = link(&client(), &server).await;

    assert_eq!(conn.call("square", 2).await.unwrap(), Value::from(4.0));
    assert_eq!(conn.pending_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_calls_are_matched_by_id() {
    let server = mathworker();
    let (conn, _inbound) = link(&client(), &server).await;

    let calls: Vec<_> = (0..20)
        .map(|n| {
            let conn = conn.clone();
            tokio::spawn(async move { (n, conn.call("square", n).await) })
        })
        .collect();

    for call in calls {
        let (n, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), Value::from((n * n) as f64));
    }
}

#[tokio::test]
async fn test_handshake_exchanges_identities() {
    let server = mathworker();
    let client = client();
    let (outbound, inbound) = link(&client, &server).await;

    assert_eq!(outbound.remote(), server.identity());
    assert_eq!(inbound.remote(), client.identity());
    assert_ne!(server.identity().instance_id, client.identity().instance_id);
    assert_eq!(server.identity().region, "localhost");
    assert_eq!(server.identity().environment, "development");
}

#[tokio::test]
async fn test_builtin_ping() {
    let server = mathworker();
    let (conn, _inbound) = link(&client(), &server).await;

    assert_eq!(conn.call(PING_METHOD, ()).await.unwrap(), Value::from("pong"));
    assert_eq!(server.methods(), vec![PING_METHOD.to_string(), "square".to_string()]);
}

#[tokio::test]
async fn test_method_not_found_is_not_a_timeout() {
    let server = mathworker();
    let (conn, _inbound) = link(&client(), &server).await;

    let started = Instant::now();
    let err = conn.call("nope", ()).await.unwrap_err();
    assert_eq!(err, Error::MethodNotFound("nope".into()));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_argument_type_mismatch() {
    let server = mathworker();
    let (conn, _inbound) = link(&client(), &server).await;

    let failure = remote_failure(conn.call("square", "two").await.unwrap_err());
    assert_eq!(failure.kind, FailureKind::ArgumentType);
    assert!(failure.message.contains("expected number, found string"));
}

#[tokio::test]
async fn test_handler_error_becomes_failure() {
    let server = mathworker();
    server.handle_func("fail", |_request| async { Err(Error::Handler("boom".into())) });
    let (conn, _inbound) = link(&client(), &server).await;

    let failure = remote_failure(conn.call("fail", ()).await.unwrap_err());
    assert_eq!(failure, Failure::handler("boom"));
}

#[tokio::test]
async fn test_handler_panic_does_not_kill_connection() {
    let server = mathworker();
    server.handle_func("explode", |request| async move {
        if request.method() == "explode" {
            panic!("kaboom");
        }
        Ok(Value::Null)
    });
    let (conn, _inbound) = link(&client(), &server).await;

    let failure = remote_failure(conn.call("explode", ()).await.unwrap_err());
    assert_eq!(failure.kind, FailureKind::Handler);
    assert!(failure.message.contains("kaboom"));

    assert_eq!(conn.call("square", 5).await.unwrap(), Value::from(25.0));
}

#[tokio::test]
async fn test_reregistration_overwrites() {
    let server = mathworker();
    server.handle_func("version", |_request| async { Ok(Value::from(1)) });
    server.handle_func("version", |_request| async { Ok(Value::from(2)) });
    let (conn, _inbound) = link(&client(), &server).await;

    assert_eq!(conn.call("version", ()).await.unwrap(), Value::from(2));
}

// ============================================================================
//  TIMEOUTS
// ============================================================================

fn slow_server() -> Peer {
    let server = mathworker();
    server.handle_func("slow", |_request| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Value::from("late"))
    });
    server
}

#[tokio::test]
async fn test_timeout_removes_entry_and_discards_late_response() {
    let server = slow_server();
    let (conn, _inbound) = link(&client(), &server).await;

    let err = conn.call_with_timeout("slow", (), Duration::from_millis(20)).await.unwrap_err();
    assert_eq!(err, Error::Timeout);
    assert_eq!(conn.pending_calls(), 0);

    // the late response arrives and is dropped without disturbing the connection
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!conn.is_closed());
    assert_eq!(conn.call("square", 3).await.unwrap(), Value::from(9.0));
}

#[tokio::test]
async fn test_configured_call_timeout() {
    let server = slow_server();
    let client = Peer::new(Config::new("client").with_call_timeout(Duration::from_millis(20)));
    let (conn, _inbound) = link(&client, &server).await;

    assert_eq!(conn.call("slow", ()).await, Err(Error::Timeout));
}

/// Passes frames through until `stalled` is set, then never finishes a send.
struct StallingTransport {
    inner: DuplexChannelTransport,
    stalled: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Transport for StallingTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.send(payload).await
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        self.inner.recv().await
    }

    async fn close(&self) -> transport::Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_stalled_send_still_times_out() {
    init_tracing();
    let server = mathworker();
    let (a, b) = DuplexChannelTransport::pair();
    let accepting = server.clone();
    let accept = tokio::spawn(async move { accepting.serve(b).await });

    let stalled = Arc::new(AtomicBool::new(false));
    let transport = StallingTransport { inner: a, stalled: stalled.clone() };
    let conn = client().connect(transport, server.credential()).await.unwrap();
    let _inbound = accept.await.unwrap().unwrap();

    stalled.store(true, Ordering::SeqCst);
    let started = Instant::now();
    let result = timeout(Duration::from_secs(2), conn.call_with_timeout(PING_METHOD, (), Duration::from_millis(50)))
        .await
        .expect("call outlived its deadline");
    assert_eq!(result, Err(Error::Timeout));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(conn.pending_calls(), 0);

    // a half-sent frame leaves the stream unusable
    timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
}

// ============================================================================
//  FIRE-AND-FORGET AND DUPLEX
// ============================================================================

#[tokio::test]
async fn test_go_delivers_without_response() {
    let server = mathworker();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.handle_func("foo", move |request| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(request.args().as_str()?.to_string());
            Ok(Value::Null)
        }
    });
    let (conn, _inbound) = link(&client(), &server).await;

    conn.go("foo", "bar").await.unwrap();
    let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(got.as_deref(), Some("bar"));
    assert_eq!(conn.pending_calls(), 0);

    // failures of fire-and-forget calls are unobservable
    conn.go("nope", ()).await.unwrap();
    assert_eq!(conn.call("square", 2).await.unwrap(), Value::from(4.0));
}

#[tokio::test]
async fn test_handler_calls_back_into_caller() {
    let server = mathworker();
    server.handle_func("ask_back", |request| async move {
        let answer = request.connection().call("whoami", ()).await?;
        Ok(answer)
    });

    let client = client();
    client.handle_func("whoami", |request| async move {
        Ok(Value::from(request.connection().local().name.clone()))
    });

    let (conn, _inbound) = link(&client, &server).await;
    let answer = timeout(Duration::from_secs(1), conn.call("ask_back", ())).await.unwrap();
    assert_eq!(answer.unwrap(), Value::from("client"));
}

#[tokio::test]
async fn test_request_exposes_remote_identity() {
    let server = mathworker();
    server.handle_func("who", |request| async move {
        Ok(Value::from(format!("{} via {}", request.remote().name, request.method())))
    });
    let (conn, _inbound) = link(&client(), &server).await;

    assert_eq!(conn.call("who", ()).await.unwrap(), Value::from("client via who"));
}

// ============================================================================
//  CALLBACKS
// ============================================================================

fn recording_callback() -> (Function, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = Function::new(move |args: Value| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(args);
        }
    });
    (callback, rx)
}

fn callback_server() -> Peer {
    let server = mathworker();
    server.handle_func("square2", |request| async move {
        let n = request.args().at(0)?.as_f64()?;
        let callback = request.args().at(1)?.as_function()?.clone();
        callback.call(n * n).await?;
        Ok(Value::Null)
    });
    server.handle_func("twice", |request| async move {
        let callback = request.args().as_function()?;
        callback.call("first").await?;
        callback.call("second").await?;
        Ok(Value::Null)
    });
    server
}

#[tokio::test]
async fn test_callback_invoked_exactly_once() {
    let server = callback_server();
    let (conn, _inbound) = link(&client(), &server).await;
    let (callback, mut observed) = recording_callback();

    conn.call("square2", vec![Value::from(3), Value::from(callback)]).await.unwrap();

    assert_eq!(observed.recv().await, Some(Value::from(9.0)));
    assert!(observed.try_recv().is_err());
}

#[tokio::test]
async fn test_callbacks_are_reusable() {
    let server = callback_server();
    let (conn, _inbound) = link(&client(), &server).await;
    let (callback, mut observed) = recording_callback();

    conn.call("twice", callback).await.unwrap();

    assert_eq!(observed.recv().await, Some(Value::from("first")));
    assert_eq!(observed.recv().await, Some(Value::from("second")));
    assert_eq!(conn.exported_callbacks(), 1);
}

fn keeping_server() -> (Peer, Arc<Mutex<Option<Function>>>) {
    let server = mathworker();
    let kept = Arc::new(Mutex::new(None));
    let slot = kept.clone();
    server.handle_func("keep", move |request| {
        let slot = slot.clone();
        async move {
            let callback = request.args().as_function()?.clone();
            *slot.lock().unwrap() = Some(callback);
            Ok(Value::Null)
        }
    });
    (server, kept)
}

#[tokio::test]
async fn test_released_callback_is_invalid() {
    let (server, kept) = keeping_server();
    let (conn, _inbound) = link(&client(), &server).await;
    let (callback, _observed) = recording_callback();

    conn.call("keep", callback.clone()).await.unwrap();
    assert_eq!(conn.exported_callbacks(), 1);
    let id = conn.callback_id(&callback).unwrap();
    assert!(conn.release_callback(id));
    assert!(!conn.release_callback(id));
    assert_eq!(conn.callback_id(&callback), None);

    let stale = kept.lock().unwrap().take().unwrap();
    assert_eq!(stale.remote_id(), Some(id));
    let failure = stale.call(1).await.unwrap_err();
    assert_eq!(failure, Failure::invalid_callback(id));
}

#[tokio::test]
async fn test_resent_function_keeps_one_id() {
    let server = mathworker();
    server.handle_func("ignore", |_request| async { Ok(Value::Null) });
    let (conn, _inbound) = link(&client(), &server).await;
    let (callback, _observed) = recording_callback();

    for _ in 0..100 {
        conn.call("ignore", callback.clone()).await.unwrap();
    }
    assert_eq!(conn.exported_callbacks(), 1);

    assert!(conn.release_function(&callback));
    assert_eq!(conn.exported_callbacks(), 0);
    assert!(!conn.release_function(&callback));

    // sent again after release, it comes back under a new id
    conn.call("ignore", callback.clone()).await.unwrap();
    assert_eq!(conn.exported_callbacks(), 1);
    assert!(conn.callback_id(&callback).unwrap() > 1);
}

#[tokio::test]
async fn test_unencodable_call_exports_nothing() {
    let server = mathworker();
    let (conn, _inbound) = link(&client(), &server).await;
    let (callback, _observed) = recording_callback();

    let mut deep = Value::Null;
    for _ in 0..100 {
        deep = Value::List(vec![deep]);
    }
    let err = conn.call("square", vec![Value::from(callback.clone()), deep]).await.unwrap_err();
    assert!(matches!(err, Error::Codec(_)), "got {:?}", err);
    assert_eq!(conn.exported_callbacks(), 0);
    assert_eq!(conn.callback_id(&callback), None);
    assert_eq!(conn.pending_calls(), 0);
}

#[test]
fn test_registry_ids_follow_the_function() {
    let registry = crate::callbacks::CallbackRegistry::new();
    let (first, _rx) = recording_callback();
    let (second, _rx2) = recording_callback();

    let a = registry.register(&first);
    assert!(a.fresh);
    let again = registry.register(&first.clone());
    assert_eq!(again.id, a.id);
    assert!(!again.fresh);

    let b = registry.register(&second);
    assert_ne!(b.id, a.id);
    assert_eq!(registry.len(), 2);

    assert!(registry.release(a.id));
    assert_eq!(registry.id_of(&first), None);
    assert_eq!(registry.id_of(&second), Some(b.id));

    registry.clear();
    assert_eq!(registry.len(), 0);
    assert_eq!(registry.id_of(&second), None);
}

#[tokio::test]
async fn test_callback_panic_is_reported() {
    let server = callback_server();
    let (conn, _inbound) = link(&client(), &server).await;
    let callback = Function::new(|args: Value| async move {
        if args.is_null() {
            return;
        }
        panic!("callback blew up");
    });

    let failure = remote_failure(conn.call("square2", vec![Value::from(3), Value::from(callback)]).await.unwrap_err());
    assert_eq!(failure.kind, FailureKind::Handler);
    assert!(!conn.is_closed());
}

// ============================================================================
//  TEARDOWN
// ============================================================================

#[tokio::test]
async fn test_pending_call_fails_when_connection_drops() {
    let server = mathworker();
    server.handle_func("hang", |_request| async {
        std::future::pending::<()>().await;
        Ok(Value::Null)
    });
    let (conn, inbound) = link(&client(), &server).await;

    let caller = conn.clone();
    let call = tokio::spawn(async move { caller.call("hang", ()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.pending_calls(), 1);

    inbound.close().await;

    let result = timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
    assert_eq!(result, Err(Error::ConnectionClosed));
    timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
    assert_eq!(conn.pending_calls(), 0);
    assert_eq!(conn.call("square", 2).await, Err(Error::ConnectionClosed));
    assert_eq!(conn.go("square", 2).await, Err(Error::ConnectionClosed));
}

#[tokio::test]
async fn test_teardown_invalidates_callbacks() {
    let (server, kept) = keeping_server();
    let (conn, inbound) = link(&client(), &server).await;
    let (callback, _observed) = recording_callback();

    conn.call("keep", callback).await.unwrap();
    conn.close().await;
    assert_eq!(conn.exported_callbacks(), 0);
    timeout(Duration::from_secs(1), inbound.closed()).await.unwrap();

    let stale = kept.lock().unwrap().take().unwrap();
    let failure = stale.call(()).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::ConnectionClosed);
}

#[tokio::test]
async fn test_connect_and_disconnect_hooks() {
    let server = mathworker();
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    server.on_connect(move |_conn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = disconnects.clone();
    server.on_disconnect(move |_conn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (conn, _inbound) = link(&client(), &server).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(server.connections().len(), 1);

    conn.close().await;
    timeout(Duration::from_secs(1), async {
        while disconnects.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(server.connections().is_empty());
}

#[tokio::test]
async fn test_closed_peer_accepts_no_connections() {
    let server = mathworker();
    server.close().await;
    assert!(server.is_closed());

    let (outbound, inbound) = try_link(&client(), &server, server.credential()).await;
    assert_eq!(inbound.unwrap_err(), Error::ConnectionClosed);
    assert!(server.connections().is_empty());

    // the dialer was welcomed before the close was noticed, then hung up on
    let conn = outbound.unwrap();
    timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
}

// ============================================================================
//  HANDSHAKE AND AUTHENTICATION
// ============================================================================

#[tokio::test]
async fn test_wrong_shared_key_is_rejected() {
    let server = mathworker();
    let (outbound, inbound) = try_link(&client(), &server, Credential::new(SHARED_KEY_SCHEME, "wrong")).await;

    assert_eq!(outbound.unwrap_err(), Error::Auth("invalid shared key".into()));
    assert_eq!(inbound.unwrap_err(), Error::Auth("invalid shared key".into()));
    assert!(server.connections().is_empty());
}

#[tokio::test]
async fn test_unknown_scheme_fails_closed() {
    let server = mathworker();
    let (outbound, _) = try_link(&client(), &server, Credential::new("kerberos", "ticket")).await;

    assert_eq!(outbound.unwrap_err(), Error::Auth("unknown scheme 'kerberos'".into()));
}

struct AllowList(Vec<String>);

#[async_trait::async_trait]
impl Authenticator for AllowList {
    async fn authenticate(&self, remote: &Identity, _credential: &Credential) -> Result<()> {
        if self.0.contains(&remote.name) {
            Ok(())
        } else {
            Err(Error::Auth(format!("{} is not allowed", remote.name)))
        }
    }
}

#[tokio::test]
async fn test_custom_authenticator() {
    let server = mathworker();
    server.add_authenticator("allowlist", AllowList(vec!["client".into()]));
    let credential = Credential::new("allowlist", "");

    let (outbound, _) = try_link(&client(), &server, credential.clone()).await;
    assert!(outbound.is_ok());

    let intruder = Peer::new(Config::new("intruder"));
    let (outbound, _) = try_link(&intruder, &server, credential).await;
    assert_eq!(outbound.unwrap_err(), Error::Auth("intruder is not allowed".into()));
}

#[tokio::test]
async fn test_handshake_timeout() {
    let client = Peer::new(Config::new("client").with_handshake_timeout(Duration::from_millis(50)));
    let (a, _silent) = DuplexChannelTransport::pair();

    let err = client.connect(a, Credential::new(SHARED_KEY_SCHEME, "key")).await.unwrap_err();
    assert_eq!(err, Error::Dial("handshake timed out".into()));
}

#[tokio::test]
async fn test_remote_hangs_up_during_handshake() {
    let client = client();
    let (a, b) = DuplexChannelTransport::pair();
    drop(b);

    let err = client.connect(a, Credential::new(SHARED_KEY_SCHEME, "key")).await.unwrap_err();
    assert!(matches!(err, Error::Dial(_)), "got {:?}", err);
}

// ============================================================================
//  PROTOCOL VIOLATIONS
// ============================================================================

/// Handshakes by hand so the test can write arbitrary bytes afterwards.
async fn raw_link(server: &Peer) -> (DuplexChannelTransport, Connection) {
    init_tracing();
    let (raw, b) = DuplexChannelTransport::pair();
    let accepting = server.clone();
    let accept = tokio::spawn(async move { accepting.serve(b).await });

    let hello = Frame::Hello {
        identity: Identity { name: "raw".into(), ..Identity::default() },
        credential: server.credential(),
    };
    raw.send(&hello.encode(&NoCallbacks).unwrap()).await.unwrap();
    let welcome = Frame::decode(&raw.recv().await.unwrap().unwrap(), &NoCallbacks).unwrap();
    assert!(matches!(welcome, Frame::Welcome { .. }));

    (raw, accept.await.unwrap().unwrap())
}

#[tokio::test]
async fn test_undecodable_request_is_answered() {
    let server = mathworker();
    let (raw, inbound) = raw_link(&server).await;

    // a request whose args hold a tag that is not a value
    let mut enc = Encoder::new();
    enc.variant_begin("Request").unwrap();
    enc.map_begin().unwrap();
    enc.variant_begin("id").unwrap();
    enc.u64(5).unwrap();
    enc.variant_end().unwrap();
    enc.variant_begin("method").unwrap();
    enc.str("square").unwrap();
    enc.variant_end().unwrap();
    enc.variant_begin("args").unwrap();
    enc.u64(2).unwrap();
    enc.variant_end().unwrap();
    enc.map_end().unwrap();
    enc.variant_end().unwrap();
    raw.send(&enc.into_bytes().unwrap()).await.unwrap();

    let reply = Frame::decode(&raw.recv().await.unwrap().unwrap(), &NoCallbacks).unwrap();
    match reply {
        Frame::Response { id, result: Err(failure) } => {
            assert_eq!(id, 5);
            assert_eq!(failure.kind, FailureKind::Protocol);
        }
        other => panic!("expected protocol failure, got {:?}", other),
    }
    assert!(!inbound.is_closed());
}

#[tokio::test]
async fn test_undecodable_go_gets_no_reply() {
    let server = mathworker();
    let (raw, inbound) = raw_link(&server).await;

    let mut enc = Encoder::new();
    enc.variant_begin("Request").unwrap();
    enc.map_begin().unwrap();
    enc.variant_begin("id").unwrap();
    enc.u64(7).unwrap();
    enc.variant_end().unwrap();
    enc.variant_begin("method").unwrap();
    enc.str("square").unwrap();
    enc.variant_end().unwrap();
    enc.variant_begin("reply").unwrap();
    enc.bool(false).unwrap();
    enc.variant_end().unwrap();
    enc.variant_begin("args").unwrap();
    enc.u64(2).unwrap();
    enc.variant_end().unwrap();
    enc.map_end().unwrap();
    enc.variant_end().unwrap();
    raw.send(&enc.into_bytes().unwrap()).await.unwrap();

    let ping = Frame::Request { id: 8, method: PING_METHOD.into(), args: Value::Null, reply: true };
    raw.send(&ping.encode(&NoCallbacks).unwrap()).await.unwrap();

    // the first thing back answers the ping, nothing answers the dropped call
    let reply = Frame::decode(&raw.recv().await.unwrap().unwrap(), &NoCallbacks).unwrap();
    assert_eq!(reply, Frame::Response { id: 8, result: Ok(Value::from("pong")) });
    assert!(timeout(Duration::from_millis(50), raw.recv()).await.is_err());
    assert!(!inbound.is_closed());
}

#[tokio::test]
async fn test_garbage_tears_connection_down() {
    let server = mathworker();
    let (raw, inbound) = raw_link(&server).await;

    raw.send(&[0xFF, 0x00, 0x01]).await.unwrap();

    timeout(Duration::from_secs(1), inbound.closed()).await.unwrap();
    assert_eq!(raw.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_second_hello_tears_connection_down() {
    let server = mathworker();
    let (raw, inbound) = raw_link(&server).await;

    let hello = Frame::Hello {
        identity: Identity { name: "raw".into(), ..Identity::default() },
        credential: server.credential(),
    };
    raw.send(&hello.encode(&NoCallbacks).unwrap()).await.unwrap();

    timeout(Duration::from_secs(1), inbound.closed()).await.unwrap();
}

// ============================================================================
//  ERRORS
// ============================================================================

#[test]
fn test_error_to_failure_kinds() {
    let type_error = TypeError { expected: Kind::Number, actual: Kind::String };
    assert_eq!(Error::from(type_error).to_failure().kind, FailureKind::ArgumentType);
    assert_eq!(Error::InvalidCallback(4).to_failure(), Failure::invalid_callback(4));
    assert_eq!(Error::Timeout.to_failure().kind, FailureKind::Timeout);
    assert_eq!(Error::ConnectionClosed.to_failure().kind, FailureKind::ConnectionClosed);

    // a nested call's missing method is the handler's problem, not the caller's
    assert_eq!(Error::MethodNotFound("inner".into()).to_failure().kind, FailureKind::Handler);
}

#[test]
fn test_failure_into_error() {
    assert_eq!(Error::from(Failure::connection_closed()), Error::ConnectionClosed);
    let failure = Failure::handler("boom");
    assert_eq!(Error::from(failure.clone()), Error::Remote(failure));
}

#[test]
fn test_config_defaults() {
    let config = Config::new("mathworker");
    assert_eq!(config.version, "0.1.0");
    assert_eq!(config.port, 0);
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.shared_key.len(), 32);
    assert_eq!(config.call_timeout, Duration::from_secs(30));
    assert_ne!(config.shared_key, Config::new("mathworker").shared_key);
    assert!(!format!("{:?}", config).contains(&config.shared_key));
}
