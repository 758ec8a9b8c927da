//! End-to-end scenarios between peers over TCP loopback.

use std::time::Duration;

use duorun::Config;
use duorun::Credential;
use duorun::Descriptor;
use duorun::Error;
use duorun::Function;
use duorun::Identity;
use duorun::PING_METHOD;
use duorun::Peer;
use duorun::SHARED_KEY_SCHEME;
use duorun::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A worker exposing `square(n)` and `square2([n, callback])`.
///
/// `square` also fires `foo("bar")` back at its caller before answering.
fn mathworker() -> Peer {
    let worker = Peer::new(Config::new("mathworker"));

    worker.handle_func("square", |request| async move {
        let n = request.args().as_f64()?;
        request.connection().go("foo", "bar").await?;
        Ok(Value::from(n * n))
    });

    worker.handle_func("square2", |request| async move {
        let n = request.args().at(0)?.as_f64()?;
        let callback = request.args().at(1)?.as_function()?.clone();
        callback.call(n * n).await?;
        Ok(Value::Null)
    });

    worker
}

#[tokio::test]
async fn test_square_with_reverse_go() -> anyhow::Result<()> {
    init_tracing();
    let worker = mathworker();
    let addr = worker.listen().await?;

    let exp2 = Peer::new(Config::new("exp2"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    exp2.handle_func("foo", move |request| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(request.args().as_str()?.to_string());
            Ok(Value::Null)
        }
    });

    let conn = exp2.dial(&addr.to_string(), worker.credential()).await?;
    let result = conn.call("square", 2).await?;
    assert_eq!(result.as_f64()?, 4.0);

    let observed = timeout(Duration::from_millis(100), rx.recv()).await?;
    assert_eq!(observed.as_deref(), Some("bar"));
    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err(), "foo observed twice");

    worker.close().await;
    Ok(())
}

#[tokio::test]
async fn test_square2_invokes_callback_once() -> anyhow::Result<()> {
    init_tracing();
    let worker = mathworker();
    let addr = worker.listen().await?;

    let exp2 = Peer::new(Config::new("exp2"));
    let conn = exp2.dial(&addr.to_string(), worker.credential()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = Function::new(move |args: Value| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(args);
        }
    });

    conn.call("square2", vec![Value::from(3), Value::from(callback)]).await?;

    let observed = timeout(Duration::from_secs(1), rx.recv()).await?;
    assert_eq!(observed, Some(Value::from(9.0)));
    assert!(rx.try_recv().is_err());

    worker.close().await;
    Ok(())
}

#[tokio::test]
async fn test_ping_and_connection_listing() -> anyhow::Result<()> {
    init_tracing();
    let worker = mathworker();
    let addr = worker.listen().await?;

    let client = Peer::new(Config::new("client"));
    let conn = client.dial(&addr.to_string(), worker.credential()).await?;

    assert_eq!(conn.call(PING_METHOD, ()).await?, Value::from("pong"));
    assert_eq!(client.connections().len(), 1);
    assert_eq!(worker.connections().len(), 1);
    assert_eq!(worker.connections()[0].remote().name, "client");

    worker.close().await;
    timeout(Duration::from_secs(1), conn.closed()).await?;
    assert_eq!(conn.call(PING_METHOD, ()).await, Err(Error::ConnectionClosed));
    Ok(())
}

#[tokio::test]
async fn test_dial_peer_checks_identity() -> anyhow::Result<()> {
    init_tracing();
    let worker = mathworker();
    worker.listen().await?;
    let descriptor = worker.descriptor().expect("listening peer has a descriptor");

    let client = Peer::new(Config::new("client"));
    let conn = client.dial_peer(&descriptor, worker.credential()).await?;
    assert_eq!(conn.remote(), worker.identity());

    let impostor = Descriptor {
        identity: Identity { name: "kontrol".into(), ..worker.identity().clone() },
        addr: descriptor.addr,
    };
    let err = client.dial_peer(&impostor, worker.credential()).await.unwrap_err();
    assert!(matches!(err, Error::Dial(_)), "got {:?}", err);

    worker.close().await;
    Ok(())
}

#[tokio::test]
async fn test_dial_failures() -> anyhow::Result<()> {
    init_tracing();
    let worker = mathworker();
    let addr = worker.listen().await?;
    let client = Peer::new(Config::new("client"));

    let err = client.dial(&addr.to_string(), Credential::new(SHARED_KEY_SCHEME, "nope")).await.unwrap_err();
    assert_eq!(err, Error::Auth("invalid shared key".into()));

    // a port nobody listens on
    let vacant = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let err = client.dial(&vacant.to_string(), worker.credential()).await.unwrap_err();
    assert!(matches!(err, Error::Dial(_)), "got {:?}", err);

    worker.close().await;
    Ok(())
}

#[tokio::test]
async fn test_same_host_peers_share_a_key() -> anyhow::Result<()> {
    init_tracing();
    let key = "same-host-secret";
    let worker = Peer::new(Config::new("mathworker").with_shared_key(key));
    let addr = worker.listen().await?;

    let client = Peer::new(Config::new("client").with_shared_key(key));
    let conn = client.dial(&addr.to_string(), client.credential()).await?;
    assert_eq!(conn.call(PING_METHOD, ()).await?, Value::from("pong"));

    worker.close().await;
    Ok(())
}
