//! End-to-end scenarios over a real localhost link
//!
//! Each test stands up a broker and a communicator with their own tempdir
//! snapshots and drives the full path: framed TCP, the authentication
//! handshake, pending replay, failure capture, and retries.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventline_core::{control, wire, Envelope, Environment, EventlineConfig, StorageConfig};
use eventline_runtime::transport::framed;
use eventline_runtime::{Broker, Communicator, LinkState};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn config(dir: &Path, port: u16, secret: &str) -> Arc<EventlineConfig> {
    Arc::new(EventlineConfig {
        secret_key: secret.into(),
        host: "127.0.0.1".into(),
        port,
        keep_alive: true,
        log_args: false,
        name: Some("e2e".into()),
        environment: Environment::Development,
        storage: StorageConfig {
            pending_path: dir.join("pending.json"),
            failed_path: dir.join("failed.json"),
        },
    })
}

/// Pick a currently free port
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Poll a condition until it holds or the deadline passes
async fn wait_until(what: &str, deadline: Duration, mut check: impl FnMut() -> bool) {
    let step = Duration::from_millis(25);
    let mut waited = Duration::ZERO;
    while !check() {
        assert!(waited < deadline, "timed out waiting for {what}");
        tokio::time::sleep(step).await;
        waited += step;
    }
}

#[tokio::test]
async fn offline_emit_is_replayed_and_acknowledged() {
    eventline_runtime::telemetry::init();

    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let config = config(dir.path(), port, "hunter2");

    // Emit while nothing is listening: the event must land in the pending
    // queue, durably.
    let communicator = Communicator::open(Arc::clone(&config)).unwrap();
    let id = communicator.emit("hello", vec![json!(42)]).unwrap();
    assert_eq!(communicator.pending_events().len(), 1);
    communicator.pending_events().save_now().unwrap();

    // Bring the broker up with a handler that records what it sees.
    let received: Arc<Mutex<Vec<Vec<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let broker = Broker::open(Arc::clone(&config)).unwrap();
    broker.on_fn("hello", move |_ctx, args| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(args);
            Ok(())
        }
    });
    broker.start_listening().await.unwrap();

    // Connect: auth, replay, success, acknowledgement.
    communicator.connect();
    let mut state = communicator.state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state.borrow_and_update() != LinkState::Connected {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("communicator never authorized");

    wait_until("the pending queue to drain", Duration::from_secs(5), || {
        communicator.pending_events().is_empty()
    })
    .await;

    let seen = received.lock().unwrap().clone();
    assert_eq!(seen, vec![vec![json!(42)]]);
    assert!(communicator.pending_events().get(&id).is_none());

    // The acknowledgement was persisted instantly, not debounced.
    let snapshot = eventline_core::PendingStore::load_snapshot(&config.storage.pending_path).unwrap();
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn handler_failure_is_captured_and_forced_retry_clears_it() {
    eventline_runtime::telemetry::init();

    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let config = config(dir.path(), port, "hunter2");

    let failing = Arc::new(AtomicBool::new(true));
    let gate = Arc::clone(&failing);

    let broker = Broker::open(Arc::clone(&config)).unwrap();
    broker.on_fn("ship", move |_ctx, _args| {
        let gate = Arc::clone(&gate);
        async move {
            if gate.load(Ordering::SeqCst) {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    });
    broker.start_listening().await.unwrap();

    let communicator = Communicator::open(Arc::clone(&config)).unwrap();
    communicator.connect();
    let mut state = communicator.state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state.borrow_and_update() != LinkState::Connected {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("communicator never authorized");

    assert!(communicator.emit("ship", vec![json!("x")]).is_none());

    let failed = broker.failed_events().clone();
    wait_until("the failure to be recorded", Duration::from_secs(5), || {
        failed.len() == 1
    })
    .await;

    let record = failed.list_failed().into_values().next().unwrap();
    assert_eq!(record.event, "ship");
    assert_eq!(record.args, vec![json!("x")]);
    assert_eq!(record.last_error.message, "boom");
    assert!(record.retries.is_empty());

    // Let the handler succeed and force a retry; the staggered re-invoke
    // runs about a second later.
    failing.store(false, Ordering::SeqCst);
    communicator.retry_failed_events();

    wait_until("the failed queue to drain", Duration::from_secs(5), || {
        failed.is_empty()
    })
    .await;
}

#[tokio::test]
async fn wrong_secret_is_never_authorized_and_never_dispatched() {
    eventline_runtime::telemetry::init();

    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let broker_config = config(dir.path(), port, "right-secret");

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);

    let broker = Broker::open(Arc::clone(&broker_config)).unwrap();
    broker.on_fn("hello", move |_ctx, _args| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let addr = broker.start_listening().await.unwrap();

    // Speak the protocol directly with a bad digest, then try to dispatch.
    let stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.peer_addr().unwrap();
    let (mut frames, handle) = framed(stream, peer);

    handle.emit(
        control::AUTHORIZE,
        vec![json!({"secretKeyHash": "not-the-digest"})],
    );
    handle.emit("hello", vec![json!(1)]);

    let answer = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("broker said nothing")
        .expect("connection closed");
    assert_eq!(answer.event, control::ERROR);
    assert_eq!(
        answer.first_arg_str(),
        Some("Authorization Failed, Invalid SECRET_KEY!")
    );

    // No confirmation follows and the handler never runs.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    // A communicator configured with the wrong secret stalls in
    // Authenticating rather than reaching Connected.
    let wrong_dir = tempfile::tempdir().unwrap();
    let communicator =
        Communicator::open(config(wrong_dir.path(), port, "wrong-secret")).unwrap();
    communicator.connect();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!communicator.is_connected());
}

#[tokio::test]
async fn push_buffers_while_connected_and_control_replays_it() {
    eventline_runtime::telemetry::init();

    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let config = config(dir.path(), port, "hunter2");

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);

    let broker = Broker::open(Arc::clone(&config)).unwrap();
    broker.on_fn("audit", move |_ctx, _args| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    broker.start_listening().await.unwrap();

    let communicator = Communicator::open(Arc::clone(&config)).unwrap();
    communicator.connect();
    wait_until("authorization", Duration::from_secs(5), || {
        communicator.is_connected()
    })
    .await;

    // push persists even while connected.
    communicator.push("audit", vec![json!("trail")]);
    assert_eq!(communicator.pending_events().len(), 1);
    communicator.pending_events().save_now().unwrap();

    communicator.run_pending_events();

    wait_until("the pushed event to replay", Duration::from_secs(5), || {
        invocations.load(Ordering::SeqCst) == 1 && communicator.pending_events().is_empty()
    })
    .await;
}

#[tokio::test]
async fn malformed_frames_do_not_break_an_authorized_link() {
    eventline_runtime::telemetry::init();

    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let config = config(dir.path(), port, "hunter2");

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);

    let broker = Broker::open(Arc::clone(&config)).unwrap();
    broker.on_fn("ping", move |ctx, _args| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.reply("pong", vec![]);
            Ok(())
        }
    });
    let addr = broker.start_listening().await.unwrap();

    // Drive the raw socket by hand so garbage bytes can be interleaved
    // with well-formed frames.
    let digest = eventline_core::SecretDigest::derive("hunter2");
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let authorize = Envelope::new(
        control::AUTHORIZE,
        vec![serde_json::to_value(eventline_core::AuthorizePayload {
            secret_key_hash: digest.to_string(),
            name: None,
        })
        .unwrap()],
    );
    stream.write_all(&wire::encode(&authorize)).await.unwrap();

    let confirmation = next_raw_frame(&mut stream).await;
    assert_eq!(confirmation.event, eventline_core::authorized_channel(&digest));

    // Garbage first, then a real frame split across two writes: the real
    // one still dispatches and the reply comes back.
    stream.write_all(b"this is not a frame\n").await.unwrap();
    let ping = wire::encode(&Envelope::bare("ping"));
    let (left, right) = ping.split_at(ping.len() / 2);
    stream.write_all(left).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(right).await.unwrap();

    let reply = next_raw_frame(&mut stream).await;
    assert_eq!(reply.event, "pong");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

/// Read frames off a raw socket until a well-formed one arrives
async fn next_raw_frame(stream: &mut TcpStream) -> Envelope {
    let mut buffer = wire::FrameBuffer::new();
    let mut chunk = [0u8; 1024];

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            while let Some(frame) = buffer.next_frame() {
                if let Ok(envelope) = frame {
                    return envelope;
                }
            }
            let n = stream.read(&mut chunk).await.expect("socket read failed");
            assert!(n > 0, "connection closed while waiting for a frame");
            buffer.extend(&chunk[..n]);
        }
    })
    .await
    .expect("timed out waiting for a frame")
}
