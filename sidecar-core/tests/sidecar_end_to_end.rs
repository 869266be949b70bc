//! End-to-end: worker clients -> broker over local TCP -> connection
//! manager -> mock upstream
//!
//! Verifies:
//! 1. Two workers on one channel share one upstream subscription
//! 2. A departed worker stops receiving while the other keeps going
//! 3. Calls round-trip with typed errors
//! 4. Upstream reconnect is invisible to subscribed workers
//! 5. Malformed or oversized lines get an error reply on a connection
//!    that stays open

use serde_json::json;
use sidecar_core::broker::{BrokerServer, SubscriptionBroker};
use sidecar_core::client::{EventSubscription, WorkerClient, WorkerClientConfig};
use sidecar_core::connection::{ConnectionConfig, ConnectionManager};
use sidecar_core::core::ConnectionStatus;
use sidecar_core::resilience::{BackoffPolicy, DeadLetterConfig, DeadLetterStore};
use sidecar_core::testing::{logs_key, MockConnector};
use sidecar_core::SidecarError;
use std::sync::Arc;
use sidecar_core::broker::MAX_FRAME_BYTES;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

struct Harness {
    mock: MockConnector,
    broker: SubscriptionBroker,
    client_config: WorkerClientConfig,
    shutdown: watch::Sender<bool>,
}

fn quick_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base_delay: Duration::from_millis(10),
        multiplier: 1.0,
        max_delay: Duration::from_millis(10),
        jitter_factor: 0.0,
        max_attempts: 1,
        ..BackoffPolicy::default()
    }
}

async fn start() -> Harness {
    let mock = MockConnector::new();
    let connection = ConnectionManager::new(
        Arc::new(mock.clone()),
        ConnectionConfig {
            reconnect_backoff: quick_backoff(),
            call_retry: quick_backoff(),
            ..ConnectionConfig::default()
        },
    );
    connection.connect().await.unwrap();

    let broker = SubscriptionBroker::new(
        connection,
        Some(DeadLetterStore::in_memory(DeadLetterConfig::default())),
        None,
    );

    let call = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let event = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_config = WorkerClientConfig {
        call_addr: call.local_addr().unwrap(),
        event_addr: event.local_addr().unwrap(),
        request_timeout: Duration::from_secs(2),
        reconnect: quick_backoff(),
        max_reconnect_attempts: None,
    };

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(BrokerServer::new(broker.clone(), None).serve_on(call, event, shutdown_rx));

    Harness {
        mock,
        broker,
        client_config,
        shutdown,
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

async fn next_data(events: &mut EventSubscription) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("subscription open")
        .data
}

#[tokio::test]
async fn test_two_workers_share_one_upstream_subscription() {
    let h = start().await;
    let channel = logs_key().to_string();

    let a = WorkerClient::connect(h.client_config.clone()).await.unwrap();
    let b = WorkerClient::connect(h.client_config.clone()).await.unwrap();
    let mut events_a = a.subscribe(&channel).await.unwrap();
    let mut events_b = b.subscribe(&channel).await.unwrap();

    assert_eq!(h.mock.subscribe_count(), 1);
    assert_eq!(h.broker.member_count(&logs_key()), 2);

    assert_eq!(h.mock.push_notification(&logs_key(), json!({"event": "E"})), 1);
    assert_eq!(next_data(&mut events_a).await, json!({"event": "E"}));
    assert_eq!(next_data(&mut events_b).await, json!({"event": "E"}));

    a.close();
    eventually(|| h.broker.member_count(&logs_key()) == 1).await;
    // Upstream subscription stays while B needs it
    assert_eq!(h.mock.unsubscribe_count(), 0);

    h.mock.push_notification(&logs_key(), json!({"event": "F"}));
    assert_eq!(next_data(&mut events_b).await, json!({"event": "F"}));
    let after_close = tokio::time::timeout(Duration::from_secs(1), events_a.recv()).await;
    assert!(matches!(after_close, Ok(None)));

    b.unsubscribe(&channel).await.unwrap();
    eventually(|| h.mock.unsubscribe_count() == 1).await;
    assert_eq!(h.broker.channel_count(), 0);

    b.close();
    h.shutdown.send_replace(true);
}

#[tokio::test]
async fn test_calls_and_typed_errors_over_tcp() {
    let h = start().await;
    h.mock
        .script_response("getBalance", Err(SidecarError::Protocol("invalid param".into())));

    let worker = WorkerClient::connect(h.client_config.clone()).await.unwrap();

    let result = worker.call("getSlot", json!([])).await.unwrap();
    assert_eq!(result["method"], "getSlot");

    let err = worker.call("getBalance", json!(["x"])).await.unwrap_err();
    assert_eq!(err.kind(), "protocol");

    // Concurrent calls on one connection are correlated by id
    let calls = (0..8).map(|i| {
        let worker = worker.clone();
        async move { worker.call("echo", json!([i])).await }
    });
    let results = futures_util::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap()["params"], json!([i]));
    }

    // Unknown channel kinds are refused with a typed error
    let err = worker.subscribe("mempool:abc").await.err().unwrap();
    assert_eq!(err.kind(), "subscription");

    worker.close();
    h.shutdown.send_replace(true);
}

#[tokio::test]
async fn test_upstream_reconnect_is_transparent_to_workers() {
    let h = start().await;
    let channel = logs_key().to_string();

    let worker = WorkerClient::connect(h.client_config.clone()).await.unwrap();
    let mut events = worker.subscribe(&channel).await.unwrap();

    h.mock.drop_transport();
    eventually(|| {
        h.mock.session_number() == 2
            && h.broker.connection().status() == ConnectionStatus::Connected
            && h.mock.live_subscriptions().len() == 1
    })
    .await;

    h.mock.push_notification(&logs_key(), json!({"after": "reconnect"}));
    assert_eq!(next_data(&mut events).await, json!({"after": "reconnect"}));
    assert_eq!(h.broker.connection().stats().successful_reconnects, 1);

    worker.close();
    h.shutdown.send_replace(true);
}

async fn read_reply(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> serde_json::Value {
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("reply within timeout")
        .expect("socket readable")
        .expect("connection still open");
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_malformed_call_frames_keep_connection_open() {
    let h = start().await;
    let stream = TcpStream::connect(h.client_config.call_addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    // Invalid UTF-8 inside a JSON string
    write.write_all(b"{\"id\":\"x\",\"method\":\"\xff\xfe\"}\n").await.unwrap();
    let reply = read_reply(&mut lines).await;
    assert_eq!(reply["errorKind"], "protocol");

    // Oversized line is discarded without buffering it whole
    let mut huge = vec![b'a'; MAX_FRAME_BYTES + 1];
    huge.push(b'\n');
    write.write_all(&huge).await.unwrap();
    let reply = read_reply(&mut lines).await;
    assert_eq!(reply["errorKind"], "protocol");

    write
        .write_all(b"{\"id\":2,\"method\":\"getSlot\",\"params\":[]}\n")
        .await
        .unwrap();
    let reply = read_reply(&mut lines).await;
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["result"]["method"], "getSlot");

    h.shutdown.send_replace(true);
}

#[tokio::test]
async fn test_malformed_event_frames_keep_connection_open() {
    let h = start().await;
    let channel = logs_key().to_string();
    let stream = TcpStream::connect(h.client_config.event_addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"\xff\xfe garbage\n").await.unwrap();
    let reply = read_reply(&mut lines).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["errorKind"], "protocol");

    write.write_all(b"{\"type\":\"subscribe\"}\n").await.unwrap();
    let reply = read_reply(&mut lines).await;
    assert_eq!(reply["type"], "error");

    let subscribe = format!("{{\"type\":\"subscribe\",\"channel\":\"{}\"}}\n", channel);
    write.write_all(subscribe.as_bytes()).await.unwrap();
    let reply = read_reply(&mut lines).await;
    assert_eq!(reply["type"], "subscribed");
    assert_eq!(reply["channel"], channel.as_str());
    assert_eq!(h.broker.member_count(&logs_key()), 1);

    h.shutdown.send_replace(true);
}
