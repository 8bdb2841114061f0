//! Broadcast endpoint tests with real WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

use freshsync_connectors::broadcast::{BroadcastConfig, BroadcastHub, WsServer};
use freshsync_core::consolidate::{FlushBatch, NetOp};
use freshsync_core::value::{ColumnDef, ColumnType, Row, ViewSchema};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn orders_schema() -> Arc<ViewSchema> {
    Arc::new(ViewSchema::new(
        "orders",
        vec![
            ColumnDef::new("order_id", ColumnType::Text),
            ColumnDef::new("status", ColumnType::Text),
        ],
    ))
}

fn order(key: &str, status: &str) -> Row {
    Row::parse(&orders_schema(), &[Some(key.to_string()), Some(status.to_string())])
        .unwrap()
}

fn upsert(ts: u64, key: &str, status: &str) -> FlushBatch {
    FlushBatch {
        ts,
        ops: vec![NetOp::Upsert {
            key: key.to_string(),
            row: order(key, status),
        }],
    }
}

fn test_config() -> BroadcastConfig {
    let mut config = BroadcastConfig::new("127.0.0.1:0");
    config.hello_timeout = Duration::from_millis(500);
    config.ping_interval = Duration::from_millis(200);
    config
}

async fn start_server(config: BroadcastConfig) -> (Arc<BroadcastHub>, WsServer) {
    let hub = Arc::new(BroadcastHub::new());
    let channel = hub.register_view("orders");
    channel.hydrate_begin();
    channel.hydrate_end(1);
    let server = WsServer::bind(Arc::clone(&hub), config).await.unwrap();
    (hub, server)
}

async fn connect(server: &WsServer) -> Client {
    let (client, _) = connect_async(format!("ws://{}/sync", server.local_addr()))
        .await
        .unwrap();
    client
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("read error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Reads until the connection closes; returns the close reason if the
/// server sent a `bye` frame first.
async fn read_until_close(client: &mut Client) -> Option<String> {
    let mut bye_reason = None;
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for close");
        match message {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return bye_reason,
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["kind"] == "bye" {
                    bye_reason = Some(value["reason"].as_str().unwrap().to_string());
                }
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn say_hello(client: &mut Client, views: &[&str]) {
    let hello = json!({"kind": "hello", "views": views}).to_string();
    client.send(Message::Text(hello.into())).await.unwrap();
}

#[tokio::test]
async fn test_snapshot_then_deltas() {
    let (hub, server) = start_server(test_config()).await;
    let channel = hub.get_view("orders").unwrap();
    channel.apply(&upsert(5, "o1", "PAID")).unwrap();

    let mut client = connect(&server).await;
    say_hello(&mut client, &["orders"]).await;

    let snapshot = next_json(&mut client).await;
    assert_eq!(snapshot["kind"], "snapshot");
    assert_eq!(snapshot["view"], "orders");
    assert_eq!(snapshot["rows"][0]["key"], "o1");
    assert_eq!(snapshot["rows"][0]["row"]["status"], "PAID");

    let end = next_json(&mut client).await;
    assert_eq!(end["kind"], "snapshot_end");

    channel
        .apply(&FlushBatch {
            ts: 6,
            ops: vec![NetOp::Delete {
                key: "o1".to_string(),
            }],
        })
        .unwrap();
    let delta = next_json(&mut client).await;
    assert_eq!(delta["kind"], "delta");
    assert_eq!(delta["deletes"][0], "o1");
    assert_eq!(delta["ts"], 6);

    server.shutdown().await;
}

// Deltas arrive in order, all past the snapshot cutoff.
#[tokio::test]
async fn test_delta_ordering_past_cutoff() {
    let (hub, server) = start_server(test_config()).await;
    let channel = hub.get_view("orders").unwrap();
    channel.apply(&upsert(5, "o1", "NEW")).unwrap();

    let mut client = connect(&server).await;
    say_hello(&mut client, &["orders"]).await;
    // Snapshot (cutoff 5) + end.
    assert_eq!(next_json(&mut client).await["kind"], "snapshot");
    assert_eq!(next_json(&mut client).await["kind"], "snapshot_end");

    for ts in 6..=10 {
        channel.apply(&upsert(ts, "o1", &format!("S{ts}"))).unwrap();
    }

    let mut last_ts = 5;
    for _ in 0..5 {
        let delta = next_json(&mut client).await;
        assert_eq!(delta["kind"], "delta");
        let ts = delta["ts"].as_u64().unwrap();
        assert!(ts > 5, "delta at or below the snapshot cutoff");
        assert!(ts >= last_ts, "deltas out of order");
        last_ts = ts;
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_two_clients_independent_cutoffs() {
    let (hub, server) = start_server(test_config()).await;
    let channel = hub.get_view("orders").unwrap();

    let mut early = connect(&server).await;
    say_hello(&mut early, &["orders"]).await;
    assert_eq!(next_json(&mut early).await["kind"], "snapshot_end");

    channel.apply(&upsert(5, "o1", "PAID")).unwrap();
    assert_eq!(next_json(&mut early).await["kind"], "delta");

    // The late client's snapshot already covers ts 5.
    let mut late = connect(&server).await;
    say_hello(&mut late, &["orders"]).await;
    let snapshot = next_json(&mut late).await;
    assert_eq!(snapshot["kind"], "snapshot");
    assert_eq!(snapshot["rows"][0]["row"]["status"], "PAID");
    assert_eq!(next_json(&mut late).await["kind"], "snapshot_end");

    channel.apply(&upsert(6, "o1", "PACKED")).unwrap();
    assert_eq!(next_json(&mut early).await["ts"], 6);
    assert_eq!(next_json(&mut late).await["ts"], 6);

    server.shutdown().await;
}

#[tokio::test]
async fn test_bad_hello_rejected() {
    let (_hub, server) = start_server(test_config()).await;
    let mut client = connect(&server).await;
    client
        .send(Message::Text(r#"{"kind":"dance"}"#.into()))
        .await
        .unwrap();
    assert_eq!(
        read_until_close(&mut client).await.as_deref(),
        Some("bad_hello")
    );
    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_view_rejected() {
    let (_hub, server) = start_server(test_config()).await;
    let mut client = connect(&server).await;
    say_hello(&mut client, &["no_such_view"]).await;
    assert_eq!(
        read_until_close(&mut client).await.as_deref(),
        Some("unknown_view")
    );
    server.shutdown().await;
}

#[tokio::test]
async fn test_bad_frame_mid_session() {
    let (_hub, server) = start_server(test_config()).await;
    let mut client = connect(&server).await;
    say_hello(&mut client, &["orders"]).await;
    assert_eq!(next_json(&mut client).await["kind"], "snapshot_end");

    client
        .send(Message::Text("not json".into()))
        .await
        .unwrap();
    assert_eq!(
        read_until_close(&mut client).await.as_deref(),
        Some("bad_frame")
    );
    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong_keeps_session_alive() {
    let (_hub, server) = start_server(test_config()).await;
    let mut client = connect(&server).await;
    say_hello(&mut client, &["orders"]).await;
    assert_eq!(next_json(&mut client).await["kind"], "snapshot_end");

    // Answer two pings; the session must survive past two intervals.
    for _ in 0..2 {
        let frame = next_json(&mut client).await;
        assert_eq!(frame["kind"], "ping");
        client
            .send(Message::Text(r#"{"kind":"pong"}"#.into()))
            .await
            .unwrap();
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_pong_disconnects() {
    let (_hub, server) = start_server(test_config()).await;
    let mut client = connect(&server).await;
    say_hello(&mut client, &["orders"]).await;
    assert_eq!(next_json(&mut client).await["kind"], "snapshot_end");

    // Never answer the ping: the next tick closes the session.
    assert_eq!(
        read_until_close(&mut client).await.as_deref(),
        Some("ping_timeout")
    );
    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_says_goodbye() {
    let (_hub, server) = start_server(test_config()).await;
    let mut client = connect(&server).await;
    say_hello(&mut client, &["orders"]).await;
    assert_eq!(next_json(&mut client).await["kind"], "snapshot_end");

    let closer = tokio::spawn(async move { server.shutdown().await });
    assert_eq!(
        read_until_close(&mut client).await.as_deref(),
        Some("shutting_down")
    );
    closer.await.unwrap();
}
