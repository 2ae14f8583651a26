//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying both synchronization tracks over the wire.

use std::net::SocketAddr;
use std::path::Path;

use coedit_server::protocol::{CollabMessage, CollabType, CollabUpdate, Message, MessageType};
use coedit_server::server::{ServerConfig, SyncServer};
use coedit_server::storage::StoreConfig;
use coedit_server::{ConnectionState, HubHandle};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A decoded server frame from either track.
#[derive(Debug)]
enum Frame {
    Legacy(Message),
    Collab(CollabMessage),
}

impl Frame {
    fn legacy(self) -> Message {
        match self {
            Frame::Legacy(msg) => msg,
            other => panic!("Expected legacy frame, got {other:?}"),
        }
    }

    fn collab(self) -> CollabMessage {
        match self {
            Frame::Collab(msg) => msg,
            other => panic!("Expected collab frame, got {other:?}"),
        }
    }
}

/// Start a server with the given config, return its address and hub.
async fn start_server(config: ServerConfig) -> (SocketAddr, HubHandle) {
    let server = SyncServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let hub = server.hub().clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (addr, hub)
}

fn config_with_store(dir: &Path) -> ServerConfig {
    ServerConfig {
        storage: Some(StoreConfig::for_testing(dir)),
        ..ServerConfig::for_testing()
    }
}

async fn connect(addr: SocketAddr, room: &str) -> Ws {
    let url = format!("ws://{addr}/ws/{room}");
    let (ws, _) = timeout(Duration::from_secs(2), connect_async(&url))
        .await
        .expect("connect timed out")
        .expect("Should connect to server");
    ws
}

/// Next text frame, skipping keepalive traffic.
async fn recv(ws: &mut Ws) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection ended")
            .expect("read error");
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        return match value["type"].as_str() {
            Some("pull" | "push" | "version" | "updates") => {
                Frame::Collab(CollabMessage::decode(text.as_str()).unwrap())
            }
            _ => Frame::Legacy(Message::decode(text.as_str()).unwrap()),
        };
    }
}

/// Join acknowledgment and snapshot, in whichever order they were written.
async fn recv_welcome(ws: &mut Ws) -> (Message, CollabMessage) {
    let (mut ack, mut snapshot) = (None, None);
    for _ in 0..2 {
        match recv(ws).await {
            Frame::Legacy(msg) => ack = Some(msg),
            Frame::Collab(msg) => snapshot = Some(msg),
        }
    }
    (
        ack.expect("no join acknowledgment"),
        snapshot.expect("no version snapshot"),
    )
}

async fn send_text(ws: &mut Ws, text: String) {
    ws.send(WsMessage::text(text)).await.unwrap();
}

async fn send_legacy(ws: &mut Ws, msg: Message) {
    send_text(ws, msg.encode().unwrap()).await;
}

async fn send_collab(ws: &mut Ws, msg: CollabMessage) {
    send_text(ws, msg.encode().unwrap()).await;
}

/// Poll the hub until `check` holds for the active room list.
async fn wait_for_rooms(hub: &HubHandle, check: impl Fn(&[String]) -> bool) {
    for _ in 0..100 {
        if check(&hub.active_rooms().await.unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("room directory never reached the expected state");
}

#[tokio::test]
async fn test_join_receives_ack_and_snapshot() {
    let (addr, _hub) = start_server(ServerConfig::for_testing()).await;
    let mut ws = connect(addr, "doc1").await;

    let (ack, snapshot) = recv_welcome(&mut ws).await;
    assert_eq!(ack.msg_type, MessageType::Join);
    assert!(ack.user_id.starts_with("user-"));
    assert_eq!(ack.content, ack.user_id);
    assert_eq!(snapshot.msg_type, CollabType::Version);
    assert_eq!(snapshot.version, 0);
    assert_eq!(snapshot.content, "");
    assert_eq!(snapshot.user_id, "server");
}

#[tokio::test]
async fn test_each_connection_gets_a_distinct_identity() {
    let (addr, _hub) = start_server(ServerConfig::for_testing()).await;
    let mut a = connect(addr, "doc1").await;
    let mut b = connect(addr, "doc1").await;

    let (ack_a, _) = recv_welcome(&mut a).await;
    let (ack_b, _) = recv_welcome(&mut b).await;
    assert_ne!(ack_a.user_id, ack_b.user_id);
}

#[tokio::test]
async fn test_two_clients_edit_and_sync() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _hub) = start_server(config_with_store(dir.path())).await;

    let mut a = connect(addr, "doc1").await;
    let (ack_a, _) = recv_welcome(&mut a).await;
    let mut b = connect(addr, "doc1").await;
    let (_, snapshot_b) = recv_welcome(&mut b).await;
    assert_eq!(snapshot_b.version, 0);

    // Legacy track: relayed to B, persisted before relay.
    send_legacy(&mut a, Message::new(MessageType::Insert, "hi", 0, &ack_a.user_id)).await;
    let relayed = recv(&mut b).await.legacy();
    assert_eq!(relayed.msg_type, MessageType::Insert);
    assert_eq!(relayed.content, "hi");
    assert_eq!(relayed.position, 0);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("doc-doc1.txt")).unwrap(),
        "hi"
    );

    // Collab track: both members, sender included, see version 1.
    send_collab(
        &mut a,
        CollabMessage::push(0, vec![CollabUpdate::new("c1", "a")], &ack_a.user_id),
    )
    .await;
    for ws in [&mut a, &mut b] {
        let updates = recv(ws).await.collab();
        assert_eq!(updates.msg_type, CollabType::Updates);
        assert_eq!(updates.version, 1);
        assert_eq!(updates.updates.len(), 1);
        assert_eq!(updates.updates[0].version, 1);
        assert_eq!(updates.updates[0].changes, "c1");
    }

    send_collab(&mut b, CollabMessage::pull(0, "anyone")).await;
    let reply = recv(&mut b).await.collab();
    assert_eq!(reply.version, 1);
    assert_eq!(reply.updates.len(), 1);

    send_collab(&mut b, CollabMessage::pull(1, "anyone")).await;
    let reply = recv(&mut b).await.collab();
    assert_eq!(reply.version, 1);
    assert!(reply.updates.is_empty());
}

#[tokio::test]
async fn test_sender_does_not_receive_own_legacy_operation() {
    let (addr, _hub) = start_server(ServerConfig::for_testing()).await;
    let mut a = connect(addr, "doc1").await;
    let (ack_a, _) = recv_welcome(&mut a).await;
    let mut b = connect(addr, "doc1").await;
    recv_welcome(&mut b).await;

    send_legacy(&mut a, Message::new(MessageType::Cursor, "", 3, &ack_a.user_id)).await;
    assert_eq!(recv(&mut b).await.legacy().msg_type, MessageType::Cursor);

    // A's next frame is the pull reply, not its own cursor.
    send_collab(&mut a, CollabMessage::pull(0, "anyone")).await;
    let next = recv(&mut a).await.collab();
    assert_eq!(next.msg_type, CollabType::Updates);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (addr, _hub) = start_server(ServerConfig::for_testing()).await;
    let mut a = connect(addr, "doc1").await;
    let (ack_a, _) = recv_welcome(&mut a).await;
    let mut c = connect(addr, "doc2").await;
    recv_welcome(&mut c).await;

    send_legacy(&mut a, Message::new(MessageType::Insert, "x", 0, &ack_a.user_id)).await;
    send_collab(&mut c, CollabMessage::pull(0, "anyone")).await;
    // C only sees its own pull reply.
    assert_eq!(recv(&mut c).await.collab().msg_type, CollabType::Updates);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let (addr, _hub) = start_server(ServerConfig::for_testing()).await;
    let mut ws = connect(addr, "doc1").await;
    recv_welcome(&mut ws).await;

    send_text(&mut ws, "this is not json".to_string()).await;
    send_text(&mut ws, r#"{"type":"insert","content":"x"}"#.to_string()).await;
    send_text(&mut ws, r#"{"type":"version","version":5,"user_id":"x"}"#.to_string()).await;

    send_collab(&mut ws, CollabMessage::pull(0, "anyone")).await;
    let reply = recv(&mut ws).await.collab();
    assert_eq!(reply.msg_type, CollabType::Updates);
    assert_eq!(reply.version, 0);
}

#[tokio::test]
async fn test_invalid_path_is_refused() {
    let (addr, hub) = start_server(ServerConfig::for_testing()).await;

    for path in ["/", "/ws/", "/other/doc1", "/ws/a%2F.."] {
        let url = format!("ws://{addr}{path}");
        let result = timeout(Duration::from_secs(2), connect_async(&url)).await.unwrap();
        assert!(result.is_err(), "{path} should be refused");
    }
    assert!(hub.active_rooms().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_room_removed_after_last_disconnect() {
    let (addr, hub) = start_server(ServerConfig::for_testing()).await;
    let mut a = connect(addr, "doc1").await;
    recv_welcome(&mut a).await;
    let mut b = connect(addr, "doc1").await;
    recv_welcome(&mut b).await;
    assert_eq!(hub.active_rooms().await.unwrap(), vec!["doc1"]);

    a.close(None).await.unwrap();
    // B is still connected, so the room stays.
    send_collab(&mut b, CollabMessage::pull(0, "anyone")).await;
    recv(&mut b).await;
    assert_eq!(hub.active_rooms().await.unwrap(), vec!["doc1"]);

    b.close(None).await.unwrap();
    wait_for_rooms(&hub, |rooms| rooms.is_empty()).await;
}

#[tokio::test]
async fn test_reconnect_reloads_persisted_document() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, hub) = start_server(config_with_store(dir.path())).await;

    let mut a = connect(addr, "notes").await;
    let (ack, _) = recv_welcome(&mut a).await;
    send_legacy(&mut a, Message::new(MessageType::Insert, "hello world", 0, &ack.user_id)).await;
    send_legacy(&mut a, Message::new(MessageType::Delete, " world", 5, &ack.user_id)).await;
    a.close(None).await.unwrap();
    wait_for_rooms(&hub, |rooms| rooms.is_empty()).await;

    let mut b = connect(addr, "notes").await;
    let (_, snapshot) = recv_welcome(&mut b).await;
    assert_eq!(snapshot.content, "hello");
    assert_eq!(snapshot.version, 0);
}

#[tokio::test]
async fn test_stats_count_connections_and_frames() {
    let server = SyncServer::bind(ServerConfig::for_testing()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let stats = server.stats_handle();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });

    let mut ws = connect(addr, "doc1").await;
    let (ack, _) = recv_welcome(&mut ws).await;
    send_text(&mut ws, "garbage".to_string()).await;
    send_collab(&mut ws, CollabMessage::pull(0, "anyone")).await;
    recv(&mut ws).await;

    {
        let s = stats.read().await;
        assert_eq!(s.total_connections, 1);
        assert_eq!(s.active_connections, 1);
        assert_eq!(s.frames_received, 2);
        assert_eq!(s.frames_discarded, 1);
        assert_eq!(s.connections.get(&ack.user_id), Some(&ConnectionState::Active));
        assert_eq!(s.connections_in(ConnectionState::Active), 1);
    }

    ws.close(None).await.unwrap();
    for _ in 0..100 {
        {
            let s = stats.read().await;
            if s.active_connections == 0 {
                assert!(s.connections.is_empty());
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection was never released");
}

/// Read until the server closes the connection. Returns whether a close
/// frame was seen before the stream ended.
async fn drain_until_closed(ws: &mut Ws) -> bool {
    let result = timeout(Duration::from_secs(10), async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(WsMessage::Close(_)) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
        false
    })
    .await;
    result.expect("server never closed the connection")
}

#[tokio::test]
async fn test_slow_client_is_evicted_and_its_frames_ignored() {
    let config = ServerConfig {
        client_queue_capacity: 2,
        write_timeout: Duration::from_secs(5),
        ..ServerConfig::for_testing()
    };
    let (addr, hub) = start_server(config).await;
    let mut a = connect(addr, "doc1").await;
    let (ack_a, _) = recv_welcome(&mut a).await;
    let mut b = connect(addr, "doc1").await;
    let (ack_b, _) = recv_welcome(&mut b).await;

    // B stops reading while A sends more than the socket buffers can hold.
    let filler = "x".repeat(64 * 1024);
    for _ in 0..400 {
        send_legacy(
            &mut a,
            Message::new(MessageType::Cursor, filler.clone(), 0, &ack_a.user_id),
        )
        .await;
    }
    // The pull is answered only after every cursor before it was relayed.
    send_collab(&mut a, CollabMessage::pull(0, "anyone")).await;
    assert_eq!(recv(&mut a).await.collab().msg_type, CollabType::Updates);

    // Frames from the evicted client must not reach the room any more.
    let evil = Message::new(MessageType::Insert, "EVIL", 0, &ack_b.user_id);
    let _ = b.send(WsMessage::text(evil.encode().unwrap())).await;
    let _ = b
        .send(WsMessage::text(
            CollabMessage::push(0, vec![CollabUpdate::new("evil", "b")], &ack_b.user_id)
                .encode()
                .unwrap(),
        ))
        .await;
    assert!(drain_until_closed(&mut b).await, "evicted client should get a close frame");

    // A is still a member, so the room stays.
    send_collab(&mut a, CollabMessage::pull(0, "anyone")).await;
    let reply = recv(&mut a).await.collab();
    assert_eq!(reply.version, 0);
    assert!(reply.updates.is_empty());
    assert_eq!(hub.active_rooms().await.unwrap(), vec!["doc1"]);

    let mut c = connect(addr, "doc1").await;
    let (_, snapshot) = recv_welcome(&mut c).await;
    assert_eq!(snapshot.content, "");
    assert_eq!(snapshot.version, 0);

    a.close(None).await.unwrap();
    c.close(None).await.unwrap();
    wait_for_rooms(&hub, |rooms| rooms.is_empty()).await;
}

fn fast_keepalive() -> ServerConfig {
    ServerConfig {
        ping_interval: Duration::from_millis(100),
        idle_timeout: Duration::from_millis(400),
        keepalive_timeout: Duration::from_secs(2),
        ..ServerConfig::for_testing()
    }
}

#[tokio::test]
async fn test_silent_peer_is_dropped_after_idle_timeout() {
    let (addr, hub) = start_server(fast_keepalive()).await;
    let mut ws = connect(addr, "doc1").await;
    recv_welcome(&mut ws).await;
    assert_eq!(hub.active_rooms().await.unwrap(), vec!["doc1"]);

    // Not polling the socket means no pong is ever sent back.
    wait_for_rooms(&hub, |rooms| rooms.is_empty()).await;
    drain_until_closed(&mut ws).await;
}

#[tokio::test]
async fn test_responsive_peer_survives_idle_timeout() {
    let (addr, hub) = start_server(fast_keepalive()).await;
    let mut ws = connect(addr, "doc1").await;
    recv_welcome(&mut ws).await;

    // Reading answers each ping with a pong, which extends the deadline.
    let started = std::time::Instant::now();
    let mut pings = 0;
    while started.elapsed() < Duration::from_secs(1) {
        match timeout(Duration::from_millis(200), ws.next()).await {
            Ok(Some(Ok(WsMessage::Ping(_)))) => pings += 1,
            Ok(Some(Ok(other))) => panic!("Unexpected frame {other:?}"),
            Ok(other) => panic!("Connection ended early: {other:?}"),
            Err(_) => {}
        }
    }
    assert!((5..=12).contains(&pings), "expected a ping every 100ms, got {pings} in 1s");

    send_collab(&mut ws, CollabMessage::pull(0, "anyone")).await;
    assert_eq!(recv(&mut ws).await.collab().msg_type, CollabType::Updates);
    assert_eq!(hub.active_rooms().await.unwrap(), vec!["doc1"]);
}
