//! End-to-end signaling tests over a real WebSocket connection, backed by
//! the in-process engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use parley_server::config::Config;
use parley_server::engine::local::LocalEngine;
use parley_server::session::RoomRegistry;
use parley_server::ws::{self, GatewayState};

/// Spin up a gateway on an ephemeral port.
async fn spawn_server() -> SocketAddr {
    let config = Arc::new(Config::default_for_test());
    let registry = Arc::new(RoomRegistry::new(Arc::new(LocalEngine::new()), config));
    let app = ws::router(GatewayState { registry });

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("No local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server crashed");
    });

    addr
}

/// A thin signaling client: send JSON requests, wait for correlated acks,
/// buffer unsolicited notifications a test may assert on later.
struct SignalClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    pending_events: Vec<Value>,
}

impl SignalClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (socket, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("WebSocket connect failed");
        Self {
            socket,
            next_id: 1,
            pending_events: Vec::new(),
        }
    }

    async fn send_raw(&mut self, text: String) {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .expect("Send failed");
    }

    async fn next_json(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), self.socket.next())
                .await
                .expect("Timed out waiting for a frame")
                .expect("Connection closed")
                .expect("WebSocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("Frame is not valid JSON");
            }
        }
    }

    /// Send a command and read frames until its ack arrives. Notifications
    /// that show up first are buffered.
    async fn request(&mut self, mut body: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        body["id"] = json!(id);
        self.send_raw(body.to_string()).await;

        loop {
            let frame = self.next_json().await;
            match frame["type"].as_str() {
                Some("ack") | Some("ackError") if frame["id"] == json!(id) => return frame,
                _ => self.pending_events.push(frame),
            }
        }
    }

    /// Send a command expecting a successful ack; returns the `data` payload.
    async fn request_ok(&mut self, body: Value) -> Value {
        let frame = self.request(body).await;
        assert_eq!(frame["type"], "ack", "expected ack, got: {frame}");
        frame["data"].clone()
    }

    /// Wait for a notification of the given `type`, draining buffered ones first.
    async fn wait_event(&mut self, event_type: &str) -> Value {
        if let Some(pos) = self
            .pending_events
            .iter()
            .position(|e| e["type"] == json!(event_type))
        {
            return self.pending_events.remove(pos);
        }
        loop {
            let frame = self.next_json().await;
            if frame["type"] == json!(event_type) {
                return frame;
            }
            self.pending_events.push(frame);
        }
    }
}

fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{"algorithm": "sha-256", "value": "AA:BB:CC:DD"}]
    })
}

fn video_rtp_parameters() -> Value {
    json!({
        "codecs": [{"mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000}],
        "encodings": [{"ssrc": 2222}]
    })
}

fn device_capabilities() -> Value {
    json!({
        "codecs": [
            {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
            {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000}
        ]
    })
}

#[tokio::test]
async fn full_signaling_flow() {
    let addr = spawn_server().await;

    // 1. Alice creates and joins a room.
    let mut alice = SignalClient::connect(addr).await;
    let data = alice
        .request_ok(json!({"action": "createRoom", "room_id": "demo"}))
        .await;
    assert_eq!(data["op"], "roomCreated");
    assert_eq!(data["room_id"], "demo");

    let data = alice
        .request_ok(json!({"action": "join", "room_id": "demo", "name": "alice"}))
        .await;
    assert_eq!(data["op"], "joined");
    assert_eq!(data["peers"][0]["name"], "alice");

    // 2. Router capabilities come back with the configured codecs.
    let data = alice
        .request_ok(json!({"action": "getRouterRtpCapabilities"}))
        .await;
    assert_eq!(data["codecs"][0]["mimeType"], "audio/opus");
    assert_eq!(data["codecs"][1]["mimeType"], "video/VP8");

    // 3. Alice sets up a send transport and produces video.
    let data = alice
        .request_ok(json!({"action": "createWebRtcTransport"}))
        .await;
    let send_transport = data["id"].clone();
    assert!(data["iceParameters"]["usernameFragment"].is_string());
    assert!(data["iceCandidates"].as_array().is_some_and(|c| !c.is_empty()));

    alice
        .request_ok(json!({
            "action": "connectTransport",
            "transport_id": send_transport,
            "dtlsParameters": dtls_parameters()
        }))
        .await;

    let data = alice
        .request_ok(json!({
            "action": "produce",
            "kind": "video",
            "producerTransportId": send_transport,
            "rtpParameters": video_rtp_parameters()
        }))
        .await;
    let producer_id = data["producer_id"].clone();
    assert!(producer_id.is_string());

    // 4. Bob joins and discovers Alice's producer.
    let mut bob = SignalClient::connect(addr).await;
    let data = bob
        .request_ok(json!({"action": "join", "room_id": "demo", "name": "bob"}))
        .await;
    assert_eq!(data["peers"].as_array().map(Vec::len), Some(2));

    bob.request_ok(json!({"action": "getProducers"})).await;
    let event = bob.wait_event("newProducers").await;
    assert_eq!(event["producers"][0]["producer_id"], producer_id);

    // 5. Bob consumes it and resumes.
    let data = bob
        .request_ok(json!({"action": "createWebRtcTransport"}))
        .await;
    let recv_transport = data["id"].clone();
    bob.request_ok(json!({
        "action": "connectTransport",
        "transport_id": recv_transport,
        "dtlsParameters": dtls_parameters()
    }))
    .await;

    let data = bob
        .request_ok(json!({
            "action": "consume",
            "consumerTransportId": recv_transport,
            "producerId": producer_id,
            "rtpCapabilities": device_capabilities()
        }))
        .await;
    assert_eq!(data["producerId"], producer_id);
    assert_eq!(data["kind"], "video");
    assert_eq!(data["type"], "simple");
    let consumer_id = data["id"].clone();

    bob.request_ok(json!({"action": "resume", "consumerId": consumer_id}))
        .await;

    // 6. Alice disconnects; Bob is told his consumer is gone.
    drop(alice);
    let event = bob.wait_event("consumerClosed").await;
    assert_eq!(event["consumer_id"], consumer_id);
}

#[tokio::test]
async fn second_producer_is_announced_live() {
    let addr = spawn_server().await;

    let mut alice = SignalClient::connect(addr).await;
    alice
        .request_ok(json!({"action": "createRoom", "room_id": "live"}))
        .await;
    alice
        .request_ok(json!({"action": "join", "room_id": "live", "name": "alice"}))
        .await;

    let mut bob = SignalClient::connect(addr).await;
    bob.request_ok(json!({"action": "join", "room_id": "live", "name": "bob"}))
        .await;

    let data = alice
        .request_ok(json!({"action": "createWebRtcTransport"}))
        .await;
    let transport = data["id"].clone();
    let data = alice
        .request_ok(json!({
            "action": "produce",
            "kind": "video",
            "producerTransportId": transport,
            "rtpParameters": video_rtp_parameters()
        }))
        .await;

    // Bob hears about it without asking.
    let event = bob.wait_event("newProducers").await;
    assert_eq!(event["producers"][0]["producer_id"], data["producer_id"]);
}

#[tokio::test]
async fn error_acks_carry_codes() {
    let addr = spawn_server().await;
    let mut client = SignalClient::connect(addr).await;

    // Room-scoped command before join.
    let frame = client
        .request(json!({"action": "createWebRtcTransport"}))
        .await;
    assert_eq!(frame["type"], "ackError");
    assert_eq!(frame["code"], "NOT_IN_ROOM");

    // Joining a room that does not exist.
    let frame = client
        .request(json!({"action": "join", "room_id": "ghost", "name": "alice"}))
        .await;
    assert_eq!(frame["code"], "ROOM_NOT_FOUND");

    // Duplicate room creation.
    client
        .request_ok(json!({"action": "createRoom", "room_id": "dup"}))
        .await;
    let frame = client
        .request(json!({"action": "createRoom", "room_id": "dup"}))
        .await;
    assert_eq!(frame["code"], "ROOM_EXISTS");

    // Double join on one connection.
    client
        .request_ok(json!({"action": "join", "room_id": "dup", "name": "alice"}))
        .await;
    let frame = client
        .request(json!({"action": "join", "room_id": "dup", "name": "again"}))
        .await;
    assert_eq!(frame["code"], "ALREADY_JOINED");

    // Consuming a producer nobody owns.
    let data = client
        .request_ok(json!({"action": "createWebRtcTransport"}))
        .await;
    let frame = client
        .request(json!({
            "action": "consume",
            "consumerTransportId": data["id"],
            "producerId": "00000000-0000-0000-0000-000000000000",
            "rtpCapabilities": device_capabilities()
        }))
        .await;
    assert_eq!(frame["code"], "UNKNOWN_PRODUCER");
}

#[tokio::test]
async fn malformed_frames_get_a_bad_request_ack() {
    let addr = spawn_server().await;
    let mut client = SignalClient::connect(addr).await;

    client.send_raw("this is not json".into()).await;
    let frame = client.next_json().await;
    assert_eq!(frame["type"], "ackError");
    assert_eq!(frame["id"], 0);
    assert_eq!(frame["code"], "BAD_REQUEST");

    // The connection survives and still speaks the protocol.
    client
        .request_ok(json!({"action": "createRoom", "room_id": "after"}))
        .await;
}

#[tokio::test]
async fn leave_tears_down_empty_room() {
    let addr = spawn_server().await;
    let mut client = SignalClient::connect(addr).await;

    client
        .request_ok(json!({"action": "createRoom", "room_id": "brief"}))
        .await;
    client
        .request_ok(json!({"action": "join", "room_id": "brief", "name": "alice"}))
        .await;
    let data = client.request_ok(json!({"action": "leave"})).await;
    assert_eq!(data["op"], "left");

    // The room went away with its last peer; the id is free again.
    client
        .request_ok(json!({"action": "createRoom", "room_id": "brief"}))
        .await;

    // A second leave has no room to act on.
    let frame = client.request(json!({"action": "leave"})).await;
    assert_eq!(frame["code"], "NOT_IN_ROOM");
}
