//! End-to-end room and weight flows over a real WebSocket connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use dice_scale::sensor::{CalibrationStore, SensorConfig, SensorDriver, SimulatedBus};
use dice_scale::{ScaleServer, ServerConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(bus: SimulatedBus) -> (String, Arc<ScaleServer>) {
    start_with(bus, ServerConfig::default()).await
}

async fn start_with(bus: SimulatedBus, config: ServerConfig) -> (String, Arc<ScaleServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let file = std::env::temp_dir().join(format!("dice-scale-it-{}.json", uuid::Uuid::new_v4()));
    let sensor = SensorDriver::new(bus, CalibrationStore::new(file), SensorConfig::without_delays()).unwrap();
    let server = Arc::new(ScaleServer::new(config, Arc::new(sensor)));

    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    (format!("ws://{addr}"), server)
}

async fn send(ws: &mut Client, msg: Value) {
    ws.send(Message::Text(msg.to_string())).await.unwrap();
}

async fn recv(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server")
            .expect("stream closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Connect and wait until the server has registered the connection.
async fn connect(url: &str) -> Client {
    let (mut ws, _) = connect_async(url).await.unwrap();
    send(&mut ws, json!({"type": "ping", "timestamp": 1})).await;
    assert_eq!(recv(&mut ws).await["type"], "pong");
    ws
}

#[tokio::test]
async fn test_room_lifecycle() {
    let (url, _server) = start(SimulatedBus::default()).await;
    let mut host = connect(&url).await;
    let mut guest = connect(&url).await;

    send(&mut host, json!({"type": "create_session", "sessionId": "t1"})).await;
    let created = recv(&mut host).await;
    assert_eq!(created["type"], "session_created");
    assert_eq!(created["isHost"], true);

    send(&mut guest, json!({"type": "join_session", "sessionId": "t1"})).await;
    let joined = recv(&mut guest).await;
    assert_eq!(joined["type"], "session_joined");
    assert_eq!(joined["isHost"], false);
    assert!(joined.get("gameState").is_none());

    send(&mut host, json!({
        "type": "update_state",
        "sessionId": "t1",
        "update": {"dice1": 3, "dice2": 4, "phase": "rolling"}
    }))
    .await;
    for ws in [&mut host, &mut guest] {
        let state = recv(ws).await;
        assert_eq!(state["type"], "session_state");
        assert_eq!(state["gameState"]["dice1"], 3);
        assert_eq!(state["gameState"]["phase"], "rolling");
    }

    send(&mut guest, json!({"type": "update_state", "sessionId": "t1", "update": {"dice1": 6}})).await;
    let denied = recv(&mut guest).await;
    assert_eq!(denied["type"], "error");
    assert_eq!(denied["code"], "not_host");

    send(&mut host, json!({"type": "leave_session", "sessionId": "t1"})).await;
    assert_eq!(recv(&mut host).await["type"], "session_left");
    let ended = recv(&mut guest).await;
    assert_eq!(ended["type"], "session_ended");
    assert_eq!(ended["sessionId"], "t1");
}

#[tokio::test]
async fn test_late_joiner_sees_merged_state() {
    let (url, _server) = start(SimulatedBus::default()).await;
    let mut host = connect(&url).await;

    send(&mut host, json!({"type": "create_session", "sessionId": "t2"})).await;
    recv(&mut host).await;
    send(&mut host, json!({"type": "update_state", "sessionId": "t2", "update": {"dice1": 2}})).await;
    recv(&mut host).await;
    send(&mut host, json!({"type": "update_state", "sessionId": "t2", "update": {"targetWeight": 42.5}})).await;
    recv(&mut host).await;

    let mut late = connect(&url).await;
    send(&mut late, json!({"type": "join_session", "sessionId": "t2"})).await;
    let joined = recv(&mut late).await;

    assert_eq!(joined["gameState"]["dice1"], 2);
    assert_eq!(joined["gameState"]["targetWeight"], 42.5);
}

#[tokio::test]
async fn test_host_disconnect_closes_room() {
    let (url, server) = start(SimulatedBus::default()).await;
    let mut host = connect(&url).await;
    let mut guest = connect(&url).await;

    send(&mut host, json!({"type": "create_session", "sessionId": "t3"})).await;
    recv(&mut host).await;
    send(&mut guest, json!({"type": "join_session", "sessionId": "t3"})).await;
    recv(&mut guest).await;

    host.close(None).await.unwrap();
    drop(host);

    let ended = recv(&mut guest).await;
    assert_eq!(ended["type"], "session_ended");
    assert_eq!(server.room_count().await, 0);
}

#[tokio::test]
async fn test_weight_reaches_every_client() {
    let bus = SimulatedBus::new(0, 1.0, 0);
    bus.set_load(180.0);
    let (url, _server) = start(bus.clone()).await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;

    send(&mut a, json!({"type": "read_weight"})).await;
    for ws in [&mut a, &mut b] {
        let update = recv(ws).await;
        assert_eq!(update["type"], "weight_update");
        assert_eq!(update["value"], 180.0);
    }
}

#[tokio::test]
async fn test_records_over_socket() {
    let (url, _server) = start(SimulatedBus::default()).await;
    let mut ws = connect(&url).await;

    send(&mut ws, json!({"type": "create_record", "name": "Friday", "owner": "ana", "id": "fri"})).await;
    let record = recv(&mut ws).await;
    assert_eq!(record["type"], "record");
    assert_eq!(record["settings"]["maxRetries"], 2);

    send(&mut ws, json!({"type": "list_records"})).await;
    let list = recv(&mut ws).await;
    assert_eq!(list["sessions"][0]["id"], "fri");
}

#[tokio::test]
async fn test_record_from_preset() {
    let (url, _server) = start(SimulatedBus::default()).await;
    let mut ws = connect(&url).await;

    send(&mut ws, json!({"type": "create_record", "name": "Pros", "owner": "ana", "preset": "expert"})).await;
    let record = recv(&mut ws).await;
    assert_eq!(record["type"], "record");
    assert_eq!(record["settings"]["margin"], 3);
    assert_eq!(record["settings"]["scoring"]["perfectScore"], 2000);

    send(&mut ws, json!({"type": "create_record", "name": "?", "owner": "ana", "preset": "legendary"})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "invalid_input");
}

#[tokio::test]
async fn test_over_limit_client_told_why() {
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let (url, server) = start_with(SimulatedBus::default(), config).await;
    let _first = connect(&url).await;

    let (mut second, _) = connect_async(&url).await.unwrap();
    let refusal = recv(&mut second).await;
    assert_eq!(refusal["type"], "error");
    assert_eq!(refusal["code"], "server_overloaded");
    assert_eq!(server.connection_count().await, 1);
}

#[tokio::test]
async fn test_malformed_message() {
    let (url, _server) = start(SimulatedBus::default()).await;
    let mut ws = connect(&url).await;

    ws.send(Message::Text("{\"type\": \"warp_drive\"}".to_string())).await.unwrap();
    let reply = recv(&mut ws).await;
    assert_eq!(reply["code"], "invalid_input");
}

#[tokio::test]
async fn test_shutdown_notifies_clients() {
    let (url, server) = start(SimulatedBus::default()).await;
    let mut ws = connect(&url).await;

    server.shutdown();
    assert_eq!(recv(&mut ws).await["type"], "shutdown");
}
