use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use uuid::Uuid;
use wayfarer_backend::{
    realtime::{
        self, RealtimeHub,
        fanout::{Fanout, LocalFanout},
        memory::MemoryStore,
        rooms::RoomKey,
    },
    utils::{Claims, TokenKind, generate_token},
};

const SECRET: &str = "integration-secret";
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    fanout: Arc<LocalFanout>,
}

async fn spawn_server() -> Server {
    let store = Arc::new(MemoryStore::new());
    let fanout = Arc::new(LocalFanout::new());
    let hub = RealtimeHub::new(store.clone(), fanout.clone(), SECRET, FLUSH_INTERVAL);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, realtime::router(hub)).await.unwrap();
    });

    Server {
        addr,
        store,
        fanout,
    }
}

fn token_for(user_id: Uuid) -> String {
    generate_token(user_id, TokenKind::Access, SECRET, Duration::from_secs(300)).unwrap()
}

async fn connect(server: &Server, user_id: Uuid) -> Client {
    let url = format!("ws://{}/ws?token={}", server.addr, token_for(user_id));
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn wait_for_subscribers(server: &Server, room: &RoomKey, expected: usize) {
    for _ in 0..100 {
        if server.fanout.registry().subscriber_count(room) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {} never reached {} subscribers", room, expected);
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn next_event(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(result.is_err(), "unexpected frame: {:?}", result);
}

#[tokio::test]
async fn handshake_without_token_is_rejected() {
    let server = spawn_server().await;
    let url = format!("ws://{}/ws", server.addr);

    match connect_async(url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn handshake_with_invalid_token_is_rejected() {
    let server = spawn_server().await;
    let url = format!("ws://{}/ws?token=bogus", server.addr);

    match connect_async(url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn group_members_share_messages_and_coalesced_locations() {
    let server = spawn_server().await;
    let group_id = Uuid::new_v4();
    let other_group = Uuid::new_v4();
    let ana = server.store.add_user("ana");
    let bo = server.store.add_user("bo");
    let eve = server.store.add_user("eve");
    server.store.add_member(group_id, ana);
    server.store.add_member(group_id, bo);
    server.store.add_member(other_group, eve);

    let mut ana_ws = connect(&server, ana).await;
    let mut bo_ws = connect(&server, bo).await;
    let mut eve_ws = connect(&server, eve).await;
    let room = RoomKey::group(group_id);
    wait_for_subscribers(&server, &room, 2).await;
    wait_for_subscribers(&server, &RoomKey::group(other_group), 1).await;

    // 聊天消息：双方都收到，服务端分配 id
    send(
        &mut ana_ws,
        json!({ "event": "send-message", "data": { "groupId": group_id, "content": "  hi all  " } }),
    )
    .await;
    for ws in [&mut ana_ws, &mut bo_ws] {
        let event = next_event(ws).await;
        assert_eq!(event["event"], "new-message");
        assert_eq!(event["data"]["content"], "hi all");
        assert_eq!(event["data"]["user"]["username"], "ana");
        assert_eq!(event["data"]["groupId"], group_id.to_string());
    }
    assert_eq!(server.store.messages().len(), 1);

    // 位置：一个窗口内多次上报只产生一条广播
    let trip_id = Uuid::new_v4();
    for lat in [1.0, 2.0, 3.0] {
        send(
            &mut ana_ws,
            json!({
                "event": "update-location",
                "data": { "groupId": group_id, "tripId": trip_id, "location": { "lat": lat, "lon": 7.5 } }
            }),
        )
        .await;
    }
    send(
        &mut bo_ws,
        json!({
            "event": "update-location",
            "data": { "groupId": group_id, "tripId": trip_id, "location": { "lat": -4.0, "lon": 2.0 } }
        }),
    )
    .await;

    for ws in [&mut ana_ws, &mut bo_ws] {
        let event = next_event(ws).await;
        assert_eq!(event["event"], "locations-update");
        let locations = event["data"].as_array().unwrap();
        assert_eq!(locations.len(), 2);
        let ana_entry = locations
            .iter()
            .find(|entry| entry["userId"] == ana.to_string())
            .unwrap();
        assert_eq!(ana_entry["location"]["lat"], 3.0);
        assert_eq!(ana_entry["username"], "ana");
    }
    assert_silent(&mut ana_ws).await;

    // 非成员的消息被静默丢弃，也收不到该群组的任何事件
    send(
        &mut eve_ws,
        json!({ "event": "send-message", "data": { "groupId": group_id, "content": "intruding" } }),
    )
    .await;
    assert_silent(&mut eve_ws).await;
    assert_silent(&mut bo_ws).await;
    assert_eq!(server.store.messages().len(), 1);
}

#[tokio::test]
async fn trip_lifecycle_is_broadcast_to_the_room() {
    let server = spawn_server().await;
    let group_id = Uuid::new_v4();
    let ana = server.store.add_user("ana");
    let bo = server.store.add_user("bo");
    server.store.add_member(group_id, ana);
    server.store.add_member(group_id, bo);
    let trip_id = server.store.add_trip(group_id, "Coast road");

    let mut ana_ws = connect(&server, ana).await;
    let mut bo_ws = connect(&server, bo).await;
    wait_for_subscribers(&server, &RoomKey::group(group_id), 2).await;

    send(
        &mut ana_ws,
        json!({ "event": "start-trip", "data": { "groupId": group_id, "tripId": trip_id } }),
    )
    .await;
    let started = next_event(&mut bo_ws).await;
    assert_eq!(started["event"], "trip-started");
    assert_eq!(started["data"]["name"], "Coast road");

    send(
        &mut bo_ws,
        json!({ "event": "end-trip", "data": { "groupId": group_id, "tripId": trip_id } }),
    )
    .await;
    let ended = next_event(&mut bo_ws).await;
    assert_eq!(ended["event"], "trip-ended");
    assert_eq!(ended["data"]["tripId"], trip_id.to_string());

    assert_eq!(next_event(&mut ana_ws).await["event"], "trip-started");
    assert_eq!(next_event(&mut ana_ws).await["event"], "trip-ended");
}

#[tokio::test]
async fn disconnect_removes_connection_from_rooms() {
    let server = spawn_server().await;
    let group_id = Uuid::new_v4();
    let ana = server.store.add_user("ana");
    server.store.add_member(group_id, ana);
    let room = RoomKey::group(group_id);

    let mut ana_ws = connect(&server, ana).await;
    wait_for_subscribers(&server, &room, 1).await;

    ana_ws.close(None).await.unwrap();
    wait_for_subscribers(&server, &room, 0).await;
}

#[tokio::test]
async fn expired_token_joins_no_rooms() {
    let server = spawn_server().await;
    let group_id = Uuid::new_v4();
    let ana = server.store.add_user("ana");
    server.store.add_member(group_id, ana);

    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: ana.to_string(),
        exp: now - 3600,
        iat: now - 7200,
        kind: TokenKind::Access,
        jti: Uuid::new_v4().to_string(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();

    let url = format!("ws://{}/ws?token={}", server.addr, token);
    match connect_async(url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        server
            .fanout
            .registry()
            .subscriber_count(&RoomKey::group(group_id)),
        0
    );
}

#[tokio::test]
async fn group_joined_mid_session_takes_effect_on_reconnect() {
    let server = spawn_server().await;
    let home = Uuid::new_v4();
    let group_id = Uuid::new_v4();
    let ana = server.store.add_user("ana");
    let bo = server.store.add_user("bo");
    server.store.add_member(home, ana);
    server.store.add_member(group_id, bo);
    let room = RoomKey::group(group_id);

    let mut ana_ws = connect(&server, ana).await;
    let mut bo_ws = connect(&server, bo).await;
    wait_for_subscribers(&server, &RoomKey::group(home), 1).await;
    wait_for_subscribers(&server, &room, 1).await;

    // 会话中途加入群组：房间在连接时已确定，本次会话收不到该群组的广播
    server.store.add_member(group_id, ana);
    send(
        &mut bo_ws,
        json!({ "event": "send-message", "data": { "groupId": group_id, "content": "first" } }),
    )
    .await;
    assert_eq!(next_event(&mut bo_ws).await["data"]["content"], "first");
    assert_silent(&mut ana_ws).await;
    assert_eq!(server.fanout.registry().subscriber_count(&room), 1);

    // 重新连接后加入新群组的房间
    ana_ws.close(None).await.unwrap();
    wait_for_subscribers(&server, &RoomKey::group(home), 0).await;
    let mut ana_ws = connect(&server, ana).await;
    wait_for_subscribers(&server, &room, 2).await;

    send(
        &mut bo_ws,
        json!({ "event": "send-message", "data": { "groupId": group_id, "content": "second" } }),
    )
    .await;
    let event = next_event(&mut ana_ws).await;
    assert_eq!(event["event"], "new-message");
    assert_eq!(event["data"]["content"], "second");
    assert_eq!(event["data"]["user"]["username"], "bo");
}
