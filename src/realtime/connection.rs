use std::collections::HashSet;
use std::fmt;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::RealtimeHub;
use super::auth::ConnectionIdentity;
use super::fanout::{Frame, FrameSender};
use super::rooms::RoomKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 订阅表里登记的连接：标识加出站队列
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub sender: FrameSender,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                sender,
            },
            receiver,
        )
    }
}

/// 单个连接的上下文，只由连接任务持有，从不持久化
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    id: ConnectionId,
    user_id: Uuid,
    rooms: HashSet<RoomKey>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, user_id: Uuid, rooms: HashSet<RoomKey>) -> Self {
        Self { id, user_id, rooms }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// 握手时写入，连接存续期间不可变
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn rooms(&self) -> &HashSet<RoomKey> {
        &self.rooms
    }

    pub fn in_room(&self, room: &RoomKey) -> bool {
        self.rooms.contains(room)
    }
}

/// `GET /ws`：身份在升级前校验，失败直接 401，不会进入事件分发
pub async fn ws_handler(
    ConnectionIdentity(user_id): ConnectionIdentity,
    State(hub): State<RealtimeHub>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub, user_id))
}

async fn handle_socket(socket: WebSocket, hub: RealtimeHub, user_id: Uuid) {
    let (handle, mut outbound) = ConnectionHandle::new();
    let conn_id = handle.id;
    tracing::info!(%conn_id, %user_id, "Authenticated client connected");

    let rooms = hub.membership().join_rooms(user_id, &handle).await;
    let ctx = ConnectionContext::new(conn_id, user_id, rooms);

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // 同一连接的事件按到达顺序逐个处理
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => hub.dispatcher().dispatch(&ctx, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    // 断开只停止后续事件的接收，已派发的处理不会被取消
    hub.fanout().unsubscribe_all(conn_id);
    drop(handle);
    writer.abort();
    tracing::info!(%conn_id, %user_id, "Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_reports_room_membership() {
        let group_id = Uuid::new_v4();
        let rooms = HashSet::from([RoomKey::group(group_id)]);
        let ctx = ConnectionContext::new(ConnectionId::new(), Uuid::new_v4(), rooms);
        assert!(ctx.in_room(&RoomKey::group(group_id)));
        assert!(!ctx.in_room(&RoomKey::group(Uuid::new_v4())));
    }
}
