//! 房间广播：本进程内的订阅表，加上可替换的跨进程发布通道

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::{AsyncCommands, Client as RedisClient, aio::MultiplexedConnection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::{ConnectionHandle, ConnectionId};
use super::events::ServerEvent;
use super::rooms::RoomKey;

/// 已序列化的出站帧，在同一房间的所有连接之间共享
pub type Frame = Arc<str>;
pub type FrameSender = mpsc::UnboundedSender<Frame>;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("redis publish failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// 本进程持有的连接订阅表
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomKey, HashMap<ConnectionId, FrameSender>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room: RoomKey, conn: &ConnectionHandle) {
        self.rooms
            .write()
            .entry(room)
            .or_default()
            .insert(conn.id, conn.sender.clone());
    }

    pub fn leave_all(&self, conn_id: ConnectionId) {
        let mut rooms = self.rooms.write();
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    /// 投递给房间内的本地连接，返回成功投递的连接数
    pub fn deliver(&self, room: &RoomKey, frame: Frame) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let rooms = self.rooms.read();
            let Some(members) = rooms.get(room) else {
                return 0;
            };
            for (conn_id, sender) in members {
                if sender.send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*conn_id);
                }
            }
        }

        for conn_id in closed {
            tracing::debug!(%conn_id, "Dropping closed connection from registry");
            self.leave_all(conn_id);
        }
        delivered
    }

    pub fn subscriber_count(&self, room: &RoomKey) -> usize {
        self.rooms.read().get(room).map_or(0, HashMap::len)
    }

    pub fn rooms_of(&self, conn_id: ConnectionId) -> Vec<RoomKey> {
        self.rooms
            .read()
            .iter()
            .filter(|(_, members)| members.contains_key(&conn_id))
            .map(|(room, _)| room.clone())
            .collect()
    }
}

/// 广播原语：订阅与发布。核心逻辑不关心投递是否跨进程。
#[async_trait]
pub trait Fanout: Send + Sync + 'static {
    fn registry(&self) -> &RoomRegistry;

    fn subscribe(&self, room: RoomKey, conn: &ConnectionHandle) {
        self.registry().join(room, conn);
    }

    fn unsubscribe_all(&self, conn_id: ConnectionId) {
        self.registry().leave_all(conn_id);
    }

    async fn publish(&self, room: &RoomKey, event: &ServerEvent) -> Result<(), FanoutError>;
}

/// 单实例部署：直接投递到本地订阅表
#[derive(Default)]
pub struct LocalFanout {
    registry: RoomRegistry,
}

impl LocalFanout {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fanout for LocalFanout {
    fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    async fn publish(&self, room: &RoomKey, event: &ServerEvent) -> Result<(), FanoutError> {
        let frame: Frame = event.to_frame()?.into();
        let delivered = self.registry.deliver(room, frame);
        tracing::trace!(%room, event = event.name(), delivered, "Published locally");
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    room: String,
    frame: String,
}

/// 多实例部署：经 Redis 频道发布，每个进程的监听任务负责本地投递
pub struct RedisFanout {
    registry: Arc<RoomRegistry>,
    redis: Arc<RedisClient>,
    channel: String,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisFanout {
    pub fn new(redis: Arc<RedisClient>, channel: impl Into<String>) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            redis,
            channel: channel.into(),
            connection: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = self.redis.get_multiplexed_async_connection().await?;
        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    /// 订阅频道并把收到的帧投递给本地连接；订阅断开后按固定间隔重连
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let redis = self.redis.clone();
        let channel = self.channel.clone();

        tokio::spawn(async move {
            loop {
                match listen(&redis, &channel, &registry).await {
                    Ok(()) => tracing::warn!(%channel, "Fanout subscription closed"),
                    Err(e) => tracing::error!(%channel, error = %e, "Fanout subscription failed"),
                }
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
            }
        })
    }
}

async fn listen(
    redis: &RedisClient,
    channel: &str,
    registry: &RoomRegistry,
) -> Result<(), redis::RedisError> {
    let mut pubsub = redis.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::info!(%channel, "Subscribed to fanout channel");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable fanout payload");
                continue;
            }
        };
        match serde_json::from_str::<Envelope>(&payload) {
            Ok(envelope) => {
                let room = RoomKey::from_raw(envelope.room);
                registry.deliver(&room, envelope.frame.into());
            }
            Err(e) => tracing::warn!(error = %e, "Malformed fanout envelope"),
        }
    }
    Ok(())
}

#[async_trait]
impl Fanout for RedisFanout {
    fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    async fn publish(&self, room: &RoomKey, event: &ServerEvent) -> Result<(), FanoutError> {
        let envelope = serde_json::to_string(&Envelope {
            room: room.to_string(),
            frame: event.to_frame()?,
        })?;

        let mut conn = self.connection().await?;
        let result: Result<i64, redis::RedisError> = conn.publish(&self.channel, envelope).await;
        match result {
            Ok(receivers) => {
                tracing::trace!(%room, event = event.name(), receivers, "Published to redis");
                Ok(())
            }
            Err(e) => {
                // 连接可能已失效，下次重新建立
                *self.connection.lock() = None;
                Err(e.into())
            }
        }
    }
}
