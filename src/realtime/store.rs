use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::events::{Location, MessageAuthor, NewMessagePayload};
use crate::routes::{
    group::model::GroupMember,
    message::model::Message,
    trip::model::{Trip, TripStatus},
    user::model::User,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub group_id: Uuid,
    pub author: MessageAuthor,
}

impl From<StoredMessage> for NewMessagePayload {
    fn from(message: StoredMessage) -> Self {
        Self {
            id: message.id,
            content: message.content,
            created_at: message.created_at,
            group_id: message.group_id,
            user: message.author,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TripRecord {
    pub id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub status: TripStatus,
}

/// 实时层依赖的存储协作方。每个调用都可能失败或超时，由调用方记录日志后丢弃事件。
#[async_trait]
pub trait RealtimeStore: Send + Sync + 'static {
    /// 用户当前所在的全部群组
    async fn group_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    async fn is_group_member(&self, user_id: Uuid, group_id: Uuid) -> Result<bool, StoreError>;

    /// 持久化聊天消息，返回服务端分配的 id 和时间戳
    async fn create_message(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> Result<StoredMessage, StoreError>;

    async fn username(&self, user_id: Uuid) -> Result<Option<String>, StoreError>;

    /// 按 (trip_id, group_id) 更新行程状态；该组合不存在时返回 `None`
    async fn set_trip_status(
        &self,
        trip_id: Uuid,
        group_id: Uuid,
        status: TripStatus,
    ) -> Result<Option<TripRecord>, StoreError>;

    async fn update_last_location(
        &self,
        user_id: Uuid,
        location: Location,
    ) -> Result<(), StoreError>;
}

/// 基于 Postgres 的实现，复用各路由模块里的查询
#[derive(Clone)]
pub struct PgRealtimeStore {
    pool: PgPool,
}

impl PgRealtimeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RealtimeStore for PgRealtimeStore {
    async fn group_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(GroupMember::group_ids_for_user(&self.pool, user_id).await?)
    }

    async fn is_group_member(&self, user_id: Uuid, group_id: Uuid) -> Result<bool, StoreError> {
        Ok(GroupMember::find(&self.pool, group_id, user_id)
            .await?
            .is_some())
    }

    async fn create_message(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let message = Message::create(&self.pool, group_id, user_id, content).await?;
        Ok(StoredMessage {
            id: message.id,
            content: message.content,
            created_at: message.created_at,
            group_id: message.group_id,
            author: MessageAuthor {
                id: message.user_id,
                username: message.username,
            },
        })
    }

    async fn username(&self, user_id: Uuid) -> Result<Option<String>, StoreError> {
        Ok(User::find_username(&self.pool, user_id).await?)
    }

    async fn set_trip_status(
        &self,
        trip_id: Uuid,
        group_id: Uuid,
        status: TripStatus,
    ) -> Result<Option<TripRecord>, StoreError> {
        let trip = Trip::set_status(&self.pool, trip_id, group_id, status).await?;
        Ok(trip.map(|trip| TripRecord {
            id: trip.id,
            group_id: trip.group_id,
            name: trip.name,
            status: trip.status,
        }))
    }

    async fn update_last_location(
        &self,
        user_id: Uuid,
        location: Location,
    ) -> Result<(), StoreError> {
        User::update_last_location(&self.pool, user_id, location.lat, location.lon).await?;
        Ok(())
    }
}
