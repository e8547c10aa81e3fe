use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::realtime::events::{MessageAuthor, NewMessagePayload};

#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// 历史消息与实时推送使用同一结构
impl From<Message> for NewMessagePayload {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            content: message.content,
            created_at: message.created_at,
            group_id: message.group_id,
            user: MessageAuthor {
                id: message.user_id,
                username: message.username,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<NewMessagePayload>,
    pub current_page: i64,
    pub total_pages: i64,
}

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// 页码从 1 开始；每页条数限制在 1..=100
pub fn normalize_paging(page: Option<i64>, limit: Option<i64>) -> Result<(i64, i64), &'static str> {
    let page = page.unwrap_or(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if page < 1 {
        return Err("页码必须大于等于1");
    }
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err("每页条数必须在1到100之间");
    }
    Ok((page, limit))
}

pub fn total_pages(total: i64, limit: i64) -> i64 {
    (total + limit - 1) / limit
}

impl Message {
    /// 写入消息并带回作者用户名
    pub async fn create(
        pool: &PgPool,
        group_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            WITH inserted AS (
                INSERT INTO messages (id, group_id, user_id, content)
                VALUES ($1, $2, $3, $4)
                RETURNING id, group_id, user_id, content, created_at
            )
            SELECT i.id, i.group_id, i.user_id, u.username, i.content, i.created_at
            FROM inserted i
            JOIN users u ON u.id = i.user_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(group_id)
        .bind(user_id)
        .bind(content)
        .fetch_one(pool)
        .await
    }

    /// 按页从新到旧取，页内再按时间正序返回
    pub async fn history(
        pool: &PgPool,
        group_id: Uuid,
        page: i64,
        limit: i64,
    ) -> Result<MessagePage, sqlx::Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE group_id = $1")
            .bind(group_id)
            .fetch_one(pool)
            .await?;

        let mut rows = sqlx::query_as::<_, Message>(
            r#"
            SELECT m.id, m.group_id, m.user_id, u.username, m.content, m.created_at
            FROM messages m
            JOIN users u ON u.id = m.user_id
            WHERE m.group_id = $1
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(group_id)
        .bind(limit)
        .bind((page - 1).saturating_mul(limit))
        .fetch_all(pool)
        .await?;
        rows.reverse();

        Ok(MessagePage {
            messages: rows.into_iter().map(NewMessagePayload::from).collect(),
            current_page: page,
            total_pages: total_pages(total, limit),
        })
    }
}
