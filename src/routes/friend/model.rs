use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::routes::user::model::UserSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "friendship_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FriendshipStatus {
    Pending,
    Accepted,
    Blocked,
}

#[derive(Debug, Clone, FromRow)]
pub struct Friendship {
    pub user_id_1: Uuid,
    pub user_id_2: Uuid,
    pub status: FriendshipStatus,
    pub action_user_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct IncomingRow {
    id: Uuid,
    username: String,
    status: FriendshipStatus,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestInfo {
    pub from: UserSummary,
    pub status: FriendshipStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestBody {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RespondRequestBody {
    pub status: FriendshipStatus,
}

/// 无序用户对的规范顺序：较小的 id 在前
pub fn ordered_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a < b { (a, b) } else { (b, a) }
}

impl Friendship {
    pub async fn find(pool: &PgPool, a: Uuid, b: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let (first, second) = ordered_pair(a, b);
        sqlx::query_as::<_, Friendship>(
            r#"
            SELECT user_id_1, user_id_2, status, action_user_id, updated_at
            FROM friendships
            WHERE user_id_1 = $1 AND user_id_2 = $2
            "#,
        )
        .bind(first)
        .bind(second)
        .fetch_optional(pool)
        .await
    }

    /// 已存在任意状态的关系时返回 `false`
    pub async fn request(pool: &PgPool, from: Uuid, to: Uuid) -> Result<bool, sqlx::Error> {
        let (first, second) = ordered_pair(from, to);
        let result = sqlx::query(
            r#"
            INSERT INTO friendships (user_id_1, user_id_2, status, action_user_id)
            VALUES ($1, $2, 'pending', $3)
            ON CONFLICT (user_id_1, user_id_2) DO NOTHING
            "#,
        )
        .bind(first)
        .bind(second)
        .bind(from)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// 发给我且尚未处理的请求
    pub async fn incoming_requests(
        pool: &PgPool,
        user_id: Uuid,
    ) -> Result<Vec<FriendRequestInfo>, sqlx::Error> {
        let rows = sqlx::query_as::<_, IncomingRow>(
            r#"
            SELECT u.id, u.username, f.status, f.updated_at
            FROM friendships f
            JOIN users u ON u.id = f.action_user_id
            WHERE (f.user_id_1 = $1 OR f.user_id_2 = $1)
              AND f.status = 'pending'
              AND f.action_user_id <> $1
            ORDER BY f.updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FriendRequestInfo {
                from: UserSummary {
                    id: row.id,
                    username: row.username,
                },
                status: row.status,
                updated_at: row.updated_at,
            })
            .collect())
    }

    /// 只处理对方发来的待定请求；返回是否更新成功
    pub async fn respond(
        pool: &PgPool,
        user_id: Uuid,
        requester: Uuid,
        status: FriendshipStatus,
    ) -> Result<bool, sqlx::Error> {
        let (first, second) = ordered_pair(user_id, requester);
        let result = sqlx::query(
            r#"
            UPDATE friendships
            SET status = $1, action_user_id = $2, updated_at = NOW()
            WHERE user_id_1 = $3 AND user_id_2 = $4
              AND status = 'pending'
              AND action_user_id = $5
            "#,
        )
        .bind(status)
        .bind(user_id)
        .bind(first)
        .bind(second)
        .bind(requester)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn friends_of(pool: &PgPool, user_id: Uuid) -> Result<Vec<UserSummary>, sqlx::Error> {
        sqlx::query_as::<_, UserSummary>(
            r#"
            SELECT u.id, u.username
            FROM friendships f
            JOIN users u
              ON u.id = CASE WHEN f.user_id_1 = $1 THEN f.user_id_2 ELSE f.user_id_1 END
            WHERE (f.user_id_1 = $1 OR f.user_id_2 = $1)
              AND f.status = 'accepted'
            ORDER BY u.username
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }

    pub async fn remove_accepted(pool: &PgPool, a: Uuid, b: Uuid) -> Result<bool, sqlx::Error> {
        let (first, second) = ordered_pair(a, b);
        let result = sqlx::query(
            r#"
            DELETE FROM friendships
            WHERE user_id_1 = $1 AND user_id_2 = $2 AND status = 'accepted'
            "#,
        )
        .bind(first)
        .bind(second)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(ordered_pair(a, b), ordered_pair(b, a));
        let (first, second) = ordered_pair(a, b);
        assert!(first < second);
    }
}
