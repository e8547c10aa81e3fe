use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "trip_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    Planned,
    Active,
    Ended,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Planned => "planned",
            TripStatus::Active => "active",
            TripStatus::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub status: TripStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTripRequest {
    pub name: String,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTripRequest {
    pub status: TripStatus,
}

impl Trip {
    pub async fn create(
        pool: &PgPool,
        group_id: Uuid,
        req: &CreateTripRequest,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Trip>(
            r#"
            INSERT INTO trips (id, group_id, name, status, start_time)
            VALUES ($1, $2, $3, 'planned', $4)
            RETURNING id, group_id, name, status, start_time, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(group_id)
        .bind(req.name.trim())
        .bind(req.start_time)
        .fetch_one(pool)
        .await
    }

    pub async fn list_for_group(pool: &PgPool, group_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Trip>(
            r#"
            SELECT id, group_id, name, status, start_time, created_at, updated_at
            FROM trips
            WHERE group_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(group_id)
        .fetch_all(pool)
        .await
    }

    /// 行程必须属于该群组，否则返回 `None`。不校验状态迁移。
    pub async fn set_status(
        pool: &PgPool,
        trip_id: Uuid,
        group_id: Uuid,
        status: TripStatus,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Trip>(
            r#"
            UPDATE trips
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND group_id = $3
            RETURNING id, group_id, name, status, start_time, created_at, updated_at
            "#,
        )
        .bind(status)
        .bind(trip_id)
        .bind(group_id)
        .fetch_optional(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        for status in [TripStatus::Planned, TripStatus::Active, TripStatus::Ended] {
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
    }
}
