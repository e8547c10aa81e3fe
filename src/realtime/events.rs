//! 连接上的事件帧：`{"event": "<name>", "data": <payload>}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub group_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLocationPayload {
    pub group_id: Uuid,
    pub trip_id: Uuid,
    pub location: Location,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripPayload {
    pub group_id: Uuid,
    pub trip_id: Uuid,
}

/// 客户端发往服务端的事件
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    SendMessage(SendMessagePayload),
    UpdateLocation(UpdateLocationPayload),
    StartTrip(TripPayload),
    EndTrip(TripPayload),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content exceeds the length limit")]
    ContentTooLong,
    #[error("location out of range")]
    InvalidLocation,
}

impl ClientEvent {
    /// 解析并校验一帧；任何不符合形状的帧都在这里被拒绝
    pub fn parse(frame: &str) -> Result<Self, PayloadError> {
        let mut event: ClientEvent = serde_json::from_str(frame)?;
        match &mut event {
            ClientEvent::SendMessage(payload) => {
                let trimmed = payload.content.trim();
                if trimmed.is_empty() {
                    return Err(PayloadError::EmptyContent);
                }
                if trimmed.chars().count() > MAX_MESSAGE_CHARS {
                    return Err(PayloadError::ContentTooLong);
                }
                payload.content = trimmed.to_string();
            }
            ClientEvent::UpdateLocation(payload) => {
                if !payload.location.is_valid() {
                    return Err(PayloadError::InvalidLocation);
                }
            }
            ClientEvent::StartTrip(_) | ClientEvent::EndTrip(_) => {}
        }
        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage(_) => "send-message",
            ClientEvent::UpdateLocation(_) => "update-location",
            ClientEvent::StartTrip(_) => "start-trip",
            ClientEvent::EndTrip(_) => "end-trip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAuthor {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub group_id: Uuid,
    pub user: MessageAuthor,
}

/// 单个用户在一个节流窗口内的最新位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLocation {
    pub user_id: Uuid,
    pub username: String,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripStartedPayload {
    pub trip_id: Uuid,
    pub group_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripEndedPayload {
    pub trip_id: Uuid,
    pub group_id: Uuid,
}

/// 服务端广播给房间订阅者的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage(NewMessagePayload),
    LocationsUpdate(Vec<UserLocation>),
    TripStarted(TripStartedPayload),
    TripEnded(TripEndedPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage(_) => "new-message",
            ServerEvent::LocationsUpdate(_) => "locations-update",
            ServerEvent::TripStarted(_) => "trip-started",
            ServerEvent::TripEnded(_) => "trip-ended",
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_update_location_frame() {
        let group_id = Uuid::new_v4();
        let trip_id = Uuid::new_v4();
        let frame = json!({
            "event": "update-location",
            "data": {
                "groupId": group_id,
                "tripId": trip_id,
                "location": { "lat": 48.85, "lon": 2.35 }
            }
        })
        .to_string();

        match ClientEvent::parse(&frame).unwrap() {
            ClientEvent::UpdateLocation(payload) => {
                assert_eq!(payload.group_id, group_id);
                assert_eq!(payload.trip_id, trip_id);
                assert_eq!(payload.location, Location { lat: 48.85, lon: 2.35 });
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn trims_message_content() {
        let frame = json!({
            "event": "send-message",
            "data": { "groupId": Uuid::new_v4(), "content": "  hello  " }
        })
        .to_string();
        match ClientEvent::parse(&frame).unwrap() {
            ClientEvent::SendMessage(payload) => assert_eq!(payload.content, "hello"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn rejects_shape_mismatches() {
        let cases = [
            "not json".to_string(),
            json!({ "event": "teleport", "data": {} }).to_string(),
            json!({ "event": "start-trip", "data": { "groupId": "nope", "tripId": Uuid::new_v4() } })
                .to_string(),
            json!({ "event": "send-message", "data": { "groupId": Uuid::new_v4() } }).to_string(),
            json!({ "event": "send-message", "data": { "groupId": Uuid::new_v4(), "content": "   " } })
                .to_string(),
            json!({
                "event": "update-location",
                "data": {
                    "groupId": Uuid::new_v4(),
                    "tripId": Uuid::new_v4(),
                    "location": { "lat": 91.0, "lon": 0.0 }
                }
            })
            .to_string(),
        ];
        for frame in cases {
            assert!(ClientEvent::parse(&frame).is_err(), "accepted {}", frame);
        }
    }

    #[test]
    fn rejects_overlong_content() {
        let frame = json!({
            "event": "send-message",
            "data": { "groupId": Uuid::new_v4(), "content": "x".repeat(MAX_MESSAGE_CHARS + 1) }
        })
        .to_string();
        assert!(matches!(
            ClientEvent::parse(&frame),
            Err(PayloadError::ContentTooLong)
        ));
    }

    #[test]
    fn locations_update_serializes_as_array() {
        let user_id = Uuid::new_v4();
        let event = ServerEvent::LocationsUpdate(vec![UserLocation {
            user_id,
            username: "ana".into(),
            location: Location { lat: 1.0, lon: 2.0 },
        }]);
        let value: serde_json::Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(value["event"], "locations-update");
        assert_eq!(value["data"][0]["userId"], user_id.to_string());
        assert_eq!(value["data"][0]["username"], "ana");
        assert_eq!(value["data"][0]["location"]["lon"], 2.0);
    }

    #[test]
    fn new_message_uses_camel_case() {
        let event = ServerEvent::NewMessage(NewMessagePayload {
            id: Uuid::new_v4(),
            content: "hi".into(),
            created_at: Utc::now(),
            group_id: Uuid::new_v4(),
            user: MessageAuthor {
                id: Uuid::new_v4(),
                username: "ana".into(),
            },
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(value["event"], "new-message");
        assert!(value["data"]["createdAt"].is_string());
        assert!(value["data"]["groupId"].is_string());
        assert_eq!(value["data"]["user"]["username"], "ana");
    }
}
