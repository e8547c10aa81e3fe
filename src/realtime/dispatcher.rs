//! 入站事件分发
//!
//! 每种事件对应一个处理函数。处理函数内部用 `?` 传播错误，在 `dispatch` 边界统一记录日志后
//! 丢弃该事件：错误从不回传给发送方，也不会断开连接。

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use super::connection::ConnectionContext;
use super::events::{
    ClientEvent, Location, SendMessagePayload, ServerEvent, TripEndedPayload, TripPayload,
    TripStartedPayload, UpdateLocationPayload, UserLocation,
};
use super::fanout::{Fanout, FanoutError};
use super::rooms::RoomKey;
use super::store::{RealtimeStore, StoreError};
use super::throttle::LocationThrottle;
use crate::routes::trip::model::TripStatus;

#[derive(Debug, Error)]
enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fanout(#[from] FanoutError),
}

pub struct EventDispatcher {
    store: Arc<dyn RealtimeStore>,
    fanout: Arc<dyn Fanout>,
    throttle: LocationThrottle,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<dyn RealtimeStore>,
        fanout: Arc<dyn Fanout>,
        throttle: LocationThrottle,
    ) -> Self {
        Self {
            store,
            fanout,
            throttle,
        }
    }

    pub fn throttle(&self) -> &LocationThrottle {
        &self.throttle
    }

    /// 处理一帧原始文本。形状不符的帧直接丢弃。
    pub async fn dispatch(&self, ctx: &ConnectionContext, frame: &str) {
        let event = match ClientEvent::parse(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(conn_id = %ctx.id(), error = %e, "Dropping malformed frame");
                return;
            }
        };
        let name = event.name();

        let result = match event {
            ClientEvent::SendMessage(payload) => self.send_message(ctx, payload).await,
            ClientEvent::UpdateLocation(payload) => self.update_location(ctx, payload).await,
            ClientEvent::StartTrip(payload) => {
                self.change_trip_status(ctx, payload, TripStatus::Active).await
            }
            ClientEvent::EndTrip(payload) => {
                self.change_trip_status(ctx, payload, TripStatus::Ended).await
            }
        };

        if let Err(e) = result {
            tracing::error!(
                conn_id = %ctx.id(),
                user_id = %ctx.user_id(),
                event = name,
                error = %e,
                "Error handling event"
            );
        }
    }

    async fn send_message(
        &self,
        ctx: &ConnectionContext,
        payload: SendMessagePayload,
    ) -> Result<(), HandlerError> {
        let user_id = ctx.user_id();
        let group_id = payload.group_id;

        // 每条消息都重新校验成员关系；不是成员时静默丢弃，不区分群组是否存在
        if !self.store.is_group_member(user_id, group_id).await? {
            tracing::debug!(%user_id, %group_id, "Dropping message from non-member");
            return Ok(());
        }

        let message = self
            .store
            .create_message(group_id, user_id, &payload.content)
            .await?;
        let room = RoomKey::group(group_id);
        self.fanout
            .publish(&room, &ServerEvent::NewMessage(message.into()))
            .await?;
        Ok(())
    }

    async fn update_location(
        &self,
        ctx: &ConnectionContext,
        payload: UpdateLocationPayload,
    ) -> Result<(), HandlerError> {
        let user_id = ctx.user_id();
        let UpdateLocationPayload {
            group_id,
            trip_id,
            location,
        } = payload;

        if !ctx.in_room(&RoomKey::group(group_id)) {
            tracing::debug!(%user_id, %group_id, "Dropping location for unjoined room");
            return Ok(());
        }

        let Some(username) = self.store.username(user_id).await? else {
            tracing::debug!(%user_id, "Dropping location from unknown user");
            return Ok(());
        };

        let opened = self.throttle.upsert(
            group_id,
            UserLocation {
                user_id,
                username,
                location,
            },
        );
        tracing::trace!(%user_id, %group_id, %trip_id, opened, "Cached location sample");

        self.persist_last_location(user_id, location);
        Ok(())
    }

    /// 发出即不等待；失败只记录日志
    fn persist_last_location(&self, user_id: Uuid, location: Location) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_last_location(user_id, location).await {
                tracing::warn!(%user_id, error = %e, "Failed to persist last known location");
            }
        });
    }

    /// 开始与结束行程只要求连接在该群组房间内，任何成员都可以控制任何行程
    async fn change_trip_status(
        &self,
        ctx: &ConnectionContext,
        payload: TripPayload,
        status: TripStatus,
    ) -> Result<(), HandlerError> {
        let TripPayload { group_id, trip_id } = payload;
        let room = RoomKey::group(group_id);

        if !ctx.in_room(&room) {
            tracing::debug!(user_id = %ctx.user_id(), %group_id, "Dropping trip event for unjoined room");
            return Ok(());
        }

        let Some(trip) = self
            .store
            .set_trip_status(trip_id, group_id, status)
            .await?
        else {
            tracing::debug!(%trip_id, %group_id, "Trip not found in group");
            return Ok(());
        };

        let event = match status {
            TripStatus::Active => ServerEvent::TripStarted(TripStartedPayload {
                trip_id: trip.id,
                group_id: trip.group_id,
                name: trip.name,
            }),
            _ => ServerEvent::TripEnded(TripEndedPayload {
                trip_id: trip.id,
                group_id: trip.group_id,
            }),
        };
        tracing::info!(%trip_id, %group_id, status = status.as_str(), "Trip status changed");
        self.fanout.publish(&room, &event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::connection::{ConnectionHandle, ConnectionId};
    use crate::realtime::fanout::{Frame, LocalFanout};
    use crate::realtime::memory::MemoryStore;
    use crate::realtime::throttle::DEFAULT_FLUSH_INTERVAL;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        store: Arc<MemoryStore>,
        dispatcher: EventDispatcher,
        group_id: Uuid,
        member: ConnectionContext,
        member_id: Uuid,
        listener: mpsc::UnboundedReceiver<Frame>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let fanout = Arc::new(LocalFanout::new());
        let group_id = Uuid::new_v4();
        let member_id = store.add_user("ana");
        store.add_member(group_id, member_id);

        let (listener_conn, listener) = ConnectionHandle::new();
        fanout.subscribe(RoomKey::group(group_id), &listener_conn);

        let throttle = LocationThrottle::new(fanout.clone(), DEFAULT_FLUSH_INTERVAL);
        let dispatcher = EventDispatcher::new(store.clone(), fanout, throttle);
        let member = ConnectionContext::new(
            ConnectionId::new(),
            member_id,
            HashSet::from([RoomKey::group(group_id)]),
        );

        Harness {
            store,
            dispatcher,
            group_id,
            member,
            member_id,
            listener,
        }
    }

    fn decode(frame: Frame) -> ServerEvent {
        serde_json::from_str(&frame).unwrap()
    }

    fn message_frame(group_id: Uuid, content: &str) -> String {
        json!({ "event": "send-message", "data": { "groupId": group_id, "content": content } })
            .to_string()
    }

    fn trip_frame(event: &str, group_id: Uuid, trip_id: Uuid) -> String {
        json!({ "event": event, "data": { "groupId": group_id, "tripId": trip_id } }).to_string()
    }

    fn location_frame(group_id: Uuid, lat: f64) -> String {
        json!({
            "event": "update-location",
            "data": {
                "groupId": group_id,
                "tripId": Uuid::new_v4(),
                "location": { "lat": lat, "lon": 4.0 }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn member_message_is_persisted_and_broadcast() {
        let mut h = harness();
        h.dispatcher
            .dispatch(&h.member, &message_frame(h.group_id, "hello"))
            .await;

        let stored = h.store.messages();
        assert_eq!(stored.len(), 1);
        match decode(h.listener.recv().await.unwrap()) {
            ServerEvent::NewMessage(payload) => {
                assert_eq!(payload.id, stored[0].id);
                assert_eq!(payload.content, "hello");
                assert_eq!(payload.group_id, h.group_id);
                assert_eq!(payload.user.id, h.member_id);
                assert_eq!(payload.user.username, "ana");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_member_message_is_silently_dropped() {
        let mut h = harness();
        let outsider_id = h.store.add_user("eve");
        // 即便连接声称在房间里，也以存储中的成员关系为准
        let outsider = ConnectionContext::new(
            ConnectionId::new(),
            outsider_id,
            HashSet::from([RoomKey::group(h.group_id)]),
        );

        h.dispatcher
            .dispatch(&outsider, &message_frame(h.group_id, "let me in"))
            .await;

        assert!(h.store.messages().is_empty());
        assert!(h.listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn member_removed_mid_session_can_no_longer_send() {
        let mut h = harness();
        h.store.remove_member(h.group_id, h.member_id);

        h.dispatcher
            .dispatch(&h.member, &message_frame(h.group_id, "still here?"))
            .await;

        assert!(h.store.messages().is_empty());
        assert!(h.listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn storage_outage_drops_message_without_panicking() {
        let mut h = harness();
        h.store.set_unavailable(true);

        h.dispatcher
            .dispatch(&h.member, &message_frame(h.group_id, "hello"))
            .await;

        assert!(h.listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_then_end_trip_broadcasts_in_order() {
        let mut h = harness();
        let trip_id = h.store.add_trip(h.group_id, "Alps");
        assert_eq!(h.store.trip_status(trip_id), Some(TripStatus::Planned));

        h.dispatcher
            .dispatch(&h.member, &trip_frame("start-trip", h.group_id, trip_id))
            .await;
        assert_eq!(h.store.trip_status(trip_id), Some(TripStatus::Active));

        h.dispatcher
            .dispatch(&h.member, &trip_frame("end-trip", h.group_id, trip_id))
            .await;
        assert_eq!(h.store.trip_status(trip_id), Some(TripStatus::Ended));

        assert_eq!(
            decode(h.listener.recv().await.unwrap()),
            ServerEvent::TripStarted(TripStartedPayload {
                trip_id,
                group_id: h.group_id,
                name: "Alps".into(),
            })
        );
        assert_eq!(
            decode(h.listener.recv().await.unwrap()),
            ServerEvent::TripEnded(TripEndedPayload {
                trip_id,
                group_id: h.group_id,
            })
        );
    }

    #[tokio::test]
    async fn trip_from_another_group_is_ignored() {
        let mut h = harness();
        let foreign_trip = h.store.add_trip(Uuid::new_v4(), "Elsewhere");

        h.dispatcher
            .dispatch(&h.member, &trip_frame("start-trip", h.group_id, foreign_trip))
            .await;

        assert_eq!(h.store.trip_status(foreign_trip), Some(TripStatus::Planned));
        assert!(h.listener.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn location_updates_are_coalesced_and_persisted() {
        let mut h = harness();

        h.dispatcher
            .dispatch(&h.member, &location_frame(h.group_id, 10.0))
            .await;
        h.dispatcher
            .dispatch(&h.member, &location_frame(h.group_id, 11.0))
            .await;
        assert_eq!(h.dispatcher.throttle().pending_samples(h.group_id), 1);
        assert!(h.listener.try_recv().is_err());

        tokio::time::sleep(DEFAULT_FLUSH_INTERVAL + Duration::from_millis(1)).await;
        match decode(h.listener.recv().await.unwrap()) {
            ServerEvent::LocationsUpdate(locations) => {
                assert_eq!(locations.len(), 1);
                assert_eq!(locations[0].user_id, h.member_id);
                assert_eq!(locations[0].username, "ana");
                assert_eq!(locations[0].location.lat, 11.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            h.store.last_location(h.member_id),
            Some(Location { lat: 11.0, lon: 4.0 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_location_write_still_broadcasts() {
        let mut h = harness();
        h.store.fail_location_writes(true);

        h.dispatcher
            .dispatch(&h.member, &location_frame(h.group_id, 10.0))
            .await;

        tokio::time::sleep(DEFAULT_FLUSH_INTERVAL + Duration::from_millis(1)).await;
        assert!(matches!(
            decode(h.listener.recv().await.unwrap()),
            ServerEvent::LocationsUpdate(_)
        ));
        assert_eq!(h.store.last_location(h.member_id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn location_for_unjoined_room_is_dropped() {
        let h = harness();
        let other_group = Uuid::new_v4();

        h.dispatcher
            .dispatch(&h.member, &location_frame(other_group, 10.0))
            .await;

        assert_eq!(h.dispatcher.throttle().pending_samples(other_group), 0);
        assert!(!h.dispatcher.throttle().has_pending_window(other_group));
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let mut h = harness();
        h.dispatcher.dispatch(&h.member, "{\"event\":\"send-message\"}").await;
        h.dispatcher.dispatch(&h.member, "garbage").await;

        assert!(h.store.messages().is_empty());
        assert!(h.listener.try_recv().is_err());
    }
}
