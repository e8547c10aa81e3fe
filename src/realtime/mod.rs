//! 实时在线与广播层
//!
//! 握手鉴权、房间加入、入站事件分发、位置节流与房间广播。

pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod fanout;
pub mod memory;
pub mod rooms;
pub mod store;
pub mod throttle;

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};

use auth::ConnectionAuthenticator;
use dispatcher::EventDispatcher;
use fanout::Fanout;
use rooms::RoomMembershipManager;
use store::RealtimeStore;
use throttle::LocationThrottle;

struct HubInner {
    authenticator: ConnectionAuthenticator,
    membership: RoomMembershipManager,
    dispatcher: EventDispatcher,
    fanout: Arc<dyn Fanout>,
}

/// 所有连接共享的实时层组件
#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

impl RealtimeHub {
    pub fn new(
        store: Arc<dyn RealtimeStore>,
        fanout: Arc<dyn Fanout>,
        jwt_secret: impl Into<String>,
        flush_interval: Duration,
    ) -> Self {
        let throttle = LocationThrottle::new(fanout.clone(), flush_interval);
        Self {
            inner: Arc::new(HubInner {
                authenticator: ConnectionAuthenticator::new(jwt_secret),
                membership: RoomMembershipManager::new(store.clone(), fanout.clone()),
                dispatcher: EventDispatcher::new(store, fanout.clone(), throttle),
                fanout,
            }),
        }
    }

    pub fn authenticator(&self) -> &ConnectionAuthenticator {
        &self.inner.authenticator
    }

    pub fn membership(&self) -> &RoomMembershipManager {
        &self.inner.membership
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn fanout(&self) -> &Arc<dyn Fanout> {
        &self.inner.fanout
    }
}

/// `GET /ws`
pub fn router(hub: RealtimeHub) -> Router {
    Router::new()
        .route("/ws", get(connection::ws_handler))
        .with_state(hub)
}
