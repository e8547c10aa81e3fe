use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::connection::ConnectionHandle;
use super::fanout::Fanout;
use super::store::RealtimeStore;

const GROUP_ROOM_PREFIX: &str = "group:";

/// 房间键，群组房间为 `group:{groupId}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn group(group_id: Uuid) -> Self {
        Self(format!("{}{}", GROUP_ROOM_PREFIX, group_id))
    }

    /// 从跨进程通道收到的原始键
    pub fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 连接建立时解析一次用户所属群组并加入对应房间
pub struct RoomMembershipManager {
    store: Arc<dyn RealtimeStore>,
    fanout: Arc<dyn Fanout>,
}

impl RoomMembershipManager {
    pub fn new(store: Arc<dyn RealtimeStore>, fanout: Arc<dyn Fanout>) -> Self {
        Self { store, fanout }
    }

    /// 查询失败时记录日志并返回空集合：连接保持打开，但收不到任何群组事件，直到重连
    pub async fn join_rooms(&self, user_id: Uuid, conn: &ConnectionHandle) -> HashSet<RoomKey> {
        let group_ids = match self.store.group_ids_for_user(user_id).await {
            Ok(group_ids) => group_ids,
            Err(e) => {
                tracing::error!(%user_id, conn_id = %conn.id, error = %e, "Failed to load group memberships");
                return HashSet::new();
            }
        };

        group_ids
            .into_iter()
            .map(|group_id| {
                let room = RoomKey::group(group_id);
                self.fanout.subscribe(room.clone(), conn);
                tracing::debug!(%user_id, %room, "Joined room");
                room
            })
            .collect()
    }
}
