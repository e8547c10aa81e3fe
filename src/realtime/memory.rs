//! 进程内存储实现，用于测试和不依赖数据库的本地运行

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::events::{Location, MessageAuthor};
use super::store::{RealtimeStore, StoreError, StoredMessage, TripRecord};
use crate::routes::trip::model::TripStatus;

#[derive(Default)]
struct MemoryState {
    usernames: HashMap<Uuid, String>,
    memberships: HashSet<(Uuid, Uuid)>,
    messages: Vec<StoredMessage>,
    trips: HashMap<Uuid, TripRecord>,
    last_locations: HashMap<Uuid, Location>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    location_writes_fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, username: &str) -> Uuid {
        let user_id = Uuid::new_v4();
        self.state
            .lock()
            .usernames
            .insert(user_id, username.to_string());
        user_id
    }

    pub fn add_member(&self, group_id: Uuid, user_id: Uuid) {
        self.state.lock().memberships.insert((group_id, user_id));
    }

    pub fn remove_member(&self, group_id: Uuid, user_id: Uuid) {
        self.state.lock().memberships.remove(&(group_id, user_id));
    }

    pub fn add_trip(&self, group_id: Uuid, name: &str) -> Uuid {
        let trip_id = Uuid::new_v4();
        self.state.lock().trips.insert(
            trip_id,
            TripRecord {
                id: trip_id,
                group_id,
                name: name.to_string(),
                status: TripStatus::Planned,
            },
        );
        trip_id
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.state.lock().messages.clone()
    }

    pub fn trip_status(&self, trip_id: Uuid) -> Option<TripStatus> {
        self.state.lock().trips.get(&trip_id).map(|trip| trip.status)
    }

    pub fn last_location(&self, user_id: Uuid) -> Option<Location> {
        self.state.lock().last_locations.get(&user_id).copied()
    }

    /// 模拟存储整体不可用
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 仅让最后位置写入失败
    pub fn fail_location_writes(&self, fail: bool) {
        self.location_writes_fail.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn group_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .memberships
            .iter()
            .filter(|(_, member)| *member == user_id)
            .map(|(group_id, _)| *group_id)
            .collect())
    }

    async fn is_group_member(&self, user_id: Uuid, group_id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().memberships.contains(&(group_id, user_id)))
    }

    async fn create_message(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let username = state
            .usernames
            .get(&user_id)
            .cloned()
            .ok_or_else(|| StoreError::Unavailable(format!("unknown user {}", user_id)))?;
        let message = StoredMessage {
            id: Uuid::new_v4(),
            content: content.to_string(),
            created_at: Utc::now(),
            group_id,
            author: MessageAuthor {
                id: user_id,
                username,
            },
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn username(&self, user_id: Uuid) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().usernames.get(&user_id).cloned())
    }

    async fn set_trip_status(
        &self,
        trip_id: Uuid,
        group_id: Uuid,
        status: TripStatus,
    ) -> Result<Option<TripRecord>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        Ok(state
            .trips
            .get_mut(&trip_id)
            .filter(|trip| trip.group_id == group_id)
            .map(|trip| {
                trip.status = status;
                trip.clone()
            }))
    }

    async fn update_last_location(
        &self,
        user_id: Uuid,
        location: Location,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if self.location_writes_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("location write rejected".into()));
        }
        self.state.lock().last_locations.insert(user_id, location);
        Ok(())
    }
}
