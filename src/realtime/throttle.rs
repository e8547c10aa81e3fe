//! 位置节流缓存
//!
//! 每个群组在一个窗口内只保留每个用户的最新位置，窗口到期时把整份快照作为一条
//! `locations-update` 广播出去。无论上报频率多高，每个群组每个窗口最多一条出站消息。
//!
//! 所有对缓存的修改都是持锁的同步步骤，锁从不跨越 await。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::events::{ServerEvent, UserLocation};
use super::fanout::Fanout;
use super::rooms::RoomKey;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(2000);

struct PendingSample {
    seq: u64,
    sample: UserLocation,
}

/// 一个群组当前打开的窗口；`generation` 让过期的定时器认出自己已不属于当前窗口
struct Window {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct ThrottleState {
    samples: HashMap<Uuid, HashMap<Uuid, PendingSample>>,
    windows: HashMap<Uuid, Window>,
    next_seq: u64,
    next_generation: u64,
}

struct Inner {
    state: Mutex<ThrottleState>,
    fanout: Arc<dyn Fanout>,
    interval: Duration,
}

#[derive(Clone)]
pub struct LocationThrottle {
    inner: Arc<Inner>,
}

impl LocationThrottle {
    pub fn new(fanout: Arc<dyn Fanout>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ThrottleState::default()),
                fanout,
                interval,
            }),
        }
    }

    /// 写入样本（同一用户后写覆盖先写）。若该群组没有待执行的窗口则新开一个，返回是否新开。
    pub fn upsert(&self, group_id: Uuid, sample: UserLocation) -> bool {
        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let group = state.samples.entry(group_id).or_default();
        match group.get_mut(&sample.user_id) {
            // 保留首次出现的顺序
            Some(pending) => pending.sample = sample,
            None => {
                group.insert(sample.user_id, PendingSample { seq, sample });
            }
        }

        if state.windows.contains_key(&group_id) {
            return false;
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let inner = self.inner.clone();
        let interval = self.inner.interval;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            inner.flush(group_id, Some(generation)).await;
        });
        state.windows.insert(group_id, Window { generation, timer });
        tracing::trace!(%group_id, ?interval, "Opened location window");
        true
    }

    /// 立即结束该群组的窗口并取消它的定时器。没有待发送样本时不广播。
    pub async fn flush(&self, group_id: Uuid) -> bool {
        self.inner.flush(group_id, None).await
    }

    pub fn has_pending_window(&self, group_id: Uuid) -> bool {
        self.inner.state.lock().windows.contains_key(&group_id)
    }

    pub fn pending_samples(&self, group_id: Uuid) -> usize {
        self.inner
            .state
            .lock()
            .samples
            .get(&group_id)
            .map_or(0, HashMap::len)
    }
}

impl Inner {
    /// `generation` 为 `Some` 时由窗口自己的定时器调用，只结束同一代的窗口；
    /// 为 `None` 时是外部主动结束，顺带取消挂起的定时器。
    async fn flush(&self, group_id: Uuid, generation: Option<u64>) -> bool {
        // 样本和窗口在同一个临界区内取出，之后到达的样本会开启新窗口
        let pending = {
            let mut state = self.state.lock();
            let current = state.windows.get(&group_id).map(|w| w.generation);
            if generation.is_some() && generation != current {
                tracing::trace!(%group_id, "Stale location timer ignored");
                return false;
            }
            if let Some(window) = state.windows.remove(&group_id) {
                if generation.is_none() {
                    window.timer.abort();
                }
            }
            state.samples.remove(&group_id)
        };

        let Some(pending) = pending.filter(|samples| !samples.is_empty()) else {
            return false;
        };

        let mut pending: Vec<PendingSample> = pending.into_values().collect();
        pending.sort_by_key(|p| p.seq);
        let locations: Vec<UserLocation> = pending.into_iter().map(|p| p.sample).collect();
        let count = locations.len();

        let room = RoomKey::group(group_id);
        match self
            .fanout
            .publish(&room, &ServerEvent::LocationsUpdate(locations))
            .await
        {
            Ok(()) => {
                tracing::debug!(%group_id, users = count, "Flushed location window");
                true
            }
            Err(e) => {
                tracing::warn!(%group_id, users = count, error = %e, "Failed to broadcast locations");
                false
            }
        }
    }
}
