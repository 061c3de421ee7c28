use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::error::{MeshError, Result};
use crate::model::{PendingMasterAction, TabDescriptor};
use crate::state::{SharedState, StateDelta, StateSnapshot};
use crate::store::channel::{Channel, check_gap};
use crate::tab_id::TabId;

#[derive(Debug, Default)]
struct Inner {
    tabs: BTreeMap<TabId, TabDescriptor>,
    pending: BTreeMap<TabId, PendingMasterAction>,
    deltas: VecDeque<StateDelta>,
    last_seq: u64,
    snapshot: Option<StateSnapshot>,
    offline: bool,
}

/// In-process channel shared by tabs living in one process (tests, embedding).
#[derive(Debug)]
pub struct MemoryChannel {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl MemoryChannel {
    pub fn new(delta_log_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: delta_log_capacity.max(1),
        }
    }

    /// Simulate the storage channel going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.offline = offline;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| MeshError::ChannelUnavailable("memory channel poisoned".into()))?;
        if inner.offline {
            return Err(MeshError::ChannelUnavailable("memory channel offline".into()));
        }
        Ok(inner)
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DELTA_LOG_CAPACITY)
    }
}

impl Channel for MemoryChannel {
    fn upsert_tab(&self, descriptor: &TabDescriptor) -> Result<()> {
        self.lock()?
            .tabs
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(())
    }

    fn list_tabs(&self) -> Result<Vec<TabDescriptor>> {
        Ok(self.lock()?.tabs.values().cloned().collect())
    }

    fn remove_tab(&self, id: &TabId) -> Result<bool> {
        Ok(self.lock()?.tabs.remove(id).is_some())
    }

    fn put_pending(
        &self,
        target: &TabId,
        action: &PendingMasterAction,
    ) -> Result<Option<PendingMasterAction>> {
        Ok(self.lock()?.pending.insert(target.clone(), action.clone()))
    }

    fn take_pending(&self, target: &TabId) -> Result<Option<PendingMasterAction>> {
        Ok(self.lock()?.pending.remove(target))
    }

    fn list_pending(&self) -> Result<Vec<(TabId, PendingMasterAction)>> {
        Ok(self
            .lock()?
            .pending
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn publish(
        &self,
        origin: &TabId,
        fields: &BTreeMap<String, Value>,
        state: &SharedState,
    ) -> Result<u64> {
        let mut inner = self.lock()?;
        inner.last_seq += 1;
        let seq = inner.last_seq;
        inner.deltas.push_back(StateDelta {
            seq,
            origin: origin.clone(),
            fields: fields.clone(),
        });
        while inner.deltas.len() > self.capacity {
            inner.deltas.pop_front();
        }
        inner.snapshot = Some(StateSnapshot {
            seq,
            origin: origin.clone(),
            state: state.clone(),
        });
        tracing::trace!(seq, origin = %origin, "memory channel publish");
        Ok(seq)
    }

    fn deltas_since(&self, after: u64) -> Result<Vec<StateDelta>> {
        let inner = self.lock()?;
        check_gap(after, inner.deltas.front().map(|d| d.seq), inner.last_seq)?;
        Ok(inner
            .deltas
            .iter()
            .filter(|d| d.seq > after)
            .cloned()
            .collect())
    }

    fn snapshot(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.lock()?.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn id(s: &str) -> TabId {
        s.parse().unwrap()
    }

    fn pending(name: &str, from: &str) -> PendingMasterAction {
        PendingMasterAction::new(name, Value::Null, id(from), Utc::now())
    }

    #[test]
    fn upsert_replaces_descriptor() {
        let channel = MemoryChannel::default();
        let mut desc = TabDescriptor::new(id("00000000000000a1"), Utc::now());
        channel.upsert_tab(&desc).unwrap();
        desc.is_master = true;
        channel.upsert_tab(&desc).unwrap();

        let tabs = channel.list_tabs().unwrap();
        assert_eq!(tabs.len(), 1);
        assert!(tabs[0].is_master);
        assert!(channel.remove_tab(&desc.id).unwrap());
        assert!(!channel.remove_tab(&desc.id).unwrap());
    }

    #[test]
    fn pending_slot_overwrites_and_takes_once() {
        let channel = MemoryChannel::default();
        let target = id("00000000000000a1");
        assert!(channel
            .put_pending(&target, &pending("call.join", "00000000000000b2"))
            .unwrap()
            .is_none());
        let displaced = channel
            .put_pending(&target, &pending("call.leave", "00000000000000b2"))
            .unwrap()
            .unwrap();
        assert_eq!(displaced.action_name, "call.join");

        let taken = channel.take_pending(&target).unwrap().unwrap();
        assert_eq!(taken.action_name, "call.leave");
        assert!(channel.take_pending(&target).unwrap().is_none());
    }

    #[test]
    fn delta_log_is_bounded_and_reports_gap() {
        let channel = MemoryChannel::new(2);
        let origin = id("00000000000000a1");
        let state = SharedState::default();
        for _ in 0..4 {
            channel.publish(&origin, &BTreeMap::new(), &state).unwrap();
        }
        let recent = channel.deltas_since(2).unwrap();
        assert_eq!(recent.iter().map(|d| d.seq).collect::<Vec<_>>(), vec![3, 4]);
        assert!(matches!(
            channel.deltas_since(0).unwrap_err(),
            MeshError::ReplicationGap { .. }
        ));
        assert_eq!(channel.snapshot().unwrap().unwrap().seq, 4);
    }

    #[test]
    fn offline_channel_fails_every_call() {
        let channel = MemoryChannel::default();
        channel.set_offline(true);
        assert!(matches!(
            channel.list_tabs().unwrap_err(),
            MeshError::ChannelUnavailable(_)
        ));
        channel.set_offline(false);
        assert!(channel.list_tabs().unwrap().is_empty());
    }
}
