use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Result;
use crate::model::{PendingMasterAction, TabDescriptor};
use crate::state::{SharedState, StateDelta, StateSnapshot};
use crate::tab_id::TabId;

/// Same-origin storage visible to every tab of one session.
///
/// Each method is atomic on its own; nothing spans calls. Readers may observe
/// data that is already stale, and callers are expected to tolerate that.
pub trait Channel {
    // -- presence -----------------------------------------------------------

    /// Insert or replace a tab's descriptor.
    fn upsert_tab(&self, descriptor: &TabDescriptor) -> Result<()>;

    /// All descriptors, live or not, ordered by tab id.
    fn list_tabs(&self) -> Result<Vec<TabDescriptor>>;

    /// Remove a descriptor. Returns false when it was already gone.
    fn remove_tab(&self, id: &TabId) -> Result<bool>;

    // -- pending master actions ---------------------------------------------

    /// Store `action` in `target`'s slot, returning whatever it displaced.
    fn put_pending(
        &self,
        target: &TabId,
        action: &PendingMasterAction,
    ) -> Result<Option<PendingMasterAction>>;

    /// Remove and return `target`'s slot. Only one caller can win a given slot.
    fn take_pending(&self, target: &TabId) -> Result<Option<PendingMasterAction>>;

    /// Every occupied slot with its target, ordered by target.
    fn list_pending(&self) -> Result<Vec<(TabId, PendingMasterAction)>>;

    // -- replication --------------------------------------------------------

    /// Append a delta, replace the snapshot with `state`, and return the
    /// sequence number assigned to both.
    fn publish(
        &self,
        origin: &TabId,
        fields: &BTreeMap<String, Value>,
        state: &SharedState,
    ) -> Result<u64>;

    /// Deltas with `seq > after`, oldest first. Fails with
    /// [`crate::error::MeshError::ReplicationGap`] when some of them were
    /// already trimmed from the log.
    fn deltas_since(&self, after: u64) -> Result<Vec<StateDelta>>;

    /// The most recently published full state, if any.
    fn snapshot(&self) -> Result<Option<StateSnapshot>>;
}

/// Decide whether a log whose oldest retained entry is `oldest` (if any) and
/// whose latest assigned sequence is `latest` can serve reads after `after`.
pub(crate) fn check_gap(after: u64, oldest: Option<u64>, latest: u64) -> Result<()> {
    if after >= latest {
        return Ok(());
    }
    let expected = after + 1;
    match oldest {
        Some(oldest) if oldest <= expected => Ok(()),
        Some(oldest) => Err(crate::error::MeshError::ReplicationGap { expected, oldest }),
        None => Err(crate::error::MeshError::ReplicationGap {
            expected,
            oldest: latest + 1,
        }),
    }
}
