//! Routing of master-gated actions.
//!
//! A gated action either runs here, waits here, is handed to the master's
//! slot on the channel, or is parked in this tab's own slot while an
//! election is forced. Every queue in this module holds at most one action:
//! a newer intent replaces an older one.

use serde::{Deserialize, Serialize};

use crate::model::{Gate, PendingMasterAction, Role};
use crate::tab_id::TabId;

/// Single-entry queue for a deferred master-gated action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PendingSlot(Option<PendingMasterAction>);

impl PendingSlot {
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn peek(&self) -> Option<&PendingMasterAction> {
        self.0.as_ref()
    }

    /// Store `action` unconditionally; returns whatever it displaced.
    pub fn put(&mut self, action: PendingMasterAction) -> Option<PendingMasterAction> {
        self.0.replace(action)
    }

    /// Store `action` unless the slot already holds a later request.
    /// Returns the loser, which is never run.
    pub fn offer(&mut self, action: PendingMasterAction) -> Option<PendingMasterAction> {
        match &self.0 {
            Some(held) if held.requested_at > action.requested_at => Some(action),
            _ => self.put(action),
        }
    }

    pub fn take(&mut self) -> Option<PendingMasterAction> {
        self.0.take()
    }
}

/// Where a dispatched action goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Run the handler on this tab now.
    RunNow,
    /// This tab is master but not ready; keep the action in its own slot.
    DeferLocal,
    /// Another tab is master; write the action into its channel slot.
    Forward(TabId),
    /// Nobody is master; park the action under this tab and start an election.
    ParkAndElect,
}

pub fn route(
    gate: Gate,
    self_id: &TabId,
    role: Role,
    ready: bool,
    known_master: Option<&TabId>,
) -> Route {
    if gate == Gate::Local {
        return Route::RunNow;
    }
    match (role, known_master) {
        (Role::Master, _) if ready => Route::RunNow,
        (Role::Master, _) => Route::DeferLocal,
        (_, Some(master)) if master != self_id => Route::Forward(master.clone()),
        _ => Route::ParkAndElect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::Value;

    fn id(s: &str) -> TabId {
        s.parse().unwrap()
    }

    const A: &str = "00000000000000a1";
    const B: &str = "00000000000000b2";

    fn action(name: &str, offset_ms: i64) -> PendingMasterAction {
        PendingMasterAction::new(
            name,
            Value::Null,
            id(B),
            Utc::now() + Duration::milliseconds(offset_ms),
        )
    }

    #[test]
    fn put_overwrites_and_returns_displaced() {
        let mut slot = PendingSlot::default();
        assert!(slot.put(action("call.join", 0)).is_none());
        let displaced = slot.put(action("call.leave", 0)).unwrap();
        assert_eq!(displaced.action_name, "call.join");
        assert_eq!(slot.peek().unwrap().action_name, "call.leave");
    }

    #[test]
    fn offer_keeps_the_later_intent() {
        let mut slot = PendingSlot::default();
        slot.put(action("newer", 100));
        let loser = slot.offer(action("older", 0)).unwrap();
        assert_eq!(loser.action_name, "older");
        assert_eq!(slot.peek().unwrap().action_name, "newer");

        let loser = slot.offer(action("newest", 200)).unwrap();
        assert_eq!(loser.action_name, "newer");
    }

    #[test]
    fn take_empties_the_slot() {
        let mut slot = PendingSlot::default();
        slot.put(action("call.join", 0));
        assert!(slot.take().is_some());
        assert!(slot.is_empty());
        assert!(slot.take().is_none());
    }

    #[test]
    fn local_actions_always_run() {
        assert_eq!(
            route(Gate::Local, &id(B), Role::Follower, false, None),
            Route::RunNow
        );
    }

    #[test]
    fn master_runs_when_ready_and_defers_otherwise() {
        let a = id(A);
        assert_eq!(
            route(Gate::Master, &a, Role::Master, true, Some(&a)),
            Route::RunNow
        );
        assert_eq!(
            route(Gate::Master, &a, Role::Master, false, Some(&a)),
            Route::DeferLocal
        );
    }

    #[test]
    fn follower_forwards_to_known_master() {
        let a = id(A);
        assert_eq!(
            route(Gate::Master, &id(B), Role::Follower, true, Some(&a)),
            Route::Forward(a)
        );
    }

    #[test]
    fn no_master_parks_and_elects() {
        assert_eq!(
            route(Gate::Master, &id(B), Role::Follower, false, None),
            Route::ParkAndElect
        );
        assert_eq!(
            route(Gate::Master, &id(B), Role::CandidateForMaster, false, None),
            Route::ParkAndElect
        );
    }

    #[test]
    fn slot_serializes_as_bare_option() {
        let slot = PendingSlot::default();
        assert_eq!(serde_json::to_string(&slot).unwrap(), "null");
    }
}
