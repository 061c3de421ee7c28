//! One tab of the session.
//!
//! A [`Tab`] is single-threaded and driven from outside: the owner calls
//! [`Tab::tick`] once per heartbeat interval and [`Tab::dispatch`] for user
//! actions. Each tick heartbeats, catches up on replicated state, runs one
//! election round, and if this tab is master, services the backend
//! connection and adopts pending actions left for it.

use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::actions::{self, sync::APPLY_UPDATE};
use crate::config::MeshConfig;
use crate::dispatch::{ActionRegistry, Actions, HandlerContext};
use crate::election::{Election, ElectionStep, StepDownReason, Transition};
use crate::error::{MeshError, Result};
use crate::identity::TabIdentity;
use crate::model::{ConnectionState, Notification, PendingMasterAction, Role, TabDescriptor};
use crate::presence::Presence;
use crate::protocol::{ProtocolClient, Update};
use crate::replicator::{PullOutcome, Replicator};
use crate::resources::{ExclusiveResources, Resource};
use crate::router::{self, PendingSlot, Route};
use crate::state::{GlobalState, SharedState, TabState};
use crate::store::Channel;
use crate::tab_id::TabId;

/// What happened to one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The handler ran here.
    Ran,
    /// The handler ran and failed; a notification was recorded.
    Failed { reason: String },
    /// Kept in this tab's slot until its connection is ready.
    Deferred,
    /// Written to the master's slot.
    Forwarded { master: TabId },
    /// No master existed; parked under this tab while an election runs.
    Parked,
}

/// Summary of one tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tab: TabId,
    pub role: Role,
    pub transition: Transition,
    pub connection_state: ConnectionState,
    pub live_tabs: usize,
    pub single_tab: bool,
    pub applied_seq: u64,
    pub adopted: usize,
    pub executed: Vec<String>,
}

pub struct Tab {
    id: TabId,
    identity: TabIdentity,
    config: MeshConfig,
    channel: Rc<dyn Channel>,
    registry: ActionRegistry,
    client: Box<dyn ProtocolClient>,
    presence: Presence,
    election: Election,
    replicator: Replicator,
    resources: ExclusiveResources,
    state: GlobalState,
    queue: VecDeque<(String, Value)>,
    live: Vec<TabDescriptor>,
    single_tab: bool,
    connect_failures: u32,
    drain_due: bool,
    executed: Vec<String>,
    last_tick_at: Option<DateTime<Utc>>,
    closed: bool,
}

impl Tab {
    /// Open a tab with the built-in actions.
    pub fn open(
        identity: TabIdentity,
        channel: Rc<dyn Channel>,
        client: Box<dyn ProtocolClient>,
        config: MeshConfig,
    ) -> Result<Self> {
        Self::with_registry(identity, channel, client, config, actions::builtin_registry()?)
    }

    pub fn with_registry(
        identity: TabIdentity,
        channel: Rc<dyn Channel>,
        client: Box<dyn ProtocolClient>,
        config: MeshConfig,
        registry: ActionRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let id = identity.current_tab_id().clone();
        tracing::debug!(tab = %id, persistent = identity.is_persistent(), "tab opened");
        Ok(Self {
            presence: Presence::new(id.clone(), Utc::now(), config.liveness_timeout_ms),
            election: Election::new(id.clone()),
            replicator: Replicator::new(id.clone()),
            resources: ExclusiveResources::new(config.retry_budget),
            id,
            identity,
            config,
            channel,
            registry,
            client,
            state: GlobalState::default(),
            queue: VecDeque::new(),
            live: Vec::new(),
            single_tab: false,
            connect_failures: 0,
            drain_due: false,
            executed: Vec::new(),
            last_tick_at: None,
            closed: false,
        })
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> &TabId {
        &self.id
    }

    pub fn identity(&self) -> &TabIdentity {
        &self.identity
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn role(&self) -> Role {
        self.election.role()
    }

    pub fn is_master(&self) -> bool {
        self.election.is_master()
    }

    pub fn known_master(&self) -> Option<&TabId> {
        self.election.known_master()
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn shared(&self) -> &SharedState {
        &self.state.shared
    }

    pub fn tab_state(&self) -> &TabState {
        &self.state.tab
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.shared.connection_state
    }

    /// This tab's deferred master action, if any.
    pub fn pending(&self) -> Option<&PendingMasterAction> {
        self.state.tab.multitab_next_action.peek()
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.state.tab.notifications
    }

    /// Live registry as of the last tick.
    pub fn live_tabs(&self) -> &[TabDescriptor] {
        &self.live
    }

    pub fn is_single_tab(&self) -> bool {
        self.single_tab
    }

    pub fn applied_seq(&self) -> u64 {
        self.replicator.applied_seq()
    }

    pub fn held_resources(&self) -> Vec<Resource> {
        self.resources.held().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // -- driving ------------------------------------------------------------

    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut transition = Transition::Unchanged;
        let mut adopted = 0;

        if !self.closed {
            if let Some(step) = self.check_stall(now) {
                transition = step.transition;
                self.apply_step(step, now);
            }

            let view = self.presence.heartbeat(self.channel.as_ref(), now);
            self.single_tab = view.single_tab;
            if !view.single_tab {
                self.pull();
            }

            let step = self.election.step(&view.live);
            self.live = view.live;
            if step.transition != Transition::Unchanged {
                transition = step.transition;
            }
            self.apply_step(step, now);

            if self.election.is_master() {
                adopted = self.serve(now);
            }
            self.drain_queue(now);
            self.drain_pending(now);
            self.last_tick_at = Some(now);
        }

        TickReport {
            tab: self.id.clone(),
            role: self.election.role(),
            transition,
            connection_state: self.connection_state(),
            live_tabs: self.live.len(),
            single_tab: self.single_tab,
            applied_seq: self.replicator.applied_seq(),
            adopted,
            executed: std::mem::take(&mut self.executed),
        }
    }

    pub fn dispatch(&mut self, name: &str, payload: Value) -> Result<DispatchOutcome> {
        self.dispatch_at(name, payload, Utc::now())
    }

    /// Route one action. Unknown names are a programming error: they panic
    /// in debug builds and are refused with `UnknownAction` otherwise.
    pub fn dispatch_at(
        &mut self,
        name: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        debug_assert!(self.registry.get(name).is_some(), "unknown action '{name}'");
        if self.closed {
            return Err(MeshError::NotReady(format!("tab {} is closed", self.id)));
        }
        let outcome = self.route(name, payload, now)?;
        self.drain_queue(now);
        self.drain_pending(now);
        Ok(outcome)
    }

    pub fn close(&mut self) {
        self.close_at(Utc::now());
    }

    /// Leave the session: hand off other tabs' pending intent, drop our
    /// own, step down, and mark the descriptor closing.
    pub fn close_at(&mut self, now: DateTime<Utc>) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut handoff = PendingSlot::default();
        let local = self.state.tab.multitab_next_action.take();
        let parked = self.channel.take_pending(&self.id).unwrap_or_else(|err| {
            tracing::debug!(tab = %self.id, %err, "could not read own slot on close");
            None
        });
        for action in local.into_iter().chain(parked) {
            if action.requesting_tab_id == self.id {
                tracing::debug!(tab = %self.id, action = %action.action_name, "discarding own pending action");
            } else if let Some(dropped) = handoff.offer(action) {
                tracing::debug!(action = %dropped.action_name, "superseded on close");
            }
        }
        if let Some(action) = handoff.take() {
            if let Err(err) = self.channel.put_pending(&self.id, &action) {
                tracing::warn!(tab = %self.id, %err, "could not hand off pending action");
            }
        }

        let step = self.election.step_down(StepDownReason::Closing);
        self.apply_step(step, now);
        if let Err(err) = self.presence.close(self.channel.as_ref(), now) {
            tracing::debug!(tab = %self.id, %err, "closing write failed");
        }
        tracing::debug!(tab = %self.id, "tab closed");
    }

    /// Drop the tab without its closing write, as when the process dies.
    pub fn kill(mut self) {
        self.closed = true;
    }

    // -- election -----------------------------------------------------------

    fn check_stall(&mut self, now: DateTime<Utc>) -> Option<ElectionStep> {
        let last = self.last_tick_at?;
        let gap = (now - last).num_milliseconds();
        if gap <= self.config.liveness_timeout_ms as i64 || self.election.role() == Role::Follower {
            return None;
        }
        tracing::warn!(tab = %self.id, gap_ms = gap, "heartbeat stalled; stepping down");
        Some(self.election.step_down(StepDownReason::HeartbeatStalled))
    }

    fn apply_step(&mut self, step: ElectionStep, now: DateTime<Utc>) {
        match step.transition {
            Transition::Unchanged => {}
            Transition::BecameCandidate => {
                tracing::debug!(tab = %self.id, "standing for master");
            }
            Transition::Reverted => {
                tracing::debug!(tab = %self.id, master = ?self.election.known_master(), "candidacy withdrawn");
            }
            Transition::Confirmed => {
                tracing::info!(tab = %self.id, "confirmed as master");
                self.take_office(now);
            }
            Transition::SteppedDown(reason) => {
                tracing::info!(tab = %self.id, ?reason, "stepped down");
                self.leave_office(reason);
            }
        }
        if self.presence.set_claim(step.claim) {
            if let Err(err) = self.presence.publish(self.channel.as_ref()) {
                tracing::debug!(tab = %self.id, %err, "claim write failed");
            }
        }
    }

    fn take_office(&mut self, now: DateTime<Utc>) {
        let retry = self.resources.on_confirmed();
        for resource in retry.abandoned {
            self.notify(now, format!("could not start call: {resource} unavailable"));
        }

        // A call leg lives with the tab that held the microphone.
        if !self.resources.is_held(Resource::Microphone) {
            if let Some(call_id) = self.state.shared.active_call_id.take() {
                tracing::info!(tab = %self.id, %call_id, "dropping call inherited from previous master");
            }
        }

        // The connection state belongs to whoever holds the connection.
        if self.state.shared.connection_state != ConnectionState::LoggingOut {
            self.state.shared.connection_state = ConnectionState::Connecting;
        }
        self.connect_failures = 0;
        if let Err(err) = self
            .replicator
            .publish_full(self.channel.as_ref(), &self.state.shared)
        {
            tracing::debug!(tab = %self.id, %err, "initial snapshot publish failed");
        }
    }

    /// Runs before the claim is withdrawn.
    fn leave_office(&mut self, reason: StepDownReason) {
        self.resources.on_lost();
        self.client.disconnect();
        self.connect_failures = 0;
        self.replicator.request_snapshot();

        if reason == StepDownReason::Closing {
            return;
        }
        if let Some(action) = self.state.tab.multitab_next_action.take() {
            self.park_for_successor(action);
        }
    }

    /// Leave `action` in this tab's channel slot for the next master. A
    /// forwarded action already waiting there competes with it; the later
    /// request wins.
    fn park_for_successor(&mut self, action: PendingMasterAction) {
        let waiting = match self.channel.take_pending(&self.id) {
            Ok(waiting) => waiting,
            Err(err) => {
                tracing::warn!(tab = %self.id, %err, "could not read own slot; keeping pending action");
                self.state.tab.multitab_next_action.put(action);
                return;
            }
        };
        let mut slot = PendingSlot::default();
        for candidate in std::iter::once(action).chain(waiting) {
            if let Some(dropped) = slot.offer(candidate) {
                tracing::debug!(action = %dropped.action_name, "superseded on step-down");
            }
        }
        let Some(winner) = slot.take() else {
            return;
        };
        tracing::info!(tab = %self.id, action = %winner.action_name, "parking pending action for next master");
        if let Err(err) = self.channel.put_pending(&self.id, &winner) {
            tracing::warn!(tab = %self.id, %err, "could not park pending action");
            self.state.tab.multitab_next_action.put(winner);
        }
    }

    // -- master duties ------------------------------------------------------

    fn serve(&mut self, now: DateTime<Utc>) -> usize {
        self.ensure_connected(now);
        for update in self.client.poll_updates() {
            self.enqueue_update(&update);
        }
        let adopted = self.adopt_pending();
        if let Err(err) = self
            .replicator
            .publish_commit(self.channel.as_ref(), &self.state.shared)
        {
            tracing::debug!(tab = %self.id, %err, "republish failed");
        }
        adopted
    }

    fn ensure_connected(&mut self, now: DateTime<Utc>) {
        if self.client.is_connected() || self.connection_state() == ConnectionState::LoggingOut {
            return;
        }
        match self.client.connect() {
            Ok(()) => {
                tracing::info!(tab = %self.id, "backend connected");
                self.connect_failures = 0;
            }
            Err(err) => {
                self.connect_failures += 1;
                tracing::warn!(tab = %self.id, %err, attempts = self.connect_failures, "connect failed");
                if self.connection_state() != ConnectionState::Broken {
                    self.enqueue_update(&Update::ConnectionState {
                        state: ConnectionState::Broken,
                    });
                }
                if self.connect_failures == self.config.retry_budget {
                    self.notify(now, format!("could not connect: {err}"));
                }
            }
        }
    }

    fn enqueue_update(&mut self, update: &Update) {
        match serde_json::to_value(update) {
            Ok(payload) => self.queue.push_back((APPLY_UPDATE.to_string(), payload)),
            Err(err) => tracing::warn!(%err, "dropping unserializable update"),
        }
    }

    /// Take every slot addressed to this tab or to a tab that is not a live
    /// master. Slots held for another live master are left to it.
    fn adopt_pending(&mut self) -> usize {
        let slots = match self.channel.list_pending() {
            Ok(slots) => slots,
            Err(err) => {
                tracing::debug!(tab = %self.id, %err, "could not list pending slots");
                return 0;
            }
        };
        let other_masters: BTreeSet<&TabId> = self
            .live
            .iter()
            .filter(|d| d.is_master && d.id != self.id)
            .map(|d| &d.id)
            .collect();

        let mut adopted = 0;
        for (target, _) in slots {
            if other_masters.contains(&target) {
                continue;
            }
            let action = match self.channel.take_pending(&target) {
                Ok(Some(action)) => action,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!(%target, %err, "take_pending failed");
                    continue;
                }
            };
            if target == self.id {
                tracing::debug!(tab = %self.id, action = %action.action_name, from = %action.requesting_tab_id, "received forwarded action");
            } else {
                tracing::info!(tab = %self.id, action = %action.action_name, orphaned_by = %target, "adopted pending action");
            }
            if let Some(dropped) = self.state.tab.multitab_next_action.offer(action) {
                tracing::debug!(action = %dropped.action_name, "pending action superseded");
            }
            adopted += 1;
        }
        if adopted > 0 {
            self.drain_due = true;
        }
        adopted
    }

    /// Run the deferred master action once this tab is a ready master.
    fn drain_pending(&mut self, now: DateTime<Utc>) {
        if !self.drain_due || !self.election.is_master() || !self.state.shared.is_ready() {
            return;
        }
        self.drain_due = false;
        let Some(action) = self.state.tab.multitab_next_action.take() else {
            return;
        };
        tracing::info!(
            tab = %self.id,
            action = %action.action_name,
            requested_by = %action.requesting_tab_id,
            "running pending master action"
        );
        if let Err(err) = self.execute(&action.action_name, action.payload, now) {
            tracing::warn!(action = %action.action_name, %err, "pending action dropped");
        }
        self.drain_queue(now);
    }

    // -- replication --------------------------------------------------------

    fn pull(&mut self) {
        let is_master = self.election.is_master();
        match self
            .replicator
            .pull(self.channel.as_ref(), &mut self.state.shared, is_master)
        {
            Ok(PullOutcome::UpToDate) => {}
            Ok(outcome) => tracing::trace!(tab = %self.id, ?outcome, "replicated"),
            Err(err) => {
                tracing::warn!(tab = %self.id, %err, "replication failed; reloading snapshot next tick");
                self.replicator.request_snapshot();
            }
        }
    }

    // -- dispatch -----------------------------------------------------------

    fn route(&mut self, name: &str, payload: Value, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let Some(gate) = self.registry.gate(name) else {
            tracing::error!(action = name, "unknown action");
            return Err(MeshError::UnknownAction(name.to_string()));
        };
        let route = router::route(
            gate,
            &self.id,
            self.election.role(),
            self.state.shared.is_ready(),
            self.election.known_master(),
        );

        match route {
            Route::RunNow => self.execute(name, payload, now),
            Route::DeferLocal => {
                self.defer(PendingMasterAction::new(name, payload, self.id.clone(), now));
                Ok(DispatchOutcome::Deferred)
            }
            Route::Forward(master) => {
                let action = PendingMasterAction::new(name, payload, self.id.clone(), now);
                match self.channel.put_pending(&master, &action) {
                    Ok(displaced) => {
                        if let Some(displaced) = displaced {
                            tracing::debug!(%master, action = %displaced.action_name, "overwrote pending action");
                        }
                        tracing::debug!(%master, action = name, "forwarded to master");
                        Ok(DispatchOutcome::Forwarded { master })
                    }
                    Err(err) => {
                        tracing::warn!(%master, %err, "forward failed; keeping action locally");
                        self.defer(action);
                        Ok(DispatchOutcome::Deferred)
                    }
                }
            }
            Route::ParkAndElect => {
                let action = PendingMasterAction::new(name, payload, self.id.clone(), now);
                match self.channel.put_pending(&self.id, &action) {
                    Ok(Some(displaced)) => {
                        tracing::debug!(action = %displaced.action_name, "overwrote parked action");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(%err, "park failed; keeping action locally");
                        self.defer(action);
                    }
                }
                tracing::info!(tab = %self.id, action = name, "no master; forcing election");
                if let Some(step) = self.election.force_candidacy() {
                    self.apply_step(step, now);
                }
                Ok(DispatchOutcome::Parked)
            }
        }
    }

    fn defer(&mut self, action: PendingMasterAction) {
        if let Some(displaced) = self.state.tab.multitab_next_action.put(action) {
            tracing::debug!(action = %displaced.action_name, "overwrote deferred action");
        }
    }

    /// Invoke the handler against the committed state and commit its result.
    fn execute(&mut self, name: &str, payload: Value, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let handler = self
            .registry
            .get(name)
            .map(|spec| spec.handler())
            .ok_or_else(|| MeshError::UnknownAction(name.to_string()))?;

        let mut actions = Actions::default();
        let client: Option<&mut dyn ProtocolClient> = if self.election.is_master() {
            Some(&mut *self.client)
        } else {
            None
        };
        let result = {
            let mut ctx = HandlerContext::new(
                name,
                &self.id,
                now,
                &mut actions,
                client,
                &mut self.resources,
            );
            handler(&mut ctx, &self.state, payload)
        };
        self.executed.push(name.to_string());

        match result {
            Ok(next) => {
                self.queue.extend(actions.drain());
                if let Some(next) = next {
                    self.commit(next);
                }
                Ok(DispatchOutcome::Ran)
            }
            Err(err) => {
                tracing::warn!(tab = %self.id, action = name, %err, "handler failed");
                self.notify(now, format!("{name} failed: {err}"));
                Ok(DispatchOutcome::Failed {
                    reason: err.to_string(),
                })
            }
        }
    }

    fn drain_queue(&mut self, now: DateTime<Utc>) {
        while let Some((name, payload)) = self.queue.pop_front() {
            if let Err(err) = self.route(&name, payload, now) {
                tracing::warn!(action = %name, %err, "queued dispatch failed");
            }
        }
    }

    fn commit(&mut self, next: GlobalState) {
        let became_ready = !self.state.shared.is_ready() && next.shared.is_ready();
        let shared_changed = self.state.shared != next.shared;
        let before = std::mem::replace(&mut self.state, next);

        if shared_changed {
            let result = if self.election.is_master() {
                self.replicator
                    .publish_commit(self.channel.as_ref(), &self.state.shared)
                    .map(|_| ())
            } else {
                self.replicator.mark_tentative(&before.shared, &self.state.shared)
            };
            if let Err(err) = result {
                tracing::debug!(tab = %self.id, %err, "commit not replicated yet");
            }
        }
        if became_ready {
            tracing::info!(tab = %self.id, "connection ready");
            self.drain_due = true;
        }
    }

    fn notify(&mut self, now: DateTime<Utc>, message: String) {
        self.state.tab.notifications.push(Notification::error(message, now));
    }
}

impl Drop for Tab {
    fn drop(&mut self) {
        if !self.closed {
            self.close();
        }
    }
}

impl std::fmt::Debug for Tab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tab")
            .field("id", &self.id)
            .field("role", &self.election.role())
            .field("connection_state", &self.state.shared.connection_state)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LoopbackClient;
    use crate::store::MemoryChannel;

    fn open_tab(channel: &Rc<MemoryChannel>, id: &str) -> Tab {
        let (client, _) = LoopbackClient::new();
        let shared: Rc<dyn Channel> = channel.clone();
        Tab::open(
            TabIdentity::with_id(id.parse().unwrap()),
            shared,
            Box::new(client),
            MeshConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn closed_tab_refuses_dispatch() {
        let channel = Rc::new(MemoryChannel::default());
        let mut tab = open_tab(&channel, "00000000000000a1");
        tab.close();
        let err = tab.dispatch("ui.toggle_modal", Value::Null).unwrap_err();
        assert_eq!(err.code(), "not_ready");
    }

    #[test]
    fn dropping_a_tab_writes_closing_record() {
        let channel = Rc::new(MemoryChannel::default());
        {
            let mut tab = open_tab(&channel, "00000000000000a1");
            tab.tick();
        }
        let tabs = channel.list_tabs().unwrap();
        assert!(tabs[0].is_closing);
    }

    #[test]
    fn killed_tab_leaves_descriptor_open() {
        let channel = Rc::new(MemoryChannel::default());
        let mut tab = open_tab(&channel, "00000000000000a1");
        tab.tick();
        tab.kill();
        let tabs = channel.list_tabs().unwrap();
        assert!(!tabs[0].is_closing);
        assert!(tabs[0].is_master);
    }

    #[test]
    fn closed_tab_ticks_are_inert() {
        let channel = Rc::new(MemoryChannel::default());
        let mut tab = open_tab(&channel, "00000000000000a1");
        tab.close();
        let report = tab.tick();
        assert_eq!(report.role, Role::Follower);
        assert_eq!(report.transition, Transition::Unchanged);
        assert!(tab.is_closed());
    }
}
