use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{MeshError, Result};
use crate::state::SharedState;
use crate::store::Channel;
use crate::tab_id::TabId;

/// How a pull brought the local replica up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullOutcome {
    #[default]
    UpToDate,
    Deltas(usize),
    Snapshot(u64),
}

/// Moves shared state between tabs.
///
/// The master diffs each commit against what it last published and appends
/// the changed fields to the channel's delta log. Everyone else applies
/// deltas in sequence order and falls back to the full snapshot whenever
/// the log no longer reaches back to what they have applied.
#[derive(Debug)]
pub struct Replicator {
    origin: TabId,
    applied_seq: u64,
    published: SharedState,
    tentative: BTreeSet<String>,
    needs_snapshot: bool,
    needs_full_publish: bool,
}

impl Replicator {
    pub fn new(origin: TabId) -> Self {
        Self {
            origin,
            applied_seq: 0,
            published: SharedState::default(),
            tentative: BTreeSet::new(),
            needs_snapshot: true,
            needs_full_publish: false,
        }
    }

    pub fn applied_seq(&self) -> u64 {
        self.applied_seq
    }

    /// Shared fields this tab changed locally that the master has not yet overwritten.
    pub fn tentative_fields(&self) -> &BTreeSet<String> {
        &self.tentative
    }

    /// Force the next pull to load the snapshot.
    pub fn request_snapshot(&mut self) {
        self.needs_snapshot = true;
    }

    /// Master side: publish whatever changed since the last publish.
    pub fn publish_commit(&mut self, channel: &dyn Channel, state: &SharedState) -> Result<Option<u64>> {
        if self.needs_full_publish {
            return self.publish_full(channel, state).map(Some);
        }
        let fields = self.published.diff(state)?;
        if fields.is_empty() {
            return Ok(None);
        }
        self.send(channel, &fields, state).map(Some)
    }

    /// Master side: publish every field, used on taking office and after an
    /// outage during which commits could not be published.
    pub fn publish_full(&mut self, channel: &dyn Channel, state: &SharedState) -> Result<u64> {
        let fields = state.fields()?;
        let seq = self.send(channel, &fields, state)?;
        self.tentative.clear();
        tracing::info!(tab = %self.origin, seq, "published full state");
        Ok(seq)
    }

    /// Record a local follower commit that touched shared fields.
    pub fn mark_tentative(&mut self, before: &SharedState, after: &SharedState) -> Result<()> {
        self.tentative.extend(before.diff(after)?.into_keys());
        Ok(())
    }

    /// Bring `shared` up to date from the channel.
    ///
    /// A master skips other origins' deltas: during a brief two-master
    /// window each keeps its own state until the loser steps down and
    /// reloads the snapshot.
    pub fn pull(
        &mut self,
        channel: &dyn Channel,
        shared: &mut SharedState,
        is_master: bool,
    ) -> Result<PullOutcome> {
        if self.needs_snapshot && !is_master {
            return self.load_snapshot(channel, shared);
        }

        let deltas = match channel.deltas_since(self.applied_seq) {
            Ok(deltas) => deltas,
            Err(MeshError::ReplicationGap { expected, oldest }) if !is_master => {
                tracing::debug!(tab = %self.origin, expected, oldest, "delta log gap");
                return self.load_snapshot(channel, shared);
            }
            Err(MeshError::ReplicationGap { .. }) => {
                self.applied_seq = channel.snapshot()?.map_or(self.applied_seq, |s| s.seq);
                return Ok(PullOutcome::UpToDate);
            }
            Err(err) => return Err(err),
        };

        let mut applied = 0;
        for delta in deltas {
            if !is_master && delta.origin != self.origin {
                shared.apply_fields(&delta.fields)?;
                self.clear_tentative(&delta.fields);
                applied += 1;
            }
            self.applied_seq = delta.seq;
        }
        Ok(if applied == 0 {
            PullOutcome::UpToDate
        } else {
            PullOutcome::Deltas(applied)
        })
    }

    fn load_snapshot(&mut self, channel: &dyn Channel, shared: &mut SharedState) -> Result<PullOutcome> {
        self.needs_snapshot = false;
        let Some(snapshot) = channel.snapshot()? else {
            return Ok(PullOutcome::UpToDate);
        };
        *shared = snapshot.state;
        self.applied_seq = snapshot.seq;
        self.tentative.clear();
        tracing::debug!(tab = %self.origin, seq = snapshot.seq, "loaded snapshot");
        Ok(PullOutcome::Snapshot(snapshot.seq))
    }

    fn send(
        &mut self,
        channel: &dyn Channel,
        fields: &BTreeMap<String, Value>,
        state: &SharedState,
    ) -> Result<u64> {
        match channel.publish(&self.origin, fields, state) {
            Ok(seq) => {
                self.published = state.clone();
                self.applied_seq = seq;
                self.needs_full_publish = false;
                Ok(seq)
            }
            Err(err) => {
                self.needs_full_publish = true;
                Err(err)
            }
        }
    }

    fn clear_tentative(&mut self, fields: &BTreeMap<String, Value>) {
        for key in fields.keys() {
            self.tentative.remove(key);
        }
    }
}
