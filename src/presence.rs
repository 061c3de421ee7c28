use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::model::TabDescriptor;
use crate::store::Channel;
use crate::tab_id::TabId;

/// What one heartbeat observed.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryView {
    /// Live descriptors including this tab's own, ordered by id.
    pub live: Vec<TabDescriptor>,
    /// Ids pruned this round because their heartbeat went silent or they were closing.
    pub pruned: Vec<TabId>,
    /// True when the channel failed and this tab is acting alone.
    pub single_tab: bool,
}

impl RegistryView {
    pub fn masters(&self) -> impl Iterator<Item = &TabDescriptor> {
        self.live.iter().filter(|d| d.is_master)
    }
}

/// This tab's side of the shared presence registry.
#[derive(Debug)]
pub struct Presence {
    descriptor: TabDescriptor,
    liveness_timeout_ms: u64,
    degraded: bool,
}

impl Presence {
    pub fn new(id: TabId, now: DateTime<Utc>, liveness_timeout_ms: u64) -> Self {
        Self {
            descriptor: TabDescriptor::new(id, now),
            liveness_timeout_ms,
            degraded: false,
        }
    }

    pub fn descriptor(&self) -> &TabDescriptor {
        &self.descriptor
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Record the claim locally; returns true if it changed.
    pub fn set_claim(&mut self, claim: bool) -> bool {
        let changed = self.descriptor.is_master != claim;
        self.descriptor.is_master = claim;
        changed
    }

    /// Write the current descriptor without reading anything back.
    pub fn publish(&mut self, channel: &dyn Channel) -> Result<()> {
        let result = channel.upsert_tab(&self.descriptor);
        self.note_channel(&result);
        result
    }

    /// Heartbeat: stamp and write our descriptor, read every sibling, prune
    /// the dead. Never fails; an unusable channel yields a single-tab view.
    pub fn heartbeat(&mut self, channel: &dyn Channel, now: DateTime<Utc>) -> RegistryView {
        self.descriptor.last_heartbeat_at = now;
        let result = channel
            .upsert_tab(&self.descriptor)
            .and_then(|()| channel.list_tabs());
        self.note_channel(&result);

        let Ok(all) = result else {
            return RegistryView {
                live: vec![self.descriptor.clone()],
                pruned: vec![],
                single_tab: true,
            };
        };

        let mut live = Vec::with_capacity(all.len());
        let mut pruned = Vec::new();
        for desc in all {
            if desc.id == self.descriptor.id {
                live.push(self.descriptor.clone());
            } else if desc.is_alive(now, self.liveness_timeout_ms) {
                live.push(desc);
            } else {
                match channel.remove_tab(&desc.id) {
                    Ok(_) => {
                        tracing::debug!(
                            tab = %desc.id,
                            silent_ms = desc.silence_ms(now),
                            closing = desc.is_closing,
                            "pruned dead tab"
                        );
                        pruned.push(desc.id);
                    }
                    Err(err) => tracing::debug!(tab = %desc.id, %err, "prune failed"),
                }
            }
        }
        if !live.iter().any(|d| d.id == self.descriptor.id) {
            live.push(self.descriptor.clone());
            live.sort_by(|a, b| a.id.cmp(&b.id));
        }

        RegistryView {
            live,
            pruned,
            single_tab: false,
        }
    }

    /// Final write on close so successors need not wait for the timeout.
    pub fn close(&mut self, channel: &dyn Channel, now: DateTime<Utc>) -> Result<()> {
        self.descriptor.is_master = false;
        self.descriptor.is_closing = true;
        self.descriptor.last_heartbeat_at = now;
        channel.upsert_tab(&self.descriptor)
    }

    /// Report degraded mode once on entry and once on recovery.
    fn note_channel<T>(&mut self, result: &Result<T>) {
        match (result, self.degraded) {
            (Err(err), false) => {
                tracing::warn!(
                    tab = %self.descriptor.id,
                    %err,
                    "shared channel unavailable; continuing in single-tab mode"
                );
                self.degraded = true;
            }
            (Ok(_), true) => {
                tracing::info!(tab = %self.descriptor.id, "shared channel restored");
                self.degraded = false;
            }
            _ => {}
        }
    }
}
