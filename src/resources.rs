use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Hardware that only one tab of the session may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Microphone,
    Camera,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Microphone => write!(f, "microphone"),
            Self::Camera => write!(f, "camera"),
        }
    }
}

/// What a retry pass on confirmation produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    pub acquired: Vec<Resource>,
    /// Requests that ran out of attempts; the caller notifies the user.
    pub abandoned: Vec<Resource>,
}

/// Leases on exclusive hardware for one tab.
///
/// Acquisition is only allowed while the tab is a confirmed master. A
/// refused request is remembered with its attempt count and retried the
/// next time mastership is confirmed.
#[derive(Debug)]
pub struct ExclusiveResources {
    confirmed: bool,
    held: BTreeSet<Resource>,
    deferred: BTreeMap<Resource, u32>,
    retry_budget: u32,
}

impl ExclusiveResources {
    pub fn new(retry_budget: u32) -> Self {
        Self {
            confirmed: false,
            held: BTreeSet::new(),
            deferred: BTreeMap::new(),
            retry_budget,
        }
    }

    pub fn is_held(&self, resource: Resource) -> bool {
        self.held.contains(&resource)
    }

    pub fn held(&self) -> impl Iterator<Item = Resource> + '_ {
        self.held.iter().copied()
    }

    pub fn deferred(&self) -> impl Iterator<Item = Resource> + '_ {
        self.deferred.keys().copied()
    }

    pub fn acquire(&mut self, resource: Resource) -> Result<()> {
        if !self.confirmed {
            let attempts = self.deferred.entry(resource).or_insert(0);
            *attempts += 1;
            tracing::debug!(%resource, attempts = *attempts, "acquire refused; not master");
            return Err(MeshError::NotMaster(format!("acquire {resource}")));
        }
        if self.held.insert(resource) {
            tracing::debug!(%resource, "acquired");
        }
        Ok(())
    }

    pub fn release(&mut self, resource: Resource) {
        if self.held.remove(&resource) {
            tracing::debug!(%resource, "released");
        }
        self.deferred.remove(&resource);
    }

    /// Mastership confirmed: acquire whatever was refused earlier.
    pub fn on_confirmed(&mut self) -> RetryOutcome {
        self.confirmed = true;
        let mut outcome = RetryOutcome::default();
        for (resource, attempts) in std::mem::take(&mut self.deferred) {
            if attempts > self.retry_budget {
                tracing::warn!(%resource, attempts, "giving up on exclusive resource");
                outcome.abandoned.push(resource);
            } else {
                self.held.insert(resource);
                outcome.acquired.push(resource);
            }
        }
        outcome
    }

    /// Mastership lost: release everything. Runs before the tab withdraws its claim.
    pub fn on_lost(&mut self) -> Vec<Resource> {
        self.confirmed = false;
        let released: Vec<Resource> = std::mem::take(&mut self.held).into_iter().collect();
        if !released.is_empty() {
            tracing::info!(?released, "released exclusive resources");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_requires_confirmed_master() {
        let mut res = ExclusiveResources::new(3);
        let err = res.acquire(Resource::Microphone).unwrap_err();
        assert_eq!(err.code(), "not_master");
        assert!(!res.is_held(Resource::Microphone));
        assert_eq!(res.deferred().collect::<Vec<_>>(), vec![Resource::Microphone]);
    }

    #[test]
    fn refused_request_is_granted_on_confirmation() {
        let mut res = ExclusiveResources::new(3);
        let _ = res.acquire(Resource::Camera);
        let outcome = res.on_confirmed();
        assert_eq!(outcome.acquired, vec![Resource::Camera]);
        assert!(res.is_held(Resource::Camera));
        assert_eq!(res.deferred().count(), 0);
    }

    #[test]
    fn request_past_budget_is_abandoned() {
        let mut res = ExclusiveResources::new(1);
        let _ = res.acquire(Resource::Microphone);
        let _ = res.acquire(Resource::Microphone);
        let outcome = res.on_confirmed();
        assert_eq!(outcome.abandoned, vec![Resource::Microphone]);
        assert!(!res.is_held(Resource::Microphone));
    }

    #[test]
    fn losing_mastership_releases_everything() {
        let mut res = ExclusiveResources::new(3);
        res.on_confirmed();
        res.acquire(Resource::Microphone).unwrap();
        res.acquire(Resource::Camera).unwrap();
        let released = res.on_lost();
        assert_eq!(released, vec![Resource::Microphone, Resource::Camera]);
        assert_eq!(res.held().count(), 0);
        assert!(res.acquire(Resource::Microphone).is_err());
    }

    #[test]
    fn release_forgets_deferred_request() {
        let mut res = ExclusiveResources::new(3);
        let _ = res.acquire(Resource::Microphone);
        res.release(Resource::Microphone);
        assert!(res.on_confirmed().acquired.is_empty());
    }
}
