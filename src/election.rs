//! Leader election as an explicit finite-state machine.
//!
//! The machine never touches the channel. Each round the tab hands it the
//! live registry (dead and closing descriptors already filtered out) and
//! writes back whatever `claim` the returned step asks for. Ties between
//! simultaneous claimants resolve to the lowest [`TabId`]; because ids sort
//! by creation time that is usually the oldest tab.

use serde::Serialize;

use crate::model::{Role, TabDescriptor};
use crate::tab_id::TabId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDownReason {
    Closing,
    LowerIdClaimant,
    HeartbeatStalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum Transition {
    Unchanged,
    BecameCandidate,
    Confirmed,
    Reverted,
    SteppedDown(StepDownReason),
}

/// Result of one election round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionStep {
    pub role: Role,
    /// Value this tab must publish as its `is_master` flag.
    pub claim: bool,
    pub transition: Transition,
}

#[derive(Debug, Clone)]
pub struct Election {
    id: TabId,
    role: Role,
    known_master: Option<TabId>,
}

impl Election {
    pub fn new(id: TabId) -> Self {
        Self {
            id,
            role: Role::Follower,
            known_master: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// The master this tab last observed (itself when master).
    pub fn known_master(&self) -> Option<&TabId> {
        self.known_master.as_ref()
    }

    /// Run one round against the live registry view.
    pub fn step(&mut self, live: &[TabDescriptor]) -> ElectionStep {
        let lowest_rival = live
            .iter()
            .filter(|d| d.is_master && d.id != self.id)
            .map(|d| &d.id)
            .min()
            .cloned();

        match self.role {
            Role::Follower => match lowest_rival {
                Some(master) => {
                    self.known_master = Some(master);
                    self.emit(Transition::Unchanged)
                }
                None => self.become_candidate(),
            },
            Role::CandidateForMaster => match lowest_rival {
                Some(rival) if rival < self.id => {
                    tracing::debug!(tab = %self.id, winner = %rival, "election tie lost");
                    self.role = Role::Follower;
                    self.known_master = Some(rival);
                    self.emit(Transition::Reverted)
                }
                _ => {
                    self.role = Role::Master;
                    self.known_master = Some(self.id.clone());
                    self.emit(Transition::Confirmed)
                }
            },
            Role::Master => match lowest_rival {
                Some(rival) if rival < self.id => {
                    self.role = Role::Follower;
                    self.known_master = Some(rival);
                    self.emit(Transition::SteppedDown(StepDownReason::LowerIdClaimant))
                }
                _ => self.emit(Transition::Unchanged),
            },
        }
    }

    /// Jump straight to candidacy when a gated action finds no master.
    /// Returns `None` unless the tab was a follower.
    pub fn force_candidacy(&mut self) -> Option<ElectionStep> {
        (self.role == Role::Follower).then(|| self.become_candidate())
    }

    /// Leave mastership (or candidacy) voluntarily.
    pub fn step_down(&mut self, reason: StepDownReason) -> ElectionStep {
        let was_claiming = self.role != Role::Follower;
        self.role = Role::Follower;
        if self.known_master.as_ref() == Some(&self.id) {
            self.known_master = None;
        }
        if was_claiming {
            self.emit(Transition::SteppedDown(reason))
        } else {
            self.emit(Transition::Unchanged)
        }
    }

    fn become_candidate(&mut self) -> ElectionStep {
        self.role = Role::CandidateForMaster;
        self.known_master = None;
        self.emit(Transition::BecameCandidate)
    }

    fn emit(&self, transition: Transition) -> ElectionStep {
        ElectionStep {
            role: self.role,
            claim: self.role != Role::Follower,
            transition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn id(s: &str) -> TabId {
        s.parse().unwrap()
    }

    fn desc(s: &str, is_master: bool) -> TabDescriptor {
        let mut d = TabDescriptor::new(id(s), Utc::now());
        d.is_master = is_master;
        d
    }

    const A: &str = "00000000000000a1";
    const B: &str = "00000000000000b2";

    #[test]
    fn lone_tab_becomes_master_in_two_rounds() {
        let mut e = Election::new(id(A));
        let first = e.step(&[desc(A, false)]);
        assert_eq!(first.transition, Transition::BecameCandidate);
        assert!(first.claim);

        let second = e.step(&[desc(A, true)]);
        assert_eq!(second.transition, Transition::Confirmed);
        assert_eq!(e.role(), Role::Master);
        assert_eq!(e.known_master(), Some(&id(A)));
    }

    #[test]
    fn follower_stays_put_while_master_lives() {
        let mut e = Election::new(id(B));
        let step = e.step(&[desc(A, true), desc(B, false)]);
        assert_eq!(step.role, Role::Follower);
        assert!(!step.claim);
        assert_eq!(e.known_master(), Some(&id(A)));
    }

    #[test]
    fn simultaneous_candidates_resolve_to_lowest_id() {
        let mut a = Election::new(id(A));
        let mut b = Election::new(id(B));
        let empty = [desc(A, false), desc(B, false)];
        assert!(a.step(&empty).claim);
        assert!(b.step(&empty).claim);

        let both_claiming = [desc(A, true), desc(B, true)];
        assert_eq!(b.step(&both_claiming).transition, Transition::Reverted);
        assert_eq!(a.step(&both_claiming).transition, Transition::Confirmed);
        assert_eq!(a.role(), Role::Master);
        assert_eq!(b.role(), Role::Follower);
    }

    #[test]
    fn higher_id_master_yields_to_lower_claimant() {
        let mut b = Election::new(id(B));
        b.step(&[desc(B, false)]);
        b.step(&[desc(B, true)]);
        assert!(b.is_master());

        let step = b.step(&[desc(A, true), desc(B, true)]);
        assert_eq!(
            step.transition,
            Transition::SteppedDown(StepDownReason::LowerIdClaimant)
        );
        assert!(!step.claim);
    }

    #[test]
    fn lower_id_master_ignores_higher_claimant() {
        let mut a = Election::new(id(A));
        a.step(&[]);
        a.step(&[]);
        let step = a.step(&[desc(A, true), desc(B, true)]);
        assert_eq!(step.transition, Transition::Unchanged);
        assert!(a.is_master());
    }

    #[test]
    fn force_candidacy_only_from_follower() {
        let mut e = Election::new(id(A));
        assert_eq!(
            e.force_candidacy().unwrap().transition,
            Transition::BecameCandidate
        );
        assert!(e.force_candidacy().is_none());
    }

    #[test]
    fn step_down_clears_claim() {
        let mut e = Election::new(id(A));
        e.step(&[]);
        e.step(&[]);
        let step = e.step_down(StepDownReason::Closing);
        assert_eq!(step.transition, Transition::SteppedDown(StepDownReason::Closing));
        assert!(!step.claim);
        assert_eq!(e.known_master(), None);

        assert_eq!(
            e.step_down(StepDownReason::Closing).transition,
            Transition::Unchanged
        );
    }
}
