//! Proposal/step store: the single shared resource of the system.
//!
//! Two backends implement [`WorkflowStore`]:
//!
//! - [`MemStore`]: concurrent hashmaps (DashMap); per-entry locks make
//!   conditional updates atomic. Lost on process exit.
//! - [`DurableStore`]: ACID transactions (redb); every conditional update is a
//!   single write transaction, and reopening restores all state.
//!
//! Executors never share in-process state with each other or with the
//! heartbeat. All coordination goes through the conditional updates here: a
//! claim succeeds only if the step was still `queued` when the write commits.

pub mod durable;
#[cfg(test)]
pub(crate) mod faulty;
pub mod mem;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, WorkflowError};
use crate::event::{Event, Payload};
use crate::trigger::Trigger;
use crate::workflow::{Proposal, ProposalDraft, ProposalId, ProposalStatus, Step, StepId};

pub use durable::DurableStore;
pub use mem::MemStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Upper bound on candidates examined per claim attempt.
pub const CLAIM_SCAN_LIMIT: usize = 16;

/// Outcome of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    /// The update was committed; carries the new record.
    Applied(T),
    /// The guard rejected the current record; carries it unchanged.
    Rejected(T),
}

impl<T> Update<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Applied(t) | Self::Rejected(t) => t,
        }
    }
}

/// Outcome of [`WorkflowStore::expand_proposal`].
#[derive(Debug, Clone, PartialEq)]
pub enum Expansion {
    /// Steps were created and the proposal moved to `in_progress`.
    Expanded { proposal: Proposal, steps: Vec<Step> },
    /// Steps already existed; nothing changed.
    AlreadyExpanded { proposal: Proposal, steps: Vec<Step> },
    /// The proposal is not `approved` and has no steps.
    NotApproved(Proposal),
}

/// A registered agent executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub step_kinds: BTreeSet<String>,
    pub registered_at: u64,
    pub last_seen_at: u64,
}

/// Conditional step mutation: return the replacement, or `None` to reject.
pub type StepGuard<'a> = &'a dyn Fn(&Step) -> Option<Step>;

/// Conditional proposal mutation: return the replacement, or `None` to reject.
pub type ProposalGuard<'a> = &'a dyn Fn(&Proposal) -> Option<Proposal>;

/// Persistence contract for the workflow core.
pub trait WorkflowStore: Send + Sync {
    // -- events --------------------------------------------------------------

    /// Append an event; the store assigns the next `seq`.
    fn append_event(&self, kind: &str, payload: Payload, occurred_at: u64) -> StoreResult<Event>;

    /// Events with `seq > after`, oldest first, at most `limit`.
    fn events_after(&self, after: u64, limit: usize) -> StoreResult<Vec<Event>>;

    /// Sequence number of the newest event (0 if the log is empty).
    fn last_event_seq(&self) -> StoreResult<u64>;

    /// Named progress marker (0 if unset).
    fn cursor(&self, name: &str) -> StoreResult<u64>;

    fn set_cursor(&self, name: &str, value: u64) -> StoreResult<()>;

    // -- proposals -----------------------------------------------------------

    /// Store a new proposal, assigning its id.
    fn insert_proposal(&self, draft: ProposalDraft, now: u64) -> StoreResult<Proposal>;

    fn get_proposal(&self, id: ProposalId) -> StoreResult<Option<Proposal>>;

    /// All proposals (optionally filtered by status), ordered by id.
    fn list_proposals(&self, status: Option<ProposalStatus>) -> StoreResult<Vec<Proposal>>;

    /// Atomically replace a proposal if `guard` accepts its current state.
    fn update_proposal_if(&self, id: ProposalId, guard: ProposalGuard<'_>)
    -> StoreResult<Update<Proposal>>;

    /// `approved` proposals that have no steps yet (the reaction queue).
    fn list_approved_unexpanded(&self) -> StoreResult<Vec<Proposal>>;

    /// Atomically materialize one `queued` step per step kind, in order, and
    /// move the proposal to `in_progress`. Idempotent.
    fn expand_proposal(&self, id: ProposalId) -> StoreResult<Expansion>;

    // -- steps ---------------------------------------------------------------

    fn get_step(&self, id: StepId) -> StoreResult<Option<Step>>;

    /// Steps of one proposal in materialization order.
    fn steps_for(&self, proposal: ProposalId) -> StoreResult<Vec<Step>>;

    /// `queued` steps of `in_progress` proposals whose kind is in `kinds`,
    /// oldest first, at most `limit`.
    fn claimable_steps(&self, kinds: &BTreeSet<String>, limit: usize) -> StoreResult<Vec<Step>>;

    /// Atomically replace a step if `guard` accepts its current state.
    fn update_step_if(&self, id: StepId, guard: StepGuard<'_>) -> StoreResult<Update<Step>>;

    /// `claimed`/`running` steps with `claimed_at < cutoff`.
    fn list_stale_steps(&self, cutoff: u64) -> StoreResult<Vec<Step>>;

    // -- registries ----------------------------------------------------------

    /// Add or replace a trigger. Assigns an id when empty.
    fn put_trigger(&self, trigger: Trigger) -> StoreResult<Trigger>;

    fn remove_trigger(&self, id: &str) -> StoreResult<bool>;

    /// Move a trigger's `last_fired_at` forward to `at`, leaving every other
    /// field as stored. Returns `false` when the trigger no longer exists.
    fn record_trigger_fired(&self, id: &str, at: u64) -> StoreResult<bool>;

    fn list_triggers(&self) -> StoreResult<Vec<Trigger>>;

    fn put_agent(&self, record: AgentRecord) -> StoreResult<()>;

    fn list_agents(&self) -> StoreResult<Vec<AgentRecord>>;

    // -- provided ------------------------------------------------------------

    /// Claim exactly one claimable step for `agent_id`, or `None`.
    ///
    /// Candidates are tried in order; losing a race on one moves on to the
    /// next rather than surfacing an error.
    fn claim_step(
        &self,
        kinds: &BTreeSet<String>,
        agent_id: &str,
        now: u64,
    ) -> StoreResult<Option<Step>> {
        for candidate in self.claimable_steps(kinds, CLAIM_SCAN_LIMIT)? {
            match try_claim(self, candidate.id, agent_id, now) {
                Ok(step) => return Ok(Some(step)),
                Err(WorkflowError::ClaimConflict { step_id, .. }) => {
                    tracing::debug!(step = step_id, agent = agent_id, "claim conflict, trying next");
                }
                Err(WorkflowError::Store(e)) => return Err(e),
                Err(e) => {
                    tracing::debug!(step = %candidate.id, error = %e, "candidate vanished");
                }
            }
        }
        Ok(None)
    }
}

/// Conditionally claim one specific step.
///
/// Fails with [`WorkflowError::ClaimConflict`] if the step was no longer
/// `queued` at commit time.
pub fn try_claim<S: WorkflowStore + ?Sized>(
    store: &S,
    id: StepId,
    agent_id: &str,
    now: u64,
) -> Result<Step, WorkflowError> {
    let guard = |current: &Step| {
        let mut next = current.clone();
        next.claim(agent_id, now).ok().map(|_| next)
    };
    match store.update_step_if(id, &guard) {
        Ok(Update::Applied(step)) => Ok(step),
        Ok(Update::Rejected(_)) => Err(WorkflowError::ClaimConflict {
            step_id: id.0,
            agent_id: agent_id.to_string(),
        }),
        Err(StoreError::NotFound { .. }) => Err(WorkflowError::StepNotFound { id: id.0 }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share. Each backend's tests call these.

    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::workflow::{ProposalSource, StepStatus};

    pub fn draft(kinds: &[&str], auto: bool) -> ProposalDraft {
        ProposalDraft {
            title: "contract".into(),
            step_kinds: kinds.iter().map(|k| k.to_string()).collect(),
            auto_approve: auto,
            source: ProposalSource::Manual,
        }
    }

    pub fn kinds(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    pub fn events_are_sequenced(store: &dyn WorkflowStore) {
        let a = store.append_event("a", Payload::new(), 10).unwrap();
        let b = store
            .append_event("b", crate::event::payload([("k", json!(1))]), 11)
            .unwrap();
        assert!(b.seq > a.seq);
        let after_a = store.events_after(a.seq, 10).unwrap();
        assert_eq!(after_a.len(), 1);
        assert_eq!(after_a[0].kind, "b");
        assert_eq!(store.events_after(0, 1).unwrap().len(), 1);
        assert_eq!(store.last_event_seq().unwrap(), b.seq);

        assert_eq!(store.cursor("hb").unwrap(), 0);
        store.set_cursor("hb", b.seq).unwrap();
        assert_eq!(store.cursor("hb").unwrap(), b.seq);
    }

    pub fn expansion_is_idempotent(store: &dyn WorkflowStore) {
        let pending = store.insert_proposal(draft(&["x"], false), 1).unwrap();
        assert!(matches!(
            store.expand_proposal(pending.id).unwrap(),
            Expansion::NotApproved(_)
        ));

        let p = store.insert_proposal(draft(&["build", "test", "deploy"], true), 1).unwrap();
        assert_eq!(store.list_approved_unexpanded().unwrap().len(), 1);

        let Expansion::Expanded { proposal, steps } = store.expand_proposal(p.id).unwrap() else {
            panic!("expected expansion");
        };
        assert_eq!(proposal.status, ProposalStatus::InProgress);
        let kinds: Vec<_> = steps.iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(kinds, ["build", "test", "deploy"]);
        assert!(steps.iter().all(|s| s.status == StepStatus::Queued));

        let again = store.expand_proposal(p.id).unwrap();
        assert!(matches!(again, Expansion::AlreadyExpanded { ref steps, .. } if steps.len() == 3));
        assert_eq!(store.steps_for(p.id).unwrap().len(), 3);
        assert!(store.list_approved_unexpanded().unwrap().is_empty());
    }

    pub fn claim_respects_kinds_and_proposal_status(store: &dyn WorkflowStore) {
        let p = store.insert_proposal(draft(&["build", "vote"], true), 1).unwrap();
        assert!(store.claim_step(&kinds(&["build"]), "a", 5).unwrap().is_none());
        store.expand_proposal(p.id).unwrap();

        assert!(store.claim_step(&kinds(&["research"]), "a", 5).unwrap().is_none());
        let step = store.claim_step(&kinds(&["build"]), "a", 5).unwrap().unwrap();
        assert_eq!(step.kind, "build");
        assert_eq!(step.status, StepStatus::Claimed);
        assert_eq!(step.claimed_by.as_deref(), Some("a"));
        assert!(store.claim_step(&kinds(&["build"]), "b", 6).unwrap().is_none());

        store
            .update_proposal_if(p.id, &|cur: &Proposal| {
                let mut next = cur.clone();
                next.cancel(&[], 7).ok().map(|_| next)
            })
            .unwrap();
        assert!(store.claim_step(&kinds(&["vote"]), "b", 8).unwrap().is_none());
    }

    pub fn stale_scan_uses_strict_cutoff(store: &dyn WorkflowStore) {
        let p = store.insert_proposal(draft(&["build"], true), 1).unwrap();
        store.expand_proposal(p.id).unwrap();
        let step = store.claim_step(&kinds(&["build"]), "a", 100).unwrap().unwrap();
        assert!(store.list_stale_steps(100).unwrap().is_empty());
        let stale = store.list_stale_steps(101).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, step.id);
    }

    pub fn registries_round_trip(store: &dyn WorkflowStore) {
        let trigger = Trigger::new(
            "t",
            crate::condition::Condition::event_type("x"),
            crate::trigger::ProposalTemplate {
                title_template: "x".into(),
                step_kinds: vec!["y".into()],
                auto_approve: false,
            },
        );
        let stored = store.put_trigger(trigger).unwrap();
        assert!(!stored.id.is_empty());
        assert_eq!(store.list_triggers().unwrap(), vec![stored.clone()]);
        assert!(store.remove_trigger(&stored.id).unwrap());
        assert!(!store.remove_trigger(&stored.id).unwrap());
        assert!(store.list_triggers().unwrap().is_empty());

        let agent = AgentRecord {
            agent_id: "builder".into(),
            step_kinds: kinds(&["build", "test"]),
            registered_at: 1,
            last_seen_at: 1,
        };
        store.put_agent(agent.clone()).unwrap();
        store
            .put_agent(AgentRecord {
                last_seen_at: 9,
                ..agent.clone()
            })
            .unwrap();
        let agents = store.list_agents().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].last_seen_at, 9);
    }

    pub fn firing_time_leaves_other_fields_alone(store: &dyn WorkflowStore) {
        let stored = store
            .put_trigger(
                Trigger::new(
                    "t",
                    crate::condition::Condition::event_type("x"),
                    crate::trigger::ProposalTemplate {
                        title_template: "x".into(),
                        step_kinds: vec!["y".into()],
                        auto_approve: false,
                    },
                )
                .with_cooldown(60),
            )
            .unwrap();

        // An operator edit lands after the heartbeat loaded its copy.
        let mut edited = stored.clone();
        edited.cooldown_seconds = 5;
        edited.enabled = false;
        store.put_trigger(edited).unwrap();

        assert!(store.record_trigger_fired(&stored.id, 100).unwrap());
        let after = store.list_triggers().unwrap().remove(0);
        assert_eq!(after.last_fired_at, Some(100));
        assert_eq!(after.cooldown_seconds, 5);
        assert!(!after.enabled);

        // Never moves backwards.
        assert!(store.record_trigger_fired(&stored.id, 40).unwrap());
        assert_eq!(store.list_triggers().unwrap()[0].last_fired_at, Some(100));

        assert!(store.remove_trigger(&stored.id).unwrap());
        assert!(!store.record_trigger_fired(&stored.id, 200).unwrap());
        assert!(store.list_triggers().unwrap().is_empty());
    }

    pub fn requeued_steps_are_claimable_again(store: &dyn WorkflowStore) {
        let p = store.insert_proposal(draft(&["build", "test"], true), 1).unwrap();
        store.expand_proposal(p.id).unwrap();
        let step = store.claim_step(&kinds(&["build", "test"]), "a", 5).unwrap().unwrap();
        assert_eq!(step.kind, "build");

        store
            .update_step_if(step.id, &|cur: &Step| {
                let mut next = cur.clone();
                next.reclaim_stale(3).ok().map(|_| next)
            })
            .unwrap();
        let again = store.claim_step(&kinds(&["build"]), "b", 6).unwrap().unwrap();
        assert_eq!(again.id, step.id);
        assert_eq!(again.claimed_by.as_deref(), Some("b"));

        // Oldest first across kinds.
        let claimable = store.claimable_steps(&kinds(&["build", "test"]), 10).unwrap();
        let ids: Vec<StepId> = claimable.iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 1);
        assert!(ids[0] > step.id);
    }

    /// N threads race to claim a single queued step; exactly one wins.
    pub fn exactly_one_claim_wins(store: Arc<dyn WorkflowStore>) {
        let p = store.insert_proposal(draft(&["build"], true), 1).unwrap();
        store.expand_proposal(p.id).unwrap();

        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    store
                        .claim_step(&kinds(&["build"]), &format!("agent-{i}"), 10)
                        .unwrap()
                })
            })
            .collect();
        let winners: Vec<Step> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners.len(), 1);

        let step = store.steps_for(p.id).unwrap().remove(0);
        assert_eq!(step.status, StepStatus::Claimed);
        assert_eq!(step.claimed_by, winners[0].claimed_by);
    }
}
