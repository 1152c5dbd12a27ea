//! In-memory workflow store backed by DashMap.
//!
//! Conditional updates run while holding the entry's shard lock, so a claim is
//! atomic with respect to every other writer of the same step. All data is
//! lost on process exit; use [`super::DurableStore`] for anything that must
//! survive a crash.

use std::collections::BTreeSet;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::{
    AgentRecord, Expansion, ProposalGuard, StepGuard, StoreResult, Update, WorkflowStore,
};
use crate::error::StoreError;
use crate::event::{Event, Payload};
use crate::trigger::{Trigger, generate_trigger_id};
use crate::workflow::{
    Proposal, ProposalDraft, ProposalId, ProposalStatus, Step, StepId, StepStatus,
};

/// Concurrent in-memory store using sharded hashmaps.
///
/// Lock order is proposals → step index → steps; scans copy records out before
/// touching another map.
#[derive(Debug, Default)]
pub struct MemStore {
    events: RwLock<Vec<Event>>,
    cursors: DashMap<String, u64>,
    proposals: DashMap<ProposalId, Proposal>,
    steps: DashMap<StepId, Step>,
    step_index: DashMap<ProposalId, Vec<StepId>>,
    triggers: DashMap<String, Trigger>,
    agents: DashMap<String, AgentRecord>,
    next_proposal: AtomicU64,
    next_step: AtomicU64,
}

impl MemStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn steps_by_ids(&self, ids: &[StepId]) -> Vec<Step> {
        ids.iter()
            .filter_map(|id| self.steps.get(id).map(|s| s.value().clone()))
            .collect()
    }

    fn poisoned() -> StoreError {
        StoreError::Io {
            source: std::io::Error::other("event log lock poisoned"),
        }
    }
}

impl WorkflowStore for MemStore {
    fn append_event(&self, kind: &str, payload: Payload, occurred_at: u64) -> StoreResult<Event> {
        let mut events = self.events.write().map_err(|_| Self::poisoned())?;
        let event = Event {
            seq: events.len() as u64 + 1,
            kind: kind.to_string(),
            payload,
            occurred_at,
        };
        events.push(event.clone());
        Ok(event)
    }

    fn events_after(&self, after: u64, limit: usize) -> StoreResult<Vec<Event>> {
        let events = self.events.read().map_err(|_| Self::poisoned())?;
        // seq == index + 1
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(events.len());
        Ok(events[start..].iter().take(limit).cloned().collect())
    }

    fn last_event_seq(&self) -> StoreResult<u64> {
        let events = self.events.read().map_err(|_| Self::poisoned())?;
        Ok(events.len() as u64)
    }

    fn cursor(&self, name: &str) -> StoreResult<u64> {
        Ok(self.cursors.get(name).map(|v| *v).unwrap_or(0))
    }

    fn set_cursor(&self, name: &str, value: u64) -> StoreResult<()> {
        self.cursors.insert(name.to_string(), value);
        Ok(())
    }

    fn insert_proposal(&self, draft: ProposalDraft, now: u64) -> StoreResult<Proposal> {
        let id = ProposalId(self.next_proposal.fetch_add(1, Ordering::SeqCst) + 1);
        let proposal = Proposal::from_draft(id, draft, now);
        self.proposals.insert(id, proposal.clone());
        Ok(proposal)
    }

    fn get_proposal(&self, id: ProposalId) -> StoreResult<Option<Proposal>> {
        Ok(self.proposals.get(&id).map(|p| p.value().clone()))
    }

    fn list_proposals(&self, status: Option<ProposalStatus>) -> StoreResult<Vec<Proposal>> {
        let mut out: Vec<Proposal> = self
            .proposals
            .iter()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .map(|p| p.value().clone())
            .collect();
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    fn update_proposal_if(
        &self,
        id: ProposalId,
        guard: ProposalGuard<'_>,
    ) -> StoreResult<Update<Proposal>> {
        let mut entry = self.proposals.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "proposal",
            id: id.to_string(),
        })?;
        Ok(match guard(entry.value()) {
            Some(next) => {
                *entry.value_mut() = next.clone();
                Update::Applied(next)
            }
            None => Update::Rejected(entry.value().clone()),
        })
    }

    fn list_approved_unexpanded(&self) -> StoreResult<Vec<Proposal>> {
        let mut out: Vec<Proposal> = self
            .proposals
            .iter()
            .filter(|p| p.status == ProposalStatus::Approved)
            .map(|p| p.value().clone())
            .collect();
        out.retain(|p| !self.step_index.contains_key(&p.id));
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    fn expand_proposal(&self, id: ProposalId) -> StoreResult<Expansion> {
        // Holding the proposal entry serializes concurrent expansions.
        let mut entry = self.proposals.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "proposal",
            id: id.to_string(),
        })?;

        let existing = self.step_index.get(&id).map(|ids| ids.value().clone());
        if let Some(ids) = existing {
            return Ok(Expansion::AlreadyExpanded {
                proposal: entry.value().clone(),
                steps: self.steps_by_ids(&ids),
            });
        }

        let proposal = entry.value_mut();
        if proposal.mark_expanded().is_err() {
            return Ok(Expansion::NotApproved(proposal.clone()));
        }

        let steps: Vec<Step> = proposal
            .step_kinds
            .iter()
            .enumerate()
            .map(|(position, kind)| {
                let step_id = StepId(self.next_step.fetch_add(1, Ordering::SeqCst) + 1);
                Step::queued(step_id, id, position, kind)
            })
            .collect();
        for step in &steps {
            self.steps.insert(step.id, step.clone());
        }
        self.step_index
            .insert(id, steps.iter().map(|s| s.id).collect());

        Ok(Expansion::Expanded {
            proposal: proposal.clone(),
            steps,
        })
    }

    fn get_step(&self, id: StepId) -> StoreResult<Option<Step>> {
        Ok(self.steps.get(&id).map(|s| s.value().clone()))
    }

    fn steps_for(&self, proposal: ProposalId) -> StoreResult<Vec<Step>> {
        let ids = self
            .step_index
            .get(&proposal)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        Ok(self.steps_by_ids(&ids))
    }

    fn claimable_steps(&self, kinds: &BTreeSet<String>, limit: usize) -> StoreResult<Vec<Step>> {
        let mut queued: Vec<Step> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Queued && kinds.contains(&s.kind))
            .map(|s| s.value().clone())
            .collect();
        queued.sort_by_key(|s| s.id);
        Ok(queued
            .into_iter()
            .filter(|s| {
                self.proposals
                    .get(&s.proposal_id)
                    .is_some_and(|p| p.status == ProposalStatus::InProgress)
            })
            .take(limit)
            .collect())
    }

    fn update_step_if(&self, id: StepId, guard: StepGuard<'_>) -> StoreResult<Update<Step>> {
        let mut entry = self.steps.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "step",
            id: id.to_string(),
        })?;
        Ok(match guard(entry.value()) {
            Some(next) => {
                *entry.value_mut() = next.clone();
                Update::Applied(next)
            }
            None => Update::Rejected(entry.value().clone()),
        })
    }

    fn list_stale_steps(&self, cutoff: u64) -> StoreResult<Vec<Step>> {
        let mut out: Vec<Step> = self
            .steps
            .iter()
            .filter(|s| {
                matches!(s.status, StepStatus::Claimed | StepStatus::Running)
                    && s.claimed_at.is_some_and(|at| at < cutoff)
            })
            .map(|s| s.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    fn put_trigger(&self, mut trigger: Trigger) -> StoreResult<Trigger> {
        if trigger.id.is_empty() {
            trigger.id = generate_trigger_id();
        }
        self.triggers.insert(trigger.id.clone(), trigger.clone());
        Ok(trigger)
    }

    fn remove_trigger(&self, id: &str) -> StoreResult<bool> {
        Ok(self.triggers.remove(id).is_some())
    }

    fn record_trigger_fired(&self, id: &str, at: u64) -> StoreResult<bool> {
        Ok(match self.triggers.get_mut(id) {
            Some(mut trigger) => {
                let last = trigger.last_fired_at.map_or(at, |prev| prev.max(at));
                trigger.last_fired_at = Some(last);
                true
            }
            None => false,
        })
    }

    fn list_triggers(&self) -> StoreResult<Vec<Trigger>> {
        let mut out: Vec<Trigger> = self.triggers.iter().map(|t| t.value().clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn put_agent(&self, record: AgentRecord) -> StoreResult<()> {
        self.agents.insert(record.agent_id.clone(), record);
        Ok(())
    }

    fn list_agents(&self) -> StoreResult<Vec<AgentRecord>> {
        let mut out: Vec<AgentRecord> = self.agents.iter().map(|a| a.value().clone()).collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(out)
    }
}
