//! [`MemStore`] wrapper that fails selected operations on request.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{
    AgentRecord, Expansion, MemStore, ProposalGuard, StepGuard, StoreResult, Update, WorkflowStore,
};
use crate::error::StoreError;
use crate::event::{Event, Payload};
use crate::trigger::Trigger;
use crate::workflow::{Proposal, ProposalDraft, ProposalId, ProposalStatus, Step, StepId};

type Hook = Box<dyn FnOnce(&MemStore) + Send>;

#[derive(Default)]
pub struct FaultyStore {
    inner: MemStore,
    failing_appends: AtomicUsize,
    failing_step_reads: AtomicUsize,
    failing_trigger_reads: AtomicBool,
    before_append: Mutex<Option<Hook>>,
}

fn injected(op: &str) -> StoreError {
    StoreError::Redb {
        message: format!("{op} failed: injected fault"),
    }
}

/// Consume one pending failure, if any.
fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` event appends.
    pub fn fail_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `steps_for` reads.
    pub fn fail_step_reads(&self, n: usize) {
        self.failing_step_reads.store(n, Ordering::SeqCst);
    }

    /// Fail every `list_triggers` call until switched off.
    pub fn fail_trigger_reads(&self, on: bool) {
        self.failing_trigger_reads.store(on, Ordering::SeqCst);
    }

    /// Run `hook` against the backing store just before the next event
    /// append, standing in for another process writing concurrently.
    pub fn before_next_append(&self, hook: impl FnOnce(&MemStore) + Send + 'static) {
        if let Ok(mut slot) = self.before_append.lock() {
            *slot = Some(Box::new(hook));
        }
    }
}

impl WorkflowStore for FaultyStore {
    fn append_event(&self, kind: &str, payload: Payload, occurred_at: u64) -> StoreResult<Event> {
        let hook = self.before_append.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        if take(&self.failing_appends) {
            return Err(injected("append_event"));
        }
        self.inner.append_event(kind, payload, occurred_at)
    }

    fn events_after(&self, after: u64, limit: usize) -> StoreResult<Vec<Event>> {
        self.inner.events_after(after, limit)
    }

    fn last_event_seq(&self) -> StoreResult<u64> {
        self.inner.last_event_seq()
    }

    fn cursor(&self, name: &str) -> StoreResult<u64> {
        self.inner.cursor(name)
    }

    fn set_cursor(&self, name: &str, value: u64) -> StoreResult<()> {
        self.inner.set_cursor(name, value)
    }

    fn insert_proposal(&self, draft: ProposalDraft, now: u64) -> StoreResult<Proposal> {
        self.inner.insert_proposal(draft, now)
    }

    fn get_proposal(&self, id: ProposalId) -> StoreResult<Option<Proposal>> {
        self.inner.get_proposal(id)
    }

    fn list_proposals(&self, status: Option<ProposalStatus>) -> StoreResult<Vec<Proposal>> {
        self.inner.list_proposals(status)
    }

    fn update_proposal_if(
        &self,
        id: ProposalId,
        guard: ProposalGuard<'_>,
    ) -> StoreResult<Update<Proposal>> {
        self.inner.update_proposal_if(id, guard)
    }

    fn list_approved_unexpanded(&self) -> StoreResult<Vec<Proposal>> {
        self.inner.list_approved_unexpanded()
    }

    fn expand_proposal(&self, id: ProposalId) -> StoreResult<Expansion> {
        self.inner.expand_proposal(id)
    }

    fn get_step(&self, id: StepId) -> StoreResult<Option<Step>> {
        self.inner.get_step(id)
    }

    fn steps_for(&self, proposal: ProposalId) -> StoreResult<Vec<Step>> {
        if take(&self.failing_step_reads) {
            return Err(injected("steps_for"));
        }
        self.inner.steps_for(proposal)
    }

    fn claimable_steps(&self, kinds: &BTreeSet<String>, limit: usize) -> StoreResult<Vec<Step>> {
        self.inner.claimable_steps(kinds, limit)
    }

    fn update_step_if(&self, id: StepId, guard: StepGuard<'_>) -> StoreResult<Update<Step>> {
        self.inner.update_step_if(id, guard)
    }

    fn list_stale_steps(&self, cutoff: u64) -> StoreResult<Vec<Step>> {
        self.inner.list_stale_steps(cutoff)
    }

    fn put_trigger(&self, trigger: Trigger) -> StoreResult<Trigger> {
        self.inner.put_trigger(trigger)
    }

    fn remove_trigger(&self, id: &str) -> StoreResult<bool> {
        self.inner.remove_trigger(id)
    }

    fn record_trigger_fired(&self, id: &str, at: u64) -> StoreResult<bool> {
        self.inner.record_trigger_fired(id, at)
    }

    fn list_triggers(&self) -> StoreResult<Vec<Trigger>> {
        if self.failing_trigger_reads.load(Ordering::SeqCst) {
            return Err(injected("list_triggers"));
        }
        self.inner.list_triggers()
    }

    fn put_agent(&self, record: AgentRecord) -> StoreResult<()> {
        self.inner.put_agent(record)
    }

    fn list_agents(&self) -> StoreResult<Vec<AgentRecord>> {
        self.inner.list_agents()
    }
}
