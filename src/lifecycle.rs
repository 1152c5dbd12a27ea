//! Proposal lifecycle manager.
//!
//! [`Workflow`] applies the pure transitions from [`crate::workflow`] through
//! the store's conditional updates and emits the resulting events. It holds
//! no mutable state of its own; any number of executors and one heartbeat
//! can share a store through separate `Workflow` values.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::clock::Clock;
use crate::error::{StoreError, WorkflowError};
use crate::event::{Event, Payload, kinds, payload};
use crate::store::{Expansion, Update, WorkflowStore};
use crate::workflow::{
    FailureOutcome, Proposal, ProposalDraft, ProposalId, ProposalSource, ProposalStatus, Step,
    StepId, StepStatus, WorkflowResult,
};

/// A step report after it has been applied.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: Step,
    /// The parent proposal after re-derivation.
    pub proposal: Proposal,
}

impl StepReport {
    /// How a failure report left the step, if it was one.
    pub fn failure_outcome(&self) -> Option<FailureOutcome> {
        match self.step.status {
            StepStatus::Failed => Some(FailureOutcome::Exhausted),
            StepStatus::Queued => Some(FailureOutcome::Requeued),
            _ => None,
        }
    }
}

fn step_payload(step: &Step, agent_id: Option<&str>) -> Payload {
    let mut p = payload([
        ("step_id", json!(step.id.0)),
        ("proposal_id", json!(step.proposal_id.0)),
        ("step_kind", json!(step.kind)),
        ("attempt", json!(step.attempt)),
    ]);
    if let Some(agent) = agent_id {
        p.insert("agent_id".into(), json!(agent));
    }
    p
}

fn proposal_payload(proposal: &Proposal) -> Payload {
    payload([
        ("proposal_id", json!(proposal.id.0)),
        ("title", json!(proposal.title)),
        ("status", json!(proposal.status.as_str())),
    ])
}

/// Store-backed proposal and step operations.
#[derive(Clone)]
pub struct Workflow {
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    pub fn new(store: Arc<dyn WorkflowStore>, clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self {
            store,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    // -----------------------------------------------------------------------
    // Conditional update plumbing
    // -----------------------------------------------------------------------

    fn transition_step(
        &self,
        id: StepId,
        apply: impl Fn(&mut Step) -> WorkflowResult<()>,
    ) -> WorkflowResult<Step> {
        let rejection = RefCell::new(None);
        let guard = |current: &Step| {
            let mut next = current.clone();
            match apply(&mut next) {
                Ok(()) => Some(next),
                Err(e) => {
                    rejection.replace(Some(e));
                    None
                }
            }
        };
        match self.store.update_step_if(id, &guard) {
            Ok(Update::Applied(step)) => Ok(step),
            Ok(Update::Rejected(current)) => Err(rejection.into_inner().unwrap_or_else(|| {
                WorkflowError::InvalidTransition {
                    entity: "step",
                    id: id.0,
                    from: current.status.to_string(),
                    to: "unknown".into(),
                }
            })),
            Err(StoreError::NotFound { .. }) => Err(WorkflowError::StepNotFound { id: id.0 }),
            Err(e) => Err(e.into()),
        }
    }

    fn transition_proposal(
        &self,
        id: ProposalId,
        apply: impl Fn(&mut Proposal) -> WorkflowResult<()>,
    ) -> WorkflowResult<Proposal> {
        let rejection = RefCell::new(None);
        let guard = |current: &Proposal| {
            let mut next = current.clone();
            match apply(&mut next) {
                Ok(()) => Some(next),
                Err(e) => {
                    rejection.replace(Some(e));
                    None
                }
            }
        };
        match self.store.update_proposal_if(id, &guard) {
            Ok(Update::Applied(proposal)) => Ok(proposal),
            Ok(Update::Rejected(current)) => Err(rejection.into_inner().unwrap_or_else(|| {
                WorkflowError::InvalidTransition {
                    entity: "proposal",
                    id: id.0,
                    from: current.status.to_string(),
                    to: "unknown".into(),
                }
            })),
            Err(StoreError::NotFound { .. }) => Err(WorkflowError::ProposalNotFound { id: id.0 }),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append an event stamped with the current time.
    pub fn log_event(&self, kind: &str, payload: Payload) -> WorkflowResult<Event> {
        Ok(self.store.append_event(kind, payload, self.now())?)
    }

    // -----------------------------------------------------------------------
    // Proposals
    // -----------------------------------------------------------------------

    pub fn proposal(&self, id: ProposalId) -> WorkflowResult<Proposal> {
        self.store
            .get_proposal(id)?
            .ok_or(WorkflowError::ProposalNotFound { id: id.0 })
    }

    pub fn steps(&self, id: ProposalId) -> WorkflowResult<Vec<Step>> {
        Ok(self.store.steps_for(id)?)
    }

    /// Store a draft as `pending_approval`, or `approved` when auto-approved.
    pub fn create_proposal(&self, draft: ProposalDraft) -> WorkflowResult<Proposal> {
        if draft.step_kinds.is_empty() {
            return Err(WorkflowError::EmptyProposal { title: draft.title });
        }
        let proposal = self.store.insert_proposal(draft, self.now())?;
        tracing::info!(
            proposal = %proposal.id,
            status = %proposal.status,
            title = %proposal.title,
            "proposal created",
        );
        self.log_event(kinds::PROPOSAL_CREATED, proposal_payload(&proposal))?;
        Ok(proposal)
    }

    /// Manual submission path, bypassing the trigger engine.
    pub fn submit_proposal(
        &self,
        title: &str,
        step_kinds: Vec<String>,
        auto_approve: bool,
    ) -> WorkflowResult<Proposal> {
        self.create_proposal(ProposalDraft {
            title: title.to_string(),
            step_kinds,
            auto_approve,
            source: ProposalSource::Manual,
        })
    }

    /// `pending_approval -> approved`.
    pub fn approve(&self, id: ProposalId) -> WorkflowResult<Proposal> {
        let now = self.now();
        let proposal = self.transition_proposal(id, |p| p.approve(now))?;
        tracing::info!(proposal = %id, "proposal approved");
        Ok(proposal)
    }

    /// Materialize steps for an approved proposal. Calling it again returns
    /// the existing steps unchanged.
    pub fn expand(&self, id: ProposalId) -> WorkflowResult<Vec<Step>> {
        match self.store.expand_proposal(id) {
            Ok(Expansion::Expanded { steps, .. }) => {
                tracing::info!(proposal = %id, steps = steps.len(), "proposal expanded");
                Ok(steps)
            }
            Ok(Expansion::AlreadyExpanded { steps, .. }) => Ok(steps),
            Ok(Expansion::NotApproved(proposal)) => Err(WorkflowError::InvalidTransition {
                entity: "proposal",
                id: id.0,
                from: proposal.status.to_string(),
                to: ProposalStatus::InProgress.to_string(),
            }),
            Err(StoreError::NotFound { .. }) => Err(WorkflowError::ProposalNotFound { id: id.0 }),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel a proposal whose steps have not started running. Queued steps
    /// stay queued but are no longer claimable.
    ///
    /// The running-step check reads the steps before the proposal update
    /// commits, so a `begin_step` landing in between still runs. Its report
    /// is recorded on the step and never revives the cancelled proposal.
    pub fn cancel(&self, id: ProposalId) -> WorkflowResult<Proposal> {
        let steps = self.store.steps_for(id)?;
        let now = self.now();
        let proposal = self.transition_proposal(id, |p| p.cancel(&steps, now))?;
        tracing::info!(proposal = %id, "proposal cancelled");
        self.log_event(kinds::PROPOSAL_CANCELLED, proposal_payload(&proposal))?;
        Ok(proposal)
    }

    /// Re-derive a proposal's status from its steps and persist any change.
    pub fn recompute(&self, id: ProposalId) -> WorkflowResult<Proposal> {
        let steps = self.store.steps_for(id)?;
        let now = self.now();
        let guard = |current: &Proposal| {
            let mut next = current.clone();
            next.apply_derived(&steps, now).map(|_| next)
        };
        let update = match self.store.update_proposal_if(id, &guard) {
            Ok(update) => update,
            Err(StoreError::NotFound { .. }) => {
                return Err(WorkflowError::ProposalNotFound { id: id.0 });
            }
            Err(e) => return Err(e.into()),
        };
        let Update::Applied(proposal) = update else {
            return Ok(update.into_inner());
        };

        let kind = match proposal.status {
            ProposalStatus::Completed => kinds::PROPOSAL_COMPLETED,
            ProposalStatus::Failed => kinds::PROPOSAL_FAILED,
            _ => return Ok(proposal),
        };
        tracing::info!(proposal = %id, status = %proposal.status, "proposal finished");
        let mut body = proposal_payload(&proposal);
        if let Some(failed) = steps.iter().find(|s| s.status == StepStatus::Failed) {
            body.insert("step_id".into(), json!(failed.id.0));
            body.insert("error".into(), json!(failed.error));
        }
        self.log_event(kind, body)?;
        Ok(proposal)
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Atomically claim one claimable step of the given kinds.
    pub fn claim(&self, kinds: &BTreeSet<String>, agent_id: &str) -> WorkflowResult<Option<Step>> {
        Ok(self.store.claim_step(kinds, agent_id, self.now())?)
    }

    /// `claimed -> running` by the holder.
    pub fn begin_step(&self, id: StepId, agent_id: &str) -> WorkflowResult<Step> {
        self.transition_step(id, |s| s.begin(agent_id))
    }

    /// Give a claim back without consuming an attempt.
    pub fn release_step(&self, id: StepId, agent_id: &str) -> WorkflowResult<Step> {
        self.transition_step(id, |s| s.release(agent_id))
    }

    /// Record a successful execution.
    ///
    /// Fails with `InvalidTransition` if the claim was reclaimed in the
    /// meantime; the late result is then discarded by the caller.
    pub fn complete_step(
        &self,
        id: StepId,
        agent_id: &str,
        result: Value,
    ) -> WorkflowResult<StepReport> {
        let step = self.transition_step(id, |s| s.complete(agent_id, result.clone()))?;
        // Re-derive before appending: the step is already terminal, so nothing
        // else would bring the proposal up to date after an early return.
        let recomputed = self.recompute(step.proposal_id);
        self.log_event(kinds::STEP_COMPLETED, step_payload(&step, Some(agent_id)))?;
        let proposal = recomputed?;
        if proposal.status == ProposalStatus::Cancelled {
            tracing::info!(
                step = %step.id,
                proposal = %proposal.id,
                "step completed after its proposal was cancelled",
            );
        }
        Ok(StepReport { step, proposal })
    }

    /// Record a failed execution: requeue, or fail terminally once attempts
    /// are exhausted.
    pub fn fail_step(&self, id: StepId, agent_id: &str, error: &str) -> WorkflowResult<StepReport> {
        let max = self.max_attempts;
        let step = self.transition_step(id, |s| s.fail(agent_id, error, max).map(|_| ()))?;
        let terminal = step.status == StepStatus::Failed;
        let recomputed = if terminal {
            self.recompute(step.proposal_id)
        } else {
            self.proposal(step.proposal_id)
        };
        let mut body = step_payload(&step, Some(agent_id));
        body.insert("error".into(), json!(error));
        body.insert("terminal".into(), json!(terminal));
        self.log_event(kinds::STEP_FAILED, body)?;
        Ok(StepReport {
            step,
            proposal: recomputed?,
        })
    }

    /// Reclaim a step whose claim predates `cutoff`.
    ///
    /// Returns `None` if the step was re-claimed or finished after the stale
    /// scan saw it.
    pub fn reclaim_stale(&self, id: StepId, cutoff: u64) -> WorkflowResult<Option<StepReport>> {
        let max = self.max_attempts;
        let reclaimed = self.transition_step(id, |s| {
            if !s.claimed_at.is_some_and(|at| at < cutoff) {
                return Err(WorkflowError::ClaimConflict {
                    step_id: s.id.0,
                    agent_id: s.claimed_by.clone().unwrap_or_default(),
                });
            }
            s.reclaim_stale(max).map(|_| ())
        });
        let step = match reclaimed {
            Ok(step) => step,
            Err(WorkflowError::ClaimConflict { .. } | WorkflowError::InvalidTransition { .. }) => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let terminal = step.status == StepStatus::Failed;
        tracing::warn!(step = %step.id, attempt = step.attempt, terminal, "stale step reclaimed");
        let mut body = step_payload(&step, None);
        body.insert("error".into(), json!(step.error));
        let recomputed = if terminal {
            body.insert("terminal".into(), json!(true));
            self.recompute(step.proposal_id)
        } else {
            self.proposal(step.proposal_id)
        };
        let kind = if terminal {
            kinds::STEP_FAILED
        } else {
            kinds::STEP_REQUEUED
        };
        self.log_event(kind, body)?;
        Ok(Some(StepReport {
            step,
            proposal: recomputed?,
        }))
    }
}
