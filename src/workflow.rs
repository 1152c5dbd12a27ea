//! Proposal and step records and their state machine.
//!
//! Every transition here is pure: it checks the current status, mutates the
//! record, or returns [`WorkflowError::InvalidTransition`]. Stores apply these
//! methods inside their conditional updates, which is what makes a claim
//! atomic.
//!
//! ```text
//! Step:      queued -(claim)-> claimed -(begin)-> running -(success)-> completed
//!            running -(error, attempt < max)-> queued
//!            running -(error, attempt >= max)-> failed
//!            claimed|running -(stale)-> queued | failed
//!
//! Proposal:  pending_approval -(approve)-> approved -(expand)-> in_progress
//!            in_progress -> completed | failed   (derived from steps)
//!            pending_approval | approved | in_progress -(cancel)-> cancelled
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowError;

pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u64);

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    PendingApproval,
    Approved,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "draft" => Self::Draft,
            "pending_approval" | "pending" => Self::PendingApproval,
            "approved" => Self::Approved,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(format!("unknown proposal status \"{other}\"")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Claimed,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Where a proposal came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "origin")]
pub enum ProposalSource {
    Manual,
    Trigger { trigger_id: String, event_seq: u64 },
}

/// A proposal before it has been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub title: String,
    pub step_kinds: Vec<String>,
    pub auto_approve: bool,
    pub source: ProposalSource,
}

/// A unit of requested work, expanded into one step per entry of `step_kinds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub title: String,
    pub step_kinds: Vec<String>,
    pub status: ProposalStatus,
    pub source: ProposalSource,
    pub created_at: u64,
    pub approved_at: Option<u64>,
    pub completed_at: Option<u64>,
}

/// The smallest claimable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub proposal_id: ProposalId,
    /// Position within the proposal's `step_kinds`.
    pub position: usize,
    pub kind: String,
    pub status: StepStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<u64>,
    /// Failed or abandoned executions so far.
    pub attempt: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// How a step left `running` (or `claimed`) after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued,
    Exhausted,
}

fn invalid<T: fmt::Display>(entity: &'static str, id: u64, from: T, to: &str) -> WorkflowError {
    WorkflowError::InvalidTransition {
        entity,
        id,
        from: from.to_string(),
        to: to.to_string(),
    }
}

impl Step {
    /// A fresh queued step.
    pub fn queued(id: StepId, proposal_id: ProposalId, position: usize, kind: &str) -> Self {
        Self {
            id,
            proposal_id,
            position,
            kind: kind.to_string(),
            status: StepStatus::Queued,
            claimed_by: None,
            claimed_at: None,
            attempt: 0,
            result: None,
            error: None,
        }
    }

    fn invalid(&self, to: &str) -> WorkflowError {
        invalid("step", self.id.0, self.status, to)
    }

    fn ensure_owner(&self, agent_id: &str, to: &str) -> WorkflowResult<()> {
        if self.claimed_by.as_deref() == Some(agent_id) {
            Ok(())
        } else {
            Err(self.invalid(to))
        }
    }

    fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
    }

    fn after_failure(&mut self, max_attempts: u32) -> FailureOutcome {
        self.attempt += 1;
        self.clear_claim();
        if self.attempt >= max_attempts {
            self.status = StepStatus::Failed;
            FailureOutcome::Exhausted
        } else {
            self.status = StepStatus::Queued;
            FailureOutcome::Requeued
        }
    }

    /// `queued -> claimed`.
    pub fn claim(&mut self, agent_id: &str, now: u64) -> WorkflowResult<()> {
        if self.status != StepStatus::Queued {
            return Err(self.invalid("claimed"));
        }
        self.status = StepStatus::Claimed;
        self.claimed_by = Some(agent_id.to_string());
        self.claimed_at = Some(now);
        Ok(())
    }

    /// `claimed -> running`, only by the claim holder.
    pub fn begin(&mut self, agent_id: &str) -> WorkflowResult<()> {
        if self.status != StepStatus::Claimed {
            return Err(self.invalid("running"));
        }
        self.ensure_owner(agent_id, "running")?;
        self.status = StepStatus::Running;
        Ok(())
    }

    /// `running -> completed`, only by the claim holder.
    pub fn complete(&mut self, agent_id: &str, result: Value) -> WorkflowResult<()> {
        if self.status != StepStatus::Running {
            return Err(self.invalid("completed"));
        }
        self.ensure_owner(agent_id, "completed")?;
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// `running -> queued | failed` after the step function raised.
    pub fn fail(
        &mut self,
        agent_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> WorkflowResult<FailureOutcome> {
        if self.status != StepStatus::Running {
            return Err(self.invalid("failed"));
        }
        self.ensure_owner(agent_id, "failed")?;
        self.error = Some(error.to_string());
        Ok(self.after_failure(max_attempts))
    }

    /// `claimed | running -> queued | failed` once the claim has gone stale.
    pub fn reclaim_stale(&mut self, max_attempts: u32) -> WorkflowResult<FailureOutcome> {
        if !matches!(self.status, StepStatus::Claimed | StepStatus::Running) {
            return Err(self.invalid("queued"));
        }
        let holder = self.claimed_by.as_deref().unwrap_or("unknown");
        self.error = Some(format!("claim by {holder} went stale"));
        Ok(self.after_failure(max_attempts))
    }

    /// `claimed -> queued` without consuming an attempt.
    pub fn release(&mut self, agent_id: &str) -> WorkflowResult<()> {
        if self.status != StepStatus::Claimed {
            return Err(self.invalid("queued"));
        }
        self.ensure_owner(agent_id, "queued")?;
        self.status = StepStatus::Queued;
        self.clear_claim();
        Ok(())
    }
}

impl Proposal {
    /// Store-side constructor: applies `auto_approve`.
    pub fn from_draft(id: ProposalId, draft: ProposalDraft, now: u64) -> Self {
        let (status, approved_at) = if draft.auto_approve {
            (ProposalStatus::Approved, Some(now))
        } else {
            (ProposalStatus::PendingApproval, None)
        };
        Self {
            id,
            title: draft.title,
            step_kinds: draft.step_kinds,
            status,
            source: draft.source,
            created_at: now,
            approved_at,
            completed_at: None,
        }
    }

    fn invalid(&self, to: &str) -> WorkflowError {
        invalid("proposal", self.id.0, self.status, to)
    }

    /// `pending_approval -> approved`.
    pub fn approve(&mut self, now: u64) -> WorkflowResult<()> {
        if self.status != ProposalStatus::PendingApproval {
            return Err(self.invalid("approved"));
        }
        self.status = ProposalStatus::Approved;
        self.approved_at = Some(now);
        Ok(())
    }

    /// `approved -> in_progress` once steps exist.
    pub fn mark_expanded(&mut self) -> WorkflowResult<()> {
        if self.status != ProposalStatus::Approved {
            return Err(self.invalid("in_progress"));
        }
        self.status = ProposalStatus::InProgress;
        Ok(())
    }

    /// Cancel before any step has started running.
    pub fn cancel(&mut self, steps: &[Step], now: u64) -> WorkflowResult<()> {
        let cancellable = matches!(
            self.status,
            ProposalStatus::PendingApproval | ProposalStatus::Approved | ProposalStatus::InProgress
        );
        if !cancellable || steps.iter().any(|s| s.status == StepStatus::Running) {
            return Err(self.invalid("cancelled"));
        }
        self.status = ProposalStatus::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Fold the derived status in. Returns the new status if it changed.
    ///
    /// Only an `in_progress` proposal follows its steps; terminal proposals
    /// never change again.
    pub fn apply_derived(&mut self, steps: &[Step], now: u64) -> Option<ProposalStatus> {
        if self.status != ProposalStatus::InProgress || steps.is_empty() {
            return None;
        }
        let derived = derive_status(steps);
        if derived == self.status {
            return None;
        }
        self.status = derived;
        if derived.is_terminal() {
            self.completed_at = Some(now);
        }
        Some(derived)
    }
}

/// Proposal status implied by its steps.
///
/// Any terminally failed step fails the whole proposal; otherwise the proposal
/// completes once every step has.
pub fn derive_status(steps: &[Step]) -> ProposalStatus {
    if steps.iter().any(|s| s.status == StepStatus::Failed) {
        ProposalStatus::Failed
    } else if steps.iter().all(|s| s.status == StepStatus::Completed) {
        ProposalStatus::Completed
    } else {
        ProposalStatus::InProgress
    }
}
