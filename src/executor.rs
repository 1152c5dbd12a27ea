//! Agent executor: claims steps of its kinds and runs them.
//!
//! An executor is configured with an agent id and a flat `kind -> StepFn`
//! table. Each poll claims at most one step through the store's conditional
//! claim, runs the mapped function and reports the outcome. Executors share
//! nothing in-process; any number of them (for the same or different agents)
//! can poll one store concurrently.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::error::{ExecutionError, ExecutorError, WorkflowError};
use crate::lifecycle::Workflow;
use crate::store::AgentRecord;
use crate::workflow::{ProposalStatus, Step, StepId, StepStatus, WorkflowResult};

/// A step function: the work behind one step kind.
pub type StepFn = Arc<dyn Fn(&Step) -> Result<Value, ExecutionError> + Send + Sync>;

/// What one poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing claimable.
    Idle,
    Completed { step_id: StepId, proposal_status: ProposalStatus },
    /// The function failed and the step went back to `queued`.
    Retrying { step_id: StepId, attempt: u32 },
    /// The function failed and the step ran out of attempts.
    Failed { step_id: StepId, proposal_status: ProposalStatus },
    /// The parent proposal stopped between listing and claim; the claim was
    /// handed back.
    Released { step_id: StepId },
    /// The claim was reclaimed while the step ran; the result was discarded.
    Lost { step_id: StepId },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects the handler table for one agent.
pub struct ExecutorBuilder {
    agent_id: String,
    handlers: BTreeMap<String, StepFn>,
    kinds: Option<BTreeSet<String>>,
    poll_interval: Duration,
}

impl ExecutorBuilder {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            handlers: BTreeMap::new(),
            kinds: None,
            poll_interval: Duration::from_secs(30),
        }
    }

    /// Map a step kind to its function.
    pub fn handler<F>(mut self, kind: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Step) -> Result<Value, ExecutionError> + Send + Sync + 'static,
    {
        self.handlers.insert(kind.into(), Arc::new(f));
        self
    }

    /// Claim only these kinds instead of every kind with a handler.
    pub fn kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self, workflow: Workflow) -> Result<AgentExecutor, ExecutorError> {
        let kinds = match self.kinds {
            Some(kinds) => {
                if let Some(kind) = kinds.iter().find(|k| !self.handlers.contains_key(*k)) {
                    return Err(ExecutorError::MissingHandler {
                        agent_id: self.agent_id,
                        kind: kind.clone(),
                    });
                }
                kinds
            }
            None => self.handlers.keys().cloned().collect(),
        };
        if kinds.is_empty() {
            return Err(ExecutorError::NoStepKinds {
                agent_id: self.agent_id,
            });
        }
        Ok(AgentExecutor {
            agent_id: self.agent_id,
            kinds,
            handlers: self.handlers,
            poll_interval: self.poll_interval,
            workflow,
            registered_at: AtomicU64::new(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct AgentExecutor {
    agent_id: String,
    kinds: BTreeSet<String>,
    handlers: BTreeMap<String, StepFn>,
    poll_interval: Duration,
    workflow: Workflow,
    registered_at: AtomicU64,
}

impl std::fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExecutor")
            .field("agent_id", &self.agent_id)
            .field("kinds", &self.kinds)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("step function panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("step function panicked: {s}")
    } else {
        "step function panicked".to_string()
    }
}

impl AgentExecutor {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn kinds(&self) -> &BTreeSet<String> {
        &self.kinds
    }

    /// Record this agent in the store's agent registry.
    pub fn register(&self) -> WorkflowResult<AgentRecord> {
        let now = self.workflow.now();
        self.registered_at.store(now, Ordering::Relaxed);
        let record = AgentRecord {
            agent_id: self.agent_id.clone(),
            step_kinds: self.kinds.clone(),
            registered_at: now,
            last_seen_at: now,
        };
        self.workflow.store().put_agent(record.clone())?;
        tracing::info!(agent = %self.agent_id, kinds = ?self.kinds, "agent registered");
        Ok(record)
    }

    fn touch(&self) -> WorkflowResult<()> {
        let now = self.workflow.now();
        let registered_at = match self.registered_at.load(Ordering::Relaxed) {
            0 => now,
            at => at,
        };
        self.workflow.store().put_agent(AgentRecord {
            agent_id: self.agent_id.clone(),
            step_kinds: self.kinds.clone(),
            registered_at,
            last_seen_at: now,
        })?;
        Ok(())
    }

    /// Claim and run at most one step.
    pub fn poll_once(&self) -> WorkflowResult<PollOutcome> {
        let agent = self.agent_id.as_str();
        let Some(claimed) = self.workflow.claim(&self.kinds, agent)? else {
            return Ok(PollOutcome::Idle);
        };
        tracing::debug!(agent, step = %claimed.id, kind = %claimed.kind, "step claimed");

        let proposal = self.workflow.proposal(claimed.proposal_id)?;
        if proposal.status != ProposalStatus::InProgress {
            self.workflow.release_step(claimed.id, agent)?;
            tracing::info!(
                agent,
                step = %claimed.id,
                proposal = %proposal.id,
                status = %proposal.status,
                "proposal no longer in progress; claim released",
            );
            return Ok(PollOutcome::Released {
                step_id: claimed.id,
            });
        }

        let step = match self.workflow.begin_step(claimed.id, agent) {
            Ok(step) => step,
            Err(WorkflowError::InvalidTransition { .. }) => {
                tracing::warn!(agent, step = %claimed.id, "claim lost before the step started");
                return Ok(PollOutcome::Lost {
                    step_id: claimed.id,
                });
            }
            Err(e) => return Err(e),
        };

        let result = match self.handlers.get(&step.kind) {
            Some(handler) => catch_unwind(AssertUnwindSafe(|| handler(&step)))
                .unwrap_or_else(|panic| Err(ExecutionError::new(panic_message(&*panic)))),
            None => Err(ExecutionError::new(format!(
                "no handler for step kind \"{}\"",
                step.kind
            ))),
        };

        match result {
            Ok(value) => match self.workflow.complete_step(step.id, agent, value) {
                Ok(report) => {
                    tracing::info!(agent, step = %step.id, kind = %step.kind, "step completed");
                    Ok(PollOutcome::Completed {
                        step_id: step.id,
                        proposal_status: report.proposal.status,
                    })
                }
                Err(WorkflowError::InvalidTransition { .. }) => {
                    tracing::warn!(agent, step = %step.id, "claim was reclaimed; late result discarded");
                    Ok(PollOutcome::Lost { step_id: step.id })
                }
                Err(e) => Err(e),
            },
            Err(failure) => match self.workflow.fail_step(step.id, agent, &failure.message) {
                Ok(report) if report.step.status == StepStatus::Failed => {
                    tracing::warn!(
                        agent,
                        step = %step.id,
                        attempt = report.step.attempt,
                        error = %failure,
                        "step failed terminally",
                    );
                    Ok(PollOutcome::Failed {
                        step_id: step.id,
                        proposal_status: report.proposal.status,
                    })
                }
                Ok(report) => {
                    tracing::info!(
                        agent,
                        step = %step.id,
                        attempt = report.step.attempt,
                        error = %failure,
                        "step failed; requeued",
                    );
                    Ok(PollOutcome::Retrying {
                        step_id: step.id,
                        attempt: report.step.attempt,
                    })
                }
                Err(WorkflowError::InvalidTransition { .. }) => {
                    tracing::warn!(agent, step = %step.id, "claim was reclaimed; late failure discarded");
                    Ok(PollOutcome::Lost { step_id: step.id })
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Poll on the configured interval until `shutdown` turns true.
    ///
    /// A poll error (store unavailable) is logged and retried on the next
    /// tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        use tokio::time::{MissedTickBehavior, interval};

        let registered = Arc::clone(&self);
        match tokio::task::spawn_blocking(move || registered.register()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(agent = %self.agent_id, error = %e, "agent registration failed"),
            Err(e) => tracing::error!(agent = %self.agent_id, error = %e, "registration task panicked"),
        }

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let executor = Arc::clone(&self);
                    let polled = tokio::task::spawn_blocking(move || {
                        if let Err(e) = executor.touch() {
                            tracing::debug!(agent = %executor.agent_id, error = %e, "agent heartbeat not recorded");
                        }
                        executor.poll_once()
                    })
                    .await;
                    match polled {
                        Ok(Ok(outcome)) => tracing::trace!(agent = %self.agent_id, ?outcome, "poll complete"),
                        Ok(Err(e)) => tracing::warn!(agent = %self.agent_id, error = %e, "poll failed"),
                        Err(e) => tracing::error!(agent = %self.agent_id, error = %e, "poll task panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(agent = %self.agent_id, "executor: shutdown signal received");
                        break;
                    }
                }
            }
        }
        tracing::info!(agent = %self.agent_id, "executor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemStore, WorkflowStore};

    fn workflow() -> Workflow {
        Workflow::new(
            Arc::new(MemStore::new()),
            Arc::new(ManualClock::new(1_000)),
            3,
        )
    }

    fn started(workflow: &Workflow, kinds: &[&str]) -> crate::workflow::ProposalId {
        let p = workflow
            .submit_proposal("work", kinds.iter().map(|k| k.to_string()).collect(), true)
            .unwrap();
        workflow.expand(p.id).unwrap();
        p.id
    }

    #[test]
    fn builder_validates_kinds() {
        let wf = workflow();
        let err = ExecutorBuilder::new("a").build(wf.clone()).unwrap_err();
        assert!(matches!(err, ExecutorError::NoStepKinds { .. }));

        let err = ExecutorBuilder::new("a")
            .handler("build", |_| Ok(json!(null)))
            .kinds(["build", "deploy"])
            .build(wf.clone())
            .unwrap_err();
        assert!(matches!(err, ExecutorError::MissingHandler { ref kind, .. } if kind == "deploy"));

        let executor = ExecutorBuilder::new("a")
            .handler("build", |_| Ok(json!(null)))
            .handler("test", |_| Ok(json!(null)))
            .kinds(["build"])
            .build(wf)
            .unwrap();
        assert_eq!(executor.kinds().len(), 1);
    }

    #[test]
    fn idle_without_work() {
        let executor = ExecutorBuilder::new("a")
            .handler("build", |_| Ok(json!(null)))
            .build(workflow())
            .unwrap();
        assert_eq!(executor.poll_once().unwrap(), PollOutcome::Idle);
    }

    #[test]
    fn success_stores_result() {
        let wf = workflow();
        let pid = started(&wf, &["build"]);
        let executor = ExecutorBuilder::new("builder")
            .handler("build", |step: &Step| Ok(json!({"built": step.kind})))
            .build(wf.clone())
            .unwrap();

        let outcome = executor.poll_once().unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Completed { proposal_status: ProposalStatus::Completed, .. }
        ));
        let step = &wf.steps(pid).unwrap()[0];
        assert_eq!(step.result, Some(json!({"built": "build"})));
        assert_eq!(step.claimed_by.as_deref(), Some("builder"));
    }

    #[test]
    fn always_failing_step_runs_exactly_max_attempts_times() {
        let wf = workflow();
        let pid = started(&wf, &["flaky"]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let executor = ExecutorBuilder::new("a")
            .handler("flaky", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExecutionError::new("nope"))
            })
            .build(wf.clone())
            .unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(executor.poll_once().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(outcomes[0], PollOutcome::Retrying { attempt: 1, .. }));
        assert!(matches!(outcomes[1], PollOutcome::Retrying { attempt: 2, .. }));
        assert!(matches!(
            outcomes[2],
            PollOutcome::Failed { proposal_status: ProposalStatus::Failed, .. }
        ));
        assert!(outcomes[3..].iter().all(|o| *o == PollOutcome::Idle));

        let step = &wf.steps(pid).unwrap()[0];
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempt, 3);
        assert_eq!(step.error.as_deref(), Some("nope"));
    }

    #[test]
    fn panics_count_as_failures() {
        let wf = workflow();
        started(&wf, &["explode"]);
        let executor = ExecutorBuilder::new("a")
            .handler("explode", |_| panic!("kaboom"))
            .build(wf.clone())
            .unwrap();
        let outcome = executor.poll_once().unwrap();
        assert!(matches!(outcome, PollOutcome::Retrying { attempt: 1, .. }));
        let events = wf.store().events_after(0, 100).unwrap();
        let failed = events.iter().find(|e| e.kind == "step_failed").unwrap();
        assert!(failed.payload["error"].as_str().unwrap().contains("kaboom"));
    }

    #[test]
    fn only_supported_kinds_are_claimed() {
        let wf = workflow();
        let pid = started(&wf, &["code_review", "security_check"]);
        let reviewer = ExecutorBuilder::new("reviewer")
            .handler("code_review", |_| Ok(json!("lgtm")))
            .build(wf.clone())
            .unwrap();
        assert!(matches!(reviewer.poll_once().unwrap(), PollOutcome::Completed { .. }));
        assert_eq!(reviewer.poll_once().unwrap(), PollOutcome::Idle);

        let statuses: Vec<_> = wf.steps(pid).unwrap().iter().map(|s| s.status).collect();
        assert_eq!(statuses, [StepStatus::Completed, StepStatus::Queued]);
    }

    #[test]
    fn register_writes_agent_record() {
        let wf = workflow();
        let executor = ExecutorBuilder::new("researcher")
            .handler("analyze", |_| Ok(json!(null)))
            .handler("vote", |_| Ok(json!(null)))
            .build(wf.clone())
            .unwrap();
        let record = executor.register().unwrap();
        assert_eq!(record.registered_at, 1_000);
        let agents = wf.store().list_agents().unwrap();
        assert_eq!(agents, vec![record]);
        assert_eq!(agents[0].step_kinds.len(), 2);
    }
}
