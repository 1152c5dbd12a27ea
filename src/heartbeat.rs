//! Heartbeat: the periodic driver of the workflow.
//!
//! Each tick runs four phases in order, each isolated from the others: a
//! failing phase is logged and counted, and the remaining phases still run.
//!
//! 1. **Triggers**: evaluate events logged since the last tick and create a
//!    proposal for every firing.
//! 2. **Reaction queue**: expand approved proposals into queued steps.
//! 3. **Stale recovery**: requeue (or fail) steps whose claim is older than
//!    the staleness threshold.
//! 4. **Reconcile**: re-derive every `in_progress` proposal from its steps,
//!    catching up any whose re-derivation was cut short by a store error.
//!
//! `tick` is synchronous; [`Heartbeat::run`] only drives scheduling and
//! shutdown from tokio.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::WorkflowError;
use crate::lifecycle::Workflow;
use crate::trigger::TriggerEngine;
use crate::workflow::{ProposalStatus, StepStatus, WorkflowResult};

/// Cursor name under which trigger evaluation progress is stored.
pub const EVENT_CURSOR: &str = "heartbeat.events";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Heartbeat scheduling and recovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between ticks (default: 5 min).
    pub interval: Duration,
    /// Claims older than this many seconds are stale (default: 90).
    pub staleness_threshold: u64,
    /// Events fetched per store read (default: 256).
    pub event_batch_size: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            staleness_threshold: 90,
            event_batch_size: 256,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub events_evaluated: usize,
    pub proposals_created: usize,
    pub proposals_expanded: usize,
    pub steps_requeued: usize,
    pub steps_failed: usize,
    /// `in_progress` proposals moved to a terminal status by re-derivation.
    pub proposals_reconciled: usize,
    /// Phases that aborted with an error.
    pub phase_errors: usize,
}

impl TickReport {
    /// True when the tick changed nothing.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

pub struct Heartbeat {
    workflow: Workflow,
    config: HeartbeatConfig,
}

impl Heartbeat {
    pub fn new(workflow: Workflow, config: HeartbeatConfig) -> Self {
        Self { workflow, config }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Run one tick.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        if let Err(e) = self.evaluate_triggers(&mut report) {
            report.phase_errors += 1;
            tracing::warn!(error = %e, "heartbeat: trigger evaluation failed");
        }
        if let Err(e) = self.expand_approved(&mut report) {
            report.phase_errors += 1;
            tracing::warn!(error = %e, "heartbeat: proposal expansion failed");
        }
        if let Err(e) = self.recover_stale(&mut report) {
            report.phase_errors += 1;
            tracing::warn!(error = %e, "heartbeat: stale recovery failed");
        }
        if let Err(e) = self.reconcile(&mut report) {
            report.phase_errors += 1;
            tracing::warn!(error = %e, "heartbeat: reconciliation failed");
        }

        report
    }

    /// Evaluate every event logged up to the start of this phase.
    ///
    /// Events emitted while the phase runs (including the `proposal_created`
    /// events of its own firings) are left for the next tick. The cursor
    /// advances per event, so an aborted phase resumes where it stopped.
    fn evaluate_triggers(&self, report: &mut TickReport) -> WorkflowResult<()> {
        let store = self.workflow.store();
        let horizon = store.last_event_seq()?;
        let mut cursor = store.cursor(EVENT_CURSOR)?;
        if cursor >= horizon {
            return Ok(());
        }

        let mut engine = TriggerEngine::new(store.list_triggers()?);
        let batch_size = self.config.event_batch_size.max(1);

        while cursor < horizon {
            let batch = store.events_after(cursor, batch_size)?;
            if batch.is_empty() {
                break;
            }
            for event in batch.into_iter().take_while(|e| e.seq <= horizon) {
                for firing in engine.evaluate(&event) {
                    match self.workflow.create_proposal(firing.draft) {
                        Ok(_) => report.proposals_created += 1,
                        Err(WorkflowError::Store(e)) => return Err(e.into()),
                        Err(e) => {
                            tracing::warn!(
                                trigger = %firing.trigger_id,
                                seq = event.seq,
                                error = %e,
                                "heartbeat: trigger produced an unusable proposal",
                            );
                        }
                    }
                    if !store.record_trigger_fired(&firing.trigger_id, event.occurred_at)? {
                        tracing::info!(
                            trigger = %firing.trigger_id,
                            "heartbeat: trigger removed during the tick; retired",
                        );
                        engine.retire(&firing.trigger_id);
                    }
                }
                cursor = event.seq;
                store.set_cursor(EVENT_CURSOR, cursor)?;
                report.events_evaluated += 1;
            }
        }
        Ok(())
    }

    fn expand_approved(&self, report: &mut TickReport) -> WorkflowResult<()> {
        for proposal in self.workflow.store().list_approved_unexpanded()? {
            match self.workflow.expand(proposal.id) {
                Ok(_) => report.proposals_expanded += 1,
                // Cancelled between the scan and the expansion.
                Err(WorkflowError::InvalidTransition { .. }) => {}
                Err(e) => {
                    tracing::warn!(proposal = %proposal.id, error = %e, "heartbeat: expansion failed");
                }
            }
        }
        Ok(())
    }

    fn recover_stale(&self, report: &mut TickReport) -> WorkflowResult<()> {
        let cutoff = self
            .workflow
            .now()
            .saturating_sub(self.config.staleness_threshold);
        for step in self.workflow.store().list_stale_steps(cutoff)? {
            match self.workflow.reclaim_stale(step.id, cutoff) {
                Ok(Some(reclaimed)) if reclaimed.step.status == StepStatus::Failed => {
                    report.steps_failed += 1;
                }
                Ok(Some(_)) => report.steps_requeued += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(step = %step.id, error = %e, "heartbeat: stale reclaim failed");
                }
            }
        }
        Ok(())
    }

    fn reconcile(&self, report: &mut TickReport) -> WorkflowResult<()> {
        let open = self
            .workflow
            .store()
            .list_proposals(Some(ProposalStatus::InProgress))?;
        for proposal in open {
            match self.workflow.recompute(proposal.id) {
                Ok(updated) if updated.status != ProposalStatus::InProgress => {
                    tracing::info!(
                        proposal = %updated.id,
                        status = %updated.status,
                        "heartbeat: proposal caught up with its steps",
                    );
                    report.proposals_reconciled += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(proposal = %proposal.id, error = %e, "heartbeat: reconcile failed");
                }
            }
        }
        Ok(())
    }

    /// Tick on the configured interval until `shutdown` turns true.
    ///
    /// Ticks never overlap: the next one is scheduled only after the
    /// blocking tick task has returned.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        use tokio::time::{MissedTickBehavior, interval};

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            staleness_threshold = self.config.staleness_threshold,
            "heartbeat started",
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let heartbeat = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || heartbeat.tick()).await {
                        Ok(report) if report.is_idle() => tracing::debug!("heartbeat: idle tick"),
                        Ok(report) => tracing::info!(
                            events = report.events_evaluated,
                            created = report.proposals_created,
                            expanded = report.proposals_expanded,
                            requeued = report.steps_requeued,
                            failed = report.steps_failed,
                            reconciled = report.proposals_reconciled,
                            phase_errors = report.phase_errors,
                            "heartbeat: tick complete",
                        ),
                        Err(e) => tracing::error!(error = %e, "heartbeat: tick task panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("heartbeat: shutdown signal received");
                        break;
                    }
                }
            }
        }
        tracing::info!("heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::condition;
    use crate::event::{Payload, kinds, payload};
    use crate::store::faulty::FaultyStore;
    use crate::store::{MemStore, WorkflowStore};
    use crate::trigger::{ProposalTemplate, Trigger};
    use crate::workflow::ProposalStatus;

    fn setup() -> (Arc<ManualClock>, Workflow, Heartbeat) {
        let clock = Arc::new(ManualClock::new(1_000));
        let workflow = Workflow::new(Arc::new(MemStore::new()), clock.clone(), 3);
        let heartbeat = Heartbeat::new(workflow.clone(), HeartbeatConfig::default());
        (clock, workflow, heartbeat)
    }

    fn add_trigger(workflow: &Workflow, source: &str, cooldown: u64, auto: bool) {
        let trigger = Trigger::new(
            "rule",
            condition::parse(source).unwrap(),
            ProposalTemplate {
                title_template: "react to {type}".into(),
                step_kinds: vec!["review".into()],
                auto_approve: auto,
            },
        )
        .with_cooldown(cooldown);
        workflow.store().put_trigger(trigger).unwrap();
    }

    #[test]
    fn default_config() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.staleness_threshold, 90);
        assert_eq!(config.event_batch_size, 256);
    }

    #[test]
    fn idle_tick_reports_nothing() {
        let (_clock, _workflow, heartbeat) = setup();
        assert!(heartbeat.tick().is_idle());
    }

    #[test]
    fn firing_and_expansion_happen_in_one_tick() {
        let (_clock, workflow, heartbeat) = setup();
        add_trigger(&workflow, r#"type == "deploy""#, 0, true);
        workflow
            .log_event("deploy", payload([("service", json!("api"))]))
            .unwrap();

        let report = heartbeat.tick();
        assert_eq!(report.events_evaluated, 1);
        assert_eq!(report.proposals_created, 1);
        assert_eq!(report.proposals_expanded, 1);

        let proposals = workflow.store().list_proposals(None).unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].status, ProposalStatus::InProgress);
        assert_eq!(proposals[0].title, "react to deploy");
        assert_eq!(workflow.steps(proposals[0].id).unwrap().len(), 1);
        assert_eq!(workflow.store().cursor(EVENT_CURSOR).unwrap(), 1);

        // Nothing new: the cursor keeps the event from firing twice.
        let again = heartbeat.tick();
        assert_eq!(again.proposals_created, 0);
    }

    #[test]
    fn pending_proposals_wait_for_approval() {
        let (_clock, workflow, heartbeat) = setup();
        add_trigger(&workflow, r#"type == "deploy""#, 0, false);
        workflow.log_event("deploy", Payload::new()).unwrap();

        let report = heartbeat.tick();
        assert_eq!(report.proposals_created, 1);
        assert_eq!(report.proposals_expanded, 0);

        let id = workflow.store().list_proposals(None).unwrap()[0].id;
        workflow.approve(id).unwrap();
        assert_eq!(heartbeat.tick().proposals_expanded, 1);
    }

    #[test]
    fn cooldown_survives_between_ticks() {
        let (clock, workflow, heartbeat) = setup();
        add_trigger(&workflow, r#"type == "deploy""#, 60, false);

        workflow.log_event("deploy", Payload::new()).unwrap();
        assert_eq!(heartbeat.tick().proposals_created, 1);

        clock.advance(10);
        workflow.log_event("deploy", Payload::new()).unwrap();
        assert_eq!(heartbeat.tick().proposals_created, 0);

        clock.advance(60);
        workflow.log_event("deploy", Payload::new()).unwrap();
        assert_eq!(heartbeat.tick().proposals_created, 1);

        let stored = &workflow.store().list_triggers().unwrap()[0];
        assert_eq!(stored.last_fired_at, Some(1_070));
    }

    #[test]
    fn own_events_wait_for_next_tick() {
        let (_clock, workflow, heartbeat) = setup();
        add_trigger(&workflow, &format!(r#"type == "{}""#, kinds::PROPOSAL_CREATED), 0, false);
        workflow.submit_proposal("seed", vec!["x".into()], false).unwrap();

        assert_eq!(heartbeat.tick().proposals_created, 1);
        assert_eq!(heartbeat.tick().proposals_created, 1);
        assert_eq!(workflow.store().list_proposals(None).unwrap().len(), 3);
    }

    #[test]
    fn small_batches_drain_the_backlog() {
        let clock = Arc::new(ManualClock::new(1_000));
        let workflow = Workflow::new(Arc::new(MemStore::new()), clock, 3);
        let heartbeat = Heartbeat::new(
            workflow.clone(),
            HeartbeatConfig {
                event_batch_size: 2,
                ..HeartbeatConfig::default()
            },
        );
        for _ in 0..5 {
            workflow.log_event("noise", Payload::new()).unwrap();
        }
        assert_eq!(heartbeat.tick().events_evaluated, 5);
        assert_eq!(workflow.store().cursor(EVENT_CURSOR).unwrap(), 5);
    }

    #[test]
    fn stale_claims_are_not_reclaimed_early() {
        let (clock, workflow, heartbeat) = setup();
        let p = workflow.submit_proposal("p", vec!["build".into()], true).unwrap();
        workflow.expand(p.id).unwrap();
        let kinds: BTreeSet<String> = ["build".to_string()].into();
        let step = workflow.claim(&kinds, "crashed").unwrap().unwrap();

        // Exactly at the threshold: still owned.
        clock.set(1_090);
        assert_eq!(heartbeat.tick().steps_requeued, 0);
        assert_eq!(workflow.store().get_step(step.id).unwrap().unwrap().claimed_by.as_deref(), Some("crashed"));

        clock.set(1_091);
        assert_eq!(heartbeat.tick().steps_requeued, 1);
        let requeued = workflow.store().get_step(step.id).unwrap().unwrap();
        assert_eq!(requeued.status, StepStatus::Queued);
        assert_eq!(requeued.attempt, 1);
    }

    #[test]
    fn repeated_staleness_exhausts_the_step() {
        let (clock, workflow, heartbeat) = setup();
        let p = workflow.submit_proposal("p", vec!["build".into()], true).unwrap();
        workflow.expand(p.id).unwrap();
        let kinds: BTreeSet<String> = ["build".to_string()].into();

        let mut failed = 0;
        for _ in 0..3 {
            workflow.claim(&kinds, "crashed").unwrap().unwrap();
            clock.advance(200);
            failed += heartbeat.tick().steps_failed;
        }
        assert_eq!(failed, 1);
        assert_eq!(workflow.proposal(p.id).unwrap().status, ProposalStatus::Failed);
    }

    fn faulty_setup() -> (Arc<ManualClock>, Arc<FaultyStore>, Workflow, Heartbeat) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(FaultyStore::new());
        let workflow = Workflow::new(store.clone(), clock.clone(), 3);
        let heartbeat = Heartbeat::new(workflow.clone(), HeartbeatConfig::default());
        (clock, store, workflow, heartbeat)
    }

    #[test]
    fn trigger_failure_does_not_block_stale_recovery() {
        let (clock, store, workflow, heartbeat) = faulty_setup();
        let p = workflow.submit_proposal("p", vec!["build".into()], true).unwrap();
        workflow.expand(p.id).unwrap();
        let kinds: BTreeSet<String> = ["build".to_string()].into();
        workflow.claim(&kinds, "crashed").unwrap().unwrap();

        store.fail_trigger_reads(true);
        clock.advance(200);
        let report = heartbeat.tick();
        assert_eq!(report.phase_errors, 1);
        assert_eq!(report.steps_requeued, 1);
        assert_eq!(report.events_evaluated, 0);
        assert_eq!(workflow.store().cursor(EVENT_CURSOR).unwrap(), 0);

        // The trigger phase resumes from the same cursor once the store heals.
        store.fail_trigger_reads(false);
        let report = heartbeat.tick();
        assert_eq!(report.phase_errors, 0);
        assert!(report.events_evaluated >= 1);
    }

    #[test]
    fn interrupted_rederivation_is_caught_up() {
        let (_clock, store, workflow, heartbeat) = faulty_setup();
        let p = workflow.submit_proposal("p", vec!["build".into()], true).unwrap();
        workflow.expand(p.id).unwrap();
        let build: BTreeSet<String> = ["build".to_string()].into();
        let step = workflow.claim(&build, "agent").unwrap().unwrap();
        workflow.begin_step(step.id, "agent").unwrap();

        store.fail_step_reads(1);
        let err = workflow
            .complete_step(step.id, "agent", json!("ok"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Store(_)));
        assert_eq!(
            workflow.store().get_step(step.id).unwrap().unwrap().status,
            StepStatus::Completed
        );
        assert_eq!(workflow.proposal(p.id).unwrap().status, ProposalStatus::InProgress);

        let report = heartbeat.tick();
        assert_eq!(report.proposals_reconciled, 1);
        assert_eq!(report.phase_errors, 0);
        assert_eq!(workflow.proposal(p.id).unwrap().status, ProposalStatus::Completed);

        let logged: Vec<String> = workflow
            .store()
            .events_after(0, 100)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(logged.contains(&kinds::STEP_COMPLETED.to_string()));
        assert!(logged.contains(&kinds::PROPOSAL_COMPLETED.to_string()));

        assert_eq!(heartbeat.tick().proposals_reconciled, 0);
    }

    #[test]
    fn trigger_removed_mid_tick_stays_removed() {
        let (_clock, store, workflow, heartbeat) = faulty_setup();
        add_trigger(&workflow, r#"type == "deploy""#, 0, false);
        workflow.log_event("deploy", Payload::new()).unwrap();
        workflow.log_event("deploy", Payload::new()).unwrap();

        // Removed while the first firing's proposal is being stored.
        store.before_next_append(|inner| {
            for trigger in inner.list_triggers().unwrap() {
                inner.remove_trigger(&trigger.id).unwrap();
            }
        });
        let report = heartbeat.tick();
        assert_eq!(report.events_evaluated, 2);
        assert_eq!(report.proposals_created, 1);
        assert!(workflow.store().list_triggers().unwrap().is_empty());
    }

    #[test]
    fn firing_keeps_trigger_edits_made_mid_tick() {
        let (_clock, store, workflow, heartbeat) = faulty_setup();
        add_trigger(&workflow, r#"type == "deploy""#, 0, false);
        workflow.log_event("deploy", Payload::new()).unwrap();

        // An operator edit lands after the tick loaded its copy.
        store.before_next_append(|inner| {
            let mut trigger = inner.list_triggers().unwrap().remove(0);
            trigger.cooldown_seconds = 600;
            trigger.enabled = false;
            inner.put_trigger(trigger).unwrap();
        });
        assert_eq!(heartbeat.tick().proposals_created, 1);

        let after = workflow.store().list_triggers().unwrap().remove(0);
        assert_eq!(after.cooldown_seconds, 600);
        assert!(!after.enabled);
        assert_eq!(after.last_fired_at, Some(1_000));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_clock, workflow, _) = setup();
        add_trigger(&workflow, r#"type == "deploy""#, 0, true);
        workflow.log_event("deploy", Payload::new()).unwrap();
        let heartbeat = Arc::new(Heartbeat::new(
            workflow.clone(),
            HeartbeatConfig {
                interval: Duration::from_millis(10),
                ..HeartbeatConfig::default()
            },
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&heartbeat).run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let proposals = workflow.store().list_proposals(None).unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].status, ProposalStatus::InProgress);
    }
}
