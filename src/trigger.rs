//! Trigger engine: condition→proposal rules evaluated against logged events.
//!
//! Each trigger pairs a [`Condition`] with a [`ProposalTemplate`]. When an
//! event matches and the trigger's cooldown has elapsed, the engine renders a
//! [`ProposalDraft`] and records the firing time. Cooldowns are measured on the
//! event's own timestamp, so a backlog drained in one heartbeat tick
//! deduplicates exactly as the live stream would have.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Condition;
use crate::event::Event;
use crate::store::{StoreResult, WorkflowStore};
use crate::workflow::{ProposalDraft, ProposalSource};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a trigger proposes when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalTemplate {
    /// Title with `{placeholder}` substitutions from the event.
    pub title_template: String,
    pub step_kinds: Vec<String>,
    pub auto_approve: bool,
}

/// A registered trigger: a condition→proposal rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Unique identifier (hex timestamp + nanos). Assigned by the store when empty.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub condition: Condition,
    /// Minimum seconds between firings (0 = fire on every match).
    pub cooldown_seconds: u64,
    /// Event time of the last firing.
    pub last_fired_at: Option<u64>,
    pub action: ProposalTemplate,
    pub enabled: bool,
}

impl Trigger {
    pub fn new(name: &str, condition: Condition, action: ProposalTemplate) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            condition,
            cooldown_seconds: 0,
            last_fired_at: None,
            action,
            enabled: true,
        }
    }

    pub fn with_cooldown(mut self, seconds: u64) -> Self {
        self.cooldown_seconds = seconds;
        self
    }

    /// Whether the cooldown permits firing at `at`.
    pub fn cooldown_elapsed(&self, at: u64) -> bool {
        match self.last_fired_at {
            None => true,
            Some(_) if self.cooldown_seconds == 0 => true,
            Some(last) => at.saturating_sub(last) >= self.cooldown_seconds,
        }
    }
}

/// A draft produced by one trigger for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerFiring {
    pub trigger_id: String,
    pub draft: ProposalDraft,
}

// ---------------------------------------------------------------------------
// ID generation
// ---------------------------------------------------------------------------

/// Generate a trigger ID from the current timestamp.
pub fn generate_trigger_id() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    // Combine seconds and nanos for uniqueness.
    format!("{:x}-{:x}", now.as_secs(), now.subsec_nanos())
}

// ---------------------------------------------------------------------------
// Title rendering
// ---------------------------------------------------------------------------

fn placeholder_value(name: &str, event: &Event) -> Option<String> {
    match name {
        "type" => Some(event.kind.clone()),
        "seq" => Some(event.seq.to_string()),
        _ => {
            let path: Vec<String> = name.split('.').map(str::to_string).collect();
            event.payload_path(&path).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        }
    }
}

/// Substitute `{type}`, `{seq}` and `{payload_key}` placeholders.
///
/// Unknown placeholders and unbalanced braces are kept verbatim.
pub fn render_title(template: &str, event: &Event) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match placeholder_value(name, event) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// In-memory view over a set of triggers for one evaluation pass.
///
/// The heartbeat loads triggers from the store, evaluates a batch of events,
/// and records each firing time with
/// [`WorkflowStore::record_trigger_fired`]. Only that timestamp goes back to
/// the store; the rest of this copy may already be stale.
#[derive(Debug, Default)]
pub struct TriggerEngine {
    triggers: Vec<Trigger>,
}

impl TriggerEngine {
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self { triggers }
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn get(&self, id: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.id == id)
    }

    /// Stop evaluating a trigger for the rest of this pass.
    pub fn retire(&mut self, id: &str) {
        self.triggers.retain(|t| t.id != id);
    }

    /// Evaluate every trigger against one event.
    ///
    /// Condition errors fail closed: the trigger is skipped for this event
    /// and the error is logged.
    pub fn evaluate(&mut self, event: &Event) -> Vec<TriggerFiring> {
        let mut firings = Vec::new();
        for trigger in self.triggers.iter_mut().filter(|t| t.enabled) {
            match trigger.condition.evaluate(event) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(
                        trigger = %trigger.name,
                        seq = event.seq,
                        error = %e,
                        "trigger condition could not be evaluated; skipped for this event",
                    );
                    continue;
                }
            }

            if !trigger.cooldown_elapsed(event.occurred_at) {
                tracing::debug!(
                    trigger = %trigger.name,
                    seq = event.seq,
                    "trigger matched inside its cooldown",
                );
                continue;
            }

            trigger.last_fired_at = Some(event.occurred_at);
            tracing::info!(trigger = %trigger.name, seq = event.seq, "trigger fired");
            firings.push(TriggerFiring {
                trigger_id: trigger.id.clone(),
                draft: ProposalDraft {
                    title: render_title(&trigger.action.title_template, event),
                    step_kinds: trigger.action.step_kinds.clone(),
                    auto_approve: trigger.action.auto_approve,
                    source: ProposalSource::Trigger {
                        trigger_id: trigger.id.clone(),
                        event_seq: event.seq,
                    },
                },
            });
        }
        firings
    }
}

/// Upsert triggers declared in config, matched to stored ones by name.
///
/// A stored trigger with the same name keeps its id and `last_fired_at`, so
/// restarting the daemon does not reset cooldowns.
pub fn sync_triggers(store: &dyn WorkflowStore, declared: Vec<Trigger>) -> StoreResult<usize> {
    let existing = store.list_triggers()?;
    let mut written = 0;
    for mut trigger in declared {
        if let Some(prev) = existing.iter().find(|t| t.name == trigger.name) {
            trigger.id = prev.id.clone();
            trigger.last_fired_at = prev.last_fired_at;
        }
        store.put_trigger(trigger)?;
        written += 1;
    }
    Ok(written)
}
