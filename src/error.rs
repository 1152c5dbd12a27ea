//! Rich diagnostic error types for agora.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so operators know what went wrong and
//! whether retrying makes sense.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for agora.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the CLI.
#[derive(Debug, Error, Diagnostic)]
pub enum AgoraError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Condition(#[from] ConditionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] crate::paths::PathError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(agora::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb error: {message}")]
    #[diagnostic(
        code(agora::store::redb),
        help(
            "The durable store reported an error. The current tick or poll is abandoned \
             and retried on the next scheduled cycle."
        )
    )]
    Redb { message: String },

    #[error("record encoding failed: {message}")]
    #[diagnostic(
        code(agora::store::codec),
        help("A stored record could not be encoded or decoded. The data file may be corrupt.")
    )]
    Codec { message: String },

    #[error("{entity} {id} not found")]
    #[diagnostic(
        code(agora::store::not_found),
        help("The record does not exist in the store. Check the id.")
    )]
    NotFound { entity: &'static str, id: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec {
            message: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WorkflowError {
    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    #[diagnostic(
        code(agora::workflow::invalid_transition),
        help(
            "The requested state change is not permitted from the current status. \
             This is a caller bug and is never retried."
        )
    )]
    InvalidTransition {
        entity: &'static str,
        id: u64,
        from: String,
        to: String,
    },

    #[error("agent \"{agent_id}\" lost the claim race for step {step_id}")]
    #[diagnostic(
        code(agora::workflow::claim_conflict),
        help("Another agent claimed the step first. Poll again on the next tick.")
    )]
    ClaimConflict { step_id: u64, agent_id: String },

    #[error("proposal {id} not found")]
    #[diagnostic(
        code(agora::workflow::proposal_not_found),
        help("List proposals with `agora proposals` to find a valid id.")
    )]
    ProposalNotFound { id: u64 },

    #[error("step {id} not found")]
    #[diagnostic(
        code(agora::workflow::step_not_found),
        help("Steps only exist after their proposal has been expanded by a heartbeat tick.")
    )]
    StepNotFound { id: u64 },

    #[error("proposal \"{title}\" has no step kinds")]
    #[diagnostic(
        code(agora::workflow::empty_proposal),
        help("A proposal must name at least one step kind to be expandable.")
    )]
    EmptyProposal { title: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Condition errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConditionError {
    #[error("condition parse error at offset {offset}: {message}")]
    #[diagnostic(
        code(agora::condition::parse),
        help(
            "Conditions look like `type == \"step_completed\" && payload.step_kind == \"deploy\"`. \
             Supported operators: == != < <= > >= contains matches, plus exists, !, &&, ||."
        )
    )]
    Parse { offset: usize, message: String },

    #[error("cannot apply `{op}` to field {field}: found {found}")]
    #[diagnostic(
        code(agora::condition::type_mismatch),
        help(
            "The event field has an incompatible type for this operator. \
             The trigger does not fire for this event."
        )
    )]
    TypeMismatch {
        field: String,
        op: &'static str,
        found: String,
    },
}

// ---------------------------------------------------------------------------
// Execution errors
// ---------------------------------------------------------------------------

/// Failure raised by a step function. Retried up to `max_attempts`.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(
    code(agora::execution::failed),
    help("The step's work failed. It is requeued until its attempts are exhausted.")
)]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    #[error("agent \"{agent_id}\" declares step kind \"{kind}\" without a handler")]
    #[diagnostic(
        code(agora::executor::missing_handler),
        help("Register a handler for the kind with `ExecutorBuilder::handler`, or drop it from the kind set.")
    )]
    MissingHandler { agent_id: String, kind: String },

    #[error("agent \"{agent_id}\" supports no step kinds")]
    #[diagnostic(
        code(agora::executor::no_step_kinds),
        help("An executor must handle at least one step kind.")
    )]
    NoStepKinds { agent_id: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(agora::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(agora::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(agora::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {message}")]
    #[diagnostic(
        code(agora::config::invalid),
        help("Intervals must be positive, staleness_multiplier and max_attempts at least 1.")
    )]
    Invalid { message: String },

    #[error("trigger \"{trigger}\" has an invalid condition")]
    #[diagnostic(code(agora::config::condition))]
    Condition {
        trigger: String,
        #[source]
        #[diagnostic_source]
        source: ConditionError,
    },
}

/// Convenience alias for top-level operations.
pub type AgoraResult<T> = std::result::Result<T, AgoraError>;
