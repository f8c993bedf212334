//! Error types for the relay engine.
//!
//! All failure paths return typed results; nothing in this crate panics on
//! bad input. Validation and control failures are recovered locally by
//! callers, transient step failures are retried inside the engine, and
//! terminal failures are surfaced with the original error preserved.

use crate::types::{
    ConnectionId, ConnectionStatus, ExecutionId, ExecutionStatus, StepId, WorkflowId,
    WorkflowStatus,
};
use crate::workflow::validator::ValidationIssue;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The step graph failed validation; all issues are reported together.
    #[error("workflow validation failed with {} issue(s)", issues.len())]
    Validation { issues: Vec<ValidationIssue> },

    /// pause/resume/cancel requested on an execution in an incompatible state.
    #[error("cannot {action} execution {execution_id} in status {status}")]
    InvalidControl {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        action: &'static str,
    },

    /// A workflow mutation its lifecycle status does not allow.
    #[error("cannot {action} workflow {workflow_id} in status {status}")]
    InvalidWorkflowAction {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        action: &'static str,
    },

    /// A connection transition outside the lifecycle state machine.
    #[error("connection {connection_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        connection_id: ConnectionId,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A step exhausted its attempts; `message` is the triggering error verbatim.
    #[error("step {step_id} failed after {attempts} attempt(s): {message}")]
    StepFailed {
        step_id: StepId,
        attempts: u32,
        message: String,
    },

    /// A data-mapping or predicate template could not be resolved at run time.
    #[error("template error: {0}")]
    Template(String),

    /// Queue-level failure (enqueue, handler registration, shutdown).
    #[error("queue error: {0}")]
    Queue(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying storage failure, with context attached by the store.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the engine may retry the operation transparently.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Queue(_) | Self::Storage(_))
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
