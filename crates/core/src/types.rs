use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an API connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a queue job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow step (unique within its workflow)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

/// A workflow definition: a named graph of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Declared type of a step output field or mapping target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ValueType {
    /// Type compatibility for data mappings. Mismatches are reported by the
    /// validator, never coerced at run time.
    pub fn is_compatible_with(&self, target: ValueType) -> bool {
        *self == target
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Object => "object",
            ValueType::Array => "array",
        };
        write!(f, "{}", s)
    }
}

/// Comparison operators allowed in condition predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Exists,
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::Contains => "contains",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::GreaterOrEqual => "greater_or_equal",
            ConditionOperator::LessOrEqual => "less_or_equal",
            ConditionOperator::Exists => "exists",
        };
        write!(f, "{}", s)
    }
}

/// Predicate evaluated by condition steps against accumulated step outputs.
/// `field` is a `{{step_id.field}}` template resolved at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: ConditionOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// What a step does. Tagged so an unrecognized step type fails at parse time
/// instead of being silently mishandled mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Call a function exposed by an external API connection
    ApiCall {
        connection_id: ConnectionId,
        function: String,
    },
    /// Deliver a payload to an arbitrary URL
    Webhook { url: String },
    /// Branch: activate `true_steps` or `false_steps` based on the predicate
    Condition {
        predicate: Predicate,
        #[serde(default)]
        true_steps: Vec<StepId>,
        #[serde(default)]
        false_steps: Vec<StepId>,
    },
    /// Reshape upstream outputs via the step's data mapping
    DataTransform {},
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::ApiCall { .. } => "api_call",
            StepKind::Webhook { .. } => "webhook",
            StepKind::Condition { .. } => "condition",
            StepKind::DataTransform {} => "data_transform",
        }
    }
}

/// One entry of a step's data mapping: fill `target` from a
/// `{{step_id.field}}` template rendered against earlier step outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMapping {
    pub target: String,
    pub target_type: ValueType,
    pub source: String,
}

/// A single step in a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// 1-based declared position; must be >= max(order of deps) + 1
    pub order: u32,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Templated key/value parameters passed to the step implementation
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Output fields this step declares, with their value types
    #[serde(default)]
    pub outputs: HashMap<String, ValueType>,
    #[serde(default)]
    pub data_mapping: Vec<DataMapping>,
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One run of a compiled plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub current_step: Option<StepId>,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Correlates to the first queue job accepted for this execution
    pub queue_job_id: Option<JobId>,
}

/// Per-step progress within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Persisted record of one step's progress within an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: StepId,
    pub state: StepState,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepRecord {
    pub fn pending(step_id: StepId) -> Self {
        Self {
            step_id,
            state: StepState::Pending,
            attempt: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Severity of an execution log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Append-only log entry attached to an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn new(
        execution_id: ExecutionId,
        level: LogLevel,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            level,
            message: message.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// State of a queue job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Active,
    Completed,
    Failed,
    Retry,
}

/// A durable unit of asynchronous work. Owned exclusively by the job queue;
/// everything else goes through the queue's interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub name: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time this job may be claimed (delay / backoff)
    pub run_at: DateTime<Utc>,
    /// When a worker last claimed this job; drives stale-job redelivery
    pub claimed_on: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// How an API connection authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    ApiKey,
    OAuth2,
}

/// Authorization status of an API connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Draft,
    Connecting,
    Connected,
    Error,
    Disconnected,
    Revoked,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Draft => "draft",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Revoked => "revoked",
        };
        write!(f, "{}", s)
    }
}

/// A connection to an external API. Mutated only through the named
/// transitions on `ConnectionLifecycle`; `oauth_state` is non-null only
/// while `status` is `Connecting`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConnection {
    pub id: ConnectionId,
    pub name: String,
    pub base_url: String,
    pub auth_type: AuthType,
    pub status: ConnectionStatus,
    pub oauth_state: Option<String>,
    /// When the current `oauth_state` was issued
    pub oauth_state_issued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Short-lived authorization code captured during an OAuth round-trip.
/// Persisted (never held in process memory) so callbacks survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub connection_id: ConnectionId,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_serde_tag() {
        let json = serde_json::json!({
            "id": "fetch",
            "name": "Fetch",
            "type": "webhook",
            "url": "https://example.com/hook",
            "order": 1
        });

        let step: WorkflowStep = serde_json::from_value(json).unwrap();
        assert!(matches!(step.kind, StepKind::Webhook { .. }));
        assert_eq!(step.kind.name(), "webhook");
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let json = serde_json::json!({
            "id": "x",
            "name": "X",
            "type": "teleport",
            "order": 1
        });

        assert!(serde_json::from_value::<WorkflowStep>(json).is_err());
    }

    #[test]
    fn test_unknown_condition_operator_rejected() {
        let json = serde_json::json!({
            "field": "{{a.status}}",
            "op": "sounds_like",
            "value": "urgent"
        });

        assert!(serde_json::from_value::<Predicate>(json).is_err());
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
    }
}
