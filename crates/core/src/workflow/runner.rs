//! Step dispatch.
//!
//! `StepKind` is matched exhaustively here: condition and data-transform
//! steps are evaluated in-process, while api_call and webhook steps are
//! delegated to an injected `StepRunner` (the HTTP-invoking collaborator
//! lives outside the engine, behind this trait).

use crate::error::{EngineError, EngineResult};
use crate::types::{ConditionOperator, ExecutionId, Predicate, StepId, StepKind, WorkflowStep};
use crate::workflow::template;
use std::collections::HashMap;

/// Run-time context handed to a step implementation
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    /// Step parameters after template rendering
    pub parameters: HashMap<String, String>,
    /// Data-mapping targets resolved against upstream outputs
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Collision-free function name for api_call steps
    pub qualified_function: Option<String>,
}

/// External executor for steps that perform I/O. Implementations resolve
/// credentials and make the actual HTTP calls; the engine only sees the
/// resulting output object or an error.
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_api_call(
        &self,
        step: &WorkflowStep,
        ctx: &StepContext,
    ) -> anyhow::Result<serde_json::Value>;

    async fn run_webhook(
        &self,
        step: &WorkflowStep,
        ctx: &StepContext,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Outcome of dispatching one step
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Step produced an output object
    Output(serde_json::Value),
    /// Condition step evaluated its predicate
    Branch { matched: bool },
}

/// Execute a step. Exhaustive over `StepKind`; adding a variant without
/// handling it here is a compile error.
pub async fn dispatch(
    runner: &dyn StepRunner,
    step: &WorkflowStep,
    ctx: &StepContext,
    outputs: &HashMap<StepId, serde_json::Value>,
) -> EngineResult<StepOutcome> {
    match &step.kind {
        StepKind::ApiCall { .. } => {
            let output = runner
                .run_api_call(step, ctx)
                .await
                .map_err(|e| EngineError::StepFailed {
                    step_id: step.id.clone(),
                    attempts: 0,
                    message: format!("{:#}", e),
                })?;
            Ok(StepOutcome::Output(output))
        }
        StepKind::Webhook { .. } => {
            let output = runner
                .run_webhook(step, ctx)
                .await
                .map_err(|e| EngineError::StepFailed {
                    step_id: step.id.clone(),
                    attempts: 0,
                    message: format!("{:#}", e),
                })?;
            Ok(StepOutcome::Output(output))
        }
        StepKind::Condition { predicate, .. } => {
            let matched = evaluate_predicate(predicate, outputs)?;
            Ok(StepOutcome::Branch { matched })
        }
        StepKind::DataTransform {} => {
            Ok(StepOutcome::Output(serde_json::Value::Object(ctx.data.clone())))
        }
    }
}

/// Evaluate a condition predicate against accumulated step outputs.
pub fn evaluate_predicate(
    predicate: &Predicate,
    outputs: &HashMap<StepId, serde_json::Value>,
) -> EngineResult<bool> {
    if predicate.op == ConditionOperator::Exists {
        // Missing steps or fields are simply "does not exist"
        return Ok(template::resolve(&predicate.field, outputs).is_ok());
    }

    let actual = template::resolve(&predicate.field, outputs)?;
    let expected = &predicate.value;

    let result = match predicate.op {
        ConditionOperator::Equals => &actual == expected,
        ConditionOperator::NotEquals => &actual != expected,
        ConditionOperator::Contains => match (&actual, expected) {
            (serde_json::Value::String(haystack), serde_json::Value::String(needle)) => {
                haystack.contains(needle.as_str())
            }
            (serde_json::Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        ConditionOperator::GreaterThan => compare(&actual, expected, |o| o.is_gt())?,
        ConditionOperator::LessThan => compare(&actual, expected, |o| o.is_lt())?,
        ConditionOperator::GreaterOrEqual => compare(&actual, expected, |o| o.is_ge())?,
        ConditionOperator::LessOrEqual => compare(&actual, expected, |o| o.is_le())?,
        ConditionOperator::Exists => unreachable!("handled above"),
    };
    Ok(result)
}

fn compare(
    actual: &serde_json::Value,
    expected: &serde_json::Value,
    check: impl Fn(std::cmp::Ordering) -> bool,
) -> EngineResult<bool> {
    let ordering = match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        },
    };
    match ordering {
        Some(o) => Ok(check(o)),
        None => Err(EngineError::Template(format!(
            "cannot compare {} with {}",
            actual, expected
        ))),
    }
}
