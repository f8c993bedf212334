//! Execution coordinator.
//!
//! Drives one execution of a compiled plan: persists progress, schedules
//! step jobs through the queue, reacts to completion and failure callbacks,
//! and exposes pause/resume/cancel plus a status snapshot.
//!
//! Dependency ordering is enforced here, never by queue FIFO order: a step
//! is scheduled only once every one of its dependencies has a completed
//! record, regardless of the order callbacks arrive in.

use crate::config::EngineConfig;
use crate::connection::ConnectionLifecycle;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEventKind, EventBus};
use crate::queue::{JobHandler, JobOptions, JobQueue};
use crate::storage::RedbStore;
use crate::types::{
    ConnectionStatus, ExecutionId, ExecutionLog, ExecutionStatus, JobId, JobState, LogLevel,
    QueueJob, StepId, StepKind, StepRecord, StepState, WorkflowExecution,
};
use crate::workflow::compiler::ExecutionPlan;
use crate::workflow::runner::{self, StepContext, StepOutcome, StepRunner};
use crate::workflow::template;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Queue job name consumed by the coordinator
pub const STEP_JOB_NAME: &str = "workflow-step";

/// Payload of one step job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepJobPayload {
    pub execution_id: ExecutionId,
    pub step_id: StepId,
}

/// Point-in-time view of an execution returned by `status`
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSnapshot {
    pub execution: WorkflowExecution,
    pub progress: ExecutionProgress,
    pub queue_job_state: Option<JobState>,
    pub recent_logs: Vec<ExecutionLog>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionProgress {
    pub current_step: Option<StepId>,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub total_steps: u32,
    pub percent: f64,
    /// Average observed step duration times remaining steps; only while
    /// running, and only once at least one step has finished
    pub estimated_remaining_secs: Option<u64>,
}

pub struct ExecutionCoordinator {
    store: RedbStore,
    queue: Arc<dyn JobQueue>,
    connections: Arc<ConnectionLifecycle>,
    runner: Arc<dyn StepRunner>,
    events: EventBus,
    config: EngineConfig,
}

struct StepJobHandler {
    coordinator: Arc<ExecutionCoordinator>,
}

#[async_trait::async_trait]
impl JobHandler for StepJobHandler {
    async fn handle(&self, job: &QueueJob) -> anyhow::Result<()> {
        let payload: StepJobPayload = serde_json::from_value(job.payload.clone())?;
        self.coordinator.execute_step(payload, job).await
    }
}

impl ExecutionCoordinator {
    pub fn new(
        store: RedbStore,
        queue: Arc<dyn JobQueue>,
        connections: Arc<ConnectionLifecycle>,
        runner: Arc<dyn StepRunner>,
        events: EventBus,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            connections,
            runner,
            events,
            config,
        })
    }

    /// Register as the consumer for step jobs. Call once after construction.
    pub async fn register(self: &Arc<Self>) {
        self.queue
            .register(
                STEP_JOB_NAME,
                Arc::new(StepJobHandler {
                    coordinator: self.clone(),
                }),
            )
            .await;
    }

    /// Create an execution for a compiled plan and schedule its entry steps.
    pub async fn start(&self, plan: ExecutionPlan) -> EngineResult<ExecutionId> {
        let execution_id = ExecutionId::new();
        let now = Utc::now();
        let total_steps = plan.steps.len() as u32;

        let execution = WorkflowExecution {
            id: execution_id,
            workflow_id: plan.workflow_id,
            status: ExecutionStatus::Pending,
            current_step: None,
            total_steps,
            completed_steps: 0,
            failed_steps: 0,
            attempt_count: 0,
            max_attempts: self.config.max_attempts,
            started_at: now,
            completed_at: None,
            error: None,
            queue_job_id: None,
        };

        self.store.put_plan(&execution_id, &plan)?;
        self.store.put_execution(&execution)?;
        for step in &plan.steps {
            self.store
                .put_step_record(&execution_id, &StepRecord::pending(step.id.clone()))?;
        }

        self.log(
            execution_id,
            LogLevel::Info,
            "Execution created",
            serde_json::json!({
                "workflow_id": plan.workflow_id,
                "total_steps": total_steps,
            }),
        )?;

        if plan.steps.is_empty() {
            self.store.update_execution(&execution_id, |e| {
                e.status = ExecutionStatus::Completed;
                e.completed_at = Some(Utc::now());
            })?;
            self.events.publish(EngineEventKind::ExecutionCompleted {
                execution_id,
                duration_secs: 0,
            });
            return Ok(execution_id);
        }

        let entry_ids: Vec<StepId> = plan.entry_steps().iter().map(|s| s.id.clone()).collect();
        let mut first_job = None;
        for step_id in &entry_ids {
            if let Some(job_id) = self.schedule_step(&execution_id, step_id).await? {
                first_job.get_or_insert(job_id);
            }
        }

        self.store.update_execution(&execution_id, |e| {
            e.status = ExecutionStatus::Running;
            e.queue_job_id = first_job;
        })?;

        self.events.publish(EngineEventKind::ExecutionStarted {
            execution_id,
            total_steps,
        });
        tracing::info!(
            %execution_id,
            workflow_id = %plan.workflow_id,
            total_steps,
            "Execution started"
        );
        Ok(execution_id)
    }

    /// Stop scheduling new step jobs. In-flight jobs finish and their
    /// results are buffered until `resume`.
    pub async fn pause(&self, execution_id: &ExecutionId) -> EngineResult<WorkflowExecution> {
        let mut paused = false;
        let updated = self
            .store
            .update_execution(execution_id, |e| {
                if e.status == ExecutionStatus::Running {
                    e.status = ExecutionStatus::Paused;
                    paused = true;
                }
            })?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))?;

        if !paused {
            return Err(EngineError::InvalidControl {
                execution_id: *execution_id,
                status: updated.status,
                action: "pause",
            });
        }

        self.events.publish(EngineEventKind::ExecutionPaused {
            execution_id: *execution_id,
        });
        self.log(
            *execution_id,
            LogLevel::Info,
            "Execution paused",
            serde_json::Value::Null,
        )?;
        tracing::info!(%execution_id, "Execution paused");
        Ok(updated)
    }

    /// Return a paused execution to running and schedule every step whose
    /// dependencies were satisfied while paused.
    pub async fn resume(&self, execution_id: &ExecutionId) -> EngineResult<WorkflowExecution> {
        let mut resumed = false;
        let updated = self
            .store
            .update_execution(execution_id, |e| {
                if e.status == ExecutionStatus::Paused {
                    e.status = ExecutionStatus::Running;
                    resumed = true;
                }
            })?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))?;

        if !resumed {
            return Err(EngineError::InvalidControl {
                execution_id: *execution_id,
                status: updated.status,
                action: "resume",
            });
        }

        self.events.publish(EngineEventKind::ExecutionResumed {
            execution_id: *execution_id,
        });
        self.log(
            *execution_id,
            LogLevel::Info,
            "Execution resumed",
            serde_json::Value::Null,
        )?;
        tracing::info!(%execution_id, "Execution resumed");

        if let Some(plan) = self.store.get_plan(execution_id)? {
            self.advance(&plan, execution_id).await?;
            self.try_finish(execution_id)?;
        }
        Ok(updated)
    }

    /// Terminal from any non-terminal state. Dispatched jobs may still run
    /// to completion at the queue level, but their results are discarded
    /// once the coordinator observes the cancelled status.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> EngineResult<WorkflowExecution> {
        let mut cancelled = false;
        let updated = self
            .store
            .update_execution(execution_id, |e| {
                if !e.status.is_terminal() {
                    e.status = ExecutionStatus::Cancelled;
                    e.completed_at = Some(Utc::now());
                    e.current_step = None;
                    cancelled = true;
                }
            })?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))?;

        if !cancelled {
            return Err(EngineError::InvalidControl {
                execution_id: *execution_id,
                status: updated.status,
                action: "cancel",
            });
        }

        // Counters freeze at cancellation, but undispatched steps are
        // marked so the records show they never ran.
        for record in self.store.list_step_records(execution_id)? {
            if matches!(record.state, StepState::Pending | StepState::Scheduled) {
                self.store
                    .update_step_record(execution_id, &record.step_id, |r| {
                        r.state = StepState::Skipped;
                    })?;
            }
        }

        self.events.publish(EngineEventKind::ExecutionCancelled {
            execution_id: *execution_id,
        });
        self.log(
            *execution_id,
            LogLevel::Info,
            "Execution cancelled",
            serde_json::Value::Null,
        )?;
        tracing::info!(%execution_id, "Execution cancelled");
        Ok(updated)
    }

    pub async fn status(&self, execution_id: &ExecutionId) -> EngineResult<ExecutionSnapshot> {
        let execution = self
            .store
            .get_execution(execution_id)?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))?;

        let percent = if execution.total_steps == 0 {
            100.0
        } else {
            f64::from(execution.completed_steps) / f64::from(execution.total_steps) * 100.0
        };

        let estimated_remaining_secs = if execution.status == ExecutionStatus::Running {
            self.estimate_remaining(&execution)?
        } else {
            None
        };

        let queue_job_state = match &execution.queue_job_id {
            Some(job_id) => self.queue.job_state(job_id).await?,
            None => None,
        };

        let recent_logs = self
            .store
            .recent_logs(execution_id, self.config.recent_log_limit)?;

        Ok(ExecutionSnapshot {
            progress: ExecutionProgress {
                current_step: execution.current_step.clone(),
                completed_steps: execution.completed_steps,
                failed_steps: execution.failed_steps,
                total_steps: execution.total_steps,
                percent,
                estimated_remaining_secs,
            },
            execution,
            queue_job_state,
            recent_logs,
        })
    }

    fn estimate_remaining(&self, execution: &WorkflowExecution) -> EngineResult<Option<u64>> {
        let remaining = execution
            .total_steps
            .saturating_sub(execution.completed_steps)
            .saturating_sub(execution.failed_steps);
        if remaining == 0 {
            return Ok(None);
        }

        let durations_ms: Vec<i64> = self
            .store
            .list_step_records(&execution.id)?
            .into_iter()
            .filter(|r| r.state == StepState::Completed)
            .filter_map(|r| match (r.started_at, r.completed_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
                _ => None,
            })
            .collect();
        if durations_ms.is_empty() {
            return Ok(None);
        }

        let avg_ms = durations_ms.iter().sum::<i64>() as u64 / durations_ms.len() as u64;
        Ok(Some(avg_ms * u64::from(remaining) / 1000))
    }

    /// Entry point for step jobs delivered by the queue. An `Err` return
    /// lets the queue apply its retry-with-backoff policy.
    async fn execute_step(&self, payload: StepJobPayload, job: &QueueJob) -> anyhow::Result<()> {
        let execution_id = payload.execution_id;

        let Some(execution) = self.store.get_execution(&execution_id)? else {
            tracing::warn!(%execution_id, "Dropping step job for unknown execution");
            return Ok(());
        };
        if execution.status.is_terminal() {
            tracing::debug!(
                %execution_id,
                step_id = %payload.step_id,
                status = %execution.status,
                "Discarding step job for terminal execution"
            );
            return Ok(());
        }

        let plan = self
            .store
            .get_plan(&execution_id)?
            .ok_or_else(|| anyhow::anyhow!("no plan stored for execution {}", execution_id))?;
        let step = plan
            .step(&payload.step_id)
            .ok_or_else(|| anyhow::anyhow!("step '{}' not in plan", payload.step_id))?
            .clone();

        let attempt = job.retry_count + 1;
        self.store.update_step_record(&execution_id, &step.id, |r| {
            r.state = StepState::Running;
            r.attempt = attempt;
            r.started_at = Some(Utc::now());
            r.completed_at = None;
            r.error = None;
        })?;
        self.store.update_execution(&execution_id, |e| {
            e.current_step = Some(step.id.clone());
        })?;
        self.log(
            execution_id,
            LogLevel::Info,
            format!("Starting step '{}'", step.id),
            serde_json::json!({"step_id": step.id, "kind": step.kind.name(), "attempt": attempt}),
        )?;

        match self.run_step(&plan, &step, &execution_id).await {
            Ok(outcome) => {
                self.complete_step(&plan, &step, &execution_id, outcome)
                    .await?;
                Ok(())
            }
            Err(err) => {
                let message = match &err {
                    EngineError::StepFailed { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                self.fail_step(&step, &execution_id, job, &message).await?;
                Err(anyhow::anyhow!("{}", message))
            }
        }
    }

    /// Resolve the step's inputs and run it.
    async fn run_step(
        &self,
        plan: &ExecutionPlan,
        step: &crate::types::WorkflowStep,
        execution_id: &ExecutionId,
    ) -> EngineResult<StepOutcome> {
        let outputs = self.store.get_step_outputs(execution_id)?;

        let mut parameters = HashMap::new();
        for (key, value) in &step.parameters {
            parameters.insert(key.clone(), template::render(value, &outputs)?);
        }

        let mut data = serde_json::Map::new();
        for mapping in &step.data_mapping {
            data.insert(
                mapping.target.clone(),
                template::resolve(&mapping.source, &outputs)?,
            );
        }

        if let StepKind::ApiCall { connection_id, .. } = &step.kind {
            let connection = self
                .connections
                .get(connection_id)?
                .ok_or_else(|| EngineError::not_found("connection", connection_id))?;
            if connection.status != ConnectionStatus::Connected {
                return Err(EngineError::StepFailed {
                    step_id: step.id.clone(),
                    attempts: 0,
                    message: format!(
                        "connection '{}' is {}, not connected",
                        connection.name, connection.status
                    ),
                });
            }
        }

        let ctx = StepContext {
            execution_id: *execution_id,
            parameters,
            data,
            qualified_function: plan.qualified_functions.get(&step.id).cloned(),
        };

        runner::dispatch(self.runner.as_ref(), step, &ctx, &outputs).await
    }

    async fn complete_step(
        &self,
        plan: &ExecutionPlan,
        step: &crate::types::WorkflowStep,
        execution_id: &ExecutionId,
        outcome: StepOutcome,
    ) -> EngineResult<()> {
        // The cancellation check rides inside the counter update so a cancel
        // landing between a check and the bump cannot slip a result in.
        let mut counted = false;
        self.store.update_execution(execution_id, |e| {
            if e.status == ExecutionStatus::Cancelled {
                return;
            }
            e.completed_steps += 1;
            if e.current_step.as_ref() == Some(&step.id) {
                e.current_step = None;
            }
            counted = true;
        })?;
        if !counted {
            tracing::debug!(%execution_id, step_id = %step.id, "Discarding result for cancelled execution");
            return Ok(());
        }

        let output = match &outcome {
            StepOutcome::Output(value) => value.clone(),
            StepOutcome::Branch { matched } => serde_json::json!({ "matched": matched }),
        };
        self.store.put_step_output(execution_id, &step.id, &output)?;

        let now = Utc::now();
        let record = self.store.update_step_record(execution_id, &step.id, |r| {
            r.state = StepState::Completed;
            r.completed_at = Some(now);
        })?;
        let duration_ms = record
            .and_then(|r| r.started_at.map(|start| (now - start).num_milliseconds().max(0)))
            .unwrap_or(0) as u64;

        self.events.publish(EngineEventKind::StepCompleted {
            execution_id: *execution_id,
            step_id: step.id.clone(),
            duration_ms,
        });
        self.log(
            *execution_id,
            LogLevel::Info,
            format!("Step '{}' completed", step.id),
            serde_json::json!({"step_id": step.id, "duration_ms": duration_ms}),
        )?;

        if let StepOutcome::Branch { matched } = outcome {
            self.select_branch(plan, step, execution_id, matched)?;
        }

        self.advance(plan, execution_id).await?;
        self.try_finish(execution_id)?;
        Ok(())
    }

    /// Deactivate the branch the predicate did not select: its steps, and
    /// transitively every step depending on a deactivated step, are skipped.
    fn select_branch(
        &self,
        plan: &ExecutionPlan,
        step: &crate::types::WorkflowStep,
        execution_id: &ExecutionId,
        matched: bool,
    ) -> EngineResult<()> {
        let StepKind::Condition {
            true_steps,
            false_steps,
            ..
        } = &step.kind
        else {
            return Ok(());
        };

        self.events.publish(EngineEventKind::BranchSelected {
            execution_id: *execution_id,
            step_id: step.id.clone(),
            matched,
        });
        self.log(
            *execution_id,
            LogLevel::Info,
            format!(
                "Condition '{}' selected the {} branch",
                step.id,
                if matched { "true" } else { "false" }
            ),
            serde_json::json!({"step_id": step.id, "matched": matched}),
        )?;

        let deactivated = if matched { false_steps } else { true_steps };
        self.skip_steps(plan, execution_id, deactivated.clone(), "branch not selected")
    }

    /// Skip `seeds` and everything downstream of them. Skipped steps count
    /// toward `completed_steps` so the terminal accounting still closes.
    fn skip_steps(
        &self,
        plan: &ExecutionPlan,
        execution_id: &ExecutionId,
        seeds: Vec<StepId>,
        reason: &str,
    ) -> EngineResult<()> {
        let mut pending: VecDeque<StepId> = seeds.into();
        let mut visited: HashSet<StepId> = HashSet::new();

        while let Some(step_id) = pending.pop_front() {
            if !visited.insert(step_id.clone()) {
                continue;
            }

            let mut skipped = false;
            self.store.update_step_record(execution_id, &step_id, |r| {
                if matches!(r.state, StepState::Pending | StepState::Scheduled) {
                    r.state = StepState::Skipped;
                    skipped = true;
                }
            })?;
            if !skipped {
                continue;
            }

            self.store.update_execution(execution_id, |e| {
                e.completed_steps += 1;
            })?;
            self.events.publish(EngineEventKind::StepSkipped {
                execution_id: *execution_id,
                step_id: step_id.clone(),
                reason: reason.to_string(),
            });
            self.log(
                *execution_id,
                LogLevel::Info,
                format!("Step '{}' skipped: {}", step_id, reason),
                serde_json::json!({"step_id": step_id, "reason": reason}),
            )?;

            for dependent in plan.dependents_of(&step_id) {
                pending.push_back(dependent.id.clone());
            }
        }
        Ok(())
    }

    /// Returns Ok if the failure was fully handled; the caller still reports
    /// the error to the queue so its backoff policy drives the retry.
    async fn fail_step(
        &self,
        step: &crate::types::WorkflowStep,
        execution_id: &ExecutionId,
        job: &QueueJob,
        message: &str,
    ) -> EngineResult<()> {
        let attempt = job.retry_count + 1;
        let mut counted = false;
        let mut max_attempts = 0;
        self.store.update_execution(execution_id, |e| {
            if e.status == ExecutionStatus::Cancelled {
                return;
            }
            e.attempt_count += 1;
            max_attempts = e.max_attempts;
            counted = true;
        })?;
        if !counted {
            tracing::debug!(%execution_id, step_id = %step.id, "Discarding failure for cancelled execution");
            return Ok(());
        }
        let will_retry = attempt < max_attempts;
        self.store.update_step_record(execution_id, &step.id, |r| {
            r.state = StepState::Failed;
            r.completed_at = Some(Utc::now());
            r.error = Some(message.to_string());
        })?;

        self.events.publish(EngineEventKind::StepFailed {
            execution_id: *execution_id,
            step_id: step.id.clone(),
            error: message.to_string(),
            attempt,
            will_retry,
        });

        if will_retry {
            let delay = self.config.backoff_delay(job.retry_count);
            self.log(
                *execution_id,
                LogLevel::Warning,
                format!(
                    "Step '{}' failed (attempt {} of {}), retrying in {}s",
                    step.id,
                    attempt,
                    max_attempts,
                    delay.as_secs()
                ),
                serde_json::json!({"step_id": step.id, "attempt": attempt, "error": message}),
            )?;
            tracing::warn!(
                %execution_id,
                step_id = %step.id,
                attempt,
                "Step failed, will retry: {}",
                message
            );
            return Ok(());
        }

        let mut failed_now = false;
        self.store.update_execution(execution_id, |e| {
            if !e.status.is_terminal() {
                e.failed_steps += 1;
                e.status = ExecutionStatus::Failed;
                e.error = Some(message.to_string());
                e.completed_at = Some(Utc::now());
                e.current_step = None;
                failed_now = true;
            }
        })?;
        if !failed_now {
            return Ok(());
        }

        self.log(
            *execution_id,
            LogLevel::Error,
            format!(
                "Step '{}' failed after {} attempt(s), execution failed",
                step.id, attempt
            ),
            serde_json::json!({"step_id": step.id, "attempt": attempt, "error": message}),
        )?;

        // Close the books: everything not yet dispatched will never run
        if let Some(plan) = self.store.get_plan(execution_id)? {
            let remaining: Vec<StepId> = self
                .store
                .list_step_records(execution_id)?
                .into_iter()
                .filter(|r| matches!(r.state, StepState::Pending | StepState::Scheduled))
                .map(|r| r.step_id)
                .collect();
            self.skip_steps(&plan, execution_id, remaining, "execution failed")?;
        }

        self.events.publish(EngineEventKind::ExecutionFailed {
            execution_id: *execution_id,
            error: message.to_string(),
        });
        tracing::error!(%execution_id, step_id = %step.id, "Execution failed: {}", message);
        Ok(())
    }

    /// Schedule every pending step whose dependencies have all completed.
    /// No-op unless the execution is running.
    async fn advance(&self, plan: &ExecutionPlan, execution_id: &ExecutionId) -> EngineResult<()> {
        let Some(execution) = self.store.get_execution(execution_id)? else {
            return Ok(());
        };
        if execution.status != ExecutionStatus::Running {
            return Ok(());
        }

        let states: HashMap<StepId, StepState> = self
            .store
            .list_step_records(execution_id)?
            .into_iter()
            .map(|r| (r.step_id, r.state))
            .collect();

        for step_id in &plan.execution_order {
            if states.get(step_id) != Some(&StepState::Pending) {
                continue;
            }
            let Some(step) = plan.step(step_id) else {
                continue;
            };
            let ready = step
                .depends_on
                .iter()
                .all(|dep| states.get(dep) == Some(&StepState::Completed));
            if ready {
                self.schedule_step(execution_id, step_id).await?;
            }
        }
        Ok(())
    }

    /// Claim a pending step and enqueue its job. Returns None if another
    /// callback already claimed it.
    async fn schedule_step(
        &self,
        execution_id: &ExecutionId,
        step_id: &StepId,
    ) -> EngineResult<Option<JobId>> {
        let mut claimed = false;
        self.store.update_step_record(execution_id, step_id, |r| {
            if r.state == StepState::Pending {
                r.state = StepState::Scheduled;
                claimed = true;
            }
        })?;
        if !claimed {
            return Ok(None);
        }

        let payload = serde_json::to_value(StepJobPayload {
            execution_id: *execution_id,
            step_id: step_id.clone(),
        })?;
        let job_id = self
            .queue
            .enqueue(
                STEP_JOB_NAME,
                payload,
                JobOptions {
                    delay: None,
                    max_retries: Some(self.config.max_attempts.saturating_sub(1)),
                },
            )
            .await?;

        self.events.publish(EngineEventKind::StepScheduled {
            execution_id: *execution_id,
            step_id: step_id.clone(),
        });
        self.log(
            *execution_id,
            LogLevel::Debug,
            format!("Step '{}' scheduled", step_id),
            serde_json::json!({"step_id": step_id, "job_id": job_id}),
        )?;
        Ok(Some(job_id))
    }

    /// Transition running -> completed once every step is accounted for.
    fn try_finish(&self, execution_id: &ExecutionId) -> EngineResult<()> {
        let mut finished = false;
        let updated = self.store.update_execution(execution_id, |e| {
            if e.status == ExecutionStatus::Running
                && e.completed_steps + e.failed_steps >= e.total_steps
            {
                e.status = ExecutionStatus::Completed;
                e.completed_at = Some(Utc::now());
                e.current_step = None;
                finished = true;
            }
        })?;

        if finished {
            let duration_secs = updated
                .and_then(|e| e.completed_at.map(|end| (end - e.started_at).num_seconds().max(0)))
                .unwrap_or(0) as u64;
            self.events.publish(EngineEventKind::ExecutionCompleted {
                execution_id: *execution_id,
                duration_secs,
            });
            self.log(
                *execution_id,
                LogLevel::Info,
                "Execution completed",
                serde_json::json!({"duration_secs": duration_secs}),
            )?;
            tracing::info!(%execution_id, duration_secs, "Execution completed");
        }
        Ok(())
    }

    fn log(
        &self,
        execution_id: ExecutionId,
        level: LogLevel,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> EngineResult<()> {
        self.store
            .append_log(&ExecutionLog::new(execution_id, level, message, data))?;
        Ok(())
    }
}
