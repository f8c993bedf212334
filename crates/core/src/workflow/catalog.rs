//! Stored workflow definitions and their lifecycle.
//!
//! Definitions move draft -> active -> paused/archived through named
//! transitions, and only active workflows compile into execution plans. A
//! definition freezes once any execution has been started from it; changing
//! the graph after that point means creating a new workflow, so historical
//! executions always refer to the steps they actually ran.

use crate::error::{EngineError, EngineResult};
use crate::storage::RedbStore;
use crate::types::{Workflow, WorkflowId, WorkflowStatus, WorkflowStep};
use crate::workflow::compiler::{self, ExecutionPlan};
use crate::workflow::validator;
use chrono::Utc;

pub struct WorkflowCatalog {
    store: RedbStore,
}

impl WorkflowCatalog {
    pub fn new(store: RedbStore) -> Self {
        Self { store }
    }

    /// Store a new draft. The step graph is validated up front so a draft is
    /// always one publish away from runnable.
    pub fn create(
        &self,
        name: impl Into<String>,
        description: Option<String>,
        steps: Vec<WorkflowStep>,
    ) -> EngineResult<Workflow> {
        let report = validator::validate(&steps);
        if !report.is_valid {
            return Err(EngineError::Validation {
                issues: report.issues,
            });
        }

        let now = Utc::now();
        let workflow = Workflow {
            id: WorkflowId::new(),
            name: name.into(),
            description,
            steps,
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        self.store.put_workflow(&workflow)?;
        tracing::info!(workflow_id = %workflow.id, "Created workflow draft");
        Ok(workflow)
    }

    pub fn get(&self, id: &WorkflowId) -> EngineResult<Option<Workflow>> {
        Ok(self.store.get_workflow(id)?)
    }

    pub fn list(&self) -> EngineResult<Vec<Workflow>> {
        Ok(self.store.list_workflows()?)
    }

    /// Replace the step graph of a workflow that has never been executed.
    pub fn update_steps(
        &self,
        id: &WorkflowId,
        steps: Vec<WorkflowStep>,
    ) -> EngineResult<Workflow> {
        let mut workflow = self
            .store
            .get_workflow(id)?
            .ok_or_else(|| EngineError::not_found("workflow", id))?;

        if workflow.status == WorkflowStatus::Archived {
            return Err(EngineError::InvalidWorkflowAction {
                workflow_id: *id,
                status: workflow.status,
                action: "update",
            });
        }
        // Frozen once executed: records of past runs must keep pointing at
        // the graph they ran.
        if self.store.workflow_has_executions(id)? {
            return Err(EngineError::InvalidWorkflowAction {
                workflow_id: *id,
                status: workflow.status,
                action: "update",
            });
        }

        let report = validator::validate(&steps);
        if !report.is_valid {
            return Err(EngineError::Validation {
                issues: report.issues,
            });
        }

        workflow.steps = steps;
        workflow.updated_at = Utc::now();
        self.store.put_workflow(&workflow)?;
        Ok(workflow)
    }

    /// draft/paused -> active
    pub fn publish(&self, id: &WorkflowId) -> EngineResult<Workflow> {
        self.transition(id, WorkflowStatus::Active, "publish")
    }

    /// active -> paused
    pub fn pause(&self, id: &WorkflowId) -> EngineResult<Workflow> {
        self.transition(id, WorkflowStatus::Paused, "pause")
    }

    /// Any live status -> archived. Terminal; an archived workflow can be
    /// read but never published or edited again.
    pub fn archive(&self, id: &WorkflowId) -> EngineResult<Workflow> {
        self.transition(id, WorkflowStatus::Archived, "archive")
    }

    /// Compile the stored definition into an execution plan. Only active
    /// workflows produce plans; the coordinator takes it from there.
    pub fn plan(&self, id: &WorkflowId) -> EngineResult<ExecutionPlan> {
        let workflow = self
            .store
            .get_workflow(id)?
            .ok_or_else(|| EngineError::not_found("workflow", id))?;

        if workflow.status != WorkflowStatus::Active {
            return Err(EngineError::InvalidWorkflowAction {
                workflow_id: *id,
                status: workflow.status,
                action: "execute",
            });
        }

        compiler::compile(workflow.id, workflow.steps).map_err(|report| EngineError::Validation {
            issues: report.issues,
        })
    }

    fn transition(
        &self,
        id: &WorkflowId,
        to: WorkflowStatus,
        action: &'static str,
    ) -> EngineResult<Workflow> {
        let mut workflow = self
            .store
            .get_workflow(id)?
            .ok_or_else(|| EngineError::not_found("workflow", id))?;

        let from = workflow.status;
        if !allowed(from, to) {
            return Err(EngineError::InvalidWorkflowAction {
                workflow_id: *id,
                status: from,
                action,
            });
        }

        workflow.status = to;
        workflow.updated_at = Utc::now();
        self.store.put_workflow(&workflow)?;

        tracing::info!(workflow_id = %id, %from, %to, "Workflow transition");
        Ok(workflow)
    }
}

fn allowed(from: WorkflowStatus, to: WorkflowStatus) -> bool {
    use WorkflowStatus::*;
    matches!(
        (from, to),
        (Draft, Active)
            | (Paused, Active)
            | (Active, Paused)
            | (Draft, Archived)
            | (Active, Archived)
            | (Paused, Archived)
    )
}
