use crate::types::{
    ApiConnection, AuthorizationCode, ConnectionId, ExecutionId, ExecutionLog, StepId, StepRecord,
    Workflow, WorkflowExecution, WorkflowId,
};
use crate::workflow::compiler::ExecutionPlan;
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");
const PLANS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("plans");
const STEP_RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("step_records");
const STEP_OUTPUTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("step_outputs");
const LOGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("execution_logs");
const LOG_SEQ_TABLE: TableDefinition<&str, u64> = TableDefinition::new("execution_log_seq");
const CONNECTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("connections");
const AUTH_CODES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("auth_codes");

/// Persistent store for engine state using redb.
///
/// All records are serialized as JSON. Execution and step-record updates run
/// read-modify-write inside a single write transaction; redb serializes
/// writers, so concurrent completion callbacks cannot lose counter updates.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open workflows table")?;
            write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            write_txn
                .open_table(PLANS_TABLE)
                .context("Failed to open plans table")?;
            write_txn
                .open_table(STEP_RECORDS_TABLE)
                .context("Failed to open step records table")?;
            write_txn
                .open_table(STEP_OUTPUTS_TABLE)
                .context("Failed to open step outputs table")?;
            write_txn
                .open_table(LOGS_TABLE)
                .context("Failed to open logs table")?;
            write_txn
                .open_table(LOG_SEQ_TABLE)
                .context("Failed to open log sequence table")?;
            write_txn
                .open_table(CONNECTIONS_TABLE)
                .context("Failed to open connections table")?;
            write_txn
                .open_table(AUTH_CODES_TABLE)
                .context("Failed to open auth codes table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn insert(&self, table: TableDefinition<&str, &[u8]>, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut t = write_txn.open_table(table).context("Failed to open table")?;
            t.insert(key, value).context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get_raw(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let t = read_txn.open_table(table).context("Failed to open table")?;
        Ok(t.get(key)
            .context("Failed to read record")?
            .map(|guard| guard.value().to_vec()))
    }

    // --- Workflows ---

    pub fn put_workflow(&self, workflow: &Workflow) -> Result<()> {
        let value = serde_json::to_vec(workflow).context("Failed to serialize workflow")?;
        self.insert(WORKFLOWS_TABLE, &workflow.id.to_string(), &value)
    }

    pub fn get_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>> {
        match self.get_raw(WORKFLOWS_TABLE, &id.to_string())? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Failed to deserialize workflow")?,
            )),
            None => Ok(None),
        }
    }

    pub fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let t = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("Failed to open table")?;

        let mut workflows = Vec::new();
        for entry in t.iter().context("Failed to iterate workflows")? {
            let (_, value) = entry.context("Failed to read workflow entry")?;
            workflows.push(
                serde_json::from_slice(value.value())
                    .context("Failed to deserialize workflow")?,
            );
        }
        Ok(workflows)
    }

    // --- Executions ---

    pub fn put_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let value = serde_json::to_vec(execution).context("Failed to serialize execution")?;
        self.insert(EXECUTIONS_TABLE, &execution.id.to_string(), &value)
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Result<Option<WorkflowExecution>> {
        match self.get_raw(EXECUTIONS_TABLE, &id.to_string())? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Failed to deserialize execution")?,
            )),
            None => Ok(None),
        }
    }

    /// Whether any execution, in any state, was started from this workflow.
    pub fn workflow_has_executions(&self, workflow_id: &WorkflowId) -> Result<bool> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let t = read_txn
            .open_table(EXECUTIONS_TABLE)
            .context("Failed to open table")?;
        for entry in t.iter().context("Failed to iterate executions")? {
            let (_, value) = entry.context("Failed to read execution entry")?;
            let execution: WorkflowExecution = serde_json::from_slice(value.value())
                .context("Failed to deserialize execution")?;
            if execution.workflow_id == *workflow_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Atomically apply `mutate` to an execution inside one write transaction
    /// and return the updated record. Counter updates (completed_steps,
    /// failed_steps, current_step) must go through here, never through
    /// read-then-put in application code.
    pub fn update_execution<F>(
        &self,
        id: &ExecutionId,
        mutate: F,
    ) -> Result<Option<WorkflowExecution>>
    where
        F: FnOnce(&mut WorkflowExecution),
    {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let updated = {
            let mut t = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open table")?;

            let key = id.to_string();
            let existing = t
                .get(key.as_str())
                .context("Failed to read execution")?
                .map(|guard| guard.value().to_vec());

            match existing {
                Some(bytes) => {
                    let mut execution: WorkflowExecution = serde_json::from_slice(&bytes)
                        .context("Failed to deserialize execution")?;
                    mutate(&mut execution);
                    let value = serde_json::to_vec(&execution)
                        .context("Failed to serialize execution")?;
                    t.insert(key.as_str(), value.as_slice())
                        .context("Failed to write execution")?;
                    Some(execution)
                }
                None => None,
            }
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(updated)
    }

    // --- Plans ---

    pub fn put_plan(&self, execution_id: &ExecutionId, plan: &ExecutionPlan) -> Result<()> {
        let value = serde_json::to_vec(plan).context("Failed to serialize plan")?;
        self.insert(PLANS_TABLE, &execution_id.to_string(), &value)
    }

    pub fn get_plan(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionPlan>> {
        match self.get_raw(PLANS_TABLE, &execution_id.to_string())? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Failed to deserialize plan")?,
            )),
            None => Ok(None),
        }
    }

    // --- Step records ---

    fn step_key(execution_id: &ExecutionId, step_id: &StepId) -> String {
        format!("{}/{}", execution_id, step_id)
    }

    pub fn put_step_record(&self, execution_id: &ExecutionId, record: &StepRecord) -> Result<()> {
        let value = serde_json::to_vec(record).context("Failed to serialize step record")?;
        self.insert(
            STEP_RECORDS_TABLE,
            &Self::step_key(execution_id, &record.step_id),
            &value,
        )
    }

    pub fn get_step_record(
        &self,
        execution_id: &ExecutionId,
        step_id: &StepId,
    ) -> Result<Option<StepRecord>> {
        match self.get_raw(STEP_RECORDS_TABLE, &Self::step_key(execution_id, step_id))? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Failed to deserialize step record")?,
            )),
            None => Ok(None),
        }
    }

    pub fn update_step_record<F>(
        &self,
        execution_id: &ExecutionId,
        step_id: &StepId,
        mutate: F,
    ) -> Result<Option<StepRecord>>
    where
        F: FnOnce(&mut StepRecord),
    {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let updated = {
            let mut t = write_txn
                .open_table(STEP_RECORDS_TABLE)
                .context("Failed to open table")?;

            let key = Self::step_key(execution_id, step_id);
            let existing = t
                .get(key.as_str())
                .context("Failed to read step record")?
                .map(|guard| guard.value().to_vec());

            match existing {
                Some(bytes) => {
                    let mut record: StepRecord = serde_json::from_slice(&bytes)
                        .context("Failed to deserialize step record")?;
                    mutate(&mut record);
                    let value =
                        serde_json::to_vec(&record).context("Failed to serialize step record")?;
                    t.insert(key.as_str(), value.as_slice())
                        .context("Failed to write step record")?;
                    Some(record)
                }
                None => None,
            }
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(updated)
    }

    pub fn list_step_records(&self, execution_id: &ExecutionId) -> Result<Vec<StepRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let t = read_txn
            .open_table(STEP_RECORDS_TABLE)
            .context("Failed to open table")?;

        let prefix = format!("{}/", execution_id);
        let end = format!("{}0", execution_id);

        let mut records = Vec::new();
        for entry in t
            .range(prefix.as_str()..end.as_str())
            .context("Failed to scan step records")?
        {
            let (_, value) = entry.context("Failed to read step record entry")?;
            records.push(
                serde_json::from_slice(value.value())
                    .context("Failed to deserialize step record")?,
            );
        }
        Ok(records)
    }

    // --- Step outputs ---

    pub fn put_step_output(
        &self,
        execution_id: &ExecutionId,
        step_id: &StepId,
        output: &serde_json::Value,
    ) -> Result<()> {
        let value = serde_json::to_vec(output).context("Failed to serialize step output")?;
        self.insert(
            STEP_OUTPUTS_TABLE,
            &Self::step_key(execution_id, step_id),
            &value,
        )
    }

    pub fn get_step_outputs(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<HashMap<StepId, serde_json::Value>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let t = read_txn
            .open_table(STEP_OUTPUTS_TABLE)
            .context("Failed to open table")?;

        let prefix = format!("{}/", execution_id);
        let end = format!("{}0", execution_id);

        let mut outputs = HashMap::new();
        for entry in t
            .range(prefix.as_str()..end.as_str())
            .context("Failed to scan step outputs")?
        {
            let (key, value) = entry.context("Failed to read step output entry")?;
            let step_id = key
                .value()
                .split_once('/')
                .map(|(_, s)| StepId::new(s))
                .context("Malformed step output key")?;
            outputs.insert(
                step_id,
                serde_json::from_slice(value.value())
                    .context("Failed to deserialize step output")?,
            );
        }
        Ok(outputs)
    }

    // --- Execution logs (append-only) ---

    pub fn append_log(&self, log: &ExecutionLog) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut seq_table = write_txn
                .open_table(LOG_SEQ_TABLE)
                .context("Failed to open log sequence table")?;

            let exec_key = log.execution_id.to_string();
            let seq = seq_table
                .get(exec_key.as_str())
                .context("Failed to read log sequence")?
                .map(|guard| guard.value())
                .unwrap_or(0);
            seq_table
                .insert(exec_key.as_str(), seq + 1)
                .context("Failed to bump log sequence")?;

            let mut logs_table = write_txn
                .open_table(LOGS_TABLE)
                .context("Failed to open logs table")?;
            let key = format!("{}/{:012}", log.execution_id, seq);
            let value = serde_json::to_vec(log).context("Failed to serialize log")?;
            logs_table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to append log")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    pub fn logs_for(&self, execution_id: &ExecutionId) -> Result<Vec<ExecutionLog>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let t = read_txn
            .open_table(LOGS_TABLE)
            .context("Failed to open table")?;

        let prefix = format!("{}/", execution_id);
        let end = format!("{}0", execution_id);

        let mut logs = Vec::new();
        for entry in t
            .range(prefix.as_str()..end.as_str())
            .context("Failed to scan logs")?
        {
            let (_, value) = entry.context("Failed to read log entry")?;
            logs.push(
                serde_json::from_slice(value.value()).context("Failed to deserialize log")?,
            );
        }
        Ok(logs)
    }

    pub fn recent_logs(&self, execution_id: &ExecutionId, limit: usize) -> Result<Vec<ExecutionLog>> {
        let mut logs = self.logs_for(execution_id)?;
        if logs.len() > limit {
            logs.drain(..logs.len() - limit);
        }
        Ok(logs)
    }

    // --- Connections ---

    pub fn put_connection(&self, connection: &ApiConnection) -> Result<()> {
        let value = serde_json::to_vec(connection).context("Failed to serialize connection")?;
        self.insert(CONNECTIONS_TABLE, &connection.id.to_string(), &value)
    }

    pub fn get_connection(&self, id: &ConnectionId) -> Result<Option<ApiConnection>> {
        match self.get_raw(CONNECTIONS_TABLE, &id.to_string())? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Failed to deserialize connection")?,
            )),
            None => Ok(None),
        }
    }

    pub fn list_connections(&self) -> Result<Vec<ApiConnection>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let t = read_txn
            .open_table(CONNECTIONS_TABLE)
            .context("Failed to open table")?;

        let mut connections = Vec::new();
        for entry in t.iter().context("Failed to iterate connections")? {
            let (_, value) = entry.context("Failed to read connection entry")?;
            connections.push(
                serde_json::from_slice(value.value())
                    .context("Failed to deserialize connection")?,
            );
        }
        Ok(connections)
    }

    // --- Authorization codes ---

    pub fn put_auth_code(&self, code: &AuthorizationCode) -> Result<()> {
        let value = serde_json::to_vec(code).context("Failed to serialize auth code")?;
        self.insert(AUTH_CODES_TABLE, &code.connection_id.to_string(), &value)
    }

    /// Claim and delete the authorization code for a connection, if present.
    pub fn take_auth_code(&self, connection_id: &ConnectionId) -> Result<Option<AuthorizationCode>> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let taken = {
            let mut t = write_txn
                .open_table(AUTH_CODES_TABLE)
                .context("Failed to open table")?;
            let key = connection_id.to_string();
            let removed = t
                .remove(key.as_str())
                .context("Failed to remove auth code")?
                .map(|guard| guard.value().to_vec());
            removed
        };
        write_txn.commit().context("Failed to commit")?;

        match taken {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Failed to deserialize auth code")?,
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionStatus, LogLevel};
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, RedbStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = RedbStore::new(temp_file.path().to_path_buf()).unwrap();
        (temp_file, store)
    }

    fn test_execution() -> WorkflowExecution {
        WorkflowExecution {
            id: ExecutionId::new(),
            workflow_id: WorkflowId::new(),
            status: ExecutionStatus::Pending,
            current_step: None,
            total_steps: 3,
            completed_steps: 0,
            failed_steps: 0,
            attempt_count: 0,
            max_attempts: 3,
            started_at: chrono::Utc::now(),
            completed_at: None,
            error: None,
            queue_job_id: None,
        }
    }

    #[test]
    fn test_execution_roundtrip_and_atomic_update() {
        let (_f, store) = test_store();
        let execution = test_execution();

        store.put_execution(&execution).unwrap();
        let retrieved = store.get_execution(&execution.id).unwrap().unwrap();
        assert_eq!(retrieved.id, execution.id);

        let updated = store
            .update_execution(&execution.id, |e| {
                e.completed_steps += 1;
                e.status = ExecutionStatus::Running;
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.completed_steps, 1);
        assert_eq!(updated.status, ExecutionStatus::Running);

        // Missing executions update to None, no error
        assert!(store
            .update_execution(&ExecutionId::new(), |_| {})
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_step_records_scoped_by_execution() {
        let (_f, store) = test_store();
        let exec_a = ExecutionId::new();
        let exec_b = ExecutionId::new();

        store
            .put_step_record(&exec_a, &StepRecord::pending(StepId::new("step1")))
            .unwrap();
        store
            .put_step_record(&exec_a, &StepRecord::pending(StepId::new("step2")))
            .unwrap();
        store
            .put_step_record(&exec_b, &StepRecord::pending(StepId::new("step1")))
            .unwrap();

        assert_eq!(store.list_step_records(&exec_a).unwrap().len(), 2);
        assert_eq!(store.list_step_records(&exec_b).unwrap().len(), 1);
    }

    #[test]
    fn test_logs_are_ordered_and_limited() {
        let (_f, store) = test_store();
        let execution_id = ExecutionId::new();

        for i in 0..5 {
            store
                .append_log(&ExecutionLog::new(
                    execution_id,
                    LogLevel::Info,
                    format!("entry {}", i),
                    serde_json::Value::Null,
                ))
                .unwrap();
        }

        let all = store.logs_for(&execution_id).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].message, "entry 0");
        assert_eq!(all[4].message, "entry 4");

        let recent = store.recent_logs(&execution_id, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "entry 3");
        assert_eq!(recent[1].message, "entry 4");
    }

    #[test]
    fn test_step_outputs_roundtrip() {
        let (_f, store) = test_store();
        let execution_id = ExecutionId::new();

        store
            .put_step_output(
                &execution_id,
                &StepId::new("fetch"),
                &serde_json::json!({"status": "ok"}),
            )
            .unwrap();

        let outputs = store.get_step_outputs(&execution_id).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[&StepId::new("fetch")]["status"], "ok");
    }

    #[test]
    fn test_auth_code_take_is_single_use() {
        let (_f, store) = test_store();
        let connection_id = ConnectionId::new();

        store
            .put_auth_code(&AuthorizationCode {
                connection_id,
                code: "abc123".to_string(),
                expires_at: chrono::Utc::now() + chrono::Duration::seconds(60),
            })
            .unwrap();

        let taken = store.take_auth_code(&connection_id).unwrap().unwrap();
        assert_eq!(taken.code, "abc123");
        assert!(store.take_auth_code(&connection_id).unwrap().is_none());
    }
}
