//! Durable job queue with at-least-once delivery.
//!
//! Jobs are opaque payload carriers persisted in their own redb database;
//! the queue knows nothing about workflow semantics. Failed jobs are retried
//! with exponential backoff (`base * 2^retry_count`, capped) up to a
//! per-job maximum, then marked failed. A worker crash between claim and
//! completion leaves the job `active`; `recover_stale` returns such jobs to
//! `created` after the visibility timeout, so handlers must be idempotent.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{JobId, JobState, QueueJob};
use anyhow::{Context, Result};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Notify, RwLock};

const JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Options accepted by `enqueue`
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Delay before the job becomes claimable
    pub delay: Option<std::time::Duration>,
    /// Retries before the job is marked failed; defaults to the engine's
    /// `max_attempts - 1`
    pub max_retries: Option<u32>,
}

/// Consumer invoked for jobs matching a registered name
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob) -> anyhow::Result<()>;
}

/// Job queue interface consumed by the coordinator
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> EngineResult<JobId>;

    async fn job_state(&self, job_id: &JobId) -> EngineResult<Option<JobState>>;

    async fn register(&self, name: &str, handler: Arc<dyn JobHandler>);
}

/// Redb-backed durable queue with a polling worker loop.
pub struct RedbJobQueue {
    db: Arc<Database>,
    config: EngineConfig,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
    wakeup: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
}

impl RedbJobQueue {
    pub fn new(path: PathBuf, config: EngineConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create queue directory")?;
        }

        let db = Database::create(&path).context("Failed to create queue database")?;
        let write_txn = db.begin_write().context("Failed to begin write")?;
        {
            write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;
        }
        write_txn.commit().context("Failed to commit")?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            db: Arc::new(db),
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            wakeup: Arc::new(Notify::new()),
            shutdown_tx,
        })
    }

    /// Spawn the worker loop. Call once after constructing the queue.
    pub fn start(self: &Arc<Self>) {
        let queue = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            // Re-run stale recovery on the visibility-timeout cadence, not
            // just at startup, so a handler that dies mid-job gets its job
            // redelivered without a worker restart.
            let recovery_period =
                std::time::Duration::from_secs(queue.config.queue.visibility_timeout_secs.max(1));
            let mut last_recovery = tokio::time::Instant::now();
            if let Err(e) = queue.recover_stale() {
                tracing::error!("Failed to recover stale jobs: {:#}", e);
            }

            loop {
                if *shutdown_rx.borrow() {
                    tracing::info!("Job queue worker stopping");
                    break;
                }

                if last_recovery.elapsed() >= recovery_period {
                    last_recovery = tokio::time::Instant::now();
                    match queue.recover_stale() {
                        Ok(recovered) if recovered > 0 => {
                            tracing::warn!(recovered, "Recovered stale jobs");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Failed to recover stale jobs: {:#}", e),
                    }
                }

                match queue.claim_due_jobs().await {
                    Ok(jobs) => {
                        for job in jobs {
                            let queue = queue.clone();
                            tokio::spawn(async move {
                                queue.run_job(job).await;
                            });
                        }
                    }
                    Err(e) => tracing::error!("Job scan failed: {:#}", e),
                }

                tokio::select! {
                    _ = queue.wakeup.notified() => {}
                    _ = tokio::time::sleep(queue.config.poll_interval()) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        });
    }

    /// Stop the worker loop. In-flight handlers run to completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Return abandoned `active` jobs (claimed longer ago than the
    /// visibility timeout) to `created` for redelivery.
    pub fn recover_stale(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.config.visibility_timeout();
        let mut recovered = 0;

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;

            let stale: Vec<QueueJob> = {
                let mut found = Vec::new();
                for entry in table.iter().context("Failed to scan jobs")? {
                    let (_, value) = entry.context("Failed to read job entry")?;
                    let job: QueueJob = serde_json::from_slice(value.value())
                        .context("Failed to deserialize job")?;
                    if job.state == JobState::Active
                        && job.claimed_on.map(|t| t < cutoff).unwrap_or(true)
                    {
                        found.push(job);
                    }
                }
                found
            };

            for mut job in stale {
                tracing::warn!(job_id = %job.id, "Redelivering stale active job");
                job.state = JobState::Created;
                job.claimed_on = None;
                let key = job.id.to_string();
                let value = serde_json::to_vec(&job).context("Failed to serialize job")?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to write job")?;
                recovered += 1;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(recovered)
    }

    /// Claim all due created/retry jobs with a registered handler, flipping
    /// them to `active` in a single write transaction.
    async fn claim_due_jobs(&self) -> Result<Vec<QueueJob>> {
        let registered: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        if registered.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut claimed = Vec::new();

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;

            let due: Vec<QueueJob> = {
                let mut found = Vec::new();
                for entry in table.iter().context("Failed to scan jobs")? {
                    let (_, value) = entry.context("Failed to read job entry")?;
                    let job: QueueJob = serde_json::from_slice(value.value())
                        .context("Failed to deserialize job")?;
                    let due = matches!(job.state, JobState::Created | JobState::Retry)
                        && job.run_at <= now;
                    if due && registered.contains(&job.name) {
                        found.push(job);
                    }
                }
                found
            };

            for mut job in due {
                job.state = JobState::Active;
                job.claimed_on = Some(now);
                let key = job.id.to_string();
                let value = serde_json::to_vec(&job).context("Failed to serialize job")?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to write job")?;
                claimed.push(job);
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(claimed)
    }

    async fn run_job(&self, job: QueueJob) {
        let handler = self.handlers.read().await.get(&job.name).cloned();
        let Some(handler) = handler else {
            // Handler unregistered between claim and dispatch; redeliver later
            if let Err(e) = self.update_job(&job.id, |j| {
                j.state = JobState::Created;
                j.claimed_on = None;
            }) {
                tracing::error!(job_id = %job.id, "Failed to release job: {:#}", e);
            }
            return;
        };

        tracing::debug!(job_id = %job.id, name = %job.name, attempt = job.retry_count, "Running job");

        match handler.handle(&job).await {
            Ok(()) => {
                if let Err(e) = self.update_job(&job.id, |j| {
                    j.state = JobState::Completed;
                    j.completed_on = Some(Utc::now());
                }) {
                    tracing::error!(job_id = %job.id, "Failed to complete job: {:#}", e);
                }
            }
            Err(err) => {
                let will_retry = job.retry_count < job.max_retries;
                let delay = self.config.backoff_delay(job.retry_count);
                let error = format!("{:#}", err);

                tracing::warn!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    will_retry,
                    "Job failed: {}",
                    error
                );

                let result = self.update_job(&job.id, |j| {
                    j.last_error = Some(error.clone());
                    if will_retry {
                        j.retry_count += 1;
                        j.state = JobState::Retry;
                        j.claimed_on = None;
                        j.run_at = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(0));
                    } else {
                        j.state = JobState::Failed;
                        j.completed_on = Some(Utc::now());
                    }
                });
                if let Err(e) = result {
                    tracing::error!(job_id = %job.id, "Failed to record job failure: {:#}", e);
                }
            }
        }
        self.wakeup.notify_one();
    }

    fn update_job<F>(&self, job_id: &JobId, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut QueueJob),
    {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;
            let key = job_id.to_string();
            let existing = table
                .get(key.as_str())
                .context("Failed to read job")?
                .map(|guard| guard.value().to_vec());

            if let Some(bytes) = existing {
                let mut job: QueueJob =
                    serde_json::from_slice(&bytes).context("Failed to deserialize job")?;
                mutate(&mut job);
                let value = serde_json::to_vec(&job).context("Failed to serialize job")?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to write job")?;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Option<QueueJob>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(JOBS_TABLE)
            .context("Failed to open jobs table")?;
        match table
            .get(job_id.to_string().as_str())
            .context("Failed to read job")?
        {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).context("Failed to deserialize job")?,
            )),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl JobQueue for RedbJobQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> EngineResult<JobId> {
        let now = Utc::now();
        let run_at = match options.delay {
            Some(delay) => {
                now + chrono::Duration::from_std(delay)
                    .map_err(|e| EngineError::Queue(format!("invalid delay: {}", e)))?
            }
            None => now,
        };

        let job = QueueJob {
            id: JobId::new(),
            name: name.to_string(),
            payload,
            state: JobState::Created,
            retry_count: 0,
            max_retries: options
                .max_retries
                .unwrap_or_else(|| self.config.max_attempts.saturating_sub(1)),
            run_at,
            claimed_on: None,
            created_on: now,
            completed_on: None,
            last_error: None,
        };

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;
            let key = job.id.to_string();
            let value = serde_json::to_vec(&job).context("Failed to serialize job")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to write job")?;
        }
        write_txn.commit().context("Failed to commit")?;

        tracing::debug!(job_id = %job.id, name, "Enqueued job");
        self.wakeup.notify_one();
        Ok(job.id)
    }

    async fn job_state(&self, job_id: &JobId) -> EngineResult<Option<JobState>> {
        Ok(self.get_job(job_id)?.map(|j| j.state))
    }

    async fn register(&self, name: &str, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .await
            .insert(name.to_string(), handler);
        self.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.queue.poll_interval_ms = 10;
        config.backoff.base_secs = 0;
        config
    }

    fn test_queue() -> (tempfile::TempDir, Arc<RedbJobQueue>) {
        let dir = tempfile::tempdir().unwrap();
        let queue =
            Arc::new(RedbJobQueue::new(dir.path().join("queue.redb"), fast_config()).unwrap());
        (dir, queue)
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait::async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &QueueJob) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                anyhow::bail!("transient failure {}", call)
            }
            Ok(())
        }
    }

    async fn wait_for_state(queue: &RedbJobQueue, job_id: &JobId, state: JobState) {
        for _ in 0..200 {
            if queue.job_state(job_id).await.unwrap() == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "job never reached {:?}, currently {:?}",
            state,
            queue.job_state(job_id).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_enqueue_and_complete() {
        let (_dir, queue) = test_queue();
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        queue.register("work", handler.clone()).await;
        queue.start();

        let job_id = queue
            .enqueue("work", serde_json::json!({"n": 1}), JobOptions::default())
            .await
            .unwrap();

        wait_for_state(&queue, &job_id, JobState::Completed).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let (_dir, queue) = test_queue();
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        queue.register("flaky", handler.clone()).await;
        queue.start();

        let job_id = queue
            .enqueue(
                "flaky",
                serde_json::Value::Null,
                JobOptions {
                    max_retries: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        wait_for_state(&queue, &job_id, JobState::Completed).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let job = queue.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.retry_count, 2);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let (_dir, queue) = test_queue();
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        queue.register("doomed", handler.clone()).await;
        queue.start();

        let job_id = queue
            .enqueue(
                "doomed",
                serde_json::Value::Null,
                JobOptions {
                    max_retries: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        wait_for_state(&queue, &job_id, JobState::Failed).await;
        // Initial attempt plus one retry
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        let job = queue.get_job(&job_id).unwrap().unwrap();
        assert!(job.last_error.as_deref().unwrap().contains("transient failure"));
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimed_early() {
        let (_dir, queue) = test_queue();
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        queue.register("later", handler.clone()).await;
        queue.start();

        let job_id = queue
            .enqueue(
                "later",
                serde_json::Value::Null,
                JobOptions {
                    delay: Some(Duration::from_millis(300)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            queue.job_state(&job_id).await.unwrap(),
            Some(JobState::Created)
        );

        wait_for_state(&queue, &job_id, JobState::Completed).await;
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_stale_active_job_redelivered() {
        let (_dir, queue) = test_queue();

        // Simulate a crash: job stuck active with an ancient claim time
        let job_id = queue
            .enqueue("stuck", serde_json::Value::Null, JobOptions::default())
            .await
            .unwrap();
        queue
            .update_job(&job_id, |j| {
                j.state = JobState::Active;
                j.claimed_on = Some(Utc::now() - chrono::Duration::hours(1));
            })
            .unwrap();

        let recovered = queue.recover_stale().unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(
            queue.job_state(&job_id).await.unwrap(),
            Some(JobState::Created)
        );
    }

    #[tokio::test]
    async fn test_running_worker_recovers_job_stuck_after_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.queue.visibility_timeout_secs = 1;
        let queue = Arc::new(RedbJobQueue::new(dir.path().join("queue.redb"), config).unwrap());

        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        queue.register("stuck", handler.clone()).await;
        queue.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The job goes stale only after the worker's startup recovery pass,
        // so completion requires the loop to keep recovering. The far-future
        // delay keeps the worker from claiming it before it is staged active.
        let job_id = queue
            .enqueue(
                "stuck",
                serde_json::Value::Null,
                JobOptions {
                    delay: Some(Duration::from_secs(3600)),
                    max_retries: None,
                },
            )
            .await
            .unwrap();
        queue
            .update_job(&job_id, |j| {
                j.state = JobState::Active;
                j.claimed_on = Some(Utc::now() - chrono::Duration::hours(1));
                j.run_at = Utc::now() - chrono::Duration::hours(1);
            })
            .unwrap();

        for _ in 0..500 {
            if queue.job_state(&job_id).await.unwrap() == Some(JobState::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            queue.job_state(&job_id).await.unwrap(),
            Some(JobState::Completed)
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_jobs_without_handler_stay_queued() {
        let (_dir, queue) = test_queue();
        queue.start();

        let job_id = queue
            .enqueue("unhandled", serde_json::Value::Null, JobOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            queue.job_state(&job_id).await.unwrap(),
            Some(JobState::Created)
        );
        queue.shutdown();
    }
}
