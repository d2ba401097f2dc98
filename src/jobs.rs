// ⚙️ Job Orchestrator - long-running imports and matches as async jobs
//
//   pending ──► running ──► completed | failed | canceled
//      └──────────────────► canceled
//
// A fixed pool of workers drains a bounded queue. Cancellation is cooperative:
// the job function polls its token, and a running job only becomes `canceled`
// once that function returns.

use crate::clock::{Clock, IdGenerator};
use crate::config::JobConfig;
use crate::error::{with_deadline, EngineError, Result};
use crate::importer::{BatchImporter, ImportBatch, RunControl};
use crate::reconciliation::ReconciliationEngine;
use crate::store::JobStore;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// JOB MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Import,
    AutoMatch,
    Custom(String),
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Import => f.write_str("import"),
            JobType::AutoMatch => f.write_str("auto_match"),
            JobType::Custom(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// 0-100, reported by the job function
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<EngineError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    fn new(id: String, job_type: JobType, now: DateTime<Utc>) -> Self {
        Job {
            id,
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        if status == JobStatus::Completed {
            self.progress = 100;
        }
    }
}

// ============================================================================
// JOB FUNCTIONS
// ============================================================================

pub type JobFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;
pub type JobFn = Box<dyn FnOnce(JobContext) -> JobFuture + Send>;

/// What a running job sees: its id, its cancellation token and a progress sink.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub cancel: CancellationToken,
    entry: Arc<JobEntry>,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Clamped to 100. Not required to be monotonic.
    pub fn report_progress(&self, percent: u8) {
        self.entry.set_progress(percent);
    }

    /// Cancellation and progress wired for the importer / matcher.
    pub fn run_control(&self) -> RunControl {
        let entry = Arc::clone(&self.entry);
        RunControl::new(self.cancel.clone()).with_progress(Arc::new(move |p: u8| entry.set_progress(p)))
    }
}

/// Run an import session as a job. The job fails if the import hits a fatal error.
pub fn import_job(importer: Arc<BatchImporter>, session_id: String, batch: ImportBatch) -> JobFn {
    Box::new(move |ctx: JobContext| -> JobFuture {
        Box::pin(async move {
            let options = importer.config().clone();
            let result = importer
                .run(&session_id, batch, &options, ctx.run_control())
                .await?;
            if let Some(fatal) = result.fatal.clone() {
                return Err(fatal);
            }
            Ok(serde_json::to_value(&result)?)
        })
    })
}

pub fn auto_match_job(
    engine: Arc<ReconciliationEngine>,
    from: NaiveDate,
    to: NaiveDate,
    threshold: Option<f64>,
) -> JobFn {
    Box::new(move |ctx: JobContext| -> JobFuture {
        Box::pin(async move {
            let report = engine.auto_match(from, to, threshold, &ctx.run_control()).await?;
            Ok(serde_json::to_value(&report)?)
        })
    })
}

// ============================================================================
// REGISTRY ENTRY
// ============================================================================

/// One lock per job; `status` lets waiters park until the job settles.
struct JobEntry {
    job: RwLock<Job>,
    cancel: CancellationToken,
    status: watch::Sender<JobStatus>,
}

impl JobEntry {
    fn new(job: Job) -> Self {
        let (status, _) = watch::channel(job.status);
        JobEntry {
            job: RwLock::new(job),
            cancel: CancellationToken::new(),
            status,
        }
    }

    fn snapshot(&self) -> Job {
        self.job.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Apply `change` under the job's write lock and publish the new status.
    fn update<F>(&self, change: F) -> Job
    where
        F: FnOnce(&mut Job),
    {
        let job = {
            let mut job = self.job.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            change(&mut job);
            job.clone()
        };
        self.status.send_replace(job.status);
        job
    }

    fn set_progress(&self, percent: u8) {
        let mut job = self.job.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if job.status == JobStatus::Running {
            job.progress = percent.min(100);
        }
    }
}

struct QueuedJob {
    entry: Arc<JobEntry>,
    func: JobFn,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

struct Shared {
    jobs: RwLock<HashMap<String, Arc<JobEntry>>>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: JobConfig,
    storage_timeout: Duration,
}

pub struct JobOrchestrator {
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl JobOrchestrator {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: JobConfig,
        storage_timeout: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<QueuedJob>(config.queue_capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            jobs: RwLock::new(HashMap::new()),
            store,
            clock,
            ids,
            config,
            storage_timeout,
        });

        let workers = (0..shared.config.workers.max(1))
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(worker, "Job worker started");
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => None,
                            queued = async { rx.lock().await.recv().await } => queued,
                        };
                        let Some(queued) = next else { break };
                        shared.execute(queued).await;
                    }
                    debug!(worker, "Job worker stopped");
                })
            })
            .collect();

        info!(workers = shared.config.workers, queue = shared.config.queue_capacity, "Job orchestrator started");
        Arc::new(JobOrchestrator {
            shared,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shutdown,
        })
    }

    /// Register a pending job and return it straight away.
    pub async fn create_job(&self, job_type: JobType) -> Result<Job> {
        let job = Job::new(self.shared.ids.next_id(), job_type, self.shared.clock.now());
        self.shared.persist(&job).await;
        self.shared
            .jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job.id.clone(), Arc::new(JobEntry::new(job.clone())));

        info!(job_id = %job.id, job_type = %job.job_type, "Job created");
        Ok(job)
    }

    /// Queue `func` for a pending job. Waits at most `submit_timeout` for a
    /// queue slot, then fails with a transient backpressure error.
    pub async fn submit_job(&self, job_id: &str, func: JobFn) -> Result<Job> {
        let entry = self.shared.entry(job_id)?;
        let job = entry.snapshot();
        if job.status != JobStatus::Pending {
            return Err(EngineError::InvalidTransition {
                entity: "job".to_string(),
                from: job.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }

        let sender = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| EngineError::transient("submit_job", "orchestrator is shutting down"))?;

        let queued = QueuedJob {
            entry: Arc::clone(&entry),
            func,
        };
        match tokio::time::timeout(self.shared.config.submit_timeout, sender.send(queued)).await {
            Ok(Ok(())) => {
                debug!(job_id, "Job queued");
                Ok(entry.snapshot())
            }
            Ok(Err(_)) => Err(EngineError::transient("submit_job", "orchestrator is shutting down")),
            Err(_) => {
                warn!(job_id, "Job queue full, submission rejected");
                Err(EngineError::transient(
                    "submit_job",
                    format!("job queue full after {:?}", self.shared.config.submit_timeout),
                ))
            }
        }
    }

    /// `create_job` + `submit_job`. A rejected submission leaves the job canceled.
    pub async fn spawn_job(&self, job_type: JobType, func: JobFn) -> Result<Job> {
        let job = self.create_job(job_type).await?;
        match self.submit_job(&job.id, func).await {
            Ok(job) => Ok(job),
            Err(err) => {
                let _ = self.cancel_job(&job.id).await;
                Err(err)
            }
        }
    }

    /// Request cancellation. Pending jobs are canceled at once; running jobs
    /// keep `running` until their function returns.
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job> {
        let entry = self.shared.entry(job_id)?;
        let current = entry.snapshot();
        if current.status.is_terminal() {
            return Err(EngineError::Terminal {
                entity: "job".to_string(),
                id: job_id.to_string(),
                status: current.status.to_string(),
            });
        }

        entry.cancel.cancel();
        let now = self.shared.clock.now();
        let job = entry.update(|job| {
            if job.status == JobStatus::Pending {
                job.finish(JobStatus::Canceled, now);
            }
        });
        if job.status == JobStatus::Canceled {
            self.shared.persist(&job).await;
        }

        warn!(job_id, status = %job.status, "Job cancellation requested");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        if let Ok(entry) = self.shared.entry(job_id) {
            return Ok(entry.snapshot());
        }
        with_deadline("load_job", self.shared.storage_timeout, self.shared.store.load_job(job_id))
            .await?
            .ok_or_else(|| EngineError::not_found("job", job_id))
    }

    /// Live jobs plus any the store still remembers, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: HashMap<String, Job> =
            with_deadline("list_jobs", self.shared.storage_timeout, self.shared.store.list_jobs())
                .await?
                .into_iter()
                .map(|job| (job.id.clone(), job))
                .collect();
        for entry in self.shared.entries() {
            let job = entry.snapshot();
            jobs.insert(job.id.clone(), job);
        }

        let mut jobs: Vec<Job> = jobs.into_values().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Block until the job is terminal or `timeout` elapses.
    pub async fn wait_for(&self, job_id: &str, timeout: Duration) -> Result<Job> {
        let entry = self.shared.entry(job_id)?;
        let mut status = entry.status.subscribe();
        let settled = tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal()))
            .await
            .is_ok();
        if settled {
            return Ok(entry.snapshot());
        }
        Err(EngineError::Timeout {
            operation: format!("wait_for job {}", job_id),
            after_ms: timeout.as_millis() as u64,
        })
    }

    /// Purge terminal jobs that finished more than `max_age` ago.
    pub async fn cleanup_old_jobs(&self, max_age: Duration) -> Result<usize> {
        self.shared.cleanup_old_jobs(max_age).await
    }

    /// Run `cleanup_old_jobs(retention)` every `sweep_interval` until shutdown.
    pub fn spawn_retention_sweeper(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.sweep_interval.max(Duration::from_secs(1)));
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = shared.cleanup_old_jobs(shared.config.retention).await {
                            warn!("Job retention sweep failed: {}", err);
                        }
                    }
                }
            }
            debug!("Job retention sweeper stopped");
        })
    }

    /// Stop taking work, let running jobs finish and cancel whatever is still queued.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();

        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for worker in workers {
            if let Err(err) = worker.await {
                error!("Job worker ended abnormally: {}", err);
            }
        }

        let now = self.shared.clock.now();
        for entry in self.shared.entries() {
            if entry.snapshot().status == JobStatus::Pending {
                entry.cancel.cancel();
                let job = entry.update(|job| job.finish(JobStatus::Canceled, now));
                self.shared.persist(&job).await;
            }
        }
        info!("Job orchestrator stopped");
    }
}

impl Shared {
    fn entry(&self, job_id: &str) -> Result<Arc<JobEntry>> {
        self.jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("job", job_id))
    }

    fn entries(&self) -> Vec<Arc<JobEntry>> {
        self.jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Mirror a snapshot to the store. Failures are logged; the in-memory
    /// registry stays authoritative for live jobs.
    async fn persist(&self, job: &Job) {
        if let Err(err) = with_deadline("save_job", self.storage_timeout, self.store.save_job(job)).await {
            warn!(job_id = %job.id, "Job snapshot not saved: {}", err);
        }
    }

    async fn execute(&self, queued: QueuedJob) {
        let QueuedJob { entry, func } = queued;

        let now = self.clock.now();
        let mut claimed = false;
        let job = entry.update(|job| {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                claimed = true;
            }
        });
        if !claimed {
            debug!(job_id = %job.id, status = %job.status, "Skipping job that is no longer pending");
            return;
        }
        self.persist(&job).await;
        info!(job_id = %job.id, job_type = %job.job_type, "Job started");

        let ctx = JobContext {
            job_id: job.id.clone(),
            cancel: entry.cancel.clone(),
            entry: Arc::clone(&entry),
        };
        let task = tokio::spawn(func(ctx));
        let outcome = tokio::time::timeout(self.config.job_timeout, task).await;

        let cancelled = entry.cancel.is_cancelled();
        let now = self.clock.now();
        let job = match outcome {
            Ok(Ok(Ok(value))) => entry.update(|job| {
                job.result = Some(value);
                job.finish(if cancelled { JobStatus::Canceled } else { JobStatus::Completed }, now);
            }),
            Ok(Ok(Err(err))) => entry.update(|job| {
                job.error = Some(err);
                job.finish(if cancelled { JobStatus::Canceled } else { JobStatus::Failed }, now);
            }),
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    join_err.to_string()
                };
                error!(job_id = %job.id, "Job panicked: {}", message);
                entry.update(|job| {
                    job.error = Some(EngineError::fatal(format!("job panicked: {}", message)));
                    job.finish(JobStatus::Failed, now);
                })
            }
            Err(_) => {
                // the function keeps running until it notices the token
                entry.cancel.cancel();
                entry.update(|job| {
                    job.error = Some(EngineError::Timeout {
                        operation: format!("job {}", job.id),
                        after_ms: self.config.job_timeout.as_millis() as u64,
                    });
                    job.finish(JobStatus::Failed, now);
                })
            }
        };
        self.persist(&job).await;

        match job.status {
            JobStatus::Failed => warn!(job_id = %job.id, error = ?job.error, "Job failed"),
            status => info!(job_id = %job.id, status = %status, "Job finished"),
        }
    }

    async fn cleanup_old_jobs(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| EngineError::validation("max_age", e.to_string()))?;
        let cutoff = self.clock.now() - max_age;
        let expired = |job: &Job| {
            job.status.is_terminal() && job.completed_at.unwrap_or(job.created_at) < cutoff
        };

        let mut purged: Vec<String> = {
            let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let ids: Vec<String> = jobs
                .iter()
                .filter(|(_, entry)| expired(&entry.snapshot()))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                jobs.remove(id);
            }
            ids
        };

        let stored = with_deadline("list_jobs", self.storage_timeout, self.store.list_jobs()).await?;
        for job in stored.iter().filter(|&job| expired(job)) {
            if !purged.contains(&job.id) {
                purged.push(job.id.clone());
            }
        }
        for id in &purged {
            with_deadline("delete_job", self.storage_timeout, self.store.delete_job(id)).await?;
        }

        if !purged.is_empty() {
            info!(purged = purged.len(), "Old jobs cleaned up");
        }
        Ok(purged.len())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use serde_json::json;

    fn start_orchestrator(config: JobConfig) -> (Arc<JobOrchestrator>, Arc<ManualClock>, MemoryStore) {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()));
        let orchestrator = JobOrchestrator::start(
            Arc::new(store.clone()),
            clock.clone(),
            Arc::new(SequentialIds::new("job")),
            config,
            Duration::from_secs(1),
        );
        (orchestrator, clock, store)
    }

    fn small_pool() -> JobConfig {
        JobConfig {
            workers: 1,
            queue_capacity: 1,
            submit_timeout: Duration::from_millis(50),
            job_timeout: Duration::from_secs(5),
            ..JobConfig::default()
        }
    }

    /// Polls its token until cancelled.
    fn until_cancelled() -> JobFn {
        Box::new(|ctx: JobContext| -> JobFuture {
            Box::pin(async move {
                ctx.report_progress(10);
                while !ctx.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(json!({ "stopped": true }))
            })
        })
    }

    async fn wait_until_running(orchestrator: &JobOrchestrator, job_id: &str) {
        for _ in 0..200 {
            if orchestrator.get_job(job_id).await.unwrap().status == JobStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never started", job_id);
    }

    #[tokio::test]
    async fn test_job_completes_with_result() {
        let (orchestrator, _clock, store) = start_orchestrator(JobConfig::default());
        let job = orchestrator
            .spawn_job(
                JobType::Custom("sum".to_string()),
                Box::new(|ctx: JobContext| -> JobFuture {
                    Box::pin(async move {
                        ctx.report_progress(150);
                        Ok(json!({ "sum": 3 }))
                    })
                }),
            )
            .await
            .unwrap();

        let done = orchestrator.wait_for(&job.id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result, Some(json!({ "sum": 3 })));
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());

        let stored = store.load_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_failing_job_keeps_error() {
        let (orchestrator, _clock, _store) = start_orchestrator(JobConfig::default());
        let job = orchestrator
            .spawn_job(
                JobType::Import,
                Box::new(|_ctx: JobContext| -> JobFuture {
                    Box::pin(async move { Err(EngineError::transient("ledger", "connection refused")) })
                }),
            )
            .await
            .unwrap();

        let done = orchestrator.wait_for(&job.id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_matches!(done.error, Some(EngineError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (orchestrator, _clock, _store) = start_orchestrator(JobConfig::default());
        let job = orchestrator
            .spawn_job(
                JobType::AutoMatch,
                Box::new(|_ctx: JobContext| -> JobFuture {
                    Box::pin(async move {
                        if true {
                            panic!("ledger returned garbage");
                        }
                        Ok(json!(null))
                    })
                }),
            )
            .await
            .unwrap();

        let done = orchestrator.wait_for(&job.id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_matches!(done.error, Some(EngineError::Fatal { ref message }) if message.contains("ledger returned garbage"));

        // the pool survives
        let next = orchestrator
            .spawn_job(
                JobType::Import,
                Box::new(|_ctx: JobContext| -> JobFuture { Box::pin(async move { Ok(json!(1)) }) }),
            )
            .await
            .unwrap();
        let next = orchestrator.wait_for(&next.id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(next.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let (orchestrator, _clock, _store) = start_orchestrator(JobConfig::default());
        let job = orchestrator.spawn_job(JobType::Import, until_cancelled()).await.unwrap();
        wait_until_running(&orchestrator, &job.id).await;

        let requested = orchestrator.cancel_job(&job.id).await.unwrap();
        assert_eq!(requested.status, JobStatus::Running);

        let done = orchestrator.wait_for(&job.id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(done.status, JobStatus::Canceled);
        assert!(done.completed_at.is_some());
        assert_eq!(done.progress, 10);

        assert_matches!(
            orchestrator.cancel_job(&job.id).await,
            Err(EngineError::Terminal { .. })
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_job_is_immediate() {
        let (orchestrator, _clock, _store) = start_orchestrator(JobConfig::default());
        let job = orchestrator.create_job(JobType::Import).await.unwrap();

        let canceled = orchestrator.cancel_job(&job.id).await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert!(canceled.completed_at.is_some());

        assert_matches!(
            orchestrator.submit_job(&job.id, until_cancelled()).await,
            Err(EngineError::InvalidTransition { .. })
        );
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (orchestrator, _clock, _store) = start_orchestrator(small_pool());

        let running = orchestrator.spawn_job(JobType::Import, until_cancelled()).await.unwrap();
        wait_until_running(&orchestrator, &running.id).await;
        let queued = orchestrator.spawn_job(JobType::Import, until_cancelled()).await.unwrap();

        let overflow = orchestrator.create_job(JobType::Import).await.unwrap();
        let err = orchestrator.submit_job(&overflow.id, until_cancelled()).await.unwrap_err();
        assert!(err.is_transient());

        orchestrator.cancel_job(&queued.id).await.unwrap();
        orchestrator.cancel_job(&running.id).await.unwrap();
        orchestrator.wait_for(&running.id, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_job_timeout_marks_failed() {
        let config = JobConfig {
            job_timeout: Duration::from_millis(50),
            ..JobConfig::default()
        };
        let (orchestrator, _clock, _store) = start_orchestrator(config);
        let job = orchestrator.spawn_job(JobType::Import, until_cancelled()).await.unwrap();

        let done = orchestrator.wait_for(&job.id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_matches!(done.error, Some(EngineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_only_purges_old_terminal_jobs() {
        let (orchestrator, clock, store) = start_orchestrator(JobConfig::default());
        let finished = orchestrator
            .spawn_job(
                JobType::Import,
                Box::new(|_ctx: JobContext| -> JobFuture { Box::pin(async move { Ok(json!(1)) }) }),
            )
            .await
            .unwrap();
        orchestrator.wait_for(&finished.id, Duration::from_secs(2)).await.unwrap();
        let pending = orchestrator.create_job(JobType::AutoMatch).await.unwrap();

        clock.advance(chrono::Duration::hours(2));
        let purged = orchestrator.cleanup_old_jobs(Duration::from_secs(3600)).await.unwrap();

        assert_eq!(purged, 1);
        assert_matches!(orchestrator.get_job(&finished.id).await, Err(EngineError::NotFound { .. }));
        assert!(store.load_job(&finished.id).await.unwrap().is_none());
        assert_eq!(orchestrator.get_job(&pending.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_jobs() {
        let (orchestrator, _clock, _store) = start_orchestrator(JobConfig::default());
        let pending = orchestrator.create_job(JobType::Import).await.unwrap();

        orchestrator.shutdown().await;

        assert_eq!(orchestrator.get_job(&pending.id).await.unwrap().status, JobStatus::Canceled);
        let late = orchestrator.create_job(JobType::Import).await.unwrap();
        assert!(orchestrator.submit_job(&late.id, until_cancelled()).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_list_jobs_in_creation_order() {
        let (orchestrator, clock, _store) = start_orchestrator(JobConfig::default());
        let first = orchestrator.create_job(JobType::Import).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let second = orchestrator.create_job(JobType::AutoMatch).await.unwrap();

        let ids: Vec<String> = orchestrator.list_jobs().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
