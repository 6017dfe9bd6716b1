//! Job worker and runner for processing queued Upload attempts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use rollcall_core::{defaults, Job, QueueStats, Result};
use rollcall_db::Database;

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::scheduler::RetryScheduler;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Whether to enable job processing.
    pub enabled: bool,
    /// Upper bound on a single job before it is treated as a transient failure.
    pub job_timeout_secs: u64,
    /// Claims older than this are released and the Upload re-queued.
    pub stale_claim_secs: u64,
    /// How often stale claims and finished jobs are cleaned up.
    pub cleanup_interval_secs: u64,
    /// Finished jobs kept by cleanup.
    pub retention_count: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            enabled: true,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            stale_claim_secs: defaults::JOB_STALE_CLAIM_SECS,
            cleanup_interval_secs: defaults::JOB_CLEANUP_INTERVAL_SECS,
            retention_count: defaults::JOB_RETENTION_COUNT,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job time limit |
    /// | `JOB_STALE_CLAIM_SECS` | `600` | Age at which a claim is considered abandoned |
    /// | `JOB_CLEANUP_INTERVAL_SECS` | `300` | Housekeeping interval |
    /// | `JOB_RETENTION_COUNT` | `10000` | Finished jobs kept |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = env_or("JOB_MAX_CONCURRENT", defaults::JOB_MAX_CONCURRENT).max(1);

        Self {
            poll_interval_ms: env_or("JOB_POLL_INTERVAL_MS", defaults::JOB_POLL_INTERVAL_MS),
            max_concurrent_jobs,
            enabled,
            job_timeout_secs: env_or("JOB_TIMEOUT_SECS", defaults::JOB_TIMEOUT_SECS),
            stale_claim_secs: env_or("JOB_STALE_CLAIM_SECS", defaults::JOB_STALE_CLAIM_SECS),
            cleanup_interval_secs: env_or(
                "JOB_CLEANUP_INTERVAL_SECS",
                defaults::JOB_CLEANUP_INTERVAL_SECS,
            ),
            retention_count: env_or("JOB_RETENTION_COUNT", defaults::JOB_RETENTION_COUNT),
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_stale_claim(mut self, secs: u64) -> Self {
        self.stale_claim_secs = secs;
        self
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A job was started.
    JobStarted { job_id: Uuid, upload_id: Uuid },
    /// A job reached a persisted outcome.
    JobCompleted { job_id: Uuid, upload_id: Uuid },
    /// A job found nothing to do.
    JobDiscarded {
        job_id: Uuid,
        upload_id: Uuid,
        reason: String,
    },
    /// A job failed.
    JobFailed {
        job_id: Uuid,
        upload_id: Uuid,
        error: String,
    },
    /// Abandoned claims were released and their Uploads re-queued.
    ClaimsReleased { count: usize },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully. In-flight jobs finish first.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| rollcall_core::Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job worker that processes jobs from the queue.
///
/// At most `max_concurrent_jobs` jobs run at once. Freed slots are refilled
/// as soon as a job finishes, so one slow Upload never holds up others.
pub struct JobWorker {
    db: Database,
    config: WorkerConfig,
    handler: Arc<dyn JobHandler>,
    scheduler: RetryScheduler,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        db: Database,
        config: WorkerConfig,
        handler: Arc<dyn JobHandler>,
        scheduler: RetryScheduler,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            db,
            config,
            handler,
            scheduler,
            event_tx,
        }
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        tokio::spawn(async move {
            worker.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "jobs", component = "worker"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval_secs);
        let max_concurrent = self.config.max_concurrent_jobs.max(1);
        let mut tasks = JoinSet::new();
        let mut last_cleanup: Option<Instant> = None;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            if last_cleanup.map_or(true, |at| at.elapsed() >= cleanup_interval) {
                self.housekeeping().await;
                last_cleanup = Some(Instant::now());
            }

            while tasks.len() < max_concurrent {
                match self.claim_job().await {
                    Some(job) => {
                        let worker = self.clone_refs();
                        tasks.spawn(async move { worker.execute_job(job).await });
                    }
                    None => break,
                }
            }

            if tasks.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            } else {
                // Wake on a finished job, or after one poll interval so
                // retries that became due are picked up while others run.
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    Some(result) = tasks.join_next() => {
                        if let Err(e) = result {
                            error!(error = ?e, "Job task panicked");
                        }
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight jobs");
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Job task panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    /// Claim and run the next due job inline. Returns `None` when nothing
    /// is due.
    pub async fn process_next(&self) -> Option<JobResult> {
        let job = self.claim_job().await?;
        Some(self.clone_refs().execute_job(job).await)
    }

    /// Release abandoned claims, re-queue Uploads left without a job and
    /// prune old jobs.
    pub async fn housekeeping(&self) {
        let cutoff = self.scheduler.now()
            - chrono::Duration::seconds(self.config.stale_claim_secs as i64);
        match self.db.uploads.release_stale_claims(cutoff).await {
            Ok(released) if !released.is_empty() => {
                self.requeue(&released).await;
                warn!(count = released.len(), "Released stale upload claims");
                let _ = self.event_tx.send(WorkerEvent::ClaimsReleased {
                    count: released.len(),
                });
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to release stale claims"),
        }

        match self.db.uploads.find_unqueued(cutoff).await {
            Ok(orphaned) if !orphaned.is_empty() => {
                self.requeue(&orphaned).await;
                warn!(count = orphaned.len(), "Re-queued uploads that had no job");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to look up unqueued uploads"),
        }

        match self.db.jobs.cleanup(self.config.retention_count).await {
            Ok(removed) if removed > 0 => debug!(removed, "Pruned finished jobs"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to prune finished jobs"),
        }

        if let Some(pool) = self.db.pool() {
            rollcall_db::log_pool_metrics(pool);
        }
    }

    async fn requeue(&self, upload_ids: &[Uuid]) {
        for upload_id in upload_ids {
            let attempt = match self.db.uploads.get(*upload_id).await {
                Ok(Some(upload)) => upload.attempt_count + 1,
                Ok(None) => continue,
                Err(e) => {
                    error!(upload_id = %upload_id, error = %e, "Failed to load upload for re-queue");
                    continue;
                }
            };
            if let Err(e) = self.scheduler.schedule(*upload_id, attempt, Duration::ZERO).await {
                error!(upload_id = %upload_id, error = %e, "Failed to re-queue upload");
            }
        }
    }

    /// Claim the next due job without processing it.
    async fn claim_job(&self) -> Option<Job> {
        match self.db.jobs.claim_next(self.scheduler.now()).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = ?e, "Failed to claim job");
                None
            }
        }
    }

    /// Clone references needed for spawned job tasks.
    fn clone_refs(&self) -> JobWorkerRef {
        JobWorkerRef {
            db: self.db.clone(),
            handler: self.handler.clone(),
            event_tx: self.event_tx.clone(),
            job_timeout: Duration::from_secs(self.config.job_timeout_secs),
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.db.jobs.queue_stats().await
    }
}

/// Lightweight reference bundle for executing a single job in a spawned task.
struct JobWorkerRef {
    db: Database,
    handler: Arc<dyn JobHandler>,
    event_tx: broadcast::Sender<WorkerEvent>,
    job_timeout: Duration,
}

impl JobWorkerRef {
    /// Execute a single claimed job.
    async fn execute_job(self, job: Job) -> JobResult {
        let start = Instant::now();
        let job_id = job.id;
        let upload_id = job.upload_id;

        debug!(%job_id, %upload_id, attempt = job.attempt, "Processing job");
        let _ = self
            .event_tx
            .send(WorkerEvent::JobStarted { job_id, upload_id });

        let result = match tokio::time::timeout(
            self.job_timeout,
            self.handler.execute(JobContext::new(job.clone())),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    %job_id,
                    %upload_id,
                    "Job exceeded timeout of {}s",
                    self.job_timeout.as_secs()
                );
                self.handler.on_timeout(&job, self.job_timeout).await
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            JobResult::Completed => {
                if let Err(e) = self.db.jobs.complete(job_id).await {
                    error!(error = ?e, %job_id, "Failed to mark job as completed");
                } else {
                    debug!(%job_id, %upload_id, duration_ms, "Job completed");
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::JobCompleted { job_id, upload_id });
                }
            }
            JobResult::Discarded(reason) => {
                if let Err(e) = self.db.jobs.complete(job_id).await {
                    error!(error = ?e, %job_id, "Failed to mark job as completed");
                } else {
                    debug!(%job_id, %upload_id, %reason, "Job discarded");
                    let _ = self.event_tx.send(WorkerEvent::JobDiscarded {
                        job_id,
                        upload_id,
                        reason: reason.clone(),
                    });
                }
            }
            JobResult::Failed(error) => {
                if let Err(e) = self.db.jobs.fail(job_id, error).await {
                    error!(error = ?e, %job_id, "Failed to mark job as failed");
                } else {
                    warn!(%job_id, %upload_id, %error, duration_ms, "Job failed");
                    let _ = self.event_tx.send(WorkerEvent::JobFailed {
                        job_id,
                        upload_id,
                        error: error.clone(),
                    });
                }
            }
        }
        result
    }
}

/// Builder for creating a job worker.
pub struct WorkerBuilder {
    db: Database,
    config: WorkerConfig,
    handler: Option<Arc<dyn JobHandler>>,
    scheduler: Option<RetryScheduler>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            config: WorkerConfig::default(),
            handler: None,
            scheduler: None,
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the handler every job is dispatched to.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Use a specific scheduler (and therefore clock).
    pub fn with_scheduler(mut self, scheduler: RetryScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Build and return the worker. Without a handler every job completes
    /// as a no-op.
    pub fn build(self) -> JobWorker {
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| RetryScheduler::system(self.db.jobs.clone()));
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(crate::handler::NoOpHandler));
        JobWorker::new(self.db, self.config, handler, scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoOpHandler;
    use crate::scheduler::ManualClock;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rollcall_core::{Clock, CreateUploadRequest, JobStatus, UploadKey};

    fn upload_request(image_ref: &str) -> CreateUploadRequest {
        CreateUploadRequest {
            key: UploadKey {
                school_id: 1,
                class_id: 1,
                date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            },
            image_ref: image_ref.into(),
            created_by: 1,
        }
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert!(config.enabled);
        assert_eq!(config.stale_claim_secs, 600);
    }

    #[test]
    fn test_worker_config_chaining() {
        let config = WorkerConfig::default()
            .with_poll_interval(2000)
            .with_max_concurrent(12)
            .with_enabled(false)
            .with_job_timeout(30)
            .with_stale_claim(60);

        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.max_concurrent_jobs, 12);
        assert!(!config.enabled);
        assert_eq!(config.job_timeout_secs, 30);
        assert_eq!(config.stale_claim_secs, 60);
    }

    #[tokio::test]
    async fn test_process_next_on_empty_queue() {
        let (db, _store) = Database::in_memory();
        let worker = WorkerBuilder::new(db).with_handler(NoOpHandler).build();
        assert!(worker.process_next().await.is_none());
    }

    #[tokio::test]
    async fn test_process_next_completes_job() {
        let (db, store) = Database::in_memory();
        let upload_id = Uuid::new_v4();
        let job_id = db.jobs.queue(upload_id, 1, chrono::Utc::now()).await.unwrap();
        let worker = WorkerBuilder::new(db.clone()).with_handler(NoOpHandler).build();
        let mut events = worker.events();

        assert_eq!(worker.process_next().await, Some(JobResult::Completed));
        let jobs = store.jobs_for_upload(upload_id).await;
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert!(matches!(
            events.recv().await.unwrap(),
            WorkerEvent::JobStarted { job_id: id, .. } if id == job_id
        ));
        assert_eq!(worker.queue_stats().await.unwrap().completed, 1);
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn execute(&self, _ctx: JobContext) -> JobResult {
            sleep(Duration::from_secs(3600)).await;
            JobResult::Completed
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_routes_to_hook() {
        let (db, _store) = Database::in_memory();
        db.jobs.queue(Uuid::new_v4(), 1, chrono::Utc::now()).await.unwrap();
        let worker = WorkerBuilder::new(db.clone())
            .with_config(WorkerConfig::default().with_job_timeout(5))
            .with_handler(SlowHandler)
            .build();

        let result = worker.process_next().await.unwrap();
        assert_eq!(result, JobResult::Failed("job exceeded timeout of 5s".into()));
        assert_eq!(worker.queue_stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_housekeeping_requeues_stale_claims() {
        let (db, store) = Database::in_memory();
        let clock = ManualClock::default();
        let scheduler = RetryScheduler::new(db.jobs.clone(), Arc::new(clock.clone()));
        let created = db
            .uploads
            .create_superseding(upload_request("blake3:stale"))
            .await
            .unwrap();
        let id = created.upload.id;
        assert!(db
            .uploads
            .try_claim(id, Uuid::new_v4(), clock.now() - chrono::Duration::hours(1))
            .await
            .unwrap());

        let worker = WorkerBuilder::new(db.clone())
            .with_config(WorkerConfig::default().with_stale_claim(600))
            .with_scheduler(scheduler)
            .build();
        worker.housekeeping().await;

        let upload = db.uploads.get(id).await.unwrap().unwrap();
        assert!(upload.claimed_by.is_none());
        let jobs = store.jobs_for_upload(id).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_housekeeping_requeues_upload_without_job() {
        let (db, store) = Database::in_memory();
        let clock = ManualClock::new(chrono::Utc::now() + chrono::Duration::hours(1));
        let scheduler = RetryScheduler::new(db.jobs.clone(), Arc::new(clock.clone()));
        let id = db
            .uploads
            .create_superseding(upload_request("blake3:orphan"))
            .await
            .unwrap()
            .upload
            .id;
        assert!(store.jobs_for_upload(id).await.is_empty());

        let worker = WorkerBuilder::new(db.clone())
            .with_config(WorkerConfig::default().with_stale_claim(600))
            .with_scheduler(scheduler)
            .build();
        worker.housekeeping().await;

        let jobs = store.jobs_for_upload(id).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].attempt, 1);

        // A second pass sees the pending job and leaves the Upload alone.
        worker.housekeeping().await;
        assert_eq!(store.jobs_for_upload(id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_housekeeping_leaves_recent_unqueued_upload() {
        let (db, store) = Database::in_memory();
        let clock = ManualClock::default();
        let scheduler = RetryScheduler::new(db.jobs.clone(), Arc::new(clock.clone()));
        let id = db
            .uploads
            .create_superseding(upload_request("blake3:fresh"))
            .await
            .unwrap()
            .upload
            .id;

        let worker = WorkerBuilder::new(db.clone())
            .with_config(WorkerConfig::default().with_stale_claim(600))
            .with_scheduler(scheduler)
            .build();
        worker.housekeeping().await;

        assert!(store.jobs_for_upload(id).await.is_empty());
    }

    #[tokio::test]
    async fn test_worker_start_and_shutdown() {
        let (db, _store) = Database::in_memory();
        let worker = WorkerBuilder::new(db)
            .with_config(WorkerConfig::default().with_poll_interval(10))
            .build();
        let handle = worker.start();
        let mut events = handle.events();

        handle.shutdown().await.unwrap();
        let mut saw_stop = false;
        while let Ok(event) = tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            if matches!(event, Ok(WorkerEvent::WorkerStopped)) {
                saw_stop = true;
                break;
            }
        }
        assert!(saw_stop);
    }
}
