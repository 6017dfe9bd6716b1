//! Job handler abstraction.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use rollcall_core::Job;

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    /// The Upload this job processes.
    pub fn upload_id(&self) -> Uuid {
        self.job.upload_id
    }

    /// Upload attempt number this job runs.
    pub fn attempt(&self) -> i32 {
        self.job.attempt
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// The handler ran to a persisted outcome. A retry, if one was needed,
    /// is already queued as a new job.
    Completed,
    /// Nothing was written: the Upload was superseded, claimed elsewhere or
    /// already finished.
    Discarded(String),
    /// The handler could not persist an outcome.
    Failed(String),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Called when `execute` exceeded the worker's job timeout and was
    /// dropped. Handlers holding external claims should release them here.
    async fn on_timeout(&self, job: &Job, limit: Duration) -> JobResult {
        let _ = job;
        JobResult::Failed(format!("job exceeded timeout of {}s", limit.as_secs()))
    }
}

/// No-op handler for testing the worker loop.
pub struct NoOpHandler;

#[async_trait]
impl JobHandler for NoOpHandler {
    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollcall_core::JobStatus;

    fn job() -> Job {
        Job {
            id: Uuid::new_v4(),
            upload_id: Uuid::new_v4(),
            status: JobStatus::Running,
            attempt: 2,
            run_after: Utc::now(),
            error_message: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    #[test]
    fn test_job_context_accessors() {
        let job = job();
        let ctx = JobContext::new(job.clone());
        assert_eq!(ctx.upload_id(), job.upload_id);
        assert_eq!(ctx.attempt(), 2);
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let handler = NoOpHandler;
        assert_eq!(handler.execute(JobContext::new(job())).await, JobResult::Completed);
    }

    #[tokio::test]
    async fn test_default_timeout_hook_fails() {
        let result = NoOpHandler.on_timeout(&job(), Duration::from_secs(5)).await;
        assert_eq!(result, JobResult::Failed("job exceeded timeout of 5s".into()));
    }
}
