//! Retry scheduling.
//!
//! Backoff timing lives here rather than in the worker loop: a retry is a
//! new queued job whose `run_after` is computed from an injected [`Clock`].
//! Tests drive time with [`ManualClock`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use rollcall_core::{Clock, Error, JobRepository, Result, SystemClock};

/// Queues processing jobs at a point in time relative to the clock.
#[derive(Clone)]
pub struct RetryScheduler {
    jobs: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    pub fn new(jobs: Arc<dyn JobRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { jobs, clock }
    }

    /// Scheduler on wall-clock time.
    pub fn system(jobs: Arc<dyn JobRepository>) -> Self {
        Self::new(jobs, Arc::new(SystemClock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Queue a job for `upload_id` that becomes claimable after `delay`.
    pub async fn schedule(&self, upload_id: Uuid, attempt: i32, delay: Duration) -> Result<Uuid> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| Error::Internal(format!("retry delay out of range: {}", e)))?;
        let run_after = self.clock.now() + delay;
        let job_id = self.jobs.queue(upload_id, attempt, run_after).await?;
        debug!(
            subsystem = "jobs",
            component = "scheduler",
            upload_id = %upload_id,
            job_id = %job_id,
            attempt,
            run_after = %run_after,
            "Processing job scheduled"
        );
        Ok(job_id)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
