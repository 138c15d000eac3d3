use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobKey, JobPayload, ScheduledJob, TaskQueue};
use crate::error::Result;
use crate::models::JobState;

#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<BTreeMap<JobKey, ScheduledJob>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn schedule(&self, run_at: DateTime<Utc>, payload: JobPayload) -> Result<ScheduledJob> {
        let job = ScheduledJob::new(run_at, payload);
        let mut jobs = self.jobs.lock().await;
        jobs.remove(&job.key());
        jobs.insert(job.key(), job.clone());
        Ok(job)
    }

    async fn cancel(&self, key: JobKey) -> Result<bool> {
        Ok(self.jobs.lock().await.remove(&key).is_some())
    }

    async fn get(&self, key: JobKey) -> Result<Option<ScheduledJob>> {
        Ok(self.jobs.lock().await.get(&key).cloned())
    }

    async fn list(&self, program_id: Option<Uuid>) -> Result<Vec<ScheduledJob>> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<ScheduledJob> = jobs
            .values()
            .filter(|job| program_id.map_or(true, |id| job.payload.program_id == id))
            .cloned()
            .collect();
        out.sort_by_key(|job| (job.run_at, job.key()));
        Ok(out)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>> {
        let mut jobs = self.jobs.lock().await;
        let mut due: Vec<&mut ScheduledJob> =
            jobs.values_mut().filter(|job| job.is_claimable(now)).collect();
        due.sort_by_key(|job| job.run_at);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.state = JobState::Running;
                job.attempts += 1;
                job.locked_until = Some(now + lease);
                job.clone()
            })
            .collect())
    }

    async fn complete(&self, job: &ScheduledJob) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(&job.key()).is_some_and(|stored| stored.id == job.id) {
            jobs.remove(&job.key());
            return Ok(true);
        }
        Ok(false)
    }

    async fn retry(&self, job: &ScheduledJob, run_at: DateTime<Utc>, error: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        Ok(match jobs.get_mut(&job.key()) {
            Some(stored) if stored.id == job.id => {
                stored.state = JobState::Pending;
                stored.run_at = run_at;
                stored.locked_until = None;
                stored.last_error = Some(error.to_string());
                true
            }
            _ => false,
        })
    }

    async fn bury(&self, job: &ScheduledJob, error: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        Ok(match jobs.get_mut(&job.key()) {
            Some(stored) if stored.id == job.id => {
                stored.state = JobState::Dead;
                stored.locked_until = None;
                stored.last_error = Some(error.to_string());
                true
            }
            _ => false,
        })
    }
}
