use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{JobKind, JobState};

mod memory;
mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

/// Logical identity of a lifecycle job: one per (program, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub program_id: Uuid,
    pub kind: JobKind,
}

impl JobKey {
    pub fn new(program_id: Uuid, kind: JobKind) -> Self {
        Self { program_id, kind }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.program_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub program_id: Uuid,
    pub name: String,
    pub kind: JobKind,
}

impl JobPayload {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.program_id, self.kind)
    }
}

/// A stored job. `id` changes every time the key is re-armed, so a worker
/// holding a superseded copy cannot complete or retry its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub run_at: DateTime<Utc>,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ScheduledJob {
    pub fn new(run_at: DateTime<Utc>, payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_at,
            payload,
            state: JobState::Pending,
            attempts: 0,
            locked_until: None,
            last_error: None,
        }
    }

    pub fn key(&self) -> JobKey {
        self.payload.key()
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => self.run_at <= now,
            JobState::Running => self.locked_until.is_some_and(|until| until <= now),
            JobState::Dead => false,
        }
    }
}

/// Deferred task queue with replace-by-key semantics and at-least-once
/// delivery through leased claims.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Cancels whatever is stored under the payload's key, then arms a new job.
    async fn schedule(&self, run_at: DateTime<Utc>, payload: JobPayload) -> Result<ScheduledJob>;
    async fn cancel(&self, key: JobKey) -> Result<bool>;
    async fn get(&self, key: JobKey) -> Result<Option<ScheduledJob>>;
    async fn list(&self, program_id: Option<Uuid>) -> Result<Vec<ScheduledJob>>;
    /// Leases up to `limit` due jobs to the caller until `now + lease`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>>;
    async fn complete(&self, job: &ScheduledJob) -> Result<bool>;
    async fn retry(&self, job: &ScheduledJob, run_at: DateTime<Utc>, error: &str) -> Result<bool>;
    async fn bury(&self, job: &ScheduledJob, error: &str) -> Result<bool>;
}
