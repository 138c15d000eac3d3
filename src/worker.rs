use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::context::Context;
use crate::error::Result;
use crate::models::JobKind;
use crate::queue::{JobPayload, ScheduledJob, TaskQueue};

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &JobPayload) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub buried: usize,
}

pub fn backoff(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    let delay = Duration::seconds(30 * 2i64.pow(exponent));
    delay.min(Duration::minutes(30))
}

/// Polls the task queue and dispatches due jobs to registered handlers.
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    max_attempts: i32,
    lease: Duration,
    batch: usize,
}

impl Worker {
    pub fn new(ctx: &Context) -> Self {
        Self {
            queue: ctx.queue.clone(),
            clock: ctx.clock.clone(),
            handlers: HashMap::new(),
            max_attempts: ctx.settings.job_max_attempts,
            lease: Duration::seconds(ctx.settings.job_lease_secs),
            batch: 16,
        }
    }

    pub fn handle(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    async fn settle(&self, job: &ScheduledJob, outcome: Result<()>, report: &mut TickReport) -> Result<()> {
        let key = job.key();
        match outcome {
            Ok(()) => {
                if !self.queue.complete(job).await? {
                    debug!(%key, "job was superseded while running");
                }
                report.succeeded += 1;
            }
            Err(err) if err.is_retryable() && job.attempts < self.max_attempts => {
                let run_at = self.clock.now() + backoff(job.attempts);
                warn!(%key, attempts = job.attempts, %run_at, error = %err, "job failed, retrying");
                self.queue.retry(job, run_at, &err.to_string()).await?;
                report.retried += 1;
            }
            Err(err) => {
                error!(%key, attempts = job.attempts, error = %err, "job failed permanently");
                self.queue.bury(job, &err.to_string()).await?;
                report.buried += 1;
            }
        }
        Ok(())
    }

    pub async fn run_once(&self) -> Result<TickReport> {
        let jobs = self
            .queue
            .claim_due(self.clock.now(), self.lease, self.batch)
            .await?;
        let mut report = TickReport {
            claimed: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            let outcome = match self.handlers.get(&job.payload.kind) {
                Some(handler) => {
                    info!(key = %job.key(), attempt = job.attempts, "running job");
                    handler.handle(&job.payload).await
                }
                None => Err(crate::error::LedgerError::Queue(format!(
                    "no handler registered for {}",
                    job.payload.kind
                ))),
            };
            self.settle(&job, outcome, &mut report).await?;
        }
        Ok(report)
    }

    /// Runs until ctrl-c, draining due jobs every `poll`.
    pub async fn run(&self, poll: std::time::Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.claimed > 0 => info!(?report, "worker tick"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "worker tick failed"),
                    }
                }
            }
        }
    }
}
