use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::at_local;
use crate::context::Context;
use crate::enrollment::load_program;
use crate::error::{LedgerError, PartialFailure, Result};
use crate::ledger::{self, Finalized};
use crate::models::{JobKind, Program, ProgramState, ScheduledItem};
use crate::queue::{JobKey, JobPayload, ScheduledJob};
use crate::worker::{JobHandler, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePlan {
    pub close_at: DateTime<Utc>,
    pub complete_at: Option<DateTime<Utc>>,
}

/// `close_at` is the last second of the enrollment deadline; `complete_at`
/// the latest window end across every item, plus the configured grace.
pub fn plan(ctx: &Context, program: &Program, items: &[ScheduledItem]) -> LifecyclePlan {
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    let close_at = at_local(program.enroll_deadline, end_of_day, ctx.tz());
    let complete_at = items
        .iter()
        .flat_map(|item| item.windows.iter())
        .map(|w| at_local(w.date, w.end, ctx.tz()))
        .max()
        .map(|at| at + Duration::minutes(ctx.settings.completion_grace_minutes));
    LifecyclePlan {
        close_at,
        complete_at,
    }
}

fn payload(program: &Program, kind: JobKind) -> JobPayload {
    JobPayload {
        program_id: program.id,
        name: program.name.clone(),
        kind,
    }
}

async fn cancel(ctx: &Context, program_id: Uuid, kinds: &[JobKind]) -> Result<usize> {
    let mut cancelled = 0;
    for kind in kinds {
        let key = JobKey::new(program_id, *kind);
        if ctx.bounded("job cancel", ctx.queue.cancel(key)).await? {
            debug!(%key, "job cancelled");
            cancelled += 1;
        }
    }
    Ok(cancelled)
}

pub async fn cancel_jobs(ctx: &Context, program_id: Uuid) -> Result<usize> {
    cancel(
        ctx,
        program_id,
        &[JobKind::CloseEnrollment, JobKind::CompleteProgram],
    )
    .await
}

/// Re-arms both lifecycle jobs for an open program, replacing whatever was
/// scheduled under the same keys. Programs in any other state lose their jobs.
pub async fn reschedule(ctx: &Context, program_id: Uuid) -> Result<Vec<ScheduledJob>> {
    let program = load_program(ctx, program_id).await?;
    if program.state != ProgramState::Open {
        let cancelled = cancel_jobs(ctx, program_id).await?;
        debug!(%program_id, state = %program.state, cancelled, "program not open, nothing scheduled");
        return Ok(Vec::new());
    }
    let items = ctx
        .bounded("items lookup", ctx.store.items_for_program(program_id))
        .await?;
    let plan = plan(ctx, &program, &items);

    let mut jobs = Vec::new();
    jobs.push(
        ctx.bounded(
            "job schedule",
            ctx.queue
                .schedule(plan.close_at, payload(&program, JobKind::CloseEnrollment)),
        )
        .await?,
    );
    match plan.complete_at {
        Some(complete_at) => jobs.push(
            ctx.bounded(
                "job schedule",
                ctx.queue
                    .schedule(complete_at, payload(&program, JobKind::CompleteProgram)),
            )
            .await?,
        ),
        None => {
            cancel(ctx, program_id, &[JobKind::CompleteProgram]).await?;
        }
    }

    info!(
        %program_id,
        close_at = %plan.close_at,
        complete_at = ?plan.complete_at,
        "lifecycle jobs scheduled"
    );
    Ok(jobs)
}

#[derive(Debug, Default)]
pub struct FinalizationReport {
    pub processed: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failures: Vec<PartialFailure>,
}

impl FinalizationReport {
    pub fn succeeded(&self) -> usize {
        self.processed - self.failures.len()
    }
}

/// Settles every enrollment's ledger entry. One enrollment failing, timing
/// out or lacking its entry is recorded and skipped.
pub async fn finalize_program(ctx: &Context, program_id: Uuid) -> Result<FinalizationReport> {
    let items: HashMap<Uuid, ScheduledItem> = ctx
        .bounded("items lookup", ctx.store.items_for_program(program_id))
        .await?
        .into_iter()
        .map(|item| (item.id, item))
        .collect();
    let enrollments = ctx
        .bounded(
            "enrollments lookup",
            ctx.store.enrollments_for_program(program_id),
        )
        .await?;

    let mut report = FinalizationReport::default();
    for enrollment in &enrollments {
        report.processed += 1;
        let outcome = match items.get(&enrollment.item_id) {
            Some(item) => {
                tokio::time::timeout(
                    ctx.settings.store_timeout(),
                    ledger::finalize_enrollment(ctx, item, enrollment),
                )
                .await
                .unwrap_or(Err(LedgerError::Timeout("enrollment finalization")))
            }
            None => Err(LedgerError::not_found("item", enrollment.item_id)),
        };
        let outcome = match outcome {
            Ok(Finalized::Missing) => Err(LedgerError::not_found("ledger entry", enrollment.id)),
            other => other,
        };
        match outcome {
            Ok(Finalized::Updated) => report.updated += 1,
            Ok(_) => report.unchanged += 1,
            Err(err) => {
                warn!(
                    %program_id,
                    enrollment_id = %enrollment.id,
                    error = %err,
                    "finalization skipped"
                );
                report
                    .failures
                    .push(PartialFailure::new(enrollment.id, "finalize", &err));
            }
        }
    }

    info!(
        %program_id,
        processed = report.processed,
        updated = report.updated,
        failed = report.failures.len(),
        "finalization pass finished"
    );
    Ok(report)
}

#[derive(Debug)]
pub struct StateChange {
    pub program: Program,
    pub jobs: Vec<ScheduledJob>,
    pub finalization: Option<FinalizationReport>,
}

async fn transition(ctx: &Context, program: &Program, state: ProgramState) -> Result<Program> {
    if !ctx
        .bounded("program update", ctx.store.set_program_state(program.id, state))
        .await?
    {
        return Err(LedgerError::not_found("program", program.id));
    }
    info!(program_id = %program.id, from = %program.state, to = %state, "program state changed");
    ctx.emit(program.id, state);
    Ok(Program {
        state,
        ..program.clone()
    })
}

/// Manual state change. Entering `open` arms the lifecycle jobs; any other
/// manual move cancels the jobs it makes obsolete, and `complete` runs the
/// finalization pass immediately.
pub async fn set_state(ctx: &Context, program_id: Uuid, state: ProgramState) -> Result<StateChange> {
    let program = load_program(ctx, program_id).await?;
    let program = transition(ctx, &program, state).await?;

    let mut change = StateChange {
        program,
        jobs: Vec::new(),
        finalization: None,
    };
    match state {
        ProgramState::Open => change.jobs = reschedule(ctx, program_id).await?,
        ProgramState::Close => {
            cancel(ctx, program_id, &[JobKind::CloseEnrollment]).await?;
        }
        ProgramState::Complete => {
            cancel_jobs(ctx, program_id).await?;
            change.finalization = Some(finalize_program(ctx, program_id).await?);
        }
        ProgramState::Planning | ProgramState::Cancel => {
            cancel_jobs(ctx, program_id).await?;
        }
    }
    Ok(change)
}

/// Reschedules when the program is open; other states are left as they are.
pub(crate) async fn schedule_changed(ctx: &Context, program_id: Uuid) -> Result<Vec<ScheduledJob>> {
    let program = load_program(ctx, program_id).await?;
    if program.state == ProgramState::Open {
        reschedule(ctx, program_id).await
    } else {
        Ok(Vec::new())
    }
}

pub struct CloseEnrollmentHandler {
    ctx: Context,
}

#[async_trait]
impl JobHandler for CloseEnrollmentHandler {
    async fn handle(&self, payload: &JobPayload) -> Result<()> {
        let ctx = &self.ctx;
        let Some(program) = ctx
            .bounded("program lookup", ctx.store.program(payload.program_id))
            .await?
        else {
            debug!(program_id = %payload.program_id, "program gone, close job has nothing to do");
            return Ok(());
        };
        if program.state == ProgramState::Open {
            transition(ctx, &program, ProgramState::Close).await?;
        } else {
            debug!(program_id = %program.id, state = %program.state, "close job skipped");
        }
        Ok(())
    }
}

pub struct CompleteProgramHandler {
    ctx: Context,
}

#[async_trait]
impl JobHandler for CompleteProgramHandler {
    async fn handle(&self, payload: &JobPayload) -> Result<()> {
        let ctx = &self.ctx;
        let Some(mut program) = ctx
            .bounded("program lookup", ctx.store.program(payload.program_id))
            .await?
        else {
            debug!(program_id = %payload.program_id, "program gone, complete job has nothing to do");
            return Ok(());
        };
        if matches!(program.state, ProgramState::Open | ProgramState::Close) {
            program = transition(ctx, &program, ProgramState::Complete).await?;
            cancel(ctx, program.id, &[JobKind::CloseEnrollment]).await?;
        }
        if program.state != ProgramState::Complete {
            debug!(program_id = %program.id, state = %program.state, "complete job skipped");
            return Ok(());
        }
        let report = finalize_program(ctx, program.id).await?;
        for failure in &report.failures {
            warn!(program_id = %program.id, %failure, "enrollment not finalized");
        }
        Ok(())
    }
}

pub fn register_handlers(worker: &mut Worker, ctx: &Context) {
    worker
        .handle(
            JobKind::CloseEnrollment,
            Arc::new(CloseEnrollmentHandler { ctx: ctx.clone() }),
        )
        .handle(
            JobKind::CompleteProgram,
            Arc::new(CompleteProgramHandler { ctx: ctx.clone() }),
        );
}
