use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::clock::{at_local, ManualClock};
use crate::config::Settings;
use crate::context::Context;
use crate::enrollment::{self, Patch};
use crate::error::{LedgerError, Result};
use crate::lifecycle;
use crate::models::{Eligibility, ProgramState, SkillType, Student};
use crate::programs;
use crate::queue::MemoryQueue;
use crate::report;
use crate::store::MemoryStore;
use crate::worker::{TickReport, Worker};

#[derive(Debug)]
pub struct Simulation {
    pub program_id: Uuid,
    pub tick: TickReport,
    pub report: String,
}

fn time(hour: u32, minute: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| LedgerError::Validation(format!("invalid time {hour}:{minute}")))
}

/// Replays on-time, late and corrected attendance for one program in memory,
/// lets the worker complete it and renders the resulting report.
pub async fn run(settings: Settings) -> Result<Simulation> {
    let tz = settings.timezone()?;
    let day = NaiveDate::from_ymd_opt(2025, 3, 15)
        .ok_or_else(|| LedgerError::Validation("invalid simulation date".to_string()))?;
    let local = |hour: u32, minute: u32| -> Result<DateTime<Utc>> { Ok(at_local(day, time(hour, minute)?, tz)) };

    let clock = Arc::new(ManualClock::new(local(8, 0)? - Duration::days(14)));
    let ctx = Context::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryQueue::new()),
        clock.clone(),
        settings,
    )?;

    let program = programs::create_program(&ctx, "Leadership Camp", SkillType::Soft, day - Duration::days(1)).await?;
    let item = programs::add_item(
        &ctx,
        program.id,
        "Main session",
        Some(10),
        Eligibility::default(),
        vec!["2025-03-15 09:00-12:00 4".parse()?],
    )
    .await?;
    lifecycle::set_state(&ctx, program.id, ProgramState::Open).await?;

    let mut enrolled = Vec::new();
    for (code, name, food) in [
        ("65160001", "Avery Lee", "Pad Thai"),
        ("65160002", "Jules Moreno", "Pad Thai"),
        ("65160003", "Kiara Patel", "Green Curry"),
    ] {
        let student = ctx
            .store
            .upsert_student(&Student {
                id: Uuid::new_v4(),
                code: code.to_string(),
                name: name.to_string(),
                major: "SE".to_string(),
                year: 2,
            })
            .await?;
        let registration =
            enrollment::register(&ctx, student.id, item.id, Some(food.to_string())).await?;
        enrolled.push(registration.enrollment.id);
    }

    // on time, late, then a correction that turns an on-time check-in late
    let checkins = [local(8, 35)?, local(9, 45)?, local(9, 10)?];
    for (enrollment_id, checkin) in enrolled.iter().zip(checkins) {
        enrollment::record_attendance(
            &ctx,
            *enrollment_id,
            day,
            Patch::Set(checkin),
            Patch::Set(local(12, 5)?),
        )
        .await?;
    }
    enrollment::record_attendance(&ctx, enrolled[2], day, Patch::Set(local(9, 40)?), Patch::Keep)
        .await?;

    let due = ctx
        .queue
        .list(Some(program.id))
        .await?
        .into_iter()
        .map(|job| job.run_at)
        .max()
        .unwrap_or_else(|| ctx.now());
    clock.set(due.max(ctx.now()));

    let mut worker = Worker::new(&ctx);
    lifecycle::register_handlers(&mut worker, &ctx);
    let tick = worker.run_once().await?;
    info!(?tick, "simulation worker tick");

    Ok(Simulation {
        program_id: program.id,
        tick,
        report: report::program_report(&ctx, program.id).await?,
    })
}
