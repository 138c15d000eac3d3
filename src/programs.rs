use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::enrollment::{load_item, load_program};
use crate::error::{LedgerError, PartialFailure, Result};
use crate::ledger;
use crate::lifecycle;
use crate::models::{
    CheckInOutRecord, DateWindow, Eligibility, Program, ProgramState, ScheduledItem, SkillType,
    SummaryDelta,
};
use crate::queue::ScheduledJob;
use crate::summary::{self, Migration};

pub async fn create_program(
    ctx: &Context,
    name: &str,
    skill: SkillType,
    enroll_deadline: NaiveDate,
) -> Result<Program> {
    let name = name.trim();
    if name.is_empty() {
        return Err(LedgerError::Validation("program name is empty".to_string()));
    }
    let program = Program {
        id: Uuid::new_v4(),
        name: name.to_string(),
        skill,
        state: ProgramState::Planning,
        enroll_deadline,
    };
    ctx.bounded("program insert", ctx.store.upsert_program(&program))
        .await?;
    info!(program_id = %program.id, name = %program.name, "program created");
    Ok(program)
}

fn validate_windows(windows: &[DateWindow]) -> Result<()> {
    if windows.is_empty() {
        return Err(LedgerError::Validation(
            "an item needs at least one window".to_string(),
        ));
    }
    let mut dates = BTreeSet::new();
    for window in windows {
        if window.end <= window.start {
            return Err(LedgerError::Validation(format!(
                "window on {} ends before it starts",
                window.date
            )));
        }
        if !dates.insert(window.date) {
            return Err(LedgerError::Validation(format!(
                "more than one window on {}",
                window.date
            )));
        }
    }
    Ok(())
}

pub async fn add_item(
    ctx: &Context,
    program_id: Uuid,
    name: &str,
    capacity: Option<i64>,
    eligibility: Eligibility,
    mut windows: Vec<DateWindow>,
) -> Result<ScheduledItem> {
    load_program(ctx, program_id).await?;
    validate_windows(&windows)?;
    if capacity.is_some_and(|c| c < 1) {
        return Err(LedgerError::Validation("capacity must be positive".to_string()));
    }
    windows.sort_by_key(|w| (w.date, w.start));
    let item = ScheduledItem {
        id: Uuid::new_v4(),
        program_id,
        name: name.trim().to_string(),
        capacity,
        eligibility,
        windows,
    };
    ctx.bounded("item insert", ctx.store.upsert_item(&item))
        .await?;
    lifecycle::schedule_changed(ctx, program_id).await?;
    info!(item_id = %item.id, %program_id, "item added");
    Ok(item)
}

#[derive(Debug, Default)]
pub struct ScheduleEdit {
    pub added: Vec<NaiveDate>,
    pub removed: Vec<NaiveDate>,
    pub rebucketed: usize,
    pub pruned_rows: u64,
    pub jobs: Vec<ScheduledJob>,
    pub failures: Vec<PartialFailure>,
}

fn add_to(per_day: &mut BTreeMap<NaiveDate, SummaryDelta>, migration: Migration) {
    for (date, delta) in migration {
        let day = per_day.entry(date).or_default();
        day.registered += delta.registered;
        day.checkin += delta.checkin;
        day.checkin_late += delta.checkin_late;
        day.checkout += delta.checkout;
    }
}

/// Replaces an item's windows and re-derives everything that depended on the
/// old ones: registered counts for added or removed dates, attendance on
/// removed dates, check-in buckets on dates whose start moved, ledger
/// entries and lifecycle jobs.
pub async fn edit_item_windows(
    ctx: &Context,
    item_id: Uuid,
    mut windows: Vec<DateWindow>,
) -> Result<ScheduleEdit> {
    let old = load_item(ctx, item_id).await?;
    validate_windows(&windows)?;
    windows.sort_by_key(|w| (w.date, w.start));
    ctx.bounded("item update", ctx.store.set_item_windows(item_id, &windows))
        .await?;
    let item = ScheduledItem {
        windows,
        ..old.clone()
    };

    let old_dates: BTreeSet<NaiveDate> = old.dates().into_iter().collect();
    let new_dates: BTreeSet<NaiveDate> = item.dates().into_iter().collect();
    let mut edit = ScheduleEdit {
        added: new_dates.difference(&old_dates).copied().collect(),
        removed: old_dates.difference(&new_dates).copied().collect(),
        ..Default::default()
    };

    let enrollments = ctx
        .bounded("enrollments lookup", ctx.store.enrollments_for_item(item_id))
        .await?;
    let classifier = ctx.classifier();
    let mut per_day: BTreeMap<NaiveDate, SummaryDelta> = BTreeMap::new();

    for mut enrollment in enrollments {
        for date in &edit.added {
            per_day.entry(*date).or_default().registered += 1;
        }
        for date in &edit.removed {
            per_day.entry(*date).or_default().registered -= 1;
        }

        let mut kept = Vec::new();
        for record in std::mem::take(&mut enrollment.records) {
            let (Some(before), after) = (old.window_on(record.date), item.window_on(record.date))
            else {
                kept.push(record);
                continue;
            };
            let old_bucket = record.checkin.map(|at| (record.date, classifier.bucket(before, at)));
            let new_bucket = after.and_then(|w| record.checkin.map(|at| (record.date, classifier.bucket(w, at))));
            add_to(&mut per_day, summary::plan_checkin_migration(old_bucket, new_bucket));

            let Some(after) = after else {
                add_to(
                    &mut per_day,
                    summary::plan_checkout_migration(record.checkout.map(|_| record.date), None),
                );
                let saved = ctx
                    .bounded(
                        "attendance save",
                        ctx.store
                            .save_attendance(enrollment.id, record.date, Some(&record), None),
                    )
                    .await;
                if let Err(err) = saved {
                    edit.failures
                        .push(PartialFailure::new(enrollment.id, "attendance delete", &err));
                }
                continue;
            };

            let label = classifier.classify(Some(after), record.checkin, record.checkout);
            if record.label == Some(label) {
                kept.push(record);
                continue;
            }
            let relabelled = CheckInOutRecord {
                label: Some(label),
                ..record.clone()
            };
            edit.rebucketed += 1;
            let saved = ctx
                .bounded(
                    "attendance save",
                    ctx.store.save_attendance(
                        enrollment.id,
                        record.date,
                        Some(&record),
                        Some(&relabelled),
                    ),
                )
                .await;
            if let Err(err) = saved {
                edit.failures
                    .push(PartialFailure::new(enrollment.id, "attendance relabel", &err));
            }
            kept.push(relabelled);
        }
        enrollment.records = kept;

        if let Err(err) = ledger::sync_entry(ctx, &item, &enrollment).await {
            warn!(enrollment_id = %enrollment.id, error = %err, "ledger sync after schedule edit failed");
            edit.failures
                .push(PartialFailure::new(enrollment.id, "ledger sync", &err));
        }
    }

    let migration: Migration = per_day.into_iter().collect();
    edit.failures
        .extend(summary::apply(ctx, item.program_id, &migration).await);
    edit.pruned_rows = prune_summary_rows(ctx, item.program_id, &mut edit.failures).await;
    edit.jobs = lifecycle::schedule_changed(ctx, item.program_id).await?;

    info!(
        %item_id,
        added = edit.added.len(),
        removed = edit.removed.len(),
        rebucketed = edit.rebucketed,
        "item schedule edited"
    );
    Ok(edit)
}

/// Drops summary rows for dates no item of the program schedules any more.
async fn prune_summary_rows(
    ctx: &Context,
    program_id: Uuid,
    failures: &mut Vec<PartialFailure>,
) -> u64 {
    let result = async {
        let items = ctx
            .bounded("items lookup", ctx.store.items_for_program(program_id))
            .await?;
        let live: BTreeSet<NaiveDate> = items.iter().flat_map(|i| i.dates()).collect();
        let stale: Vec<NaiveDate> = ctx
            .bounded("summary lookup", ctx.store.summary_rows(program_id))
            .await?
            .into_iter()
            .map(|row| row.date)
            .filter(|date| !live.contains(date))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        ctx.bounded(
            "summary prune",
            ctx.store.delete_summary_rows(program_id, &stale),
        )
        .await
    }
    .await;
    match result {
        Ok(pruned) => pruned,
        Err(err) => {
            warn!(%program_id, error = %err, "summary prune failed");
            failures.push(PartialFailure::new(program_id, "summary prune", &err));
            0
        }
    }
}

pub async fn set_enroll_deadline(
    ctx: &Context,
    program_id: Uuid,
    deadline: NaiveDate,
) -> Result<Vec<ScheduledJob>> {
    if !ctx
        .bounded(
            "program update",
            ctx.store.set_enroll_deadline(program_id, deadline),
        )
        .await?
    {
        return Err(LedgerError::not_found("program", program_id));
    }
    info!(%program_id, %deadline, "enrollment deadline changed");
    lifecycle::schedule_changed(ctx, program_id).await
}

pub async fn delete_program(ctx: &Context, program_id: Uuid) -> Result<()> {
    lifecycle::cancel_jobs(ctx, program_id).await?;
    if !ctx
        .bounded("program delete", ctx.store.delete_program(program_id))
        .await?
    {
        return Err(LedgerError::not_found("program", program_id));
    }
    info!(%program_id, "program deleted");
    Ok(())
}
