use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::CheckinBucket;
use crate::clock::local_date;
use crate::context::Context;
use crate::error::{Conflict, LedgerError, PartialFailure, Result};
use crate::ledger;
use crate::models::{
    CheckInOutRecord, Enrollment, ParticipationLabel, Program, ProgramState, ScheduledItem,
    Student, SummaryDelta,
};
use crate::summary::{self, Migration};

/// Tri-state edit of an optional field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Patch<T> {
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            Patch::Keep => current,
            Patch::Set(value) => Some(value),
            Patch::Clear => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug)]
pub struct Registration {
    pub enrollment: Enrollment,
    pub failures: Vec<PartialFailure>,
}

#[derive(Debug)]
pub struct AttendanceChange {
    pub enrollment: Enrollment,
    pub record: Option<CheckInOutRecord>,
    pub failures: Vec<PartialFailure>,
}

impl AttendanceChange {
    pub fn label(&self) -> Option<ParticipationLabel> {
        self.record.as_ref().and_then(|r| r.label)
    }
}

#[derive(Debug, Default)]
pub struct BulkReport {
    pub registered: Vec<(String, Uuid)>,
    pub failed: Vec<(String, String)>,
    pub failures: Vec<PartialFailure>,
}

async fn load_student(ctx: &Context, id: Uuid) -> Result<Student> {
    ctx.bounded("student lookup", ctx.store.student(id))
        .await?
        .ok_or_else(|| LedgerError::not_found("student", id))
}

pub(crate) async fn load_item(ctx: &Context, id: Uuid) -> Result<ScheduledItem> {
    ctx.bounded("item lookup", ctx.store.item(id))
        .await?
        .ok_or_else(|| LedgerError::not_found("item", id))
}

pub(crate) async fn load_program(ctx: &Context, id: Uuid) -> Result<Program> {
    ctx.bounded("program lookup", ctx.store.program(id))
        .await?
        .ok_or_else(|| LedgerError::not_found("program", id))
}

async fn load_enrollment(ctx: &Context, id: Uuid) -> Result<Enrollment> {
    ctx.bounded("enrollment lookup", ctx.store.enrollment(id))
        .await?
        .ok_or_else(|| LedgerError::not_found("enrollment", id))
}

fn normalize_food(food: Option<String>) -> Option<String> {
    food.map(|f| f.trim().to_string()).filter(|f| !f.is_empty())
}

async fn adjust_food(ctx: &Context, program_id: Uuid, food: &str, delta: i64) -> Option<PartialFailure> {
    let result = ctx
        .bounded(
            "food vote",
            ctx.store.adjust_food_vote(program_id, food, delta),
        )
        .await;
    match result {
        Ok(()) => None,
        Err(err) => {
            warn!(%program_id, food, error = %err, "food vote update failed");
            Some(PartialFailure::new(format!("food {food}"), "vote", &err))
        }
    }
}

pub async fn register(
    ctx: &Context,
    student_id: Uuid,
    item_id: Uuid,
    food: Option<String>,
) -> Result<Registration> {
    let student = load_student(ctx, student_id).await?;
    let item = load_item(ctx, item_id).await?;
    let program = load_program(ctx, item.program_id).await?;

    if program.state != ProgramState::Open {
        return Err(LedgerError::Validation(format!(
            "program {} is {}, registration requires open",
            program.id, program.state
        )));
    }
    if !item.eligibility.admits(&student) {
        return Err(Conflict::EligibilityMismatch.into());
    }

    let enrollment = Enrollment {
        id: Uuid::new_v4(),
        student_id,
        item_id,
        program_id: program.id,
        registered_at: ctx.now(),
        food: normalize_food(food),
        records: Vec::new(),
    };
    ctx.bounded("enrollment insert", ctx.store.insert_enrollment(&enrollment))
        .await?;

    let mut failures = Vec::new();
    let mut counted = Vec::new();
    for date in item.dates() {
        let target = format!("summary {}/{date}", program.id);
        if let Err(err) = summary::adjust_registered(ctx, &item, date, 1).await {
            warn!(program_id = %program.id, %date, error = %err, "registered count not updated");
            failures.push(PartialFailure::new(&target, "registered", &err));
            continue;
        }
        counted.push(date);
        if let Err(err) = summary::recalculate(ctx, program.id, date).await {
            warn!(program_id = %program.id, %date, error = %err, "summary recalculate failed");
            failures.push(PartialFailure::new(&target, "recalculate", &err));
        }
    }

    if let Err(err) = ledger::create_pending(ctx, &program, &item, &enrollment).await {
        warn!(enrollment_id = %enrollment.id, error = %err, "ledger entry not created, rolling back");
        rollback_registration(ctx, &enrollment, &counted).await;
        return Err(err);
    }

    if let Some(food) = &enrollment.food {
        failures.extend(adjust_food(ctx, program.id, food, 1).await);
    }

    info!(
        enrollment_id = %enrollment.id,
        %student_id,
        %item_id,
        "student registered"
    );
    Ok(Registration {
        enrollment,
        failures,
    })
}

/// Undoes an enrollment whose pending ledger entry could not be written. When
/// the delete itself fails the enrollment stays, and finalization reports it.
async fn rollback_registration(ctx: &Context, enrollment: &Enrollment, counted: &[NaiveDate]) {
    if let Err(err) = ctx
        .bounded("enrollment delete", ctx.store.delete_enrollment(enrollment.id))
        .await
    {
        warn!(enrollment_id = %enrollment.id, error = %err, "rollback failed, enrollment has no ledger entry");
        return;
    }
    let migration: Migration = counted
        .iter()
        .map(|date| {
            (
                *date,
                SummaryDelta {
                    registered: -1,
                    ..Default::default()
                },
            )
        })
        .collect();
    for failure in summary::apply(ctx, enrollment.program_id, &migration).await {
        warn!(enrollment_id = %enrollment.id, %failure, "rollback left a registered count behind");
    }
}

/// Registers students by code. Codes are trimmed and de-duplicated; each one
/// succeeds or fails on its own.
pub async fn bulk_register(
    ctx: &Context,
    item_id: Uuid,
    rows: Vec<(String, Option<String>)>,
) -> Result<BulkReport> {
    load_item(ctx, item_id).await?;
    let mut seen = BTreeSet::new();
    let mut report = BulkReport::default();

    for (code, food) in rows {
        let code = code.trim().to_string();
        if code.is_empty() || !seen.insert(code.clone()) {
            continue;
        }
        let student = match ctx
            .bounded("student lookup", ctx.store.student_by_code(&code))
            .await
        {
            Ok(Some(student)) => student,
            Ok(None) => {
                report.failed.push((code, "student not found".to_string()));
                continue;
            }
            Err(err) => {
                report.failed.push((code, err.to_string()));
                continue;
            }
        };
        match register(ctx, student.id, item_id, food).await {
            Ok(registration) => {
                report.failures.extend(registration.failures);
                report.registered.push((code, registration.enrollment.id));
            }
            Err(err) => report.failed.push((code, err.to_string())),
        }
    }

    info!(
        %item_id,
        registered = report.registered.len(),
        failed = report.failed.len(),
        "bulk registration finished"
    );
    Ok(report)
}

fn checkin_bucket(
    ctx: &Context,
    item: &ScheduledItem,
    record: &CheckInOutRecord,
) -> Option<(NaiveDate, CheckinBucket)> {
    let checkin = record.checkin?;
    let window = item.window_on(record.date)?;
    Some((record.date, ctx.classifier().bucket(window, checkin)))
}

fn checkout_day(item: &ScheduledItem, record: &CheckInOutRecord) -> Option<NaiveDate> {
    record.checkout?;
    item.window_on(record.date).map(|_| record.date)
}

/// Removes the enrollment and reverses its summary, ledger and food effects.
///
/// Ledger entries go first, so a failure part way leaves an enrollment that a
/// retry can still find rather than an orphaned entry.
pub async fn unregister(ctx: &Context, enrollment_id: Uuid) -> Result<Vec<PartialFailure>> {
    ctx.bounded(
        "ledger delete",
        ctx.store.delete_ledger_entries_for_enrollment(enrollment_id),
    )
    .await?;
    let enrollment = ctx
        .bounded("enrollment delete", ctx.store.delete_enrollment(enrollment_id))
        .await?
        .ok_or_else(|| LedgerError::not_found("enrollment", enrollment_id))?;

    let mut failures = Vec::new();
    match ctx
        .bounded("item lookup", ctx.store.item(enrollment.item_id))
        .await
    {
        Ok(Some(item)) => {
            let mut per_day: BTreeMap<NaiveDate, SummaryDelta> = BTreeMap::new();
            for date in item.dates() {
                per_day.entry(date).or_default().registered -= 1;
            }
            for record in &enrollment.records {
                for (date, delta) in summary::plan_checkin_migration(checkin_bucket(ctx, &item, record), None)
                    .into_iter()
                    .chain(summary::plan_checkout_migration(checkout_day(&item, record), None))
                {
                    let day = per_day.entry(date).or_default();
                    day.checkin += delta.checkin;
                    day.checkin_late += delta.checkin_late;
                    day.checkout += delta.checkout;
                }
            }
            let migration: Migration = per_day.into_iter().collect();
            failures.extend(summary::apply(ctx, enrollment.program_id, &migration).await);
        }
        Ok(None) => warn!(%enrollment_id, "item missing, summary left untouched"),
        Err(err) => {
            warn!(%enrollment_id, error = %err, "item lookup failed, summary left untouched");
            failures.push(PartialFailure::new(enrollment_id, "summary", &err));
        }
    }

    if let Some(food) = &enrollment.food {
        failures.extend(adjust_food(ctx, enrollment.program_id, food, -1).await);
    }

    info!(%enrollment_id, student_id = %enrollment.student_id, "student unregistered");
    Ok(failures)
}

fn derive_date(
    ctx: &Context,
    checkin: Option<DateTime<Utc>>,
    checkout: Option<DateTime<Utc>>,
) -> Result<Option<NaiveDate>> {
    if let (Some(checkin), Some(checkout)) = (checkin, checkout) {
        if checkout < checkin {
            return Err(LedgerError::Validation(
                "checkout must not precede checkin".to_string(),
            ));
        }
        if local_date(checkin, ctx.tz()) != local_date(checkout, ctx.tz()) {
            return Err(LedgerError::Validation(
                "checkin and checkout must fall on the same date".to_string(),
            ));
        }
    }
    Ok(checkin.or(checkout).map(|at| local_date(at, ctx.tz())))
}

type Edit = (Patch<DateTime<Utc>>, Patch<DateTime<Utc>>);

/// Attempts at an attendance write before a concurrent edit is reported.
const ATTENDANCE_ATTEMPTS: usize = 3;

/// Sets, keeps or clears the check-in and check-out of one scheduled date,
/// then migrates summary buckets and re-syncs the ledger entry.
///
/// When the timestamps fall on another scheduled date the record moves there.
/// A record left with neither timestamp is deleted.
pub async fn record_attendance(
    ctx: &Context,
    enrollment_id: Uuid,
    date: NaiveDate,
    checkin: Patch<DateTime<Utc>>,
    checkout: Patch<DateTime<Utc>>,
) -> Result<AttendanceChange> {
    edit_attendance(ctx, enrollment_id, date, |_| Ok((checkin, checkout))).await
}

/// Self-service check-in or check-out stamped with the current time.
pub async fn submit_check(
    ctx: &Context,
    enrollment_id: Uuid,
    direction: Direction,
) -> Result<AttendanceChange> {
    let now = ctx.now();
    let today = local_date(now, ctx.tz());
    edit_attendance(ctx, enrollment_id, today, |existing| match direction {
        Direction::In => {
            if existing.is_some_and(|r| r.checkin.is_some()) {
                return Err(Conflict::AlreadyCheckedIn("in").into());
            }
            Ok((Patch::Set(now), Patch::Keep))
        }
        Direction::Out => {
            let Some(record) = existing.filter(|r| r.checkin.is_some()) else {
                return Err(LedgerError::Validation(
                    "check in before checking out".to_string(),
                ));
            };
            if record.checkout.is_some() {
                return Err(Conflict::AlreadyCheckedIn("out").into());
            }
            Ok((Patch::Keep, Patch::Set(now)))
        }
    })
    .await
}

/// Runs `edit` against the stored record and writes the result only if that
/// record is still current, reloading and re-deciding when it is not.
async fn edit_attendance<F>(
    ctx: &Context,
    enrollment_id: Uuid,
    date: NaiveDate,
    edit: F,
) -> Result<AttendanceChange>
where
    F: Fn(Option<&CheckInOutRecord>) -> Result<Edit>,
{
    let mut attempt = 1;
    loop {
        match try_edit_attendance(ctx, enrollment_id, date, &edit).await {
            Err(LedgerError::Conflict(Conflict::StaleAttendance))
                if attempt < ATTENDANCE_ATTEMPTS =>
            {
                debug!(%enrollment_id, %date, attempt, "attendance changed concurrently, reloading");
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

async fn try_edit_attendance<F>(
    ctx: &Context,
    enrollment_id: Uuid,
    date: NaiveDate,
    edit: &F,
) -> Result<AttendanceChange>
where
    F: Fn(Option<&CheckInOutRecord>) -> Result<Edit>,
{
    let mut enrollment = load_enrollment(ctx, enrollment_id).await?;
    let item = load_item(ctx, enrollment.item_id).await?;
    if item.window_on(date).is_none() {
        return Err(LedgerError::DateNotScheduled(date));
    }

    let old = enrollment.record_on(date).cloned();
    let (checkin, checkout) = edit(old.as_ref())?;
    let new_checkin = checkin.apply(old.as_ref().and_then(|r| r.checkin));
    let new_checkout = checkout.apply(old.as_ref().and_then(|r| r.checkout));

    let record = match derive_date(ctx, new_checkin, new_checkout)? {
        None => None,
        Some(day) => {
            let window = item
                .window_on(day)
                .ok_or(LedgerError::DateNotScheduled(day))?;
            if day != date && enrollment.record_on(day).is_some() {
                return Err(LedgerError::Validation(format!(
                    "a record already exists on {day}"
                )));
            }
            Some(CheckInOutRecord {
                id: old.as_ref().map_or_else(Uuid::new_v4, |r| r.id),
                date: day,
                checkin: new_checkin,
                checkout: new_checkout,
                label: Some(ctx.classifier().classify(
                    Some(window),
                    new_checkin,
                    new_checkout,
                )),
            })
        }
    };

    if old.is_none() && record.is_none() {
        return Ok(AttendanceChange {
            enrollment,
            record: None,
            failures: Vec::new(),
        });
    }

    // the summary moves only from the record this write actually replaced
    ctx.bounded(
        "attendance save",
        ctx.store
            .save_attendance(enrollment_id, date, old.as_ref(), record.as_ref()),
    )
    .await?;

    let mut migration = summary::plan_checkin_migration(
        old.as_ref().and_then(|r| checkin_bucket(ctx, &item, r)),
        record.as_ref().and_then(|r| checkin_bucket(ctx, &item, r)),
    );
    migration.extend(summary::plan_checkout_migration(
        old.as_ref().and_then(|r| checkout_day(&item, r)),
        record.as_ref().and_then(|r| checkout_day(&item, r)),
    ));
    let failures = summary::apply(ctx, enrollment.program_id, &migration).await;

    enrollment.records.retain(|r| r.date != date);
    if let Some(record) = &record {
        enrollment.records.retain(|r| r.date != record.date);
        enrollment.records.push(record.clone());
        enrollment.records.sort_by_key(|r| r.date);
    }

    ledger::sync_entry(ctx, &item, &enrollment).await?;

    info!(
        %enrollment_id,
        %date,
        label = ?record.as_ref().and_then(|r| r.label),
        "attendance recorded"
    );
    Ok(AttendanceChange {
        enrollment,
        record,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LedgerStatus;
    use crate::testing::{faulty_harness, harness, local, Harness};
    use proptest::prelude::*;

    async fn scenario(h: &Harness) -> (Program, ScheduledItem, Enrollment) {
        let student = h.student("65160001", "SE", 2).await;
        let (program, item) = h
            .program(ProgramState::Open, Some(10), &["2025-03-15 09:00-12:00 4"])
            .await;
        let registration = register(&h.ctx, student.id, item.id, Some("Pad Thai".to_string()))
            .await
            .unwrap();
        assert!(registration.failures.is_empty());
        (program, item, registration.enrollment)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 15).unwrap()
    }

    #[tokio::test]
    async fn registration_counts_and_creates_pending_entry() {
        let h = harness().await;
        let (program, _, enrollment) = scenario(&h).await;

        let row = h.row(program.id, day()).await;
        assert_eq!((row.registered, row.not_participating), (1, 1));
        let entry = h.entry(&enrollment).await.unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);
        assert_eq!(entry.hour_change, 0);
        assert_eq!(
            h.ctx.store.food_votes(program.id).await.unwrap(),
            vec![("Pad Thai".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn scenario_a_on_time_attendance() {
        let h = harness().await;
        let (program, _, enrollment) = scenario(&h).await;

        let change = record_attendance(
            &h.ctx,
            enrollment.id,
            day(),
            Patch::Set(local(day(), 8, 35)),
            Patch::Set(local(day(), 12, 5)),
        )
        .await
        .unwrap();
        assert_eq!(change.label(), Some(ParticipationLabel::OnTime));

        let row = h.row(program.id, day()).await;
        assert_eq!(
            (row.registered, row.checkin, row.checkin_late, row.not_participating),
            (1, 1, 0, 0)
        );
        let entry = h.entry(&enrollment).await.unwrap();
        assert_eq!(entry.status, LedgerStatus::Participating);
    }

    #[tokio::test]
    async fn scenario_b_late_attendance() {
        let h = harness().await;
        let (program, _, enrollment) = scenario(&h).await;

        let change = record_attendance(
            &h.ctx,
            enrollment.id,
            day(),
            Patch::Set(local(day(), 9, 45)),
            Patch::Set(local(day(), 12, 5)),
        )
        .await
        .unwrap();
        assert_eq!(change.label(), Some(ParticipationLabel::Late));

        let row = h.row(program.id, day()).await;
        assert_eq!((row.checkin, row.checkin_late, row.not_participating), (0, 1, 0));
        assert!(row.is_reconciled());
    }

    #[tokio::test]
    async fn scenario_c_correction_migrates_bucket() {
        let h = harness().await;
        let (program, _, enrollment) = scenario(&h).await;

        record_attendance(
            &h.ctx,
            enrollment.id,
            day(),
            Patch::Set(local(day(), 8, 35)),
            Patch::Set(local(day(), 12, 5)),
        )
        .await
        .unwrap();
        let change = record_attendance(
            &h.ctx,
            enrollment.id,
            day(),
            Patch::Set(local(day(), 9, 45)),
            Patch::Keep,
        )
        .await
        .unwrap();
        assert_eq!(change.label(), Some(ParticipationLabel::Late));

        let row = h.row(program.id, day()).await;
        assert_eq!((row.checkin, row.checkin_late, row.checkout), (0, 1, 1));
        assert!(row.is_reconciled());
    }

    #[tokio::test]
    async fn clearing_then_restoring_checkin_round_trips() {
        let h = harness().await;
        let (program, _, enrollment) = scenario(&h).await;
        let checkin = local(day(), 8, 35);

        let original = record_attendance(
            &h.ctx,
            enrollment.id,
            day(),
            Patch::Set(checkin),
            Patch::Set(local(day(), 12, 5)),
        )
        .await
        .unwrap();
        let before = h.row(program.id, day()).await;

        let cleared = record_attendance(&h.ctx, enrollment.id, day(), Patch::Clear, Patch::Keep)
            .await
            .unwrap();
        assert_eq!(cleared.label(), Some(ParticipationLabel::Absent));
        assert_eq!(h.row(program.id, day()).await.checkin, 0);

        let restored =
            record_attendance(&h.ctx, enrollment.id, day(), Patch::Set(checkin), Patch::Keep)
                .await
                .unwrap();
        assert_eq!(restored.label(), original.label());
        assert_eq!(h.row(program.id, day()).await, before);
    }

    #[tokio::test]
    async fn clearing_both_values_deletes_the_record() {
        let h = harness().await;
        let (program, _, enrollment) = scenario(&h).await;
        record_attendance(
            &h.ctx,
            enrollment.id,
            day(),
            Patch::Set(local(day(), 8, 35)),
            Patch::Set(local(day(), 12, 5)),
        )
        .await
        .unwrap();
        let change = record_attendance(&h.ctx, enrollment.id, day(), Patch::Clear, Patch::Clear)
            .await
            .unwrap();
        assert!(change.record.is_none());
        let stored = h.ctx.store.enrollment(enrollment.id).await.unwrap().unwrap();
        assert!(stored.records.is_empty());
        let row = h.row(program.id, day()).await;
        assert_eq!((row.checkin, row.checkout, row.not_participating), (0, 0, 1));
    }

    #[tokio::test]
    async fn unscheduled_dates_are_rejected() {
        let h = harness().await;
        let (_, _, enrollment) = scenario(&h).await;
        let other = NaiveDate::from_ymd_opt(2025, 3, 16).unwrap();
        let err = record_attendance(
            &h.ctx,
            enrollment.id,
            other,
            Patch::Set(local(other, 9, 0)),
            Patch::Keep,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LedgerError::DateNotScheduled(d) if d == other));

        let err = record_attendance(
            &h.ctx,
            enrollment.id,
            day(),
            Patch::Set(local(day(), 12, 0)),
            Patch::Set(local(day(), 9, 0)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn moving_a_record_to_another_day_migrates_both_rows() {
        let h = harness().await;
        let student = h.student("65160009", "CS", 1).await;
        let (program, item) = h
            .program(
                ProgramState::Open,
                None,
                &["2025-03-15 09:00-12:00 4", "2025-03-16 09:00-12:00 4"],
            )
            .await;
        let enrollment = register(&h.ctx, student.id, item.id, None)
            .await
            .unwrap()
            .enrollment;
        let next = NaiveDate::from_ymd_opt(2025, 3, 16).unwrap();

        record_attendance(&h.ctx, enrollment.id, day(), Patch::Set(local(day(), 9, 0)), Patch::Keep)
            .await
            .unwrap();
        let change = record_attendance(
            &h.ctx,
            enrollment.id,
            day(),
            Patch::Set(local(next, 9, 0)),
            Patch::Keep,
        )
        .await
        .unwrap();
        assert_eq!(change.record.as_ref().map(|r| r.date), Some(next));
        assert_eq!(h.row(program.id, day()).await.checkin, 0);
        assert_eq!(h.row(program.id, next).await.checkin, 1);
    }

    #[tokio::test]
    async fn registration_refusals() {
        let h = harness().await;
        let student = h.student("65160003", "SE", 2).await;
        let (_, item) = h
            .program(ProgramState::Open, Some(10), &["2025-03-15 09:00-12:00 4"])
            .await;
        register(&h.ctx, student.id, item.id, None).await.unwrap();
        let err = register(&h.ctx, student.id, item.id, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(Conflict::AlreadyEnrolled)));

        let (_, clashing) = h
            .program(ProgramState::Open, None, &["2025-03-15 10:00-11:00 1"])
            .await;
        let err = register(&h.ctx, student.id, clashing.id, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(Conflict::ScheduleConflict)));

        let (_, planning) = h
            .program(ProgramState::Planning, None, &["2025-04-01 09:00-12:00 4"])
            .await;
        let err = register(&h.ctx, student.id, planning.id, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let (_, restricted) = h
            .restricted_program(&["CS"], &["2025-04-02 09:00-12:00 4"])
            .await;
        let err = register(&h.ctx, student.id, restricted.id, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(Conflict::EligibilityMismatch)));
    }

    #[tokio::test]
    async fn scenario_d_concurrent_registrations_respect_capacity() {
        let (h, _store) = faulty_harness().await;
        let first = h.student("65160004", "SE", 2).await;
        let second = h.student("65160005", "SE", 2).await;
        let (program, item) = h
            .program(ProgramState::Open, Some(1), &["2025-03-15 09:00-12:00 4"])
            .await;

        let (a, b) = tokio::join!(
            register(&h.ctx, first.id, item.id, None),
            register(&h.ctx, second.id, item.id, None)
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(
            r,
            Err(LedgerError::Conflict(Conflict::CapacityExceeded))
        )));
        assert_eq!(h.row(program.id, day()).await.registered, 1);
    }

    #[tokio::test]
    async fn unregister_reverses_every_effect() {
        let h = harness().await;
        let (program, _, enrollment) = scenario(&h).await;
        record_attendance(
            &h.ctx,
            enrollment.id,
            day(),
            Patch::Set(local(day(), 9, 45)),
            Patch::Set(local(day(), 12, 5)),
        )
        .await
        .unwrap();

        let failures = unregister(&h.ctx, enrollment.id).await.unwrap();
        assert!(failures.is_empty());
        let row = h.row(program.id, day()).await;
        assert_eq!(
            (row.registered, row.checkin, row.checkin_late, row.checkout, row.not_participating),
            (0, 0, 0, 0, 0)
        );
        assert!(h.entry(&enrollment).await.is_none());
        assert_eq!(
            h.ctx.store.food_votes(program.id).await.unwrap(),
            vec![("Pad Thai".to_string(), 0)]
        );
        let err = unregister(&h.ctx, enrollment.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn self_check_in_and_out() {
        let h = harness().await;
        let (program, _, enrollment) = scenario(&h).await;

        h.clock.set(local(day(), 8, 50));
        let change = submit_check(&h.ctx, enrollment.id, Direction::In).await.unwrap();
        assert_eq!(change.label(), Some(ParticipationLabel::CheckinOnly));
        let err = submit_check(&h.ctx, enrollment.id, Direction::In).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(Conflict::AlreadyCheckedIn("in"))));

        h.clock.set(local(day(), 12, 1));
        let change = submit_check(&h.ctx, enrollment.id, Direction::Out).await.unwrap();
        assert_eq!(change.label(), Some(ParticipationLabel::OnTime));
        assert_eq!(h.row(program.id, day()).await.checkout, 1);

        h.clock.set(local(day(), 23, 0) + chrono::Duration::days(1));
        let err = submit_check(&h.ctx, enrollment.id, Direction::In).await.unwrap_err();
        assert!(matches!(err, LedgerError::DateNotScheduled(_)));
    }

    #[tokio::test]
    async fn bulk_registration_reports_per_code() {
        let h = harness().await;
        h.student("65160006", "SE", 2).await;
        h.student("65160007", "SE", 2).await;
        let (_, item) = h
            .program(ProgramState::Open, Some(10), &["2025-03-15 09:00-12:00 4"])
            .await;
        let report = bulk_register(
            &h.ctx,
            item.id,
            vec![
                (" 65160006 ".to_string(), None),
                ("65160006".to_string(), None),
                ("65160007".to_string(), Some("Khao Soi".to_string())),
                ("99999999".to_string(), None),
            ],
        )
        .await
        .unwrap();
        assert_eq!(report.registered.len(), 2);
        assert_eq!(report.failed, vec![("99999999".to_string(), "student not found".to_string())]);
    }

    #[tokio::test]
    async fn failed_ledger_entry_rolls_registration_back() {
        let (h, store) = faulty_harness().await;
        let student = h.student("65160001", "SE", 2).await;
        let (program, item) = h
            .program(ProgramState::Open, Some(10), &["2025-03-15 09:00-12:00 4"])
            .await;

        store.fail("upsert_ledger_entry", 1);
        let err = register(&h.ctx, student.id, item.id, Some("Pad Thai".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Timeout("upsert_ledger_entry")));
        assert!(h.ctx.store.enrollments_for_item(item.id).await.unwrap().is_empty());
        assert_eq!(h.row(program.id, day()).await.registered, 0);
        assert!(h.ctx.store.food_votes(program.id).await.unwrap().is_empty());

        let retry = register(&h.ctx, student.id, item.id, Some("Pad Thai".to_string()))
            .await
            .unwrap();
        let entry = h.entry(&retry.enrollment).await.unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);
        let row = h.row(program.id, day()).await;
        assert_eq!((row.registered, row.not_participating), (1, 1));
    }

    #[tokio::test]
    async fn unregister_can_be_retried_after_a_failed_delete() {
        let (h, store) = faulty_harness().await;
        let (program, _, enrollment) = scenario(&h).await;

        store.fail("delete_ledger_entries_for_enrollment", 1);
        unregister(&h.ctx, enrollment.id).await.unwrap_err();
        assert!(h.ctx.store.enrollment(enrollment.id).await.unwrap().is_some());
        assert!(h.entry(&enrollment).await.is_some());

        store.fail("delete_enrollment", 1);
        unregister(&h.ctx, enrollment.id).await.unwrap_err();
        assert!(h.ctx.store.enrollment(enrollment.id).await.unwrap().is_some());
        assert!(h.entry(&enrollment).await.is_none());

        let failures = unregister(&h.ctx, enrollment.id).await.unwrap();
        assert!(failures.is_empty());
        assert!(h.ctx.store.enrollment(enrollment.id).await.unwrap().is_none());
        assert_eq!(h.row(program.id, day()).await.registered, 0);
    }

    #[tokio::test]
    async fn concurrent_check_ins_count_once() {
        let (h, _store) = faulty_harness().await;
        let (program, _, enrollment) = scenario(&h).await;
        h.clock.set(local(day(), 8, 50));

        let (a, b) = tokio::join!(
            submit_check(&h.ctx, enrollment.id, Direction::In),
            submit_check(&h.ctx, enrollment.id, Direction::In)
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(
            r,
            Err(LedgerError::Conflict(Conflict::AlreadyCheckedIn("in")))
        )));

        let row = h.row(program.id, day()).await;
        assert_eq!(
            (row.registered, row.checkin, row.checkin_late, row.not_participating),
            (1, 1, 0, 0)
        );
        let stored = h.ctx.store.enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(stored.records.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_corrections_migrate_from_the_stored_record() {
        let (h, _store) = faulty_harness().await;
        let (program, _, enrollment) = scenario(&h).await;

        let (a, b) = tokio::join!(
            record_attendance(
                &h.ctx,
                enrollment.id,
                day(),
                Patch::Set(local(day(), 8, 35)),
                Patch::Keep
            ),
            record_attendance(
                &h.ctx,
                enrollment.id,
                day(),
                Patch::Set(local(day(), 9, 45)),
                Patch::Keep
            )
        );
        a.unwrap();
        b.unwrap();

        let row = h.row(program.id, day()).await;
        assert_eq!(row.checkin + row.checkin_late, 1);
        assert!(row.is_reconciled());
        let stored = h.ctx.store.enrollment(enrollment.id).await.unwrap().unwrap();
        let late = stored.records[0].checkin == Some(local(day(), 9, 45));
        assert_eq!(row.checkin_late == 1, late);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(usize),
        Unregister(usize),
        CheckIn(usize, usize, i64),
        CheckOut(usize, usize),
        ClearCheckIn(usize, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize).prop_map(Op::Register),
            (0..4usize).prop_map(Op::Unregister),
            (0..4usize, 0..2usize, -90i64..90).prop_map(|(s, d, m)| Op::CheckIn(s, d, m)),
            (0..4usize, 0..2usize).prop_map(|(s, d)| Op::CheckOut(s, d)),
            (0..4usize, 0..2usize).prop_map(|(s, d)| Op::ClearCheckIn(s, d)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn summary_rows_always_reconcile(ops in prop::collection::vec(op(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let h = harness().await;
                let mut students = Vec::new();
                for n in 0..4 {
                    students.push(h.student(&format!("6516100{n}"), "SE", 2).await);
                }
                let (program, item) = h
                    .program(
                        ProgramState::Open,
                        Some(3),
                        &["2025-03-15 09:00-12:00 4", "2025-03-16 09:00-12:00 4"],
                    )
                    .await;
                let dates = item.dates();
                let mut enrolled: Vec<Option<Uuid>> = vec![None; students.len()];

                for op in ops {
                    match op {
                        Op::Register(s) => {
                            if let Ok(r) = register(&h.ctx, students[s].id, item.id, None).await {
                                enrolled[s] = Some(r.enrollment.id);
                            }
                        }
                        Op::Unregister(s) => {
                            if let Some(id) = enrolled[s].take() {
                                unregister(&h.ctx, id).await.unwrap();
                            }
                        }
                        Op::CheckIn(s, d, minutes) => {
                            if let Some(id) = enrolled[s] {
                                let at = local(dates[d], 9, 0) + chrono::Duration::minutes(minutes);
                                let _ = record_attendance(&h.ctx, id, dates[d], Patch::Set(at), Patch::Keep).await;
                            }
                        }
                        Op::CheckOut(s, d) => {
                            if let Some(id) = enrolled[s] {
                                let at = local(dates[d], 12, 5);
                                let _ = record_attendance(&h.ctx, id, dates[d], Patch::Keep, Patch::Set(at)).await;
                            }
                        }
                        Op::ClearCheckIn(s, d) => {
                            if let Some(id) = enrolled[s] {
                                let _ = record_attendance(&h.ctx, id, dates[d], Patch::Clear, Patch::Keep).await;
                            }
                        }
                    }

                    for row in h.ctx.store.summary_rows(program.id).await.unwrap() {
                        assert!(row.is_reconciled(), "unreconciled row {row:?}");
                    }
                }
            });
        }
    }
}
