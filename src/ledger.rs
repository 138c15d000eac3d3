use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::context::Context;
use crate::error::{LedgerError, Result};
use crate::models::{
    program_entry_key, Enrollment, LedgerEntry, LedgerFilter, LedgerStatus, ParticipationLabel,
    Program, ScheduledItem, SkillType, SourceType,
};

/// Attendance evaluated across every scheduled window of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceOutcome {
    pub hour_change: i32,
    pub status: LedgerStatus,
    pub on_time: usize,
    pub scheduled: usize,
    pub checked_in: usize,
}

impl AttendanceOutcome {
    pub fn remark(&self) -> String {
        format!("{}/{} dates on time", self.on_time, self.scheduled)
    }
}

pub fn evaluate(
    classifier: &Classifier,
    item: &ScheduledItem,
    enrollment: &Enrollment,
) -> AttendanceOutcome {
    let mut hour_change = 0;
    let mut on_time = 0;
    let mut checked_in = 0;
    for window in &item.windows {
        let record = enrollment.record_on(window.date);
        let checkin = record.and_then(|r| r.checkin);
        let checkout = record.and_then(|r| r.checkout);
        if checkin.is_some() {
            checked_in += 1;
        }
        match classifier.classify(Some(window), checkin, checkout) {
            ParticipationLabel::OnTime => {
                on_time += 1;
                hour_change += window.hour_value;
            }
            _ => hour_change -= window.hour_value,
        }
    }

    let scheduled = item.windows.len();
    let status = if scheduled > 0 && on_time == scheduled {
        LedgerStatus::Attended
    } else if checked_in > 0 {
        LedgerStatus::Partial
    } else {
        LedgerStatus::Absent
    };

    AttendanceOutcome {
        hour_change,
        status,
        on_time,
        scheduled,
        checked_in,
    }
}

pub fn entry_title(program: &Program, item: &ScheduledItem) -> String {
    format!("{} ({})", program.name, item.name)
}

pub async fn create_pending(
    ctx: &Context,
    program: &Program,
    item: &ScheduledItem,
    enrollment: &Enrollment,
) -> Result<LedgerEntry> {
    let entry = LedgerEntry {
        id: Uuid::new_v4(),
        student_id: enrollment.student_id,
        skill_type: program.skill,
        hour_change: 0,
        status: LedgerStatus::Pending,
        title: entry_title(program, item),
        remark: String::new(),
        source_type: SourceType::Program,
        source_id: program.id,
        enrollment_id: Some(enrollment.id),
        changed_at: ctx.now(),
    };
    ctx.bounded("ledger upsert", ctx.store.upsert_ledger_entry(&entry))
        .await
}

async fn program_entry(ctx: &Context, enrollment: &Enrollment) -> Result<Option<LedgerEntry>> {
    let key = program_entry_key(enrollment.program_id, enrollment.id);
    ctx.bounded("ledger lookup", ctx.store.ledger_entry_by_key(&key))
        .await
}

async fn write_if_changed(
    ctx: &Context,
    entry: LedgerEntry,
    status: LedgerStatus,
    hour_change: i32,
    remark: String,
) -> Result<(LedgerEntry, bool)> {
    if entry.status == status && entry.hour_change == hour_change && entry.remark == remark {
        return Ok((entry, false));
    }
    if !entry.status.can_transition_to(status) {
        return Err(LedgerError::InvalidTransition {
            from: entry.status,
            to: status,
        });
    }
    let updated = LedgerEntry {
        status,
        hour_change,
        remark,
        changed_at: ctx.now(),
        ..entry
    };
    let stored = ctx
        .bounded("ledger upsert", ctx.store.upsert_ledger_entry(&updated))
        .await?;
    Ok((stored, true))
}

/// Re-derives the live entry after an attendance change. Decided entries
/// (approved, rejected) are left alone.
pub async fn sync_entry(
    ctx: &Context,
    item: &ScheduledItem,
    enrollment: &Enrollment,
) -> Result<Option<LedgerEntry>> {
    let Some(entry) = program_entry(ctx, enrollment).await? else {
        debug!(enrollment_id = %enrollment.id, "no ledger entry to sync");
        return Ok(None);
    };
    if entry.status.is_final() {
        return Ok(Some(entry));
    }

    let outcome = evaluate(ctx.classifier(), item, enrollment);
    let status = if entry.status.is_outcome() {
        outcome.status
    } else if entry.status == LedgerStatus::Pending && outcome.checked_in > 0 {
        LedgerStatus::Participating
    } else {
        entry.status
    };
    let remark = if status.is_outcome() {
        outcome.remark()
    } else {
        entry.remark.clone()
    };

    let (entry, changed) = write_if_changed(ctx, entry, status, outcome.hour_change, remark).await?;
    if changed {
        debug!(
            entry_id = %entry.id,
            status = %entry.status,
            hour_change = entry.hour_change,
            "ledger entry synced"
        );
    }
    Ok(Some(entry))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalized {
    Updated,
    Unchanged,
    Decided,
    Missing,
}

/// Settles an enrollment's entry to its attendance outcome. Safe to repeat:
/// nothing is written when the entry already reflects the outcome.
pub async fn finalize_enrollment(
    ctx: &Context,
    item: &ScheduledItem,
    enrollment: &Enrollment,
) -> Result<Finalized> {
    let Some(entry) = program_entry(ctx, enrollment).await? else {
        return Ok(Finalized::Missing);
    };
    if entry.status.is_final() {
        return Ok(Finalized::Decided);
    }
    let outcome = evaluate(ctx.classifier(), item, enrollment);
    let (entry, changed) = write_if_changed(
        ctx,
        entry,
        outcome.status,
        outcome.hour_change,
        outcome.remark(),
    )
    .await?;
    if !changed {
        return Ok(Finalized::Unchanged);
    }
    info!(
        entry_id = %entry.id,
        student_id = %entry.student_id,
        status = %entry.status,
        hour_change = entry.hour_change,
        "ledger entry finalized"
    );
    Ok(Finalized::Updated)
}

/// Moves an entry along the status machine on behalf of an external step
/// (evaluation forms, approvals).
pub async fn advance_status(
    ctx: &Context,
    entry_id: Uuid,
    status: LedgerStatus,
    remark: Option<String>,
) -> Result<LedgerEntry> {
    let entry = ctx
        .bounded("ledger lookup", ctx.store.ledger_entry(entry_id))
        .await?
        .ok_or_else(|| LedgerError::not_found("ledger entry", entry_id))?;
    let hour_change = match status {
        LedgerStatus::Rejected => 0,
        _ => entry.hour_change,
    };
    let remark = remark.unwrap_or_else(|| entry.remark.clone());
    let (entry, changed) = write_if_changed(ctx, entry, status, hour_change, remark).await?;
    if changed {
        info!(entry_id = %entry.id, status = %entry.status, "ledger status advanced");
    }
    Ok(entry)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Standing {
    Complete,
    Low,
    VeryLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HourBalance {
    pub soft: i32,
    pub hard: i32,
    pub standing: Standing,
}

pub fn standing(soft: i32, hard: i32) -> Standing {
    if soft >= 30 && hard >= 12 {
        Standing::Complete
    } else if soft + hard >= 20 {
        Standing::Low
    } else {
        Standing::VeryLow
    }
}

pub async fn student_hours(ctx: &Context, student_id: Uuid) -> Result<HourBalance> {
    let filter = LedgerFilter {
        student_id: Some(student_id),
        ..Default::default()
    };
    let entries = ctx
        .bounded("ledger query", ctx.store.ledger_entries(&filter))
        .await?;
    let (mut soft, mut hard) = (0, 0);
    for entry in entries.iter().filter(|e| e.status.is_credited()) {
        match entry.skill_type {
            SkillType::Soft => soft += entry.hour_change,
            SkillType::Hard => hard += entry.hour_change,
        }
    }
    Ok(HourBalance {
        soft,
        hard,
        standing: standing(soft, hard),
    })
}
