use tracing::info;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{LedgerError, Result};
use crate::models::{
    source_entry_key, LedgerEntry, LedgerFilter, LedgerStatus, SkillType, SourceType,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject { remark: String },
}

/// Hours to credit given what the student already has approved.
pub fn capped_credit(requested: i32, already_approved: i32, cap: i32) -> i32 {
    requested.clamp(0, (cap - already_approved).max(0))
}

async fn existing(ctx: &Context, certificate_id: Uuid, student_id: Uuid) -> Result<Option<LedgerEntry>> {
    let key = source_entry_key(SourceType::Certificate, certificate_id, student_id);
    ctx.bounded("ledger lookup", ctx.store.ledger_entry_by_key(&key))
        .await
}

/// Records an uploaded certificate as a pending entry. A rejected
/// certificate may be submitted again; an approved one may not.
pub async fn submit(
    ctx: &Context,
    certificate_id: Uuid,
    student_id: Uuid,
    skill: SkillType,
    title: &str,
) -> Result<LedgerEntry> {
    ctx.bounded("student lookup", ctx.store.student(student_id))
        .await?
        .ok_or_else(|| LedgerError::not_found("student", student_id))?;

    let previous = existing(ctx, certificate_id, student_id).await?;
    if let Some(entry) = &previous {
        if entry.status == LedgerStatus::Approved {
            return Err(LedgerError::Validation(format!(
                "certificate {certificate_id} is already approved"
            )));
        }
    }

    let entry = LedgerEntry {
        id: previous.map_or_else(Uuid::new_v4, |e| e.id),
        student_id,
        skill_type: skill,
        hour_change: 0,
        status: LedgerStatus::Pending,
        title: title.to_string(),
        remark: String::new(),
        source_type: SourceType::Certificate,
        source_id: certificate_id,
        enrollment_id: None,
        changed_at: ctx.now(),
    };
    let stored = ctx
        .bounded("ledger upsert", ctx.store.upsert_ledger_entry(&entry))
        .await?;
    info!(%certificate_id, %student_id, "certificate submitted");
    Ok(stored)
}

pub async fn decide(
    ctx: &Context,
    certificate_id: Uuid,
    student_id: Uuid,
    hours: i32,
    decision: Decision,
) -> Result<LedgerEntry> {
    let entry = existing(ctx, certificate_id, student_id)
        .await?
        .ok_or_else(|| LedgerError::not_found("certificate", certificate_id))?;
    let target = match decision {
        Decision::Approve => LedgerStatus::Approved,
        Decision::Reject { .. } => LedgerStatus::Rejected,
    };
    if entry.status != LedgerStatus::Pending {
        return Err(LedgerError::InvalidTransition {
            from: entry.status,
            to: target,
        });
    }

    let updated = match decision {
        Decision::Reject { remark } => LedgerEntry {
            status: LedgerStatus::Rejected,
            hour_change: 0,
            remark,
            changed_at: ctx.now(),
            ..entry
        },
        Decision::Approve => {
            if hours < 0 {
                return Err(LedgerError::Validation(format!(
                    "certificate hours must not be negative, got {hours}"
                )));
            }
            let student = ctx
                .bounded("student lookup", ctx.store.student(student_id))
                .await?
                .ok_or_else(|| LedgerError::not_found("student", student_id))?;
            let cap = ctx.settings.certificate_cap(entry.skill_type, &student.major);
            let filter = LedgerFilter {
                student_id: Some(student_id),
                source_type: Some(SourceType::Certificate),
                skill_type: Some(entry.skill_type),
                statuses: vec![LedgerStatus::Approved],
                ..Default::default()
            };
            let used: i32 = ctx
                .bounded("ledger query", ctx.store.ledger_entries(&filter))
                .await?
                .iter()
                .filter(|e| e.source_id != certificate_id)
                .map(|e| e.hour_change)
                .sum();
            let credit = capped_credit(hours, used, cap);
            let remark = if credit < hours {
                format!("credited {credit} of {hours} hours, {} cap is {cap}", entry.skill_type)
            } else {
                String::new()
            };
            LedgerEntry {
                status: LedgerStatus::Approved,
                hour_change: credit,
                remark,
                changed_at: ctx.now(),
                ..entry
            }
        }
    };

    let stored = ctx
        .bounded("ledger upsert", ctx.store.upsert_ledger_entry(&updated))
        .await?;
    info!(
        %certificate_id,
        %student_id,
        status = %stored.status,
        hour_change = stored.hour_change,
        "certificate decided"
    );
    Ok(stored)
}
