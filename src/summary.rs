use chrono::NaiveDate;
use tracing::warn;
use uuid::Uuid;

use crate::classifier::CheckinBucket;
use crate::context::Context;
use crate::error::{PartialFailure, Result};
use crate::models::{ScheduledItem, SummaryDelta, SummaryRow};

pub type Migration = Vec<(NaiveDate, SummaryDelta)>;

fn checkin_delta(bucket: CheckinBucket, by: i64) -> SummaryDelta {
    match bucket {
        CheckinBucket::OnTime => SummaryDelta {
            checkin: by,
            ..Default::default()
        },
        CheckinBucket::Late => SummaryDelta {
            checkin_late: by,
            ..Default::default()
        },
    }
}

fn checkout_delta(by: i64) -> SummaryDelta {
    SummaryDelta {
        checkout: by,
        ..Default::default()
    }
}

/// Counter moves for one check-in edit, old day first.
pub fn plan_checkin_migration(
    old: Option<(NaiveDate, CheckinBucket)>,
    new: Option<(NaiveDate, CheckinBucket)>,
) -> Migration {
    match (old, new) {
        (None, None) => Vec::new(),
        (Some(old), Some(new)) if old == new => Vec::new(),
        (Some((old_day, old_bucket)), Some((new_day, new_bucket))) if old_day == new_day => {
            let mut delta = checkin_delta(old_bucket, -1);
            let add = checkin_delta(new_bucket, 1);
            delta.checkin += add.checkin;
            delta.checkin_late += add.checkin_late;
            vec![(old_day, delta)]
        }
        (old, new) => old
            .map(|(day, bucket)| (day, checkin_delta(bucket, -1)))
            .into_iter()
            .chain(new.map(|(day, bucket)| (day, checkin_delta(bucket, 1))))
            .collect(),
    }
}

pub fn plan_checkout_migration(old: Option<NaiveDate>, new: Option<NaiveDate>) -> Migration {
    if old == new {
        return Vec::new();
    }
    old.map(|day| (day, checkout_delta(-1)))
        .into_iter()
        .chain(new.map(|day| (day, checkout_delta(1))))
        .collect()
}

pub async fn adjust_checkin(
    ctx: &Context,
    program_id: Uuid,
    date: NaiveDate,
    delta: i64,
    bucket: CheckinBucket,
) -> Result<SummaryRow> {
    increment(ctx, program_id, date, checkin_delta(bucket, delta)).await
}

pub async fn adjust_checkout(
    ctx: &Context,
    program_id: Uuid,
    date: NaiveDate,
    delta: i64,
) -> Result<SummaryRow> {
    increment(ctx, program_id, date, checkout_delta(delta)).await
}

pub async fn adjust_registered(
    ctx: &Context,
    item: &ScheduledItem,
    date: NaiveDate,
    delta: i64,
) -> Result<SummaryRow> {
    increment(
        ctx,
        item.program_id,
        date,
        SummaryDelta {
            registered: delta,
            ..Default::default()
        },
    )
    .await
}

pub async fn recalculate(
    ctx: &Context,
    program_id: Uuid,
    date: NaiveDate,
) -> Result<Option<SummaryRow>> {
    ctx.bounded(
        "summary recalculate",
        ctx.store.recalculate_summary(program_id, date),
    )
    .await
}

async fn increment(
    ctx: &Context,
    program_id: Uuid,
    date: NaiveDate,
    delta: SummaryDelta,
) -> Result<SummaryRow> {
    ctx.bounded(
        "summary increment",
        ctx.store.increment_summary(program_id, date, delta),
    )
    .await
}

/// Single-counter moves go through the named adjusters; mixed deltas are
/// applied as one atomic increment.
async fn adjust(
    ctx: &Context,
    program_id: Uuid,
    date: NaiveDate,
    delta: SummaryDelta,
) -> Result<SummaryRow> {
    match delta {
        SummaryDelta {
            registered: 0,
            checkin: 0,
            checkin_late: 0,
            checkout,
        } => adjust_checkout(ctx, program_id, date, checkout).await,
        SummaryDelta {
            registered: 0,
            checkin,
            checkin_late: 0,
            checkout: 0,
        } => adjust_checkin(ctx, program_id, date, checkin, CheckinBucket::OnTime).await,
        SummaryDelta {
            registered: 0,
            checkin: 0,
            checkin_late,
            checkout: 0,
        } => adjust_checkin(ctx, program_id, date, checkin_late, CheckinBucket::Late).await,
        _ => increment(ctx, program_id, date, delta).await,
    }
}

/// Applies a migration day by day, each followed by a recalculation.
/// Failures are logged and returned instead of aborting the caller.
pub async fn apply(ctx: &Context, program_id: Uuid, migration: &Migration) -> Vec<PartialFailure> {
    let mut failures = Vec::new();
    for (date, delta) in migration {
        if delta.is_zero() {
            continue;
        }
        let target = format!("summary {program_id}/{date}");
        if let Err(err) = adjust(ctx, program_id, *date, *delta).await {
            warn!(%program_id, %date, error = %err, "summary increment failed");
            failures.push(PartialFailure::new(&target, "increment", &err));
            continue;
        }
        if let Err(err) = recalculate(ctx, program_id, *date).await {
            warn!(%program_id, %date, error = %err, "summary recalculate failed");
            failures.push(PartialFailure::new(&target, "recalculate", &err));
        }
    }
    failures
}
