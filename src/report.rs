use std::collections::HashMap;
use std::fmt::Write;

use uuid::Uuid;

use crate::context::Context;
use crate::enrollment::load_program;
use crate::error::Result;
use crate::models::{LedgerEntry, LedgerFilter, LedgerStatus, Program, SourceType, SummaryRow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeSummary {
    pub status: LedgerStatus,
    pub count: usize,
    pub total_hours: i64,
}

pub fn summarize_outcomes(entries: &[LedgerEntry]) -> Vec<OutcomeSummary> {
    let mut map: HashMap<LedgerStatus, (usize, i64)> = HashMap::new();

    for entry in entries {
        let slot = map.entry(entry.status).or_insert((0, 0));
        slot.0 += 1;
        slot.1 += i64::from(entry.hour_change);
    }

    let mut summaries: Vec<OutcomeSummary> = map
        .into_iter()
        .map(|(status, (count, total_hours))| OutcomeSummary {
            status,
            count,
            total_hours,
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then(a.status.as_str().cmp(b.status.as_str())));
    summaries
}

pub fn build_report(
    program: &Program,
    rows: &[SummaryRow],
    entries: &[LedgerEntry],
    food_votes: &[(String, i64)],
) -> String {
    let outcomes = summarize_outcomes(entries);
    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Report: {}", program.name);
    let _ = writeln!(
        output,
        "{} skill program, state {}, enrollment closes {}",
        program.skill, program.state, program.enroll_deadline
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Daily Summary");

    if rows.is_empty() {
        let _ = writeln!(output, "No scheduled dates have registrations yet.");
    } else {
        let _ = writeln!(
            output,
            "| date | registered | on time | late | checked out | not participating |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|");
        for row in rows {
            let marker = if row.is_reconciled() { "" } else { " (unreconciled)" };
            let _ = writeln!(
                output,
                "| {}{} | {} | {} | {} | {} | {} |",
                row.date,
                marker,
                row.registered,
                row.checkin,
                row.checkin_late,
                row.checkout,
                row.not_participating
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Ledger Outcomes");

    if outcomes.is_empty() {
        let _ = writeln!(output, "No ledger entries for this program.");
    } else {
        for outcome in &outcomes {
            let _ = writeln!(
                output,
                "- {}: {} entries, {:+} hours",
                outcome.status, outcome.count, outcome.total_hours
            );
        }
    }

    let mut votes = food_votes.to_vec();
    votes.retain(|(_, count)| *count > 0);
    votes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Food Votes");

    if votes.is_empty() {
        let _ = writeln!(output, "No food choices recorded.");
    } else {
        for (food, count) in votes.iter().take(5) {
            let _ = writeln!(output, "- {food}: {count}");
        }
    }

    output
}

pub async fn program_report(ctx: &Context, program_id: Uuid) -> Result<String> {
    let program = load_program(ctx, program_id).await?;
    let rows = ctx
        .bounded("summary lookup", ctx.store.summary_rows(program_id))
        .await?;
    let filter = LedgerFilter {
        source_type: Some(SourceType::Program),
        source_id: Some(program_id),
        ..Default::default()
    };
    let entries = ctx
        .bounded("ledger query", ctx.store.ledger_entries(&filter))
        .await?;
    let votes = ctx
        .bounded("food votes", ctx.store.food_votes(program_id))
        .await?;
    Ok(build_report(&program, &rows, &entries, &votes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProgramState, SkillType};
    use chrono::{NaiveDate, Utc};

    fn entry(status: LedgerStatus, hours: i32) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            skill_type: SkillType::Soft,
            hour_change: hours,
            status,
            title: "Leadership Camp (Day 1)".to_string(),
            remark: String::new(),
            source_type: SourceType::Program,
            source_id: Uuid::new_v4(),
            enrollment_id: Some(Uuid::new_v4()),
            changed_at: Utc::now(),
        }
    }

    #[test]
    fn outcomes_are_grouped_by_status() {
        let entries = vec![
            entry(LedgerStatus::Attended, 4),
            entry(LedgerStatus::Attended, 4),
            entry(LedgerStatus::Partial, -4),
        ];
        let summaries = summarize_outcomes(&entries);
        assert_eq!(summaries[0].status, LedgerStatus::Attended);
        assert_eq!(summaries[0].count, 2);
        assert_eq!(summaries[0].total_hours, 8);
        assert_eq!(summaries[1].total_hours, -4);
    }

    #[test]
    fn report_lists_rows_outcomes_and_votes() {
        let program = Program {
            id: Uuid::new_v4(),
            name: "Leadership Camp".to_string(),
            skill: SkillType::Soft,
            state: ProgramState::Complete,
            enroll_deadline: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
        };
        let mut row = SummaryRow::empty(program.id, NaiveDate::from_ymd_opt(2025, 3, 15).unwrap());
        row.registered = 2;
        row.checkin = 1;
        row.recalculate();

        let report = build_report(
            &program,
            &[row],
            &[entry(LedgerStatus::Attended, 4)],
            &[("Pad Thai".to_string(), 2), ("Salad".to_string(), 0)],
        );
        assert!(report.contains("# Attendance Report: Leadership Camp"));
        assert!(report.contains("| 2025-03-15 | 2 | 1 | 0 | 0 | 1 |"));
        assert!(report.contains("- attended: 1 entries, +4 hours"));
        assert!(report.contains("- Pad Thai: 2"));
        assert!(!report.contains("Salad"));
    }
}
