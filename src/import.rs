use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{LedgerError, Result};
use crate::models::{LedgerEntry, LedgerStatus, SkillType, SourceType};

#[derive(Debug, Deserialize)]
struct CsvRow {
    student_code: String,
    skill_type: String,
    hours: i32,
    title: String,
    remark: Option<String>,
    source_key: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub read: usize,
    pub inserted: usize,
    pub unknown_students: Vec<String>,
}

/// Stable source id so the same row always maps to the same ledger key.
fn source_id(row: &CsvRow) -> Uuid {
    let key = match row.source_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => format!(
            "{}|{}|{}|{}",
            row.student_code.trim(),
            row.skill_type.trim(),
            row.hours,
            row.title.trim()
        ),
    };
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

pub async fn import_hours(ctx: &Context, csv_path: &Path) -> Result<ImportReport> {
    let file = std::fs::File::open(csv_path)
        .map_err(|err| LedgerError::Validation(format!("{}: {err}", csv_path.display())))?;
    import_hours_from(ctx, file).await
}

/// Bulk-loads approved `legacy_import` entries. Rows already imported are
/// skipped, so a file can be re-run safely.
pub async fn import_hours_from<R: Read>(ctx: &Context, input: R) -> Result<ImportReport> {
    let mut reader = csv::Reader::from_reader(input);
    let mut report = ImportReport::default();
    let mut entries = Vec::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result.map_err(|err| LedgerError::Validation(format!("csv: {err}")))?;
        report.read += 1;
        let skill: SkillType = row.skill_type.parse()?;
        let code = row.student_code.trim();
        let Some(student) = ctx
            .bounded("student lookup", ctx.store.student_by_code(code))
            .await?
        else {
            warn!(student_code = code, "legacy row for unknown student skipped");
            report.unknown_students.push(code.to_string());
            continue;
        };

        entries.push(LedgerEntry {
            id: Uuid::new_v4(),
            student_id: student.id,
            skill_type: skill,
            hour_change: row.hours,
            status: LedgerStatus::Approved,
            title: row.title.trim().to_string(),
            remark: row.remark.clone().unwrap_or_default(),
            source_type: SourceType::LegacyImport,
            source_id: source_id(&row),
            enrollment_id: None,
            changed_at: ctx.now(),
        });
    }

    report.inserted = ctx
        .bounded("ledger bulk insert", ctx.store.insert_ledger_entries(&entries))
        .await?;
    info!(
        read = report.read,
        inserted = report.inserted,
        unknown = report.unknown_students.len(),
        "legacy hours imported"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger;
    use crate::testing::harness;

    const CSV: &str = "\
student_code,skill_type,hours,title,remark,source_key
65160001,soft,12,Volunteer camp 2023,,legacy-001
65160001,hard,6,Hackathon 2023,top 10,legacy-002
99999999,soft,3,Orientation,,legacy-003
";

    #[tokio::test]
    async fn import_is_idempotent_and_counts_toward_balance() {
        let h = harness().await;
        let student = h.student("65160001", "SE", 3).await;

        let first = import_hours_from(&h.ctx, CSV.as_bytes()).await.unwrap();
        assert_eq!(first.read, 3);
        assert_eq!(first.inserted, 2);
        assert_eq!(first.unknown_students, vec!["99999999".to_string()]);

        let second = import_hours_from(&h.ctx, CSV.as_bytes()).await.unwrap();
        assert_eq!(second.inserted, 0);

        let balance = ledger::student_hours(&h.ctx, student.id).await.unwrap();
        assert_eq!((balance.soft, balance.hard), (12, 6));
        assert_eq!(balance.standing, ledger::Standing::VeryLow);
    }

    #[tokio::test]
    async fn unknown_skill_types_fail_the_import() {
        let h = harness().await;
        h.student("65160001", "SE", 3).await;
        let csv = "student_code,skill_type,hours,title,remark,source_key\n65160001,social,1,x,,\n";
        let err = import_hours_from(&h.ctx, csv.as_bytes()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
