use chrono::NaiveDate;
use tracing::info;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{LedgerError, Result};
use crate::lifecycle;
use crate::models::{
    DateWindow, Eligibility, Program, ProgramState, ScheduledItem, SkillType, Student,
};

const PROGRAM_ID: Uuid = Uuid::from_u128(0x3d7f5d6f_24f7_4e8e_8b4b_3e7e44b4a7b2);
const CAMP_ITEM_ID: Uuid = Uuid::from_u128(0x0c22f1f1_9184_4fd4_9b21_28c68a6a89dc);
const WORKSHOP_ITEM_ID: Uuid = Uuid::from_u128(0xd5a0a1a2_2a3c_44c2_8f73_60b7897a9dd2);

#[derive(Debug, Default)]
pub struct SeedReport {
    pub program: Option<Program>,
    pub items: Vec<ScheduledItem>,
    pub students: Vec<Student>,
}

fn windows(specs: &[&str]) -> Result<Vec<DateWindow>> {
    specs.iter().map(|spec| spec.parse()).collect()
}

fn date(y: i32, m: u32, d: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
        .ok_or_else(|| LedgerError::Validation(format!("invalid seed date {y}-{m}-{d}")))
}

/// Demo program, items and students. Safe to run repeatedly: fixed ids are
/// upserted and an existing program keeps its current state.
pub async fn seed(ctx: &Context) -> Result<SeedReport> {
    let mut report = SeedReport::default();

    let students = [
        (Uuid::from_u128(0x8a1e0c52_51b4_4d0f_9a51_7f2c0d8e6a01), "65160001", "Avery Lee", "SE", 2),
        (Uuid::from_u128(0x8a1e0c52_51b4_4d0f_9a51_7f2c0d8e6a02), "65160002", "Jules Moreno", "CS", 3),
        (Uuid::from_u128(0x8a1e0c52_51b4_4d0f_9a51_7f2c0d8e6a03), "65160003", "Kiara Patel", "AAI", 1),
        (Uuid::from_u128(0x8a1e0c52_51b4_4d0f_9a51_7f2c0d8e6a04), "65160004", "Noor Haddad", "ITDI", 4),
    ];
    for (id, code, name, major, year) in students {
        let student = Student {
            id,
            code: code.to_string(),
            name: name.to_string(),
            major: major.to_string(),
            year,
        };
        let stored = ctx
            .bounded("student upsert", ctx.store.upsert_student(&student))
            .await?;
        report.students.push(stored);
    }

    let existing = ctx
        .bounded("program lookup", ctx.store.program(PROGRAM_ID))
        .await?;
    let program = Program {
        id: PROGRAM_ID,
        name: "Leadership Camp 2025".to_string(),
        skill: SkillType::Soft,
        state: existing.map_or(ProgramState::Open, |p| p.state),
        enroll_deadline: date(2025, 3, 14)?,
    };
    ctx.bounded("program upsert", ctx.store.upsert_program(&program))
        .await?;

    let items = [
        ScheduledItem {
            id: CAMP_ITEM_ID,
            program_id: PROGRAM_ID,
            name: "Day camp".to_string(),
            capacity: Some(40),
            eligibility: Eligibility::default(),
            windows: windows(&["2025-03-15 09:00-12:00 4", "2025-03-16 09:00-12:00 4"])?,
        },
        ScheduledItem {
            id: WORKSHOP_ITEM_ID,
            program_id: PROGRAM_ID,
            name: "Evening workshop".to_string(),
            capacity: Some(20),
            eligibility: Eligibility {
                majors: vec!["SE".to_string(), "CS".to_string(), "AAI".to_string()],
                years: vec![],
            },
            windows: windows(&["2025-03-15 18:00-20:00 2"])?,
        },
    ];
    for item in items {
        ctx.bounded("item upsert", ctx.store.upsert_item(&item))
            .await?;
        report.items.push(item);
    }

    lifecycle::schedule_changed(ctx, PROGRAM_ID).await?;
    info!(
        program_id = %PROGRAM_ID,
        students = report.students.len(),
        items = report.items.len(),
        "seed data loaded"
    );
    report.program = Some(program);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;

    #[tokio::test]
    async fn seeding_twice_keeps_one_program_and_its_state() {
        let h = harness().await;
        let first = seed(&h.ctx).await.unwrap();
        assert_eq!(first.students.len(), 4);
        assert_eq!(h.ctx.queue.list(Some(PROGRAM_ID)).await.unwrap().len(), 2);

        h.ctx
            .store
            .set_program_state(PROGRAM_ID, ProgramState::Close)
            .await
            .unwrap();
        seed(&h.ctx).await.unwrap();

        let program = h.ctx.store.program(PROGRAM_ID).await.unwrap().unwrap();
        assert_eq!(program.state, ProgramState::Close);
        assert_eq!(h.ctx.store.items_for_program(PROGRAM_ID).await.unwrap().len(), 2);
    }
}
