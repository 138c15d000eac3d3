//! Shared fixtures for in-memory engine tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

use crate::clock::{at_local, ManualClock};
use crate::config::Settings;
use crate::context::Context;
use crate::error::{LedgerError, Result};
use crate::models::{
    program_entry_key, CheckInOutRecord, DateWindow, Eligibility, Enrollment, LedgerEntry,
    LedgerFilter, Program, ProgramState, ScheduledItem, SkillType, Student, SummaryDelta,
    SummaryRow,
};
use crate::programs;
use crate::queue::MemoryQueue;
use crate::store::{MemoryStore, Store};

pub struct Harness {
    pub ctx: Context,
    pub clock: Arc<ManualClock>,
}

/// Fresh in-memory context with the clock at 2025-03-01 08:00 local.
pub async fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new())).await
}

/// Like [`harness`], but every store call yields first and can be made to
/// fail on demand.
pub async fn faulty_harness() -> (Harness, Arc<FaultyStore>) {
    let store = Arc::new(FaultyStore::default());
    (harness_with(store.clone()).await, store)
}

async fn harness_with(store: Arc<dyn Store>) -> Harness {
    let settings = Settings::default();
    let tz = settings.timezone().unwrap();
    let start = at_local(
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        tz,
    );
    let clock = Arc::new(ManualClock::new(start));
    let ctx = Context::new(
        store,
        Arc::new(MemoryQueue::new()),
        clock.clone(),
        settings,
    )
    .unwrap();
    Harness { ctx, clock }
}

/// `hour:minute` on `date` in the default UTC+7 calendar.
pub fn local(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let tz = Settings::default().timezone().unwrap();
    at_local(date, NaiveTime::from_hms_opt(hour, minute, 0).unwrap(), tz)
}

impl Harness {
    pub async fn student(&self, code: &str, major: &str, year: i32) -> Student {
        let student = Student {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: format!("Student {code}"),
            major: major.to_string(),
            year,
        };
        self.ctx.store.upsert_student(&student).await.unwrap()
    }

    /// One-item program whose enrollment closes the day before its first
    /// window.
    pub async fn program(
        &self,
        state: ProgramState,
        capacity: Option<i64>,
        windows: &[&str],
    ) -> (Program, ScheduledItem) {
        self.program_with(state, capacity, Eligibility::default(), windows)
            .await
    }

    pub async fn restricted_program(
        &self,
        majors: &[&str],
        windows: &[&str],
    ) -> (Program, ScheduledItem) {
        let eligibility = Eligibility {
            majors: majors.iter().map(|m| m.to_string()).collect(),
            years: vec![],
        };
        self.program_with(ProgramState::Open, None, eligibility, windows)
            .await
    }

    async fn program_with(
        &self,
        state: ProgramState,
        capacity: Option<i64>,
        eligibility: Eligibility,
        windows: &[&str],
    ) -> (Program, ScheduledItem) {
        let windows: Vec<DateWindow> = windows.iter().map(|w| w.parse().unwrap()).collect();
        let first = windows.iter().map(|w| w.date).min().unwrap();
        let mut program = programs::create_program(
            &self.ctx,
            "Leadership Camp",
            SkillType::Soft,
            first - Duration::days(1),
        )
        .await
        .unwrap();
        let item = programs::add_item(&self.ctx, program.id, "Main session", capacity, eligibility, windows)
            .await
            .unwrap();
        if state != ProgramState::Planning {
            self.ctx
                .store
                .set_program_state(program.id, state)
                .await
                .unwrap();
            program.state = state;
        }
        (program, item)
    }

    pub async fn row(&self, program_id: Uuid, date: NaiveDate) -> SummaryRow {
        self.ctx
            .store
            .summary_rows(program_id)
            .await
            .unwrap()
            .into_iter()
            .find(|row| row.date == date)
            .unwrap_or_else(|| panic!("no summary row for {date}"))
    }

    pub async fn entry(&self, enrollment: &Enrollment) -> Option<LedgerEntry> {
        let key = program_entry_key(enrollment.program_id, enrollment.id);
        self.ctx.store.ledger_entry_by_key(&key).await.unwrap()
    }
}

/// Memory store that yields to the scheduler before each call, so joined
/// requests interleave between store round trips, and fails armed calls with
/// a timeout.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    armed: Mutex<HashMap<&'static str, usize>>,
}

impl FaultyStore {
    /// Fails the next `times` calls of the store method named `op`.
    pub fn fail(&self, op: &'static str, times: usize) {
        *self.armed.lock().unwrap().entry(op).or_default() += times;
    }

    async fn enter(&self, op: &'static str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut armed = self.armed.lock().unwrap();
        match armed.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(LedgerError::Timeout(op))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn upsert_student(&self, student: &Student) -> Result<Student> {
        self.enter("upsert_student").await?;
        self.inner.upsert_student(student).await
    }

    async fn student(&self, id: Uuid) -> Result<Option<Student>> {
        self.enter("student").await?;
        self.inner.student(id).await
    }

    async fn student_by_code(&self, code: &str) -> Result<Option<Student>> {
        self.enter("student_by_code").await?;
        self.inner.student_by_code(code).await
    }

    async fn upsert_program(&self, program: &Program) -> Result<()> {
        self.enter("upsert_program").await?;
        self.inner.upsert_program(program).await
    }

    async fn program(&self, id: Uuid) -> Result<Option<Program>> {
        self.enter("program").await?;
        self.inner.program(id).await
    }

    async fn set_program_state(&self, id: Uuid, state: ProgramState) -> Result<bool> {
        self.enter("set_program_state").await?;
        self.inner.set_program_state(id, state).await
    }

    async fn set_enroll_deadline(&self, id: Uuid, deadline: NaiveDate) -> Result<bool> {
        self.enter("set_enroll_deadline").await?;
        self.inner.set_enroll_deadline(id, deadline).await
    }

    async fn delete_program(&self, id: Uuid) -> Result<bool> {
        self.enter("delete_program").await?;
        self.inner.delete_program(id).await
    }

    async fn upsert_item(&self, item: &ScheduledItem) -> Result<()> {
        self.enter("upsert_item").await?;
        self.inner.upsert_item(item).await
    }

    async fn item(&self, id: Uuid) -> Result<Option<ScheduledItem>> {
        self.enter("item").await?;
        self.inner.item(id).await
    }

    async fn items_for_program(&self, program_id: Uuid) -> Result<Vec<ScheduledItem>> {
        self.enter("items_for_program").await?;
        self.inner.items_for_program(program_id).await
    }

    async fn set_item_windows(&self, item_id: Uuid, windows: &[DateWindow]) -> Result<bool> {
        self.enter("set_item_windows").await?;
        self.inner.set_item_windows(item_id, windows).await
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
        self.enter("insert_enrollment").await?;
        self.inner.insert_enrollment(enrollment).await
    }

    async fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        self.enter("enrollment").await?;
        self.inner.enrollment(id).await
    }

    async fn enrollments_for_item(&self, item_id: Uuid) -> Result<Vec<Enrollment>> {
        self.enter("enrollments_for_item").await?;
        self.inner.enrollments_for_item(item_id).await
    }

    async fn enrollments_for_program(&self, program_id: Uuid) -> Result<Vec<Enrollment>> {
        self.enter("enrollments_for_program").await?;
        self.inner.enrollments_for_program(program_id).await
    }

    async fn delete_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        self.enter("delete_enrollment").await?;
        self.inner.delete_enrollment(id).await
    }

    async fn save_attendance(
        &self,
        enrollment_id: Uuid,
        date: NaiveDate,
        expected: Option<&CheckInOutRecord>,
        record: Option<&CheckInOutRecord>,
    ) -> Result<()> {
        self.enter("save_attendance").await?;
        self.inner
            .save_attendance(enrollment_id, date, expected, record)
            .await
    }

    async fn adjust_food_vote(&self, program_id: Uuid, food: &str, delta: i64) -> Result<()> {
        self.enter("adjust_food_vote").await?;
        self.inner.adjust_food_vote(program_id, food, delta).await
    }

    async fn food_votes(&self, program_id: Uuid) -> Result<Vec<(String, i64)>> {
        self.enter("food_votes").await?;
        self.inner.food_votes(program_id).await
    }

    async fn increment_summary(
        &self,
        program_id: Uuid,
        date: NaiveDate,
        delta: SummaryDelta,
    ) -> Result<SummaryRow> {
        self.enter("increment_summary").await?;
        self.inner.increment_summary(program_id, date, delta).await
    }

    async fn recalculate_summary(
        &self,
        program_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<SummaryRow>> {
        self.enter("recalculate_summary").await?;
        self.inner.recalculate_summary(program_id, date).await
    }

    async fn summary_rows(&self, program_id: Uuid) -> Result<Vec<SummaryRow>> {
        self.enter("summary_rows").await?;
        self.inner.summary_rows(program_id).await
    }

    async fn delete_summary_rows(&self, program_id: Uuid, dates: &[NaiveDate]) -> Result<u64> {
        self.enter("delete_summary_rows").await?;
        self.inner.delete_summary_rows(program_id, dates).await
    }

    async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        self.enter("upsert_ledger_entry").await?;
        self.inner.upsert_ledger_entry(entry).await
    }

    async fn ledger_entry(&self, id: Uuid) -> Result<Option<LedgerEntry>> {
        self.enter("ledger_entry").await?;
        self.inner.ledger_entry(id).await
    }

    async fn ledger_entry_by_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        self.enter("ledger_entry_by_key").await?;
        self.inner.ledger_entry_by_key(key).await
    }

    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        self.enter("ledger_entries").await?;
        self.inner.ledger_entries(filter).await
    }

    async fn delete_ledger_entries_for_enrollment(&self, enrollment_id: Uuid) -> Result<u64> {
        self.enter("delete_ledger_entries_for_enrollment").await?;
        self.inner
            .delete_ledger_entries_for_enrollment(enrollment_id)
            .await
    }

    async fn insert_ledger_entries(&self, entries: &[LedgerEntry]) -> Result<usize> {
        self.enter("insert_ledger_entries").await?;
        self.inner.insert_ledger_entries(entries).await
    }
}
