use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    CheckInOutRecord, DateWindow, Enrollment, LedgerEntry, LedgerFilter, Program, ProgramState,
    ScheduledItem, Student, SummaryDelta, SummaryRow,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Persistence for schedules, enrollments, ledger entries and summary rows.
///
/// Counter updates, registration and attendance saves are atomic at this
/// layer; everything the engine builds on top is a sequence of these
/// independent calls.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_student(&self, student: &Student) -> Result<Student>;
    async fn student(&self, id: Uuid) -> Result<Option<Student>>;
    async fn student_by_code(&self, code: &str) -> Result<Option<Student>>;

    async fn upsert_program(&self, program: &Program) -> Result<()>;
    async fn program(&self, id: Uuid) -> Result<Option<Program>>;
    async fn set_program_state(&self, id: Uuid, state: ProgramState) -> Result<bool>;
    async fn set_enroll_deadline(&self, id: Uuid, deadline: NaiveDate) -> Result<bool>;
    /// Removes the program with its items, enrollments, summary rows, food
    /// votes and program ledger entries.
    async fn delete_program(&self, id: Uuid) -> Result<bool>;

    async fn upsert_item(&self, item: &ScheduledItem) -> Result<()>;
    async fn item(&self, id: Uuid) -> Result<Option<ScheduledItem>>;
    async fn items_for_program(&self, program_id: Uuid) -> Result<Vec<ScheduledItem>>;
    async fn set_item_windows(&self, item_id: Uuid, windows: &[DateWindow]) -> Result<bool>;

    /// Inserts the enrollment after checking, atomically with the insert,
    /// that the student is not already enrolled, that no window overlaps
    /// another enrollment in an active program and that the item has room.
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<()>;
    async fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>>;
    async fn enrollments_for_item(&self, item_id: Uuid) -> Result<Vec<Enrollment>>;
    async fn enrollments_for_program(&self, program_id: Uuid) -> Result<Vec<Enrollment>>;
    /// Deletes the enrollment and its records, returning what was removed.
    async fn delete_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>>;
    /// Replaces the record on `date` with `record`, which is keyed by its own
    /// date. Fails with `Conflict::StaleAttendance` and writes nothing when the
    /// stored record on `date` is no longer `expected`, or when `record` moves
    /// onto a date that is already taken.
    async fn save_attendance(
        &self,
        enrollment_id: Uuid,
        date: NaiveDate,
        expected: Option<&CheckInOutRecord>,
        record: Option<&CheckInOutRecord>,
    ) -> Result<()>;

    async fn adjust_food_vote(&self, program_id: Uuid, food: &str, delta: i64) -> Result<()>;
    async fn food_votes(&self, program_id: Uuid) -> Result<Vec<(String, i64)>>;

    /// Atomic increment of a summary row, creating it on first touch.
    async fn increment_summary(
        &self,
        program_id: Uuid,
        date: NaiveDate,
        delta: SummaryDelta,
    ) -> Result<SummaryRow>;
    async fn recalculate_summary(
        &self,
        program_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<SummaryRow>>;
    async fn summary_rows(&self, program_id: Uuid) -> Result<Vec<SummaryRow>>;
    async fn delete_summary_rows(&self, program_id: Uuid, dates: &[NaiveDate]) -> Result<u64>;

    /// Insert or update by `LedgerEntry::key`; an existing entry keeps its id.
    async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> Result<LedgerEntry>;
    async fn ledger_entry(&self, id: Uuid) -> Result<Option<LedgerEntry>>;
    async fn ledger_entry_by_key(&self, key: &str) -> Result<Option<LedgerEntry>>;
    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>>;
    async fn delete_ledger_entries_for_enrollment(&self, enrollment_id: Uuid) -> Result<u64>;
    /// Bulk insert that skips entries whose key already exists.
    async fn insert_ledger_entries(&self, entries: &[LedgerEntry]) -> Result<usize>;
}

pub(crate) fn overlaps_any(windows: &[DateWindow], others: &[DateWindow]) -> bool {
    windows
        .iter()
        .any(|w| others.iter().any(|other| w.overlaps(other)))
}
