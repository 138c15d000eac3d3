use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{overlaps_any, Store};
use crate::error::{Conflict, LedgerError, Result};
use crate::models::{
    CheckInOutRecord, DateWindow, Enrollment, LedgerEntry, LedgerFilter, Program, ProgramState,
    ScheduledItem, SourceType, Student, SummaryDelta, SummaryRow,
};

#[derive(Default)]
struct State {
    students: HashMap<Uuid, Student>,
    programs: HashMap<Uuid, Program>,
    items: HashMap<Uuid, ScheduledItem>,
    enrollments: HashMap<Uuid, Enrollment>,
    food_votes: BTreeMap<(Uuid, String), i64>,
    summary: BTreeMap<(Uuid, NaiveDate), SummaryRow>,
    ledger: HashMap<String, LedgerEntry>,
}

/// In-process store behind a single mutex, so every call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_enrollments<'a>(iter: impl Iterator<Item = &'a Enrollment>) -> Vec<Enrollment> {
    let mut out: Vec<Enrollment> = iter.cloned().collect();
    out.sort_by_key(|e| (e.registered_at, e.id));
    out
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_student(&self, student: &Student) -> Result<Student> {
        let mut state = self.state.lock().await;
        let existing = state
            .students
            .values()
            .find(|s| s.code == student.code)
            .map(|s| s.id);
        let stored = Student {
            id: existing.unwrap_or(student.id),
            ..student.clone()
        };
        state.students.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn student(&self, id: Uuid) -> Result<Option<Student>> {
        Ok(self.state.lock().await.students.get(&id).cloned())
    }

    async fn student_by_code(&self, code: &str) -> Result<Option<Student>> {
        let state = self.state.lock().await;
        Ok(state.students.values().find(|s| s.code == code).cloned())
    }

    async fn upsert_program(&self, program: &Program) -> Result<()> {
        let mut state = self.state.lock().await;
        state.programs.insert(program.id, program.clone());
        Ok(())
    }

    async fn program(&self, id: Uuid) -> Result<Option<Program>> {
        Ok(self.state.lock().await.programs.get(&id).cloned())
    }

    async fn set_program_state(&self, id: Uuid, value: ProgramState) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.programs.get_mut(&id) {
            Some(program) => {
                program.state = value;
                true
            }
            None => false,
        })
    }

    async fn set_enroll_deadline(&self, id: Uuid, deadline: NaiveDate) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.programs.get_mut(&id) {
            Some(program) => {
                program.enroll_deadline = deadline;
                true
            }
            None => false,
        })
    }

    async fn delete_program(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.programs.remove(&id).is_none() {
            return Ok(false);
        }
        state.items.retain(|_, item| item.program_id != id);
        state.enrollments.retain(|_, e| e.program_id != id);
        state.food_votes.retain(|(program_id, _), _| *program_id != id);
        state.summary.retain(|(program_id, _), _| *program_id != id);
        state
            .ledger
            .retain(|_, entry| !(entry.source_type == SourceType::Program && entry.source_id == id));
        Ok(true)
    }

    async fn upsert_item(&self, item: &ScheduledItem) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.programs.contains_key(&item.program_id) {
            return Err(LedgerError::not_found("program", item.program_id));
        }
        state.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn item(&self, id: Uuid) -> Result<Option<ScheduledItem>> {
        Ok(self.state.lock().await.items.get(&id).cloned())
    }

    async fn items_for_program(&self, program_id: Uuid) -> Result<Vec<ScheduledItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<ScheduledItem> = state
            .items
            .values()
            .filter(|item| item.program_id == program_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn set_item_windows(&self, item_id: Uuid, windows: &[DateWindow]) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.items.get_mut(&item_id) {
            Some(item) => {
                item.windows = windows.to_vec();
                true
            }
            None => false,
        })
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get(&enrollment.item_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("item", enrollment.item_id))?;

        if state
            .enrollments
            .values()
            .any(|e| e.student_id == enrollment.student_id && e.item_id == item.id)
        {
            return Err(Conflict::AlreadyEnrolled.into());
        }

        let clashes = state
            .enrollments
            .values()
            .filter(|e| e.student_id == enrollment.student_id)
            .filter(|e| {
                state
                    .programs
                    .get(&e.program_id)
                    .is_some_and(|p| p.state.is_active())
            })
            .filter_map(|e| state.items.get(&e.item_id))
            .any(|other| overlaps_any(&item.windows, &other.windows));
        if clashes {
            return Err(Conflict::ScheduleConflict.into());
        }

        if let Some(capacity) = item.capacity {
            let taken = state
                .enrollments
                .values()
                .filter(|e| e.item_id == item.id)
                .count() as i64;
            if taken >= capacity {
                return Err(Conflict::CapacityExceeded.into());
            }
        }

        state.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        Ok(self.state.lock().await.enrollments.get(&id).cloned())
    }

    async fn enrollments_for_item(&self, item_id: Uuid) -> Result<Vec<Enrollment>> {
        let state = self.state.lock().await;
        Ok(sorted_enrollments(
            state.enrollments.values().filter(|e| e.item_id == item_id),
        ))
    }

    async fn enrollments_for_program(&self, program_id: Uuid) -> Result<Vec<Enrollment>> {
        let state = self.state.lock().await;
        Ok(sorted_enrollments(
            state
                .enrollments
                .values()
                .filter(|e| e.program_id == program_id),
        ))
    }

    async fn delete_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        Ok(self.state.lock().await.enrollments.remove(&id))
    }

    async fn save_attendance(
        &self,
        enrollment_id: Uuid,
        date: NaiveDate,
        expected: Option<&CheckInOutRecord>,
        record: Option<&CheckInOutRecord>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let enrollment = state
            .enrollments
            .get_mut(&enrollment_id)
            .ok_or_else(|| LedgerError::not_found("enrollment", enrollment_id))?;
        if enrollment.record_on(date) != expected {
            return Err(Conflict::StaleAttendance.into());
        }
        if let Some(record) = record.filter(|r| r.date != date) {
            if enrollment.record_on(record.date).is_some() {
                return Err(Conflict::StaleAttendance.into());
            }
        }
        enrollment.records.retain(|r| r.date != date);
        if let Some(record) = record {
            enrollment.records.push(record.clone());
            enrollment.records.sort_by_key(|r| r.date);
        }
        Ok(())
    }

    async fn adjust_food_vote(&self, program_id: Uuid, food: &str, delta: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let votes = state
            .food_votes
            .entry((program_id, food.to_string()))
            .or_insert(0);
        *votes = (*votes + delta).max(0);
        Ok(())
    }

    async fn food_votes(&self, program_id: Uuid) -> Result<Vec<(String, i64)>> {
        let state = self.state.lock().await;
        Ok(state
            .food_votes
            .iter()
            .filter(|((id, _), _)| *id == program_id)
            .map(|((_, food), votes)| (food.clone(), *votes))
            .collect())
    }

    async fn increment_summary(
        &self,
        program_id: Uuid,
        date: NaiveDate,
        delta: SummaryDelta,
    ) -> Result<SummaryRow> {
        let mut state = self.state.lock().await;
        let row = state
            .summary
            .entry((program_id, date))
            .or_insert_with(|| SummaryRow::empty(program_id, date));
        row.apply(delta);
        Ok(*row)
    }

    async fn recalculate_summary(
        &self,
        program_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<SummaryRow>> {
        let mut state = self.state.lock().await;
        Ok(state.summary.get_mut(&(program_id, date)).map(|row| {
            row.recalculate();
            *row
        }))
    }

    async fn summary_rows(&self, program_id: Uuid) -> Result<Vec<SummaryRow>> {
        let state = self.state.lock().await;
        Ok(state
            .summary
            .values()
            .filter(|row| row.program_id == program_id)
            .copied()
            .collect())
    }

    async fn delete_summary_rows(&self, program_id: Uuid, dates: &[NaiveDate]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for date in dates {
            if state.summary.remove(&(program_id, *date)).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        let mut state = self.state.lock().await;
        let key = entry.key();
        let stored = match state.ledger.get(&key) {
            Some(existing) => LedgerEntry {
                id: existing.id,
                ..entry.clone()
            },
            None => entry.clone(),
        };
        state.ledger.insert(key, stored.clone());
        Ok(stored)
    }

    async fn ledger_entry(&self, id: Uuid) -> Result<Option<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state.ledger.values().find(|e| e.id == id).cloned())
    }

    async fn ledger_entry_by_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.state.lock().await.ledger.get(key).cloned())
    }

    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .ledger
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.changed_at, e.id));
        Ok(entries)
    }

    async fn delete_ledger_entries_for_enrollment(&self, enrollment_id: Uuid) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.ledger.len();
        state
            .ledger
            .retain(|_, e| e.enrollment_id != Some(enrollment_id));
        Ok((before - state.ledger.len()) as u64)
    }

    async fn insert_ledger_entries(&self, entries: &[LedgerEntry]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for entry in entries {
            let key = entry.key();
            if !state.ledger.contains_key(&key) {
                state.ledger.insert(key, entry.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn program(state: ProgramState) -> Program {
        Program {
            id: Uuid::new_v4(),
            name: "Leadership Camp".to_string(),
            skill: crate::models::SkillType::Soft,
            state,
            enroll_deadline: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
        }
    }

    fn item(program_id: Uuid, capacity: Option<i64>, window: &str) -> ScheduledItem {
        ScheduledItem {
            id: Uuid::new_v4(),
            program_id,
            name: "Morning session".to_string(),
            capacity,
            eligibility: Default::default(),
            windows: vec![window.parse().unwrap()],
        }
    }

    fn enrollment(student_id: Uuid, item: &ScheduledItem) -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            student_id,
            item_id: item.id,
            program_id: item.program_id,
            registered_at: Utc::now(),
            food: None,
            records: vec![],
        }
    }

    #[tokio::test]
    async fn registration_checks_duplicates_overlap_and_capacity() {
        let store = MemoryStore::new();
        let open = program(ProgramState::Open);
        store.upsert_program(&open).await.unwrap();
        let first = item(open.id, Some(1), "2025-03-15 09:00-12:00 4");
        let clashing = item(open.id, None, "2025-03-15 11:00-13:00 2");
        store.upsert_item(&first).await.unwrap();
        store.upsert_item(&clashing).await.unwrap();

        let student = Uuid::new_v4();
        store.insert_enrollment(&enrollment(student, &first)).await.unwrap();

        let err = store
            .insert_enrollment(&enrollment(student, &first))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(Conflict::AlreadyEnrolled)));

        let err = store
            .insert_enrollment(&enrollment(student, &clashing))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(Conflict::ScheduleConflict)));

        let err = store
            .insert_enrollment(&enrollment(Uuid::new_v4(), &first))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(Conflict::CapacityExceeded)));
    }

    #[tokio::test]
    async fn finished_programs_do_not_block_overlaps() {
        let store = MemoryStore::new();
        let done = program(ProgramState::Complete);
        let open = program(ProgramState::Open);
        store.upsert_program(&done).await.unwrap();
        store.upsert_program(&open).await.unwrap();
        let old = item(done.id, None, "2025-03-15 09:00-12:00 4");
        let new = item(open.id, None, "2025-03-15 09:00-12:00 4");
        store.upsert_item(&old).await.unwrap();
        store.upsert_item(&new).await.unwrap();

        let student = Uuid::new_v4();
        store.insert_enrollment(&enrollment(student, &old)).await.unwrap();
        store.insert_enrollment(&enrollment(student, &new)).await.unwrap();
    }

    #[tokio::test]
    async fn ledger_upsert_keeps_first_id() {
        let store = MemoryStore::new();
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            skill_type: crate::models::SkillType::Hard,
            hour_change: 0,
            status: crate::models::LedgerStatus::Pending,
            title: "Rust workshop".to_string(),
            remark: String::new(),
            source_type: SourceType::Program,
            source_id: Uuid::new_v4(),
            enrollment_id: Some(Uuid::new_v4()),
            changed_at: Utc::now(),
        };
        let first = store.upsert_ledger_entry(&entry).await.unwrap();
        let second = store
            .upsert_ledger_entry(&LedgerEntry {
                id: Uuid::new_v4(),
                hour_change: 4,
                ..entry.clone()
            })
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.hour_change, 4);
        assert_eq!(store.ledger_entries(&LedgerFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn attendance_saves_compare_against_the_stored_record() {
        let store = MemoryStore::new();
        let open = program(ProgramState::Open);
        store.upsert_program(&open).await.unwrap();
        let session = item(open.id, None, "2025-03-15 09:00-12:00 4");
        store.upsert_item(&session).await.unwrap();
        let enrolled = enrollment(Uuid::new_v4(), &session);
        store.insert_enrollment(&enrolled).await.unwrap();

        let date = session.windows[0].date;
        let record = CheckInOutRecord {
            id: Uuid::new_v4(),
            date,
            checkin: Some(Utc::now()),
            checkout: None,
            label: None,
        };
        store
            .save_attendance(enrolled.id, date, None, Some(&record))
            .await
            .unwrap();

        let err = store
            .save_attendance(enrolled.id, date, None, Some(&record))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(Conflict::StaleAttendance)));

        store
            .save_attendance(enrolled.id, date, Some(&record), None)
            .await
            .unwrap();
        let stored = store.enrollment(enrolled.id).await.unwrap().unwrap();
        assert!(stored.records.is_empty());
    }
}
