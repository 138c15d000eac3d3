use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{overlaps_any, Store};
use crate::error::{Conflict, LedgerError, Result};
use crate::models::{
    CheckInOutRecord, DateWindow, Eligibility, Enrollment, LedgerEntry, LedgerFilter, Program,
    ProgramState, ScheduledItem, Student, SummaryDelta, SummaryRow,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| LedgerError::Database(err.into()))?;
        Ok(())
    }

    async fn attach_records(&self, mut enrollments: Vec<Enrollment>) -> Result<Vec<Enrollment>> {
        if enrollments.is_empty() {
            return Ok(enrollments);
        }
        let ids: Vec<Uuid> = enrollments.iter().map(|e| e.id).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, enrollment_id, date, checkin, checkout, label
            FROM skill_ledger.attendance_records
            WHERE enrollment_id = ANY($1)
            ORDER BY date
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_enrollment: HashMap<Uuid, Vec<CheckInOutRecord>> = HashMap::new();
        for row in rows {
            by_enrollment
                .entry(row.try_get("enrollment_id")?)
                .or_default()
                .push(record_from_row(&row)?);
        }
        for enrollment in &mut enrollments {
            enrollment.records = by_enrollment.remove(&enrollment.id).unwrap_or_default();
        }
        Ok(enrollments)
    }
}

fn record_from_row(row: &PgRow) -> Result<CheckInOutRecord> {
    let label: Option<String> = row.try_get("label")?;
    Ok(CheckInOutRecord {
        id: row.try_get("id")?,
        date: row.try_get("date")?,
        checkin: row.try_get("checkin")?,
        checkout: row.try_get("checkout")?,
        label: label.map(|l| l.parse()).transpose()?,
    })
}

const ENROLLMENT_COLUMNS: &str = "id, student_id, item_id, program_id, registered_at, food";

const LEDGER_COLUMNS: &str = "id, student_id, skill_type, hour_change, status, title, remark, \
     source_type, source_id, enrollment_id, changed_at";

const SUMMARY_RETURNING: &str =
    "program_id, date, registered, checkin, checkin_late, checkout, not_participating";

fn student_from_row(row: &PgRow) -> Result<Student> {
    Ok(Student {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("full_name")?,
        major: row.try_get("major")?,
        year: row.try_get("year")?,
    })
}

fn program_from_row(row: &PgRow) -> Result<Program> {
    Ok(Program {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        skill: row.try_get::<String, _>("skill_type")?.parse()?,
        state: row.try_get::<String, _>("state")?.parse()?,
        enroll_deadline: row.try_get("enroll_deadline")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<ScheduledItem> {
    let Json(windows): Json<Vec<DateWindow>> = row.try_get("windows")?;
    Ok(ScheduledItem {
        id: row.try_get("id")?,
        program_id: row.try_get("program_id")?,
        name: row.try_get("name")?,
        capacity: row.try_get("capacity")?,
        eligibility: Eligibility {
            majors: row.try_get("majors")?,
            years: row.try_get("years")?,
        },
        windows,
    })
}

fn enrollment_from_row(row: &PgRow) -> Result<Enrollment> {
    Ok(Enrollment {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        item_id: row.try_get("item_id")?,
        program_id: row.try_get("program_id")?,
        registered_at: row.try_get("registered_at")?,
        food: row.try_get("food")?,
        records: Vec::new(),
    })
}

fn ledger_from_row(row: &PgRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        skill_type: row.try_get::<String, _>("skill_type")?.parse()?,
        hour_change: row.try_get("hour_change")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        title: row.try_get("title")?,
        remark: row.try_get("remark")?,
        source_type: row.try_get::<String, _>("source_type")?.parse()?,
        source_id: row.try_get("source_id")?,
        enrollment_id: row.try_get("enrollment_id")?,
        changed_at: row.try_get("changed_at")?,
    })
}

fn summary_from_row(row: &PgRow) -> Result<SummaryRow> {
    Ok(SummaryRow {
        program_id: row.try_get("program_id")?,
        date: row.try_get("date")?,
        registered: row.try_get("registered")?,
        checkin: row.try_get("checkin")?,
        checkin_late: row.try_get("checkin_late")?,
        checkout: row.try_get("checkout")?,
        not_participating: row.try_get("not_participating")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_student(&self, student: &Student) -> Result<Student> {
        let row = sqlx::query(
            r#"
            INSERT INTO skill_ledger.students (id, code, full_name, major, year)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (code) DO UPDATE
            SET full_name = EXCLUDED.full_name, major = EXCLUDED.major, year = EXCLUDED.year
            RETURNING id, code, full_name, major, year
            "#,
        )
        .bind(student.id)
        .bind(&student.code)
        .bind(&student.name)
        .bind(&student.major)
        .bind(student.year)
        .fetch_one(&self.pool)
        .await?;
        student_from_row(&row)
    }

    async fn student(&self, id: Uuid) -> Result<Option<Student>> {
        sqlx::query("SELECT id, code, full_name, major, year FROM skill_ledger.students WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(student_from_row)
            .transpose()
    }

    async fn student_by_code(&self, code: &str) -> Result<Option<Student>> {
        sqlx::query(
            "SELECT id, code, full_name, major, year FROM skill_ledger.students WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(student_from_row)
        .transpose()
    }

    async fn upsert_program(&self, program: &Program) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO skill_ledger.programs (id, name, skill_type, state, enroll_deadline)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                skill_type = EXCLUDED.skill_type,
                state = EXCLUDED.state,
                enroll_deadline = EXCLUDED.enroll_deadline
            "#,
        )
        .bind(program.id)
        .bind(&program.name)
        .bind(program.skill.as_str())
        .bind(program.state.as_str())
        .bind(program.enroll_deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn program(&self, id: Uuid) -> Result<Option<Program>> {
        sqlx::query(
            "SELECT id, name, skill_type, state, enroll_deadline FROM skill_ledger.programs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(program_from_row)
        .transpose()
    }

    async fn set_program_state(&self, id: Uuid, state: ProgramState) -> Result<bool> {
        let result = sqlx::query("UPDATE skill_ledger.programs SET state = $2 WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_enroll_deadline(&self, id: Uuid, deadline: NaiveDate) -> Result<bool> {
        let result =
            sqlx::query("UPDATE skill_ledger.programs SET enroll_deadline = $2 WHERE id = $1")
                .bind(id)
                .bind(deadline)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_program(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM skill_ledger.ledger_entries WHERE source_type = 'program' AND source_id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM skill_ledger.programs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_item(&self, item: &ScheduledItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO skill_ledger.scheduled_items
            (id, program_id, name, capacity, majors, years, windows)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                capacity = EXCLUDED.capacity,
                majors = EXCLUDED.majors,
                years = EXCLUDED.years,
                windows = EXCLUDED.windows
            "#,
        )
        .bind(item.id)
        .bind(item.program_id)
        .bind(&item.name)
        .bind(item.capacity)
        .bind(&item.eligibility.majors)
        .bind(&item.eligibility.years)
        .bind(Json(&item.windows))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn item(&self, id: Uuid) -> Result<Option<ScheduledItem>> {
        sqlx::query(
            r#"
            SELECT id, program_id, name, capacity, majors, years, windows
            FROM skill_ledger.scheduled_items WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(item_from_row)
        .transpose()
    }

    async fn items_for_program(&self, program_id: Uuid) -> Result<Vec<ScheduledItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, program_id, name, capacity, majors, years, windows
            FROM skill_ledger.scheduled_items WHERE program_id = $1
            ORDER BY name, id
            "#,
        )
        .bind(program_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn set_item_windows(&self, item_id: Uuid, windows: &[DateWindow]) -> Result<bool> {
        let result =
            sqlx::query("UPDATE skill_ledger.scheduled_items SET windows = $2 WHERE id = $1")
                .bind(item_id)
                .bind(Json(windows))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let item = sqlx::query(
            r#"
            SELECT id, program_id, name, capacity, majors, years, windows
            FROM skill_ledger.scheduled_items WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(enrollment.item_id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(item_from_row)
        .transpose()?
        .ok_or_else(|| LedgerError::not_found("item", enrollment.item_id))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(enrollment.student_id)
            .execute(&mut *tx)
            .await?;

        let duplicate = sqlx::query(
            "SELECT 1 FROM skill_ledger.enrollments WHERE student_id = $1 AND item_id = $2",
        )
        .bind(enrollment.student_id)
        .bind(item.id)
        .fetch_optional(&mut *tx)
        .await?;
        if duplicate.is_some() {
            return Err(Conflict::AlreadyEnrolled.into());
        }

        let others = sqlx::query(
            r#"
            SELECT i.windows
            FROM skill_ledger.enrollments e
            JOIN skill_ledger.scheduled_items i ON i.id = e.item_id
            JOIN skill_ledger.programs p ON p.id = e.program_id
            WHERE e.student_id = $1 AND p.state NOT IN ('complete', 'cancel')
            "#,
        )
        .bind(enrollment.student_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in &others {
            let Json(windows): Json<Vec<DateWindow>> = row.try_get("windows")?;
            if overlaps_any(&item.windows, &windows) {
                return Err(Conflict::ScheduleConflict.into());
            }
        }

        if let Some(capacity) = item.capacity {
            let taken: i64 =
                sqlx::query("SELECT COUNT(*) AS taken FROM skill_ledger.enrollments WHERE item_id = $1")
                    .bind(item.id)
                    .fetch_one(&mut *tx)
                    .await?
                    .try_get("taken")?;
            if taken >= capacity {
                return Err(Conflict::CapacityExceeded.into());
            }
        }

        sqlx::query(
            r#"
            INSERT INTO skill_ledger.enrollments
            (id, student_id, item_id, program_id, registered_at, food)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.student_id)
        .bind(enrollment.item_id)
        .bind(enrollment.program_id)
        .bind(enrollment.registered_at)
        .bind(&enrollment.food)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        let row = sqlx::query(&format!("SELECT {ENROLLMENT_COLUMNS} FROM skill_ledger.enrollments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let enrollment = enrollment_from_row(&row)?;
        Ok(self.attach_records(vec![enrollment]).await?.pop())
    }

    async fn enrollments_for_item(&self, item_id: Uuid) -> Result<Vec<Enrollment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM skill_ledger.enrollments WHERE item_id = $1 ORDER BY registered_at, id"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        let enrollments = rows
            .iter()
            .map(enrollment_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_records(enrollments).await
    }

    async fn enrollments_for_program(&self, program_id: Uuid) -> Result<Vec<Enrollment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM skill_ledger.enrollments WHERE program_id = $1 ORDER BY registered_at, id"
        ))
        .bind(program_id)
        .fetch_all(&self.pool)
        .await?;
        let enrollments = rows
            .iter()
            .map(enrollment_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_records(enrollments).await
    }

    async fn delete_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        let Some(existing) = self.enrollment(id).await? else {
            return Ok(None);
        };
        let result = sqlx::query("DELETE FROM skill_ledger.enrollments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok((result.rows_affected() > 0).then_some(existing))
    }

    async fn save_attendance(
        &self,
        enrollment_id: Uuid,
        date: NaiveDate,
        expected: Option<&CheckInOutRecord>,
        record: Option<&CheckInOutRecord>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT id FROM skill_ledger.enrollments WHERE id = $1 FOR UPDATE")
            .bind(enrollment_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LedgerError::not_found("enrollment", enrollment_id))?;

        let stored = |day: NaiveDate| {
            sqlx::query(
                r#"
                SELECT id, date, checkin, checkout, label
                FROM skill_ledger.attendance_records
                WHERE enrollment_id = $1 AND date = $2
                "#,
            )
            .bind(enrollment_id)
            .bind(day)
        };
        let current = stored(date)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(record_from_row)
            .transpose()?;
        if current.as_ref() != expected {
            return Err(Conflict::StaleAttendance.into());
        }
        if let Some(record) = record.filter(|r| r.date != date) {
            if stored(record.date).fetch_optional(&mut *tx).await?.is_some() {
                return Err(Conflict::StaleAttendance.into());
            }
        }

        sqlx::query(
            "DELETE FROM skill_ledger.attendance_records WHERE enrollment_id = $1 AND date = $2",
        )
        .bind(enrollment_id)
        .bind(date)
        .execute(&mut *tx)
        .await?;
        if let Some(record) = record {
            sqlx::query(
                r#"
                INSERT INTO skill_ledger.attendance_records
                (id, enrollment_id, date, checkin, checkout, label)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(record.id)
            .bind(enrollment_id)
            .bind(record.date)
            .bind(record.checkin)
            .bind(record.checkout)
            .bind(record.label.map(|l| l.as_str()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn adjust_food_vote(&self, program_id: Uuid, food: &str, delta: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO skill_ledger.food_votes (program_id, food_name, votes)
            VALUES ($1, $2, GREATEST($3, 0))
            ON CONFLICT (program_id, food_name) DO UPDATE
            SET votes = GREATEST(skill_ledger.food_votes.votes + $3, 0)
            "#,
        )
        .bind(program_id)
        .bind(food)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn food_votes(&self, program_id: Uuid) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT food_name, votes FROM skill_ledger.food_votes WHERE program_id = $1 ORDER BY food_name",
        )
        .bind(program_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(String, i64)> {
                Ok((row.try_get("food_name")?, row.try_get("votes")?))
            })
            .collect()
    }

    async fn increment_summary(
        &self,
        program_id: Uuid,
        date: NaiveDate,
        delta: SummaryDelta,
    ) -> Result<SummaryRow> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO skill_ledger.summary_rows AS s
            (program_id, date, registered, checkin, checkin_late, checkout, not_participating)
            VALUES (
                $1, $2, GREATEST($3, 0), GREATEST($4, 0), GREATEST($5, 0), GREATEST($6, 0),
                GREATEST(GREATEST($3, 0) - GREATEST($4, 0) - GREATEST($5, 0), 0)
            )
            ON CONFLICT (program_id, date) DO UPDATE
            SET registered = GREATEST(s.registered + $3, 0),
                checkin = GREATEST(s.checkin + $4, 0),
                checkin_late = GREATEST(s.checkin_late + $5, 0),
                checkout = GREATEST(s.checkout + $6, 0),
                not_participating = GREATEST(
                    GREATEST(s.registered + $3, 0)
                        - GREATEST(s.checkin + $4, 0)
                        - GREATEST(s.checkin_late + $5, 0),
                    0
                )
            RETURNING {SUMMARY_RETURNING}
            "#
        ))
        .bind(program_id)
        .bind(date)
        .bind(delta.registered)
        .bind(delta.checkin)
        .bind(delta.checkin_late)
        .bind(delta.checkout)
        .fetch_one(&self.pool)
        .await?;
        summary_from_row(&row)
    }

    async fn recalculate_summary(
        &self,
        program_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<SummaryRow>> {
        sqlx::query(&format!(
            r#"
            UPDATE skill_ledger.summary_rows
            SET not_participating = GREATEST(registered - (checkin + checkin_late), 0)
            WHERE program_id = $1 AND date = $2
            RETURNING {SUMMARY_RETURNING}
            "#
        ))
        .bind(program_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(summary_from_row)
        .transpose()
    }

    async fn summary_rows(&self, program_id: Uuid) -> Result<Vec<SummaryRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_RETURNING} FROM skill_ledger.summary_rows WHERE program_id = $1 ORDER BY date"
        ))
        .bind(program_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(summary_from_row).collect()
    }

    async fn delete_summary_rows(&self, program_id: Uuid, dates: &[NaiveDate]) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM skill_ledger.summary_rows WHERE program_id = $1 AND date = ANY($2)",
        )
        .bind(program_id)
        .bind(dates)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> Result<LedgerEntry> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO skill_ledger.ledger_entries
            (id, entry_key, student_id, skill_type, hour_change, status, title, remark,
             source_type, source_id, enrollment_id, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (entry_key) DO UPDATE
            SET skill_type = EXCLUDED.skill_type,
                hour_change = EXCLUDED.hour_change,
                status = EXCLUDED.status,
                title = EXCLUDED.title,
                remark = EXCLUDED.remark,
                changed_at = EXCLUDED.changed_at
            RETURNING {LEDGER_COLUMNS}
            "#
        ))
        .bind(entry.id)
        .bind(entry.key())
        .bind(entry.student_id)
        .bind(entry.skill_type.as_str())
        .bind(entry.hour_change)
        .bind(entry.status.as_str())
        .bind(&entry.title)
        .bind(&entry.remark)
        .bind(entry.source_type.as_str())
        .bind(entry.source_id)
        .bind(entry.enrollment_id)
        .bind(entry.changed_at)
        .fetch_one(&self.pool)
        .await?;
        ledger_from_row(&row)
    }

    async fn ledger_entry(&self, id: Uuid) -> Result<Option<LedgerEntry>> {
        sqlx::query(&format!("SELECT {LEDGER_COLUMNS} FROM skill_ledger.ledger_entries WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(ledger_from_row)
            .transpose()
    }

    async fn ledger_entry_by_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        sqlx::query(&format!("SELECT {LEDGER_COLUMNS} FROM skill_ledger.ledger_entries WHERE entry_key = $1"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(ledger_from_row)
            .transpose()
    }

    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LEDGER_COLUMNS}
            FROM skill_ledger.ledger_entries
            WHERE ($1::uuid IS NULL OR student_id = $1)
              AND ($2::text IS NULL OR source_type = $2)
              AND ($3::uuid IS NULL OR source_id = $3)
              AND ($4::text IS NULL OR skill_type = $4)
              AND (cardinality($5::text[]) = 0 OR status = ANY($5))
            ORDER BY changed_at, id
            "#
        ))
        .bind(filter.student_id)
        .bind(filter.source_type.map(|t| t.as_str()))
        .bind(filter.source_id)
        .bind(filter.skill_type.map(|s| s.as_str()))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_from_row).collect()
    }

    async fn delete_ledger_entries_for_enrollment(&self, enrollment_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM skill_ledger.ledger_entries WHERE enrollment_id = $1")
            .bind(enrollment_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_ledger_entries(&self, entries: &[LedgerEntry]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO skill_ledger.ledger_entries
                (id, entry_key, student_id, skill_type, hour_change, status, title, remark,
                 source_type, source_id, enrollment_id, changed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (entry_key) DO NOTHING
                "#,
            )
            .bind(entry.id)
            .bind(entry.key())
            .bind(entry.student_id)
            .bind(entry.skill_type.as_str())
            .bind(entry.hour_change)
            .bind(entry.status.as_str())
            .bind(&entry.title)
            .bind(&entry.remark)
            .bind(entry.source_type.as_str())
            .bind(entry.source_id)
            .bind(entry.enrollment_id)
            .bind(entry.changed_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }
}
