use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(LedgerError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillType {
    Soft,
    Hard,
}

text_enum!(SkillType { Soft => "soft", Hard => "hard" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramState {
    Planning,
    Open,
    Close,
    Complete,
    Cancel,
}

text_enum!(ProgramState {
    Planning => "planning",
    Open => "open",
    Close => "close",
    Complete => "complete",
    Cancel => "cancel",
});

impl ProgramState {
    /// Enrollments in these programs still block overlapping registrations.
    pub fn is_active(&self) -> bool {
        !matches!(self, ProgramState::Complete | ProgramState::Cancel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationLabel {
    OnTime,
    Late,
    CheckinOnly,
    Absent,
    NoWindow,
}

text_enum!(ParticipationLabel {
    OnTime => "on_time",
    Late => "late",
    CheckinOnly => "checkin_only",
    Absent => "absent",
    NoWindow => "no_window",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Program,
    Certificate,
    LegacyImport,
}

text_enum!(SourceType {
    Program => "program",
    Certificate => "certificate",
    LegacyImport => "legacy_import",
});

/// Hour ledger lifecycle.
///
/// Program entries walk `pending -> participating -> verifying -> waiting_form
/// -> attended | partial -> approved`. `rejected` is reachable from anything
/// before approval and `absent` is terminal for entries that never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Participating,
    Verifying,
    WaitingForm,
    Attended,
    Partial,
    Approved,
    Rejected,
    Absent,
}

text_enum!(LedgerStatus {
    Pending => "pending",
    Participating => "participating",
    Verifying => "verifying",
    WaitingForm => "waiting_form",
    Attended => "attended",
    Partial => "partial",
    Approved => "approved",
    Rejected => "rejected",
    Absent => "absent",
});

impl LedgerStatus {
    fn rank(&self) -> u8 {
        match self {
            LedgerStatus::Pending => 0,
            LedgerStatus::Participating => 1,
            LedgerStatus::Verifying => 2,
            LedgerStatus::WaitingForm => 3,
            LedgerStatus::Attended | LedgerStatus::Partial | LedgerStatus::Absent => 4,
            LedgerStatus::Approved | LedgerStatus::Rejected => 5,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, LedgerStatus::Approved | LedgerStatus::Rejected)
    }

    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            LedgerStatus::Attended | LedgerStatus::Partial | LedgerStatus::Absent
        )
    }

    /// Statuses whose hour delta counts toward a student's balance.
    pub fn is_credited(&self) -> bool {
        self.is_outcome() || matches!(self, LedgerStatus::Approved)
    }

    pub fn can_transition_to(&self, next: LedgerStatus) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (current, _) if current.is_final() => false,
            (_, LedgerStatus::Rejected) => true,
            // absent never credits, so it cannot be approved
            (LedgerStatus::Absent, LedgerStatus::Approved) => false,
            (_, LedgerStatus::Approved) => self.is_outcome(),
            // outcomes are re-evaluated in place when attendance is corrected
            (current, next) if current.is_outcome() && next.is_outcome() => true,
            (_, LedgerStatus::Absent) => self.rank() < 4,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    CloseEnrollment,
    CompleteProgram,
}

text_enum!(JobKind {
    CloseEnrollment => "close-enrollment",
    CompleteProgram => "complete-program",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Dead,
}

text_enum!(JobState {
    Pending => "pending",
    Running => "running",
    Dead => "dead",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub major: String,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: Uuid,
    pub name: String,
    pub skill: SkillType,
    pub state: ProgramState,
    pub enroll_deadline: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub hour_value: i32,
}

impl DateWindow {
    pub fn overlaps(&self, other: &DateWindow) -> bool {
        self.date == other.date && !(self.end <= other.start || other.end <= self.start)
    }
}

/// Parses `2025-03-15 09:00-12:00 4` (date, start-end, hour value).
impl FromStr for DateWindow {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || LedgerError::Validation(format!("invalid window '{value}'"));
        let mut parts = value.split_whitespace();
        let date = parts
            .next()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .ok_or_else(invalid)?;
        let (start, end) = parts
            .next()
            .and_then(|range| range.split_once('-'))
            .ok_or_else(invalid)?;
        let start = NaiveTime::parse_from_str(start, "%H:%M").map_err(|_| invalid())?;
        let end = NaiveTime::parse_from_str(end, "%H:%M").map_err(|_| invalid())?;
        let hour_value = parts
            .next()
            .map(|h| h.parse::<i32>().map_err(|_| invalid()))
            .transpose()?
            .unwrap_or(0);
        if end <= start || hour_value < 0 || parts.next().is_some() {
            return Err(invalid());
        }
        Ok(DateWindow {
            date,
            start,
            end,
            hour_value,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub majors: Vec<String>,
    pub years: Vec<i32>,
}

impl Eligibility {
    pub fn admits(&self, student: &Student) -> bool {
        let major_ok = self.majors.is_empty()
            || self
                .majors
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&student.major));
        let year_ok = self.years.is_empty() || self.years.contains(&student.year);
        major_ok && year_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledItem {
    pub id: Uuid,
    pub program_id: Uuid,
    pub name: String,
    pub capacity: Option<i64>,
    pub eligibility: Eligibility,
    pub windows: Vec<DateWindow>,
}

impl ScheduledItem {
    pub fn window_on(&self, date: NaiveDate) -> Option<&DateWindow> {
        self.windows.iter().find(|w| w.date == date)
    }

    /// Distinct scheduled dates in ascending order.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.windows.iter().map(|w| w.date).collect();
        dates.sort();
        dates.dedup();
        dates
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInOutRecord {
    pub id: Uuid,
    pub date: NaiveDate,
    pub checkin: Option<DateTime<Utc>>,
    pub checkout: Option<DateTime<Utc>>,
    pub label: Option<ParticipationLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub item_id: Uuid,
    pub program_id: Uuid,
    pub registered_at: DateTime<Utc>,
    pub food: Option<String>,
    pub records: Vec<CheckInOutRecord>,
}

impl Enrollment {
    pub fn record_on(&self, date: NaiveDate) -> Option<&CheckInOutRecord> {
        self.records.iter().find(|r| r.date == date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub student_id: Uuid,
    pub skill_type: SkillType,
    pub hour_change: i32,
    pub status: LedgerStatus,
    pub title: String,
    pub remark: String,
    pub source_type: SourceType,
    pub source_id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub changed_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Upsert key: one live entry per (enrollment, source) for programs and
    /// per (source, student) for everything else.
    pub fn key(&self) -> String {
        match self.enrollment_id {
            Some(enrollment_id) if self.source_type == SourceType::Program => {
                program_entry_key(self.source_id, enrollment_id)
            }
            _ => source_entry_key(self.source_type, self.source_id, self.student_id),
        }
    }
}

pub fn program_entry_key(program_id: Uuid, enrollment_id: Uuid) -> String {
    format!("program:{program_id}:{enrollment_id}")
}

pub fn source_entry_key(source_type: SourceType, source_id: Uuid, student_id: Uuid) -> String {
    format!("{source_type}:{source_id}:{student_id}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerFilter {
    pub student_id: Option<Uuid>,
    pub source_type: Option<SourceType>,
    pub source_id: Option<Uuid>,
    pub skill_type: Option<SkillType>,
    pub statuses: Vec<LedgerStatus>,
}

impl LedgerFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.student_id.map_or(true, |id| entry.student_id == id)
            && self.source_type.map_or(true, |t| entry.source_type == t)
            && self.source_id.map_or(true, |id| entry.source_id == id)
            && self.skill_type.map_or(true, |s| entry.skill_type == s)
            && (self.statuses.is_empty() || self.statuses.contains(&entry.status))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub program_id: Uuid,
    pub date: NaiveDate,
    pub registered: i64,
    pub checkin: i64,
    pub checkin_late: i64,
    pub checkout: i64,
    pub not_participating: i64,
}

impl SummaryRow {
    pub fn empty(program_id: Uuid, date: NaiveDate) -> Self {
        Self {
            program_id,
            date,
            registered: 0,
            checkin: 0,
            checkin_late: 0,
            checkout: 0,
            not_participating: 0,
        }
    }

    /// Applies a delta, clamping every counter at zero and re-deriving
    /// `not_participating`.
    pub fn apply(&mut self, delta: SummaryDelta) {
        self.registered = (self.registered + delta.registered).max(0);
        self.checkin = (self.checkin + delta.checkin).max(0);
        self.checkin_late = (self.checkin_late + delta.checkin_late).max(0);
        self.checkout = (self.checkout + delta.checkout).max(0);
        self.recalculate();
    }

    pub fn recalculate(&mut self) {
        self.not_participating = (self.registered - (self.checkin + self.checkin_late)).max(0);
    }

    pub fn is_reconciled(&self) -> bool {
        self.registered == self.checkin + self.checkin_late + self.not_participating
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryDelta {
    pub registered: i64,
    pub checkin: i64,
    pub checkin_late: i64,
    pub checkout: i64,
}

impl SummaryDelta {
    pub fn is_zero(&self) -> bool {
        *self == SummaryDelta::default()
    }
}
