use std::collections::BTreeMap;
use std::time::Duration;

use chrono::FixedOffset;
use clap::Args;

use crate::error::{LedgerError, Result};
use crate::models::SkillType;

#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "LEDGER_MAX_CONNECTIONS", default_value_t = 5, global = true)]
    pub max_connections: u32,

    /// Offset of the activity civil calendar from UTC
    #[arg(long, env = "LEDGER_UTC_OFFSET_HOURS", default_value_t = 7, global = true)]
    pub utc_offset_hours: i32,

    /// Check-ins within this many minutes of a window start count as on time
    #[arg(long, env = "LEDGER_ON_TIME_TOLERANCE_MINUTES", default_value_t = 30, global = true)]
    pub on_time_tolerance_minutes: i64,

    #[arg(long, env = "LEDGER_STORE_TIMEOUT_SECS", default_value_t = 10, global = true)]
    pub store_timeout_secs: u64,

    #[arg(long, env = "LEDGER_COMPLETION_GRACE_MINUTES", default_value_t = 0, global = true)]
    pub completion_grace_minutes: i64,

    #[arg(long, env = "LEDGER_JOB_MAX_ATTEMPTS", default_value_t = 5, global = true)]
    pub job_max_attempts: i32,

    #[arg(long, env = "LEDGER_JOB_LEASE_SECS", default_value_t = 300, global = true)]
    pub job_lease_secs: i64,

    #[arg(long, env = "LEDGER_SOFT_CERT_CAP", default_value_t = 15, global = true)]
    pub soft_certificate_cap: i32,

    #[arg(long, env = "LEDGER_HARD_CERT_CAP", default_value_t = 6, global = true)]
    pub hard_certificate_cap: i32,

    /// Per-major hard skill certificate caps, e.g. `SE=9,AAI=9`
    #[arg(
        long,
        env = "LEDGER_MAJOR_HARD_CAPS",
        default_value = "SE=9,AAI=9",
        value_parser = parse_major_caps,
        global = true
    )]
    pub major_hard_caps: MajorCaps,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MajorCaps(pub BTreeMap<String, i32>);

fn parse_major_caps(value: &str) -> std::result::Result<MajorCaps, String> {
    let mut caps = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (major, hours) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected MAJOR=HOURS, got '{pair}'"))?;
        let hours = hours
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("invalid hours in '{pair}'"))?;
        caps.insert(major.trim().to_ascii_uppercase(), hours);
    }
    Ok(MajorCaps(caps))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            utc_offset_hours: 7,
            on_time_tolerance_minutes: 30,
            store_timeout_secs: 10,
            completion_grace_minutes: 0,
            job_max_attempts: 5,
            job_lease_secs: 300,
            soft_certificate_cap: 15,
            hard_certificate_cap: 6,
            major_hard_caps: parse_major_caps("SE=9,AAI=9").unwrap_or_default(),
        }
    }
}

impl Settings {
    pub fn timezone(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).ok_or_else(|| {
            LedgerError::Validation(format!("utc offset {} is out of range", self.utc_offset_hours))
        })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs.clamp(5, 15))
    }

    pub fn validate(&self) -> Result<()> {
        self.timezone()?;
        if !(0..=180).contains(&self.on_time_tolerance_minutes) {
            return Err(LedgerError::Validation(format!(
                "on-time tolerance {} minutes is out of range",
                self.on_time_tolerance_minutes
            )));
        }
        if self.job_max_attempts < 1 || self.job_lease_secs < 1 {
            return Err(LedgerError::Validation(
                "job attempts and lease must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Maximum certificate hours a student of `major` may accumulate.
    pub fn certificate_cap(&self, skill: SkillType, major: &str) -> i32 {
        match skill {
            SkillType::Soft => self.soft_certificate_cap,
            SkillType::Hard => self
                .major_hard_caps
                .0
                .get(&major.trim().to_ascii_uppercase())
                .copied()
                .unwrap_or(self.hard_certificate_cap),
        }
    }
}
