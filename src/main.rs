use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod certificate;
mod classifier;
mod clock;
mod config;
mod context;
mod enrollment;
mod error;
mod import;
mod ledger;
mod lifecycle;
mod models;
mod programs;
mod queue;
mod report;
mod seed;
mod simulate;
mod store;
mod summary;
mod worker;

#[cfg(test)]
mod testing;

use crate::clock::SystemClock;
use crate::config::Settings;
use crate::context::Context;
use crate::enrollment::{Direction, Patch};
use crate::models::{DateWindow, Eligibility, LedgerStatus, ProgramState, SkillType};
use crate::queue::PgQueue;
use crate::store::PgStore;

#[derive(Parser)]
#[command(name = "attendance-ledger")]
#[command(about = "Attendance ledger and summary reconciliation for Group Scholar programs", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo program with students
    Seed,
    /// Import legacy hour entries from a CSV file
    ImportHours {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Create a program in planning state
    CreateProgram {
        #[arg(long)]
        name: String,
        #[arg(long)]
        skill: SkillType,
        #[arg(long)]
        deadline: NaiveDate,
    },
    /// Add a scheduled item, e.g. --window "2025-03-15 09:00-12:00 4"
    AddItem {
        #[arg(long)]
        program: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        capacity: Option<i64>,
        #[arg(long, value_delimiter = ',')]
        majors: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        years: Vec<i32>,
        #[arg(long = "window", required = true)]
        windows: Vec<DateWindow>,
    },
    /// Register a student for an item
    Register {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        item: Uuid,
        #[arg(long)]
        food: Option<String>,
    },
    /// Register students by code, each given as CODE or CODE:FOOD
    BulkRegister {
        #[arg(long)]
        item: Uuid,
        #[arg(long = "code", required = true)]
        codes: Vec<String>,
    },
    /// Remove an enrollment and reverse its effects
    Unregister {
        #[arg(long)]
        enrollment: Uuid,
    },
    /// Set or clear the check-in/check-out of one scheduled date
    #[command(group(ArgGroup::new("checkin_edit").args(["checkin", "clear_checkin"])))]
    #[command(group(ArgGroup::new("checkout_edit").args(["checkout", "clear_checkout"])))]
    Attend {
        #[arg(long)]
        enrollment: Uuid,
        #[arg(long)]
        date: NaiveDate,
        /// RFC 3339 timestamp
        #[arg(long)]
        checkin: Option<DateTime<Utc>>,
        #[arg(long)]
        clear_checkin: bool,
        /// RFC 3339 timestamp
        #[arg(long)]
        checkout: Option<DateTime<Utc>>,
        #[arg(long)]
        clear_checkout: bool,
    },
    /// Self-service check in or out at the current time
    Check {
        #[arg(long)]
        enrollment: Uuid,
        #[arg(long, value_parser = parse_direction)]
        direction: Direction,
    },
    /// Move a program to another state
    SetState {
        #[arg(long)]
        program: Uuid,
        #[arg(long)]
        state: ProgramState,
    },
    /// Change the enrollment deadline
    Deadline {
        #[arg(long)]
        program: Uuid,
        #[arg(long)]
        date: NaiveDate,
    },
    /// Replace an item's windows
    EditWindows {
        #[arg(long)]
        item: Uuid,
        #[arg(long = "window", required = true)]
        windows: Vec<DateWindow>,
    },
    /// Delete a program with everything attached to it
    DeleteProgram {
        #[arg(long)]
        program: Uuid,
    },
    /// Re-arm the lifecycle jobs of an open program
    Reschedule {
        #[arg(long)]
        program: Uuid,
    },
    /// Re-run the finalization pass of a completed program
    Finalize {
        #[arg(long)]
        program: Uuid,
    },
    /// Record an uploaded certificate as pending
    SubmitCertificate {
        #[arg(long)]
        certificate: Uuid,
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        skill: SkillType,
        #[arg(long)]
        title: String,
    },
    /// Approve a pending certificate, or reject it with --reject
    DecideCertificate {
        #[arg(long)]
        certificate: Uuid,
        #[arg(long)]
        student: Uuid,
        #[arg(long, default_value_t = 0)]
        hours: i32,
        /// Rejection remark
        #[arg(long)]
        reject: Option<String>,
    },
    /// Move a ledger entry along its status machine
    AdvanceStatus {
        #[arg(long)]
        entry: Uuid,
        #[arg(long)]
        status: LedgerStatus,
        #[arg(long)]
        remark: Option<String>,
    },
    /// Show a student's hour balance
    Hours {
        #[arg(long)]
        student: Uuid,
        /// Print the balance as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the daily summary rows of a program
    Summary {
        #[arg(long)]
        program: Uuid,
    },
    /// Generate a markdown attendance report
    Report {
        #[arg(long)]
        program: Uuid,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// List scheduled lifecycle jobs
    Jobs {
        #[arg(long)]
        program: Option<Uuid>,
    },
    /// Run the lifecycle job worker until interrupted
    Worker {
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
        /// Also print every program state change to stdout as a JSON line
        #[arg(long)]
        events_json: bool,
    },
    /// Replay on-time, late and corrected attendance in memory
    Simulate,
}

fn parse_direction(value: &str) -> Result<Direction, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "in" => Ok(Direction::In),
        "out" => Ok(Direction::Out),
        other => Err(format!("expected 'in' or 'out', got '{other}'")),
    }
}

fn patch<T>(value: Option<T>, clear: bool) -> Patch<T> {
    match (value, clear) {
        (Some(value), _) => Patch::Set(value),
        (None, true) => Patch::Clear,
        (None, false) => Patch::Keep,
    }
}

fn split_code(value: &str) -> (String, Option<String>) {
    match value.split_once(':') {
        Some((code, food)) if !food.trim().is_empty() => {
            (code.to_string(), Some(food.trim().to_string()))
        }
        Some((code, _)) => (code.to_string(), None),
        None => (value.to_string(), None),
    }
}

async fn connect(settings: &Settings) -> anyhow::Result<(Context, PgStore)> {
    let database_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PgStore::new(pool.clone());
    let ctx = Context::new(
        Arc::new(store.clone()),
        Arc::new(PgQueue::new(pool)),
        Arc::new(SystemClock),
        settings.clone(),
    )
    .context("invalid settings")?;
    Ok((ctx, store))
}

fn print_failures(failures: &[error::PartialFailure]) {
    for failure in failures {
        println!("  ! {failure}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Commands::Simulate = cli.command {
        let simulation = simulate::run(cli.settings)
            .await
            .context("simulation failed")?;
        println!("{}", simulation.report);
        println!(
            "Program {}: worker claimed {} jobs, {} succeeded, {} retried, {} buried.",
            simulation.program_id,
            simulation.tick.claimed,
            simulation.tick.succeeded,
            simulation.tick.retried,
            simulation.tick.buried
        );
        return Ok(());
    }

    let (ctx, store) = connect(&cli.settings).await?;

    match cli.command {
        Commands::InitDb => {
            store.migrate().await.context("failed to apply migrations")?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let seeded = seed::seed(&ctx).await?;
            if let Some(program) = &seeded.program {
                println!("Program {} ({}) is {}.", program.name, program.id, program.state);
            }
            println!(
                "Seed data inserted: {} students, {} items.",
                seeded.students.len(),
                seeded.items.len()
            );
        }
        Commands::ImportHours { csv } => {
            let imported = import::import_hours(&ctx, &csv)
                .await
                .with_context(|| format!("failed to import {}", csv.display()))?;
            println!(
                "Inserted {} of {} rows from {}.",
                imported.inserted,
                imported.read,
                csv.display()
            );
            for code in &imported.unknown_students {
                println!("- unknown student {code}");
            }
        }
        Commands::CreateProgram {
            name,
            skill,
            deadline,
        } => {
            let program = programs::create_program(&ctx, &name, skill, deadline).await?;
            println!("Program {} created ({}).", program.id, program.state);
        }
        Commands::AddItem {
            program,
            name,
            capacity,
            majors,
            years,
            windows,
        } => {
            let eligibility = Eligibility { majors, years };
            let item =
                programs::add_item(&ctx, program, &name, capacity, eligibility, windows).await?;
            println!("Item {} added with {} windows.", item.id, item.windows.len());
        }
        Commands::Register {
            student,
            item,
            food,
        } => {
            let registration = enrollment::register(&ctx, student, item, food).await?;
            println!("Enrollment {} created.", registration.enrollment.id);
            print_failures(&registration.failures);
        }
        Commands::BulkRegister { item, codes } => {
            let rows = codes.iter().map(|c| split_code(c)).collect();
            let bulk = enrollment::bulk_register(&ctx, item, rows).await?;
            println!("Registered {} students.", bulk.registered.len());
            for (code, reason) in &bulk.failed {
                println!("- {code}: {reason}");
            }
            print_failures(&bulk.failures);
        }
        Commands::Unregister { enrollment: id } => {
            let failures = enrollment::unregister(&ctx, id).await?;
            println!("Enrollment {id} removed.");
            print_failures(&failures);
        }
        Commands::Attend {
            enrollment: id,
            date,
            checkin,
            clear_checkin,
            checkout,
            clear_checkout,
        } => {
            let change = enrollment::record_attendance(
                &ctx,
                id,
                date,
                patch(checkin, clear_checkin),
                patch(checkout, clear_checkout),
            )
            .await?;
            match change.label() {
                Some(label) => println!("Attendance recorded: {label}."),
                None => println!("Attendance cleared."),
            }
            print_failures(&change.failures);
        }
        Commands::Check {
            enrollment: id,
            direction,
        } => {
            let change = enrollment::submit_check(&ctx, id, direction).await?;
            if let Some(label) = change.label() {
                println!("Checked {direction:?}: {label}.");
            }
            print_failures(&change.failures);
        }
        Commands::SetState { program, state } => {
            let change = lifecycle::set_state(&ctx, program, state).await?;
            println!(
                "Program {} is now {} ({} jobs scheduled).",
                change.program.id,
                change.program.state,
                change.jobs.len()
            );
            if let Some(finalization) = change.finalization {
                println!(
                    "Finalized {} of {} enrollments.",
                    finalization.succeeded(),
                    finalization.processed
                );
                print_failures(&finalization.failures);
            }
        }
        Commands::Deadline { program, date } => {
            let jobs = programs::set_enroll_deadline(&ctx, program, date).await?;
            println!("Deadline set to {date} ({} jobs scheduled).", jobs.len());
        }
        Commands::EditWindows { item, windows } => {
            let edit = programs::edit_item_windows(&ctx, item, windows).await?;
            println!(
                "Windows replaced: {} added, {} removed, {} re-bucketed, {} rows pruned, {} jobs scheduled.",
                edit.added.len(),
                edit.removed.len(),
                edit.rebucketed,
                edit.pruned_rows,
                edit.jobs.len()
            );
            print_failures(&edit.failures);
        }
        Commands::DeleteProgram { program } => {
            programs::delete_program(&ctx, program).await?;
            println!("Program {program} deleted.");
        }
        Commands::Reschedule { program } => {
            let jobs = lifecycle::reschedule(&ctx, program).await?;
            for job in &jobs {
                println!("- {} at {}", job.key(), job.run_at);
            }
        }
        Commands::Finalize { program } => {
            let finalization = lifecycle::finalize_program(&ctx, program).await?;
            println!(
                "Processed {}: {} updated, {} unchanged.",
                finalization.processed, finalization.updated, finalization.unchanged
            );
            print_failures(&finalization.failures);
        }
        Commands::SubmitCertificate {
            certificate: id,
            student,
            skill,
            title,
        } => {
            let entry = certificate::submit(&ctx, id, student, skill, &title).await?;
            println!("Certificate entry {} is {}.", entry.id, entry.status);
        }
        Commands::DecideCertificate {
            certificate: id,
            student,
            hours,
            reject,
        } => {
            let decision = match reject {
                Some(remark) => certificate::Decision::Reject { remark },
                None => certificate::Decision::Approve,
            };
            let entry = certificate::decide(&ctx, id, student, hours, decision).await?;
            println!(
                "Certificate {} {} with {} hours. {}",
                id, entry.status, entry.hour_change, entry.remark
            );
        }
        Commands::AdvanceStatus {
            entry,
            status,
            remark,
        } => {
            let entry = ledger::advance_status(&ctx, entry, status, remark).await?;
            println!("Entry {} is {}.", entry.id, entry.status);
        }
        Commands::Hours { student, json } => {
            let balance = ledger::student_hours(&ctx, student).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&balance)?);
            } else {
                println!(
                    "soft {} / hard {}: {:?}",
                    balance.soft, balance.hard, balance.standing
                );
            }
        }
        Commands::Summary { program } => {
            let rows = ctx.store.summary_rows(program).await?;
            if rows.is_empty() {
                println!("No summary rows for this program.");
                return Ok(());
            }
            for row in rows {
                println!(
                    "- {}: registered {}, on time {}, late {}, checked out {}, not participating {}",
                    row.date,
                    row.registered,
                    row.checkin,
                    row.checkin_late,
                    row.checkout,
                    row.not_participating
                );
            }
        }
        Commands::Report { program, out } => {
            let report = report::program_report(&ctx, program).await?;
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Jobs { program } => {
            let jobs = ctx.queue.list(program).await?;
            if jobs.is_empty() {
                println!("No scheduled jobs.");
            }
            for job in jobs {
                println!(
                    "- {} at {} [{} after {} attempts]{}",
                    job.key(),
                    job.run_at,
                    job.state,
                    job.attempts,
                    job.last_error
                        .as_deref()
                        .map(|e| format!(" last error: {e}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Worker {
            poll_secs,
            events_json,
        } => {
            let mut events = ctx.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            info!(
                                program_id = %event.program_id,
                                state = %event.state,
                                at = %event.at,
                                "program state notification"
                            );
                            if events_json {
                                match serde_json::to_string(&event) {
                                    Ok(line) => println!("{line}"),
                                    Err(err) => warn!(error = %err, "program event not encoded"),
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "program notifications dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            let mut runner = worker::Worker::new(&ctx);
            lifecycle::register_handlers(&mut runner, &ctx);
            info!(poll_secs, "worker started");
            runner
                .run(std::time::Duration::from_secs(poll_secs.max(1)))
                .await?;
        }
        Commands::Simulate => {}
    }

    Ok(())
}
