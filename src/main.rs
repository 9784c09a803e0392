//! # SGDEA: records-management background jobs
//!
//! Trigger scanning, notification delivery, task escalation and retention
//! housekeeping over the SGDEA database.
//!
//! Usage:
//!   sgdea init                        # Create database and default config
//!   sgdea scan --dry-run              # Preview notifications
//!   sgdea dispatch --report           # Deliver and write a JSON report
//!   sgdea cleanup --force             # Purge + archive without prompting
//!   sgdea schedule                    # Run every job on its cron schedule

use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sgdea_core::config::{SgdeaConfig, expand_path};
use sgdea_core::traits::{AuditLog, NotificationStore};
use sgdea_core::types::{NewUser, NotificationStatus};
use sgdea_scheduler::{CleanupOptions, Dispatcher, JobReport, JobScheduler, Pipeline, write_report};

#[derive(Parser)]
#[command(
    name = "sgdea",
    version,
    about = "📁 SGDEA notification, escalation and retention jobs"
)]
struct Cli {
    /// Config file (default: ~/.sgdea/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and write a default config if none exists
    Init,
    /// Evaluate every trigger and create notifications
    Scan {
        #[arg(long)]
        dry_run: bool,
        /// Write a JSON report to reports.dir
        #[arg(long)]
        report: bool,
    },
    /// Send recent critical/high notifications by e-mail and SMS
    Dispatch {
        /// Look-back window (default: notifications.dispatch_window_minutes)
        #[arg(long)]
        window_minutes: Option<u32>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        report: bool,
    },
    /// Escalate overdue workflow tasks
    Escalate {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        report: bool,
    },
    /// Purge old notifications and archive completed workflows
    Cleanup {
        /// Archive workflows without asking
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        archived_days: Option<u32>,
        #[arg(long)]
        read_days: Option<u32>,
        #[arg(long)]
        non_critical_days: Option<u32>,
        #[arg(long)]
        workflow_days: Option<u32>,
        #[arg(long)]
        report: bool,
    },
    /// Run scan, dispatch and escalate once
    RunAll {
        #[arg(long)]
        report: bool,
    },
    /// Run jobs on their cron schedules until Ctrl-C
    Schedule {
        #[arg(long)]
        report: bool,
    },
    /// Inspect and update a user's notifications
    #[command(subcommand)]
    Notifications(NotificationsCommand),
    /// Manage users
    #[command(subcommand)]
    User(UserCommand),
    /// Show recent audit entries
    Audit {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum NotificationsCommand {
    /// List a user's notifications, newest first
    List {
        #[arg(long)]
        user: i64,
        /// pending, read or archived
        #[arg(long)]
        status: Option<NotificationStatus>,
    },
    /// Mark a notification as read
    Read { id: i64 },
    /// Archive a notification
    Archive { id: i64 },
}

#[derive(Subcommand)]
enum UserCommand {
    /// Register a user
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, default_value = "user")]
        role: String,
        /// Escalation supervisor
        #[arg(long)]
        supervisor: Option<i64>,
    },
    /// List all users
    List,
}

fn load_config(path: Option<&str>) -> Result<(SgdeaConfig, PathBuf)> {
    let path = path
        .map(expand_path)
        .unwrap_or_else(SgdeaConfig::default_path);
    let mut config = if path.exists() {
        SgdeaConfig::load_from(&path)?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        SgdeaConfig::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok((config, path))
}

fn save_report<T: serde::Serialize>(
    config: &SgdeaConfig,
    enabled: bool,
    job: &str,
    report: &T,
) -> Result<()> {
    if !enabled {
        return Ok(());
    }
    let path = write_report(&expand_path(&config.reports.dir), job, report, Utc::now())?;
    println!("💾 Report: {}", path.display());
    Ok(())
}

/// Ask before archiving workflows. Non-interactive runs need `--force`.
fn confirm_workflow_archive(days: u32) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        tracing::warn!("⚠️ Not a terminal: skipping workflow archival (use --force)");
        return Ok(false);
    }
    print!("Archive completed workflow instances older than {days} days? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "s" | "si" | "sí"))
}

fn open_pipeline(config: SgdeaConfig) -> Result<Pipeline> {
    let email = sgdea_channels::email_from_config(&config.email)?;
    let sms = sgdea_channels::sms_from_config(&config.sms)?;
    let dispatcher = Dispatcher::new(email, sms);
    if !dispatcher.has_email() && !dispatcher.has_sms() {
        tracing::debug!("No delivery channels enabled");
    }
    Pipeline::open(config, dispatcher).context("Failed to open database")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "sgdea=debug,sgdea_scheduler=debug,sgdea_channels=debug"
    } else {
        "sgdea=info,sgdea_scheduler=info,sgdea_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let (config, config_path) = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Init => {
            if !config_path.exists() {
                config.save_to(&config_path)?;
                println!("📝 Config written: {}", config_path.display());
            }
            let db_path = expand_path(&config.database.path);
            open_pipeline(config)?;
            println!("✅ Database ready: {}", db_path.display());
        }
        Command::Scan { dry_run, report } => {
            let pipeline = open_pipeline(config)?;
            let result = pipeline.run_scan(Utc::now(), dry_run)?;
            println!("{}", JobReport::Scan(result.clone()));
            save_report(pipeline.config(), report, "scan", &result)?;
        }
        Command::Dispatch {
            window_minutes,
            dry_run,
            report,
        } => {
            let pipeline = open_pipeline(config)?;
            let result = pipeline.run_dispatch(window_minutes, Utc::now(), dry_run).await?;
            println!("{}", JobReport::Dispatch(result.clone()));
            save_report(pipeline.config(), report, "dispatch", &result)?;
        }
        Command::Escalate { dry_run, report } => {
            let pipeline = open_pipeline(config)?;
            let result = pipeline.run_escalation(Utc::now(), dry_run)?;
            println!("{}", JobReport::Escalate(result.clone()));
            for o in &result.outcomes {
                println!(
                    "  task #{:<6} {:?} {} → {}",
                    o.task_id,
                    o.action,
                    o.from,
                    o.to.map(|t| t.to_string()).unwrap_or_else(|| "-".into())
                );
            }
            save_report(pipeline.config(), report, "escalate", &result)?;
        }
        Command::Cleanup {
            force,
            dry_run,
            archived_days,
            read_days,
            non_critical_days,
            workflow_days,
            report,
        } => {
            let mut policy = config.retention.clone();
            policy.archived_days = archived_days.unwrap_or(policy.archived_days);
            policy.read_days = read_days.unwrap_or(policy.read_days);
            policy.non_critical_days = non_critical_days.unwrap_or(policy.non_critical_days);
            policy.workflow_archive_days = workflow_days.unwrap_or(policy.workflow_archive_days);

            let archive_workflows =
                force || dry_run || confirm_workflow_archive(policy.workflow_archive_days)?;
            let pipeline = open_pipeline(config)?;
            let result = pipeline.run_cleanup(
                &policy,
                CleanupOptions {
                    archive_workflows,
                    dry_run,
                },
                Utc::now(),
            )?;
            println!("{result}");
            save_report(pipeline.config(), report, "cleanup", &result)?;
        }
        Command::RunAll { report } => {
            let pipeline = open_pipeline(config)?;
            let reports = pipeline.run_all(Utc::now()).await?;
            for r in &reports {
                println!("{r}\n");
            }
            save_report(pipeline.config(), report, "run-all", &reports)?;
        }
        Command::Schedule { report } => {
            let pipeline = open_pipeline(config)?;
            run_schedule(&pipeline, report).await?;
        }
        Command::Notifications(cmd) => {
            let pipeline = open_pipeline(config)?;
            notifications(&pipeline, cmd)?;
        }
        Command::User(cmd) => {
            let pipeline = open_pipeline(config)?;
            users(&pipeline, cmd)?;
        }
        Command::Audit { limit } => {
            let pipeline = open_pipeline(config)?;
            let events = pipeline.db().recent_events(limit)?;
            if events.is_empty() {
                println!("No audit entries.");
            }
            for e in events {
                println!(
                    "{}  {:<24} {:<8} {:<20} {}",
                    e.created_at.format("%Y-%m-%d %H:%M:%S"),
                    e.event_type,
                    e.actor,
                    e.subject,
                    e.details.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn run_schedule(pipeline: &Pipeline, report: bool) -> Result<()> {
    let config = pipeline.config();
    let mut scheduler = JobScheduler::from_config(&config.schedule, Utc::now())?;
    let check_every = config.schedule.check_interval_secs.max(1);
    tracing::info!("⏰ Scheduler started (check every {check_every}s)");

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(check_every));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => {
                tracing::info!("🛑 Scheduler stopped");
                return Ok(());
            }
        }

        let now = Utc::now();
        for job in scheduler.due(now) {
            match pipeline.run_job(job, now).await {
                Ok(result) => {
                    if result.has_failures() {
                        tracing::warn!("⚠️ Job '{job}' finished with failures");
                    }
                    if let Err(e) = save_report(config, report, job.as_str(), &result) {
                        tracing::warn!("⚠️ Report for '{job}' not written: {e}");
                    }
                }
                Err(e) => tracing::error!("❌ Job '{job}' failed: {e}"),
            }
        }
    }
}

fn notifications(pipeline: &Pipeline, cmd: NotificationsCommand) -> Result<()> {
    let db = pipeline.db();
    let now = Utc::now();
    match cmd {
        NotificationsCommand::List { user, status } => {
            let rows = db.list_for_user(user, status)?;
            if rows.is_empty() {
                println!("No notifications.");
            }
            for n in rows {
                println!(
                    "#{:<6} {:<9} {:<8} {}  {}",
                    n.id,
                    n.status,
                    n.priority,
                    n.created_at.format("%Y-%m-%d %H:%M"),
                    n.title
                );
            }
        }
        NotificationsCommand::Read { id } => {
            if db.mark_read(id, now)? {
                println!("✅ Notification #{id} marked as read");
            } else {
                println!("⚠️ Notification #{id} is not pending");
            }
        }
        NotificationsCommand::Archive { id } => {
            if db.archive(id, now)? {
                println!("✅ Notification #{id} archived");
            } else {
                println!("⚠️ Notification #{id} cannot be archived");
            }
        }
    }
    Ok(())
}

fn users(pipeline: &Pipeline, cmd: UserCommand) -> Result<()> {
    let db = pipeline.db();
    match cmd {
        UserCommand::Add {
            name,
            email,
            phone,
            role,
            supervisor,
        } => {
            let id = db.create_user(
                &NewUser {
                    name: name.clone(),
                    email,
                    phone,
                    role: role.clone(),
                    supervisor_id: supervisor,
                },
                Utc::now(),
            )?;
            println!("✅ User #{id} '{name}' ({role}) created");
        }
        UserCommand::List => {
            for u in db.list_users()? {
                println!(
                    "#{:<5} {:<20} {:<12} {:<30} {}{}",
                    u.id,
                    u.name,
                    u.role,
                    u.email.as_deref().unwrap_or("-"),
                    u.supervisor_id
                        .map(|s| format!("supervisor #{s}"))
                        .unwrap_or_default(),
                    if u.active { "" } else { " (inactive)" }
                );
            }
        }
    }
    Ok(())
}
