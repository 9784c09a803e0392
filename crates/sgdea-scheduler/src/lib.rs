//! # SGDEA Scheduler
//!
//! Background jobs of the records-management system: trigger scanning,
//! notification materialization, delivery dispatch, task escalation and
//! retention housekeeping.
//!
//! ## Design Principles
//! - SQLite persistence, one connection per process
//! - Every job is a function of `now`, so runs are reproducible in tests
//! - Jobs never hold state between runs; reruns are idempotent
//! - Per-item failures are logged and counted, never abort a batch
//!
//! ## Architecture
//! ```text
//! JobScheduler (cron, tokio interval)
//!   ├── scan      "0 7 * * *"    TriggerSource → triggers::scan → Materializer → notifications
//!   ├── dispatch  "*/10 * * * *" notifications → Dispatcher → EmailSender / SmsSender
//!   ├── escalate  "0 * * * *"    WorkflowStore::overdue_tasks → escalate_overdue → audit_log
//!   └── cleanup   "30 2 * * 0"   housekeeping::cleanup → purge + archive
//! ```

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod escalation;
pub mod housekeeping;
pub mod materialize;
pub mod persistence;
pub mod pipeline;
pub mod report;
pub mod triggers;

pub use dispatch::{DispatchReport, Dispatcher};
pub use engine::{JobKind, JobScheduler};
pub use escalation::{EscalationReport, escalate_overdue};
pub use housekeeping::{CleanupOptions, CleanupReport, cleanup};
pub use materialize::{Materializer, ScanReport};
pub use persistence::SgdeaDb;
pub use pipeline::{JobReport, Pipeline};
pub use report::{BatchSummary, write_report};
pub use triggers::{TriggerKind, TriggerMatch};
