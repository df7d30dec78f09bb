//! chainwheel - a PostgreSQL-backed task chain scheduler
//!
//! Chains are linked sequences of base tasks (SQL scripts, shell
//! commands or built-ins) stored in the `timetable` schema next to
//! their scheduling configs and run status. The key components are:
//!
//! ## Coordination
//!
//! - [`db`]: data-access layer over the configuration database
//! - [`admission`]: execution-slot admission against the run-status
//!   table (`max_instances`, exclusivity, exclusion sets)
//! - [`scheduler`]: the minute-aligned loop that selects due configs
//!   and spawns runners
//!
//! ## Execution
//!
//! - [`runner`]: sequential chain execution under one transaction
//! - [`dispatch`]: routing of a step to its SQL / shell / built-in
//!   backend
//! - [`tasks`]: the built-in task registry
//!
//! ## Support
//!
//! - [`schedule`]: `run_at` evaluation (`@reboot`, `@every`, `@after`,
//!   aliases, 5-field cron)
//! - [`logging`]: the leveled database log sink
//! - [`config`]: environment-based configuration

pub mod admission;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod logging;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod tasks;

// Configuration
pub use config::Config;

// Database
pub use db::{
    ChainConfig, ChainStep, Database, DbError, DbResult, ExecutionLogEntry, ExecutionStatus,
    TaskKind,
};

// Execution
pub use dispatch::{Dispatcher, StepError};
pub use runner::{ChainRunner, RunOutcome};
pub use tasks::{BuiltinFn, BuiltinFuture, registry};

// Coordination
pub use admission::{Admission, AdmissionController};
pub use scheduler::{SchedulerConfig, SchedulerHandle};

// Schedule utilities
pub use schedule::{Cadence, ConfigClock, ScheduleError, parse_interval};

// Logging
pub use logging::{DbLogger, LogLevel};
