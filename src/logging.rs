//! Leveled log sink writing into `timetable.log`.
//!
//! Every scheduler-visible event is mirrored to `tracing` for console
//! output and, subject to the verbosity filter, appended to the log
//! table so operators can inspect a run from the database alone. Each
//! call is a single insert; the sink is safe to share across runners.

use sqlx::PgPool;
use tracing::{debug, error, info, warn};

/// Severity levels stored in `timetable.log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Notice,
    Log,
    Error,
    Panic,
    User,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Notice => "NOTICE",
            Self::Log => "LOG",
            Self::Error => "ERROR",
            Self::Panic => "PANIC",
            Self::User => "USER",
        }
    }

    /// DEBUG, NOTICE and LOG rows are only kept when verbose logging
    /// is on; ERROR, PANIC and USER are always recorded.
    fn chatty(&self) -> bool {
        matches!(self, Self::Debug | Self::Notice | Self::Log)
    }
}

/// Handle to the database log table.
#[derive(Clone)]
pub struct DbLogger {
    pool: PgPool,
    client_name: Option<String>,
    verbose: bool,
}

impl DbLogger {
    pub fn new(pool: PgPool, client_name: Option<String>, verbose: bool) -> Self {
        Self {
            pool,
            client_name,
            verbose,
        }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Record one message. A `Panic` entry is written unconditionally
    /// and then terminates the process with a non-zero exit code.
    pub async fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "chainwheel::dblog", "{message}"),
            LogLevel::Notice | LogLevel::Log | LogLevel::User => {
                info!(target: "chainwheel::dblog", "{message}")
            }
            LogLevel::Error => warn!(target: "chainwheel::dblog", "{message}"),
            LogLevel::Panic => error!(target: "chainwheel::dblog", "{message}"),
        }

        if !self.verbose && level.chatty() {
            return;
        }

        let written = sqlx::query(
            r#"
            INSERT INTO timetable.log (client_name, pid, log_level, message)
            VALUES ($1, $2, $3::timetable.log_type, $4)
            "#,
        )
        .bind(&self.client_name)
        .bind(std::process::id() as i64)
        .bind(level.as_str())
        .bind(message)
        .execute(&self.pool)
        .await;

        if let Err(err) = written {
            error!(?err, "failed to append to timetable.log");
        }

        if level == LogLevel::Panic {
            std::process::exit(1);
        }
    }
}
