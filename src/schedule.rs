//! Evaluation of stored `run_at` expressions.
//!
//! A config's `run_at` is one of:
//!
//! - `@reboot`: fire once at process start
//! - `@every <interval>`: fire every interval since startup
//! - `@after <interval>`: fire once, interval after the previous
//!   completion
//! - a named alias (`@hourly`, `@daily`, ...)
//! - a standard 5-field Unix cron expression
//!
//! Note: the `cron` crate requires 6 fields (with seconds), so 5-field
//! expressions are normalized by prepending "0 ".

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid interval '{0}'")]
    InvalidInterval(String),
}

/// Parsed form of a `run_at` expression.
#[derive(Debug, Clone)]
pub enum Cadence {
    Reboot,
    Every(Duration),
    After(Duration),
    Cron(Schedule),
}

impl Cadence {
    pub fn parse(run_at: &str) -> Result<Self, ScheduleError> {
        let expr = run_at.trim();
        if expr == "@reboot" {
            return Ok(Self::Reboot);
        }
        if let Some(rest) = expr.strip_prefix("@every") {
            return parse_interval(rest.trim()).map(Self::Every);
        }
        if let Some(rest) = expr.strip_prefix("@after") {
            return parse_interval(rest.trim()).map(Self::After);
        }
        let expr = alias_to_cron(expr).unwrap_or(expr);
        let normalized = normalize_cron_expr(expr);
        Schedule::from_str(&normalized)
            .map(Self::Cron)
            .map_err(|e| ScheduleError::InvalidCron {
                expr: run_at.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Map a named alias to its 5-field expression.
fn alias_to_cron(expr: &str) -> Option<&'static str> {
    match expr {
        "@hourly" => Some("0 * * * *"),
        "@daily" => Some("0 0 * * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@monthly" => Some("0 0 1 * *"),
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        _ => None,
    }
}

/// Convert a 5-field Unix cron expression to the 6-field format the
/// `cron` crate expects, running at second 0 of each match.
fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", cron_expr)
    } else {
        cron_expr.to_string()
    }
}

/// Parse an interval like "30 seconds", "5 minutes", "2 hours",
/// "1 day" or a bare number of seconds.
pub fn parse_interval(text: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(text.to_string());
    let mut parts = text.split_whitespace();
    let count: i64 = parts
        .next()
        .and_then(|n| n.parse().ok())
        .filter(|n| *n > 0)
        .ok_or_else(invalid)?;
    let unit = parts.next().unwrap_or("seconds");
    if parts.next().is_some() {
        return Err(invalid());
    }
    let seconds = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => count,
        "m" | "min" | "mins" | "minute" | "minutes" => count * 60,
        "h" | "hour" | "hours" => count * 3_600,
        "d" | "day" | "days" => count * 86_400,
        _ => return Err(invalid()),
    };
    Ok(Duration::seconds(seconds))
}

/// Per-config firing state kept by the scheduler loop.
#[derive(Debug)]
pub struct ConfigClock {
    cadence: Cadence,
    first_seen: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
}

impl ConfigClock {
    pub fn new(cadence: Cadence, now: DateTime<Utc>) -> Self {
        Self {
            cadence,
            first_seen: now,
            last_fired: None,
        }
    }

    /// Whether `@after` needs the latest completion timestamp looked
    /// up before calling [`ConfigClock::due`].
    pub fn wants_completion_anchor(&self) -> bool {
        matches!(self.cadence, Cadence::After(_))
    }

    /// Whether the config should fire at `now`. `last_completion` is
    /// the latest terminal run-status timestamp for the config and is
    /// only consulted by `@after`.
    pub fn due(&self, now: DateTime<Utc>, last_completion: Option<DateTime<Utc>>) -> bool {
        match &self.cadence {
            Cadence::Reboot => self.last_fired.is_none(),
            Cadence::Every(interval) => {
                let base = self.last_fired.unwrap_or(self.first_seen);
                now >= base + *interval
            }
            Cadence::After(interval) => {
                // fires once per completion; a config that never
                // completed yet is anchored to first observation
                let anchor = last_completion.unwrap_or(self.first_seen);
                match self.last_fired {
                    Some(fired) if fired >= anchor => false,
                    _ => now >= anchor + *interval,
                }
            }
            Cadence::Cron(schedule) => {
                let from = self.last_fired.unwrap_or(self.first_seen);
                schedule
                    .after(&from)
                    .next()
                    .map(|next| next <= now)
                    .unwrap_or(false)
            }
        }
    }

    pub fn mark_fired(&mut self, now: DateTime<Utc>) {
        self.last_fired = Some(now);
    }
}
