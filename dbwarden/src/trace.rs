//! Structured events emitted by the connection layer.
//!
//! The layer never formats or renders anything itself: it hands [`TraceEvent`]s to a
//! [`Tracer`]. [`LogTracer`] is the default implementation and forwards events to `tracing`
//! and `metrics`, applying the severity and slow-statement thresholds from
//! [`TraceSettings`].

use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TraceSettings;
use crate::db::handle::Route;

/// Severity threshold for statement events, least to most verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Silent,
    Error,
    Warn,
    Info,
}

/// Transaction lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Begin,
    Commit,
    Rollback,
    /// A nested scope attached to an already active transaction
    Joined,
    /// The scope was dropped while still active; the driver discards the transaction
    Abandoned,
}

#[derive(Debug, Clone)]
pub enum TraceEvent {
    ConnectAttempt {
        target: String,
        attempt: u32,
    },
    ConnectRetry {
        target: String,
        attempt: u32,
        error: String,
        next_delay: Duration,
    },
    Connected {
        target: String,
        attempts: u32,
        elapsed: Duration,
    },
    ConnectFailed {
        target: String,
        attempts: u32,
        elapsed: Duration,
        error: String,
    },
    ReplicaRegistered {
        target: String,
        index: usize,
    },
    Statement {
        route: Route,
        sql: String,
        elapsed: Duration,
        /// Rows affected or returned; `None` when the statement failed
        rows: Option<u64>,
        error: Option<String>,
        /// The failure was "no rows"
        not_found: bool,
    },
    Transaction {
        id: Uuid,
        phase: TxPhase,
    },
    RollbackFailed {
        id: Uuid,
        error: String,
    },
}

/// Receiver of connection-layer events.
pub trait Tracer: Send + Sync + 'static {
    fn event(&self, event: TraceEvent);
}

/// Forwards events to `tracing` and records `metrics`.
#[derive(Debug, Clone)]
pub struct LogTracer {
    settings: TraceSettings,
}

impl LogTracer {
    pub fn new(settings: TraceSettings) -> Self {
        Self { settings }
    }

    fn is_slow(&self, elapsed: Duration) -> bool {
        !self.settings.slow_threshold.is_zero() && elapsed > self.settings.slow_threshold
    }

    /// Which level, if any, a statement event is reported at.
    pub fn statement_level(&self, elapsed: Duration, failed: bool, not_found: bool) -> Option<TraceLevel> {
        let level = self.settings.log_level;
        if level == TraceLevel::Silent {
            return None;
        }
        if failed && level >= TraceLevel::Error && !(not_found && self.settings.ignore_record_not_found_error) {
            return Some(TraceLevel::Error);
        }
        if self.is_slow(elapsed) && level >= TraceLevel::Warn {
            return Some(TraceLevel::Warn);
        }
        if level == TraceLevel::Info {
            return Some(TraceLevel::Info);
        }
        None
    }
}

impl Default for LogTracer {
    fn default() -> Self {
        Self::new(TraceSettings::default())
    }
}

impl Tracer for LogTracer {
    fn event(&self, event: TraceEvent) {
        match event {
            TraceEvent::ConnectAttempt { target, attempt } => {
                counter!("dbwarden_connect_attempts_total", "target" => target.clone()).increment(1);
                info!(%target, attempt, "Connecting to database");
            }
            TraceEvent::ConnectRetry {
                target,
                attempt,
                error,
                next_delay,
            } => {
                warn!(%target, attempt, %error, ?next_delay, "Database not ready, retrying");
            }
            TraceEvent::Connected { target, attempts, elapsed } => {
                info!(%target, attempts, ?elapsed, "Connected to database");
            }
            TraceEvent::ConnectFailed {
                target,
                attempts,
                elapsed,
                error,
            } => {
                error!(%target, attempts, ?elapsed, %error, "Giving up connecting to database");
            }
            TraceEvent::ReplicaRegistered { target, index } => {
                info!(%target, index, "Registered read replica");
            }
            TraceEvent::Statement {
                route,
                sql,
                elapsed,
                rows,
                error,
                not_found,
            } => {
                counter!("dbwarden_statements_total", "route" => route.kind()).increment(1);
                histogram!("dbwarden_statement_duration_seconds", "route" => route.kind()).record(elapsed.as_secs_f64());
                if self.is_slow(elapsed) {
                    counter!("dbwarden_slow_statements_total", "route" => route.kind()).increment(1);
                }

                let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
                match self.statement_level(elapsed, error.is_some(), not_found) {
                    Some(TraceLevel::Error) => {
                        error!(%route, elapsed_ms, error = error.as_deref().unwrap_or_default(), %sql, "Statement failed");
                    }
                    Some(TraceLevel::Warn) => {
                        warn!(%route, elapsed_ms, ?rows, threshold = ?self.settings.slow_threshold, %sql, "Slow statement");
                    }
                    Some(TraceLevel::Info) => {
                        info!(%route, elapsed_ms, ?rows, %sql, "Statement");
                    }
                    Some(TraceLevel::Silent) | None => {}
                }
            }
            TraceEvent::Transaction { id, phase } => {
                if phase == TxPhase::Abandoned {
                    warn!(%id, "Transaction scope dropped while active");
                } else {
                    tracing::debug!(%id, ?phase, "Transaction");
                }
            }
            TraceEvent::RollbackFailed { id, error } => {
                error!(%id, %error, "Rollback failed");
            }
        }
    }
}
