//! # dbwarden: resilient PostgreSQL connection management
//!
//! `dbwarden` sits between an application and its database. It validates connection
//! configuration up front, keeps retrying the primary with exponential backoff while the
//! database is still coming up, attaches read replicas for read/write splitting, and runs
//! transactions that always release their connection, whether the body succeeds, fails or
//! panics.
//!
//! ## Connecting
//!
//! [`connect`] takes a driver, the `database` block of the [`Config`] and a [`Context`]:
//!
//! 1. The configuration is resolved: the driver selector is checked, each target is validated
//!    and rendered into a connection string, and zero pool fields are replaced by defaults
//!    (50 idle / 100 open / 3600s lifetime). Nothing here touches the network, and nothing
//!    rejected here is ever retried.
//! 2. The primary is opened and pinged. Failures are retried with jittered exponential
//!    backoff for up to 180 seconds (configurable), after which [`Error::ConnectFailed`]
//!    carries the last underlying error. Cancelling the context stops the loop with
//!    [`Error::Cancelled`].
//! 3. Each replica is registered in order. Any registration failure fails the whole connect.
//!
//! ## Handles
//!
//! A [`Handle`] is a cheap, cloneable view over the shared pools. Writes go to the primary;
//! reads are spread round robin across replicas, falling back to the primary when there are
//! none. [`Handle::bound_to`] scopes a handle to a request context and
//! [`Handle::with_modifiers`] queues clauses such as [`Modifier::for_update`] for the next
//! call only.
//!
//! ## Transactions
//!
//! [`Handle::transaction`] commits when the body returns `Ok`, rolls back and returns the
//! body's error unchanged on `Err`, and rolls back then resumes the panic if the body panics.
//! Starting a transaction on a handle that is already in one joins it instead of opening a
//! second physical transaction.
//!
//! ## Observability
//!
//! Connect attempts, statements and transaction boundaries are reported as [`TraceEvent`]s to
//! a [`Tracer`]. The default [`LogTracer`] forwards them to `tracing` and `metrics`.

pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod telemetry;
pub mod trace;

#[cfg(test)]
mod test;

pub use config::Config;
pub use context::{CancelReason, Context};
pub use db::connect::{connect, connect_with_tracer};
pub use db::driver::{Driver, MemoryDriver, PgDriver};
pub use db::handle::{Handle, Route};
pub use db::modifier::{LockStrength, LockWait, Modifier, ReadPreference};
pub use db::statement::{Statement, Value};
pub use db::transaction::{TransactionScope, TxState};
pub use errors::{ConfigError, Error, Result};
pub use trace::{LogTracer, TraceEvent, TraceLevel, Tracer};
