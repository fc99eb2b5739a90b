//! Database connection layer.
//!
//! ```text
//! ┌──────────────┐
//! │   resolve    │  (validate config, render connection strings, pool defaults)
//! └──────┬───────┘
//!        │
//!        ↓
//! ┌──────────────┐
//! │   connect    │  (primary with backoff retry, then replicas)
//! └──────┬───────┘
//!        │
//!        ↓
//! ┌──────────────┐
//! │    Handle    │  (routing, modifiers, transactions)
//! └──────┬───────┘
//!        │
//!        ↓
//! ┌──────────────┐
//! │    Driver    │  (sqlx PostgreSQL, or in-memory)
//! └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`resolve`]: configuration validation and connection strings
//! - [`connect`]: the retrying connect sequence and replica registration
//! - [`backoff`]: exponential backoff used by the connect loop
//! - [`pools`]: primary/replica pool set with read/write routing
//! - [`handle`]: request-scoped handles
//! - [`transaction`]: transaction scopes, nesting and panic-safe rollback
//! - [`modifier`]: per-call clauses such as row locks
//! - [`statement`]: SQL text and bind values
//! - [`driver`]: the database client seam
//!
//! # Example
//!
//! ```ignore
//! use dbwarden::{Context, Modifier, PgDriver, connect};
//!
//! let db = connect(PgDriver::new(), &config.database, &Context::new()).await?;
//!
//! let mut handle = db.bound_to(&request_ctx).with_modifiers([Modifier::for_update()]);
//! let rows = handle.fetch_all("SELECT * FROM jobs WHERE state = 'queued' LIMIT 1").await?;
//! ```

pub mod backoff;
pub mod connect;
pub mod driver;
pub mod handle;
pub mod modifier;
pub mod pools;
pub mod resolve;
pub mod statement;
pub mod transaction;
