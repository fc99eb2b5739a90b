//! The seam between connection management and an actual database client.
//!
//! [`PgDriver`] talks to PostgreSQL through sqlx. [`MemoryDriver`] simulates endpoints
//! in-process for the test suite and records every call it receives so behaviour can be
//! asserted on.

pub mod memory;
pub mod postgres;

pub use memory::MemoryDriver;
pub use postgres::PgDriver;

use async_trait::async_trait;

use crate::db::resolve::{DriverKind, PoolPolicy, ResolvedTarget};
use crate::db::statement::Statement;

/// Where a statement runs: straight on a pool, or inside a transaction's connection.
pub enum Target<'a, D: Driver + ?Sized> {
    Pool(&'a D::Pool),
    Transaction(&'a mut D::Conn),
}

/// A database client capable of pooled connections and transactions.
///
/// Implementations report failures as `sqlx::Error`; classification into the crate's own
/// error taxonomy happens above this trait.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// A shareable pool of physical connections
    type Pool: Clone + Send + Sync + 'static;
    /// One physical connection holding an open transaction
    type Conn: Send + 'static;
    type Row: Send + 'static;

    /// The SQL dialect this driver speaks.
    fn dialect(&self) -> DriverKind;

    /// Establish a pool for `target`. This performs I/O.
    async fn open(&self, target: &ResolvedTarget, policy: &PoolPolicy) -> Result<Self::Pool, sqlx::Error>;

    /// Liveness check.
    async fn ping(&self, pool: &Self::Pool) -> Result<(), sqlx::Error>;

    /// Build a pool for a read replica without connecting; connections are made on demand.
    fn register_replica(&self, target: &ResolvedTarget, policy: &PoolPolicy) -> Result<Self::Pool, sqlx::Error>;

    async fn begin(&self, pool: &Self::Pool) -> Result<Self::Conn, sqlx::Error>;

    async fn commit(&self, conn: Self::Conn) -> Result<(), sqlx::Error>;

    async fn rollback(&self, conn: Self::Conn) -> Result<(), sqlx::Error>;

    /// Run a statement, returning the number of rows affected.
    async fn execute(&self, target: Target<'_, Self>, statement: &Statement) -> Result<u64, sqlx::Error>;

    async fn fetch_all(&self, target: Target<'_, Self>, statement: &Statement) -> Result<Vec<Self::Row>, sqlx::Error>;

    async fn close(&self, pool: &Self::Pool);
}
