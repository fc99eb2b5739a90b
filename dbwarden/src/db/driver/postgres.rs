//! PostgreSQL over sqlx.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Connection, PgPool, Postgres, Transaction};

use super::{Driver, Target};
use crate::db::resolve::{DriverKind, PoolPolicy, ResolvedTarget};
use crate::db::statement::{Statement, Value};

/// sqlx-backed PostgreSQL driver.
///
/// sqlx pools have no ceiling on idle connections, so `max_idle` is not enforced here:
/// idle connections are closed by sqlx's idle timeout instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

impl PgDriver {
    pub fn new() -> Self {
        Self
    }

    /// Connect options parsed from the target's resolved connection string.
    pub fn connect_options(target: &ResolvedTarget) -> Result<PgConnectOptions, sqlx::Error> {
        target.dsn().parse()
    }

    fn pool_options(policy: &PoolPolicy) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(policy.max_open)
            .max_lifetime(policy.max_lifetime)
            .acquire_timeout(policy.acquire_timeout)
    }
}

fn bind_all<'q>(statement: &'q Statement) -> Query<'q, Postgres, PgArguments> {
    statement
        .binds()
        .iter()
        .fold(sqlx::query(statement.sql()), |query, value| match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
        })
}

#[async_trait]
impl Driver for PgDriver {
    type Pool = PgPool;
    type Conn = Transaction<'static, Postgres>;
    type Row = PgRow;

    fn dialect(&self) -> DriverKind {
        DriverKind::Postgres
    }

    async fn open(&self, target: &ResolvedTarget, policy: &PoolPolicy) -> Result<PgPool, sqlx::Error> {
        Self::pool_options(policy).connect_with(Self::connect_options(target)?).await
    }

    async fn ping(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        let mut conn = pool.acquire().await?;
        conn.ping().await
    }

    fn register_replica(&self, target: &ResolvedTarget, policy: &PoolPolicy) -> Result<PgPool, sqlx::Error> {
        Ok(Self::pool_options(policy).connect_lazy_with(Self::connect_options(target)?))
    }

    async fn begin(&self, pool: &PgPool) -> Result<Self::Conn, sqlx::Error> {
        pool.begin().await
    }

    async fn commit(&self, conn: Self::Conn) -> Result<(), sqlx::Error> {
        conn.commit().await
    }

    async fn rollback(&self, conn: Self::Conn) -> Result<(), sqlx::Error> {
        conn.rollback().await
    }

    async fn execute(&self, target: Target<'_, Self>, statement: &Statement) -> Result<u64, sqlx::Error> {
        let query = bind_all(statement);
        let result = match target {
            Target::Pool(pool) => query.execute(pool).await?,
            Target::Transaction(tx) => query.execute(&mut **tx).await?,
        };
        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, target: Target<'_, Self>, statement: &Statement) -> Result<Vec<PgRow>, sqlx::Error> {
        let query = bind_all(statement);
        match target {
            Target::Pool(pool) => query.fetch_all(pool).await,
            Target::Transaction(tx) => query.fetch_all(&mut **tx).await,
        }
    }

    async fn close(&self, pool: &PgPool) {
        pool.close().await;
    }
}
