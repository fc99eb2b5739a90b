//! Request-scoped handles.
//!
//! A [`Handle`] is a cheap view over the shared [`PoolSet`]: it carries the caller's
//! [`Context`], the transaction it is bound to (if any) and the modifier clauses queued for
//! its next call. Cloning a handle never opens a connection.

use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::Arc;

use tokio::time::Instant;

use crate::context::Context;
use crate::db::driver::{Driver, Target};
use crate::db::modifier::{Clauses, Modifier};
use crate::db::pools::PoolSet;
use crate::db::statement::Statement;
use crate::db::transaction::{TxShared, TxState};
use crate::errors::{Error, Result};
use crate::trace::TraceEvent;

/// Where a statement was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Primary,
    Replica(usize),
    /// The connection held by the handle's transaction
    Transaction,
}

impl Route {
    /// Low-cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Route::Primary => "primary",
            Route::Replica(_) => "replica",
            Route::Transaction => "transaction",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Replica(index) => write!(f, "replica[{index}]"),
            other => f.write_str(other.kind()),
        }
    }
}

pub struct Handle<D: Driver> {
    pub(crate) pools: Arc<PoolSet<D>>,
    pub(crate) ctx: Context,
    pub(crate) tx: Option<Arc<TxShared<D>>>,
    clauses: Clauses,
}

impl<D: Driver> Clone for Handle<D> {
    fn clone(&self) -> Self {
        Self {
            pools: self.pools.clone(),
            ctx: self.ctx.clone(),
            tx: self.tx.clone(),
            clauses: self.clauses,
        }
    }
}

impl<D: Driver> fmt::Debug for Handle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("pools", &self.pools)
            .field("transaction", &self.tx.as_ref().map(|tx| tx.id()))
            .field("clauses", &self.clauses)
            .finish()
    }
}

impl<D: Driver> Handle<D> {
    pub(crate) fn new(pools: Arc<PoolSet<D>>, ctx: Context) -> Self {
        Self {
            pools,
            ctx,
            tx: None,
            clauses: Clauses::default(),
        }
    }

    pub(crate) fn in_transaction(&self, tx: Arc<TxShared<D>>, ctx: Context) -> Self {
        Self {
            pools: self.pools.clone(),
            ctx,
            tx: Some(tx),
            clauses: Clauses::default(),
        }
    }

    /// A copy of this handle whose operations run under `ctx`.
    pub fn bound_to(&self, ctx: &Context) -> Self {
        Self {
            ctx: ctx.clone(),
            ..self.clone()
        }
    }

    /// A copy of this handle with `modifiers` queued for its next call, applied left to
    /// right after any already queued. The receiver is left untouched.
    pub fn with_modifiers<I>(&self, modifiers: I) -> Self
    where
        I: IntoIterator<Item = Modifier>,
    {
        Self {
            clauses: self.clauses.fold(modifiers),
            ..self.clone()
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn pending_clauses(&self) -> Clauses {
        self.clauses
    }

    pub fn is_transactional(&self) -> bool {
        self.tx.is_some()
    }

    /// State of the bound transaction, or `None` for a non-transactional handle.
    pub async fn transaction_state(&self) -> Option<TxState> {
        match &self.tx {
            Some(tx) => Some(tx.state().await),
            None => None,
        }
    }

    pub fn replica_count(&self) -> usize {
        self.pools.replica_count()
    }

    pub fn driver(&self) -> &D {
        self.pools.driver()
    }

    /// Run a write. Goes to the bound transaction, otherwise the primary.
    ///
    /// Pending modifiers are consumed; lock clauses only apply to reads.
    pub async fn execute(&mut self, statement: impl Into<Statement>) -> Result<u64> {
        let statement = statement.into();
        self.clauses = Clauses::default();
        let driver = self.pools.driver();

        match &self.tx {
            Some(tx) => {
                let mut slot = self.ctx.run(tx.lock()).await?;
                let conn = slot.conn_mut()?;
                let result = self
                    .traced(
                        Route::Transaction,
                        &statement,
                        driver.execute(Target::Transaction(conn), &statement),
                        |rows: &u64| *rows,
                    )
                    .await;
                tx.release_if_abandoned(&mut slot);
                result
            }
            None => {
                self.traced(
                    Route::Primary,
                    &statement,
                    driver.execute(Target::Pool(self.pools.write()), &statement),
                    |rows: &u64| *rows,
                )
                .await
            }
        }
    }

    /// Run a read and collect every row.
    ///
    /// Routing: the bound transaction if there is one; the primary when a lock clause or a
    /// primary read preference is pending; otherwise the next replica.
    pub async fn fetch_all(&mut self, statement: impl Into<Statement>) -> Result<Vec<D::Row>> {
        let (_, rows) = self.fetch(statement.into()).await?;
        Ok(rows)
    }

    /// Like [`Handle::fetch_all`] but expects at least one row.
    pub async fn fetch_one(&mut self, statement: impl Into<Statement>) -> Result<D::Row> {
        let (route, rows) = self.fetch(statement.into()).await?;
        rows.into_iter().next().ok_or(Error::OperationFailed {
            route,
            source: sqlx::Error::RowNotFound,
        })
    }

    async fn fetch(&mut self, statement: Statement) -> Result<(Route, Vec<D::Row>)> {
        let clauses = mem::take(&mut self.clauses);
        let statement = match clauses.lock {
            Some(lock) => statement.with_suffix(&lock.to_string()),
            None => statement,
        };
        let driver = self.pools.driver();

        match &self.tx {
            Some(tx) => {
                let mut slot = self.ctx.run(tx.lock()).await?;
                let conn = slot.conn_mut()?;
                let rows = self
                    .traced(
                        Route::Transaction,
                        &statement,
                        driver.fetch_all(Target::Transaction(conn), &statement),
                        |rows: &Vec<D::Row>| rows.len() as u64,
                    )
                    .await;
                tx.release_if_abandoned(&mut slot);
                Ok((Route::Transaction, rows?))
            }
            None => {
                let (route, pool) = if clauses.requires_primary() {
                    (Route::Primary, self.pools.write())
                } else {
                    self.pools.read()
                };
                let rows = self
                    .traced(
                        route,
                        &statement,
                        driver.fetch_all(Target::Pool(pool), &statement),
                        |rows: &Vec<D::Row>| rows.len() as u64,
                    )
                    .await?;
                Ok((route, rows))
            }
        }
    }

    async fn traced<T, F>(&self, route: Route, statement: &Statement, fut: F, rows: impl Fn(&T) -> u64) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let outcome = self.ctx.run(fut).await?;
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => {
                self.pools.tracer().event(TraceEvent::Statement {
                    route,
                    sql: statement.sql().to_string(),
                    elapsed,
                    rows: Some(rows(&value)),
                    error: None,
                    not_found: false,
                });
                Ok(value)
            }
            Err(source) => {
                self.pools.tracer().event(TraceEvent::Statement {
                    route,
                    sql: statement.sql().to_string(),
                    elapsed,
                    rows: None,
                    error: Some(source.to_string()),
                    not_found: matches!(source, sqlx::Error::RowNotFound),
                });
                Err(Error::OperationFailed { route, source })
            }
        }
    }

    /// Liveness check against one pool route.
    pub async fn ping(&self, route: Route) -> Result<()> {
        let pool = self.pools.get(route).ok_or_else(|| Error::OperationFailed {
            route,
            source: sqlx::Error::Configuration(format!("no pool behind {route}").into()),
        })?;
        self.ctx
            .run(self.pools.driver().ping(pool))
            .await?
            .map_err(|source| Error::OperationFailed { route, source })
    }

    /// Close every pool behind this handle. Other handles sharing them stop working too.
    pub async fn close(&self) {
        self.pools.close().await;
    }
}
