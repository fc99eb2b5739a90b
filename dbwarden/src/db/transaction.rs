//! Transaction lifecycle: `Idle -> Active -> {Committed, RolledBack}`.
//!
//! A transaction owns exactly one physical connection, taken from the primary pool by
//! [`Handle::begin`]. The connection leaves the transaction exactly once: on commit, on
//! rollback, or when the owning [`TransactionScope`] is dropped unresolved.
//!
//! Calling `begin` on a handle that is already bound to a transaction does not open a second
//! one. The new scope joins the existing transaction: committing it is a no-op, and rolling it
//! back (or failing inside [`Handle::transaction`]) marks the outer transaction
//! rollback-only, so its eventual commit rolls back and reports [`Error::RollbackOnly`].
//!
//! ```ignore
//! let user_id = handle
//!     .transaction(|mut tx| async move {
//!         tx.execute(Statement::new("INSERT INTO users (email) VALUES ($1)").bind(email)).await?;
//!         let row = tx.fetch_one("SELECT currval('users_id_seq')").await?;
//!         Ok::<_, Error>(row)
//!     })
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::context::Context;
use crate::db::driver::Driver;
use crate::db::handle::Handle;
use crate::errors::{Error, Result};
use crate::trace::{TraceEvent, TxPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxState::Active => "active",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled back",
        })
    }
}

pub(crate) struct TxSlot<D: Driver> {
    conn: Option<D::Conn>,
    state: TxState,
}

impl<D: Driver> TxSlot<D> {
    pub(crate) fn conn_mut(&mut self) -> Result<&mut D::Conn> {
        match (self.state, self.conn.as_mut()) {
            (TxState::Active, Some(conn)) => Ok(conn),
            (TxState::Active, None) => Err(Error::TransactionClosed {
                state: TxState::RolledBack,
            }),
            (state, _) => Err(Error::TransactionClosed { state }),
        }
    }

    /// Move the connection out, recording the state it leaves the transaction in.
    fn take(&mut self, next: TxState) -> Result<D::Conn> {
        if self.state != TxState::Active {
            return Err(Error::TransactionClosed { state: self.state });
        }
        let conn = self.conn.take().ok_or(Error::TransactionClosed {
            state: TxState::RolledBack,
        })?;
        self.state = next;
        Ok(conn)
    }
}

/// State shared by every handle and scope bound to one physical transaction.
pub(crate) struct TxShared<D: Driver> {
    id: Uuid,
    rollback_only: AtomicBool,
    /// The owning scope was dropped unresolved.
    abandoned: AtomicBool,
    slot: Mutex<TxSlot<D>>,
}

impl<D: Driver> TxShared<D> {
    fn new(conn: D::Conn) -> Self {
        Self {
            id: Uuid::new_v4(),
            rollback_only: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            slot: Mutex::new(TxSlot {
                conn: Some(conn),
                state: TxState::Active,
            }),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Serializes statements on the transaction's connection.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, TxSlot<D>> {
        let mut slot = self.slot.lock().await;
        self.release_if_abandoned(&mut slot);
        slot
    }

    pub(crate) async fn state(&self) -> TxState {
        self.lock().await.state
    }

    /// Discard the connection of an abandoned transaction. Called by whoever holds the slot.
    pub(crate) fn release_if_abandoned(&self, slot: &mut TxSlot<D>) {
        if self.abandoned.load(Ordering::SeqCst) && slot.state == TxState::Active {
            slot.state = TxState::RolledBack;
            // the driver discards a transaction whose connection is dropped
            drop(slot.conn.take());
        }
    }

    fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }
}

/// An open transaction, or a nested scope joined to one.
///
/// Resolve it with [`TransactionScope::commit`] or [`TransactionScope::rollback`]. Dropping an
/// unresolved top-level scope discards the transaction; dropping an unresolved joined scope
/// marks the outer transaction rollback-only.
#[must_use = "a transaction scope must be committed or rolled back"]
pub struct TransactionScope<D: Driver> {
    handle: Handle<D>,
    tx: Arc<TxShared<D>>,
    joined: bool,
    resolved: bool,
}

impl<D: Driver> fmt::Debug for TransactionScope<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.tx.id)
            .field("joined", &self.joined)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl<D: Driver> TransactionScope<D> {
    pub fn id(&self) -> Uuid {
        self.tx.id
    }

    /// True when this scope joined an already active transaction.
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// A handle bound to this transaction. It outlives the scope but fails with
    /// [`Error::TransactionClosed`] once the transaction is resolved.
    pub fn handle(&self) -> Handle<D> {
        self.handle.clone()
    }

    pub fn handle_mut(&mut self) -> &mut Handle<D> {
        &mut self.handle
    }

    pub async fn state(&self) -> TxState {
        self.tx.state().await
    }

    fn trace(&self, event: TraceEvent) {
        self.handle.pools.tracer().event(event);
    }

    /// Commit the transaction. For a joined scope this only checks the outer transaction is
    /// still active; the outermost scope decides.
    pub async fn commit(mut self) -> Result<()> {
        if self.joined {
            self.resolved = true;
            return match self.tx.state().await {
                TxState::Active => Ok(()),
                state => Err(Error::TransactionClosed { state }),
            };
        }

        self.handle.ctx.check()?;
        self.resolved = true;

        let driver = self.handle.pools.driver();
        let mut slot = self.tx.lock().await;

        if self.tx.is_rollback_only() {
            let conn = slot.take(TxState::RolledBack)?;
            if let Err(err) = driver.rollback(conn).await {
                self.trace(TraceEvent::RollbackFailed {
                    id: self.tx.id,
                    error: err.to_string(),
                });
            }
            self.trace(TraceEvent::Transaction {
                id: self.tx.id,
                phase: TxPhase::Rollback,
            });
            return Err(Error::RollbackOnly);
        }

        let conn = slot.take(TxState::Committed)?;
        match driver.commit(conn).await {
            Ok(()) => {
                self.trace(TraceEvent::Transaction {
                    id: self.tx.id,
                    phase: TxPhase::Commit,
                });
                Ok(())
            }
            Err(source) => {
                // the server discards a transaction whose commit didn't go through
                slot.state = TxState::RolledBack;
                Err(Error::CommitFailed { source })
            }
        }
    }

    /// Roll the transaction back. For a joined scope this marks the outer transaction
    /// rollback-only, and fails if the outer transaction is already resolved.
    pub async fn rollback(mut self) -> Result<()> {
        self.roll_back().await
    }

    async fn roll_back(&mut self) -> Result<()> {
        self.resolved = true;
        if self.joined {
            return match self.tx.state().await {
                TxState::Active => {
                    self.tx.mark_rollback_only();
                    Ok(())
                }
                state => Err(Error::TransactionClosed { state }),
            };
        }

        let driver = self.handle.pools.driver();
        let conn = self.tx.lock().await.take(TxState::RolledBack)?;
        let result = driver.rollback(conn).await;
        self.trace(TraceEvent::Transaction {
            id: self.tx.id,
            phase: TxPhase::Rollback,
        });
        result.map_err(|source| Error::RollbackFailed { source })
    }

    /// Roll back after the body failed. A rollback failure is reported to the tracer and
    /// never replaces the body's own error.
    async fn abort(mut self) {
        if let Err(err) = self.roll_back().await {
            match err {
                Error::TransactionClosed { .. } => {}
                other => self.trace(TraceEvent::RollbackFailed {
                    id: self.tx.id,
                    error: other.to_string(),
                }),
            }
        }
    }
}

impl<D: Driver> Drop for TransactionScope<D> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if self.joined {
            self.tx.mark_rollback_only();
            return;
        }

        self.trace(TraceEvent::Transaction {
            id: self.tx.id,
            phase: TxPhase::Abandoned,
        });
        self.tx.abandoned.store(true, Ordering::SeqCst);
        // a statement in flight on a cloned handle holds the slot and releases it when done
        if let Ok(mut slot) = self.tx.slot.try_lock() {
            self.tx.release_if_abandoned(&mut slot);
        }
    }
}

impl<D: Driver> Handle<D> {
    /// Start a transaction on the primary, or join the one this handle is bound to.
    ///
    /// The returned scope's handle runs under `ctx`. Fails with [`Error::BeginFailed`] when
    /// the pool can't provide a connection.
    pub async fn begin(&self, ctx: &Context) -> Result<TransactionScope<D>> {
        if let Some(tx) = &self.tx {
            let state = ctx.run(tx.state()).await?;
            if state != TxState::Active {
                return Err(Error::TransactionClosed { state });
            }
            self.pools.tracer().event(TraceEvent::Transaction {
                id: tx.id,
                phase: TxPhase::Joined,
            });
            return Ok(TransactionScope {
                handle: self.in_transaction(tx.clone(), ctx.clone()),
                tx: tx.clone(),
                joined: true,
                resolved: false,
            });
        }

        let driver = self.pools.driver();
        let conn = ctx
            .run(driver.begin(self.pools.write()))
            .await?
            .map_err(|source| Error::BeginFailed { source })?;

        let tx = Arc::new(TxShared::new(conn));
        self.pools.tracer().event(TraceEvent::Transaction {
            id: tx.id,
            phase: TxPhase::Begin,
        });
        Ok(TransactionScope {
            handle: self.in_transaction(tx.clone(), ctx.clone()),
            tx,
            joined: false,
            resolved: false,
        })
    }

    /// Run `body` inside a transaction.
    ///
    /// `body` receives a handle bound to the transaction. If it returns `Ok` the transaction
    /// is committed; if it returns `Err` the transaction is rolled back and that same error is
    /// returned; if it panics the transaction is rolled back and the panic resumes.
    ///
    /// On a handle already bound to a transaction, the body joins it instead.
    pub async fn transaction<F, Fut, T, E>(&self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Handle<D>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let scope = self.begin(&self.ctx).await?;

        match AssertUnwindSafe(body(scope.handle())).catch_unwind().await {
            Ok(Ok(value)) => {
                scope.commit().await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                scope.abort().await;
                Err(err)
            }
            Err(payload) => {
                scope.abort().await;
                panic::resume_unwind(payload)
            }
        }
    }
}
