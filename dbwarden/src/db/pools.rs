//! Primary and replica pools with read/write routing.
//!
//! ```text
//! ┌─────────────┐
//! │   PoolSet   │
//! └──────┬──────┘
//!        │
//!   ┌────┴──────────┐
//!   ↓               ↓
//! ┌───────┐  ┌────────────┐
//! │Primary│  │ Replica[i] │ (zero or more)
//! └───────┘  └────────────┘
//! ```
//!
//! - `.read()` picks the next replica round robin, or the primary if none are registered
//! - `.write()` always returns the primary
//!
//! Transactions always begin on the primary since they may contain writes.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::db::driver::Driver;
use crate::db::handle::Route;
use crate::db::resolve::PoolPolicy;
use crate::trace::Tracer;

/// Every pool opened for one configuration, shared by all handles derived from it.
pub struct PoolSet<D: Driver> {
    driver: D,
    primary: D::Pool,
    replicas: Vec<D::Pool>,
    policy: PoolPolicy,
    tracer: Arc<dyn Tracer>,
    next_replica: AtomicUsize,
}

impl<D: Driver> PoolSet<D> {
    pub(crate) fn new(driver: D, primary: D::Pool, policy: PoolPolicy, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            driver,
            primary,
            replicas: Vec::new(),
            policy,
            tracer,
            next_replica: AtomicUsize::new(0),
        }
    }

    /// Replicas are attached in configuration order, before the set is shared.
    pub(crate) fn push_replica(&mut self, pool: D::Pool) {
        self.replicas.push(pool);
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        self.tracer.as_ref()
    }

    /// Pool for a read that may tolerate replication lag.
    pub fn read(&self) -> (Route, &D::Pool) {
        if self.replicas.is_empty() {
            return (Route::Primary, &self.primary);
        }
        let index = self.next_replica.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        (Route::Replica(index), &self.replicas[index])
    }

    pub fn write(&self) -> &D::Pool {
        &self.primary
    }

    /// The pool behind a pool route. `Route::Transaction` has none.
    pub fn get(&self, route: Route) -> Option<&D::Pool> {
        match route {
            Route::Primary => Some(&self.primary),
            Route::Replica(index) => self.replicas.get(index),
            Route::Transaction => None,
        }
    }

    pub fn has_replicas(&self) -> bool {
        !self.replicas.is_empty()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Close the primary and every replica pool.
    pub async fn close(&self) {
        self.driver.close(&self.primary).await;
        for replica in &self.replicas {
            self.driver.close(replica).await;
        }
        debug!(replicas = self.replicas.len(), "Closed database pools");
    }
}

impl<D: Driver> fmt::Debug for PoolSet<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSet")
            .field("replicas", &self.replicas.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
