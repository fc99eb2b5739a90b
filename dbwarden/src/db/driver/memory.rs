//! In-memory driver simulating a set of database endpoints.
//!
//! Endpoints are addressed by host name and behave according to a small script: they can be
//! unreachable, fail a number of liveness checks before coming up, refuse replica
//! registration, or answer statements slowly. Every call is appended to a journal.
//!
//! Pools enforce `max_open` with a semaphore, so exhausting one makes `begin` fail with
//! `PoolTimedOut` after the policy's acquire timeout, like a real pool would.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{Driver, Target};
use crate::db::resolve::{DriverKind, PoolPolicy, ResolvedTarget};
use crate::db::statement::Statement;

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `policy` is the pool policy the pool was built with
    Open { host: String, policy: PoolPolicy },
    Ping { host: String, ok: bool },
    RegisterReplica { host: String, policy: PoolPolicy },
    Begin { host: String, conn: u64 },
    Commit { conn: u64 },
    Rollback { conn: u64 },
    /// A transaction connection dropped without commit or rollback
    Released { conn: u64 },
    Statement { host: String, sql: String, conn: Option<u64> },
    Close { host: String },
}

/// How a scripted statement failure surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementFailure {
    NotFound,
    Error(String),
}

impl StatementFailure {
    fn to_sqlx(&self) -> sqlx::Error {
        match self {
            StatementFailure::NotFound => sqlx::Error::RowNotFound,
            StatementFailure::Error(message) => sqlx::Error::Protocol(message.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Script {
    unreachable: bool,
    failing_pings: u32,
    reject_registration: bool,
    latency: Duration,
    ping_latency: Duration,
}

#[derive(Default)]
struct Shared {
    scripts: Mutex<HashMap<String, Script>>,
    journal: Mutex<Vec<Call>>,
    statement_failures: Mutex<Vec<(String, StatementFailure)>>,
    semaphores: Mutex<HashMap<String, (Arc<Semaphore>, usize)>>,
    next_conn: AtomicU64,
    fail_next_commit: AtomicBool,
    fail_next_rollback: AtomicBool,
}

impl Shared {
    fn record(&self, call: Call) {
        self.journal.lock().push(call);
    }

    fn script(&self, host: &str) -> Script {
        self.scripts.lock().get(host).cloned().unwrap_or_default()
    }

    fn edit(&self, host: &str, f: impl FnOnce(&mut Script)) {
        f(self.scripts.lock().entry(host.to_string()).or_default());
    }

    fn statement_failure(&self, sql: &str) -> Option<sqlx::Error> {
        self.statement_failures
            .lock()
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, failure)| failure.to_sqlx())
    }
}

/// Simulated driver. Clones share state, so a test can keep one to script and inspect.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
}

impl fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDriver").finish_non_exhaustive()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to `host` until [`MemoryDriver::reachable`] is called.
    pub fn unreachable(&self, host: &str) {
        self.shared.edit(host, |s| s.unreachable = true);
    }

    pub fn reachable(&self, host: &str) {
        self.shared.edit(host, |s| s.unreachable = false);
    }

    /// Fail the next `count` liveness checks against `host`.
    pub fn fail_pings(&self, host: &str, count: u32) {
        self.shared.edit(host, |s| s.failing_pings = count);
    }

    pub fn reject_registration(&self, host: &str) {
        self.shared.edit(host, |s| s.reject_registration = true);
    }

    /// Delay every statement served by `host`.
    pub fn set_latency(&self, host: &str, latency: Duration) {
        self.shared.edit(host, |s| s.latency = latency);
    }

    /// Delay every liveness check against `host`.
    pub fn set_ping_latency(&self, host: &str, latency: Duration) {
        self.shared.edit(host, |s| s.ping_latency = latency);
    }

    /// Statements whose SQL contains `needle` fail with `failure`.
    pub fn fail_statements_containing(&self, needle: &str, failure: StatementFailure) {
        self.shared.statement_failures.lock().push((needle.to_string(), failure));
    }

    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_rollback(&self) {
        self.shared.fail_next_rollback.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.journal.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.shared.journal.lock().iter().filter(|call| predicate(call)).count()
    }

    /// `(host, sql)` for every statement served, in order.
    pub fn statements(&self) -> Vec<(String, String)> {
        self.shared
            .journal
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Statement { host, sql, .. } => Some((host.clone(), sql.clone())),
                _ => None,
            })
            .collect()
    }

    /// Policy of the most recent pool built for `host`, by `open` or `register_replica`.
    pub fn policy(&self, host: &str) -> Option<PoolPolicy> {
        self.shared.journal.lock().iter().rev().find_map(|call| match call {
            Call::Open { host: h, policy } | Call::RegisterReplica { host: h, policy } if h == host => Some(*policy),
            _ => None,
        })
    }

    /// Connections currently checked out of the most recent pool opened for `host`.
    pub fn checked_out(&self, host: &str) -> usize {
        self.shared
            .semaphores
            .lock()
            .get(host)
            .map(|(semaphore, max)| max - semaphore.available_permits())
            .unwrap_or(0)
    }

    fn pool(&self, target: &ResolvedTarget, policy: &PoolPolicy) -> MemoryPool {
        let max = policy.max_open.max(1) as usize;
        let permits = Arc::new(Semaphore::new(max));
        self.shared
            .semaphores
            .lock()
            .insert(target.host.clone(), (permits.clone(), max));

        MemoryPool {
            host: target.host.clone(),
            permits,
            acquire_timeout: policy.acquire_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn acquire(&self, pool: &MemoryPool) -> Result<OwnedSemaphorePermit, sqlx::Error> {
        if pool.closed.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolClosed);
        }
        match tokio::time::timeout(pool.acquire_timeout, pool.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(sqlx::Error::PoolClosed),
            Err(_) => Err(sqlx::Error::PoolTimedOut),
        }
    }

    async fn serve(&self, host: &str, conn: Option<u64>, statement: &Statement) -> Result<(), sqlx::Error> {
        let script = self.shared.script(host);
        if !script.latency.is_zero() {
            tokio::time::sleep(script.latency).await;
        }
        self.shared.record(Call::Statement {
            host: host.to_string(),
            sql: statement.sql().to_string(),
            conn,
        });
        match self.shared.statement_failure(statement.sql()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run(&self, target: Target<'_, Self>, statement: &Statement) -> Result<String, sqlx::Error> {
        match target {
            Target::Pool(pool) => {
                let _permit = self.acquire(pool).await?;
                self.serve(&pool.host, None, statement).await?;
                Ok(pool.host.clone())
            }
            Target::Transaction(conn) => {
                self.serve(&conn.host, Some(conn.id), statement).await?;
                Ok(conn.host.clone())
            }
        }
    }
}

fn refused(host: &str) -> sqlx::Error {
    sqlx::Error::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("connection to {host} refused"),
    ))
}

/// Pool handle for one simulated endpoint.
#[derive(Clone)]
pub struct MemoryPool {
    host: String,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl MemoryPool {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool").field("host", &self.host).finish_non_exhaustive()
    }
}

/// A checked-out connection holding a transaction.
pub struct MemoryConn {
    id: u64,
    host: String,
    shared: Arc<Shared>,
    resolved: bool,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConn {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        if !self.resolved {
            self.shared.record(Call::Released { conn: self.id });
        }
    }
}

/// A row answered by a simulated endpoint: which host served it and what it was asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRow {
    pub served_by: String,
    pub sql: String,
}

#[async_trait]
impl Driver for MemoryDriver {
    type Pool = MemoryPool;
    type Conn = MemoryConn;
    type Row = MemoryRow;

    fn dialect(&self) -> DriverKind {
        DriverKind::Postgres
    }

    async fn open(&self, target: &ResolvedTarget, policy: &PoolPolicy) -> Result<MemoryPool, sqlx::Error> {
        self.shared.record(Call::Open {
            host: target.host.clone(),
            policy: *policy,
        });
        if self.shared.script(&target.host).unreachable {
            return Err(refused(&target.host));
        }
        Ok(self.pool(target, policy))
    }

    async fn ping(&self, pool: &MemoryPool) -> Result<(), sqlx::Error> {
        let latency = self.shared.script(&pool.host).ping_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let result = {
            let mut scripts = self.shared.scripts.lock();
            let script = scripts.entry(pool.host.clone()).or_default();
            if script.unreachable {
                Err(refused(&pool.host))
            } else if script.failing_pings > 0 {
                script.failing_pings -= 1;
                Err(sqlx::Error::Protocol("the database system is starting up".to_string()))
            } else {
                Ok(())
            }
        };
        self.shared.record(Call::Ping {
            host: pool.host.clone(),
            ok: result.is_ok(),
        });
        result
    }

    fn register_replica(&self, target: &ResolvedTarget, policy: &PoolPolicy) -> Result<MemoryPool, sqlx::Error> {
        if self.shared.script(&target.host).reject_registration {
            return Err(sqlx::Error::Configuration(
                format!("replica {} rejected registration", target.host).into(),
            ));
        }
        self.shared.record(Call::RegisterReplica {
            host: target.host.clone(),
            policy: *policy,
        });
        Ok(self.pool(target, policy))
    }

    async fn begin(&self, pool: &MemoryPool) -> Result<MemoryConn, sqlx::Error> {
        if self.shared.script(&pool.host).unreachable {
            return Err(refused(&pool.host));
        }
        let permit = self.acquire(pool).await?;
        let id = self.shared.next_conn.fetch_add(1, Ordering::SeqCst);
        self.shared.record(Call::Begin {
            host: pool.host.clone(),
            conn: id,
        });
        Ok(MemoryConn {
            id,
            host: pool.host.clone(),
            shared: self.shared.clone(),
            resolved: false,
            _permit: permit,
        })
    }

    async fn commit(&self, mut conn: MemoryConn) -> Result<(), sqlx::Error> {
        conn.resolved = true;
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.shared.record(Call::Released { conn: conn.id });
            return Err(sqlx::Error::Protocol("could not serialize access".to_string()));
        }
        self.shared.record(Call::Commit { conn: conn.id });
        Ok(())
    }

    async fn rollback(&self, mut conn: MemoryConn) -> Result<(), sqlx::Error> {
        conn.resolved = true;
        if self.shared.fail_next_rollback.swap(false, Ordering::SeqCst) {
            self.shared.record(Call::Released { conn: conn.id });
            return Err(sqlx::Error::Protocol("connection reset during rollback".to_string()));
        }
        self.shared.record(Call::Rollback { conn: conn.id });
        Ok(())
    }

    async fn execute(&self, target: Target<'_, Self>, statement: &Statement) -> Result<u64, sqlx::Error> {
        self.run(target, statement).await?;
        Ok(1)
    }

    async fn fetch_all(&self, target: Target<'_, Self>, statement: &Statement) -> Result<Vec<MemoryRow>, sqlx::Error> {
        let served_by = self.run(target, statement).await?;
        Ok(vec![MemoryRow {
            served_by,
            sql: statement.sql().to_string(),
        }])
    }

    async fn close(&self, pool: &MemoryPool) {
        pool.closed.store(true, Ordering::SeqCst);
        self.shared.record(Call::Close {
            host: pool.host.clone(),
        });
    }
}
