
use std::time::Duration;

use tokio::time::Instant;

use crate::context::{CancelReason, Context};
use crate::db::connect::{connect, connect_with_tracer};
use crate::db::driver::MemoryDriver;
use crate::db::driver::memory::{Call, StatementFailure};
use crate::db::handle::Route;
use crate::db::modifier::{LockStrength, LockWait, Modifier};
use crate::db::statement::Statement;
use crate::db::transaction::TxState;
use crate::errors::{ConfigError, Error};
use crate::trace::{TraceEvent, TxPhase};
use utils::{AppError, RecordingTracer, create_test_config, create_test_handle, create_test_target, try_connect};

// Connecting

#[tokio::test(start_paused = true)]
async fn test_unsupported_driver_fails_before_any_network_activity() {
    let driver = MemoryDriver::new();
    driver.set_latency("primary", Duration::from_secs(5));
    let mut config = create_test_config(&[]);
    config.driver = "mysql".to_string();

    let started = Instant::now();
    let (result, tracer) = try_connect(&driver, &config).await;

    match result {
        Err(Error::ConfigInvalid(ConfigError::UnsupportedDriver(name))) => assert_eq!(name, "mysql"),
        other => panic!("expected UnsupportedDriver, got {other:?}"),
    }
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(driver.calls().is_empty());
    assert!(tracer.events().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_malformed_replica_rejected_up_front() {
    let driver = MemoryDriver::new();
    let mut config = create_test_config(&["r0"]);
    config.replicas[0].dbname = String::new();

    let (result, _) = try_connect(&driver, &config).await;

    match result {
        Err(Error::ConfigInvalid(ConfigError::MalformedTarget { target, reason })) => {
            assert_eq!(target, "replica[0]");
            assert_eq!(reason, "dbname is empty");
        }
        other => panic!("expected MalformedTarget, got {other:?}"),
    }
    assert!(driver.calls().is_empty(), "no connection may be attempted");
}

#[tokio::test(start_paused = true)]
async fn test_flaky_primary_connects_within_budget() {
    let driver = MemoryDriver::new();
    driver.fail_pings("primary", 5);

    let started = Instant::now();
    let (db, tracer) = create_test_handle(&driver, &[]).await;

    assert!(started.elapsed() < Duration::from_secs(180));
    assert_eq!(tracer.count(|e| matches!(e, TraceEvent::ConnectAttempt { .. })), 6);
    assert_eq!(tracer.count(|e| matches!(e, TraceEvent::ConnectRetry { .. })), 5);
    assert_eq!(
        tracer.count(|e| matches!(e, TraceEvent::Connected { attempts: 6, .. })),
        1
    );
    // every pool that failed its ping was closed again
    assert_eq!(driver.count(|c| matches!(c, Call::Open { .. })), 6);
    assert_eq!(driver.count(|c| matches!(c, Call::Close { .. })), 5);
    assert_eq!(db.replica_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_primary_never_live_fails_at_retry_budget() {
    let driver = MemoryDriver::new();
    driver.unreachable("primary");

    let started = Instant::now();
    let (result, tracer) = try_connect(&driver, &create_test_config(&[])).await;
    let elapsed = started.elapsed();

    let err = result.unwrap_err();
    assert!(err.is_connect_error());
    match err {
        Error::ConnectFailed {
            target,
            attempts,
            elapsed: reported,
            source,
        } => {
            assert_eq!(target, "primary(primary:5432/app)");
            assert!(attempts > 1);
            assert!(reported >= Duration::from_secs(180));
            assert!(matches!(source, sqlx::Error::Io(_)));
        }
        other => panic!("expected ConnectFailed, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_secs(180));
    assert!(elapsed < Duration::from_secs(181), "{elapsed:?}");
    assert_eq!(tracer.count(|e| matches!(e, TraceEvent::ConnectFailed { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_retry_loop() {
    let driver = MemoryDriver::new();
    driver.unreachable("primary");
    let ctx = Context::new();

    let task = {
        let driver = driver.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = connect(driver, &create_test_config(&[]), &ctx).await;
            (result, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_secs(10)).await;
    ctx.cancel();
    let (result, elapsed) = task.await.unwrap();

    assert!(matches!(
        result,
        Err(Error::Cancelled {
            reason: CancelReason::Token
        })
    ));
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(11), "{elapsed:?}");

    // nothing keeps retrying after the caller gave up
    let attempts = driver.count(|c| matches!(c, Call::Open { .. }));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(driver.count(|c| matches!(c, Call::Open { .. })), attempts);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_aborts_retry_loop() {
    let driver = MemoryDriver::new();
    driver.unreachable("primary");
    let ctx = Context::new().with_timeout(Duration::from_secs(30));
    let tracer = std::sync::Arc::new(RecordingTracer::default());

    let started = Instant::now();
    let result = connect_with_tracer(driver, &create_test_config(&[]), tracer, &ctx).await;

    assert!(matches!(
        result,
        Err(Error::Cancelled {
            reason: CancelReason::Deadline
        })
    ));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() < Duration::from_secs(31));
}

#[test_log::test(tokio::test)]
async fn test_replica_registration_failure_fails_whole_connect() {
    let driver = MemoryDriver::new();
    driver.reject_registration("r1");

    let (result, _) = try_connect(&driver, &create_test_config(&["r0", "r1", "r2"])).await;

    match result {
        Err(Error::ReplicaRegistrationFailed { index, target, .. }) => {
            assert_eq!(index, 1);
            assert_eq!(target, "replica[1](r1:5432/app)");
        }
        other => panic!("expected ReplicaRegistrationFailed, got {other:?}"),
    }
    // the primary and the replica registered before the failure are closed again
    assert_eq!(driver.count(|c| matches!(c, Call::RegisterReplica { .. })), 1);
    assert_eq!(driver.count(|c| matches!(c, Call::Close { .. })), 2);
}

// Routing and modifiers

#[test_log::test(tokio::test)]
async fn test_reads_round_robin_and_writes_hit_primary() {
    let driver = MemoryDriver::new();
    let (db, tracer) = create_test_handle(&driver, &["r0", "r1"]).await;
    let mut handle = db.clone();

    let mut served_by = Vec::new();
    for _ in 0..4 {
        let rows = handle.fetch_all("SELECT id FROM users").await.unwrap();
        served_by.push(rows[0].served_by.clone());
    }
    assert_eq!(served_by, ["r0", "r1", "r0", "r1"]);

    handle.execute("UPDATE users SET active = true").await.unwrap();
    let statements = driver.statements();
    assert_eq!(statements.last().unwrap().0, "primary");

    let routes: Vec<Route> = tracer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TraceEvent::Statement { route, .. } => Some(route),
            _ => None,
        })
        .collect();
    assert_eq!(
        routes,
        [
            Route::Replica(0),
            Route::Replica(1),
            Route::Replica(0),
            Route::Replica(1),
            Route::Primary
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_reads_use_primary_without_replicas() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &[]).await;

    let rows = db.clone().fetch_all("SELECT 1").await.unwrap();
    assert_eq!(rows[0].served_by, "primary");
}

#[test_log::test(tokio::test)]
async fn test_for_update_applies_to_exactly_one_call() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &["r0"]).await;

    let mut locked = db.with_modifiers([Modifier::for_update()]);
    locked
        .fetch_all(Statement::new("SELECT * FROM jobs WHERE id = $1;").bind(7))
        .await
        .unwrap();
    locked.fetch_all("SELECT * FROM jobs").await.unwrap();
    db.clone().fetch_all("SELECT * FROM jobs").await.unwrap();

    assert_eq!(
        driver.statements(),
        [
            ("primary".to_string(), "SELECT * FROM jobs WHERE id = $1 FOR UPDATE".to_string()),
            ("r0".to_string(), "SELECT * FROM jobs".to_string()),
            ("r0".to_string(), "SELECT * FROM jobs".to_string()),
        ]
    );
    assert!(db.pending_clauses().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_no_modifiers_is_a_plain_call() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &["r0"]).await;

    let mut handle = db.with_modifiers(Vec::<Modifier>::new());
    assert!(handle.pending_clauses().is_empty());
    handle.fetch_all("SELECT * FROM jobs").await.unwrap();

    assert_eq!(driver.statements(), [("r0".to_string(), "SELECT * FROM jobs".to_string())]);
}

#[test_log::test(tokio::test)]
async fn test_conflicting_locks_last_wins() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &[]).await;

    let mut handle = db.with_modifiers([
        Modifier::for_share(),
        Modifier::lock(LockStrength::Update, LockWait::SkipLocked),
    ]);
    handle.fetch_all("SELECT * FROM jobs LIMIT 1").await.unwrap();

    let (_, sql) = driver.statements().pop().unwrap();
    assert_eq!(sql, "SELECT * FROM jobs LIMIT 1 FOR UPDATE SKIP LOCKED");
    assert_eq!(sql.matches("FOR ").count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_writes_ignore_lock_but_consume_it() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &["r0"]).await;

    let mut handle = db.with_modifiers([Modifier::for_update()]);
    handle.execute("UPDATE jobs SET state = 'done'").await.unwrap();
    handle.fetch_all("SELECT * FROM jobs").await.unwrap();

    assert_eq!(
        driver.statements(),
        [
            ("primary".to_string(), "UPDATE jobs SET state = 'done'".to_string()),
            ("r0".to_string(), "SELECT * FROM jobs".to_string()),
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_operation_failure_is_wrapped_with_route() {
    let driver = MemoryDriver::new();
    driver.fail_statements_containing(
        "missing_table",
        StatementFailure::Error("relation \"missing_table\" does not exist".to_string()),
    );
    driver.fail_statements_containing("id = 0", StatementFailure::NotFound);
    let (db, tracer) = create_test_handle(&driver, &["r0"]).await;
    let mut handle = db.clone();

    match handle.fetch_all("SELECT * FROM missing_table").await {
        Err(Error::OperationFailed { route, source }) => {
            assert_eq!(route, Route::Replica(0));
            assert!(source.to_string().contains("missing_table"));
        }
        other => panic!("expected OperationFailed, got {other:?}"),
    }

    let err = handle.fetch_one("SELECT * FROM users WHERE id = 0").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!err.is_connect_error());

    assert_eq!(
        tracer.count(|e| matches!(e, TraceEvent::Statement { error: Some(_), .. })),
        2
    );
    assert_eq!(
        tracer.count(|e| matches!(e, TraceEvent::Statement { not_found: true, .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_statement_duration_is_reported() {
    let driver = MemoryDriver::new();
    let (db, tracer) = create_test_handle(&driver, &[]).await;
    driver.set_latency("primary", Duration::from_millis(300));

    db.clone().execute("UPDATE users SET active = false").await.unwrap();

    let elapsed = tracer
        .events()
        .into_iter()
        .find_map(|e| match e {
            TraceEvent::Statement { elapsed, rows, .. } => {
                assert_eq!(rows, Some(1));
                Some(elapsed)
            }
            _ => None,
        })
        .unwrap();
    assert!(elapsed >= Duration::from_millis(300));
}

#[test_log::test(tokio::test)]
async fn test_cancelled_context_stops_statement() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &[]).await;
    let ctx = Context::new();
    ctx.cancel();

    let err = db.bound_to(&ctx).execute("DELETE FROM sessions").await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(driver.statements().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_ping_each_route() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &["r0"]).await;

    db.ping(Route::Primary).await.unwrap();
    db.ping(Route::Replica(0)).await.unwrap();
    assert!(matches!(
        db.ping(Route::Replica(3)).await,
        Err(Error::OperationFailed {
            route: Route::Replica(3),
            ..
        })
    ));
}

// Transactions

#[test_log::test(tokio::test)]
async fn test_transaction_commits_on_ok() {
    let driver = MemoryDriver::new();
    let (db, tracer) = create_test_handle(&driver, &["r0"]).await;

    let (value, leaked) = db
        .transaction(|mut tx| async move {
            tx.execute("INSERT INTO orders (id) VALUES (1)").await?;
            let rows = tx.fetch_all("SELECT * FROM orders").await?;
            Ok::<_, Error>((rows.len(), tx))
        })
        .await
        .unwrap();

    assert_eq!(value, 1);
    assert_eq!(leaked.transaction_state().await, Some(TxState::Committed));
    // reads inside the transaction stay on its connection
    assert!(driver.calls().iter().any(|c| matches!(
        c,
        Call::Statement { host, conn: Some(_), sql } if host == "primary" && sql == "SELECT * FROM orders"
    )));
    assert_eq!(driver.count(|c| matches!(c, Call::Commit { .. })), 1);
    assert_eq!(driver.checked_out("primary"), 0);
    assert_eq!(tracer.phases(), [TxPhase::Begin, TxPhase::Commit]);
}

#[test_log::test(tokio::test)]
async fn test_transaction_rolls_back_and_returns_original_error() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &[]).await;

    let result: Result<(), AppError> = db
        .transaction(|mut tx| async move {
            tx.execute("UPDATE accounts SET balance = balance - 10").await?;
            Err(AppError::Validation("insufficient funds".to_string()))
        })
        .await;

    match result {
        Err(AppError::Validation(message)) => assert_eq!(message, "insufficient funds"),
        other => panic!("expected the body's own error, got {other:?}"),
    }
    assert_eq!(driver.count(|c| matches!(c, Call::Rollback { .. })), 1);
    assert_eq!(driver.count(|c| matches!(c, Call::Commit { .. })), 0);
    assert_eq!(driver.checked_out("primary"), 0);
}

#[test_log::test(tokio::test)]
async fn test_transaction_rolls_back_and_resumes_panic() {
    let driver = MemoryDriver::new();
    let (db, tracer) = create_test_handle(&driver, &[]).await;

    let joined = tokio::spawn(async move {
        db.transaction(|mut tx| async move {
            tx.execute("UPDATE accounts SET balance = 0").await?;
            if tx.is_transactional() {
                panic!("boom");
            }
            Ok::<(), Error>(())
        })
        .await
    })
    .await;

    let err = joined.unwrap_err();
    assert!(err.is_panic());
    let payload = err.into_panic();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));

    assert_eq!(driver.count(|c| matches!(c, Call::Rollback { .. })), 1);
    assert_eq!(driver.count(|c| matches!(c, Call::Released { .. })), 0);
    assert_eq!(driver.checked_out("primary"), 0);
    assert_eq!(tracer.phases(), [TxPhase::Begin, TxPhase::Rollback]);
}

#[test_log::test(tokio::test)]
async fn test_rollback_failure_does_not_mask_body_error() {
    let driver = MemoryDriver::new();
    let (db, tracer) = create_test_handle(&driver, &[]).await;
    driver.fail_next_rollback();

    let result: Result<(), AppError> = db
        .transaction(|_tx| async move { Err(AppError::Validation("rejected".to_string())) })
        .await;

    assert!(matches!(result, Err(AppError::Validation(_))));
    assert_eq!(tracer.count(|e| matches!(e, TraceEvent::RollbackFailed { .. })), 1);
    assert_eq!(driver.checked_out("primary"), 0);
}

#[test_log::test(tokio::test)]
async fn test_commit_failure_surfaces() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &[]).await;
    driver.fail_next_commit();

    let result = db
        .transaction(|mut tx| async move { tx.execute("INSERT INTO audit VALUES (1)").await })
        .await;

    assert!(matches!(result, Err(Error::CommitFailed { .. })));
    assert_eq!(driver.count(|c| matches!(c, Call::Released { .. })), 1);
    assert_eq!(driver.checked_out("primary"), 0);
}

#[test_log::test(tokio::test)]
async fn test_nested_transaction_joins_parent() {
    let driver = MemoryDriver::new();
    let (db, tracer) = create_test_handle(&driver, &[]).await;

    db.transaction(|tx| async move {
        tx.clone().execute("INSERT INTO orders (id) VALUES (1)").await?;
        tx.transaction(|mut inner| async move { inner.execute("INSERT INTO order_lines (order_id) VALUES (1)").await })
            .await
    })
    .await
    .unwrap();

    assert_eq!(driver.count(|c| matches!(c, Call::Begin { .. })), 1);
    assert_eq!(driver.count(|c| matches!(c, Call::Commit { .. })), 1);
    let conns: Vec<_> = driver
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Statement { conn, .. } => Some(conn),
            _ => None,
        })
        .collect();
    assert_eq!(conns.len(), 2);
    assert!(conns[0].is_some());
    assert_eq!(conns[0], conns[1]);
    assert_eq!(tracer.phases(), [TxPhase::Begin, TxPhase::Joined, TxPhase::Commit]);
}

#[test_log::test(tokio::test)]
async fn test_nested_failure_marks_parent_rollback_only() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &[]).await;

    let result: Result<(), Error> = db
        .transaction(|tx| async move {
            let inner: Result<(), AppError> = tx
                .transaction(|_inner| async move { Err(AppError::Validation("line item rejected".to_string())) })
                .await;
            assert!(matches!(inner, Err(AppError::Validation(_))));
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(Error::RollbackOnly)));
    assert_eq!(driver.count(|c| matches!(c, Call::Rollback { .. })), 1);
    assert_eq!(driver.count(|c| matches!(c, Call::Commit { .. })), 0);
}

#[test_log::test(tokio::test)]
async fn test_explicit_scope_commit_and_rollback() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &[]).await;
    let ctx = Context::new();

    let mut scope = db.begin(&ctx).await.unwrap();
    assert!(!scope.is_joined());
    scope.handle_mut().execute("INSERT INTO t VALUES (1)").await.unwrap();
    assert_eq!(scope.state().await, TxState::Active);
    scope.commit().await.unwrap();

    let scope = db.begin(&ctx).await.unwrap();
    let mut leaked = scope.handle();
    scope.rollback().await.unwrap();

    match leaked.execute("INSERT INTO t VALUES (2)").await {
        Err(Error::TransactionClosed { state }) => assert_eq!(state, TxState::RolledBack),
        other => panic!("expected TransactionClosed, got {other:?}"),
    }
    assert!(matches!(
        leaked.begin(&ctx).await,
        Err(Error::TransactionClosed {
            state: TxState::RolledBack
        })
    ));
    assert_eq!(driver.count(|c| matches!(c, Call::Statement { .. })), 1);
}

#[test_log::test(tokio::test)]
async fn test_dropped_scope_releases_connection_once() {
    let driver = MemoryDriver::new();
    let (db, tracer) = create_test_handle(&driver, &[]).await;

    let scope = db.begin(&Context::new()).await.unwrap();
    let leaked = scope.handle();
    assert_eq!(driver.checked_out("primary"), 1);
    drop(scope);

    assert_eq!(driver.checked_out("primary"), 0);
    assert_eq!(driver.count(|c| matches!(c, Call::Released { .. })), 1);
    assert_eq!(leaked.transaction_state().await, Some(TxState::RolledBack));
    assert_eq!(tracer.phases(), [TxPhase::Begin, TxPhase::Abandoned]);
}

#[tokio::test(start_paused = true)]
async fn test_scope_dropped_mid_statement_closes_transaction() {
    let driver = MemoryDriver::new();
    let (db, tracer) = create_test_handle(&driver, &[]).await;
    driver.set_latency("primary", Duration::from_secs(1));

    let scope = db.begin(&Context::new()).await.unwrap();
    let mut leaked = scope.handle();
    let mut in_flight = scope.handle();
    let statement = tokio::spawn(async move { in_flight.execute("UPDATE jobs SET state = 'running'").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    drop(scope);
    assert_eq!(driver.checked_out("primary"), 1);

    // started before the drop, so it completes; the connection goes back right after
    assert_eq!(statement.await.unwrap().unwrap(), 1);
    assert_eq!(driver.checked_out("primary"), 0);
    assert_eq!(driver.count(|c| matches!(c, Call::Released { .. })), 1);

    match leaked.execute("UPDATE jobs SET state = 'done'").await {
        Err(Error::TransactionClosed { state }) => assert_eq!(state, TxState::RolledBack),
        other => panic!("expected TransactionClosed, got {other:?}"),
    }
    assert_eq!(leaked.transaction_state().await, Some(TxState::RolledBack));
    assert_eq!(driver.count(|c| matches!(c, Call::Statement { .. })), 1);
    assert_eq!(driver.count(|c| matches!(c, Call::Commit { .. })), 0);
    assert_eq!(tracer.phases(), [TxPhase::Begin, TxPhase::Abandoned]);
}

#[test_log::test(tokio::test)]
async fn test_joined_scope_fails_after_parent_resolved() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &[]).await;
    let ctx = Context::new();

    let outer = db.begin(&ctx).await.unwrap();
    let inner = outer.handle().begin(&ctx).await.unwrap();
    assert!(inner.is_joined());
    outer.commit().await.unwrap();
    match inner.rollback().await {
        Err(Error::TransactionClosed { state }) => assert_eq!(state, TxState::Committed),
        other => panic!("expected TransactionClosed, got {other:?}"),
    }

    let outer = db.begin(&ctx).await.unwrap();
    let inner = outer.handle().begin(&ctx).await.unwrap();
    outer.rollback().await.unwrap();
    assert!(matches!(
        inner.commit().await,
        Err(Error::TransactionClosed {
            state: TxState::RolledBack
        })
    ));

    assert_eq!(driver.count(|c| matches!(c, Call::Commit { .. })), 1);
    assert_eq!(driver.count(|c| matches!(c, Call::Rollback { .. })), 1);
    assert_eq!(driver.checked_out("primary"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_replica_pools_share_the_pool_policy() {
    let driver = MemoryDriver::new();
    let mut config = create_test_config(&["r0"]);
    config.max_idle_conns = 7;
    config.max_open_conns = 1;
    config.conn_max_life_time_sec = 90;
    config.acquire_timeout_secs = 1;
    let (db, _) = try_connect(&driver, &config).await;
    let db = db.unwrap();

    let primary = driver.policy("primary").unwrap();
    assert_eq!(primary.max_idle, 7);
    assert_eq!(primary.max_open, 1);
    assert_eq!(primary.max_lifetime, Duration::from_secs(90));
    assert_eq!(driver.policy("r0"), Some(primary));

    driver.set_latency("r0", Duration::from_secs(5));
    let mut slow = db.clone();
    let read = tokio::spawn(async move { slow.fetch_all("SELECT * FROM reports").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.checked_out("r0"), 1);

    match db.clone().fetch_all("SELECT 1").await {
        Err(Error::OperationFailed { route, source }) => {
            assert_eq!(route, Route::Replica(0));
            assert!(matches!(source, sqlx::Error::PoolTimedOut));
        }
        other => panic!("expected OperationFailed, got {other:?}"),
    }

    assert_eq!(read.await.unwrap().unwrap().len(), 1);
    assert_eq!(driver.checked_out("r0"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pool_exhaustion_fails_begin() {
    let driver = MemoryDriver::new();
    let mut config = create_test_config(&[]);
    config.max_open_conns = 1;
    config.acquire_timeout_secs = 1;
    let (db, _) = try_connect(&driver, &config).await;
    let db = db.unwrap();
    let ctx = Context::new();

    let held = db.begin(&ctx).await.unwrap();
    match db.begin(&ctx).await {
        Err(Error::BeginFailed { source }) => assert!(matches!(source, sqlx::Error::PoolTimedOut)),
        other => panic!("expected BeginFailed, got {other:?}"),
    }

    held.rollback().await.unwrap();
    db.begin(&ctx).await.unwrap().commit().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_lock_inside_transaction_stays_on_its_connection() {
    let driver = MemoryDriver::new();
    let (db, _) = create_test_handle(&driver, &["r0"]).await;

    db.transaction(|tx| async move {
        let mut locked = tx.with_modifiers([Modifier::for_update()]);
        locked.fetch_all("SELECT * FROM jobs WHERE id = 1").await?;
        Ok::<_, Error>(())
    })
    .await
    .unwrap();

    assert!(driver.calls().iter().any(|c| matches!(
        c,
        Call::Statement { host, conn: Some(_), sql } if host == "primary" && sql.ends_with("FOR UPDATE")
    )));
}

#[test]
fn test_target_fixture_is_valid() {
    let config = crate::config::DatabaseConfig {
        primary: create_test_target("db"),
        ..Default::default()
    };
    assert!(config.resolve().is_ok());
}
