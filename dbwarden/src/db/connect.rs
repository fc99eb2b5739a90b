//! Connecting: resolve, establish the primary with retry, then attach replicas.

use std::sync::Arc;

use crate::config::{DatabaseConfig, RetrySettings};
use crate::context::Context;
use crate::db::backoff::ExponentialBackoff;
use crate::db::driver::Driver;
use crate::db::handle::Handle;
use crate::db::pools::PoolSet;
use crate::db::resolve::{PoolPolicy, ResolvedConfig, ResolvedTarget};
use crate::errors::{ConfigError, Error, Result};
use crate::trace::{LogTracer, TraceEvent, Tracer};

/// Connect using a [`LogTracer`] configured from `config.log`.
///
/// `ctx` bounds the connect sequence only. The returned handle runs under a fresh context;
/// use [`Handle::bound_to`] to scope it to a request.
pub async fn connect<D: Driver>(driver: D, config: &DatabaseConfig, ctx: &Context) -> Result<Handle<D>> {
    let resolved = config.resolve()?;
    let tracer = Arc::new(LogTracer::new(resolved.trace.clone()));
    connect_resolved(driver, resolved, tracer, ctx).await
}

pub async fn connect_with_tracer<D: Driver>(
    driver: D,
    config: &DatabaseConfig,
    tracer: Arc<dyn Tracer>,
    ctx: &Context,
) -> Result<Handle<D>> {
    let resolved = config.resolve()?;
    connect_resolved(driver, resolved, tracer, ctx).await
}

async fn connect_resolved<D: Driver>(
    driver: D,
    resolved: ResolvedConfig,
    tracer: Arc<dyn Tracer>,
    ctx: &Context,
) -> Result<Handle<D>> {
    if driver.dialect() != resolved.driver {
        return Err(ConfigError::DriverMismatch {
            configured: resolved.driver.to_string(),
            actual: driver.dialect().to_string(),
        }
        .into());
    }

    let primary = establish_primary(
        &driver,
        &resolved.primary,
        &resolved.pool,
        &resolved.retry,
        tracer.as_ref(),
        ctx,
    )
    .await?;

    let mut pools = PoolSet::new(driver, primary, resolved.pool, tracer);
    if let Err(err) = register_replicas(&mut pools, &resolved.replicas) {
        pools.close().await;
        return Err(err);
    }

    Ok(Handle::new(Arc::new(pools), Context::new()))
}

/// Open the primary pool and check it is live, retrying with exponential backoff until
/// `retry.max_elapsed_time` is spent.
///
/// Both the attempts and the waits between them stop early when `ctx` is cancelled.
pub async fn establish_primary<D: Driver>(
    driver: &D,
    target: &ResolvedTarget,
    policy: &PoolPolicy,
    retry: &RetrySettings,
    tracer: &dyn Tracer,
    ctx: &Context,
) -> Result<D::Pool> {
    let label = target.label();
    let mut backoff = ExponentialBackoff::new(retry.clone());
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracer.event(TraceEvent::ConnectAttempt {
            target: label.clone(),
            attempt,
        });

        let err = match open_live(driver, target, policy, ctx).await? {
            Ok(pool) => {
                tracer.event(TraceEvent::Connected {
                    target: label,
                    attempts: attempt,
                    elapsed: backoff.elapsed(),
                });
                return Ok(pool);
            }
            Err(err) => err,
        };

        let Some(delay) = backoff.next_backoff() else {
            tracer.event(TraceEvent::ConnectFailed {
                target: label.clone(),
                attempts: attempt,
                elapsed: backoff.elapsed(),
                error: err.to_string(),
            });
            return Err(Error::ConnectFailed {
                target: label,
                attempts: attempt,
                elapsed: backoff.elapsed(),
                source: err,
            });
        };

        tracer.event(TraceEvent::ConnectRetry {
            target: label.clone(),
            attempt,
            error: err.to_string(),
            next_delay: delay,
        });
        ctx.run(tokio::time::sleep(delay)).await?;
    }
}

/// One open-then-ping attempt. The outer error is cancellation; the inner one is retried.
/// A pool that isn't handed back is closed, including when `ctx` fires during the ping.
async fn open_live<D: Driver>(
    driver: &D,
    target: &ResolvedTarget,
    policy: &PoolPolicy,
    ctx: &Context,
) -> Result<std::result::Result<D::Pool, sqlx::Error>> {
    let pool = match ctx.run(driver.open(target, policy)).await? {
        Ok(pool) => pool,
        Err(err) => return Ok(Err(err)),
    };

    let pinged = ctx.run(driver.ping(&pool)).await;
    if !matches!(pinged, Ok(Ok(()))) {
        driver.close(&pool).await;
    }
    pinged.map(|ping| ping.map(|()| pool))
}

/// Attach every replica in order. The first failure aborts registration.
pub(crate) fn register_replicas<D: Driver>(pools: &mut PoolSet<D>, replicas: &[ResolvedTarget]) -> Result<()> {
    for (index, target) in replicas.iter().enumerate() {
        let pool = pools
            .driver()
            .register_replica(target, pools.policy())
            .map_err(|source| Error::ReplicaRegistrationFailed {
                index,
                target: target.label(),
                source,
            })?;
        pools.push_replica(pool);
        pools.tracer().event(TraceEvent::ReplicaRegistered {
            target: target.label(),
            index,
        });
    }
    Ok(())
}
