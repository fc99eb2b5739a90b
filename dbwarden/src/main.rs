use anyhow::Context as _;
use clap::Parser;
use dbwarden::{Config, Context, Handle, PgDriver, Route, connect, telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}

/// Ping the primary and then each replica.
async fn check_routes(db: &Handle<PgDriver>) -> Vec<(Route, bool)> {
    let routes = std::iter::once(Route::Primary).chain((0..db.replica_count()).map(Route::Replica));

    let mut results = Vec::new();
    for route in routes {
        let ok = match db.ping(route).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%route, error = %e, "Health check failed");
                false
            }
        };
        results.push((route, ok));
    }
    results
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = dbwarden::config::Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;

    tracing::debug!("{:?}", args);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let ctx = Context::from_token(shutdown);
    let db = connect(PgDriver::new(), &config.database, &ctx)
        .await
        .context("Failed to connect to database")?;

    let results = check_routes(&db.bound_to(&ctx)).await;
    let healthy = results.iter().filter(|(_, ok)| *ok).count();
    info!(healthy, total = results.len(), replicas = db.replica_count(), "Database check complete");

    db.close().await;

    if healthy < results.len() {
        anyhow::bail!("{} of {} database routes failed their health check", results.len() - healthy, results.len());
    }
    Ok(())
}
