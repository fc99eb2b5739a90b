//! Logging initialization.
//!
//! Console output through `tracing-subscriber`'s fmt layer, filtered by `RUST_LOG`
//! (default `info`). For example, to see every statement the connection layer reports:
//!
//! ```bash
//! RUST_LOG=dbwarden=debug dbwarden -f config.yaml
//! ```

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    info!("Telemetry initialized");
    Ok(())
}
