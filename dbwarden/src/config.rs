//! Configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The
//! configuration file path defaults to `config.yaml` but can be specified via the `-f` flag or
//! the `DBWARDEN_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `DBWARDEN_` override YAML values
//!
//! For nested values, use double underscores: `DBWARDEN_DATABASE__PRIMARY__HOST=db1` sets
//! `database.primary.host`.
//!
//! ## Example
//!
//! ```yaml
//! database:
//!   driver: postgres
//!   max_open_conns: 20
//!   primary:
//!     host: db-primary
//!     port: 5432
//!     username: app
//!     password: secret
//!     dbname: app
//!     search_path: app,public
//!   replicas:
//!     - host: db-replica-1
//!       port: 5432
//!       username: app
//!       password: secret
//!       dbname: app
//!   retry:
//!     max_elapsed_time: 3m
//!   log:
//!     log_level: warn
//!     slow_threshold: 200ms
//! ```
//!
//! The older `master` / `slave` keys are accepted as aliases for `primary` / `replicas`.

use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::db::resolve::{self, ResolvedConfig};
use crate::errors::ConfigError;
use crate::trace::TraceLevel;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "DBWARDEN_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without connecting.
    #[arg(long)]
    pub validate: bool,
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
}

/// Everything needed to reach a primary and its replicas.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Driver selector, e.g. `postgres`
    pub driver: String,
    /// Maximum idle connections kept per pool (0 = default of 50)
    pub max_idle_conns: u32,
    /// Maximum open connections per pool (0 = default of 100)
    pub max_open_conns: u32,
    /// Maximum lifetime of a connection in seconds (0 = default of 3600)
    pub conn_max_life_time_sec: u64,
    /// How long `begin` waits for a free connection before failing (0 = default of 30)
    pub acquire_timeout_secs: u64,
    /// The writable endpoint
    #[serde(alias = "master")]
    pub primary: TargetConfig,
    /// Read replicas, in routing order
    #[serde(alias = "slave")]
    pub replicas: Vec<TargetConfig>,
    /// Backoff used while waiting for the primary to come up
    pub retry: RetrySettings,
    /// Statement tracing thresholds
    pub log: TraceSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "postgres".to_string(),
            max_idle_conns: 0,
            max_open_conns: 0,
            conn_max_life_time_sec: 0,
            acquire_timeout_secs: 0,
            primary: TargetConfig::default(),
            replicas: Vec::new(),
            retry: RetrySettings::default(),
            log: TraceSettings::default(),
        }
    }
}

impl DatabaseConfig {
    /// Validate and resolve into connection strings and a pool policy. No I/O.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        resolve::resolve(self)
    }
}

/// One database endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub dbname: String,
    /// Optional schema search path; blank means the server default
    pub search_path: Option<String>,
    /// Require TLS (`sslmode=require`) instead of disabling it
    pub ssl_enable: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            username: String::new(),
            password: String::new(),
            dbname: String::new(),
            search_path: None,
            ssl_enable: false,
        }
    }
}

/// Exponential backoff parameters for the primary connect loop.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Each interval is spread by +/- this fraction
    pub randomization_factor: f64,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Total wall-clock budget for the connect loop
    #[serde(with = "humantime_serde")]
    pub max_elapsed_time: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(180),
        }
    }
}

/// Statement tracing configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceSettings {
    /// Severity threshold for statement events
    pub log_level: TraceLevel,
    /// Statements slower than this are reported at warn level (0 disables)
    #[serde(with = "humantime_serde")]
    pub slow_threshold: Duration,
    /// Don't report "no rows" results as errors
    pub ignore_record_not_found_error: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            log_level: TraceLevel::Warn,
            slow_threshold: Duration::from_millis(200),
            ignore_record_not_found_error: false,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration without touching the network
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.resolve().map(|_| ())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // DBWARDEN_CONFIG names the file itself, not a setting
            .merge(Env::prefixed("DBWARDEN_").ignore(&["config"]).split("__"))
    }
}
