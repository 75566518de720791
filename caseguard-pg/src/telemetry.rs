//! Tracing subscriber setup for caseguard processes.

use caseguard_core::ConfigError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives (e.g. `"info,caseguard::runs=debug"`)
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// # Environment Variables
    /// - `CASEGUARD_LOG`: filter directives (default: `info`)
    /// - `CASEGUARD_LOG_FORMAT`: `json` for JSON lines
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("CASEGUARD_LOG").unwrap_or_else(|_| "info".to_string()),
            json: std::env::var("CASEGUARD_LOG_FORMAT")
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), ConfigError> {
    let env_filter = EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
        field: "CASEGUARD_LOG".to_string(),
        value: config.filter.clone(),
        reason: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|e| ConfigError::InvalidValue {
        field: "tracing subscriber".to_string(),
        value: config.filter.clone(),
        reason: format!("Failed to init subscriber: {}", e),
    })?;

    tracing::debug!(filter = %config.filter, json = config.json, "Telemetry initialized");
    Ok(())
}
