//! Configuration types

use crate::error::ConfigError;
use crate::lock::{LockKeyspace, DEFAULT_LOCK_NAMESPACE, DEFAULT_LOCK_SCALE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-call timeout for backend round trips.
pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 5_000;

/// Default reason recorded on skipped runs.
pub const DEFAULT_SKIP_REASON: &str = "case is locked by another run";

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseGuardConfig {
    /// Namespace + scale used to derive lock keys.
    pub keyspace: LockKeyspace,
    /// Timeout applied to every individual backend call.
    pub backend_timeout: Duration,
    /// Reason stored on runs that were skipped because of contention.
    pub skip_reason: String,
}

impl Default for CaseGuardConfig {
    fn default() -> Self {
        Self {
            keyspace: LockKeyspace::DEFAULT,
            backend_timeout: Duration::from_millis(DEFAULT_BACKEND_TIMEOUT_MS),
            skip_reason: DEFAULT_SKIP_REASON.to_string(),
        }
    }
}

impl CaseGuardConfig {
    /// Create CaseGuardConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CASEGUARD_LOCK_NAMESPACE`: Reserved lock namespace (default: 7100)
    /// - `CASEGUARD_LOCK_SCALE`: Case ids per namespace (default: 1000000000)
    /// - `CASEGUARD_BACKEND_TIMEOUT_MS`: Per-call backend timeout (default: 5000)
    /// - `CASEGUARD_SKIP_REASON`: Reason stored on skipped runs
    ///
    /// # Errors
    /// Unparseable values are reported rather than silently defaulted, since a
    /// wrong namespace would put locks in someone else's keyspace.
    pub fn from_env() -> Result<Self, ConfigError> {
        let namespace = env_i64("CASEGUARD_LOCK_NAMESPACE", DEFAULT_LOCK_NAMESPACE)?;
        let scale = env_i64("CASEGUARD_LOCK_SCALE", DEFAULT_LOCK_SCALE)?;
        let timeout_ms = match std::env::var("CASEGUARD_BACKEND_TIMEOUT_MS") {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                field: "CASEGUARD_BACKEND_TIMEOUT_MS".to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            Err(_) => DEFAULT_BACKEND_TIMEOUT_MS,
        };
        let skip_reason = std::env::var("CASEGUARD_SKIP_REASON")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SKIP_REASON.to_string());

        let config = Self {
            keyspace: LockKeyspace::new(namespace, scale)?,
            backend_timeout: Duration::from_millis(timeout_ms),
            skip_reason,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "backend_timeout".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.skip_reason.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "skip_reason".to_string(),
            });
        }
        LockKeyspace::new(self.keyspace.namespace(), self.keyspace.scale())?;
        Ok(())
    }

    /// Builder-style override of the backend timeout.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Builder-style override of the keyspace.
    pub fn with_keyspace(mut self, keyspace: LockKeyspace) -> Self {
        self.keyspace = keyspace;
        self
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<i64>().map_err(|e| ConfigError::InvalidValue {
            field: name.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
