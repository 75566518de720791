//! Database Connection Pool Module
//!
//! PostgreSQL connection pooling using deadpool-postgres, plus the error
//! mapping shared by the lock backend and the run store.

use caseguard_core::{ConfigError, EntityType, LockError, RunId, StorageError};
use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
};
use std::time::Duration;
use tokio_postgres::NoTls;

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DbConfig {
    /// Full connection string; takes precedence over the discrete fields.
    pub url: Option<String>,
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum size of the run record pool.
    pub max_size: usize,
    /// Maximum size of the lock session pool. Every held case lock pins one
    /// connection from it for the whole operation.
    pub lock_pool_size: usize,
    /// Wait/connect timeout for checking out a connection
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            dbname: "caseguard".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            lock_pool_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a database configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `CASEGUARD_DATABASE_URL` or `DATABASE_URL`: full connection string
    /// - `CASEGUARD_DB_HOST`, `CASEGUARD_DB_PORT`, `CASEGUARD_DB_NAME`,
    ///   `CASEGUARD_DB_USER`, `CASEGUARD_DB_PASSWORD`
    /// - `CASEGUARD_DB_POOL_SIZE`: run record pool size (default: 16)
    /// - `CASEGUARD_DB_LOCK_POOL_SIZE`: lock session pool size, i.e. the
    ///   number of operations that can hold a case lock at once (default: 16)
    /// - `CASEGUARD_DB_TIMEOUT` in seconds (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let url = std::env::var("CASEGUARD_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok()
            .filter(|s| !s.trim().is_empty());

        let config = Self {
            url,
            host: std::env::var("CASEGUARD_DB_HOST").unwrap_or(defaults.host),
            port: env_parse("CASEGUARD_DB_PORT", defaults.port)?,
            dbname: std::env::var("CASEGUARD_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("CASEGUARD_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("CASEGUARD_DB_PASSWORD").unwrap_or_default(),
            max_size: env_parse("CASEGUARD_DB_POOL_SIZE", defaults.max_size)?,
            lock_pool_size: env_parse("CASEGUARD_DB_LOCK_POOL_SIZE", defaults.lock_pool_size)?,
            timeout: Duration::from_secs(env_parse(
                "CASEGUARD_DB_TIMEOUT",
                defaults.timeout.as_secs(),
            )?),
        };
        for (field, size) in [
            ("CASEGUARD_DB_POOL_SIZE", config.max_size),
            ("CASEGUARD_DB_LOCK_POOL_SIZE", config.lock_pool_size),
        ] {
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        Ok(config)
    }

    /// Create the run record pool from this configuration.
    pub fn create_pool(&self) -> Result<Pool, ConfigError> {
        self.build_pool(self.max_size)
    }

    /// Create the lock session pool from this configuration.
    pub fn create_lock_pool(&self) -> Result<Pool, ConfigError> {
        self.build_pool(self.lock_pool_size)
    }

    fn build_pool(&self, max_size: usize) -> Result<Pool, ConfigError> {
        let mut cfg = Config::new();
        match &self.url {
            Some(url) => cfg.url = Some(url.clone()),
            None => {
                cfg.host = Some(self.host.clone());
                cfg.port = Some(self.port);
                cfg.dbname = Some(self.dbname.clone());
                cfg.user = Some(self.user.clone());
                cfg.password = Some(self.password.clone());
            }
        }

        // Clean recycling runs DISCARD ALL, which also drops session advisory locks.
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Clean,
        });

        let mut pool_cfg = PoolConfig::new(max_size);
        pool_cfg.timeouts.wait = Some(self.timeout);
        pool_cfg.timeouts.create = Some(self.timeout);
        cfg.pool = Some(pool_cfg);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ConfigError::InvalidValue {
                field: "database".to_string(),
                value: self.redacted(),
                reason: format!("Failed to create pool: {}", e),
            })
    }

    /// Connection target without credentials, for logs and errors.
    pub fn redacted(&self) -> String {
        match &self.url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, host)) => format!("postgres://***@{}", host),
                None => "postgres://***".to_string(),
            },
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.dbname),
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            field: name.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

// ============================================================================
// DATABASE CLIENT WRAPPER
// ============================================================================

/// Shared handle to the connection pool.
#[derive(Clone)]
pub struct DbClient {
    pool: Pool,
}

impl DbClient {
    /// Create a new database client with the given pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a new database client from configuration.
    pub fn from_config(config: &DbConfig) -> Result<Self, ConfigError> {
        let pool = config.create_pool()?;
        tracing::debug!(target_db = %config.redacted(), max_size = config.max_size, "database pool created");
        Ok(Self::new(pool))
    }

    /// Create a lock session client from configuration.
    pub fn locks_from_config(config: &DbConfig) -> Result<Self, ConfigError> {
        let pool = config.create_lock_pool()?;
        tracing::debug!(target_db = %config.redacted(), max_size = config.lock_pool_size, "lock session pool created");
        Ok(Self::new(pool))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Configured upper bound on connections.
    pub fn max_size(&self) -> usize {
        self.pool.status().max_size
    }

    /// Get a connection from the pool.
    pub async fn get_conn(&self) -> Result<Object, PoolError> {
        self.pool.get().await
    }
}

impl std::fmt::Debug for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("DbClient")
            .field("size", &status.size)
            .field("available", &status.available)
            .field("max_size", &status.max_size)
            .finish()
    }
}

// ============================================================================
// POOL PAIR
// ============================================================================

/// The two pools a Postgres-backed orchestrator needs.
///
/// A held case lock keeps its session connection checked out while the run
/// record is updated, so records and lock sessions must never share a pool.
#[derive(Debug, Clone)]
pub struct DbPools {
    /// Run record reads and writes; connections are returned after each call.
    pub runs: DbClient,
    /// Lock sessions, force release and probes.
    pub locks: DbClient,
}

impl DbPools {
    pub fn from_config(config: &DbConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            runs: DbClient::from_config(config)?,
            locks: DbClient::locks_from_config(config)?,
        })
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

pub(crate) fn pool_lock_error(err: PoolError) -> LockError {
    tracing::error!("Connection pool error: {:?}", err);
    match err {
        PoolError::Timeout(_) => LockError::Timeout {
            operation: "checkout".to_string(),
        },
        other => LockError::BackendUnavailable {
            reason: other.to_string(),
        },
    }
}

pub(crate) fn pool_storage_error(err: PoolError) -> StorageError {
    tracing::error!("Connection pool error: {:?}", err);
    match err {
        PoolError::Timeout(_) => StorageError::Timeout {
            operation: "checkout".to_string(),
        },
        other => StorageError::BackendUnavailable {
            reason: other.to_string(),
        },
    }
}

pub(crate) fn query_lock_error(operation: &str, err: tokio_postgres::Error) -> LockError {
    tracing::error!(operation, "Database error: {:?}", err);
    LockError::BackendUnavailable {
        reason: format!("{}: {}", operation, err),
    }
}

pub(crate) fn insert_error(err: tokio_postgres::Error) -> StorageError {
    tracing::error!("Database error: {:?}", err);
    StorageError::InsertFailed {
        entity_type: EntityType::AgentRun,
        reason: err.to_string(),
    }
}

pub(crate) fn update_error(run_id: RunId, err: tokio_postgres::Error) -> StorageError {
    tracing::error!(%run_id, "Database error: {:?}", err);
    StorageError::UpdateFailed {
        entity_type: EntityType::AgentRun,
        id: run_id,
        reason: err.to_string(),
    }
}

pub(crate) fn read_error(operation: &str, err: tokio_postgres::Error) -> StorageError {
    tracing::error!(operation, "Database error: {:?}", err);
    StorageError::BackendUnavailable {
        reason: format!("{}: {}", operation, err),
    }
}
