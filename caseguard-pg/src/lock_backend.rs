//! Session-scoped advisory locks on PostgreSQL.
//!
//! A [`PgLockSession`] pins one pooled connection. `pg_try_advisory_lock`
//! and `pg_advisory_unlock` are session-level: the server ties the lock to
//! the backend process that took it, so both calls must run on the same
//! connection. Invalidating a session detaches the connection from the pool
//! and drops it, which ends the backend and frees whatever it still held.

use crate::db::{pool_lock_error, query_lock_error, DbClient};
use ::async_trait::async_trait;
use caseguard_core::{LockError, LockKey};
use caseguard_storage::{LockBackend, LockSession};
use deadpool_postgres::Object;

const TRY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1)";
const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1)";
const BACKEND_PID_SQL: &str = "SELECT pg_backend_pid()";

/// Backends holding a granted advisory lock on a bigint key in this database.
///
/// A bigint key is stored as `classid` = high 32 bits, `objid` = low 32 bits,
/// `objsubid` = 1.
const HOLDERS_SQL: &str = "\
    SELECT pid FROM pg_locks \
    WHERE locktype = 'advisory' \
      AND granted \
      AND database = (SELECT oid FROM pg_database WHERE datname = current_database()) \
      AND classid::bigint = $1 \
      AND objid::bigint = $2 \
      AND objsubid = 1 \
      AND pid <> pg_backend_pid()";

const TERMINATE_SQL: &str = "SELECT pg_terminate_backend($1)";

// ============================================================================
// BACKEND
// ============================================================================

/// Advisory lock backend over a deadpool-postgres pool.
#[derive(Debug, Clone)]
pub struct PgLockBackend {
    db: DbClient,
}

impl PgLockBackend {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LockBackend for PgLockBackend {
    async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError> {
        let conn = self.db.get_conn().await.map_err(pool_lock_error)?;
        let pid = match conn.query_one(BACKEND_PID_SQL, &[]).await {
            Ok(row) => row.try_get::<_, i32>(0).ok(),
            Err(err) => {
                // A connection that cannot answer this cannot hold a lock either.
                drop(Object::take(conn));
                return Err(query_lock_error("pg_backend_pid", err));
            }
        };
        Ok(Box::new(PgLockSession {
            conn: Some(conn),
            pid,
        }))
    }

    async fn force_release(&self, key: LockKey) -> Result<bool, LockError> {
        let conn = self.db.get_conn().await.map_err(pool_lock_error)?;
        let (high, low) = key.split();
        let rows = conn
            .query(HOLDERS_SQL, &[&i64::from(high), &i64::from(low)])
            .await
            .map_err(|e| query_lock_error("pg_locks", e))?;

        let mut terminated = false;
        for row in rows {
            let pid: i32 = row
                .try_get(0)
                .map_err(|e| query_lock_error("pg_locks", e))?;
            let row = conn
                .query_one(TERMINATE_SQL, &[&pid])
                .await
                .map_err(|e| query_lock_error("pg_terminate_backend", e))?;
            let ok: bool = row
                .try_get(0)
                .map_err(|e| query_lock_error("pg_terminate_backend", e))?;
            tracing::warn!(lock_key = %key, pid, terminated = ok, "terminating advisory lock holder");
            terminated |= ok;
        }
        Ok(terminated)
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// One pinned pooled connection.
///
/// Dropping a session without invalidating it returns the connection to the
/// pool, where `RecyclingMethod::Clean` discards session state on reuse.
pub struct PgLockSession {
    conn: Option<Object>,
    pid: Option<i32>,
}

impl PgLockSession {
    fn conn(&self) -> Result<&Object, LockError> {
        self.conn.as_ref().ok_or(LockError::SessionClosed)
    }

    async fn call_bool(&self, operation: &str, sql: &str, key: LockKey) -> Result<bool, LockError> {
        let conn = self.conn()?;
        let stmt = conn
            .prepare_cached(sql)
            .await
            .map_err(|e| query_lock_error(operation, e))?;
        let row = conn
            .query_one(&stmt, &[&key.as_i64()])
            .await
            .map_err(|e| query_lock_error(operation, e))?;
        row.try_get(0).map_err(|e| query_lock_error(operation, e))
    }
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn try_acquire(&mut self, key: LockKey) -> Result<bool, LockError> {
        self.call_bool("pg_try_advisory_lock", TRY_LOCK_SQL, key).await
    }

    async fn release(&mut self, key: LockKey) -> Result<bool, LockError> {
        // The server answers false (with a WARNING) when this backend does not hold it.
        self.call_bool("pg_advisory_unlock", UNLOCK_SQL, key).await
    }

    fn invalidate(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(pid = ?self.pid, "closing lock session connection");
            drop(Object::take(conn));
        }
    }

    fn label(&self) -> String {
        match self.pid {
            Some(pid) => format!("pg-backend-{}", pid),
            None => "pg-backend-unknown".to_string(),
        }
    }
}

impl std::fmt::Debug for PgLockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLockSession")
            .field("pid", &self.pid)
            .field("open", &self.conn.is_some())
            .finish()
    }
}
