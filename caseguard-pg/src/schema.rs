//! `agent_runs` schema.

use crate::db::{pool_storage_error, read_error, DbClient};
use caseguard_core::CaseGuardResult;

/// Idempotent DDL for the run record table.
pub const AGENT_RUNS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS agent_runs (
    run_id        UUID PRIMARY KEY,
    case_id       BIGINT NOT NULL CHECK (case_id >= 0),
    trigger_type  TEXT NOT NULL,
    status        TEXT NOT NULL,
    lock_acquired BOOLEAN NOT NULL DEFAULT FALSE,
    lock_key      BIGINT,
    started_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    ended_at      TIMESTAMPTZ,
    error         TEXT,
    proposal_id   BIGINT,
    metadata      JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE INDEX IF NOT EXISTS agent_runs_case_started_idx
    ON agent_runs (case_id, started_at DESC);

CREATE INDEX IF NOT EXISTS agent_runs_open_idx
    ON agent_runs (status)
    WHERE status IN ('pending', 'running');
"#;

/// Create the `agent_runs` table and its indexes if they do not exist.
pub async fn migrate(db: &DbClient) -> CaseGuardResult<()> {
    let conn = db.get_conn().await.map_err(pool_storage_error)?;
    conn.batch_execute(AGENT_RUNS_DDL)
        .await
        .map_err(|e| read_error("migrate", e))?;
    tracing::info!("agent_runs schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseguard_core::RunStatus;

    #[test]
    fn test_ddl_is_idempotent() {
        let creates = AGENT_RUNS_DDL.matches("CREATE").count();
        let guarded = AGENT_RUNS_DDL.matches("IF NOT EXISTS").count();
        assert_eq!(creates, guarded);
    }

    #[test]
    fn test_open_index_names_non_terminal_statuses() {
        for status in RunStatus::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(AGENT_RUNS_DDL.contains(&format!("'{}'", status.as_db_str())));
        }
    }
}
