//! `agent_runs` persistence on PostgreSQL.
//!
//! Every transition is a single conditional `UPDATE ... WHERE status = $from`,
//! so a run can only leave a state once even with concurrent writers. When no
//! row matches, the current row is read back to tell `NotFound` from
//! `InvalidTransition`.

use crate::db::{insert_error, pool_storage_error, read_error, update_error, DbClient};
use ::async_trait::async_trait;
use caseguard_core::{
    AgentRun, CaseGuardResult, CaseId, LockKey, ProposalId, RunId, RunMetadata, RunStatus,
    StorageError, TriggerType, ValidationError, SKIP_REASON_KEY,
};
use caseguard_storage::RunStore;
use chrono::Utc;
use deadpool_postgres::Object;
use tokio_postgres::Row;

const RUN_COLUMNS: &str = "run_id, case_id, trigger_type, status, lock_acquired, lock_key, \
                           started_at, ended_at, error, proposal_id, metadata";

/// Run record store over the `agent_runs` table.
#[derive(Debug, Clone)]
pub struct PgRunStore {
    db: DbClient,
}

impl PgRunStore {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    async fn conn(&self) -> Result<Object, StorageError> {
        self.db.get_conn().await.map_err(pool_storage_error)
    }

    /// Explain why a conditional update matched no row.
    async fn rejected(&self, run_id: RunId, to: RunStatus) -> CaseGuardResult<()> {
        match self.get_run(run_id).await? {
            Some(run) => Err(StorageError::InvalidTransition {
                run_id,
                from: run.status,
                to,
            }
            .into()),
            None => Err(AgentRun::not_found(run_id).into()),
        }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_run(
        &self,
        case_id: CaseId,
        trigger_type: TriggerType,
        metadata: RunMetadata,
    ) -> CaseGuardResult<AgentRun> {
        let run = AgentRun::new(case_id, trigger_type, metadata);
        let conn = self.conn().await?;
        let metadata = serde_json::Value::Object(run.metadata.clone());

        conn.execute(
            "INSERT INTO agent_runs \
             (run_id, case_id, trigger_type, status, lock_acquired, started_at, metadata) \
             VALUES ($1, $2, $3, $4, FALSE, $5, $6)",
            &[
                &run.run_id,
                &run.case_id.get(),
                &run.trigger_type.as_db_str(),
                &run.status.as_db_str(),
                &run.started_at,
                &metadata,
            ],
        )
        .await
        .map_err(insert_error)?;

        tracing::debug!(run_id = %run.run_id, case_id = %case_id, trigger = %trigger_type, "run created");
        Ok(run)
    }

    async fn mark_lock_acquired(&self, run_id: RunId, lock_key: LockKey) -> CaseGuardResult<()> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE agent_runs SET status = $2, lock_acquired = TRUE, lock_key = $3 \
                 WHERE run_id = $1 AND status = $4",
                &[
                    &run_id,
                    &RunStatus::Running.as_db_str(),
                    &lock_key.as_i64(),
                    &RunStatus::Pending.as_db_str(),
                ],
            )
            .await
            .map_err(|e| update_error(run_id, e))?;
        if updated == 0 {
            return self.rejected(run_id, RunStatus::Running).await;
        }
        Ok(())
    }

    async fn mark_skipped(&self, run_id: RunId, reason: &str) -> CaseGuardResult<()> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE agent_runs SET status = $2, ended_at = $3, \
                 metadata = metadata || jsonb_build_object($4::text, $5::text) \
                 WHERE run_id = $1 AND status = $6",
                &[
                    &run_id,
                    &RunStatus::SkippedLocked.as_db_str(),
                    &Utc::now(),
                    &SKIP_REASON_KEY,
                    &reason,
                    &RunStatus::Pending.as_db_str(),
                ],
            )
            .await
            .map_err(|e| update_error(run_id, e))?;
        if updated == 0 {
            return self.rejected(run_id, RunStatus::SkippedLocked).await;
        }
        Ok(())
    }

    async fn mark_completed(
        &self,
        run_id: RunId,
        proposal_id: Option<ProposalId>,
        error: Option<&str>,
    ) -> CaseGuardResult<()> {
        let next = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE agent_runs SET status = $2, ended_at = $3, proposal_id = $4, error = $5 \
                 WHERE run_id = $1 AND status = $6",
                &[
                    &run_id,
                    &next.as_db_str(),
                    &Utc::now(),
                    &proposal_id,
                    &error,
                    &RunStatus::Running.as_db_str(),
                ],
            )
            .await
            .map_err(|e| update_error(run_id, e))?;
        if updated == 0 {
            return self.rejected(run_id, next).await;
        }
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> CaseGuardResult<Option<AgentRun>> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {} FROM agent_runs WHERE run_id = $1", RUN_COLUMNS);
        let row = conn
            .query_opt(sql.as_str(), &[&run_id])
            .await
            .map_err(|e| read_error("get_run", e))?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_runs_for_case(
        &self,
        case_id: CaseId,
        limit: usize,
    ) -> CaseGuardResult<Vec<AgentRun>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM agent_runs WHERE case_id = $1 \
             ORDER BY started_at DESC, run_id DESC LIMIT $2",
            RUN_COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = conn
            .query(sql.as_str(), &[&case_id.get(), &limit])
            .await
            .map_err(|e| read_error("list_runs_for_case", e))?;
        rows.iter().map(row_to_run).collect()
    }

    async fn list_open_runs(&self, limit: usize) -> CaseGuardResult<Vec<AgentRun>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM agent_runs WHERE status IN ($1, $2) \
             ORDER BY started_at ASC, run_id ASC LIMIT $3",
            RUN_COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = conn
            .query(
                sql.as_str(),
                &[
                    &RunStatus::Pending.as_db_str(),
                    &RunStatus::Running.as_db_str(),
                    &limit,
                ],
            )
            .await
            .map_err(|e| read_error("list_open_runs", e))?;
        rows.iter().map(row_to_run).collect()
    }
}

fn row_to_run(row: &Row) -> CaseGuardResult<AgentRun> {
    let get_err = |e: tokio_postgres::Error| read_error("decode agent_runs row", e);

    let trigger: String = row.try_get("trigger_type").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(get_err)?;
    let metadata = match metadata {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(ValidationError::InvalidValue {
                field: "metadata".to_string(),
                reason: format!("expected a JSON object, got {}", other),
            }
            .into())
        }
    };

    Ok(AgentRun {
        run_id: row.try_get("run_id").map_err(get_err)?,
        case_id: CaseId::new(row.try_get("case_id").map_err(get_err)?)?,
        trigger_type: TriggerType::from_db_str(&trigger).map_err(|e| {
            ValidationError::InvalidValue {
                field: "trigger_type".to_string(),
                reason: e.to_string(),
            }
        })?,
        status: RunStatus::from_db_str(&status).map_err(|e| ValidationError::InvalidValue {
            field: "status".to_string(),
            reason: e.to_string(),
        })?,
        lock_acquired: row.try_get("lock_acquired").map_err(get_err)?,
        lock_key: row
            .try_get::<_, Option<i64>>("lock_key")
            .map_err(get_err)?
            .map(LockKey::from_raw),
        started_at: row.try_get("started_at").map_err(get_err)?,
        ended_at: row.try_get("ended_at").map_err(get_err)?,
        error: row.try_get("error").map_err(get_err)?,
        proposal_id: row.try_get("proposal_id").map_err(get_err)?,
        metadata,
    })
}
