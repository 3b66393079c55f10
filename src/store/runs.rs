//! Run persistence: creation, claiming, guarded transitions, rescue

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Run, RunErrorKind, RunMode, RunState};

use super::Store;

pub(super) fn run_from_row(row: &PgRow) -> Result<Run> {
    let state: String = row.try_get("state")?;
    let previous_state: Option<String> = row.try_get("previous_state")?;
    let run_mode: String = row.try_get("run_mode")?;
    let error_type: Option<String> = row.try_get("error_type")?;

    Ok(Run {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        agent_id: row.try_get("agent_id")?,
        parent_run_id: row.try_get("parent_run_id")?,
        parent_tool_execution_id: row.try_get("parent_tool_execution_id")?,
        depth: row.try_get("depth")?,
        state: state.parse().map_err(Error::Database)?,
        previous_state: previous_state
            .map(|s| s.parse().map_err(Error::Database))
            .transpose()?,
        run_mode: run_mode.parse().map_err(Error::Database)?,
        prompt: row.try_get("prompt")?,
        variables: row.try_get("variables")?,
        response_text: row.try_get("response_text")?,
        current_iteration: row.try_get("current_iteration")?,
        current_iteration_id: row.try_get("current_iteration_id")?,
        iteration_count: row.try_get("iteration_count")?,
        tool_iterations: row.try_get("tool_iterations")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        cache_creation_tokens: row.try_get("cache_creation_tokens")?,
        cache_read_tokens: row.try_get("cache_read_tokens")?,
        error_type: error_type
            .map(|s| s.parse().map_err(Error::Database))
            .transpose()?,
        error_message: row.try_get("error_message")?,
        claimed_by_instance_id: row.try_get("claimed_by_instance_id")?,
        claimed_at: row.try_get("claimed_at")?,
        rescue_attempts: row.try_get("rescue_attempts")?,
        last_rescue_at: row.try_get("last_rescue_at")?,
        finalized_at: row.try_get("finalized_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Request to create a new run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub prompt: String,
    pub run_mode: RunMode,
    pub variables: Value,
    pub parent_run_id: Option<Uuid>,
    pub parent_tool_execution_id: Option<Uuid>,
    pub depth: i32,
}

impl NewRun {
    pub fn new(session_id: Uuid, agent_id: Uuid, prompt: impl Into<String>, mode: RunMode) -> Self {
        Self {
            session_id,
            agent_id,
            prompt: prompt.into(),
            run_mode: mode,
            variables: serde_json::json!({}),
            parent_run_id: None,
            parent_tool_execution_id: None,
            depth: 0,
        }
    }
}

impl Store {
    /// Create a pending run. The insert trigger announces it to claimers.
    pub async fn create_run(&self, new_run: &NewRun) -> Result<Run> {
        let mut conn = self.pool().acquire().await?;
        Self::create_run_on(&mut conn, new_run).await
    }

    /// Create a pending run inside the caller's transaction; it becomes
    /// visible (and claimable) exactly at commit
    pub async fn create_run_tx(&self, conn: &mut PgConnection, new_run: &NewRun) -> Result<Run> {
        Self::create_run_on(conn, new_run).await
    }

    async fn create_run_on(conn: &mut PgConnection, new_run: &NewRun) -> Result<Run> {
        let row = sqlx::query(
            r#"
            INSERT INTO runs (
                session_id, agent_id, parent_run_id, parent_tool_execution_id,
                depth, run_mode, prompt, variables
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(new_run.session_id)
        .bind(new_run.agent_id)
        .bind(new_run.parent_run_id)
        .bind(new_run.parent_tool_execution_id)
        .bind(new_run.depth)
        .bind(new_run.run_mode.to_string())
        .bind(&new_run.prompt)
        .bind(&new_run.variables)
        .fetch_one(conn)
        .await?;

        run_from_row(&row)
    }

    /// Get a run by ID
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Run not found: {}", run_id)))?;

        run_from_row(&row)
    }

    /// List a session's runs, oldest first
    pub async fn list_runs_for_session(&self, session_id: Uuid) -> Result<Vec<Run>> {
        let rows = sqlx::query("SELECT * FROM runs WHERE session_id = $1 ORDER BY created_at")
            .bind(session_id)
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(run_from_row).collect()
    }

    /// Atomically claim up to `max_count` runs this instance is capable of
    /// executing. Rows under lock by a racing claimer are skipped; a claimed
    /// row moves to the mode's first in-progress state.
    ///
    /// Claims cover fresh runs (`pending`) and runs whose tool results are in
    /// (`pending_api`).
    pub async fn claim_runs(
        &self,
        instance_id: Uuid,
        max_count: i64,
        mode: RunMode,
    ) -> Result<Vec<Run>> {
        let claimed_state = RunState::claimed_state(mode).to_string();

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT r.id
                FROM runs r
                JOIN agents a ON a.id = r.agent_id
                WHERE r.state IN ('pending', 'pending_api')
                  AND r.run_mode = $3
                  AND NOT EXISTS (
                      SELECT 1 FROM unnest(a.tools) AS required(tool_name)
                      WHERE NOT EXISTS (
                          SELECT 1 FROM instance_tools it
                          WHERE it.instance_id = $1
                            AND it.tool_name = required.tool_name
                      )
                  )
                ORDER BY r.created_at
                LIMIT $2
                FOR UPDATE OF r SKIP LOCKED
            )
            UPDATE runs r
            SET state = $4,
                previous_state = r.state,
                claimed_by_instance_id = $1,
                claimed_at = now(),
                updated_at = now()
            FROM claimable c
            WHERE r.id = c.id
            RETURNING r.*
            "#,
        )
        .bind(instance_id)
        .bind(max_count)
        .bind(mode.to_string())
        .bind(&claimed_state)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    /// Guarded state transition. With `required_state`, the update only
    /// applies if the run is currently in that state; returns whether this
    /// caller won the transition. Terminal rows are never touched.
    pub async fn update_run_state(
        &self,
        run_id: Uuid,
        new_state: RunState,
        required_state: Option<RunState>,
    ) -> Result<bool> {
        let affected = match required_state {
            Some(required) => {
                sqlx::query(
                    r#"
                    UPDATE runs
                    SET state = $2,
                        previous_state = state,
                        updated_at = now()
                    WHERE id = $1
                      AND state = $3
                      AND finalized_at IS NULL
                    "#,
                )
                .bind(run_id)
                .bind(new_state.to_string())
                .bind(required.to_string())
                .execute(self.pool())
                .await?
                .rows_affected()
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE runs
                    SET state = $2,
                        previous_state = state,
                        updated_at = now()
                    WHERE id = $1
                      AND finalized_at IS NULL
                    "#,
                )
                .bind(run_id)
                .bind(new_state.to_string())
                .execute(self.pool())
                .await?
                .rows_affected()
            }
        };

        Ok(affected > 0)
    }

    /// Record the iteration a claimed run is currently driving
    pub async fn set_current_iteration(
        &self,
        run_id: Uuid,
        iteration_number: i32,
        iteration_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET current_iteration = $2,
                current_iteration_id = $3,
                updated_at = now()
            WHERE id = $1
              AND finalized_at IS NULL
            "#,
        )
        .bind(run_id)
        .bind(iteration_number)
        .bind(iteration_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Fail a run terminally. The finalization trigger unblocks waiters and
    /// back-propagates into a parent tool execution if one exists.
    pub async fn fail_run(
        &self,
        run_id: Uuid,
        kind: RunErrorKind,
        message: &str,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE runs
            SET state = 'failed',
                previous_state = state,
                error_type = $2,
                error_message = $3,
                finalized_at = now(),
                updated_at = now()
            WHERE id = $1
              AND finalized_at IS NULL
            "#,
        )
        .bind(run_id)
        .bind(kind.to_string())
        .bind(message)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Cancel a run from any non-terminal state. Pending tool executions are
    /// skipped so tool workers stop picking them up.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE runs
            SET state = 'cancelled',
                previous_state = state,
                finalized_at = now(),
                updated_at = now()
            WHERE id = $1
              AND finalized_at IS NULL
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE tool_executions
            SET state = 'skipped',
                updated_at = now()
            WHERE run_id = $1
              AND state IN ('pending', 'running')
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Reset a run parked in `awaiting_input` back to `pending` with a fresh
    /// user prompt appended to the session
    pub async fn continue_run(&self, run_id: Uuid, prompt: &str) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE runs
            SET state = 'pending',
                previous_state = state,
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND state = 'awaiting_input'
            RETURNING session_id
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let session_id: Uuid = row.try_get("session_id")?;

        let content = serde_json::json!([{"type": "text", "text": prompt}]);
        sqlx::query(
            r#"
            INSERT INTO messages (session_id, run_id, role, content)
            VALUES ($1, $2, 'user', $3)
            "#,
        )
        .bind(session_id)
        .bind(run_id)
        .bind(&content)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Reset a stuck run to `pending`: clear claim fields, abandon any
    /// in-flight batch iteration, and skip its outstanding tool executions so
    /// the retried iteration starts clean.
    pub async fn rescue_run(&self, run_id: Uuid) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE runs
            SET state = 'pending',
                previous_state = state,
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                rescue_attempts = rescue_attempts + 1,
                last_rescue_at = now(),
                updated_at = now()
            WHERE id = $1
              AND finalized_at IS NULL
              AND state NOT IN ('pending', 'awaiting_input')
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE iterations
            SET batch_status = NULL,
                error_type = 'rescued',
                error_message = 'iteration abandoned by rescue',
                updated_at = now()
            WHERE run_id = $1
              AND batch_status = 'in_progress'
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE tool_executions
            SET state = 'skipped',
                updated_at = now()
            WHERE run_id = $1
              AND state IN ('pending', 'running')
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Runs that stalled in an in-progress state with no live claimer
    pub async fn get_stuck_runs(
        &self,
        timeout: std::time::Duration,
        limit: i64,
    ) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT r.*
            FROM runs r
            WHERE r.finalized_at IS NULL
              AND r.state NOT IN ('pending', 'awaiting_input')
              AND r.updated_at < now() - make_interval(secs => $1)
              AND (
                  r.claimed_by_instance_id IS NULL
                  OR NOT EXISTS (
                      SELECT 1 FROM instances i
                      WHERE i.id = r.claimed_by_instance_id
                  )
              )
            ORDER BY r.updated_at
            LIMIT $2
            "#,
        )
        .bind(timeout.as_secs_f64())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    /// Touch a run's activity timestamp (batch polling keeps claimed runs
    /// from looking stuck)
    pub async fn touch_run(&self, run_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE runs SET updated_at = now() WHERE id = $1 AND finalized_at IS NULL")
            .bind(run_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Timestamp helper used by waiters polling for finalization
    pub async fn run_finalized_at(&self, run_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let finalized: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT finalized_at FROM runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(self.pool())
                .await?
                .flatten();
        Ok(finalized)
    }
}
