//! Tool execution persistence: claiming and outcome transitions

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::ToolExecution;

use super::Store;

fn tool_execution_from_row(row: &PgRow) -> Result<ToolExecution> {
    let state: String = row.try_get("state")?;

    Ok(ToolExecution {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        iteration_id: row.try_get("iteration_id")?,
        tool_use_id: row.try_get("tool_use_id")?,
        tool_name: row.try_get("tool_name")?,
        input: row.try_get("input")?,
        is_agent_tool: row.try_get("is_agent_tool")?,
        agent_id: row.try_get("agent_id")?,
        child_run_id: row.try_get("child_run_id")?,
        output: row.try_get("output")?,
        is_error: row.try_get("is_error")?,
        state: state.parse().map_err(Error::Database)?,
        claimed_by_instance_id: row.try_get("claimed_by_instance_id")?,
        claimed_at: row.try_get("claimed_at")?,
        attempt_count: row.try_get("attempt_count")?,
        max_attempts: row.try_get("max_attempts")?,
        scheduled_at: row.try_get("scheduled_at")?,
        snooze_count: row.try_get("snooze_count")?,
        last_error: row.try_get("last_error")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    /// Atomically claim up to `max_count` due tool executions this instance
    /// can run, FIFO. Claiming moves the row to `running` and consumes an
    /// attempt. Agent-tool executions are claimable by any instance; the
    /// child run's own claim re-applies capability filtering.
    pub async fn claim_tool_executions(
        &self,
        instance_id: Uuid,
        max_count: i64,
    ) -> Result<Vec<ToolExecution>> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT te.id
                FROM tool_executions te
                WHERE te.state = 'pending'
                  AND te.scheduled_at <= now()
                  AND (
                      te.is_agent_tool
                      OR EXISTS (
                          SELECT 1 FROM instance_tools it
                          WHERE it.instance_id = $1
                            AND it.tool_name = te.tool_name
                      )
                  )
                ORDER BY te.created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tool_executions te
            SET state = 'running',
                claimed_by_instance_id = $1,
                claimed_at = now(),
                attempt_count = te.attempt_count + 1,
                updated_at = now()
            FROM claimable c
            WHERE te.id = c.id
            RETURNING te.*
            "#,
        )
        .bind(instance_id)
        .bind(max_count)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(tool_execution_from_row).collect()
    }

    /// Get a tool execution by ID
    pub async fn get_tool_execution(&self, execution_id: Uuid) -> Result<ToolExecution> {
        let row = sqlx::query("SELECT * FROM tool_executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Tool execution not found: {}", execution_id))
            })?;

        tool_execution_from_row(&row)
    }

    /// All executions created by one iteration, in creation order
    pub async fn get_tool_executions_for_iteration(
        &self,
        iteration_id: Uuid,
    ) -> Result<Vec<ToolExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_executions WHERE iteration_id = $1 ORDER BY created_at, id",
        )
        .bind(iteration_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(tool_execution_from_row).collect()
    }

    /// True when the run has no pending or running tool executions left
    pub async fn all_tool_executions_settled(&self, run_id: Uuid) -> Result<bool> {
        let outstanding = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM tool_executions
                WHERE run_id = $1
                  AND state IN ('pending', 'running')
            )
            "#,
        )
        .bind(run_id)
        .fetch_one(self.pool())
        .await?;

        Ok(!outstanding)
    }

    /// Record a successful tool callback
    pub async fn complete_tool_execution(&self, execution_id: Uuid, output: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tool_executions
            SET state = 'completed',
                output = $2,
                is_error = false,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
              AND state = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(output)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Record a permanent tool failure. The error text becomes the tool
    /// output the agent observes.
    pub async fn fail_tool_execution(&self, execution_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tool_executions
            SET state = 'failed',
                output = $2,
                is_error = true,
                last_error = $2,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
              AND state = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(error)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Put a running execution back in the queue for a later attempt
    pub async fn retry_tool_execution(
        &self,
        execution_id: Uuid,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tool_executions
            SET state = 'pending',
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                scheduled_at = $2,
                last_error = $3,
                updated_at = now()
            WHERE id = $1
              AND state = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(scheduled_at)
        .bind(error)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Snooze an execution: reschedule without consuming the attempt the
    /// claim charged
    pub async fn snooze_tool_execution(
        &self,
        execution_id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tool_executions
            SET state = 'pending',
                claimed_by_instance_id = NULL,
                claimed_at = NULL,
                scheduled_at = $2,
                attempt_count = attempt_count - 1,
                snooze_count = snooze_count + 1,
                updated_at = now()
            WHERE id = $1
              AND state = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(scheduled_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Link an agent-tool execution to the child run that will complete it.
    /// The row stays `running`; finalization of the child drives it terminal.
    pub async fn set_child_run(&self, execution_id: Uuid, child_run_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tool_executions
            SET child_run_id = $2,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(child_run_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Runs sitting in `pending_tools` whose executions have all settled.
    /// Sweep-side recovery for a lost `tools_complete` notification.
    pub async fn get_runs_with_settled_tools(&self, limit: i64) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT r.id
            FROM runs r
            WHERE r.state = 'pending_tools'
              AND NOT EXISTS (
                  SELECT 1 FROM tool_executions te
                  WHERE te.run_id = r.id
                    AND te.state IN ('pending', 'running')
              )
            ORDER BY r.updated_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(ids)
    }
}
