//! Iteration persistence and the atomic iteration-completion operation

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::message::content_to_value;
use crate::models::{
    state_for_stop_reason, BatchStatus, ContentBlock, Iteration, RunErrorKind, RunState,
    TokenUsage, TriggerType,
};

use super::Store;

fn iteration_from_row(row: &PgRow) -> Result<Iteration> {
    let trigger_type: String = row.try_get("trigger_type")?;
    let batch_status: Option<String> = row.try_get("batch_status")?;

    Ok(Iteration {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        iteration_number: row.try_get("iteration_number")?,
        trigger_type: trigger_type.parse().map_err(Error::Database)?,
        is_streaming: row.try_get("is_streaming")?,
        batch_id: row.try_get("batch_id")?,
        batch_request_id: row.try_get("batch_request_id")?,
        batch_status: batch_status
            .map(|s| s.parse().map_err(Error::Database))
            .transpose()?,
        batch_poll_count: row.try_get("batch_poll_count")?,
        batch_last_poll_at: row.try_get("batch_last_poll_at")?,
        batch_expires_at: row.try_get("batch_expires_at")?,
        streaming_started_at: row.try_get("streaming_started_at")?,
        streaming_completed_at: row.try_get("streaming_completed_at")?,
        stop_reason: row.try_get("stop_reason")?,
        response_message_id: row.try_get("response_message_id")?,
        has_tool_use: row.try_get("has_tool_use")?,
        tool_execution_count: row.try_get("tool_execution_count")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        cache_creation_tokens: row.try_get("cache_creation_tokens")?,
        cache_read_tokens: row.try_get("cache_read_tokens")?,
        error_type: row.try_get("error_type")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Request to create a new iteration row.
///
/// The id is generated by the caller, not the database: for batch iterations
/// it doubles as the provider-side `custom_id`, which must exist before the
/// submission that precedes this insert.
#[derive(Debug, Clone)]
pub struct NewIteration {
    pub id: Uuid,
    pub run_id: Uuid,
    pub iteration_number: i32,
    pub trigger_type: TriggerType,
    pub is_streaming: bool,
    pub batch_id: Option<String>,
    pub batch_request_id: Option<String>,
    pub batch_expires_at: Option<DateTime<Utc>>,
}

/// A finished LLM response ready to be persisted
#[derive(Debug, Clone)]
pub struct CompletedIteration {
    pub response_message_id: Option<String>,
    pub stop_reason: Option<String>,
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
    /// Error kind recorded if the stop reason maps to a failed run
    pub failure_kind: RunErrorKind,
}

impl CompletedIteration {
    /// Concatenated text blocks of the response
    pub fn response_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A tool-use block turned into a pending tool execution row
#[derive(Debug, Clone)]
pub struct NewToolExecution {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    pub is_agent_tool: bool,
    pub agent_id: Option<Uuid>,
    pub max_attempts: i32,
}

impl Store {
    /// Create an iteration row and point the run at it, in one transaction.
    /// Batch iterations start as `in_progress` for the poller; streaming
    /// iterations record their start time.
    pub async fn create_iteration(&self, new_iteration: &NewIteration) -> Result<Iteration> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO iterations (
                id, run_id, iteration_number, trigger_type, is_streaming,
                batch_id, batch_request_id, batch_status, batch_expires_at,
                streaming_started_at
            ) VALUES (
                $8, $1, $2, $3, $4,
                $5, $6, CASE WHEN $4 THEN NULL ELSE 'in_progress' END, $7,
                CASE WHEN $4 THEN now() ELSE NULL END
            )
            RETURNING *
            "#,
        )
        .bind(new_iteration.run_id)
        .bind(new_iteration.iteration_number)
        .bind(new_iteration.trigger_type.to_string())
        .bind(new_iteration.is_streaming)
        .bind(&new_iteration.batch_id)
        .bind(&new_iteration.batch_request_id)
        .bind(new_iteration.batch_expires_at)
        .bind(new_iteration.id)
        .fetch_one(&mut *tx)
        .await?;

        let iteration = iteration_from_row(&row)?;

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
        .bind(new_iteration.run_id)
        .bind(new_iteration.iteration_number)
        .bind(iteration.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(iteration)
    }

    /// Get an iteration by ID
    pub async fn get_iteration(&self, iteration_id: Uuid) -> Result<Iteration> {
        let row = sqlx::query("SELECT * FROM iterations WHERE id = $1")
            .bind(iteration_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Iteration not found: {}", iteration_id)))?;

        iteration_from_row(&row)
    }

    /// All iterations of a run, in order
    pub async fn get_iterations_for_run(&self, run_id: Uuid) -> Result<Vec<Iteration>> {
        let rows =
            sqlx::query("SELECT * FROM iterations WHERE run_id = $1 ORDER BY iteration_number")
                .bind(run_id)
                .fetch_all(self.pool())
                .await?;

        rows.iter().map(iteration_from_row).collect()
    }

    /// Persist a finished LLM response atomically: assistant message, tool
    /// execution rows, iteration fields, and the run's counters and next
    /// state, all in one transaction.
    ///
    /// Returns the run's next state, or `None` if another worker already
    /// completed this iteration (the poll path may race across instances).
    pub async fn complete_iteration(
        &self,
        run_id: Uuid,
        session_id: Uuid,
        iteration_id: Uuid,
        completed: &CompletedIteration,
        tool_execs: &[NewToolExecution],
    ) -> Result<Option<RunState>> {
        let mut tx = self.pool().begin().await?;

        let has_tool_use = !tool_execs.is_empty();

        // Only the first completion wins; racing pollers back off here.
        let affected = sqlx::query(
            r#"
            UPDATE iterations
            SET stop_reason = $2,
                response_message_id = $3,
                has_tool_use = $4,
                tool_execution_count = $5,
                input_tokens = $6,
                output_tokens = $7,
                cache_creation_tokens = $8,
                cache_read_tokens = $9,
                batch_status = CASE
                    WHEN batch_status = 'in_progress' THEN 'ended'
                    ELSE batch_status
                END,
                streaming_completed_at = CASE
                    WHEN is_streaming THEN now()
                    ELSE streaming_completed_at
                END,
                updated_at = now()
            WHERE id = $1
              AND stop_reason IS NULL
              AND error_type IS NULL
            "#,
        )
        .bind(iteration_id)
        .bind(&completed.stop_reason)
        .bind(&completed.response_message_id)
        .bind(has_tool_use)
        .bind(tool_execs.len() as i32)
        .bind(completed.usage.input_tokens)
        .bind(completed.usage.output_tokens)
        .bind(completed.usage.cache_creation_tokens)
        .bind(completed.usage.cache_read_tokens)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            r#"
            INSERT INTO messages (session_id, run_id, role, content, input_tokens, output_tokens)
            VALUES ($1, $2, 'assistant', $3, $4, $5)
            "#,
        )
        .bind(session_id)
        .bind(run_id)
        .bind(content_to_value(&completed.content))
        .bind(completed.usage.input_tokens)
        .bind(completed.usage.output_tokens)
        .execute(&mut *tx)
        .await?;

        for exec in tool_execs {
            sqlx::query(
                r#"
                INSERT INTO tool_executions (
                    run_id, iteration_id, tool_use_id, tool_name, input,
                    is_agent_tool, agent_id, max_attempts
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(run_id)
            .bind(iteration_id)
            .bind(&exec.tool_use_id)
            .bind(&exec.tool_name)
            .bind(&exec.input)
            .bind(exec.is_agent_tool)
            .bind(exec.agent_id)
            .bind(exec.max_attempts)
            .execute(&mut *tx)
            .await?;
        }

        let next_state = if has_tool_use {
            RunState::PendingTools
        } else {
            state_for_stop_reason(completed.stop_reason.as_deref())
        };

        let (error_type, error_message) = if next_state == RunState::Failed {
            (
                Some(completed.failure_kind.to_string()),
                Some(match completed.stop_reason.as_deref() {
                    Some(reason) => format!("model stopped with '{}'", reason),
                    None => "model response carried no stop reason".to_string(),
                }),
            )
        } else {
            (None, None)
        };

        let response_text = completed.response_text();

        let run_updated = sqlx::query(
            r#"
            UPDATE runs
            SET state = $2,
                previous_state = state,
                iteration_count = iteration_count + 1,
                tool_iterations = tool_iterations + CASE WHEN $3 THEN 1 ELSE 0 END,
                input_tokens = input_tokens + $4,
                output_tokens = output_tokens + $5,
                cache_creation_tokens = cache_creation_tokens + $6,
                cache_read_tokens = cache_read_tokens + $7,
                response_text = CASE
                    WHEN $2 IN ('completed', 'awaiting_input') THEN $8
                    ELSE response_text
                END,
                error_type = COALESCE($9, error_type),
                error_message = COALESCE($10, error_message),
                finalized_at = CASE
                    WHEN $2 IN ('completed', 'cancelled', 'failed') THEN now()
                    ELSE finalized_at
                END,
                updated_at = now()
            WHERE id = $1
              AND finalized_at IS NULL
            "#,
        )
        .bind(run_id)
        .bind(next_state.to_string())
        .bind(has_tool_use)
        .bind(completed.usage.input_tokens)
        .bind(completed.usage.output_tokens)
        .bind(completed.usage.cache_creation_tokens)
        .bind(completed.usage.cache_read_tokens)
        .bind(&response_text)
        .bind(&error_type)
        .bind(&error_message)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // The run finalized underneath us (cancelled, rescued to failure):
        // discard the whole completion rather than leave orphan tool rows.
        if run_updated == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(next_state))
    }

    /// Fail an iteration and its run together
    pub async fn fail_iteration_and_run(
        &self,
        iteration_id: Uuid,
        run_id: Uuid,
        kind: RunErrorKind,
        message: &str,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            UPDATE iterations
            SET error_type = $2,
                error_message = $3,
                batch_status = CASE
                    WHEN batch_status = 'in_progress' THEN 'ended'
                    ELSE batch_status
                END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(iteration_id)
        .bind(kind.to_string())
        .bind(message)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
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
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Take an iteration out of the poller's view without touching its run
    /// (the run was rescued or cancelled while the submit was in flight)
    pub async fn abandon_iteration(&self, iteration_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE iterations
            SET batch_status = NULL,
                error_type = 'abandoned',
                error_message = 'run left its claimed state during submission',
                updated_at = now()
            WHERE id = $1
              AND batch_status = 'in_progress'
            "#,
        )
        .bind(iteration_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Batch iterations due for a provider status poll. Scoped to runs this
    /// instance has claimed: an orphaned run is polled by nobody, goes
    /// stale, and the rescuer takes it from there.
    pub async fn get_iterations_for_poll(
        &self,
        instance_id: Uuid,
        min_gap: std::time::Duration,
        limit: i64,
    ) -> Result<Vec<Iteration>> {
        let rows = sqlx::query(
            r#"
            SELECT i.*
            FROM iterations i
            JOIN runs r ON r.id = i.run_id
            WHERE i.batch_status = $1
              AND r.claimed_by_instance_id = $2
              AND (
                  i.batch_last_poll_at IS NULL
                  OR i.batch_last_poll_at < now() - make_interval(secs => $3)
              )
            ORDER BY i.batch_last_poll_at NULLS FIRST
            LIMIT $4
            "#,
        )
        .bind(BatchStatus::InProgress.to_string())
        .bind(instance_id)
        .bind(min_gap.as_secs_f64())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(iteration_from_row).collect()
    }

    /// Record one status poll against an iteration and keep the owning run
    /// looking alive
    pub async fn record_batch_poll(
        &self,
        iteration_id: Uuid,
        status: BatchStatus,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        // A provider-side `canceling` batch keeps polling as in_progress
        // until it actually ends, so the status column stays put here.
        tracing::debug!(iteration_id = %iteration_id, status = %status, "Batch polled");

        sqlx::query(
            r#"
            UPDATE iterations
            SET batch_poll_count = batch_poll_count + 1,
                batch_last_poll_at = now(),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(iteration_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE runs
            SET updated_at = now()
            WHERE id = (SELECT run_id FROM iterations WHERE id = $1)
              AND finalized_at IS NULL
            "#,
        )
        .bind(iteration_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Move a claimed run into `batch_processing` once the poller first sees
    /// provider-side progress
    pub async fn mark_batch_processing(&self, run_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET state = 'batch_processing',
                previous_state = state,
                updated_at = now()
            WHERE id = $1
              AND state = 'batch_pending'
            "#,
        )
        .bind(run_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
