//! Tool worker
//!
//! Drains due tool executions FIFO. Regular tools run their callback under a
//! timeout and report back through the error dispositions; agent tools spawn
//! a child run and let the finalization trigger complete the execution. This
//! worker also owns the guarded `pending_tools -> pending_api` transition
//! once a run's last execution settles.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::models::{RunState, ToolExecution};
use crate::store::NewRun;
use crate::tools::{ToolContext, ToolError};

use super::WorkerContext;

const SETTLED_SWEEP_LIMIT: i64 = 50;

/// Retry delay for a failed attempt: `attempt^4` seconds with proportional
/// jitter. Jitter at or below zero means immediate retry.
pub fn retry_delay(attempt: i32, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return Duration::ZERO;
    }
    let base = (attempt.max(1) as f64).powi(4);
    let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
    Duration::from_secs_f64((base * factor).max(0.0))
}

pub struct ToolWorker {
    ctx: Arc<WorkerContext>,
    semaphore: Arc<Semaphore>,
}

impl ToolWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_tools));
        Self { ctx, semaphore }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(instance_id = %self.ctx.instance_id, "Tool worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.ctx.signals.tool_worker.notified() => {}
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }

            if let Err(e) = self.advance_settled_runs().await {
                tracing::error!(error = %e, "Settled-run sweep failed");
            }
            if let Err(e) = self.sweep_executions().await {
                tracing::error!(error = %e, "Tool execution sweep failed");
            }
        }

        tracing::info!("Tool worker stopped");
    }

    /// Attempt the guarded transition for every run whose tool round is
    /// done. Races freely across instances; exactly one worker wins each
    /// run and the state trigger wakes the run workers.
    async fn advance_settled_runs(&self) -> crate::error::Result<()> {
        let run_ids = self
            .ctx
            .store
            .get_runs_with_settled_tools(SETTLED_SWEEP_LIMIT)
            .await?;

        for run_id in run_ids {
            let won = self
                .ctx
                .store
                .update_run_state(run_id, RunState::PendingApi, Some(RunState::PendingTools))
                .await?;
            if won {
                tracing::info!(run_id = %run_id, "Tool round complete, run ready for next iteration");
            }
        }

        Ok(())
    }

    async fn sweep_executions(&self) -> crate::error::Result<()> {
        let slots = self.semaphore.available_permits() as i64;
        if slots == 0 {
            return Ok(());
        }

        let claimed = self
            .ctx
            .store
            .claim_tool_executions(self.ctx.instance_id, slots.min(self.ctx.config.claim_batch_size))
            .await?;

        for execution in claimed {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| crate::error::Error::Other(e.to_string()))?;
            let ctx = self.ctx.clone();

            tokio::spawn(async move {
                let execution_id = execution.id;
                if let Err(e) = process_execution(&ctx, execution).await {
                    tracing::error!(
                        tool_execution_id = %execution_id,
                        error = %e,
                        "Tool execution processing failed"
                    );
                }
                drop(permit);
            });
        }

        Ok(())
    }
}

async fn process_execution(
    ctx: &WorkerContext,
    execution: ToolExecution,
) -> crate::error::Result<()> {
    tracing::info!(
        tool_execution_id = %execution.id,
        tool_name = %execution.tool_name,
        attempt = execution.attempt_count,
        "Executing tool"
    );

    if execution.is_agent_tool {
        dispatch_agent_tool(ctx, &execution).await
    } else {
        dispatch_regular_tool(ctx, &execution).await
    }
}

/// Create the child run for a delegate call. The execution stays `running`;
/// the child's finalization trigger writes its result back.
async fn dispatch_agent_tool(
    ctx: &WorkerContext,
    execution: &ToolExecution,
) -> crate::error::Result<()> {
    let Some(agent_id) = execution.agent_id else {
        ctx.store
            .fail_tool_execution(execution.id, "delegate tool has no agent id")
            .await?;
        return Ok(());
    };

    let task = execution
        .input
        .get("task")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if task.is_empty() {
        ctx.store
            .fail_tool_execution(execution.id, "delegate call carried no task")
            .await?;
        return Ok(());
    }

    let parent = ctx.store.get_run(execution.run_id).await?;

    // A delegate converses in its own child session so its tool traffic
    // never mixes into the caller's history.
    let child_session = ctx
        .store
        .create_child_session(parent.session_id, parent.depth + 1)
        .await?;

    let child = ctx
        .store
        .create_run(&NewRun {
            session_id: child_session.id,
            agent_id,
            prompt: task,
            run_mode: parent.run_mode,
            variables: parent.variables.clone(),
            parent_run_id: Some(parent.id),
            parent_tool_execution_id: Some(execution.id),
            depth: parent.depth + 1,
        })
        .await?;

    ctx.store.set_child_run(execution.id, child.id).await?;

    tracing::info!(
        tool_execution_id = %execution.id,
        child_run_id = %child.id,
        depth = child.depth,
        "Delegate run created"
    );

    Ok(())
}

async fn dispatch_regular_tool(
    ctx: &WorkerContext,
    execution: &ToolExecution,
) -> crate::error::Result<()> {
    let Some(tool) = ctx.registry.get(&execution.tool_name).cloned() else {
        // The claim filter should make this impossible; a tool unregistered
        // mid-flight still must not wedge the run.
        ctx.store
            .fail_tool_execution(
                execution.id,
                &format!("tool '{}' is not registered on this instance", execution.tool_name),
            )
            .await?;
        return Ok(());
    };

    let run = ctx.store.get_run(execution.run_id).await?;
    let tool_ctx = ToolContext {
        run_id: run.id,
        session_id: run.session_id,
        variables: run.variables.clone(),
        db: ctx.store.pool().clone(),
    };

    let outcome = tokio::time::timeout(
        ctx.config.tool_execution_timeout,
        tool.execute(&tool_ctx, execution.input.clone()),
    )
    .await;

    match outcome {
        Ok(Ok(output)) => {
            tracing::info!(
                tool_execution_id = %execution.id,
                tool_name = %execution.tool_name,
                "Tool completed"
            );
            ctx.store.complete_tool_execution(execution.id, &output).await?;
        }
        Ok(Err(ToolError::Snooze(duration))) => {
            tracing::info!(
                tool_execution_id = %execution.id,
                snooze = ?duration,
                "Tool snoozed"
            );
            let scheduled_at = Utc::now()
                + chrono::Duration::from_std(duration)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
            ctx.store
                .snooze_tool_execution(execution.id, scheduled_at)
                .await?;
        }
        Ok(Err(error)) if error.is_permanent() => {
            tracing::warn!(
                tool_execution_id = %execution.id,
                error = %error,
                "Tool failed permanently"
            );
            ctx.store
                .fail_tool_execution(execution.id, &error.to_string())
                .await?;
        }
        Ok(Err(error)) => {
            handle_retriable(ctx, execution, error.to_string()).await?;
        }
        Err(_) => {
            handle_retriable(
                ctx,
                execution,
                format!(
                    "tool timed out after {:?}",
                    ctx.config.tool_execution_timeout
                ),
            )
            .await?;
        }
    }

    Ok(())
}

async fn handle_retriable(
    ctx: &WorkerContext,
    execution: &ToolExecution,
    error: String,
) -> crate::error::Result<()> {
    if execution.attempt_count >= execution.max_attempts {
        tracing::warn!(
            tool_execution_id = %execution.id,
            attempts = execution.attempt_count,
            error = %error,
            "Tool exhausted its attempts"
        );
        ctx.store.fail_tool_execution(execution.id, &error).await?;
        return Ok(());
    }

    let delay = retry_delay(execution.attempt_count, ctx.config.tool_retry_jitter);
    let scheduled_at =
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

    tracing::warn!(
        tool_execution_id = %execution.id,
        attempt = execution.attempt_count,
        retry_in = ?delay,
        error = %error,
        "Tool failed, retrying"
    );

    ctx.store
        .retry_tool_execution(execution.id, scheduled_at, &error)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_without_jitter_is_immediate() {
        assert_eq!(retry_delay(1, 0.0), Duration::ZERO);
        assert_eq!(retry_delay(3, 0.0), Duration::ZERO);
    }

    #[test]
    fn test_retry_delay_grows_with_attempts() {
        let jitter = 0.1;
        let first = retry_delay(1, jitter);
        let third = retry_delay(3, jitter);
        // attempt^4: 1s vs 81s, jitter can only move them +-10%.
        assert!(first <= Duration::from_secs_f64(1.2));
        assert!(third >= Duration::from_secs_f64(70.0));
        assert!(third <= Duration::from_secs_f64(90.0));
    }
}
