//! Batch poller
//!
//! Periodically asks the provider about in-flight batch iterations, enforces
//! the 24-hour expiry locally, and on completion runs the same atomic
//! iteration-completion path the streaming worker uses. `min_batch_poll_gap`
//! plus the per-sweep limit bound the provider load regardless of how many
//! instances poll.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::models::{BatchStatus, Iteration, RunErrorKind, RunState};
use crate::provider::BatchResult;
use crate::store::CompletedIteration;

use super::{tool_executions_from_content, WorkerContext};

const POLL_SWEEP_LIMIT: i64 = 50;

pub struct BatchPoller {
    ctx: Arc<WorkerContext>,
}

impl BatchPoller {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(instance_id = %self.ctx.instance_id, "Batch poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.ctx.signals.batch_poller.notified() => {}
                _ = tokio::time::sleep(self.ctx.config.batch_poll_interval) => {}
            }

            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "Batch poller sweep failed");
            }
        }

        tracing::info!("Batch poller stopped");
    }

    async fn sweep(&self) -> crate::error::Result<()> {
        let due = self
            .ctx
            .store
            .get_iterations_for_poll(
                self.ctx.instance_id,
                self.ctx.config.min_batch_poll_gap,
                POLL_SWEEP_LIMIT,
            )
            .await?;

        for iteration in due {
            if let Err(e) = self.poll_iteration(&iteration).await {
                tracing::error!(
                    iteration_id = %iteration.id,
                    error = %e,
                    "Polling batch iteration failed"
                );
            }
        }

        Ok(())
    }

    async fn poll_iteration(&self, iteration: &Iteration) -> crate::error::Result<()> {
        // Local expiry enforcement needs no successful status poll.
        if let Some(expires_at) = iteration.batch_expires_at {
            if expires_at < Utc::now() {
                tracing::warn!(
                    iteration_id = %iteration.id,
                    run_id = %iteration.run_id,
                    "Batch expired before completing"
                );
                self.ctx
                    .store
                    .fail_iteration_and_run(
                        iteration.id,
                        iteration.run_id,
                        RunErrorKind::BatchExpired,
                        "batch expired before a result was available",
                    )
                    .await?;
                return Ok(());
            }
        }

        let Some(batch_id) = iteration.batch_id.as_deref() else {
            tracing::warn!(iteration_id = %iteration.id, "In-progress iteration has no batch id");
            return Ok(());
        };

        let status = self.ctx.batch_provider.get_batch_status(batch_id).await;

        // Poll bookkeeping happens whether or not the provider answered.
        let observed = match &status {
            Ok(info) => info.status,
            Err(_) => BatchStatus::InProgress,
        };
        self.ctx
            .store
            .record_batch_poll(iteration.id, observed)
            .await?;

        let info = match status {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(
                    iteration_id = %iteration.id,
                    batch_id = %batch_id,
                    error = %e,
                    "Batch status poll failed"
                );
                return Ok(());
            }
        };

        match info.status {
            BatchStatus::InProgress | BatchStatus::Canceling => {
                self.ctx.store.mark_batch_processing(iteration.run_id).await?;
            }
            BatchStatus::Ended => {
                let request_id = iteration
                    .batch_request_id
                    .as_deref()
                    .unwrap_or_default()
                    .to_string();
                let result = self
                    .ctx
                    .batch_provider
                    .get_batch_result(batch_id, &request_id)
                    .await?;
                self.dispatch_result(iteration, result).await?;
            }
        }

        Ok(())
    }

    async fn dispatch_result(
        &self,
        iteration: &Iteration,
        result: BatchResult,
    ) -> crate::error::Result<()> {
        match result {
            BatchResult::Succeeded(message) => {
                let run = self.ctx.store.get_run(iteration.run_id).await?;
                let agent = self.ctx.store.get_agent(run.agent_id).await?;
                let delegates = self.ctx.store.get_agents(&agent.agent_ids).await?;

                let tool_execs = tool_executions_from_content(
                    &message.content,
                    &delegates,
                    self.ctx.config.tool_max_attempts,
                );

                let completed = CompletedIteration {
                    response_message_id: message.message_id.clone(),
                    stop_reason: message.stop_reason.clone(),
                    content: message.content,
                    usage: message.usage,
                    failure_kind: RunErrorKind::BatchError,
                };

                let next_state = self
                    .ctx
                    .store
                    .complete_iteration(run.id, run.session_id, iteration.id, &completed, &tool_execs)
                    .await?;

                match next_state {
                    Some(state) => {
                        tracing::info!(
                            run_id = %run.id,
                            iteration_id = %iteration.id,
                            next_state = %state,
                            "Batch iteration completed"
                        );
                        if state == RunState::Completed && self.ctx.config.compaction.auto_compact {
                            if let Err(e) = self.ctx.compactor.maybe_compact(run.session_id).await {
                                tracing::warn!(
                                    session_id = %run.session_id,
                                    error = %e,
                                    "Post-run compaction failed"
                                );
                            }
                        }
                    }
                    None => {
                        tracing::debug!(
                            iteration_id = %iteration.id,
                            "Iteration already completed by another poller"
                        );
                    }
                }
            }
            BatchResult::Errored(message) => {
                self.ctx
                    .store
                    .fail_iteration_and_run(
                        iteration.id,
                        iteration.run_id,
                        RunErrorKind::BatchError,
                        &message,
                    )
                    .await?;
            }
            BatchResult::Canceled => {
                self.ctx
                    .store
                    .fail_iteration_and_run(
                        iteration.id,
                        iteration.run_id,
                        RunErrorKind::BatchCanceled,
                        "batch was canceled at the provider",
                    )
                    .await?;
            }
            BatchResult::Expired => {
                self.ctx
                    .store
                    .fail_iteration_and_run(
                        iteration.id,
                        iteration.run_id,
                        RunErrorKind::BatchExpired,
                        "batch request expired at the provider",
                    )
                    .await?;
            }
        }

        Ok(())
    }
}
