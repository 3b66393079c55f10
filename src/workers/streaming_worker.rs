//! Streaming run worker
//!
//! Claims pending streaming runs, consumes the SSE stream inline, and
//! persists the accumulated message through the same atomic completion path
//! as the batch poller.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{Run, RunErrorKind, RunMode, RunState};
use crate::provider::MessageAccumulator;
use crate::store::{CompletedIteration, NewIteration};

use super::{prepare_iteration, preparation_failure, tool_executions_from_content, WorkerContext};

pub struct StreamingWorker {
    ctx: Arc<WorkerContext>,
    semaphore: Arc<Semaphore>,
}

impl StreamingWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_streaming_runs));
        Self { ctx, semaphore }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(instance_id = %self.ctx.instance_id, "Streaming worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.ctx.signals.streaming_worker.notified() => {}
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }

            if let Err(e) = self.sweep(&cancel).await {
                tracing::error!(error = %e, "Streaming worker sweep failed");
            }
        }

        tracing::info!("Streaming worker stopped");
    }

    async fn sweep(&self, cancel: &CancellationToken) -> crate::error::Result<()> {
        let slots = self.semaphore.available_permits() as i64;
        if slots == 0 {
            return Ok(());
        }

        let claimed = self
            .ctx
            .store
            .claim_runs(
                self.ctx.instance_id,
                slots.min(self.ctx.config.claim_batch_size),
                RunMode::Streaming,
            )
            .await?;

        for run in claimed {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| crate::error::Error::Other(e.to_string()))?;
            let ctx = self.ctx.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let run_id = run.id;
                if let Err(e) = process_streaming_run(&ctx, run, cancel).await {
                    tracing::error!(run_id = %run_id, error = %e, "Streaming run processing failed");
                }
                drop(permit);
            });
        }

        Ok(())
    }
}

/// Drive one claimed streaming run through a full provider round trip
async fn process_streaming_run(
    ctx: &WorkerContext,
    run: Run,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    tracing::info!(
        run_id = %run.id,
        iteration = run.current_iteration + 1,
        "Claimed streaming run"
    );

    let prepared = match prepare_iteration(ctx, &run).await {
        Ok(prepared) => prepared,
        Err(e) => {
            let (kind, message) = preparation_failure(&e);
            tracing::warn!(run_id = %run.id, error = %e, "Run preparation failed");
            ctx.store.fail_run(run.id, kind, &message).await?;
            return Ok(());
        }
    };

    let iteration_id = Uuid::new_v4();
    ctx.store
        .create_iteration(&NewIteration {
            id: iteration_id,
            run_id: run.id,
            iteration_number: prepared.iteration_number,
            trigger_type: prepared.trigger_type,
            is_streaming: true,
            batch_id: None,
            batch_request_id: None,
            batch_expires_at: None,
        })
        .await?;

    let mut stream = match ctx.streaming_provider.open_stream(&prepared.request).await {
        Ok(stream) => stream,
        Err(e) => {
            ctx.store
                .fail_iteration_and_run(
                    iteration_id,
                    run.id,
                    RunErrorKind::StreamingError,
                    &e.to_string(),
                )
                .await?;
            return Ok(());
        }
    };

    let mut accumulator = MessageAccumulator::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                ctx.store
                    .fail_iteration_and_run(
                        iteration_id,
                        run.id,
                        RunErrorKind::StreamingError,
                        "stream interrupted by shutdown",
                    )
                    .await?;
                return Ok(());
            }
            event = stream.next() => {
                match event {
                    Some(Ok(event)) => accumulator.apply(event),
                    Some(Err(e)) => {
                        tracing::warn!(run_id = %run.id, error = %e, "Stream error");
                        ctx.store
                            .fail_iteration_and_run(
                                iteration_id,
                                run.id,
                                RunErrorKind::StreamingError,
                                &e.to_string(),
                            )
                            .await?;
                        return Ok(());
                    }
                    None => break,
                }
            }
        }
    }

    let message = accumulator.finish();
    if message.stop_reason.is_none() && message.content.is_empty() {
        ctx.store
            .fail_iteration_and_run(
                iteration_id,
                run.id,
                RunErrorKind::StreamingError,
                "stream ended without a message",
            )
            .await?;
        return Ok(());
    }

    let tool_execs = tool_executions_from_content(
        &message.content,
        &prepared.delegates,
        ctx.config.tool_max_attempts,
    );

    let completed = CompletedIteration {
        response_message_id: message.message_id.clone(),
        stop_reason: message.stop_reason.clone(),
        content: message.content,
        usage: message.usage,
        failure_kind: RunErrorKind::StreamingError,
    };

    let next_state = ctx
        .store
        .complete_iteration(run.id, run.session_id, iteration_id, &completed, &tool_execs)
        .await?;

    if let Some(state) = next_state {
        tracing::info!(
            run_id = %run.id,
            iteration_id = %iteration_id,
            next_state = %state,
            "Streaming iteration completed"
        );

        if state == RunState::Completed && ctx.config.compaction.auto_compact {
            if let Err(e) = ctx.compactor.maybe_compact(run.session_id).await {
                tracing::warn!(
                    session_id = %run.session_id,
                    error = %e,
                    "Post-run compaction failed"
                );
            }
        }
    }

    Ok(())
}
