//! Batch run worker
//!
//! Claims pending batch runs, builds each one's provider request, submits it
//! to the deferred-batch API, and hands the iteration to the batch poller by
//! moving the run to `batch_pending`.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{Run, RunMode, RunState};
use crate::store::NewIteration;

use super::{prepare_iteration, preparation_failure, WorkerContext};

/// Provider-side lifetime of a submitted batch
const BATCH_EXPIRY_HOURS: i64 = 24;

pub struct RunWorker {
    ctx: Arc<WorkerContext>,
    semaphore: Arc<Semaphore>,
}

impl RunWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_runs));
        Self { ctx, semaphore }
    }

    /// Main loop: wake on notification or poll tick, then sweep
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(instance_id = %self.ctx.instance_id, "Run worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.ctx.signals.run_worker.notified() => {}
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }

            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "Run worker sweep failed");
            }
        }

        tracing::info!("Run worker stopped");
    }

    async fn sweep(&self) -> crate::error::Result<()> {
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
                RunMode::Batch,
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

            tokio::spawn(async move {
                let run_id = run.id;
                if let Err(e) = process_claimed_run(&ctx, run).await {
                    tracing::error!(run_id = %run_id, error = %e, "Batch run processing failed");
                }
                drop(permit);
            });
        }

        Ok(())
    }
}

/// Drive one claimed run through submission
async fn process_claimed_run(ctx: &WorkerContext, run: Run) -> crate::error::Result<()> {
    tracing::info!(
        run_id = %run.id,
        iteration = run.current_iteration + 1,
        "Claimed batch run"
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

    // The iteration id is the batch correlation id, so it exists first.
    let iteration_id = Uuid::new_v4();
    let custom_id = iteration_id.to_string();

    let handle = match ctx
        .batch_provider
        .submit_batch(&custom_id, &prepared.request)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(run_id = %run.id, error = %e, "Batch submission failed");
            ctx.store
                .fail_run(
                    run.id,
                    crate::models::RunErrorKind::BatchSubmitError,
                    &e.to_string(),
                )
                .await?;
            return Ok(());
        }
    };

    ctx.store
        .create_iteration(&NewIteration {
            id: iteration_id,
            run_id: run.id,
            iteration_number: prepared.iteration_number,
            trigger_type: prepared.trigger_type,
            is_streaming: false,
            batch_id: Some(handle.batch_id.clone()),
            batch_request_id: Some(handle.request_id),
            batch_expires_at: Some(Utc::now() + ChronoDuration::hours(BATCH_EXPIRY_HOURS)),
        })
        .await?;

    let moved = ctx
        .store
        .update_run_state(run.id, RunState::BatchPending, Some(RunState::BatchSubmitting))
        .await?;
    if !moved {
        // Rescued or cancelled mid-submission; take the iteration away from
        // the poller so the orphaned batch is ignored.
        tracing::warn!(run_id = %run.id, "Run left batch_submitting during submit");
        ctx.store.abandon_iteration(iteration_id).await?;
        return Ok(());
    }

    tracing::info!(
        run_id = %run.id,
        batch_id = %handle.batch_id,
        iteration_id = %iteration_id,
        "Batch submitted"
    );

    Ok(())
}
