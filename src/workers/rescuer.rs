//! Rescuer and stale-instance cleanup (leader only)
//!
//! A run is stuck when it has sat in an in-progress state past
//! `rescue_timeout` with no live claimer. Rescue resets it to `pending` and
//! counts the attempt; past `max_rescue_attempts` the run fails for good.
//! The same loop deletes instances whose heartbeat went silent, which
//! releases their claims through the delete trigger.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::models::RunErrorKind;

use super::WorkerContext;

const RESCUE_SWEEP_LIMIT: i64 = 20;

pub struct Rescuer {
    ctx: Arc<WorkerContext>,
    is_leader: watch::Receiver<bool>,
}

impl Rescuer {
    pub fn new(ctx: Arc<WorkerContext>, is_leader: watch::Receiver<bool>) -> Self {
        Self { ctx, is_leader }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(instance_id = %self.ctx.instance_id, "Rescuer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.config.heartbeat_interval) => {}
            }

            if !*self.is_leader.borrow() {
                continue;
            }

            if let Err(e) = self.cleanup_stale_instances().await {
                tracing::error!(error = %e, "Stale instance cleanup failed");
            }
            if let Err(e) = self.rescue_stuck_runs().await {
                tracing::error!(error = %e, "Rescue sweep failed");
            }
        }

        tracing::info!("Rescuer stopped");
    }

    async fn cleanup_stale_instances(&self) -> crate::error::Result<()> {
        let removed = self
            .ctx
            .store
            .delete_stale_instances(self.ctx.config.instance_ttl)
            .await?;
        if removed > 0 {
            tracing::warn!(removed = removed, "Deleted stale instances");
        }
        Ok(())
    }

    async fn rescue_stuck_runs(&self) -> crate::error::Result<()> {
        let stuck = self
            .ctx
            .store
            .get_stuck_runs(self.ctx.config.rescue_timeout, RESCUE_SWEEP_LIMIT)
            .await?;

        for run in stuck {
            if run.rescue_attempts >= self.ctx.config.max_rescue_attempts {
                tracing::error!(
                    run_id = %run.id,
                    rescue_attempts = run.rescue_attempts,
                    "Run exceeded rescue budget, failing"
                );
                self.ctx
                    .store
                    .fail_run(
                        run.id,
                        RunErrorKind::RescueFailed,
                        &format!("run could not be recovered after {} rescues", run.rescue_attempts),
                    )
                    .await?;
                continue;
            }

            let rescued = self.ctx.store.rescue_run(run.id).await?;
            if rescued {
                tracing::warn!(
                    run_id = %run.id,
                    stuck_state = %run.state,
                    rescue_attempts = run.rescue_attempts + 1,
                    "Rescued stuck run"
                );
            }
        }

        Ok(())
    }
}
