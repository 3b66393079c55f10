//! Leader election over the single-row lease

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::WorkerContext;

pub struct LeaderElector {
    ctx: Arc<WorkerContext>,
    is_leader: watch::Sender<bool>,
}

impl LeaderElector {
    /// Returns the elector and a receiver the rescuer watches
    pub fn new(ctx: Arc<WorkerContext>) -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                ctx,
                is_leader: tx,
            },
            rx,
        )
    }

    /// Attempt acquisition (or refresh) every `leader_ttl / 2` until
    /// cancelled, then release if held
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.ctx.config.leader_ttl / 2;
        tracing::info!(instance_id = %self.ctx.instance_id, "Leader elector started");

        loop {
            match self
                .ctx
                .store
                .try_acquire_leadership(self.ctx.instance_id, self.ctx.config.leader_ttl)
                .await
            {
                Ok(acquired) => {
                    let was_leader = *self.is_leader.borrow();
                    if acquired != was_leader {
                        if acquired {
                            tracing::info!(instance_id = %self.ctx.instance_id, "Acquired leadership");
                        } else {
                            tracing::info!(instance_id = %self.ctx.instance_id, "Lost leadership");
                        }
                        let _ = self.is_leader.send(acquired);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Leadership attempt failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if *self.is_leader.borrow() {
            if let Err(e) = self
                .ctx
                .store
                .release_leadership(self.ctx.instance_id)
                .await
            {
                tracing::warn!(error = %e, "Failed to release leadership");
            } else {
                tracing::info!(instance_id = %self.ctx.instance_id, "Released leadership");
            }
        }

        tracing::info!("Leader elector stopped");
    }
}
