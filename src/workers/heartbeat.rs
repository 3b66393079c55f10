//! Instance heartbeat

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::WorkerContext;

pub struct Heartbeat {
    ctx: Arc<WorkerContext>,
}

impl Heartbeat {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(instance_id = %self.ctx.instance_id, "Heartbeat started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.config.heartbeat_interval) => {}
            }

            match self.ctx.store.heartbeat(self.ctx.instance_id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Our row is gone: the leader declared us dead and the
                    // delete trigger already released our claims.
                    tracing::error!(
                        instance_id = %self.ctx.instance_id,
                        "Instance row disappeared; claims were released"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Heartbeat failed");
                }
            }
        }

        tracing::info!("Heartbeat stopped");
    }
}
