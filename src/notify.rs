//! LISTEN/NOTIFY plumbing
//!
//! The database triggers are the only emitters; this module is the receiving
//! side. A single dispatcher task listens on all five channels, wakes the
//! right worker through a coalescing signal, and fans `run_finalized` out to
//! per-run waiters. Workers never rely on notifications alone -- each one also
//! polls, so a dropped notification costs at most one poll interval of
//! latency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::models::RunMode;

pub const CHANNEL_RUN_CREATED: &str = "run_created";
pub const CHANNEL_RUN_STATE: &str = "run_state";
pub const CHANNEL_RUN_FINALIZED: &str = "run_finalized";
pub const CHANNEL_TOOL_PENDING: &str = "tool_pending";
pub const CHANNEL_TOOLS_COMPLETE: &str = "tools_complete";

const ALL_CHANNELS: [&str; 5] = [
    CHANNEL_RUN_CREATED,
    CHANNEL_RUN_STATE,
    CHANNEL_RUN_FINALIZED,
    CHANNEL_TOOL_PENDING,
    CHANNEL_TOOLS_COMPLETE,
];

#[derive(Debug, Clone, Deserialize)]
pub struct RunCreatedPayload {
    pub run_id: Uuid,
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub run_mode: String,
    pub depth: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunStatePayload {
    pub run_id: Uuid,
    pub session_id: Uuid,
    pub old_state: String,
    pub new_state: String,
    pub run_mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunFinalizedPayload {
    pub run_id: Uuid,
    pub session_id: Uuid,
    pub state: String,
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolPendingPayload {
    pub tool_execution_id: Uuid,
    pub run_id: Uuid,
    pub tool_name: String,
    pub is_agent_tool: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsCompletePayload {
    pub run_id: Uuid,
}

/// Coalescing wake signals, one per worker. `Notify` holds at most one
/// permit, which is exactly the bounded-capacity-1 semantics the dispatcher
/// needs: extra notifications merge and the woken worker sweeps for
/// everything anyway.
#[derive(Clone, Default)]
pub struct WorkerSignals {
    pub run_worker: Arc<Notify>,
    pub streaming_worker: Arc<Notify>,
    pub tool_worker: Arc<Notify>,
    pub batch_poller: Arc<Notify>,
}

/// Registry of callers blocked in `wait_for_run`
#[derive(Default)]
pub struct RunWaiters {
    waiters: Mutex<HashMap<Uuid, Vec<oneshot::Sender<RunFinalizedPayload>>>>,
}

impl RunWaiters {
    /// Register interest in a run's finalization. Must be called before
    /// re-reading run state to close the lost-wakeup window.
    pub fn register(&self, run_id: Uuid) -> oneshot::Receiver<RunFinalizedPayload> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("run waiter lock poisoned")
            .entry(run_id)
            .or_default()
            .push(tx);
        rx
    }

    fn notify(&self, payload: &RunFinalizedPayload) {
        let senders = self
            .waiters
            .lock()
            .expect("run waiter lock poisoned")
            .remove(&payload.run_id);
        if let Some(senders) = senders {
            for sender in senders {
                // A waiter that timed out and dropped its receiver is fine.
                let _ = sender.send(payload.clone());
            }
        }
    }

    /// Drop any waiters a caller abandoned
    pub fn forget(&self, run_id: Uuid) {
        self.waiters
            .lock()
            .expect("run waiter lock poisoned")
            .remove(&run_id);
    }
}

/// The single listener task for all trigger-emitted channels
pub struct NotificationDispatcher {
    listener: PgListener,
    signals: WorkerSignals,
    waiters: Arc<RunWaiters>,
}

impl NotificationDispatcher {
    pub async fn connect(
        pool: &PgPool,
        signals: WorkerSignals,
        waiters: Arc<RunWaiters>,
    ) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen_all(ALL_CHANNELS).await?;

        Ok(Self {
            listener,
            signals,
            waiters,
        })
    }

    /// Listen until cancelled. Listener errors are logged and retried; the
    /// workers' polling fallback guarantees progress in the meantime.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Notification dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.listener.recv() => {
                    match received {
                        Ok(notification) => {
                            self.dispatch(notification.channel(), notification.payload());
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Notification listener error, retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        tracing::info!("Notification dispatcher stopped");
    }

    fn dispatch(&self, channel: &str, payload: &str) {
        tracing::debug!(channel = %channel, payload = %payload, "Notification received");

        match channel {
            CHANNEL_RUN_CREATED => {
                match serde_json::from_str::<RunCreatedPayload>(payload) {
                    Ok(p) => self.wake_run_worker(&p.run_mode),
                    Err(e) => tracing::warn!(error = %e, "Bad run_created payload"),
                }
            }
            CHANNEL_RUN_STATE => {
                match serde_json::from_str::<RunStatePayload>(payload) {
                    Ok(p) => {
                        // Re-announced work: rescued runs come back as
                        // pending, finished tool rounds as pending_api.
                        if p.new_state == "pending" || p.new_state == "pending_api" {
                            self.wake_run_worker(&p.run_mode);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Bad run_state payload"),
                }
            }
            CHANNEL_RUN_FINALIZED => {
                match serde_json::from_str::<RunFinalizedPayload>(payload) {
                    Ok(p) => self.waiters.notify(&p),
                    Err(e) => tracing::warn!(error = %e, "Bad run_finalized payload"),
                }
            }
            CHANNEL_TOOL_PENDING => {
                self.signals.tool_worker.notify_one();
            }
            CHANNEL_TOOLS_COMPLETE => {
                // The tool worker owns the guarded pending_tools ->
                // pending_api transition; waking it is enough.
                self.signals.tool_worker.notify_one();
            }
            other => {
                tracing::warn!(channel = %other, "Notification on unknown channel");
            }
        }
    }

    fn wake_run_worker(&self, run_mode: &str) {
        match run_mode.parse::<RunMode>() {
            Ok(RunMode::Batch) => self.signals.run_worker.notify_one(),
            Ok(RunMode::Streaming) => self.signals.streaming_worker.notify_one(),
            Err(_) => {
                // Unknown mode: wake both rather than stall a run.
                self.signals.run_worker.notify_one();
                self.signals.streaming_worker.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_parsing() {
        let payload = r#"{
            "run_id": "c2a6bd1e-7f2a-4be5-bb3e-52909b30eb32",
            "session_id": "0b2d9e5e-50a1-41a8-9be1-4fd4ab4e25b5",
            "agent_id": "9f8f2f41-17e6-4a57-b1b4-1f2b5ff0a111",
            "parent_run_id": null,
            "run_mode": "batch",
            "depth": 0
        }"#;
        let parsed: RunCreatedPayload = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.run_mode, "batch");
        assert_eq!(parsed.depth, 0);
        assert!(parsed.parent_run_id.is_none());
    }

    #[test]
    fn test_waiter_fan_out() {
        let waiters = RunWaiters::default();
        let run_id = Uuid::new_v4();
        let rx1 = waiters.register(run_id);
        let rx2 = waiters.register(run_id);

        waiters.notify(&RunFinalizedPayload {
            run_id,
            session_id: Uuid::new_v4(),
            state: "completed".to_string(),
            error_type: None,
        });

        assert_eq!(rx1.blocking_recv().unwrap().state, "completed");
        assert_eq!(rx2.blocking_recv().unwrap().state, "completed");
    }

    #[test]
    fn test_waiter_forget() {
        let waiters = RunWaiters::default();
        let run_id = Uuid::new_v4();
        let rx = waiters.register(run_id);
        waiters.forget(run_id);

        waiters.notify(&RunFinalizedPayload {
            run_id,
            session_id: Uuid::new_v4(),
            state: "completed".to_string(),
            error_type: None,
        });

        assert!(rx.blocking_recv().is_err());
    }
}
