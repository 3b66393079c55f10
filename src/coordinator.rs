//! Coordinator: client lifecycle and the public run API
//!
//! One coordinator per process. It validates registrations, registers the
//! instance row and its capability rows, supervises the workers, and exposes
//! the run API. Runs may be created in batch or streaming mode per call, and
//! the two modes may freely share a session: tool-result adjacency is
//! enforced by history assembly, not by mode.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgConnection;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::compaction::Compactor;
use crate::config::Config;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::models::{
    Agent, AgentSpec, CompactionEvent, CompactionStrategy, Instance, Message, Run, RunMode,
    RunState, Session,
};
use crate::notify::{NotificationDispatcher, RunWaiters, WorkerSignals};
use crate::provider::{
    AnthropicProvider, BatchProvider, CompletionProvider, StreamingProvider,
};
use crate::store::{NewRun, Store};
use crate::tools::{Tool, ToolRegistry};
use crate::workers::{
    batch_poller::BatchPoller, heartbeat::Heartbeat, leader::LeaderElector, rescuer::Rescuer,
    run_worker::RunWorker, streaming_worker::StreamingWorker, tool_worker::ToolWorker,
    WorkerContext,
};

/// Poll interval waiters fall back to when a notification goes missing
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Builder for a [`Coordinator`]
pub struct CoordinatorBuilder {
    config: Config,
    registry: ToolRegistry,
    batch_provider: Option<Arc<dyn BatchProvider>>,
    streaming_provider: Option<Arc<dyn StreamingProvider>>,
    completion_provider: Option<Arc<dyn CompletionProvider>>,
}

impl CoordinatorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: ToolRegistry::new(),
            batch_provider: None,
            streaming_provider: None,
            completion_provider: None,
        }
    }

    /// Register a tool this instance can execute
    pub fn register_tool(mut self, tool: Arc<dyn Tool>) -> Result<Self> {
        self.registry.register(tool)?;
        Ok(self)
    }

    /// Override the batch provider (tests, proxies)
    pub fn batch_provider(mut self, provider: Arc<dyn BatchProvider>) -> Self {
        self.batch_provider = Some(provider);
        self
    }

    /// Override the streaming provider
    pub fn streaming_provider(mut self, provider: Arc<dyn StreamingProvider>) -> Self {
        self.streaming_provider = Some(provider);
        self
    }

    /// Override the completion provider used for compaction summaries
    pub fn completion_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.completion_provider = Some(provider);
        self
    }

    pub async fn build(self) -> Result<Coordinator> {
        self.config.validate()?;

        let database = Database::new(&self.config.database_url)?;
        let store = Store::new(database.pool().clone());

        // One Anthropic adapter backs whichever capabilities were not
        // overridden.
        let default_provider: Option<Arc<AnthropicProvider>> = if self.batch_provider.is_none()
            || self.streaming_provider.is_none()
            || self.completion_provider.is_none()
        {
            if self.config.api_key.is_empty() {
                return Err(Error::Configuration(
                    "api_key is required unless all providers are overridden".to_string(),
                ));
            }
            Some(Arc::new(AnthropicProvider::new(self.config.api_key.clone())?))
        } else {
            None
        };

        let batch_provider: Arc<dyn BatchProvider> = match self.batch_provider {
            Some(provider) => provider,
            None => default_provider.clone().ok_or_else(|| {
                Error::Configuration("no batch provider available".to_string())
            })?,
        };
        let streaming_provider: Arc<dyn StreamingProvider> = match self.streaming_provider {
            Some(provider) => provider,
            None => default_provider.clone().ok_or_else(|| {
                Error::Configuration("no streaming provider available".to_string())
            })?,
        };
        let completion_provider: Arc<dyn CompletionProvider> = match self.completion_provider {
            Some(provider) => provider,
            None => default_provider.clone().ok_or_else(|| {
                Error::Configuration("no completion provider available".to_string())
            })?,
        };

        Ok(Coordinator {
            instance_id: Uuid::new_v4(),
            config: self.config,
            database,
            store,
            registry: Arc::new(self.registry),
            batch_provider,
            streaming_provider,
            completion_provider,
            signals: WorkerSignals::default(),
            waiters: Arc::new(RunWaiters::default()),
            lifecycle: tokio::sync::Mutex::new(None),
        })
    }
}

struct Lifecycle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

/// The engine's per-process entry point
pub struct Coordinator {
    instance_id: Uuid,
    config: Config,
    database: Database,
    store: Store,
    registry: Arc<ToolRegistry>,
    batch_provider: Arc<dyn BatchProvider>,
    streaming_provider: Arc<dyn StreamingProvider>,
    completion_provider: Arc<dyn CompletionProvider>,
    signals: WorkerSignals,
    waiters: Arc<RunWaiters>,
    lifecycle: tokio::sync::Mutex<Option<Lifecycle>>,
}

impl Coordinator {
    pub fn builder(config: Config) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Direct store access for advanced callers
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Start the engine: run migrations, validate references, register the
    /// instance, and launch the workers. Calling twice is an error.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(Error::InvalidInput("coordinator already started".to_string()));
        }

        self.database.initialize().await?;
        self.validate_agents().await?;

        // Advertise the tool catalog and this instance's capability set.
        for name in self.registry.names() {
            if let Some(tool) = self.registry.get(&name) {
                self.store
                    .upsert_tool_row(tool.name(), tool.description(), &tool.input_schema())
                    .await?;
            }
        }

        let hostname = std::env::var("HOSTNAME").unwrap_or_default();
        self.store
            .register_instance(
                self.instance_id,
                &self.config.instance_name,
                &hostname,
                std::process::id() as i32,
                self.config.max_concurrent_runs as i32,
                self.config.max_concurrent_tools as i32,
                &self.registry.names(),
            )
            .await?;

        let ctx = Arc::new(WorkerContext {
            store: self.store.clone(),
            config: self.config.clone(),
            instance_id: self.instance_id,
            registry: self.registry.clone(),
            batch_provider: self.batch_provider.clone(),
            streaming_provider: self.streaming_provider.clone(),
            compactor: Arc::new(Compactor::new(
                self.store.clone(),
                self.completion_provider.clone(),
                self.config.compaction.clone(),
            )),
            signals: self.signals.clone(),
        });

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let dispatcher = NotificationDispatcher::connect(
            self.database.pool(),
            self.signals.clone(),
            self.waiters.clone(),
        )
        .await?;
        tasks.spawn(dispatcher.run(cancel.clone()));

        tasks.spawn(RunWorker::new(ctx.clone()).run(cancel.clone()));
        tasks.spawn(StreamingWorker::new(ctx.clone()).run(cancel.clone()));
        tasks.spawn(ToolWorker::new(ctx.clone()).run(cancel.clone()));
        tasks.spawn(BatchPoller::new(ctx.clone()).run(cancel.clone()));
        tasks.spawn(Heartbeat::new(ctx.clone()).run(cancel.clone()));

        let (elector, is_leader) = LeaderElector::new(ctx.clone());
        tasks.spawn(elector.run(cancel.clone()));
        tasks.spawn(Rescuer::new(ctx, is_leader).run(cancel.clone()));

        *lifecycle = Some(Lifecycle { cancel, tasks });

        tracing::info!(
            instance_id = %self.instance_id,
            instance_name = %self.config.instance_name,
            tools = self.registry.len(),
            "Coordinator started"
        );

        Ok(())
    }

    /// Stop the engine: cancel the workers, wait up to `deadline` for them,
    /// and delete the instance row so the database releases our claims.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        let Some(Lifecycle { cancel, mut tasks }) = self.lifecycle.lock().await.take() else {
            return Ok(());
        };

        tracing::info!(instance_id = %self.instance_id, "Coordinator stopping");
        cancel.cancel();

        let drained = tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Workers did not stop within the deadline, aborting them");
            tasks.abort_all();
        }

        // Leadership is released by the elector on cancel; the instance
        // delete fires the claim-release trigger either way.
        self.store.delete_instance(self.instance_id).await?;

        tracing::info!(instance_id = %self.instance_id, "Coordinator stopped");
        Ok(())
    }

    /// Startup reference validation: delegates must resolve and an agent must
    /// not delegate to itself. A tool name this instance does not host is a
    /// warning only -- another instance may host it, and the claim protocol
    /// keeps such runs away from us.
    async fn validate_agents(&self) -> Result<()> {
        let agents = self.store.list_agents().await?;
        let known: std::collections::HashSet<Uuid> = agents.iter().map(|a| a.id).collect();

        for agent in &agents {
            if agent.agent_ids.contains(&agent.id) {
                return Err(Error::Validation(format!(
                    "agent '{}' lists itself as a delegate",
                    agent.name
                )));
            }
            for delegate_id in &agent.agent_ids {
                if !known.contains(delegate_id) {
                    return Err(Error::Validation(format!(
                        "agent '{}' references unknown delegate {}",
                        agent.name, delegate_id
                    )));
                }
            }
            for tool_name in &agent.tools {
                if !self.registry.contains(tool_name) {
                    tracing::warn!(
                        agent = %agent.name,
                        tool = %tool_name,
                        "Agent uses a tool this instance does not host"
                    );
                }
            }
        }

        Ok(())
    }

    // ── Sessions & agents ──────────────────────────────────────────

    pub async fn create_session(&self, metadata: Value) -> Result<Session> {
        self.store.create_session(metadata).await
    }

    /// Create a session inside the caller's transaction
    pub async fn create_session_tx(
        &self,
        conn: &mut PgConnection,
        metadata: Value,
    ) -> Result<Session> {
        self.store.create_session_tx(conn, metadata).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Session> {
        self.store.get_session(session_id).await
    }

    pub async fn update_session_metadata(&self, session_id: Uuid, metadata: Value) -> Result<()> {
        self.store.update_session_metadata(session_id, metadata).await
    }

    pub async fn upsert_agent(&self, spec: &AgentSpec) -> Result<Agent> {
        self.store.upsert_agent(spec).await
    }

    pub async fn get_agent(&self, agent_id: Uuid) -> Result<Agent> {
        self.store.get_agent(agent_id).await
    }

    pub async fn get_agent_by_name(&self, name: &str) -> Result<Agent> {
        self.store.get_agent_by_name(name).await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.store.list_agents().await
    }

    pub async fn get_session_messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
        self.store.get_session_messages(session_id).await
    }

    pub async fn list_runs_for_session(&self, session_id: Uuid) -> Result<Vec<Run>> {
        self.store.list_runs_for_session(session_id).await
    }

    /// Final response text of a run, once it has one
    pub async fn get_run_response_text(&self, run_id: Uuid) -> Result<Option<String>> {
        Ok(self.store.get_run(run_id).await?.response_text)
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.store.list_instances().await
    }

    // ── Run API ────────────────────────────────────────────────────

    /// Create a batch-mode run
    pub async fn run(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        prompt: &str,
        variables: Value,
    ) -> Result<Uuid> {
        let mut new_run = NewRun::new(session_id, agent_id, prompt, RunMode::Batch);
        new_run.variables = variables;
        let run = self.store.create_run(&new_run).await?;
        Ok(run.id)
    }

    /// Create a streaming-mode run
    pub async fn run_fast(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        prompt: &str,
        variables: Value,
    ) -> Result<Uuid> {
        let mut new_run = NewRun::new(session_id, agent_id, prompt, RunMode::Streaming);
        new_run.variables = variables;
        let run = self.store.create_run(&new_run).await?;
        Ok(run.id)
    }

    /// Batch run, waiting for the result
    pub async fn run_sync(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        prompt: &str,
        variables: Value,
    ) -> Result<Run> {
        let run_id = self.run(session_id, agent_id, prompt, variables).await?;
        self.wait_for_run(run_id, None).await
    }

    /// Streaming run, waiting for the result
    pub async fn run_fast_sync(
        &self,
        session_id: Uuid,
        agent_id: Uuid,
        prompt: &str,
        variables: Value,
    ) -> Result<Run> {
        let run_id = self.run_fast(session_id, agent_id, prompt, variables).await?;
        self.wait_for_run(run_id, None).await
    }

    /// Create a batch run inside the caller's transaction. The run becomes
    /// claimable exactly at commit. There is deliberately no `run_sync_tx`:
    /// waiting for visibility inside the same transaction deadlocks.
    pub async fn run_tx(
        &self,
        conn: &mut PgConnection,
        session_id: Uuid,
        agent_id: Uuid,
        prompt: &str,
        variables: Value,
    ) -> Result<Uuid> {
        let mut new_run = NewRun::new(session_id, agent_id, prompt, RunMode::Batch);
        new_run.variables = variables;
        let run = self.store.create_run_tx(conn, &new_run).await?;
        Ok(run.id)
    }

    /// Streaming variant of [`Coordinator::run_tx`]
    pub async fn run_fast_tx(
        &self,
        conn: &mut PgConnection,
        session_id: Uuid,
        agent_id: Uuid,
        prompt: &str,
        variables: Value,
    ) -> Result<Uuid> {
        let mut new_run = NewRun::new(session_id, agent_id, prompt, RunMode::Streaming);
        new_run.variables = variables;
        let run = self.store.create_run_tx(conn, &new_run).await?;
        Ok(run.id)
    }

    /// Resume a run parked in `awaiting_input` with a fresh prompt
    pub async fn continue_run(&self, run_id: Uuid, prompt: &str) -> Result<()> {
        let continued = self.store.continue_run(run_id, prompt).await?;
        if !continued {
            return Err(Error::InvalidInput(format!(
                "run {} is not awaiting input",
                run_id
            )));
        }
        Ok(())
    }

    /// Cancel a non-terminal run
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let cancelled = self.store.cancel_run(run_id).await?;
        if !cancelled {
            return Err(Error::InvalidInput(format!(
                "run {} is already terminal",
                run_id
            )));
        }
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.store.get_run(run_id).await
    }

    /// Block until the run reaches a resting state: terminal, or parked in
    /// `awaiting_input`. Failed runs surface as a structured error; completed,
    /// cancelled, and parked runs come back as the row for inspection.
    ///
    /// Subscribes before reading state (no lost wakeup) and polls as a
    /// defense against dropped notifications.
    pub async fn wait_for_run(&self, run_id: Uuid, timeout: Option<Duration>) -> Result<Run> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            // Re-register each lap: the waiter entry is consumed on delivery.
            let notified = self.waiters.register(run_id);

            let run = match self.store.get_run(run_id).await {
                Ok(run) => run,
                Err(e) => {
                    self.waiters.forget(run_id);
                    return Err(e);
                }
            };

            if run.is_terminal() || run.state == RunState::AwaitingInput {
                self.waiters.forget(run_id);
                return finished_run_result(run);
            }

            let sleep = match deadline {
                Some(deadline) => {
                    if tokio::time::Instant::now() >= deadline {
                        self.waiters.forget(run_id);
                        return Err(Error::WaitTimeout(run_id));
                    }
                    WAIT_POLL_INTERVAL.min(deadline - tokio::time::Instant::now())
                }
                None => WAIT_POLL_INTERVAL,
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// Run a compaction pass against a session right now
    pub async fn compact_session(
        &self,
        session_id: Uuid,
        strategy: CompactionStrategy,
    ) -> Result<Option<CompactionEvent>> {
        let compactor = Compactor::new(
            self.store.clone(),
            self.completion_provider.clone(),
            self.config.compaction.clone(),
        );
        compactor.compact(session_id, strategy).await
    }
}

/// Translate a finished run row into the caller-facing result
fn finished_run_result(run: Run) -> Result<Run> {
    if run.state == RunState::Failed {
        let kind = run
            .error_type
            .unwrap_or(crate::models::RunErrorKind::RescueFailed);
        return Err(Error::Run {
            run_id: run.id,
            session_id: run.session_id,
            kind,
            message: run
                .error_message
                .unwrap_or_else(|| "run failed".to_string()),
        });
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunErrorKind;
    use chrono::Utc;
    use serde_json::json;

    fn terminal_run(state: RunState, kind: Option<RunErrorKind>) -> Run {
        Run {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            parent_run_id: None,
            parent_tool_execution_id: None,
            depth: 0,
            state,
            previous_state: None,
            run_mode: RunMode::Batch,
            prompt: String::new(),
            variables: json!({}),
            response_text: Some("done".to_string()),
            current_iteration: 1,
            current_iteration_id: None,
            iteration_count: 1,
            tool_iterations: 0,
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            error_type: kind,
            error_message: kind.map(|_| "boom".to_string()),
            claimed_by_instance_id: None,
            claimed_at: None,
            rescue_attempts: 0,
            last_rescue_at: None,
            finalized_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_completed_run_returns_row() {
        let run = terminal_run(RunState::Completed, None);
        let result = finished_run_result(run);
        assert_eq!(result.unwrap().response_text.as_deref(), Some("done"));
    }

    #[test]
    fn test_failed_run_returns_structured_error() {
        let run = terminal_run(RunState::Failed, Some(RunErrorKind::BatchError));
        let run_id = run.id;
        match finished_run_result(run) {
            Err(Error::Run {
                run_id: id, kind, ..
            }) => {
                assert_eq!(id, run_id);
                assert_eq!(kind, RunErrorKind::BatchError);
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.id)),
        }
    }

    #[test]
    fn test_cancelled_run_is_not_an_error() {
        let run = terminal_run(RunState::Cancelled, None);
        assert!(finished_run_result(run).is_ok());
    }
}
