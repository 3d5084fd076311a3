//! Orchestrator - wires the components together
//!
//! ```text
//!            ┌──────────────── Orchestrator ────────────────┐
//!  gateway ─►│ SandboxRegistry ◄── ExecutionChannel          │
//!            │        │                  │ ExecEvents         │
//!            │        ▼                  ▼                    │
//!            │ ContainerEngine       EventBus ◄── ChatAgent  │
//!            │                           ▲                    │
//!            │                   NotificationQueue            │
//!            └───────────────────────────────────────────────┘
//! ```
//!
//! The gateway talks only to this type. Executions and chat turns started
//! here outlive the connection that requested them.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, Instrument};

use crate::agent::{AgentSettings, ChatAgent};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorInfo, Result};
use crate::events::{Event, EventBus, EventKind, Scope, Subscription};
use crate::exec::channel::{append_tail, mark_truncated};
use crate::exec::{ExecEvent, ExecSettings, ExecState, ExecStream, ExecutionChannel, ExecutionSnapshot};
use crate::inference::InferenceService;
use crate::notify::{Notification, NotificationQueue};
use crate::sandbox::{ContainerEngine, RegistrySettings, RegistryStats, Sandbox, SandboxRegistry};
use crate::store::{ConversationStore, FileStore};

/// Outcome of a non-streaming execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub state: ExecState,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Sandbox and execution view for one user
#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    pub sandbox: Option<Sandbox>,
    pub execution: Option<ExecutionSnapshot>,
}

/// Process-wide status for `/api/status`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub engine: &'static str,
    pub sandboxes: RegistryStats,
    pub subscribers: usize,
    pub users: Vec<Sandbox>,
}

/// The running orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<SandboxRegistry>,
    exec: ExecutionChannel,
    bus: EventBus,
    notifications: NotificationQueue,
    agent: ChatAgent,
    store: Arc<dyn ConversationStore>,
}

impl Orchestrator {
    /// Build the orchestrator around its external collaborators
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<dyn ContainerEngine>,
        inference: Arc<dyn InferenceService>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let registry = Arc::new(SandboxRegistry::new(engine, RegistrySettings::from(&config)));
        let exec = ExecutionChannel::new(Arc::clone(&registry), ExecSettings::from(&config));
        let bus = EventBus::new(config.subscriber_buffer);
        let notifications = NotificationQueue::new(config.notifications_dir(), bus.clone());
        let agent = ChatAgent::new(
            inference,
            Arc::clone(&store),
            bus.clone(),
            AgentSettings {
                model: config.model.clone(),
                ..Default::default()
            },
        );

        Self {
            config,
            registry,
            exec,
            bus,
            notifications,
            agent,
            store,
        }
    }

    /// Like [`Orchestrator::new`] with a [`FileStore`] under the state directory
    pub fn with_file_store(
        config: OrchestratorConfig,
        engine: Arc<dyn ContainerEngine>,
        inference: Arc<dyn InferenceService>,
    ) -> std::io::Result<Self> {
        let store = Arc::new(FileStore::new(config.conversations_dir())?);
        Ok(Self::new(config, engine, inference, store))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn executions(&self) -> &ExecutionChannel {
        &self.exec
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    /// Subscribe (user, session) and flush the user's pending notifications
    pub async fn attach(&self, user: &str, session: &str) -> Subscription {
        let subscription = self.bus.subscribe(user, session);
        if let Err(e) = self.notifications.drain(user).await {
            tracing::warn!(user, error = %e, "failed to drain notifications on attach");
        }
        subscription
    }

    /// Run a command and publish its events to every session of the user
    ///
    /// Returns once the command has started; `Busy` and `SandboxUnavailable`
    /// are reported here rather than as events.
    pub async fn execute_streaming(&self, user: &str, command: &str) -> Result<()> {
        let stream = self.exec.run(user, command).await?;
        let bus = self.bus.clone();
        let user = user.to_string();
        let span = tracing::debug_span!("exec_pump", user = %user);
        tokio::spawn(pump(bus, user, stream).instrument(span));
        Ok(())
    }

    /// Run a command to completion and collect its output
    ///
    /// Stdin requests still go out as events so any attached client can answer.
    pub async fn execute(&self, user: &str, command: &str) -> Result<ExecResult> {
        let mut stream = self.exec.run(user, command).await?;
        let cap = self.config.max_output_bytes;
        let mut output = String::new();
        let mut truncated = false;
        let mut error = None;

        while let Some(event) = stream.next().await {
            match event {
                ExecEvent::Output(text) => truncated |= append_tail(&mut output, &text, cap),
                ExecEvent::StdinRequest(prompt) => {
                    self.bus.publish(Event::new(
                        Scope::User(user.to_string()),
                        EventKind::StdinRequest(prompt),
                    ));
                }
                ExecEvent::Error(info) => error = Some(info),
                ExecEvent::Finished {
                    state,
                    exit_code,
                    duration_ms,
                } => {
                    if truncated {
                        mark_truncated(&mut output);
                    }
                    return Ok(ExecResult {
                        state,
                        exit_code,
                        duration_ms,
                        output,
                        error,
                    })
                }
            }
        }

        // The driver always ends with Finished; a closed stream means it died
        if truncated {
            mark_truncated(&mut output);
        }
        Ok(ExecResult {
            state: ExecState::Failed,
            exit_code: None,
            duration_ms: 0,
            output,
            error,
        })
    }

    pub async fn send_input(&self, user: &str, data: &str) -> Result<()> {
        self.exec.send_input(user, data).await
    }

    pub fn cancel(&self, user: &str) -> Result<()> {
        self.exec.cancel(user)
    }

    /// Stop the sandbox, killing any running command first
    pub async fn teardown(&self, user: &str, remove: bool) -> Result<Sandbox> {
        if self.exec.cancel(user).is_ok() {
            debug!(user, "cancelled running execution before teardown");
        }
        self.registry.teardown(user, remove).await
    }

    pub async fn status(&self, user: &str) -> UserStatus {
        UserStatus {
            sandbox: self.registry.get(user).await,
            execution: self.exec.status(user),
        }
    }

    pub async fn service_status(&self) -> ServiceStatus {
        ServiceStatus {
            engine: self.registry.engine().name(),
            sandboxes: self.registry.stats(),
            subscribers: self.bus.subscriber_count(),
            users: self.registry.snapshot().await,
        }
    }

    /// One chat turn; fragments and failures are published to the session
    pub async fn chat(&self, user: &str, session: &str, text: &str, think: bool) -> Result<String> {
        self.agent.turn(user, session, text, think).await
    }

    pub async fn notify(&self, user: &str, text: &str) -> Result<Notification> {
        Ok(self.notifications.enqueue(user, text).await?)
    }
}

/// Forward execution events to the bus until the execution finishes
async fn pump(bus: EventBus, user: String, mut stream: ExecStream) {
    let scope = Scope::User(user);
    while let Some(event) = stream.next().await {
        let kind = match event {
            ExecEvent::Output(text) => EventKind::ExecOutput(text),
            ExecEvent::StdinRequest(prompt) => EventKind::StdinRequest(prompt),
            ExecEvent::Error(info) => EventKind::Error(info),
            ExecEvent::Finished {
                state,
                exit_code,
                duration_ms,
            } => EventKind::ExecFinished {
                state,
                exit_code,
                duration_ms,
            },
        };
        bus.publish(Event::new(scope.clone(), kind));
    }
}
