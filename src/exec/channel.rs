//! Execution Channel - one streamed command at a time per user
//!
//! `run` takes the user's exclusion token, makes sure the sandbox is up and
//! starts the command. A driver task then owns the execution until it reaches
//! a terminal state:
//!
//! ```text
//!   engine frames ──► LineBuffer ──► ExecEvent::Output ──► ExecStream
//!                        │
//!                        └─ prompt-like tail + quiet for `quiescence`
//!                              ──► AwaitingInput + ExecEvent::StdinRequest
//!
//!   cancel()/input timeout ──► engine.signal() ──► Killed
//!   stream ends and sandbox is gone ──► Failed + ExecEvent::Error(SandboxLost)
//! ```
//!
//! The driver keeps running when the returned stream is dropped; only
//! `cancel` (or the optional input timeout) stops a command early.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::lines::LineBuffer;
use super::prompt::looks_like_prompt;
use crate::config::OrchestratorConfig;
use crate::error::{ErrorInfo, OrchestratorError, Result};
use crate::metrics::{EXECUTIONS, EXECUTIONS_REJECTED, EXECUTION_DURATION, STDIN_REQUESTS};
use crate::sandbox::{EngineHandle, ExecFrame, ExecOutput, ExecToken, SandboxRegistry};

const TRUNCATION_MARKER: &str = "[... output truncated ...]\n";

/// Execution lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    Queued,
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Killed,
}

impl ExecState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecState::Completed | ExecState::Failed | ExecState::Killed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecState::Queued => "queued",
            ExecState::Running => "running",
            ExecState::AwaitingInput => "awaiting_input",
            ExecState::Completed => "completed",
            ExecState::Failed => "failed",
            ExecState::Killed => "killed",
        }
    }
}

/// Items yielded by an [`ExecStream`]
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    /// Merged stdout/stderr text
    Output(String),
    /// The command appears to be waiting on this prompt
    StdinRequest(String),
    /// The execution could not finish normally
    Error(ErrorInfo),
    /// Terminal event, always last
    Finished {
        state: ExecState,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
}

/// Events of one execution, in the order they happened
pub type ExecStream = ReceiverStream<ExecEvent>;

/// Read-only view of an execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSnapshot {
    pub id: String,
    pub user: String,
    pub command: String,
    pub state: ExecState,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    /// Pending prompt while awaiting input
    pub prompt: Option<String>,
    /// Accumulated output (tail only when truncated)
    pub output: String,
    pub truncated: bool,
}

/// Tunables for the channel
#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub quiescence: Duration,
    pub input_timeout: Option<Duration>,
    pub max_output_bytes: usize,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for ExecSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            quiescence: config.quiescence,
            input_timeout: config.input_timeout,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

struct Execution {
    snapshot: Mutex<ExecutionSnapshot>,
    handle: Mutex<Option<EngineHandle>>,
    cancel: CancellationToken,
    started: Instant,
}

impl Execution {
    fn state(&self) -> ExecState {
        self.snapshot.lock().state
    }

    fn set_state(&self, state: ExecState) {
        self.snapshot.lock().state = state;
    }

    /// Move to a terminal state; returns the duration in milliseconds
    fn finish(&self, state: ExecState, exit_code: Option<i32>) -> u64 {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let mut snap = self.snapshot.lock();
        snap.state = state;
        snap.exit_code = exit_code;
        snap.duration_ms = Some(duration_ms);
        snap.prompt = None;
        duration_ms
    }

    fn append_output(&self, text: &str, cap: usize) {
        let mut snap = self.snapshot.lock();
        if append_tail(&mut snap.output, text, cap) {
            snap.truncated = true;
        }
    }
}

/// Append `text` keeping at most the last `cap` bytes; true if anything was dropped
pub(crate) fn append_tail(output: &mut String, text: &str, cap: usize) -> bool {
    output.push_str(text);
    if output.len() <= cap {
        return false;
    }
    let mut cut = output.len() - cap;
    while !output.is_char_boundary(cut) {
        cut += 1;
    }
    output.drain(..cut);
    true
}

/// Prefix kept output with the truncation marker
pub(crate) fn mark_truncated(output: &mut String) {
    output.insert_str(0, TRUNCATION_MARKER);
}

/// Runs commands inside user sandboxes
pub struct ExecutionChannel {
    registry: Arc<SandboxRegistry>,
    settings: ExecSettings,
    executions: Mutex<HashMap<String, Arc<Execution>>>,
}

impl ExecutionChannel {
    pub fn new(registry: Arc<SandboxRegistry>, settings: ExecSettings) -> Self {
        Self {
            registry,
            settings,
            executions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    /// Start `command` in the user's sandbox
    ///
    /// Fails with `Busy` while another execution for the user is not yet
    /// terminal, and with `SandboxUnavailable` when the sandbox cannot be
    /// brought up.
    pub async fn run(&self, user: &str, command: &str) -> Result<ExecStream> {
        let token = match self.registry.try_acquire_exec(user) {
            Ok(token) => token,
            Err(e) => {
                EXECUTIONS_REJECTED.inc();
                return Err(e);
            }
        };

        let execution = Arc::new(Execution {
            snapshot: Mutex::new(ExecutionSnapshot {
                id: Uuid::now_v7().to_string(),
                user: user.to_string(),
                command: command.to_string(),
                state: ExecState::Queued,
                exit_code: None,
                started_at: Utc::now(),
                duration_ms: None,
                prompt: None,
                output: String::new(),
                truncated: false,
            }),
            handle: Mutex::new(None),
            cancel: CancellationToken::new(),
            started: Instant::now(),
        });
        self.executions
            .lock()
            .insert(user.to_string(), Arc::clone(&execution));

        let output = match self.start(user, command, &execution).await {
            Ok(output) => output,
            Err(e) => {
                execution.finish(ExecState::Failed, None);
                record_terminal(ExecState::Failed, execution.started.elapsed());
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(256);
        let driver = Driver {
            registry: Arc::clone(&self.registry),
            settings: self.settings.clone(),
            execution,
            tx,
        };
        let span = tracing::info_span!("exec", user = %user);
        tokio::spawn(driver.drive(output, token).instrument(span));

        Ok(ReceiverStream::new(rx))
    }

    async fn start(&self, user: &str, command: &str, execution: &Execution) -> Result<ExecOutput> {
        let sandbox = self.registry.ensure(user).await?;
        let handle = sandbox
            .handle
            .ok_or_else(|| OrchestratorError::SandboxUnavailable {
                user: user.to_string(),
                reason: "sandbox has no engine handle".to_string(),
            })?;

        self.registry.mark_busy(user).await;
        match self.registry.engine().exec(&handle, command).await {
            Ok(output) => {
                info!(user, sandbox = %handle.name, command, "execution started");
                *execution.handle.lock() = Some(handle);
                execution.set_state(ExecState::Running);
                Ok(output)
            }
            Err(e) => {
                self.registry.mark_idle(user).await;
                Err(e.into())
            }
        }
    }

    fn active(&self, user: &str) -> Result<Arc<Execution>> {
        self.executions
            .lock()
            .get(user)
            .filter(|exec| !exec.state().is_terminal())
            .cloned()
            .ok_or_else(|| OrchestratorError::NoActiveExecution {
                user: user.to_string(),
            })
    }

    /// Forward `data` to the running command's stdin (newline appended)
    pub async fn send_input(&self, user: &str, data: &str) -> Result<()> {
        let execution = self.active(user)?;
        if !matches!(
            execution.state(),
            ExecState::Running | ExecState::AwaitingInput
        ) {
            return Err(OrchestratorError::NoActiveExecution {
                user: user.to_string(),
            });
        }
        let handle = execution
            .handle
            .lock()
            .clone()
            .ok_or_else(|| OrchestratorError::NoActiveExecution {
                user: user.to_string(),
            })?;

        let mut line = data.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.registry
            .engine()
            .write_stdin(&handle, line.as_bytes())
            .await?;

        let mut snap = execution.snapshot.lock();
        if snap.state == ExecState::AwaitingInput {
            snap.state = ExecState::Running;
            snap.prompt = None;
        }
        debug!(user, bytes = line.len(), "stdin forwarded");
        Ok(())
    }

    /// Terminate the user's execution; it ends as `Killed`
    pub fn cancel(&self, user: &str) -> Result<()> {
        let execution = self.active(user)?;
        info!(user, "execution cancel requested");
        execution.cancel.cancel();
        Ok(())
    }

    /// Current or most recent execution for the user
    pub fn status(&self, user: &str) -> Option<ExecutionSnapshot> {
        let execution = self.executions.lock().get(user).cloned()?;
        let mut snap = execution.snapshot.lock().clone();
        if snap.truncated {
            mark_truncated(&mut snap.output);
        }
        if snap.duration_ms.is_none() {
            snap.duration_ms = Some(execution.started.elapsed().as_millis() as u64);
        }
        Some(snap)
    }
}

fn record_terminal(state: ExecState, took: Duration) {
    EXECUTIONS.with_label_values(&[state.as_str()]).inc();
    EXECUTION_DURATION
        .with_label_values(&[state.as_str()])
        .observe(took.as_secs_f64());
}

/// How the frame loop ended
enum Ending {
    Exited(Option<i32>),
    StreamClosed,
}

struct Driver {
    registry: Arc<SandboxRegistry>,
    settings: ExecSettings,
    execution: Arc<Execution>,
    tx: mpsc::Sender<ExecEvent>,
}

impl Driver {
    async fn emit(&self, event: ExecEvent) {
        // A dropped stream must not stop the command
        let _ = self.tx.send(event).await;
    }

    async fn drive(self, mut output: ExecOutput, token: ExecToken) {
        let user = token.user().to_string();
        let handle = self.execution.handle.lock().clone();
        let engine = Arc::clone(self.registry.engine());

        let mut lines = LineBuffer::new();
        let mut prompt_at: Option<Instant> = None;
        let mut input_deadline: Option<Instant> = None;
        let mut killed = false;
        let mut signalled = false;

        let ending = loop {
            tokio::select! {
                _ = self.execution.cancel.cancelled(), if !signalled => {
                    signalled = true;
                    killed = true;
                    if let Some(handle) = &handle {
                        if let Err(e) = engine.signal(handle).await {
                            warn!(error = %e, "failed to signal execution");
                        }
                    }
                }
                frame = output.next() => match frame {
                    Some(Ok(ExecFrame::Output(bytes))) => {
                        let text = lines.push(&bytes);
                        if text.is_empty() {
                            continue;
                        }
                        self.execution.append_output(&text, self.settings.max_output_bytes);
                        {
                            let mut snap = self.execution.snapshot.lock();
                            if snap.state == ExecState::AwaitingInput {
                                snap.state = ExecState::Running;
                                snap.prompt = None;
                            }
                        }
                        input_deadline = None;
                        prompt_at = match lines.prompt_candidate() {
                            Some(line) if looks_like_prompt(line) => {
                                Some(Instant::now() + self.settings.quiescence)
                            }
                            _ => None,
                        };
                        self.emit(ExecEvent::Output(text)).await;
                    }
                    Some(Ok(ExecFrame::Exited(code))) => break Ending::Exited(code),
                    Some(Err(e)) => warn!(error = %e, "engine output error"),
                    None => break Ending::StreamClosed,
                },
                _ = wait_until(prompt_at) => {
                    prompt_at = None;
                    let prompt = lines
                        .prompt_candidate()
                        .map(|line| line.trim_end().to_string())
                        .unwrap_or_default();
                    let raised = {
                        let mut snap = self.execution.snapshot.lock();
                        if snap.state == ExecState::Running {
                            snap.state = ExecState::AwaitingInput;
                            snap.prompt = Some(prompt.clone());
                            true
                        } else {
                            false
                        }
                    };
                    if raised {
                        STDIN_REQUESTS.inc();
                        debug!(prompt = %prompt, "awaiting input");
                        input_deadline = self.settings.input_timeout.map(|t| Instant::now() + t);
                        self.emit(ExecEvent::StdinRequest(prompt)).await;
                    }
                }
                _ = wait_until(input_deadline) => {
                    input_deadline = None;
                    if self.execution.state() == ExecState::AwaitingInput && !signalled {
                        warn!(timeout = ?self.settings.input_timeout, "input timeout, killing execution");
                        signalled = true;
                        killed = true;
                        if let Some(handle) = &handle {
                            if let Err(e) = engine.signal(handle).await {
                                warn!(error = %e, "failed to signal execution");
                            }
                        }
                    }
                }
            }
        };

        let tail = lines.finish();
        if !tail.is_empty() {
            self.execution.append_output(&tail, self.settings.max_output_bytes);
            self.emit(ExecEvent::Output(tail)).await;
        }

        let exit_code = match ending {
            Ending::Exited(code) => code,
            Ending::StreamClosed => None,
        };
        let alive = match &handle {
            Some(handle) => engine.is_alive(handle).await,
            None => false,
        };

        let state = if !alive {
            ExecState::Failed
        } else if killed {
            ExecState::Killed
        } else if matches!(ending, Ending::StreamClosed) {
            ExecState::Failed
        } else {
            ExecState::Completed
        };

        let duration_ms = self.execution.finish(state, exit_code);
        record_terminal(state, self.execution.started.elapsed());

        let lost = if !alive {
            self.registry.mark_crashed(&user).await;
            Some(OrchestratorError::SandboxLost {
                user: user.clone(),
                reason: "sandbox stopped during execution".to_string(),
            })
        } else {
            self.registry.mark_idle(&user).await;
            if matches!(ending, Ending::StreamClosed) && !killed {
                Some(OrchestratorError::SandboxLost {
                    user: user.clone(),
                    reason: "engine closed the output stream without an exit status".to_string(),
                })
            } else {
                None
            }
        };

        info!(
            state = state.as_str(),
            exit_code = ?exit_code,
            duration_ms,
            "execution finished"
        );
        drop(token);

        if let Some(err) = lost {
            warn!(error = %err, "execution failed");
            self.emit(ExecEvent::Error(ErrorInfo::from(&err))).await;
        }
        self.emit(ExecEvent::Finished {
            state,
            exit_code,
            duration_ms,
        })
        .await;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{LocalEngine, RegistrySettings, ResourceLimits, SandboxState};

    fn channel(dir: &std::path::Path, settings: ExecSettings) -> ExecutionChannel {
        let registry = SandboxRegistry::new(
            Arc::new(LocalEngine::new()),
            RegistrySettings {
                image: "local".to_string(),
                name_template: "sv-{user}".to_string(),
                mounts_dir: dir.to_path_buf(),
                persist: true,
                limits: ResourceLimits::small(),
                create_timeout: Duration::from_secs(5),
                max_concurrent_creates: 2,
            },
        );
        ExecutionChannel::new(Arc::new(registry), settings)
    }

    fn quick() -> ExecSettings {
        ExecSettings {
            quiescence: Duration::from_millis(200),
            input_timeout: None,
            max_output_bytes: 1024,
        }
    }

    async fn collect(mut stream: ExecStream) -> Vec<ExecEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    fn output_of(events: &[ExecEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Output(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_run_streams_output_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), quick());

        let events = collect(channel.run("alice", "echo hello; exit 4").await.unwrap()).await;
        assert_eq!(output_of(&events), "hello\n");
        match events.last().unwrap() {
            ExecEvent::Finished { state, exit_code, .. } => {
                assert_eq!(*state, ExecState::Completed);
                assert_eq!(*exit_code, Some(4));
            }
            other => panic!("unexpected last event: {other:?}"),
        }

        let snap = channel.status("alice").unwrap();
        assert_eq!(snap.state, ExecState::Completed);
        assert_eq!(snap.output, "hello\n");
        assert_eq!(
            channel.registry().get("alice").await.unwrap().state,
            SandboxState::Ready
        );
    }

    #[tokio::test]
    async fn test_second_run_is_busy_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), quick());

        let stream = channel.run("bob", "sleep 30").await.unwrap();
        assert!(matches!(
            channel.run("bob", "echo nope").await,
            Err(OrchestratorError::Busy { .. })
        ));

        channel.cancel("bob").unwrap();
        let events = collect(stream).await;
        assert!(matches!(
            events.last(),
            Some(ExecEvent::Finished { state: ExecState::Killed, .. })
        ));

        let events = collect(channel.run("bob", "echo again").await.unwrap()).await;
        assert_eq!(output_of(&events), "again\n");
    }

    #[tokio::test]
    async fn test_prompt_yields_one_stdin_request_and_accepts_input() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), quick());

        let mut stream = channel
            .run("carol", "printf 'Your name: '; read name; echo \"hi $name\"")
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            if let ExecEvent::StdinRequest(prompt) = &event {
                assert_eq!(prompt, "Your name:");
                assert_eq!(
                    channel.status("carol").unwrap().state,
                    ExecState::AwaitingInput
                );
                channel.send_input("carol", "dora").await.unwrap();
            }
            events.push(event);
        }

        let requests = events
            .iter()
            .filter(|e| matches!(e, ExecEvent::StdinRequest(_)))
            .count();
        assert_eq!(requests, 1);
        assert!(output_of(&events).ends_with("hi dora\n"));
    }

    #[tokio::test]
    async fn test_output_within_window_suppresses_request() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), quick());

        let events = collect(
            channel
                .run("dan", "printf 'Loading: '; sleep 0.05; echo done")
                .await
                .unwrap(),
        )
        .await;
        assert!(!events.iter().any(|e| matches!(e, ExecEvent::StdinRequest(_))));
        assert_eq!(output_of(&events), "Loading: done\n");
    }

    #[tokio::test]
    async fn test_input_timeout_kills_execution() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(
            dir.path(),
            ExecSettings {
                input_timeout: Some(Duration::from_millis(200)),
                ..quick()
            },
        );

        let events = collect(channel.run("erin", "printf 'Password: '; read pw").await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(e, ExecEvent::StdinRequest(_))));
        assert!(matches!(
            events.last(),
            Some(ExecEvent::Finished { state: ExecState::Killed, .. })
        ));
    }

    #[tokio::test]
    async fn test_sandbox_stop_fails_execution_with_one_error() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), quick());

        let stream = channel.run("fay", "sleep 30").await.unwrap();
        let handle = channel.registry().get("fay").await.unwrap().handle.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.registry().engine().stop(&handle).await.unwrap();

        let events = collect(stream).await;
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Error(info) => Some(info.kind.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["sandbox_lost"]);
        assert!(matches!(
            events.last(),
            Some(ExecEvent::Finished { state: ExecState::Failed, .. })
        ));
        assert_eq!(
            channel.registry().get("fay").await.unwrap().state,
            SandboxState::Crashed
        );

        // Persistent sandbox is restarted on the next command
        let events = collect(channel.run("fay", "echo back").await.unwrap()).await;
        assert_eq!(output_of(&events), "back\n");
    }

    #[tokio::test]
    async fn test_input_and_cancel_without_execution() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), quick());

        assert!(matches!(
            channel.send_input("gil", "y").await,
            Err(OrchestratorError::NoActiveExecution { .. })
        ));
        assert!(matches!(
            channel.cancel("gil"),
            Err(OrchestratorError::NoActiveExecution { .. })
        ));
        assert!(channel.status("gil").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_keeps_output_tail() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(
            dir.path(),
            ExecSettings {
                max_output_bytes: 16,
                ..quick()
            },
        );

        collect(channel.run("hal", "seq 1 100").await.unwrap()).await;
        let snap = channel.status("hal").unwrap();
        assert!(snap.truncated);
        assert!(snap.output.starts_with(TRUNCATION_MARKER));
        assert!(snap.output.ends_with("100\n"));
    }

    #[test]
    fn test_append_tail_respects_char_boundaries() {
        let mut output = String::new();
        assert!(!append_tail(&mut output, "ab", 4));
        assert!(append_tail(&mut output, "cdé", 4));
        assert!(output.len() <= 4);
        assert!(output.ends_with('é'));
    }
}
