//! Container engine abstraction
//!
//! The registry and execution channel only talk to sandboxes through
//! [`ContainerEngine`]. Engines report command output as a stream of
//! [`ExecFrame`]s terminated by `Exited`; a stream that ends without
//! `Exited` means the engine lost the process.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::ResourceLimits;

/// Errors raised by a container engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("sandbox {0} is not running")]
    NotRunning(String),

    #[error("no command is reading stdin in {0}")]
    NoStdin(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What to create
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Container name (unique per user)
    pub name: String,
    /// Image reference
    pub image: String,
    /// Host directory mounted as the sandbox workspace
    pub mount: PathBuf,
    pub limits: ResourceLimits,
}

/// Engine-side identity of a created sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHandle {
    /// Engine identifier (container id for docker)
    pub id: String,
    /// Container name
    pub name: String,
}

/// Whether an existing container is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
}

/// One item of command output
#[derive(Debug, Clone, PartialEq)]
pub enum ExecFrame {
    /// Raw bytes from stdout or stderr
    Output(Bytes),
    /// The command exited; `None` when killed by a signal
    Exited(Option<i32>),
}

/// Merged stdout/stderr of a running command
pub type ExecOutput = Pin<Box<dyn Stream<Item = Result<ExecFrame, EngineError>> + Send>>;

/// Operations the orchestrator needs from a container engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Short name for logs and status
    fn name(&self) -> &'static str;

    /// Find an existing container by name
    async fn lookup(&self, name: &str) -> Result<Option<(EngineHandle, ContainerStatus)>, EngineError>;

    /// Create and start a new sandbox
    async fn create(&self, spec: &SandboxSpec) -> Result<EngineHandle, EngineError>;

    /// Start a stopped sandbox
    async fn start(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    /// Run a shell command; stdin stays open for [`ContainerEngine::write_stdin`]
    async fn exec(&self, handle: &EngineHandle, command: &str) -> Result<ExecOutput, EngineError>;

    /// Write to the stdin of the command currently running in the sandbox
    async fn write_stdin(&self, handle: &EngineHandle, data: &[u8]) -> Result<(), EngineError>;

    /// Send a termination signal to the running command
    async fn signal(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    /// Stop the sandbox
    async fn stop(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    /// Remove the sandbox entirely
    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    /// Whether the sandbox is still running
    async fn is_alive(&self, handle: &EngineHandle) -> bool;
}

/// Turn a spawned child (stdout/stderr piped, stdin already taken) into an
/// [`ExecOutput`]. `on_exit` runs once the child has been reaped.
pub(crate) fn stream_child<F>(mut child: Child, on_exit: F) -> ExecOutput
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_tx = tx.clone();
    let err_tx = tx.clone();
    tokio::spawn(async move {
        let out = async {
            if let Some(stdout) = stdout {
                forward(stdout, &out_tx).await;
            }
        };
        let err = async {
            if let Some(stderr) = stderr {
                forward(stderr, &err_tx).await;
            }
        };
        tokio::join!(out, err);

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to reap exec process");
                None
            }
        };
        on_exit();
        let _ = tx.send(Ok(ExecFrame::Exited(code))).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

async fn forward<R>(mut reader: R, tx: &mpsc::Sender<Result<ExecFrame, EngineError>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let frame = ExecFrame::Output(Bytes::copy_from_slice(&buf[..n]));
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(EngineError::Io(e))).await;
                break;
            }
        }
    }
}

/// Run a short engine command to completion and return trimmed stdout
pub(crate) async fn run_checked(program: &str, args: &[String]) -> Result<String, EngineError> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| EngineError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(EngineError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
