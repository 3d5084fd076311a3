//! Docker-backed sandboxes
//!
//! Drives the `docker` CLI. Each sandbox is a long-lived container running
//! `sleep infinity`; commands run through `docker exec -i` so their stdin can
//! be fed while they run. The command's shell pid is recorded inside the
//! container so [`ContainerEngine::signal`] can terminate it.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{debug, info};

use super::engine::{run_checked, stream_child};
use super::{
    ContainerEngine, ContainerStatus, EngineError, EngineHandle, ExecOutput, ResourceLimits,
    SandboxSpec,
};

/// Workspace path inside every container
pub const WORKSPACE: &str = "/workspace";

const PID_FILE: &str = "/tmp/.shellvisor-exec.pid";

type ActiveStdin = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<ChildStdin>>>>>;

/// Container engine backed by the docker CLI
pub struct DockerEngine {
    binary: String,
    active: ActiveStdin,
}

impl DockerEngine {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Use another docker-compatible CLI (e.g. `podman`)
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fail early when the engine is unreachable
    pub async fn ping(&self) -> Result<String, EngineError> {
        run_checked(
            &self.binary,
            &args(&["version", "--format", "{{.Server.Version}}"]),
        )
        .await
    }

    fn run_args(spec: &SandboxSpec) -> Vec<String> {
        let mut run = args(&["run", "-d", "--name", &spec.name, "--hostname", &spec.name]);
        run.extend([
            "-v".to_string(),
            format!("{}:{}", spec.mount.display(), WORKSPACE),
            "-w".to_string(),
            WORKSPACE.to_string(),
        ]);
        run.extend(spec.limits.docker_args());
        run.extend(args(&[&spec.image, "sleep", "infinity"]));
        run
    }

    fn exec_args(name: &str, command: &str) -> Vec<String> {
        // The shell leads its own session, so the recorded pid is also the
        // process group of everything the command spawns
        let wrapper = format!("echo $$ > {PID_FILE}; exec sh -c \"$1\"");
        args(&[
            "exec", "-i", "-w", WORKSPACE, name, "setsid", "-w", "sh", "-c", &wrapper, "shellvisor",
            command,
        ])
    }

    fn signal_args(name: &str) -> Vec<String> {
        let kill = format!("kill -TERM -- -$(cat {PID_FILE}) 2>/dev/null; rm -f {PID_FILE}");
        args(&["exec", name, "sh", "-c", &kill])
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn lookup(&self, name: &str) -> Result<Option<(EngineHandle, ContainerStatus)>, EngineError> {
        let inspect = args(&["inspect", "--format", "{{.Id}} {{.State.Running}}", name]);
        let out = match run_checked(&self.binary, &inspect).await {
            Ok(out) => out,
            // inspect exits non-zero for unknown containers
            Err(EngineError::CommandFailed { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut parts = out.split_whitespace();
        let id = parts.next().unwrap_or_default().to_string();
        let status = match parts.next() {
            Some("true") => ContainerStatus::Running,
            _ => ContainerStatus::Stopped,
        };
        Ok(Some((
            EngineHandle {
                id,
                name: name.to_string(),
            },
            status,
        )))
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<EngineHandle, EngineError> {
        let id = run_checked(&self.binary, &Self::run_args(spec)).await?;
        info!(container = %spec.name, image = %spec.image, "container created");
        Ok(EngineHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        run_checked(&self.binary, &args(&["start", &handle.name])).await?;
        Ok(())
    }

    async fn exec(&self, handle: &EngineHandle, command: &str) -> Result<ExecOutput, EngineError> {
        let mut child = Command::new(&self.binary)
            .args(Self::exec_args(&handle.name, command))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.binary.clone(),
                source,
            })?;

        if let Some(stdin) = child.stdin.take() {
            self.active
                .lock()
                .insert(handle.name.clone(), Arc::new(tokio::sync::Mutex::new(stdin)));
        }

        let active = Arc::clone(&self.active);
        let name = handle.name.clone();
        debug!(container = %name, "exec started");
        Ok(stream_child(child, move || {
            active.lock().remove(&name);
        }))
    }

    async fn write_stdin(&self, handle: &EngineHandle, data: &[u8]) -> Result<(), EngineError> {
        let stdin = self
            .active
            .lock()
            .get(&handle.name)
            .cloned()
            .ok_or_else(|| EngineError::NoStdin(handle.name.clone()))?;

        let mut stdin = stdin.lock().await;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn signal(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        run_checked(&self.binary, &Self::signal_args(&handle.name)).await?;
        Ok(())
    }

    async fn stop(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        run_checked(&self.binary, &args(&["stop", "-t", "2", &handle.name])).await?;
        self.active.lock().remove(&handle.name);
        Ok(())
    }

    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        run_checked(&self.binary, &args(&["rm", "-f", &handle.name])).await?;
        self.active.lock().remove(&handle.name);
        Ok(())
    }

    async fn is_alive(&self, handle: &EngineHandle) -> bool {
        matches!(
            self.lookup(&handle.name).await,
            Ok(Some((_, ContainerStatus::Running)))
        )
    }
}
