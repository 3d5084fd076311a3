//! Host-process sandboxes for development and tests
//!
//! Each "container" is a directory; commands run as `sh -c` in their own
//! process group rooted there. No isolation beyond the working directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::debug;

use super::engine::stream_child;
use super::{ContainerEngine, ContainerStatus, EngineError, EngineHandle, ExecOutput, SandboxSpec};

struct LocalSandbox {
    workdir: PathBuf,
    running: bool,
}

struct RunningExec {
    pgid: i32,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
}

/// Engine that runs commands directly on the host
#[derive(Default)]
pub struct LocalEngine {
    sandboxes: Mutex<HashMap<String, LocalSandbox>>,
    running: Arc<Mutex<HashMap<String, RunningExec>>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn kill_group(&self, name: &str, signal: Signal) -> Result<(), EngineError> {
        let pgid = match self.running.lock().get(name) {
            Some(exec) => exec.pgid,
            None => return Ok(()),
        };
        killpg(Pid::from_raw(pgid), signal)
            .map_err(|errno| EngineError::Io(std::io::Error::from(errno)))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn lookup(&self, name: &str) -> Result<Option<(EngineHandle, ContainerStatus)>, EngineError> {
        Ok(self.sandboxes.lock().get(name).map(|sb| {
            let status = if sb.running {
                ContainerStatus::Running
            } else {
                ContainerStatus::Stopped
            };
            (
                EngineHandle {
                    id: name.to_string(),
                    name: name.to_string(),
                },
                status,
            )
        }))
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<EngineHandle, EngineError> {
        tokio::fs::create_dir_all(&spec.mount).await?;
        self.sandboxes.lock().insert(
            spec.name.clone(),
            LocalSandbox {
                workdir: spec.mount.clone(),
                running: true,
            },
        );
        Ok(EngineHandle {
            id: spec.name.clone(),
            name: spec.name.clone(),
        })
    }

    async fn start(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        match self.sandboxes.lock().get_mut(&handle.name) {
            Some(sb) => {
                sb.running = true;
                Ok(())
            }
            None => Err(EngineError::NotRunning(handle.name.clone())),
        }
    }

    async fn exec(&self, handle: &EngineHandle, command: &str) -> Result<ExecOutput, EngineError> {
        let workdir = match self.sandboxes.lock().get(&handle.name) {
            Some(sb) if sb.running => sb.workdir.clone(),
            _ => return Err(EngineError::NotRunning(handle.name.clone())),
        };

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&workdir)
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: "sh".to_string(),
                source,
            })?;

        let pgid = child.id().map(|id| id as i32).unwrap_or_default();
        if let Some(stdin) = child.stdin.take() {
            self.running.lock().insert(
                handle.name.clone(),
                RunningExec {
                    pgid,
                    stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
                },
            );
        }
        debug!(sandbox = %handle.name, pgid, "local exec started");

        let running = Arc::clone(&self.running);
        let name = handle.name.clone();
        Ok(stream_child(child, move || {
            running.lock().remove(&name);
        }))
    }

    async fn write_stdin(&self, handle: &EngineHandle, data: &[u8]) -> Result<(), EngineError> {
        let stdin = self
            .running
            .lock()
            .get(&handle.name)
            .map(|exec| Arc::clone(&exec.stdin))
            .ok_or_else(|| EngineError::NoStdin(handle.name.clone()))?;

        let mut stdin = stdin.lock().await;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn signal(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.kill_group(&handle.name, Signal::SIGTERM)
    }

    async fn stop(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        if let Some(sb) = self.sandboxes.lock().get_mut(&handle.name) {
            sb.running = false;
        }
        self.kill_group(&handle.name, Signal::SIGKILL)
    }

    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.stop(handle).await?;
        let removed = self.sandboxes.lock().remove(&handle.name);
        if let Some(sb) = removed {
            if sb.workdir.exists() {
                tokio::fs::remove_dir_all(&sb.workdir).await?;
            }
        }
        Ok(())
    }

    async fn is_alive(&self, handle: &EngineHandle) -> bool {
        self.sandboxes
            .lock()
            .get(&handle.name)
            .map(|sb| sb.running)
            .unwrap_or(false)
    }
}
