//! Orchestrator configuration
//!
//! Built once at startup (see `main.rs`, which maps CLI flags and
//! `SHELLVISOR_*` environment variables onto this struct) and never re-read.

use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::SandboxSize;

/// Which container engine backs the sandboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EngineKind {
    /// `docker` CLI driven containers
    Docker,
    /// Host processes in a per-user directory (development only)
    Local,
}

/// Configuration for the whole orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address the gateway listens on
    pub listen_addr: String,
    /// Default model for chat turns
    pub model: String,
    /// Inference endpoint (Ollama base URL)
    pub inference_url: String,
    /// Directory listed by the `list-directory` command
    pub upload_dir: PathBuf,
    /// Root for notifications, conversations and per-user sandbox mounts
    pub state_dir: PathBuf,
    /// Container image reference
    pub image: String,
    /// Container name template; `{user}` is replaced by the user's sandbox key
    pub name_template: String,
    /// Reuse sandboxes (and their mounted state) across restarts and crashes
    pub persist: bool,
    /// Engine backing the sandboxes
    pub engine: EngineKind,
    /// Resource preset applied to each sandbox
    pub sandbox_size: SandboxSize,
    /// Pause after a prompt-like line before emitting a stdin request
    pub quiescence: Duration,
    /// Kill executions left awaiting input longer than this (None = wait forever)
    pub input_timeout: Option<Duration>,
    /// Bound on sandbox creation
    pub create_timeout: Duration,
    /// Maximum engine create operations running at once
    pub max_concurrent_creates: usize,
    /// Events buffered per subscriber before it is dropped as slow
    pub subscriber_buffer: usize,
    /// Output kept per execution snapshot
    pub max_output_bytes: usize,
    /// Shared secret clients must present as `token` (None = open)
    pub auth_token: Option<String>,
    /// Inbound frames per second allowed per connection (burst = 4x)
    pub frames_per_second: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8765".to_string(),
            model: "qwen3".to_string(),
            inference_url: "http://localhost:11434".to_string(),
            upload_dir: PathBuf::from("./uploads"),
            state_dir: PathBuf::from("./state"),
            image: "ubuntu:24.04".to_string(),
            name_template: "shellvisor-{user}".to_string(),
            persist: true,
            engine: EngineKind::Docker,
            sandbox_size: SandboxSize::Medium,
            quiescence: Duration::from_millis(300),
            input_timeout: None,
            create_timeout: Duration::from_secs(120),
            max_concurrent_creates: 4,
            subscriber_buffer: 256,
            max_output_bytes: 256 * 1024,
            auth_token: None,
            frames_per_second: 20.0,
        }
    }
}

impl OrchestratorConfig {
    /// Directory holding per-user notification queues
    pub fn notifications_dir(&self) -> PathBuf {
        self.state_dir.join("notifications")
    }

    /// Directory holding conversations and memory
    pub fn conversations_dir(&self) -> PathBuf {
        self.state_dir.join("conversations")
    }

    /// Host directory mounted into each user's sandbox
    pub fn mounts_dir(&self) -> PathBuf {
        self.state_dir.join("homes")
    }
}
