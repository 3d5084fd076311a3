//! Shellvisor - per-user sandboxed shells for conversational agents
//!
//! Each user gets a long-lived container. Commands run inside it with their
//! output streamed back over WebSockets, prompts waiting on stdin are
//! detected, and chat turns against a local model share the same
//! connection.
//!
//! # Modules
//!
//! - `sandbox` - container engines and the per-user sandbox registry
//! - `exec` - command execution with stdin-prompt detection
//! - `events` - scoped event bus feeding every attached connection
//! - `notify` - durable per-user notification queue
//! - `store` - conversation history and user memory
//! - `inference` - streaming model client (Ollama)
//! - `agent` - chat turns over history, memory and inference
//! - `gateway` - WebSocket server and command protocol
//! - `metrics` - Prometheus metrics for observability
//!
//! # Quick Start
//!
//! ```ignore
//! use shellvisor::{LocalEngine, OllamaClient, Orchestrator, OrchestratorConfig};
//!
//! let config = OrchestratorConfig::default();
//! let orchestrator = Orchestrator::with_file_store(
//!     config,
//!     Arc::new(LocalEngine::new()),
//!     Arc::new(OllamaClient::new("http://localhost:11434")),
//! )?;
//! let result = orchestrator.execute("alice", "echo hi").await?;
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod exec;
pub mod gateway;
pub mod inference;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod sandbox;
pub mod store;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use config::{EngineKind, OrchestratorConfig};
pub use error::{ErrorInfo, OrchestratorError, Result};
pub use events::{Event, EventBus, EventKind, Scope, Subscription};
pub use exec::{ExecEvent, ExecState, ExecutionChannel};
pub use inference::{InferenceService, OllamaClient};
pub use orchestrator::{ExecResult, Orchestrator};
pub use sandbox::{ContainerEngine, DockerEngine, LocalEngine, SandboxRegistry};
