//! Per-user sandbox management
//!
//! This module provides:
//! - The container engine abstraction and its docker/local implementations
//! - Resource limit presets for sandboxes
//! - The sandbox registry (user -> sandbox lifecycle)

pub mod docker;
pub mod engine;
pub mod handle;
pub mod limits;
pub mod local;
pub mod registry;

pub use docker::DockerEngine;
pub use engine::{
    ContainerEngine, ContainerStatus, EngineError, EngineHandle, ExecFrame, ExecOutput,
    SandboxSpec,
};
pub use handle::{Sandbox, SandboxState};
pub use limits::{ResourceLimits, SandboxSize};
pub use local::LocalEngine;
pub use registry::{ExecToken, RegistrySettings, RegistryStats, SandboxRegistry};
