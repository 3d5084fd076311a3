//! Resource limits applied to each sandbox
//!
//! Container engines enforce these through their own cgroup integration
//! (`docker run --cpus --memory --pids-limit`).

/// Resource limits for a sandbox
///
/// `cpu_cores` may be fractional: 0.5 is half a core, 2.0 two cores.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Number of CPU cores
    pub cpu_cores: f64,
    /// Memory limit in bytes
    pub memory_bytes: u64,
    /// Maximum number of processes inside the sandbox
    pub pids_max: u32,
}

impl ResourceLimits {
    /// 1 core, 1GB RAM
    pub fn small() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_bytes: 1024 * 1024 * 1024,
            pids_max: 256,
        }
    }

    /// 2 cores, 2GB RAM
    pub fn medium() -> Self {
        Self {
            cpu_cores: 2.0,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            pids_max: 512,
        }
    }

    /// 4 cores, 8GB RAM
    pub fn large() -> Self {
        Self {
            cpu_cores: 4.0,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            pids_max: 1024,
        }
    }

    /// Create custom limits
    pub fn custom(cpu_cores: f64, memory_gb: f64, pids_max: u32) -> Self {
        Self {
            cpu_cores,
            memory_bytes: (memory_gb * 1024.0 * 1024.0 * 1024.0) as u64,
            pids_max,
        }
    }

    /// Render as `docker run` arguments
    pub fn docker_args(&self) -> Vec<String> {
        vec![
            "--cpus".to_string(),
            format!("{}", self.cpu_cores),
            "--memory".to_string(),
            format!("{}b", self.memory_bytes),
            "--pids-limit".to_string(),
            self.pids_max.to_string(),
        ]
    }
}

/// Named presets selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SandboxSize {
    Small,
    Medium,
    Large,
}

impl SandboxSize {
    pub fn limits(self) -> ResourceLimits {
        match self {
            SandboxSize::Small => ResourceLimits::small(),
            SandboxSize::Medium => ResourceLimits::medium(),
            SandboxSize::Large => ResourceLimits::large(),
        }
    }
}
