//! Sandbox Registry - one long-lived sandbox per user
//!
//! The registry maps users to sandboxes and drives their lifecycle through the
//! container engine. Each user has a slot guarded by its own async lock, so
//! concurrent `ensure` calls for one user converge on a single creation while
//! other users proceed independently.
//!
//! # Lifecycle
//!
//! ```text
//!            ensure()                     exec running
//!  Absent ───────────► Starting ──► Ready ◄──────────► Busy
//!                         ▲           │                  │
//!                         │ ensure()  │ teardown()       │ engine lost it
//!                         │           ▼                  ▼
//!                         └───── Stopped / Crashed ◄─────┘
//! ```
//!
//! Crashed or stopped sandboxes are restarted in place when persistence is
//! enabled, otherwise removed and recreated with an empty workspace.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tracing::{info, warn};

use super::handle::{container_name, sandbox_key, Sandbox, SandboxState};
use super::{ContainerEngine, ContainerStatus, ResourceLimits, SandboxSpec};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::metrics::{SANDBOX_CRASHES, SANDBOX_PROVISIONS, SANDBOX_PROVISION_DURATION};

/// Settings the registry needs from the orchestrator configuration
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub image: String,
    pub name_template: String,
    pub mounts_dir: PathBuf,
    pub persist: bool,
    pub limits: ResourceLimits,
    pub create_timeout: Duration,
    pub max_concurrent_creates: usize,
}

impl From<&OrchestratorConfig> for RegistrySettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            image: config.image.clone(),
            name_template: config.name_template.clone(),
            mounts_dir: config.mounts_dir(),
            persist: config.persist,
            limits: config.sandbox_size.limits(),
            create_timeout: config.create_timeout,
            max_concurrent_creates: config.max_concurrent_creates,
        }
    }
}

/// Statistics about the registry
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub users: usize,
    pub starting: usize,
    pub ready: usize,
    pub busy: usize,
    pub stopped: usize,
    pub crashed: usize,
}

/// Proof that the holder owns the user's single execution slot
///
/// Dropping it releases the slot.
#[derive(Debug)]
pub struct ExecToken {
    user: String,
    _guard: OwnedMutexGuard<()>,
}

impl ExecToken {
    pub fn user(&self) -> &str {
        &self.user
    }
}

struct UserSlot {
    sandbox: AsyncMutex<Sandbox>,
    exec_lock: Arc<AsyncMutex<()>>,
}

/// Tracks and provisions per-user sandboxes
pub struct SandboxRegistry {
    engine: Arc<dyn ContainerEngine>,
    settings: RegistrySettings,
    slots: Mutex<HashMap<String, Arc<UserSlot>>>,
    create_permits: Semaphore,
}

impl SandboxRegistry {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: RegistrySettings) -> Self {
        let permits = settings.max_concurrent_creates.max(1);
        Self {
            engine,
            settings,
            slots: Mutex::new(HashMap::new()),
            create_permits: Semaphore::new(permits),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    fn slot(&self, user: &str) -> Arc<UserSlot> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(user.to_string()).or_insert_with(|| {
            let name = container_name(&self.settings.name_template, user);
            let mount = self.settings.mounts_dir.join(sandbox_key(user));
            Arc::new(UserSlot {
                sandbox: AsyncMutex::new(Sandbox::new(
                    user,
                    name,
                    &self.settings.image,
                    mount,
                    self.settings.persist,
                )),
                exec_lock: Arc::new(AsyncMutex::new(())),
            })
        });
        Arc::clone(slot)
    }

    /// Return a ready sandbox for `user`, creating, adopting or restarting it
    ///
    /// A second caller for the same user waits for the first one's attempt.
    pub async fn ensure(&self, user: &str) -> Result<Sandbox> {
        let slot = self.slot(user);
        let mut sandbox = slot.sandbox.lock().await;

        if sandbox.is_up() {
            if let Some(handle) = &sandbox.handle {
                if self.engine.is_alive(handle).await {
                    return Ok(sandbox.clone());
                }
            }
            warn!(user, sandbox = %sandbox.sandbox_id, "sandbox found dead");
            SANDBOX_CRASHES.inc();
            sandbox.state = SandboxState::Crashed;
        }

        let start = Instant::now();
        let previous = sandbox.state;
        sandbox.state = SandboxState::Starting;

        let result = tokio::time::timeout(
            self.settings.create_timeout,
            self.provision(&mut *sandbox),
        )
        .await;

        SANDBOX_PROVISION_DURATION.observe(start.elapsed().as_secs_f64());

        match result {
            Ok(Ok(outcome)) => {
                SANDBOX_PROVISIONS.with_label_values(&[outcome]).inc();
                info!(
                    user,
                    sandbox = %sandbox.sandbox_id,
                    outcome,
                    generation = sandbox.generation,
                    took_ms = start.elapsed().as_millis() as u64,
                    "sandbox ready"
                );
                Ok(sandbox.clone())
            }
            Ok(Err(e)) => {
                SANDBOX_PROVISIONS.with_label_values(&["failed"]).inc();
                sandbox.state = previous_or_absent(previous);
                warn!(user, error = %e, "sandbox provisioning failed");
                Err(OrchestratorError::SandboxUnavailable {
                    user: user.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                SANDBOX_PROVISIONS.with_label_values(&["timeout"]).inc();
                sandbox.state = previous_or_absent(previous);
                warn!(user, timeout = ?self.settings.create_timeout, "sandbox provisioning timed out");
                Err(OrchestratorError::SandboxUnavailable {
                    user: user.to_string(),
                    reason: format!("creation timed out after {:?}", self.settings.create_timeout),
                })
            }
        }
    }

    /// Bring the sandbox up; returns the metrics outcome label
    async fn provision(
        &self,
        sandbox: &mut Sandbox,
    ) -> std::result::Result<&'static str, super::EngineError> {
        let _permit = self
            .create_permits
            .acquire()
            .await
            .map_err(|e| super::EngineError::Io(std::io::Error::other(e)))?;

        // Known handle from earlier in this process: restart or recreate
        if let Some(handle) = sandbox.handle.clone() {
            if sandbox.persistent {
                if self.engine.is_alive(&handle).await {
                    sandbox.mark_ready(handle);
                    return Ok("restarted");
                }
                if let Some(outcome) = self.restart(sandbox, &handle).await? {
                    return Ok(outcome);
                }
                // Container is gone; recreate it over the same mount
                sandbox.handle = None;
            } else {
                if let Err(e) = self.engine.remove(&handle).await {
                    warn!(sandbox = %handle.name, error = %e, "failed to remove old sandbox");
                }
                sandbox.handle = None;
                self.reset_mount(sandbox).await?;
            }
        } else if let Some((handle, status)) = self.engine.lookup(&sandbox.sandbox_id).await? {
            // First use since startup: adopt what the engine already has
            if sandbox.persistent {
                if status == ContainerStatus::Stopped {
                    self.engine.start(&handle).await?;
                }
                sandbox.mark_ready(handle);
                return Ok("adopted");
            }
            self.engine.remove(&handle).await?;
            self.reset_mount(sandbox).await?;
        }

        tokio::fs::create_dir_all(&sandbox.mount_path).await?;

        let spec = SandboxSpec {
            name: sandbox.sandbox_id.clone(),
            image: sandbox.image.clone(),
            mount: sandbox.mount_path.clone(),
            limits: self.settings.limits.clone(),
        };
        let handle = self.engine.create(&spec).await?;
        sandbox.mark_ready(handle);
        Ok("created")
    }

    /// Start the known container again; `None` when the engine no longer has it
    async fn restart(
        &self,
        sandbox: &mut Sandbox,
        handle: &super::EngineHandle,
    ) -> std::result::Result<Option<&'static str>, super::EngineError> {
        let found = match self.engine.lookup(&handle.name).await? {
            Some((found, _)) => found,
            None => {
                warn!(sandbox = %handle.name, "sandbox removed outside the registry, recreating");
                return Ok(None);
            }
        };

        if let Err(e) = self.engine.start(&found).await {
            warn!(sandbox = %found.name, error = %e, "restart failed, recreating");
            if let Err(e) = self.engine.remove(&found).await {
                warn!(sandbox = %found.name, error = %e, "failed to remove unstartable sandbox");
            }
            return Ok(None);
        }
        sandbox.mark_ready(found);
        Ok(Some("restarted"))
    }

    async fn reset_mount(&self, sandbox: &Sandbox) -> std::io::Result<()> {
        if sandbox.mount_path.exists() {
            tokio::fs::remove_dir_all(&sandbox.mount_path).await?;
        }
        tokio::fs::create_dir_all(&sandbox.mount_path).await
    }

    /// Stop the user's sandbox; `remove` also deletes the container
    pub async fn teardown(&self, user: &str, remove: bool) -> Result<Sandbox> {
        let slot = self.slot(user);
        let mut sandbox = slot.sandbox.lock().await;

        if let Some(handle) = sandbox.handle.clone() {
            if remove {
                self.engine.remove(&handle).await?;
                sandbox.handle = None;
                sandbox.state = SandboxState::Absent;
            } else {
                self.engine.stop(&handle).await?;
                sandbox.state = SandboxState::Stopped;
            }
            info!(user, sandbox = %sandbox.sandbox_id, remove, "sandbox torn down");
        }

        Ok(sandbox.clone())
    }

    /// Take the user's execution slot, failing fast if it is held
    pub fn try_acquire_exec(&self, user: &str) -> Result<ExecToken> {
        let slot = self.slot(user);
        let guard = Arc::clone(&slot.exec_lock)
            .try_lock_owned()
            .map_err(|_| OrchestratorError::Busy {
                user: user.to_string(),
            })?;
        Ok(ExecToken {
            user: user.to_string(),
            _guard: guard,
        })
    }

    pub async fn mark_busy(&self, user: &str) {
        self.transition(user, SandboxState::Ready, SandboxState::Busy).await;
    }

    pub async fn mark_idle(&self, user: &str) {
        self.transition(user, SandboxState::Busy, SandboxState::Ready).await;
    }

    /// Record that the sandbox died while in use
    pub async fn mark_crashed(&self, user: &str) {
        let slot = self.slot(user);
        let mut sandbox = slot.sandbox.lock().await;
        if sandbox.state != SandboxState::Crashed {
            SANDBOX_CRASHES.inc();
            warn!(user, sandbox = %sandbox.sandbox_id, "sandbox crashed");
        }
        sandbox.state = SandboxState::Crashed;
    }

    async fn transition(&self, user: &str, from: SandboxState, to: SandboxState) {
        let slot = self.slot(user);
        let mut sandbox = slot.sandbox.lock().await;
        if sandbox.state == from {
            sandbox.state = to;
        }
    }

    /// Current view of one user's sandbox, if the user is known
    pub async fn get(&self, user: &str) -> Option<Sandbox> {
        let slot = self.slots.lock().get(user).cloned()?;
        let sandbox = slot.sandbox.lock().await;
        Some(sandbox.clone())
    }

    /// Every known sandbox, ordered by user
    pub async fn snapshot(&self) -> Vec<Sandbox> {
        let mut slots: Vec<(String, Arc<UserSlot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(user, slot)| (user.clone(), Arc::clone(slot)))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        let mut sandboxes = Vec::with_capacity(slots.len());
        for (_, slot) in slots {
            sandboxes.push(slot.sandbox.lock().await.clone());
        }
        sandboxes
    }

    /// Count sandboxes by state (a slot being provisioned counts as starting)
    pub fn stats(&self) -> RegistryStats {
        let slots: Vec<Arc<UserSlot>> = self.slots.lock().values().cloned().collect();
        let mut stats = RegistryStats {
            users: slots.len(),
            ..Default::default()
        };
        for slot in slots {
            let state = match slot.sandbox.try_lock() {
                Ok(sandbox) => sandbox.state,
                Err(_) => SandboxState::Starting,
            };
            match state {
                SandboxState::Starting => stats.starting += 1,
                SandboxState::Ready => stats.ready += 1,
                SandboxState::Busy => stats.busy += 1,
                SandboxState::Stopped => stats.stopped += 1,
                SandboxState::Crashed => stats.crashed += 1,
                SandboxState::Absent => {}
            }
        }
        stats
    }
}

fn previous_or_absent(previous: SandboxState) -> SandboxState {
    match previous {
        SandboxState::Stopped | SandboxState::Crashed => previous,
        _ => SandboxState::Absent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LocalEngine;

    fn settings(dir: &std::path::Path, persist: bool) -> RegistrySettings {
        RegistrySettings {
            image: "local".to_string(),
            name_template: "sv-{user}".to_string(),
            mounts_dir: dir.to_path_buf(),
            persist,
            limits: ResourceLimits::small(),
            create_timeout: Duration::from_secs(5),
            max_concurrent_creates: 2,
        }
    }

    #[tokio::test]
    async fn test_ensure_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new(Arc::new(LocalEngine::new()), settings(dir.path(), true));

        let first = registry.ensure("alice").await.unwrap();
        assert_eq!(first.state, SandboxState::Ready);
        assert_eq!(first.sandbox_id, format!("sv-{}", sandbox_key("alice")));
        assert!(first.mount_path.exists());

        let second = registry.ensure("alice").await.unwrap();
        assert_eq!(second.generation, first.generation);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SandboxRegistry::new(
            Arc::new(LocalEngine::new()),
            settings(dir.path(), true),
        ));

        let (a, b) = tokio::join!(registry.ensure("bob"), registry.ensure("bob"));
        assert_eq!(a.unwrap().generation, 1);
        assert_eq!(b.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_case_variant_users_get_distinct_sandboxes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new(Arc::new(LocalEngine::new()), settings(dir.path(), true));

        let upper = registry.ensure("Alice").await.unwrap();
        let lower = registry.ensure("alice").await.unwrap();
        assert_ne!(upper.sandbox_id, lower.sandbox_id);
        assert_ne!(upper.mount_path, lower.mount_path);

        let upper_token = registry.try_acquire_exec("Alice").unwrap();
        let lower_token = registry.try_acquire_exec("alice").unwrap();
        assert_ne!(upper_token.user(), lower_token.user());
    }

    #[tokio::test]
    async fn test_dot_user_stays_inside_mounts_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = dir.path().join("homes");
        let sibling = dir.path().join("notifications");
        std::fs::create_dir_all(&sibling).unwrap();
        std::fs::write(sibling.join("alice.json"), "[]").unwrap();

        let registry = SandboxRegistry::new(Arc::new(LocalEngine::new()), settings(&mounts, false));
        let sandbox = registry.ensure("..").await.unwrap();
        assert_eq!(sandbox.mount_path.parent(), Some(mounts.as_path()));

        // Ephemeral recreate wipes only this user's mount
        registry.mark_crashed("..").await;
        registry.ensure("..").await.unwrap();
        registry.teardown("..", true).await.unwrap();
        assert!(sibling.join("alice.json").exists());
    }

    #[tokio::test]
    async fn test_persistent_sandbox_removed_externally_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new(Arc::new(LocalEngine::new()), settings(dir.path(), true));

        let first = registry.ensure("zoe").await.unwrap();
        registry
            .engine()
            .remove(first.handle.as_ref().unwrap())
            .await
            .unwrap();
        registry.mark_crashed("zoe").await;

        let second = registry.ensure("zoe").await.unwrap();
        assert_eq!(second.state, SandboxState::Ready);
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(second.mount_path, first.mount_path);
        let handle = second.handle.unwrap();
        assert!(registry.engine().is_alive(&handle).await);

        // Same when the registry still believes it is up
        registry.engine().remove(&handle).await.unwrap();
        let third = registry.ensure("zoe").await.unwrap();
        assert_eq!(third.state, SandboxState::Ready);
        assert!(registry.engine().is_alive(third.handle.as_ref().unwrap()).await);
    }

    #[tokio::test]
    async fn test_snapshot_lists_known_users() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new(Arc::new(LocalEngine::new()), settings(dir.path(), true));

        registry.ensure("zed").await.unwrap();
        registry.ensure("amy").await.unwrap();
        let users: Vec<_> = registry.snapshot().await.into_iter().map(|s| s.user).collect();
        assert_eq!(users, vec!["amy", "zed"]);
        assert_eq!(registry.stats().ready, 2);
    }

    #[tokio::test]
    async fn test_exec_token_is_exclusive_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new(Arc::new(LocalEngine::new()), settings(dir.path(), true));

        let token = registry.try_acquire_exec("carol").unwrap();
        assert_eq!(token.user(), "carol");
        assert!(matches!(
            registry.try_acquire_exec("carol"),
            Err(OrchestratorError::Busy { .. })
        ));
        assert!(registry.try_acquire_exec("dave").is_ok());

        drop(token);
        assert!(registry.try_acquire_exec("carol").is_ok());
    }

    #[tokio::test]
    async fn test_crashed_sandbox_recreated_without_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new(Arc::new(LocalEngine::new()), settings(dir.path(), false));

        let sb = registry.ensure("erin").await.unwrap();
        std::fs::write(sb.mount_path.join("scratch.txt"), "x").unwrap();
        registry.mark_crashed("erin").await;

        let fresh = registry.ensure("erin").await.unwrap();
        assert_eq!(fresh.generation, 2);
        assert!(!fresh.mount_path.join("scratch.txt").exists());
    }

    #[tokio::test]
    async fn test_crashed_sandbox_restarted_with_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(LocalEngine::new());
        let registry = SandboxRegistry::new(engine.clone(), settings(dir.path(), true));

        let sb = registry.ensure("frank").await.unwrap();
        std::fs::write(sb.mount_path.join("notes.txt"), "keep").unwrap();
        engine.stop(sb.handle.as_ref().unwrap()).await.unwrap();
        registry.mark_crashed("frank").await;

        let again = registry.ensure("frank").await.unwrap();
        assert_eq!(again.state, SandboxState::Ready);
        assert!(again.mount_path.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_teardown_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new(Arc::new(LocalEngine::new()), settings(dir.path(), true));
        registry.ensure("gina").await.unwrap();
        registry.ensure("hank").await.unwrap();
        registry.mark_busy("hank").await;

        let stopped = registry.teardown("gina", false).await.unwrap();
        assert_eq!(stopped.state, SandboxState::Stopped);

        let stats = registry.stats();
        assert_eq!(stats.users, 2);
        assert_eq!(stats.stopped, 1);
        assert_eq!(stats.busy, 1);

        registry.mark_idle("hank").await;
        assert_eq!(registry.get("hank").await.unwrap().state, SandboxState::Ready);
    }
}
