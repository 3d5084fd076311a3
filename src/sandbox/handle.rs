//! Sandbox - one user's isolated execution environment
//!
//! Tracks a sandbox through its lifecycle:
//! Absent -> Starting -> Ready <-> Busy -> {Stopped, Crashed}

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::EngineHandle;

/// Lifecycle state of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// No container exists (or none known since startup)
    Absent,
    /// Being created or restarted
    Starting,
    /// Up and idle
    Ready,
    /// Up and running an execution
    Busy,
    /// Stopped by teardown
    Stopped,
    /// Died while in use
    Crashed,
}

/// A user's sandbox as seen by the registry
#[derive(Debug, Clone, Serialize)]
pub struct Sandbox {
    /// Owning user
    pub user: String,
    /// Container name derived from the name template
    pub sandbox_id: String,
    /// Image the sandbox runs
    pub image: String,
    /// Host directory mounted as the sandbox workspace
    pub mount_path: PathBuf,
    /// Current lifecycle state
    pub state: SandboxState,
    /// Whether the sandbox survives restarts and crashes
    pub persistent: bool,
    /// Engine identity once created
    #[serde(skip)]
    pub handle: Option<EngineHandle>,
    /// When the current container was created or adopted
    pub created_at: Option<DateTime<Utc>>,
    /// How many times the sandbox has been (re)provisioned
    pub generation: u32,
}

impl Sandbox {
    pub fn new(
        user: impl Into<String>,
        sandbox_id: impl Into<String>,
        image: impl Into<String>,
        mount_path: PathBuf,
        persistent: bool,
    ) -> Self {
        Self {
            user: user.into(),
            sandbox_id: sandbox_id.into(),
            image: image.into(),
            mount_path,
            state: SandboxState::Absent,
            persistent,
            handle: None,
            created_at: None,
            generation: 0,
        }
    }

    /// Whether the registry believes the sandbox is up
    pub fn is_up(&self) -> bool {
        matches!(self.state, SandboxState::Ready | SandboxState::Busy)
    }

    pub(crate) fn mark_ready(&mut self, handle: EngineHandle) {
        self.handle = Some(handle);
        self.state = SandboxState::Ready;
        self.created_at = Some(Utc::now());
        self.generation += 1;
    }
}

/// Longest readable prefix kept in a sandbox key
const KEY_PREFIX_LEN: usize = 24;

/// Map a user id onto a container-name and directory safe key
///
/// The key is a readable prefix followed by a digest of the raw id, so two
/// distinct ids never share a key even when their prefixes collide
/// (`Alice`/`alice`, `a@b`/`a-b`). It never contains `.`, so it can not
/// name a parent directory.
pub fn sandbox_key(user: &str) -> String {
    let prefix: String = user
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            '.' | '@' => Some('-'),
            _ => None,
        })
        .take(KEY_PREFIX_LEN)
        .collect();
    let digest = Sha256::digest(user.as_bytes());
    let hash = hex::encode(&digest[..6]);
    if prefix.is_empty() {
        hash
    } else {
        format!("{}-{}", prefix, hash)
    }
}

/// Expand a name template such as `shellvisor-{user}`
pub fn container_name(template: &str, user: &str) -> String {
    template.replace("{user}", &sandbox_key(user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sandbox_is_absent() {
        let sb = Sandbox::new("alice", "sv-alice", "ubuntu", PathBuf::from("/tmp/a"), true);
        assert_eq!(sb.state, SandboxState::Absent);
        assert!(!sb.is_up());
        assert_eq!(sb.generation, 0);
    }

    #[test]
    fn test_mark_ready_bumps_generation() {
        let mut sb = Sandbox::new("alice", "sv-alice", "ubuntu", PathBuf::from("/tmp/a"), false);
        sb.mark_ready(EngineHandle {
            id: "c1".into(),
            name: "sv-alice".into(),
        });
        assert!(sb.is_up());
        assert_eq!(sb.generation, 1);
        assert!(sb.created_at.is_some());
    }

    #[test]
    fn test_container_name_keeps_readable_prefix() {
        let name = container_name("shellvisor-{user}", "Bob@Example.com");
        assert!(name.starts_with("shellvisor-bob-example-com-"));
        assert_eq!(name.len(), "shellvisor-bob-example-com-".len() + 12);
        assert_eq!(container_name("shellvisor-{user}", "Bob@Example.com"), name);
    }

    #[test]
    fn test_sandbox_key_is_distinct_per_user() {
        assert_ne!(sandbox_key("Alice"), sandbox_key("alice"));
        assert_ne!(sandbox_key("a@b"), sandbox_key("a-b"));
        assert_ne!(sandbox_key("a.b"), sandbox_key("a-b"));
    }

    #[test]
    fn test_sandbox_key_never_names_a_parent() {
        for user in [".", "..", "...", "/", "../etc"] {
            let key = sandbox_key(user);
            assert!(!key.is_empty());
            assert!(!key.contains('.'), "{key}");
            assert!(!key.contains('/'), "{key}");
        }
    }
}
