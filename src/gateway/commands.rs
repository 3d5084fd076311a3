//! Structured command handlers
//!
//! Each command maps to one orchestrator call and produces the JSON value
//! carried in the `result` frame.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};

use super::protocol::{Command, Identity};
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::Orchestrator;
use crate::store::file_stem;

/// One entry of a `list-directory` result
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Execute `command` on behalf of `who`
pub async fn execute(orchestrator: &Orchestrator, who: &Identity, command: Command) -> Result<Value> {
    let user = who.user.as_str();
    match command {
        Command::VmExecute { command } => {
            let result = orchestrator.execute(user, &command).await?;
            Ok(to_value(&result))
        }
        Command::VmExecuteStream { command } => {
            orchestrator.execute_streaming(user, &command).await?;
            Ok(json!({ "started": true }))
        }
        Command::VmSendInput { data } => {
            orchestrator.send_input(user, &data).await?;
            Ok(json!({ "sent": true }))
        }
        Command::VmCancel {} => {
            orchestrator.cancel(user)?;
            Ok(json!({ "cancelled": true }))
        }
        Command::VmStatus {} => Ok(to_value(&orchestrator.status(user).await)),
        Command::VmTeardown { remove } => {
            let sandbox = orchestrator.teardown(user, remove).await?;
            Ok(to_value(&sandbox))
        }
        Command::ListDirectory { path } => {
            let root = orchestrator.config().upload_dir.join(file_stem(user));
            let entries = list_directory(&root, path.as_deref().unwrap_or("")).await?;
            Ok(to_value(&entries))
        }
        Command::GetMemory {} => Ok(to_value(&orchestrator.store().get_memory(user).await?)),
        Command::SetMemory {
            key,
            value,
            protected,
        } => {
            if key.trim().is_empty() {
                return Err(OrchestratorError::BadRequest("memory key must not be empty".into()));
            }
            orchestrator
                .store()
                .set_memory(user, &key, &value, protected)
                .await?;
            Ok(to_value(&orchestrator.store().get_memory(user).await?))
        }
        Command::ClearMemory {} => {
            let removed = orchestrator.store().clear_memory(user).await?;
            Ok(json!({ "removed": removed }))
        }
        Command::History { limit } => {
            let mut turns = orchestrator.store().history(user, &who.session).await?;
            if let Some(limit) = limit {
                let skip = turns.len().saturating_sub(limit);
                turns.drain(..skip);
            }
            Ok(to_value(&turns))
        }
        Command::Notify { text } => {
            let notification = orchestrator.notify(user, &text).await?;
            Ok(to_value(&notification))
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Resolve `relative` under `root`, refusing anything that escapes it
fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => {
                return Err(OrchestratorError::BadRequest(format!(
                    "path `{}` is outside the upload directory",
                    relative
                )))
            }
        }
    }
    Ok(path)
}

/// List a directory under the user's upload root (missing root lists empty)
async fn list_directory(root: &Path, relative: &str) -> Result<Vec<DirEntry>> {
    let dir = resolve(root, relative)?;
    let mut reader = match tokio::fs::read_dir(&dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && relative.is_empty() => {
            return Ok(Vec::new())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(OrchestratorError::BadRequest(format!("no such directory: {}", relative)))
        }
        Err(e) => return Err(crate::store::StoreError::from(e).into()),
    };

    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(crate::store::StoreError::from)?
    {
        let metadata = entry.metadata().await.map_err(crate::store::StoreError::from)?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escapes() {
        let root = Path::new("/srv/uploads/alice");
        assert_eq!(resolve(root, "docs/a").unwrap(), root.join("docs/a"));
        assert_eq!(resolve(root, "./x").unwrap(), root.join("x"));
        assert!(resolve(root, "../bob").is_err());
        assert!(resolve(root, "/etc").is_err());
    }

    #[tokio::test]
    async fn test_list_directory_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        let entries = list_directory(dir.path(), "").await.unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "a".into(),
                    is_dir: true,
                    size: entries[0].size,
                },
                DirEntry {
                    name: "b.txt".into(),
                    is_dir: false,
                    size: 5,
                },
            ]
        );

        let missing = dir.path().join("nobody");
        assert!(list_directory(&missing, "").await.unwrap().is_empty());
        assert!(list_directory(dir.path(), "nope").await.is_err());
    }
}
