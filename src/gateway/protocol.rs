//! Wire protocol
//!
//! Inbound text frames are either a chat message (any text) or a structured
//! command: `{"command": "<name>", "args": {...}}`.
//!
//! Outbound text frames:
//!
//! | event            | frame                                                   |
//! |------------------|---------------------------------------------------------|
//! | chat fragment    | raw text                                                |
//! | exec output      | raw text                                                |
//! | notification     | `[notification] <text>`                                 |
//! | stdin request    | `{"stdin_request": "<prompt>"}`                         |
//! | exec finished    | `{"exec_finished": {"state", "exit_code", "duration_ms"}}` |
//! | command result   | `{"command": "<name>", "result": <value>}`              |
//! | error            | `{"error": {"kind", "message"}}`                        |

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ErrorInfo, OrchestratorError};
use crate::events::EventKind;

/// Longest accepted user or session id
pub const MAX_ID_LEN: usize = 64;

/// A structured command
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "kebab-case")]
pub enum Command {
    /// Run and reply with the collected output
    VmExecute { command: String },
    /// Run and stream output through the subscription
    VmExecuteStream { command: String },
    VmSendInput { data: String },
    VmCancel {},
    VmStatus {},
    VmTeardown {
        #[serde(default)]
        remove: bool,
    },
    ListDirectory {
        #[serde(default)]
        path: Option<String>,
    },
    GetMemory {},
    SetMemory {
        key: String,
        value: String,
        #[serde(default)]
        protected: bool,
    },
    ClearMemory {},
    History {
        #[serde(default)]
        limit: Option<usize>,
    },
    Notify { text: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::VmExecute { .. } => "vm-execute",
            Command::VmExecuteStream { .. } => "vm-execute-stream",
            Command::VmSendInput { .. } => "vm-send-input",
            Command::VmCancel {} => "vm-cancel",
            Command::VmStatus {} => "vm-status",
            Command::VmTeardown { .. } => "vm-teardown",
            Command::ListDirectory { .. } => "list-directory",
            Command::GetMemory {} => "get-memory",
            Command::SetMemory { .. } => "set-memory",
            Command::ClearMemory {} => "clear-memory",
            Command::History { .. } => "history",
            Command::Notify { .. } => "notify",
        }
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Chat(String),
    Command(Command),
}

/// Decode a text frame
///
/// Only a JSON object with a string `command` field is treated as a command;
/// everything else is chat. Unknown commands and malformed args are
/// `BadRequest`.
pub fn parse_frame(text: &str) -> Result<Inbound, OrchestratorError> {
    if !text.trim_start().starts_with('{') {
        return Ok(Inbound::Chat(text.to_string()));
    }
    let mut object = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => object,
        _ => return Ok(Inbound::Chat(text.to_string())),
    };
    let name = match object.get("command") {
        Some(Value::String(name)) => name.clone(),
        Some(_) => return Err(OrchestratorError::BadRequest("`command` must be a string".into())),
        None => return Ok(Inbound::Chat(text.to_string())),
    };

    // Commands without arguments may omit `args`
    if matches!(object.get("args"), None | Some(Value::Null)) {
        object.insert("args".to_string(), json!({}));
    }

    serde_json::from_value(Value::Object(object))
        .map(Inbound::Command)
        .map_err(|e| OrchestratorError::BadRequest(format!("{}: {}", name, e)))
}

/// Render a bus event as an outbound text frame
pub fn event_frame(kind: &EventKind) -> String {
    match kind {
        EventKind::ChatFragment(text) | EventKind::ExecOutput(text) => text.clone(),
        EventKind::Notification { text, .. } => format!("[notification] {}", text),
        EventKind::StdinRequest(prompt) => json!({ "stdin_request": prompt }).to_string(),
        EventKind::Error(info) => error_frame(info),
        EventKind::ExecFinished {
            state,
            exit_code,
            duration_ms,
        } => json!({
            "exec_finished": {
                "state": state,
                "exit_code": exit_code,
                "duration_ms": duration_ms,
            }
        })
        .to_string(),
    }
}

pub fn result_frame(command: &str, result: Value) -> String {
    json!({ "command": command, "result": result }).to_string()
}

pub fn error_frame(info: &ErrorInfo) -> String {
    json!({ "error": { "kind": info.kind, "message": info.message } }).to_string()
}

/// Whether `id` is acceptable as a user or session id
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.chars().all(|c| c == '.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-'))
}

/// Query parameters of `GET /ws`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    pub user: Option<String>,
    pub session: Option<String>,
    pub think: Option<String>,
    pub token: Option<String>,
}

/// Authenticated identity of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub session: String,
    pub think: bool,
}

impl ConnectParams {
    /// Check ids and, when the server has one, the shared token
    pub fn authenticate(&self, auth_token: Option<&str>) -> Result<Identity, OrchestratorError> {
        let user = self.user.as_deref().unwrap_or_default();
        let session = self.session.as_deref().unwrap_or_default();
        if !valid_id(user) {
            return Err(OrchestratorError::Unauthorized("missing or invalid user".into()));
        }
        if !valid_id(session) {
            return Err(OrchestratorError::Unauthorized("missing or invalid session".into()));
        }
        if let Some(expected) = auth_token {
            if self.token.as_deref() != Some(expected) {
                return Err(OrchestratorError::Unauthorized("bad token".into()));
            }
        }

        let think = matches!(
            self.think.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("1" | "true" | "yes" | "on")
        );
        Ok(Identity {
            user: user.to_string(),
            session: session.to_string(),
            think,
        })
    }
}
