//! Command execution inside user sandboxes
//!
//! - `lines` - UTF-8 safe reassembly of engine output
//! - `prompt` - the interactive prompt heuristic
//! - `channel` - the per-user execution channel

pub mod channel;
pub mod lines;
pub mod prompt;

pub use channel::{
    ExecEvent, ExecSettings, ExecState, ExecStream, ExecutionChannel, ExecutionSnapshot,
};
pub use lines::LineBuffer;
pub use prompt::looks_like_prompt;
