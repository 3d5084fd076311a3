//! Chat agent for conversational sessions
//!
//! # Architecture
//!
//! ```text
//! chat text ─► ChatAgent::turn
//!                 │  history + memory from ConversationStore
//!                 ▼
//!           InferenceService::stream_tokens
//!                 │  each token
//!                 ▼
//!           EventBus (chat fragment, scoped to user+session)
//!                 │  on success
//!                 ▼
//!           ConversationStore::append(user turn, assistant turn)
//! ```

pub mod chat;

pub use chat::{AgentSettings, ChatAgent, DEFAULT_SYSTEM_PROMPT};
