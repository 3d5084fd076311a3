//! ChatAgent - one streamed chat turn per call

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tracing::{info, warn, Instrument};

use crate::error::{ErrorInfo, OrchestratorError, Result};
use crate::events::{Event, EventBus, EventKind, Scope};
use crate::inference::{ChatMessage, ChatRequest, InferenceService, Token};
use crate::metrics::CHAT_TURNS;
use crate::store::{ConversationStore, Role, Turn};

/// Default system prompt for chat sessions
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to a \
persistent Linux shell for this user. Answer concisely. When the user asks for something \
that needs the shell, tell them which command to run with vm-execute.";

/// Opening and closing markers around streamed reasoning
const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Configuration for the chat agent
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Model to use for inference (e.g., "qwen3")
    pub model: String,
    /// System prompt placed before memory and history
    pub system_prompt: String,
    /// Most recent turns of history sent with each request
    pub history_window: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: "qwen3".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_window: 40,
        }
    }
}

/// Streams model replies into a session
pub struct ChatAgent {
    inference: Arc<dyn InferenceService>,
    store: Arc<dyn ConversationStore>,
    bus: EventBus,
    settings: AgentSettings,
}

impl ChatAgent {
    pub fn new(
        inference: Arc<dyn InferenceService>,
        store: Arc<dyn ConversationStore>,
        bus: EventBus,
        settings: AgentSettings,
    ) -> Self {
        Self {
            inference,
            store,
            bus,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Run one chat turn and return the assistant's full reply
    ///
    /// Every token is published as a chat fragment on (user, session) as it
    /// arrives. Reasoning tokens are only forwarded when `think` is set,
    /// wrapped in `<think>` markers. Failures are published as an error
    /// event on the session and nothing is appended to history.
    ///
    /// # Arguments
    /// * `user` - Owner of the session
    /// * `session` - Session whose history and fragments are used
    /// * `text` - The user's message
    /// * `think` - Forward the model's reasoning
    pub async fn turn(&self, user: &str, session: &str, text: &str, think: bool) -> Result<String> {
        let span = tracing::info_span!("chat_turn", user = %user, session = %session);
        let result = self.run_turn(user, session, text, think).instrument(span).await;

        match &result {
            Ok(_) => CHAT_TURNS.with_label_values(&["ok"]).inc(),
            Err(e) => {
                CHAT_TURNS.with_label_values(&["failed"]).inc();
                warn!(user, session, error = %e, "chat turn failed");
                self.bus.publish(Event::new(
                    Scope::session(user, session),
                    EventKind::Error(ErrorInfo::from(e)),
                ));
            }
        }
        result
    }

    async fn run_turn(&self, user: &str, session: &str, text: &str, think: bool) -> Result<String> {
        let start = Instant::now();
        let history = self.store.history(user, session).await?;
        let memory = self.store.get_memory(user).await?;
        let messages = self.build_messages(&memory, &history, text);

        let mut tokens = self
            .inference
            .stream_tokens(ChatRequest {
                model: self.settings.model.clone(),
                messages,
                think,
            })
            .await?;

        let scope = Scope::session(user, session);
        let publish = |fragment: String| {
            self.bus
                .publish(Event::new(scope.clone(), EventKind::ChatFragment(fragment)));
        };

        let mut reply = String::new();
        let mut in_thinking = false;
        while let Some(token) = tokens.next().await {
            match token.map_err(OrchestratorError::from)? {
                Token::Thinking(fragment) => {
                    if !think {
                        continue;
                    }
                    if !in_thinking {
                        in_thinking = true;
                        publish(THINK_OPEN.to_string());
                    }
                    publish(fragment);
                }
                Token::Content(fragment) => {
                    if in_thinking {
                        in_thinking = false;
                        publish(THINK_CLOSE.to_string());
                    }
                    reply.push_str(&fragment);
                    publish(fragment);
                }
            }
        }
        if in_thinking {
            publish(THINK_CLOSE.to_string());
        }

        self.store.append(user, session, Turn::user(text)).await?;
        self.store
            .append(user, session, Turn::assistant(reply.clone()))
            .await?;

        info!(
            chars = reply.len(),
            took_ms = start.elapsed().as_millis() as u64,
            "chat turn complete"
        );
        Ok(reply)
    }

    fn build_messages(
        &self,
        memory: &BTreeMap<String, String>,
        history: &[Turn],
        text: &str,
    ) -> Vec<ChatMessage> {
        let mut system = self.settings.system_prompt.clone();
        if !memory.is_empty() {
            system.push_str("\n\nThings you remember about this user:\n");
            for (key, value) in memory {
                system.push_str(&format!("- {}: {}\n", key, value));
            }
        }

        let mut messages = vec![ChatMessage::system(system)];
        let skip = history.len().saturating_sub(self.settings.history_window);
        for turn in &history[skip..] {
            messages.push(match turn.role {
                Role::User => ChatMessage::user(turn.content.clone()),
                Role::Assistant => ChatMessage::assistant(turn.content.clone()),
                Role::System => ChatMessage::system(turn.content.clone()),
            });
        }
        messages.push(ChatMessage::user(text));
        messages
    }
}
