//! Session management for multi-turn conversations.
//!
//! A session is one independent conversation thread: its message history,
//! its running memory summary and an optional model override.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ChatMessage, Message, MessageId, MessageStatus, ModelConfig, Role};

/// Topic shown until a title has been derived from the first exchange.
pub const DEFAULT_TOPIC: &str = "New Conversation";

/// Prefix of the system message carrying the memory prompt.
const MEMORY_PROMPT_PREFIX: &str = "Summary of the earlier conversation: ";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSession {
    /// Session identifier
    pub id: Uuid,
    /// Human-readable label
    pub topic: String,
    /// Message history
    pub messages: Vec<Message>,
    /// Last mutation timestamp
    pub last_update: DateTime<Utc>,
    /// Messages before this index are folded into `memory_prompt`
    #[serde(default)]
    pub last_summarize_index: usize,
    /// Running summary of the compressed prefix
    #[serde(default)]
    pub memory_prompt: String,
    /// Per-session override of the global model parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ModelConfig>,
    #[serde(default)]
    next_message_id: u64,
}

impl ChatSession {
    /// Create a new empty session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            topic: DEFAULT_TOPIC.to_string(),
            messages: Vec::new(),
            last_update: Utc::now(),
            last_summarize_index: 0,
            memory_prompt: String::new(),
            config: None,
            next_message_id: 0,
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    fn allocate_id(&mut self) -> MessageId {
        // Snapshots written before the counter existed still get fresh ids.
        let floor = self.messages.iter().map(|m| m.id.0 + 1).max().unwrap_or(0);
        let id = self.next_message_id.max(floor);
        self.next_message_id = id + 1;
        MessageId(id)
    }

    /// Append a finalized message.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) -> MessageId {
        let id = self.allocate_id();
        self.messages.push(Message::new(id, role, content));
        self.touch();
        id
    }

    /// Append an empty assistant message in the `Pending` state.
    pub fn add_placeholder(&mut self) -> MessageId {
        let id = self.allocate_id();
        self.messages.push(Message::placeholder(id));
        self.touch();
        id
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }

    #[must_use]
    pub fn position_of(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Messages not yet folded into the memory prompt.
    #[must_use]
    pub fn uncompressed_tail(&self) -> &[Message] {
        let start = self.last_summarize_index.min(self.messages.len());
        &self.messages[start..]
    }

    /// Get message count.
    #[must_use]
    pub const fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Check if session is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the trailing message is still receiving tokens.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.messages.last().is_some_and(Message::is_streaming)
    }

    #[must_use]
    pub fn has_default_topic(&self) -> bool {
        self.topic == DEFAULT_TOPIC
    }

    /// Model parameters for the next request: the session override or the
    /// global configuration.
    #[must_use]
    pub fn effective_config<'a>(&'a self, global: &'a ModelConfig) -> &'a ModelConfig {
        self.config.as_ref().unwrap_or(global)
    }

    /// Build the context for a new turn.
    ///
    /// Messages before `last_summarize_index` are represented only by the
    /// memory prompt, never verbatim.
    #[must_use]
    pub fn effective_context(
        &self,
        system_prompt: Option<&str>,
        send_memory: bool,
    ) -> Vec<ChatMessage> {
        let mut context = Vec::new();

        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            context.push(ChatMessage::system(prompt));
        }

        if send_memory && !self.memory_prompt.is_empty() {
            context.push(ChatMessage::system(format!(
                "{MEMORY_PROMPT_PREFIX}{}",
                self.memory_prompt
            )));
        }

        context.extend(
            self.uncompressed_tail()
                .iter()
                .filter(|m| m.is_contextual())
                .map(Message::to_chat_message),
        );

        context
    }

    /// Finalize messages left open by an interrupted process.
    ///
    /// Returns the number of messages that were closed.
    pub fn close_interrupted(&mut self) -> usize {
        let mut closed = 0;
        for message in &mut self.messages {
            if message.finalize(MessageStatus::Cancelled, None) {
                closed += 1;
            }
        }
        closed
    }

    /// Clamp `last_summarize_index` into `0..=messages.len()`.
    pub fn repair_summarize_index(&mut self) {
        self.last_summarize_index = self.last_summarize_index.min(self.messages.len());
    }

    /// Render the conversation as markdown: user turns become headings,
    /// assistant turns are inlined.
    #[must_use]
    pub fn export_markdown(&self) -> String {
        let body = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                Role::User => format!("## {}", m.content),
                _ => m.content.trim().to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        format!("# {}\n\n{body}", self.topic)
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}
