//! Messages and the per-message streaming state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChatMessage, Role};

/// Identifier of a message, unique within its session and never reused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a message.
///
/// `Pending -> Streaming -> {Complete | Error | Cancelled}`. User and system
/// messages are created `Complete`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl MessageStatus {
    /// True between placeholder creation and the terminal event.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Pending | Self::Streaming)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_streaming()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub date: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    /// A finalized message, as created for user input.
    #[must_use]
    pub fn new(id: MessageId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            date: Utc::now(),
            status: MessageStatus::Complete,
        }
    }

    /// An empty assistant message waiting for its stream to open.
    #[must_use]
    pub fn placeholder(id: MessageId) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: String::new(),
            date: Utc::now(),
            status: MessageStatus::Pending,
        }
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.status.is_streaming()
    }

    /// Marks the stream as open. Only valid from `Pending`.
    pub fn open(&mut self) -> bool {
        if self.status == MessageStatus::Pending {
            self.status = MessageStatus::Streaming;
            true
        } else {
            false
        }
    }

    /// Appends a streamed chunk. Ignored once the message is terminal.
    pub fn append(&mut self, delta: &str) -> bool {
        if !self.is_streaming() {
            return false;
        }
        self.status = MessageStatus::Streaming;
        self.content.push_str(delta);
        true
    }

    /// Moves the message into a terminal state.
    ///
    /// Returns `false` and leaves the message untouched when it already
    /// reached a terminal state; the first terminal event wins.
    pub fn finalize(&mut self, status: MessageStatus, content: Option<String>) -> bool {
        if !self.is_streaming() || status.is_streaming() {
            return false;
        }
        if let Some(content) = content {
            self.content = content;
        }
        self.status = status;
        true
    }

    /// Whether this message belongs in the context sent to the model.
    #[must_use]
    pub const fn is_contextual(&self) -> bool {
        matches!(
            self.status,
            MessageStatus::Complete | MessageStatus::Cancelled
        )
    }

    #[must_use]
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}
