//! Deriving a short session title from the first exchange.

use chatloom_core::{ChatMessage, ChatSession, Message, MessageStatus, Role};

const MAX_TOPIC_CHARS: usize = 50;

/// Messages from the start of the session sent along with the instruction.
const TOPIC_CONTEXT_MESSAGES: usize = 4;

const TOPIC_INSTRUCTION: &str = "Summarize the conversation above as a title of 4 to 5 words. \
Reply with the title only, without quotes or trailing punctuation.";

/// Build the title request, or `None` while the session has no completed
/// assistant reply.
#[must_use]
pub fn topic_context(session: &ChatSession) -> Option<Vec<ChatMessage>> {
    let answered = session
        .messages
        .iter()
        .any(|m| m.role == Role::Assistant && m.status == MessageStatus::Complete);
    if !answered {
        return None;
    }

    let mut context: Vec<ChatMessage> = session
        .messages
        .iter()
        .filter(|m| m.status == MessageStatus::Complete)
        .take(TOPIC_CONTEXT_MESSAGES)
        .map(Message::to_chat_message)
        .collect();
    context.push(ChatMessage::user(TOPIC_INSTRUCTION));
    Some(context)
}

/// Normalize a model-produced title. Returns `None` when nothing is left.
#[must_use]
pub fn clean_topic(raw: &str) -> Option<String> {
    const QUOTES: &[char] = &['"', '\'', '`', '“', '”', '‘', '’', '«', '»', '「', '」'];
    const TRAILING: &[char] = &['.', '。', '!', '！', '?', '？', ',', '，', ':', ';'];

    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.strip_prefix("Title:").unwrap_or(line);
    let topic = line
        .trim()
        .trim_matches(QUOTES)
        .trim_end_matches(TRAILING)
        .trim_matches(QUOTES)
        .trim();

    let topic: String = topic.chars().take(MAX_TOPIC_CHARS).collect();
    let topic = topic.trim_end().to_string();
    (!topic.is_empty()).then_some(topic)
}
