//! Prompt defaults and size estimation helpers.

use crate::Message;

/// Default system prompt for new conversations.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Provide clear, concise responses.";

/// Rough token estimate for `text`: four characters per token, rounded up.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Estimated token count of a run of messages.
#[must_use]
pub fn estimate_message_tokens<'a>(messages: impl IntoIterator<Item = &'a Message>) -> usize {
    messages
        .into_iter()
        .map(|m| estimate_tokens(&m.content))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageId, Role};

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn estimate_counts_chars_not_bytes() {
        // four multi-byte characters
        assert_eq!(estimate_tokens("你好世界"), 1);
    }

    #[test]
    fn message_estimate_sums_contents() {
        let messages = [
            Message::new(MessageId(0), Role::User, "x".repeat(8)),
            Message::new(MessageId(1), Role::Assistant, "y".repeat(5)),
        ];
        assert_eq!(estimate_message_tokens(&messages), 4);
    }
}
