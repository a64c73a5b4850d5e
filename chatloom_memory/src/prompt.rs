use chatloom_core::{ChatMessage, Message};

/// Build the context for a summarization request.
///
/// # Arguments
/// * `memory_prompt` - Summary produced by the previous compression, may be empty
/// * `prefix` - Messages to fold into the new summary
/// * `max_words` - Word budget for the summary
///
/// # Returns
/// * Messages to send to the transport
#[must_use]
pub fn build_summary_context(
    memory_prompt: &str,
    prefix: &[Message],
    max_words: usize,
) -> Vec<ChatMessage> {
    let mut context = Vec::with_capacity(prefix.len() + 2);

    if !memory_prompt.trim().is_empty() {
        context.push(ChatMessage::system(format!(
            "# Current Summary\n{memory_prompt}"
        )));
    }

    context.extend(
        prefix
            .iter()
            .filter(|m| m.is_contextual())
            .map(Message::to_chat_message),
    );

    context.push(ChatMessage::user(format!(
        r"# Task
Summarize the conversation above so it can stand in for it as context later on.

# Requirements
- Maximum {max_words} words
- Merge the current summary, if one was given, with the new turns
- Keep names, facts and decisions the user may refer back to
- Reply with the summary only"
    )));

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloom_core::{MessageId, Role};

    #[test]
    fn includes_previous_summary_first() {
        let prefix = vec![
            Message::new(MessageId(0), Role::User, "hi"),
            Message::new(MessageId(1), Role::Assistant, "hello"),
        ];
        let context = build_summary_context("user likes tea", &prefix, 100);

        assert_eq!(context.len(), 4);
        assert_eq!(context[0].role, Role::System);
        assert!(context[0].content.contains("user likes tea"));
        assert_eq!(context[1], ChatMessage::user("hi"));
        assert!(context[3].content.contains("Maximum 100 words"));
    }

    #[test]
    fn empty_summary_is_omitted() {
        let prefix = vec![Message::new(MessageId(0), Role::User, "hi")];
        let context = build_summary_context("  ", &prefix, 50);
        assert_eq!(context.len(), 2);
        assert_eq!(context[0], ChatMessage::user("hi"));
    }
}
