use chatloom_config::Config;
use chatloom_session::{JsonFileStore, SnapshotStore};
use tracing::info;

/// Strategy for displaying configuration information.
///
/// Prints the provider (with the API key masked), model defaults, memory
/// settings and a summary of the persisted sessions.
#[derive(Debug, Clone, Copy)]
pub struct InfoStrategy;

impl super::CommandStrategy for InfoStrategy {
    type Input = ();

    async fn execute(&self, _input: Self::Input) -> anyhow::Result<()> {
        let config = Config::load()?;

        println!("=== chatloom Configuration ===\n");

        println!("Provider:");
        println!("  Base URL: {}", config.provider.base_url);
        match config.provider.resolved_api_key() {
            Some(key) => println!("  API Key: {}", mask_key(&key)),
            None => println!("  API Key: (not set)"),
        }
        println!("  Timeout: {}s", config.provider.timeout_secs);
        println!("  Channel Capacity: {}", config.provider.channel_capacity);
        println!("  Retry Delays: {:?} ms", config.provider.retry_delays_ms);
        println!();

        println!("Model:");
        println!("  Model: {}", config.model.model);
        println!("  Max Tokens: {}", config.model.max_tokens);
        println!("  Temperature: {}", config.model.temperature);
        println!("  Presence Penalty: {}", config.model.presence_penalty);
        println!("  Top P: {}", config.model.top_p);
        println!();

        let compression = &config.memory.compression;
        println!("Memory:");
        println!("  Enabled: {}", config.memory.enabled);
        println!("  Max Tail Messages: {}", compression.max_tail_messages);
        println!("  Max Tail Tokens: {}", compression.max_tail_tokens);
        println!("  Keep Recent: {}", compression.keep_recent_messages);
        println!("  Summary Words: {}", compression.summary_max_words);
        println!();

        println!("Chat:");
        if let Some(ref prompt) = config.chat.system_prompt {
            println!("  System Prompt: {}", truncate(prompt, 60));
        }
        println!("  Auto Title: {}", config.chat.auto_title);

        let path = config.snapshot_path()?;
        println!("  Sessions File: {}", path.display());
        info!("Reading sessions from {}", path.display());
        match JsonFileStore::new(&path).load().await {
            Ok(Some(snapshot)) => {
                let messages: usize = snapshot.sessions.iter().map(|s| s.messages.len()).sum();
                println!(
                    "  Stored: {} sessions, {messages} messages",
                    snapshot.sessions.len()
                );
            }
            Ok(None) => println!("  Stored: (none)"),
            Err(e) => println!("  Stored: unreadable ({e})"),
        }

        Ok(())
    }
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "***".to_string()
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars - 3).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_keys() {
        assert_eq!(mask_key("sk-1234567890abcd"), "sk-1...abcd");
        assert_eq!(mask_key("short"), "***");
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }
}
