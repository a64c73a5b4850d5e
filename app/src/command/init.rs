use chatloom_config::Config;

/// Strategy for initializing the configuration.
///
/// Creates the default configuration file at `~/chatloom/config.json`.
#[derive(Debug, Clone, Copy)]
pub struct InitStrategy;

impl super::CommandStrategy for InitStrategy {
    type Input = ();

    async fn execute(&self, _input: Self::Input) -> anyhow::Result<()> {
        let config_path = Config::create_config()?;

        println!("✅ Created config file at: {}", config_path.display());
        println!();
        println!("📝 Next steps:");
        println!("   1. Edit the config file and add your API key (or set OPENAI_API_KEY)");
        println!("   2. Point provider.base_url at any OpenAI-compatible endpoint");
        println!("   3. Run 'chatloom chat' to start a conversation");
        println!();
        println!("🔧 Configuration options:");
        println!("   - model.model: model name sent with every request");
        println!("   - memory.compression: when long sessions are summarized");
        println!("   - chat.auto_title: derive session titles from the first exchange");
        println!();
        Ok(())
    }
}
