//! Static strategy pattern for CLI commands.
//!
//! Each command is a separate strategy with its own input type, dispatched
//! statically from `main`.

use std::sync::Arc;
use std::time::Duration;

use chatloom_config::Config;
use chatloom_core::ChatTransport;
use chatloom_providers::{OpenAiProvider, RetryPolicy, ScriptedProvider};
use chatloom_session::{JsonFileStore, SessionStore, StoreConfig};
use tracing::{info, warn};

mod chat;
mod info;
mod init;
mod version;

pub use chat::{ChatInput, ChatStrategy};
pub use info::InfoStrategy;
pub use init::InitStrategy;
pub use version::VersionStrategy;

/// Core trait defining the contract for all command strategies.
///
/// # Example
/// ```rust,ignore
/// struct MyStrategy;
///
/// impl CommandStrategy for MyStrategy {
///     type Input = MyInput;
///
///     async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
/// ```
pub trait CommandStrategy: Send + Sync + 'static {
    /// The input type this strategy accepts.
    type Input;

    /// Execute the command with the given input.
    ///
    /// # Errors
    /// Returns an error if command execution fails.
    async fn execute(&self, input: Self::Input) -> anyhow::Result<()>;
}

/// Store settings derived from the config file and command-line overrides.
fn store_config(config: &Config, model: Option<String>) -> StoreConfig {
    let mut model_config = config.model.clone();
    if let Some(model) = model {
        model_config = model_config.with_model(model);
    }

    StoreConfig {
        model: model_config,
        system_prompt: config.chat.system_prompt.clone(),
        memory_enabled: config.memory.enabled,
        auto_title: config.chat.auto_title,
        compression: config.memory.compression.clone(),
    }
}

fn build_transport(config: &Config, offline: bool) -> anyhow::Result<Arc<dyn ChatTransport>> {
    if offline {
        info!("Using offline echo transport");
        return Ok(Arc::new(ScriptedProvider::echo()));
    }

    let provider = &config.provider;
    let api_key = provider.resolved_api_key().ok_or_else(|| {
        anyhow::anyhow!(
            "No API key configured. Set provider.api_key in the config file or OPENAI_API_KEY."
        )
    })?;

    Ok(Arc::new(
        OpenAiProvider::new(api_key)
            .with_base_url(provider.base_url.clone())
            .with_timeout(Duration::from_secs(provider.timeout_secs))
            .with_channel_capacity(provider.channel_capacity)
            .with_retry(RetryPolicy::from_millis(&provider.retry_delays_ms)),
    ))
}

/// Load config, build the transport and hydrate the session store.
async fn init_store(
    model: Option<String>,
    offline: bool,
    ephemeral: bool,
) -> anyhow::Result<SessionStore> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) if offline => {
            warn!("{e}; using defaults");
            Config::default()
        }
        Err(e) => return Err(e),
    };

    let transport = build_transport(&config, offline)?;
    let store_config = store_config(&config, model);

    let store = if ephemeral {
        SessionStore::new(transport, store_config)
    } else {
        let path = config.snapshot_path()?;
        info!("Sessions file: {}", path.display());
        SessionStore::persistent(transport, store_config, Arc::new(JsonFileStore::new(path)))
    };

    store.hydrate().await?;
    Ok(store)
}
