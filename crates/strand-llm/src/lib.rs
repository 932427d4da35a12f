pub mod agent;
pub mod replay;
pub mod retry;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use strand_core::config::{ModelConfig, RetryConfig};
use strand_core::error::{Result, StrandError};
use strand_core::traits::LlmClient;

pub use agent::LlmAgent;
pub use replay::ReplayClient;
pub use retry::RetryingClient;

/// Builds a client for one provider from its model config.
pub type ClientFactory = Arc<dyn Fn(&ModelConfig) -> Result<Box<dyn LlmClient>> + Send + Sync>;

/// Maps provider tags (e.g. `"anthropic"`, `"openai"`) to client factories.
///
/// Vendor HTTP clients live outside this crate; the host registers one
/// factory per vendor and the tag in `ModelConfig::provider` selects it
/// when a client is constructed.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `replay` provider. Its `base_url` is the
    /// path of the replay file.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("replay", |config: &ModelConfig| {
            let path = config
                .base_url
                .as_deref()
                .ok_or_else(|| StrandError::Config("replay provider needs base_url = <file>".into()))?;
            let path = path.strip_prefix("file://").unwrap_or(path);
            Ok(Box::new(ReplayClient::from_file(Path::new(path))?) as Box<dyn LlmClient>)
        });
        registry
    }

    pub fn register<F>(&mut self, provider: impl Into<String>, factory: F)
    where
        F: Fn(&ModelConfig) -> Result<Box<dyn LlmClient>> + Send + Sync + 'static,
    {
        self.factories
            .insert(provider.into().to_lowercase(), Arc::new(factory));
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Create an LLM client based on the provider tag.
    pub fn create_client(&self, config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
        let factory = self
            .factories
            .get(&config.provider.to_lowercase())
            .ok_or_else(|| StrandError::UnsupportedProvider(config.provider.clone()))?;
        factory(config)
    }

    /// Create a client that retries the primary model and then tries the fallbacks.
    pub fn create_with_fallbacks(
        &self,
        primary: &ModelConfig,
        fallbacks: &[ModelConfig],
        retry: RetryConfig,
    ) -> Result<RetryingClient> {
        let primary_client = self.create_client(primary)?;
        let fallback_clients = fallbacks
            .iter()
            .map(|cfg| Ok((cfg.clone(), self.create_client(cfg)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(RetryingClient::new(primary_client, fallback_clients, retry))
    }
}
