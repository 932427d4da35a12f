use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_core::config::{ModelConfig, RetryConfig};
use strand_core::error::{Result, StrandError};
use strand_core::traits::LlmClient;
use strand_core::types::*;

/// Wraps a primary client with backoff on transient failures, then tries
/// each fallback model once.
///
/// Only errors for which [`StrandError::is_transient`] holds are retried
/// against the primary. Any primary failure hands over to the fallbacks.
/// Backoff sleeps end early, with `Cancelled`, when the run is cancelled.
pub struct RetryingClient {
    primary: Box<dyn LlmClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
    retry_config: RetryConfig,
    cancel: CancellationToken,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn LlmClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop retrying once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StrandError::Cancelled { node: None });
        }
        Ok(())
    }

    async fn primary_with_backoff<'a>(
        &'a self,
        config: &ModelConfig,
        messages: &[ChatMessage],
    ) -> Result<BoxStream<'a, Result<StreamDelta>>> {
        let max_retries = self.retry_config.max_retries;
        let mut attempt = 0;
        loop {
            self.cancelled()?;
            let err = match self.primary.chat_stream(config, messages.to_vec()).await {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };
            if !err.is_transient() || attempt >= max_retries {
                return Err(err);
            }

            let backoff = calculate_backoff(attempt, &self.retry_config);
            attempt += 1;
            warn!(
                model = %config.model_id,
                attempt,
                max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Model unavailable, backing off"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(model = %config.model_id, "Backoff interrupted by cancellation");
                    return Err(StrandError::Cancelled { node: None });
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();

        Box::pin(async move {
            let primary_err = match self.primary_with_backoff(&config, &messages).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            if !self.fallbacks.is_empty() {
                info!(model = %config.model_id, error = %primary_err, "Primary model failed, trying fallbacks");
            }
            for (fb_config, fb_client) in &self.fallbacks {
                self.cancelled()?;
                match fb_client.chat_stream(fb_config, messages.clone()).await {
                    Ok(stream) => {
                        info!(
                            model = %fb_config.model_id,
                            provider = %fb_config.provider,
                            "Fell back to alternative model"
                        );
                        return Ok(stream);
                    }
                    Err(e) => {
                        warn!(model = %fb_config.model_id, error = %e, "Fallback model failed");
                    }
                }
            }

            Err(primary_err)
        })
    }
}
