use crate::error::{LlmError, Result};
use crate::gemini::GeminiClient;
use crate::types::{ModelInfo, ModelRequest, ModelResponse};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-flash-latest";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ModelClientConfig {
    pub model: String,
    pub base_url: String,
    /// Upper bound for one whole upstream call.
    pub timeout: Duration,
}

impl Default for ModelClientConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Text-in/text-out seam used by the gateway.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &ModelRequest, key: &str) -> Result<ModelResponse>;
}

#[derive(Clone)]
pub struct ModelClient {
    config: ModelClientConfig,
    http: reqwest::Client,
}

impl ModelClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(config: ModelClientConfig) -> Result<Self> {
        if config.model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model must not be blank".to_string()));
        }
        if config.timeout.is_zero() {
            return Err(LlmError::InvalidInput("timeout must be > 0".to_string()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(config.timeout))
            .build()?;
        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn gemini(&self, key: &str) -> GeminiClient {
        GeminiClient::new(
            self.http.clone(),
            &self.config.base_url,
            key,
            &self.config.model,
        )
    }

    /// One bounded attempt; no retries.
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.config.model))]
    pub async fn generate(&self, request: &ModelRequest, key: &str) -> Result<ModelResponse> {
        require_key(key)?;
        if request.prompt.trim().is_empty() {
            return Err(LlmError::InvalidInput("prompt must not be empty".to_string()));
        }

        let gemini = self.gemini(key.trim());
        let text = self.bounded(gemini.generate_content(&request.prompt)).await?;
        tracing::debug!(text_chars = text.chars().count(), "model call succeeded");
        Ok(ModelResponse { text })
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn list_models(&self, key: &str) -> Result<Vec<ModelInfo>> {
        require_key(key)?;
        let gemini = self.gemini(key.trim());
        self.bounded(gemini.list_models()).await
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "model call timed out"
                );
                Err(LlmError::Invocation(format!(
                    "model call timed out after {}ms",
                    self.config.timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl TextGenerator for ModelClient {
    async fn generate(&self, request: &ModelRequest, key: &str) -> Result<ModelResponse> {
        ModelClient::generate(self, request, key).await
    }
}

fn require_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(LlmError::InvalidInput("api key must not be blank".to_string()));
    }
    Ok(())
}
