//! Language-model backend for classification.
//!
//! The classifier only needs two capabilities from a backend: list the
//! models it serves, and generate text from a prompt with a named model.
//! `GeminiBackend` implements them over the Generative Language REST API.

pub mod gemini;

pub use gemini::GeminiBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ProxySetting, http_client};
use crate::error::LlmError;

/// Default request timeout for model calls.
const MODEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Opaque request/response capability of a model backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Identifiers of models that support text generation, without any
    /// `models/` prefix.
    async fn list_models(&self) -> Result<Vec<String>, LlmError>;

    /// Generate free text for `prompt` using `model`.
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError>;
}

/// Configuration for creating a model backend.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub base_url: String,
    pub proxy: Option<ProxySetting>,
}

impl LlmConfig {
    pub fn new(api_key: secrecy::SecretString) -> Self {
        Self {
            api_key,
            base_url: gemini::DEFAULT_BASE_URL.to_string(),
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<ProxySetting>) -> Self {
        self.proxy = proxy;
        self
    }
}

/// Create the model backend from configuration.
pub fn create_backend(config: &LlmConfig) -> Result<Arc<dyn ModelBackend>, LlmError> {
    let client = http_client(config.proxy.as_ref(), MODEL_TIMEOUT).map_err(|e| {
        LlmError::RequestFailed {
            model: "*".to_string(),
            reason: format!("Failed to create HTTP client: {e}"),
        }
    })?;
    tracing::info!(base_url = %config.base_url, "Using Gemini backend");
    Ok(Arc::new(GeminiBackend::new(
        client,
        config.api_key.clone(),
        &config.base_url,
    )))
}
