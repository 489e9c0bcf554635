//! Provider adapters for the remote code-generation services.
//!
//! Every adapter implements [`ProviderAdapter`]: given a fully composed
//! prompt and a credential from the pool, call the provider's HTTP API and
//! return cleaned source code with token usage. Prompt composition is shared
//! (see [`prompt`]); only the wire formats differ per provider.

pub mod anthropic;
pub mod cerebras;
pub mod gemini;
pub mod onboarding;
pub mod openrouter;
pub mod prompt;

pub use anthropic::AnthropicAdapter;
pub use cerebras::CerebrasAdapter;
pub use gemini::GeminiAdapter;
pub use openrouter::OpenRouterAdapter;
pub use prompt::{build_prompt, BuiltPrompt, PromptInput};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// Outbound request timeout for generation calls.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Credential handed out by a key pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// A bearer/API key value.
    ApiKey(String),
    /// OAuth material held by the adapter itself; the pool only tracks
    /// health for it.
    OAuth,
}

impl Credential {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey(key.into())
    }

    /// The key value, for adapters that require one.
    pub fn require_key(&self) -> Result<&str, ProviderError> {
        match self {
            Self::ApiKey(key) => Ok(key),
            Self::OAuth => Err(ProviderError::NoCredential),
        }
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Build a usage record with a consistent total.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }
}

/// Result of one successful generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Cleaned source code (markdown fences already stripped).
    pub code: String,
    /// The model that actually served the request, when known.
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Contract shared by all four provider adapters.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(
        &self,
        prompt: &BuiltPrompt,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Generation, ProviderError>;
}

/// HTTP client shared by the generation adapters.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(GENERATION_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Await an outbound request, aborting early if the caller cancels.
pub async fn send_cancellable(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, ProviderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        response = request.send() => response.map_err(crate::error::error_for_request),
    }
}

/// Read a response body, turning non-2xx statuses into classified errors.
pub async fn read_success_body(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(crate::error::error_for_status(status.as_u16(), body));
    }
    Ok(body)
}
