//! Anthropic Messages API adapter (and Anthropic-compatible gateways).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    http_client, read_success_body, send_cancellable, BuiltPrompt, Credential, Generation,
    ProviderAdapter, TokenUsage,
};
use crate::config::ProviderSettings;
use crate::error::ProviderError;
use crate::language::strip_code_fences;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
const DEFAULT_MAX_TOKENS: u64 = 8192;
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    settings: ProviderSettings,
    http: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            settings,
            http: http_client(),
        }
    }

    fn endpoint(&self) -> String {
        let base = self
            .settings
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/v1/messages")
    }

    fn model(&self) -> &str {
        self.settings.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn generate(
        &self,
        prompt: &BuiltPrompt,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Generation, ProviderError> {
        let key = credential.require_key()?;
        let body = MessagesRequest {
            model: self.model(),
            max_tokens: self.settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: &prompt.system,
            messages: vec![Message {
                role: "user",
                content: &prompt.user,
            }],
        };

        let request = self
            .http
            .post(self.endpoint())
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&body);

        let response = send_cancellable(request, cancel).await?;
        let body = read_success_body(response).await?;
        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Parse(format!("{e}; body: {body}")))?;

        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();
        if text.is_empty() {
            return Err(ProviderError::Parse("response carried no text blocks".into()));
        }

        Ok(Generation {
            code: strip_code_fences(&text),
            model: Some(parsed.model.unwrap_or_else(|| self.model().to_string())),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
        })
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u64,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}
