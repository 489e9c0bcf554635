//! OpenAI-compatible chat-completions adapter, used for Cerebras.

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

const DEFAULT_BASE_URL: &str = "https://api.cerebras.ai";
const DEFAULT_MODEL: &str = "llama-3.3-70b";
const DEFAULT_TEMPERATURE: f64 = 0.2;

pub struct CerebrasAdapter {
    settings: ProviderSettings,
    http: reqwest::Client,
}

impl CerebrasAdapter {
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
        format!("{base}/v1/chat/completions")
    }

    fn model(&self) -> &str {
        self.settings.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

#[async_trait]
impl ProviderAdapter for CerebrasAdapter {
    fn name(&self) -> &'static str {
        "cerebras"
    }

    async fn generate(
        &self,
        prompt: &BuiltPrompt,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Generation, ProviderError> {
        let key = credential.require_key()?;
        let body = ChatRequest {
            model: self.model().to_string(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.settings.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: self.settings.max_tokens,
        };

        let request = self
            .http
            .post(self.endpoint())
            .bearer_auth(key)
            .json(&body);

        let response = send_cancellable(request, cancel).await?;
        let text = read_success_body(response).await?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Parse(format!("{e}; body: {text}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::Parse("no choices in response".into()))?;

        Ok(Generation {
            code: strip_code_fences(&content),
            model: Some(parsed.model.unwrap_or_else(|| self.model().to_string())),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: String,
    pub messages: Vec<ChatMessage<'a>>,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::prompt::{build_prompt, PromptInput};
    use std::path::Path;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_prompt() -> BuiltPrompt {
        build_prompt(&PromptInput {
            instruction: "a fib function",
            output_path: Path::new("/tmp/fib.rs"),
            language: None,
            context_paths: &[],
            existing_content: None,
        })
    }

    #[tokio::test]
    async fn speaks_openai_chat_wire_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer csk-1"))
            .and(body_partial_json(serde_json::json!({
                "messages": [
                    {"role": "system"},
                    {"role": "user"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "fn fib(n: u64) -> u64 { n }"}}],
                "model": "llama-3.3-70b",
                "usage": {"prompt_tokens": 30, "completion_tokens": 10, "total_tokens": 40}
            })))
            .mount(&server)
            .await;

        let adapter = CerebrasAdapter::new(ProviderSettings {
            base_url: Some(server.uri()),
            ..Default::default()
        });
        let generation = adapter
            .generate(
                &sample_prompt(),
                &Credential::api_key("csk-1"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(generation.code, "fn fib(n: u64) -> u64 { n }");
        assert_eq!(generation.usage.unwrap().total_tokens, 40);
    }

    #[tokio::test]
    async fn empty_choices_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let adapter = CerebrasAdapter::new(ProviderSettings {
            base_url: Some(server.uri()),
            ..Default::default()
        });
        let err = adapter
            .generate(
                &sample_prompt(),
                &Credential::api_key("k"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)));
    }
}
