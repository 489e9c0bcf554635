//! OpenRouter adapter: OpenAI chat wire format plus attribution headers,
//! multi-model selection, and free-tier credit introspection.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::cerebras::{ChatMessage, ChatRequest, ChatResponse};
use super::{
    http_client, read_success_body, send_cancellable, BuiltPrompt, Credential, Generation,
    ProviderAdapter, TokenUsage,
};
use crate::config::{ModelStrategy, ProviderSettings};
use crate::error::ProviderError;
use crate::language::strip_code_fences;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api";
const DEFAULT_MODEL: &str = "qwen/qwen-2.5-coder-32b-instruct";
const DEFAULT_SITE_URL: &str = "https://github.com/mcp-code-api";
const DEFAULT_SITE_NAME: &str = "mcp-code-api";
const FREE_SUFFIX: &str = ":free";

/// Picks the model for each attempt according to the configured strategy.
#[derive(Debug)]
pub struct ModelSelector {
    models: Vec<String>,
    strategy: ModelStrategy,
    free_only: bool,
    /// Failover index / round-robin cursor, depending on strategy.
    cursor: AtomicUsize,
}

impl ModelSelector {
    pub fn new(models: Vec<String>, strategy: ModelStrategy, free_only: bool) -> Self {
        let models = if models.is_empty() {
            vec![DEFAULT_MODEL.to_string()]
        } else {
            models
        };
        Self {
            models,
            strategy,
            free_only,
            cursor: AtomicUsize::new(0),
        }
    }

    /// The model to use for the next call.
    pub fn select(&self) -> String {
        let index = match self.strategy {
            ModelStrategy::Failover => self.cursor.load(Ordering::Relaxed) % self.models.len(),
            ModelStrategy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.models.len()
            }
            ModelStrategy::Random => rand::thread_rng().gen_range(0..self.models.len()),
        };
        self.apply_free_suffix(self.models[index].clone())
    }

    /// Rotate the failover index after a failed call. Round-robin and
    /// random strategies ignore this.
    pub fn note_failure(&self) {
        if self.strategy == ModelStrategy::Failover {
            self.cursor.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Append `:free` unless the model already carries it. Applied
    /// unconditionally to any other suffix the model may have.
    fn apply_free_suffix(&self, model: String) -> String {
        if self.free_only && !model.ends_with(FREE_SUFFIX) {
            format!("{model}{FREE_SUFFIX}")
        } else {
            model
        }
    }
}

pub struct OpenRouterAdapter {
    settings: ProviderSettings,
    selector: ModelSelector,
    http: reqwest::Client,
}

impl OpenRouterAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        let models = settings
            .models
            .clone()
            .or_else(|| settings.model.clone().map(|m| vec![m]))
            .unwrap_or_default();
        let selector = ModelSelector::new(models, settings.model_strategy, settings.free_only);
        Self {
            settings,
            selector,
            http: http_client(),
        }
    }

    fn base_url(&self) -> &str {
        self.settings
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url().trim_end_matches('/'))
    }

    fn key_endpoint(&self) -> String {
        format!("{}/v1/key", self.base_url().trim_end_matches('/'))
    }

    /// Query `/v1/key` for the account's remaining quota. A free-tier
    /// account with nothing remaining fails fast so the main call is never
    /// made. Introspection errors are ignored; the main call decides.
    async fn check_credits(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let request = self.http.get(self.key_endpoint()).bearer_auth(key);
        let response = match send_cancellable(request, cancel).await {
            Ok(response) => response,
            Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
            Err(_) => return Ok(()),
        };
        if !response.status().is_success() {
            return Ok(());
        }
        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(_) => return Ok(()),
        };
        // The live API nests the fields under `data`; accept both layouts.
        let info = body.get("data").unwrap_or(&body);
        let is_free_tier = info
            .get("is_free_tier")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let remaining = info.get("limit_remaining").and_then(|v| v.as_f64());
        if is_free_tier && remaining.map(|r| r <= 0.0).unwrap_or(false) {
            return Err(ProviderError::RateLimited(
                "openrouter free tier has no remaining requests".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for OpenRouterAdapter {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    async fn generate(
        &self,
        prompt: &BuiltPrompt,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Generation, ProviderError> {
        let key = credential.require_key()?;
        self.check_credits(key, cancel).await?;

        let model = self.selector.select();
        let body = ChatRequest {
            model: model.clone(),
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
            temperature: self.settings.temperature.unwrap_or(0.2),
            max_tokens: self.settings.max_tokens,
        };

        let request = self
            .http
            .post(self.chat_endpoint())
            .bearer_auth(key)
            .header(
                "HTTP-Referer",
                self.settings.site_url.as_deref().unwrap_or(DEFAULT_SITE_URL),
            )
            .header(
                "X-Title",
                self.settings
                    .site_name
                    .as_deref()
                    .unwrap_or(DEFAULT_SITE_NAME),
            )
            .json(&body);

        let result: Result<Generation, ProviderError> = async {
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
                model: Some(parsed.model.unwrap_or(model)),
                usage: parsed
                    .usage
                    .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            })
        }
        .await;

        if result.is_err() {
            self.selector.note_failure();
        }
        result
    }
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
            instruction: "hello",
            output_path: Path::new("/tmp/hello.py"),
            language: None,
            context_paths: &[],
            existing_content: None,
        })
    }

    fn adapter_for(server: &MockServer, settings: ProviderSettings) -> OpenRouterAdapter {
        OpenRouterAdapter::new(ProviderSettings {
            base_url: Some(server.uri()),
            ..settings
        })
    }

    #[test]
    fn failover_sticks_to_first_until_failure() {
        let selector = ModelSelector::new(
            vec!["a".into(), "b".into(), "c".into()],
            ModelStrategy::Failover,
            false,
        );
        assert_eq!(selector.select(), "a");
        assert_eq!(selector.select(), "a");
        selector.note_failure();
        assert_eq!(selector.select(), "b");
        selector.note_failure();
        selector.note_failure();
        assert_eq!(selector.select(), "a"); // wraps around
    }

    #[test]
    fn round_robin_cycles() {
        let selector = ModelSelector::new(
            vec!["a".into(), "b".into()],
            ModelStrategy::RoundRobin,
            false,
        );
        assert_eq!(selector.select(), "a");
        assert_eq!(selector.select(), "b");
        assert_eq!(selector.select(), "a");
    }

    #[test]
    fn random_stays_in_range() {
        let selector =
            ModelSelector::new(vec!["a".into(), "b".into()], ModelStrategy::Random, false);
        for _ in 0..50 {
            let model = selector.select();
            assert!(model == "a" || model == "b");
        }
    }

    #[test]
    fn free_only_appends_suffix_once() {
        let selector = ModelSelector::new(
            vec!["m/model".into(), "m/other:free".into()],
            ModelStrategy::RoundRobin,
            true,
        );
        assert_eq!(selector.select(), "m/model:free");
        assert_eq!(selector.select(), "m/other:free");
    }

    #[tokio::test]
    async fn free_tier_with_no_remaining_fails_before_the_main_call() {
        // S6: /v1/key says free tier, nothing remaining; the chat endpoint
        // must never be hit.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "is_free_tier": true,
                "limit_remaining": 0
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, ProviderSettings::default());
        let err = adapter
            .generate(
                &sample_prompt(),
                &Credential::api_key("or-key"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited(_)));
    }

    #[tokio::test]
    async fn paid_tier_proceeds_and_sends_attribution_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"is_free_tier": false, "limit_remaining": 100.0}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("HTTP-Referer", DEFAULT_SITE_URL))
            .and(header("X-Title", DEFAULT_SITE_NAME))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "print('hi')"}}],
                "model": "qwen/qwen-2.5-coder-32b-instruct"
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, ProviderSettings::default());
        let generation = adapter
            .generate(
                &sample_prompt(),
                &Credential::api_key("or-key"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(generation.code, "print('hi')");
    }

    #[tokio::test]
    async fn introspection_failure_does_not_block_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/key"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "x = 1"}}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, ProviderSettings::default());
        let generation = adapter
            .generate(
                &sample_prompt(),
                &Credential::api_key("k"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(generation.code, "x = 1");
    }

    #[tokio::test]
    async fn configured_free_only_model_reaches_the_wire() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "is_free_tier": true, "limit_remaining": 5
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "meta-llama/llama-3.3-70b-instruct:free"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "ok"}}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(
            &server,
            ProviderSettings {
                models: Some(vec!["meta-llama/llama-3.3-70b-instruct".into()]),
                free_only: true,
                ..Default::default()
            },
        );
        let generation = adapter
            .generate(
                &sample_prompt(),
                &Credential::api_key("k"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(generation.code, "ok");
    }
}
