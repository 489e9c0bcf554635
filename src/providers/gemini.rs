//! Gemini adapter with two transport shapes: the public generateContent API
//! authenticated by key, and the Cloud Code internal endpoint authenticated
//! by OAuth bearer token.
//!
//! The OAuth path refreshes its access token before any request that falls
//! inside the expiry skew (single-flight behind the token mutex), persists
//! refreshed tokens back into the YAML configuration, and resolves a Cloud
//! project id through the onboarding protocol on first use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::onboarding::OnboardingClient;
use super::{
    http_client, read_success_body, send_cancellable, BuiltPrompt, Credential, Generation,
    ProviderAdapter, TokenUsage,
};
use crate::config::{ConfigStore, ProviderSettings};
use crate::error::ProviderError;
use crate::language::strip_code_fences;
use crate::oauth::{self, OAuthTokens};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_CLOUDCODE_BASE: &str = "https://cloudcode-pa.googleapis.com/v1internal";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Endpoint set, overridable for gateways and tests.
#[derive(Debug, Clone)]
pub struct GeminiEndpoints {
    pub generate_base: String,
    pub cloudcode_base: String,
    pub token_url: String,
}

impl Default for GeminiEndpoints {
    fn default() -> Self {
        Self {
            generate_base: DEFAULT_BASE_URL.to_string(),
            cloudcode_base: DEFAULT_CLOUDCODE_BASE.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
        }
    }
}

pub struct GeminiAdapter {
    settings: ProviderSettings,
    endpoints: GeminiEndpoints,
    http: reqwest::Client,
    oauth_http: reqwest::Client,
    config_store: ConfigStore,
    /// OAuth token state; the mutex serializes refreshes.
    tokens: Mutex<Option<OAuthTokens>>,
    /// Resolved Cloud project id, discovered once.
    project: RwLock<Option<String>>,
}

impl GeminiAdapter {
    pub fn new(settings: ProviderSettings, config_store: ConfigStore) -> Self {
        let mut endpoints = GeminiEndpoints::default();
        if let Some(base) = &settings.base_url {
            endpoints.generate_base = base.trim_end_matches('/').to_string();
        }
        Self::with_endpoints(settings, config_store, endpoints)
    }

    pub fn with_endpoints(
        settings: ProviderSettings,
        config_store: ConfigStore,
        endpoints: GeminiEndpoints,
    ) -> Self {
        let tokens = settings.oauth.as_ref().and_then(|oauth| {
            oauth.access_token.as_ref().map(|access| OAuthTokens {
                access_token: access.clone(),
                refresh_token: oauth.refresh_token.clone(),
                expires_at: oauth.expires_at.unwrap_or(0),
                token_type: "Bearer".to_string(),
            })
        });
        let project = settings.project_id.clone();
        Self {
            settings,
            endpoints,
            http: http_client(),
            oauth_http: oauth::oauth_http_client(),
            config_store,
            tokens: Mutex::new(tokens),
            project: RwLock::new(project),
        }
    }

    fn model(&self) -> &str {
        self.settings.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    fn build_request(&self, prompt: &BuiltPrompt) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: prompt.user.clone(),
                }],
            }],
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part {
                    text: prompt.system.clone(),
                }],
            }),
            generation_config: Some(GenerationConfig {
                temperature: self.settings.temperature,
                max_output_tokens: self.settings.max_tokens,
            }),
        }
    }

    /// API-key path: `<base>/v1beta/models/<model>:generateContent`.
    async fn generate_with_key(
        &self,
        prompt: &BuiltPrompt,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Generation, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoints.generate_base.trim_end_matches('/'),
            self.model()
        );
        let request = self
            .http
            .post(url)
            .header("x-goog-api-key", key)
            .json(&self.build_request(prompt));
        let response = send_cancellable(request, cancel).await?;
        let text = read_success_body(response).await?;
        let parsed: GenerateContentResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Parse(format!("{e}; body: {text}")))?;
        self.into_generation(parsed)
    }

    /// OAuth path: Cloud Code internal endpoint with the
    /// `{model, project, request}` wrapper.
    async fn generate_with_oauth(
        &self,
        prompt: &BuiltPrompt,
        cancel: &CancellationToken,
    ) -> Result<Generation, ProviderError> {
        let access_token = self.ensure_access_token().await?;
        let project = self.ensure_project(&access_token, cancel).await?;

        let body = CloudCodeRequest {
            model: self.model().to_string(),
            project,
            request: self.build_request(prompt),
        };
        let request = self
            .http
            .post(format!("{}:generateContent", self.endpoints.cloudcode_base))
            .bearer_auth(&access_token)
            .json(&body);
        let response = send_cancellable(request, cancel).await?;
        let text = read_success_body(response).await?;
        let parsed: CloudCodeResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Parse(format!("{e}; body: {text}")))?;
        self.into_generation(parsed.response)
    }

    /// Return a fresh access token, refreshing under the mutex when within
    /// the expiry skew. The double check after acquiring the lock means a
    /// caller that waited behind a refresh reuses its result.
    async fn ensure_access_token(&self) -> Result<String, ProviderError> {
        let mut tokens = self.tokens.lock().await;

        if tokens.is_none() {
            let oauth = self
                .settings
                .oauth
                .as_ref()
                .ok_or(ProviderError::NoCredential)?;
            *tokens = Some(OAuthTokens {
                access_token: oauth.access_token.clone().unwrap_or_default(),
                refresh_token: oauth.refresh_token.clone(),
                expires_at: oauth.expires_at.unwrap_or(0),
                token_type: "Bearer".to_string(),
            });
        }

        let current = tokens.as_ref().expect("initialized above");
        if !current.access_token.is_empty() && !current.is_expired() {
            return Ok(current.access_token.clone());
        }

        let oauth_settings = self
            .settings
            .oauth
            .as_ref()
            .ok_or(ProviderError::NoCredential)?;
        let response = oauth::refresh_access_token(
            &self.oauth_http,
            &self.endpoints.token_url,
            &oauth_settings.client_id,
            &oauth_settings.client_secret,
            &current.refresh_token,
        )
        .await
        .map_err(|e| ProviderError::AuthExpired(e.to_string()))?;

        let refreshed = response.into_tokens(Some(&current.refresh_token));
        if let Err(err) = self
            .config_store
            .persist_oauth_tokens(
                "gemini",
                &refreshed.access_token,
                &refreshed.refresh_token,
                refreshed.expires_at,
            )
            .await
        {
            tracing::warn!(error = %err, "could not persist refreshed gemini tokens");
        }
        let access = refreshed.access_token.clone();
        *tokens = Some(refreshed);
        tracing::debug!("gemini access token refreshed");
        Ok(access)
    }

    /// Return the bound project id, running onboarding on first need and
    /// persisting the discovered id.
    async fn ensure_project(
        &self,
        access_token: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        if let Some(project) = self.project.read().await.clone() {
            return Ok(project);
        }

        let mut slot = self.project.write().await;
        // Another caller may have finished onboarding while we waited.
        if let Some(project) = slot.clone() {
            return Ok(project);
        }

        let env_project = std::env::var("GOOGLE_CLOUD_PROJECT").ok();
        let onboarding =
            OnboardingClient::new(self.oauth_http.clone(), self.endpoints.cloudcode_base.clone());
        let project = onboarding
            .resolve_project(access_token, env_project.as_deref(), cancel)
            .await?;

        if let Err(err) = self
            .config_store
            .persist_project_id("gemini", &project)
            .await
        {
            tracing::warn!(error = %err, "could not persist gemini project id");
        }
        *slot = Some(project.clone());
        tracing::info!(project = %project, "gemini cloud project resolved");
        Ok(project)
    }

    fn into_generation(
        &self,
        response: GenerateContentResponse,
    ) -> Result<Generation, ProviderError> {
        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse("response carried no candidates".into()))?;

        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(ProviderError::ContentFiltered(
                "gemini blocked the response (finish reason SAFETY)".into(),
            ));
        }

        let text: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(ProviderError::Parse("candidate carried no text".into()));
        }

        Ok(Generation {
            code: strip_code_fences(&text),
            model: Some(self.model().to_string()),
            usage: response.usage_metadata.map(|u| {
                TokenUsage::new(u.prompt_token_count, u.candidates_token_count)
            }),
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(
        &self,
        prompt: &BuiltPrompt,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Generation, ProviderError> {
        match credential {
            Credential::ApiKey(key) => self.generate_with_key(prompt, key, cancel).await,
            Credential::OAuth => self.generate_with_oauth(prompt, cancel).await,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CloudCodeRequest {
    model: String,
    project: String,
    request: GenerateContentRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudCodeResponse {
    response: GenerateContentResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    #[allow(dead_code)]
    total_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthSettings;
    use crate::providers::prompt::{build_prompt, PromptInput};
    use std::path::Path;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
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

    fn endpoints_for(server: &MockServer) -> GeminiEndpoints {
        GeminiEndpoints {
            generate_base: server.uri(),
            cloudcode_base: format!("{}/v1internal", server.uri()),
            token_url: format!("{}/token", server.uri()),
        }
    }

    fn temp_store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.yaml"));
        (dir, store)
    }

    #[tokio::test]
    async fn api_key_path_hits_v1beta_with_goog_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .and(header("x-goog-api-key", "gk-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "print('hi')"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {
                    "promptTokenCount": 7, "candidatesTokenCount": 4, "totalTokenCount": 11
                }
            })))
            .mount(&server)
            .await;

        let (_dir, store) = temp_store();
        let adapter = GeminiAdapter::with_endpoints(
            ProviderSettings::default(),
            store,
            endpoints_for(&server),
        );
        let generation = adapter
            .generate(
                &sample_prompt(),
                &Credential::api_key("gk-1"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(generation.code, "print('hi')");
        assert_eq!(generation.usage.unwrap().total_tokens, 11);
    }

    #[tokio::test]
    async fn safety_block_is_content_filtered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"finishReason": "SAFETY"}]
            })))
            .mount(&server)
            .await;

        let (_dir, store) = temp_store();
        let adapter = GeminiAdapter::with_endpoints(
            ProviderSettings::default(),
            store,
            endpoints_for(&server),
        );
        let err = adapter
            .generate(
                &sample_prompt(),
                &Credential::api_key("k"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ContentFiltered(_)));
    }

    #[tokio::test]
    async fn oauth_path_refreshes_expired_token_and_persists() {
        // S3: expired token forces a refresh; the new tokens land in the
        // YAML config and the Cloud Code call carries the fresh bearer.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-access",
                "refresh_token": "fresh-refresh",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .and(header("authorization", "Bearer fresh-access"))
            .and(body_partial_json(serde_json::json!({
                "model": "gemini-2.0-flash",
                "project": "bound-project"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": {
                    "candidates": [{
                        "content": {"parts": [{"text": "x = 1"}]},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
                }
            })))
            .mount(&server)
            .await;

        let (_dir, store) = temp_store();
        let settings = ProviderSettings {
            project_id: Some("bound-project".into()),
            oauth: Some(OAuthSettings {
                client_id: "cid".into(),
                client_secret: "cs".into(),
                refresh_token: "old-refresh".into(),
                access_token: Some("stale-access".into()),
                expires_at: Some(chrono::Utc::now().timestamp() - 1),
            }),
            ..Default::default()
        };
        let adapter =
            GeminiAdapter::with_endpoints(settings, store.clone(), endpoints_for(&server));
        let generation = adapter
            .generate(&sample_prompt(), &Credential::OAuth, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(generation.code, "x = 1");

        // Persisted YAML carries the refreshed material.
        let written = std::fs::read_to_string(store.path()).unwrap();
        let config: crate::config::Config = serde_yaml::from_str(&written).unwrap();
        let oauth = config.provider("gemini").unwrap().oauth.clone().unwrap();
        assert_eq!(oauth.access_token.as_deref(), Some("fresh-access"));
        assert_eq!(oauth.refresh_token, "fresh-refresh");
        assert!(oauth.expires_at.unwrap() > chrono::Utc::now().timestamp());
    }

    #[tokio::test]
    async fn onboarding_runs_once_and_binds_the_project() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "currentTier": {"id": "standard-tier"},
                "cloudaicompanionProject": "discovered-project"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .and(body_partial_json(serde_json::json!({
                "project": "discovered-project"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": {
                    "candidates": [{
                        "content": {"parts": [{"text": "done"}]},
                        "finishReason": "STOP"
                    }]
                }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let (_dir, store) = temp_store();
        let settings = ProviderSettings {
            oauth: Some(OAuthSettings {
                client_id: "cid".into(),
                client_secret: String::new(),
                refresh_token: "rt".into(),
                access_token: Some("valid-access".into()),
                expires_at: Some(chrono::Utc::now().timestamp() + 3600),
            }),
            ..Default::default()
        };
        let adapter =
            GeminiAdapter::with_endpoints(settings, store.clone(), endpoints_for(&server));

        // Two calls; onboarding must run only once.
        for _ in 0..2 {
            let generation = adapter
                .generate(&sample_prompt(), &Credential::OAuth, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(generation.code, "done");
        }

        let written = std::fs::read_to_string(store.path()).unwrap();
        assert!(written.contains("discovered-project"));
    }
}
