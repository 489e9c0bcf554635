//! Cloud Code onboarding: bind the authenticated user to a Google Cloud
//! project before the first OAuth generation call.
//!
//! Protocol: `:loadCodeAssist` resolves the user's tier and any managed
//! project; `:onboardUser` provisions one and returns a long-running
//! operation that is polled until done. The resolved id is persisted to the
//! configuration by the caller so later runs skip this entirely.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::providers::{read_success_body, send_cancellable};

/// Delay between long-running-operation polls.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound of the random jitter added to each poll, so simultaneous
/// onboarding adapters do not poll in lockstep.
const POLL_JITTER_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct OnboardingClient {
    http: reqwest::Client,
    /// E.g. `https://cloudcode-pa.googleapis.com/v1internal`.
    base: String,
    poll_interval: Duration,
}

impl OnboardingClient {
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Shorten the poll interval; used by tests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Resolve the Cloud project for this user, onboarding if necessary.
    pub async fn resolve_project(
        &self,
        access_token: &str,
        env_project: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let load = self.load_code_assist(access_token, env_project, cancel).await?;

        let tier = if load.current_tier.is_some() {
            // Already onboarded: the managed project wins, then the
            // environment-supplied one.
            if let Some(project) = load.cloudaicompanion_project.filter(|p| !p.is_empty()) {
                return Ok(project);
            }
            if let Some(project) = env_project {
                return Ok(project.to_string());
            }
            load.current_tier.unwrap_or_default()
        } else {
            load.allowed_tiers
                .unwrap_or_default()
                .into_iter()
                .find(|tier| tier.is_default.unwrap_or(false))
                .unwrap_or_else(|| Tier {
                    id: "free-tier".to_string(),
                    is_default: Some(true),
                    user_defined_cloudaicompanion_project: None,
                })
        };

        if tier.user_defined_cloudaicompanion_project.unwrap_or(false) && env_project.is_none() {
            return Err(ProviderError::AuthExpired(
                "this account's tier requires a project id; set providers.gemini.project_id"
                    .into(),
            ));
        }

        let mut operation = self
            .onboard_user(access_token, &tier.id, env_project, cancel)
            .await?;

        while !operation.done.unwrap_or(false) {
            self.sleep_with_jitter(cancel).await?;
            operation = self
                .onboard_user(access_token, &tier.id, env_project, cancel)
                .await?;
        }

        operation
            .response
            .and_then(|r| r.cloudaicompanion_project)
            .map(|p| p.id)
            .filter(|id| !id.is_empty())
            .or_else(|| env_project.map(|p| p.to_string()))
            .ok_or_else(|| {
                ProviderError::Parse("onboarding finished without a project id".into())
            })
    }

    async fn load_code_assist(
        &self,
        access_token: &str,
        env_project: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LoadCodeAssistResponse, ProviderError> {
        let body = LoadCodeAssistRequest {
            cloudaicompanion_project: env_project.map(|p| p.to_string()),
            metadata: ClientMetadata::default(),
        };
        let request = self
            .http
            .post(format!("{}:loadCodeAssist", self.base))
            .bearer_auth(access_token)
            .json(&body);
        let response = send_cancellable(request, cancel).await?;
        let text = read_success_body(response).await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::Parse(format!("{e}; body: {text}")))
    }

    async fn onboard_user(
        &self,
        access_token: &str,
        tier_id: &str,
        env_project: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<OperationResponse, ProviderError> {
        let body = OnboardUserRequest {
            tier_id: tier_id.to_string(),
            // Free tier onboards without a project; Google assigns one.
            cloudaicompanion_project: if tier_id == "free-tier" {
                None
            } else {
                env_project.map(|p| p.to_string())
            },
            metadata: ClientMetadata::default(),
        };
        let request = self
            .http
            .post(format!("{}:onboardUser", self.base))
            .bearer_auth(access_token)
            .json(&body);
        let response = send_cancellable(request, cancel).await?;
        let text = read_success_body(response).await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::Parse(format!("{e}; body: {text}")))
    }

    async fn sleep_with_jitter(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=POLL_JITTER_MS));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            _ = tokio::time::sleep(self.poll_interval + jitter) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMetadata {
    ide_type: &'static str,
    platform: &'static str,
    plugin_type: &'static str,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            ide_type: "IDE_UNSPECIFIED",
            platform: "PLATFORM_UNSPECIFIED",
            plugin_type: "GEMINI",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    cloudaicompanion_project: Option<String>,
    metadata: ClientMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistResponse {
    #[serde(default)]
    current_tier: Option<Tier>,
    #[serde(default)]
    cloudaicompanion_project: Option<String>,
    #[serde(default)]
    allowed_tiers: Option<Vec<Tier>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tier {
    #[serde(default)]
    id: String,
    #[serde(default)]
    is_default: Option<bool>,
    #[serde(default)]
    user_defined_cloudaicompanion_project: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OnboardUserRequest {
    tier_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloudaicompanion_project: Option<String>,
    metadata: ClientMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    response: Option<OperationResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResult {
    #[serde(default)]
    cloudaicompanion_project: Option<ProjectRef>,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    #[serde(default)]
    id: String,
}
