//! Provider routing: walk the preference order, retry validation failures
//! with error feedback, fall through on hard failures, and record metrics
//! for every adapter call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backup::BackupStore;
use crate::config::{Config, ConfigStore};
use crate::error::{ProviderAttempt, ProviderError, RouteError};
use crate::keypool::KeyPool;
use crate::metrics::MetricsTracker;
use crate::providers::{
    build_prompt, AnthropicAdapter, CerebrasAdapter, Credential, GeminiAdapter, OpenRouterAdapter,
    PromptInput, ProviderAdapter,
};
use crate::validate::{format_errors, validator_for_language};

/// Order used when the configuration does not specify one.
pub const DEFAULT_ORDER: [&str; 4] = ["anthropic", "cerebras", "openrouter", "gemini"];

/// Validation retries per provider (beyond the first attempt).
const MAX_VALIDATION_RETRIES: usize = 2;

/// Collects non-fatal messages surfaced to the client alongside the result.
#[derive(Debug, Clone, Default)]
pub struct WarningSink {
    messages: Arc<std::sync::Mutex<Vec<String>>>,
}

impl WarningSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: impl Into<String>) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.into());
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

/// Router-wide counters.
#[derive(Debug, Default)]
struct RouterCounters {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    fallback_attempts: AtomicU64,
}

/// Serializable view of the router counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RouterCountersSnapshot {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub fallback_attempts: u64,
}

/// One registered provider: its adapter and credential pool.
struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    pool: Arc<KeyPool>,
}

/// Owns the provider table, key pools, metrics, and the backup store.
pub struct Router {
    config: Config,
    providers: HashMap<String, ProviderEntry>,
    metrics: MetricsTracker,
    backups: BackupStore,
    counters: RouterCounters,
}

impl Router {
    /// Instantiate adapters and pools for every configured, credentialed
    /// provider the router knows how to speak to.
    pub fn from_config(config: Config, store: ConfigStore) -> Self {
        let mut router = Self::empty(config.clone());
        for name in DEFAULT_ORDER {
            let Some(settings) = config.provider(name) else {
                continue;
            };
            if !settings.has_credentials() {
                continue;
            }
            let adapter: Arc<dyn ProviderAdapter> = match name {
                "anthropic" => Arc::new(AnthropicAdapter::new(settings.clone())),
                "cerebras" => Arc::new(CerebrasAdapter::new(settings.clone())),
                "openrouter" => Arc::new(OpenRouterAdapter::new(settings.clone())),
                "gemini" => Arc::new(GeminiAdapter::new(settings.clone(), store.clone())),
                _ => continue,
            };
            let mut credentials: Vec<Credential> = settings
                .key_list()
                .into_iter()
                .map(Credential::ApiKey)
                .collect();
            if credentials.is_empty() && settings.has_oauth() {
                credentials.push(Credential::OAuth);
            }
            router.register(name, adapter, credentials);
        }
        router
    }

    /// A router with no providers; used as the base for registration.
    pub fn empty(config: Config) -> Self {
        Self {
            config,
            providers: HashMap::new(),
            metrics: MetricsTracker::new(),
            backups: BackupStore::new(),
            counters: RouterCounters::default(),
        }
    }

    /// Register a provider adapter with its credentials.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
        credentials: Vec<Credential>,
    ) {
        self.providers.insert(
            name.into(),
            ProviderEntry {
                adapter,
                pool: Arc::new(KeyPool::new(credentials)),
            },
        );
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn metrics(&self) -> &MetricsTracker {
        &self.metrics
    }

    pub fn counters(&self) -> RouterCountersSnapshot {
        RouterCountersSnapshot {
            total: self.counters.total.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            fallback_attempts: self.counters.fallback_attempts.load(Ordering::Relaxed),
        }
    }

    /// Providers that will actually be tried, in order: the configured
    /// preference (or the default order), filtered to enabled providers
    /// with a registered adapter. Providers without credentials were never
    /// registered, so they are skipped silently here.
    pub fn effective_order(&self) -> Vec<String> {
        let preference: Vec<String> = if self.config.preferred_order.is_empty() {
            DEFAULT_ORDER.iter().map(|s| s.to_string()).collect()
        } else {
            self.config.preferred_order.clone()
        };
        preference
            .into_iter()
            .filter(|name| {
                // An empty enabled list means nothing was restricted.
                self.config.enabled.is_empty() || self.config.is_enabled(name)
            })
            .filter(|name| self.providers.contains_key(name))
            .collect()
    }

    /// Generate code for `output_path`, walking providers in order and
    /// validating the result when requested.
    #[allow(clippy::too_many_arguments)]
    pub async fn generate_with_validation(
        &self,
        instruction: &str,
        output_path: &Path,
        context_paths: &[PathBuf],
        explicit_language: Option<&str>,
        validate: bool,
        warnings: &WarningSink,
        cancel: &CancellationToken,
    ) -> Result<String, RouteError> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let order = self.effective_order();
        tracing::debug!(providers = ?order, "routing generation request");

        let overall_start = Instant::now();
        let mut attempts: Vec<ProviderAttempt> = Vec::new();

        for name in &order {
            if cancel.is_cancelled() {
                return Err(RouteError::Cancelled);
            }
            let entry = self.providers.get(name).expect("provider registered");
            match self
                .try_provider(
                    name,
                    entry,
                    instruction,
                    output_path,
                    context_paths,
                    explicit_language,
                    validate,
                    warnings,
                    cancel,
                )
                .await
            {
                Ok(code) => {
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .record_overall(overall_start.elapsed().as_millis() as u64)
                        .await;
                    return Ok(code);
                }
                Err(ProviderError::Cancelled) => return Err(RouteError::Cancelled),
                Err(err) => {
                    tracing::warn!(provider = %name, error = %err, "provider failed, falling back");
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        reason: err.to_string(),
                    });
                    self.counters.fallback_attempts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        Err(RouteError::AllProvidersFailed { attempts })
    }

    /// Try one provider with up to two validation-feedback retries. Any
    /// non-validation error aborts the provider immediately.
    #[allow(clippy::too_many_arguments)]
    async fn try_provider(
        &self,
        name: &str,
        entry: &ProviderEntry,
        instruction: &str,
        output_path: &Path,
        context_paths: &[PathBuf],
        explicit_language: Option<&str>,
        validate: bool,
        warnings: &WarningSink,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let mut current_instruction = instruction.to_string();
        let mut last_failure = String::new();

        for attempt in 0..=MAX_VALIDATION_RETRIES {
            if attempt > 0 {
                warnings.push(format!(
                    "retrying with {name} after validation failure (attempt {})",
                    attempt + 1
                ));
            }

            let existing_content = std::fs::read_to_string(output_path).ok();
            let built = build_prompt(&PromptInput {
                instruction: &current_instruction,
                output_path,
                language: explicit_language,
                context_paths,
                existing_content: existing_content.as_deref(),
            });
            if attempt == 0 {
                for warning in &built.warnings {
                    warnings.push(warning.clone());
                }
            }

            let start = Instant::now();
            let adapter = entry.adapter.clone();
            let result = entry
                .pool
                .execute_with_failover(|credential| {
                    let built = &built;
                    let adapter = adapter.clone();
                    async move { adapter.generate(built, &credential, cancel).await }
                })
                .await;
            let latency_ms = start.elapsed().as_millis() as u64;

            let generation = match result {
                Ok(generation) => generation,
                Err(err) => {
                    self.metrics
                        .record_provider(name, false, latency_ms, None)
                        .await;
                    return Err(err);
                }
            };

            self.metrics
                .record_provider(name, true, latency_ms, generation.usage.as_ref())
                .await;
            if let Some(model) = &generation.model {
                self.metrics
                    .record_model(name, model, latency_ms, generation.usage.as_ref())
                    .await;
            }

            // Fence stripping is idempotent; adapters may already have run it.
            let code = crate::language::strip_code_fences(&generation.code);
            if !validate {
                return Ok(code);
            }
            let Some(validator) = validator_for_language(&built.language) else {
                return Ok(code);
            };

            let report = validator.validate(&code, output_path);
            if report.valid {
                return Ok(code);
            }

            if validator.can_auto_fix() {
                if let Some(fixed) = validator.auto_fix(&code) {
                    if validator.validate(&fixed, output_path).valid {
                        warnings.push(format!(
                            "{name} output was auto-fixed after a validation failure"
                        ));
                        return Ok(fixed);
                    }
                }
            }

            last_failure = format_errors(&built.language, &report.errors);
            tracing::debug!(
                provider = %name,
                attempt,
                errors = report.errors.len(),
                "generated code failed validation"
            );
            // The retry prompt is always the original instruction plus the
            // latest diagnostics, never a chain of feedback blocks.
            current_instruction =
                format!("{instruction}\n\nPREVIOUS ATTEMPT FAILED:\n{last_failure}\n\nFix the code.");
        }

        Err(ProviderError::Validation(last_failure))
    }
}
