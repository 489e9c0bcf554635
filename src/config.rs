//! Configuration loading and persistence.
//!
//! The configuration lives in a YAML file (default
//! `~/.mcp-code-api/config.yaml`) and is read-only after startup except for
//! two writers: OAuth token refresh and Gemini onboarding, both of which go
//! through [`ConfigStore::update`]. Environment variables override scalar
//! fields after the file is parsed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Invalid {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cannot write config file {path}: {source}")]
    Unwritable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Model-selection strategy for providers with multiple models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelStrategy {
    /// Stick with the first model; rotate only after a failure.
    #[default]
    Failover,
    RoundRobin,
    Random,
}

/// OAuth material for a provider (currently Gemini via Cloud Code).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthSettings {
    pub client_id: String,
    /// Empty for public clients.
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl OAuthSettings {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.refresh_token.is_empty()
    }
}

/// Settings for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model_strategy: ModelStrategy,
    /// Append `:free` to model names (OpenRouter).
    #[serde(default)]
    pub free_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// `HTTP-Referer` header value (OpenRouter).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,
    /// `X-Title` header value (OpenRouter).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
    /// Google Cloud project id, persisted by onboarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl ProviderSettings {
    /// Normalized API-key list: `api_keys` if present, else `api_key`.
    /// Order is preserved; it drives round-robin position.
    pub fn key_list(&self) -> Vec<String> {
        if let Some(keys) = &self.api_keys {
            keys.iter().filter(|k| !k.is_empty()).cloned().collect()
        } else {
            self.api_key
                .iter()
                .filter(|k| !k.is_empty())
                .cloned()
                .collect()
        }
    }

    pub fn has_oauth(&self) -> bool {
        self.oauth
            .as_ref()
            .map(|o| o.is_configured())
            .unwrap_or(false)
    }

    /// Whether any credential (API key or OAuth material) is configured.
    pub fn has_credentials(&self) -> bool {
        !self.key_list().is_empty() || self.has_oauth()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Providers to try, in order. Empty means the built-in default order.
    #[serde(default)]
    pub preferred_order: Vec<String>,
    /// Providers allowed to serve requests.
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

impl Config {
    /// Default config path: `~/.mcp-code-api/config.yaml`, overridable with
    /// `MCP_CODE_API_CONFIG`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("MCP_CODE_API_CONFIG") {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        PathBuf::from(home).join(".mcp-code-api").join("config.yaml")
    }

    /// Parse the file at `path` and apply environment overrides. A missing
    /// file yields an empty config; environment variables may still supply
    /// credentials.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => {
                serde_yaml::from_str::<Config>(&contents).map_err(|source| ConfigError::Invalid {
                    path: path.display().to_string(),
                    source,
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(source) => {
                return Err(ConfigError::Unreadable {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables override scalar provider fields.
    pub fn apply_env_overrides(&mut self) {
        let overrides: &[(&str, &str, fn(&mut ProviderSettings, String))] = &[
            ("ANTHROPIC_AUTH_TOKEN", "anthropic", set_api_key),
            ("ANTHROPIC_BASE_URL", "anthropic", set_base_url),
            ("CEREBRAS_API_KEY", "cerebras", set_api_key),
            ("CEREBRAS_BASE_URL", "cerebras", set_base_url),
            ("OPENROUTER_API_KEY", "openrouter", set_api_key),
            ("OPENROUTER_BASE_URL", "openrouter", set_base_url),
            ("GEMINI_API_KEY", "gemini", set_api_key),
            ("GOOGLE_CLOUD_PROJECT", "gemini", set_project_id),
        ];
        for (var, provider, apply) in overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    let settings = self.providers.entry(provider.to_string()).or_default();
                    apply(settings, value);
                }
            }
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.get(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.iter().any(|e| e == name)
    }
}

fn set_api_key(settings: &mut ProviderSettings, value: String) {
    settings.api_key = Some(value);
}

fn set_base_url(settings: &mut ProviderSettings, value: String) {
    settings.base_url = Some(value);
}

fn set_project_id(settings: &mut ProviderSettings, value: String) {
    settings.project_id = Some(value);
}

/// Serialized access to the configuration file on disk.
///
/// Both in-process writers (token refresh, onboarding persistence) go
/// through `update`, which holds the per-file mutex across the whole
/// read-parse-modify-marshal-write cycle, takes an advisory file lock
/// against other processes, and replaces the file atomically via a temp
/// file and rename with mode 0600. The generic-document rewrite drops
/// comments and key order; field semantics survive the round-trip.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, let `mutate` edit the generic YAML document, and write back
    /// atomically. The document is created empty when the file is missing.
    pub async fn update<F>(&self, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut serde_yaml::Value),
    {
        let _guard = self.lock.lock().await;

        let mut document = match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                serde_yaml::from_str(&contents).map_err(|source| ConfigError::Invalid {
                    path: self.path.display().to_string(),
                    source,
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                serde_yaml::Value::Mapping(Default::default())
            }
            Err(source) => {
                return Err(ConfigError::Unreadable {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        if document.is_null() {
            document = serde_yaml::Value::Mapping(Default::default());
        }
        mutate(&mut document);
        let serialized = serde_yaml::to_string(&document)?;
        self.write_atomic(&serialized)
    }

    fn write_atomic(&self, contents: &str) -> Result<(), ConfigError> {
        use fs2::FileExt;
        use std::io::Write;

        let unwritable = |source: std::io::Error| ConfigError::Unwritable {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(unwritable)?;
        }

        let tmp_path = self.path.with_extension("yaml.tmp");
        {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp_path).map_err(unwritable)?;
            file.lock_exclusive().map_err(unwritable)?;
            file.write_all(contents.as_bytes()).map_err(unwritable)?;
            file.sync_all().map_err(unwritable)?;
            let _ = FileExt::unlock(&file);
        }
        std::fs::rename(&tmp_path, &self.path).map_err(unwritable)?;
        Ok(())
    }

    /// Persist refreshed OAuth tokens under `providers.<name>.oauth`.
    pub async fn persist_oauth_tokens(
        &self,
        provider: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> Result<(), ConfigError> {
        let provider = provider.to_string();
        let access_token = access_token.to_string();
        let refresh_token = refresh_token.to_string();
        self.update(move |document| {
            let section = provider_section(document, &provider);
            let oauth = section
                .entry(yaml_str("oauth"))
                .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
            if !oauth.is_mapping() {
                *oauth = serde_yaml::Value::Mapping(Default::default());
            }
            if let serde_yaml::Value::Mapping(oauth) = oauth {
                oauth.insert(yaml_str("access_token"), yaml_str(&access_token));
                if !refresh_token.is_empty() {
                    oauth.insert(yaml_str("refresh_token"), yaml_str(&refresh_token));
                }
                oauth.insert(
                    yaml_str("expires_at"),
                    serde_yaml::Value::Number(expires_at.into()),
                );
            }
        })
        .await
    }

    /// Persist the onboarded Google Cloud project id under
    /// `providers.<name>.project_id`.
    pub async fn persist_project_id(
        &self,
        provider: &str,
        project_id: &str,
    ) -> Result<(), ConfigError> {
        let provider = provider.to_string();
        let project_id = project_id.to_string();
        self.update(move |document| {
            provider_section(document, &provider)
                .insert(yaml_str("project_id"), yaml_str(&project_id));
        })
        .await
    }
}

fn yaml_str(value: &str) -> serde_yaml::Value {
    serde_yaml::Value::String(value.to_string())
}

/// Navigate to `providers.<name>` in the generic document, creating the
/// intermediate mappings as needed.
fn provider_section<'a>(
    document: &'a mut serde_yaml::Value,
    provider: &str,
) -> &'a mut serde_yaml::Mapping {
    if !document.is_mapping() {
        *document = serde_yaml::Value::Mapping(Default::default());
    }
    let root = document.as_mapping_mut().expect("document is a mapping");
    let providers = root
        .entry(yaml_str("providers"))
        .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
    if !providers.is_mapping() {
        *providers = serde_yaml::Value::Mapping(Default::default());
    }
    let providers = providers.as_mapping_mut().expect("providers is a mapping");
    let section = providers
        .entry(yaml_str(provider))
        .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
    if !section.is_mapping() {
        *section = serde_yaml::Value::Mapping(Default::default());
    }
    section.as_mapping_mut().expect("provider is a mapping")
}
