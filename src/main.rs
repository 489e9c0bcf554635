//! mcp-code-api entry point.
//!
//! Default mode serves MCP over stdio. `login <provider>` runs the
//! interactive OAuth flow for a provider and persists the tokens, so the
//! server can be used headless afterwards.

use mcp_code_api::config::{Config, ConfigStore};
use mcp_code_api::oauth::{self, OAuthClient, OAuthConfig};
use mcp_code_api::router::Router;
use mcp_code_api::server;
use mcp_code_api::write_tool::WriteController;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging() {
    // Stdout carries the protocol; all logging goes to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_code_api=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let mut args = std::env::args().skip(1);
    let mode = args.next();

    let config_path = Config::default_path();
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "startup failed");
            std::process::exit(1);
        }
    };
    let store = ConfigStore::new(config_path);

    match mode.as_deref() {
        None => {
            let router = Router::from_config(config, store);
            if router.effective_order().is_empty() {
                error!("no enabled provider has credentials; run the setup or set an API key");
                std::process::exit(1);
            }
            info!(providers = ?router.effective_order(), "serving MCP over stdio");
            let controller = WriteController::new(Arc::new(router));
            if let Err(err) = server::serve(controller).await {
                error!(error = %err, "server terminated");
                std::process::exit(1);
            }
        }
        Some("login") => {
            let provider = args.next().unwrap_or_else(|| "gemini".to_string());
            if let Err(err) = login(&provider, &config, &store).await {
                error!(error = %err, provider = %provider, "login failed");
                std::process::exit(1);
            }
        }
        Some(other) => {
            eprintln!("unknown mode '{other}'; usage: mcp-code-api [login <provider>]");
            std::process::exit(1);
        }
    }
}

/// Run the interactive PKCE flow for `provider` and persist the tokens into
/// the YAML configuration.
async fn login(provider: &str, config: &Config, store: &ConfigStore) -> anyhow::Result<()> {
    let settings = config
        .provider(provider)
        .ok_or_else(|| anyhow::anyhow!("provider '{provider}' is not configured"))?;
    let oauth_settings = settings
        .oauth
        .as_ref()
        .filter(|o| !o.client_id.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!("provider '{provider}' has no oauth client_id in the config")
        })?;

    let oauth_config = match provider {
        "gemini" => OAuthConfig {
            client_id: oauth_settings.client_id.clone(),
            client_secret: oauth_settings.client_secret.clone(),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec![
                "https://www.googleapis.com/auth/cloud-platform".to_string(),
                "https://www.googleapis.com/auth/userinfo.email".to_string(),
            ],
        },
        other => anyhow::bail!("interactive login is not supported for '{other}'"),
    };

    // With a passphrase set, tokens also land in the encrypted file store;
    // otherwise the YAML persistence below is the only copy kept.
    let storage: Arc<dyn oauth::TokenStorage> =
        match std::env::var("MCP_CODE_API_TOKEN_PASSPHRASE") {
            Ok(passphrase) if !passphrase.trim().is_empty() => {
                let dir = store
                    .path()
                    .parent()
                    .map(|p| p.join("tokens"))
                    .unwrap_or_else(|| "tokens".into());
                Arc::new(oauth::EncryptedFileTokenStorage::new(dir, &passphrase))
            }
            _ => Arc::new(oauth::MemoryTokenStorage::new()),
        };

    let client = OAuthClient::new(provider, oauth_config, storage);
    let tokens = client.authorize_interactive(&CancellationToken::new()).await?;
    store
        .persist_oauth_tokens(
            provider,
            &tokens.access_token,
            &tokens.refresh_token,
            tokens.expires_at,
        )
        .await?;
    println!("Authorized {provider}; tokens saved to {}", store.path().display());
    Ok(())
}
