//! Error types for the routing and write pipeline.
//!
//! Provider-level errors distinguish failures that should rotate to the next
//! credential or provider from failures that end the request for a provider
//! outright (content filtering, cancellation). The write controller has its
//! own error surface so that only argument, backup, filesystem and terminal
//! routing failures ever reach the client.

use std::time::Duration;

/// Error from a provider adapter or its key pool.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No API key or OAuth material configured for this provider.
    #[error("no credentials configured")]
    NoCredential,

    /// The provider's key pool has no credentials at all.
    #[error("credential pool is empty")]
    EmptyPool,

    /// Every credential in the pool is in backoff.
    #[error("all credentials are in backoff")]
    AllKeysUnavailable,

    /// Network error or non-2xx status from the provider.
    #[error("transport failure{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// Quota exhaustion (HTTP 429, or a pre-flight credit check saying so).
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// An access token needed refreshing and the refresh failed.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// The provider blocked the response for safety reasons.
    #[error("content filtered by provider: {0}")]
    ContentFiltered(String),

    /// The generated code failed syntax validation after all retries.
    #[error("validation failed:\n{0}")]
    Validation(String),

    /// The response body could not be parsed.
    #[error("unexpected response shape: {0}")]
    Parse(String),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Every failover attempt within one provider call failed.
    #[error("all {attempts} credential attempts failed: {last}")]
    FailoverExhausted {
        attempts: usize,
        #[source]
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    /// Whether the router should stop retrying this provider and fall
    /// through to the next one. Validation failures are the only kind the
    /// router retries with feedback.
    pub fn aborts_provider(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }

    /// Whether the key pool should keep the current credential out of the
    /// blame path. Content filtering and cancellation say nothing about the
    /// credential's health.
    pub fn counts_against_credential(&self) -> bool {
        !matches!(self, Self::ContentFiltered(_) | Self::Cancelled)
    }
}

/// Map an HTTP status code from a provider into the matching error.
pub fn error_for_status(status: u16, body: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited(body),
        401 | 403 => ProviderError::transport(Some(status), body),
        _ => ProviderError::transport(Some(status), body),
    }
}

/// Map a reqwest error into a transport failure, keeping timeout/connect
/// detail in the message.
pub fn error_for_request(err: reqwest::Error) -> ProviderError {
    let message = if err.is_timeout() {
        format!("request timeout: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        format!("request failed: {err}")
    };
    ProviderError::transport(err.status().map(|s| s.as_u16()), message)
}

/// One entry of the terminal failure report: which provider was tried and
/// why it failed.
#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider: String,
    pub reason: String,
}

/// Error from the router, after the full preference list was walked.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Every enabled, credentialed provider failed (or none exist).
    #[error("{}", format_all_failed(.attempts))]
    AllProvidersFailed { attempts: Vec<ProviderAttempt> },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

fn format_all_failed(attempts: &[ProviderAttempt]) -> String {
    if attempts.is_empty() {
        return "all providers failed or no API keys configured".to_string();
    }
    let mut out =
        String::from("all providers failed or no API keys configured; attempted providers:");
    for attempt in attempts {
        out.push_str(&format!("\n  - {}: {}", attempt.provider, attempt.reason));
    }
    out
}

/// Error from the write controller, the only errors a client ever sees.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// A tool argument was missing or had the wrong type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `restore_previous` was requested but no backup exists for the path.
    #[error("no backup available for {0}")]
    BackupMissing(String),

    /// Reading, writing or renaming a file failed.
    #[error("filesystem error on {path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The router exhausted its preference list.
    #[error("{source}{}", format_warnings(.warnings))]
    Routing {
        #[source]
        source: RouteError,
        warnings: Vec<String>,
    },
}

fn format_warnings(warnings: &[String]) -> String {
    if warnings.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nwarnings:");
    for warning in warnings {
        out.push_str(&format!("\n  - {warning}"));
    }
    out
}

/// Backoff interval after the k-th consecutive failure: min(2^(k-1), 60) s.
pub fn backoff_for_failures(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exp).min(60))
}
