//! Per-provider credential pool with round-robin rotation and exponential
//! backoff.
//!
//! A pool hands out one credential per call, absorbs transient failures by
//! rotating to the next healthy key, and tracks health so a repeatedly
//! failing key sits out for `min(2^(failures-1), 60)` seconds.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::error::{backoff_for_failures, ProviderError};
use crate::providers::Credential;

/// Consecutive failures after which a key is marked unhealthy.
const UNHEALTHY_THRESHOLD: u32 = 3;

/// Maximum credentials tried by one `execute_with_failover` call.
const MAX_FAILOVER_ATTEMPTS: usize = 3;

/// Health state for a single credential.
#[derive(Debug, Clone, Default)]
pub struct KeyHealth {
    /// Consecutive failures since the last success.
    pub failures: u32,
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_success_at: Option<chrono::DateTime<chrono::Utc>>,
    /// False once `failures` reaches the unhealthy threshold; true again on
    /// the next success.
    pub healthy: bool,
    /// The credential is unselectable until this instant.
    pub backoff_until: Option<Instant>,
}

impl KeyHealth {
    fn new() -> Self {
        Self {
            healthy: true,
            ..Self::default()
        }
    }

    pub fn is_available(&self, now: Instant) -> bool {
        self.backoff_until.map(|until| now >= until).unwrap_or(true)
    }
}

/// Ordered credential pool for one provider. Key order is stable; selection
/// rotates via an atomic cursor and skips keys in backoff.
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<Credential>,
    cursor: AtomicUsize,
    health: RwLock<Vec<KeyHealth>>,
}

impl KeyPool {
    pub fn new(keys: Vec<Credential>) -> Self {
        let health = keys.iter().map(|_| KeyHealth::new()).collect();
        Self {
            keys,
            cursor: AtomicUsize::new(0),
            health: RwLock::new(health),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Pick the next selectable credential.
    ///
    /// Advances the round-robin cursor and scans at most `len` positions
    /// from there, returning the first key whose backoff has elapsed. A
    /// single-key pool skips the cursor but still honors backoff.
    pub async fn next(&self) -> Result<Credential, ProviderError> {
        if self.keys.is_empty() {
            return Err(ProviderError::EmptyPool);
        }

        let now = Instant::now();
        let health = self.health.read().await;

        if self.keys.len() == 1 {
            return if health[0].is_available(now) {
                Ok(self.keys[0].clone())
            } else {
                Err(ProviderError::AllKeysUnavailable)
            };
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        for offset in 0..self.keys.len() {
            let index = (start + offset) % self.keys.len();
            if health[index].is_available(now) {
                return Ok(self.keys[index].clone());
            }
        }
        Err(ProviderError::AllKeysUnavailable)
    }

    /// Clear failure state for a credential. Unknown credentials are a no-op.
    pub async fn report_success(&self, credential: &Credential) {
        let Some(index) = self.index_of(credential) else {
            return;
        };
        let mut health = self.health.write().await;
        let entry = &mut health[index];
        entry.failures = 0;
        entry.backoff_until = None;
        entry.healthy = true;
        entry.last_success_at = Some(chrono::Utc::now());
    }

    /// Record a failure and put the credential into exponential backoff.
    /// Unknown credentials are a no-op.
    pub async fn report_failure(&self, credential: &Credential, error: &ProviderError) {
        let Some(index) = self.index_of(credential) else {
            return;
        };
        let mut health = self.health.write().await;
        let entry = &mut health[index];
        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure_at = Some(chrono::Utc::now());
        let backoff = backoff_for_failures(entry.failures);
        entry.backoff_until = Some(Instant::now() + backoff);
        if entry.failures >= UNHEALTHY_THRESHOLD {
            entry.healthy = false;
            tracing::warn!(
                failures = entry.failures,
                backoff_secs = backoff.as_secs(),
                error = %error,
                "credential marked unhealthy"
            );
        } else {
            tracing::debug!(
                failures = entry.failures,
                backoff_secs = backoff.as_secs(),
                "credential placed in backoff"
            );
        }
    }

    /// Health snapshot for one credential position (used by tests and
    /// metrics reporting).
    pub async fn health_at(&self, index: usize) -> Option<KeyHealth> {
        self.health.read().await.get(index).cloned()
    }

    /// Run `op` with up to `min(pool_size, 3)` credentials, rotating on
    /// failure. Success and failure are reported back to the pool. Content
    /// filtering and cancellation end the call immediately; they say nothing
    /// about the key. The final error wraps the last underlying cause.
    pub async fn execute_with_failover<T, F, Fut>(&self, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.keys.len().min(MAX_FAILOVER_ATTEMPTS).max(1);
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..attempts {
            let credential = match self.next().await {
                Ok(credential) => credential,
                Err(err) => {
                    // No candidate left; report what we have.
                    return Err(match last_error {
                        Some(last) if attempt > 1 => ProviderError::FailoverExhausted {
                            attempts: attempt,
                            last: Box::new(last),
                        },
                        Some(last) => last,
                        None => err,
                    });
                }
            };

            match op(credential.clone()).await {
                Ok(value) => {
                    self.report_success(&credential).await;
                    return Ok(value);
                }
                Err(err) => {
                    if err.counts_against_credential() {
                        self.report_failure(&credential, &err).await;
                    }
                    if matches!(err, ProviderError::ContentFiltered(_) | ProviderError::Cancelled) {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }

        let last = last_error.unwrap_or(ProviderError::AllKeysUnavailable);
        if attempts == 1 {
            // A single-credential pool has nothing to wrap.
            return Err(last);
        }
        Err(ProviderError::FailoverExhausted {
            attempts,
            last: Box::new(last),
        })
    }

    fn index_of(&self, credential: &Credential) -> Option<usize> {
        self.keys.iter().position(|k| k == credential)
    }
}

/// Shared pool handle.
pub type SharedKeyPool = Arc<KeyPool>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool_of(keys: &[&str]) -> KeyPool {
        KeyPool::new(keys.iter().map(|k| Credential::api_key(*k)).collect())
    }

    fn key_name(credential: &Credential) -> String {
        match credential {
            Credential::ApiKey(k) => k.clone(),
            Credential::OAuth => "oauth".to_string(),
        }
    }

    #[tokio::test]
    async fn round_robin_covers_every_key_evenly() {
        let pool = pool_of(&["K1", "K2", "K3"]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let key = pool.next().await.unwrap();
            *counts.entry(key_name(&key)).or_default() += 1;
        }
        assert_eq!(counts["K1"], 10);
        assert_eq!(counts["K2"], 10);
        assert_eq!(counts["K3"], 10);
    }

    #[tokio::test]
    async fn empty_pool_is_a_permanent_error() {
        let pool = KeyPool::new(Vec::new());
        assert!(matches!(pool.next().await, Err(ProviderError::EmptyPool)));
    }

    #[tokio::test]
    async fn failed_key_sits_out_and_the_other_takes_over() {
        // S2: success with K1, two failures on K1, next selections pick K2.
        let pool = pool_of(&["K1", "K2"]);
        let k1 = Credential::api_key("K1");

        pool.report_success(&k1).await;
        let err = ProviderError::transport(Some(500), "boom");
        pool.report_failure(&k1, &err).await;
        pool.report_failure(&k1, &err).await;

        let third = pool.next().await.unwrap();
        assert_eq!(key_name(&third), "K2");
        let fourth = pool.next().await.unwrap();
        assert_eq!(key_name(&fourth), "K2");

        // Second consecutive failure puts K1 out for min(2^1, 60) = 2s.
        let health = pool.health_at(0).await.unwrap();
        let remaining = health
            .backoff_until
            .unwrap()
            .duration_since(Instant::now());
        assert!(remaining <= std::time::Duration::from_secs(2));
        assert!(remaining > std::time::Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn success_resets_failure_count_and_backoff() {
        let pool = pool_of(&["K1"]);
        let k1 = Credential::api_key("K1");
        let err = ProviderError::transport(None, "net down");

        pool.report_failure(&k1, &err).await;
        pool.report_failure(&k1, &err).await;
        pool.report_failure(&k1, &err).await;
        let health = pool.health_at(0).await.unwrap();
        assert_eq!(health.failures, 3);
        assert!(!health.healthy);

        pool.report_success(&k1).await;
        let health = pool.health_at(0).await.unwrap();
        assert_eq!(health.failures, 0);
        assert!(health.healthy);
        assert!(health.backoff_until.is_none());
    }

    #[tokio::test]
    async fn single_key_pool_honors_backoff() {
        let pool = pool_of(&["K1"]);
        let k1 = Credential::api_key("K1");
        assert!(pool.next().await.is_ok());

        pool.report_failure(&k1, &ProviderError::transport(None, "x"))
            .await;
        assert!(matches!(
            pool.next().await,
            Err(ProviderError::AllKeysUnavailable)
        ));
    }

    #[tokio::test]
    async fn reporting_unknown_credential_is_a_noop() {
        let pool = pool_of(&["K1"]);
        let stranger = Credential::api_key("not-in-pool");
        pool.report_failure(&stranger, &ProviderError::transport(None, "x"))
            .await;
        assert!(pool.next().await.is_ok());
    }

    #[tokio::test]
    async fn failover_rotates_to_a_working_key() {
        let pool = pool_of(&["bad", "good"]);
        let result = pool
            .execute_with_failover(|credential| async move {
                match credential {
                    Credential::ApiKey(ref k) if k == "good" => Ok("done"),
                    _ => Err(ProviderError::transport(Some(503), "unavailable")),
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn failover_wraps_the_last_cause() {
        let pool = pool_of(&["K1", "K2", "K3", "K4"]);
        let result: Result<(), _> = pool
            .execute_with_failover(|_| async {
                Err(ProviderError::transport(Some(502), "bad gateway"))
            })
            .await;
        match result {
            Err(ProviderError::FailoverExhausted { attempts, last }) => {
                assert_eq!(attempts, 3); // capped at min(pool, 3)
                assert!(matches!(
                    *last,
                    ProviderError::Transport {
                        status: Some(502),
                        ..
                    }
                ));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn content_filter_does_not_blame_the_key() {
        let pool = pool_of(&["K1", "K2"]);
        let result: Result<(), _> = pool
            .execute_with_failover(|_| async {
                Err(ProviderError::ContentFiltered("safety".into()))
            })
            .await;
        assert!(matches!(result, Err(ProviderError::ContentFiltered(_))));
        let health = pool.health_at(0).await.unwrap();
        assert_eq!(health.failures, 0);
    }
}
