//! Request metrics: per-provider and per-model counters, rolling latency
//! percentiles, and token totals.
//!
//! Per-model metrics are keyed `"<provider>:<model>"`. Percentiles are
//! computed over a rolling window of the most recent samples.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::providers::TokenUsage;

/// Number of latency samples kept per rolling window.
const LATENCY_WINDOW: usize = 1000;

/// Fixed-capacity ring of latency samples.
#[derive(Debug, Clone)]
pub struct LatencyWindowTracker {
    samples: Vec<u64>,
    next: usize,
    filled: bool,
}

impl Default for LatencyWindowTracker {
    fn default() -> Self {
        Self {
            samples: Vec::with_capacity(LATENCY_WINDOW),
            next: 0,
            filled: false,
        }
    }
}

impl LatencyWindowTracker {
    pub fn record(&mut self, latency_ms: u64) {
        if self.samples.len() < LATENCY_WINDOW && !self.filled {
            self.samples.push(latency_ms);
            if self.samples.len() == LATENCY_WINDOW {
                self.filled = true;
            }
        } else {
            self.samples[self.next] = latency_ms;
        }
        self.next = (self.next + 1) % LATENCY_WINDOW;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Percentile over the current window, `p` in 0.0..=100.0.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }
}

/// Counters for one provider or one provider:model pair.
#[derive(Debug, Clone, Default)]
struct EndpointMetrics {
    requests: u64,
    successes: u64,
    failures: u64,
    total_latency_ms: u64,
    window: LatencyWindowTracker,
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
}

impl EndpointMetrics {
    fn record(&mut self, success: bool, latency_ms: u64, usage: Option<&TokenUsage>) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_latency_ms += latency_ms;
        self.window.record(latency_ms);
        if let Some(usage) = usage {
            self.input_tokens += usage.input_tokens;
            self.output_tokens += usage.output_tokens;
            self.total_tokens += usage.total_tokens;
        }
    }
}

/// Serializable view of one endpoint's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: Option<f64>,
    pub p50_latency_ms: Option<u64>,
    pub p95_latency_ms: Option<u64>,
    pub p99_latency_ms: Option<u64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl From<&EndpointMetrics> for MetricsSnapshot {
    fn from(metrics: &EndpointMetrics) -> Self {
        Self {
            requests: metrics.requests,
            successes: metrics.successes,
            failures: metrics.failures,
            avg_latency_ms: if metrics.requests > 0 {
                Some(metrics.total_latency_ms as f64 / metrics.requests as f64)
            } else {
                None
            },
            p50_latency_ms: metrics.window.percentile(50.0),
            p95_latency_ms: metrics.window.percentile(95.0),
            p99_latency_ms: metrics.window.percentile(99.0),
            input_tokens: metrics.input_tokens,
            output_tokens: metrics.output_tokens,
            total_tokens: metrics.total_tokens,
        }
    }
}

/// Thread-safe tracker shared between the router and metrics readers.
#[derive(Debug, Clone, Default)]
pub struct MetricsTracker {
    providers: Arc<RwLock<HashMap<String, EndpointMetrics>>>,
    models: Arc<RwLock<HashMap<String, EndpointMetrics>>>,
    overall: Arc<RwLock<LatencyWindowTracker>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one adapter call against the provider tracker.
    pub async fn record_provider(
        &self,
        provider: &str,
        success: bool,
        latency_ms: u64,
        usage: Option<&TokenUsage>,
    ) {
        let mut providers = self.providers.write().await;
        providers
            .entry(provider.to_string())
            .or_default()
            .record(success, latency_ms, usage);
    }

    /// Record a successful call against the `"<provider>:<model>"` tracker.
    pub async fn record_model(
        &self,
        provider: &str,
        model: &str,
        latency_ms: u64,
        usage: Option<&TokenUsage>,
    ) {
        let mut models = self.models.write().await;
        models
            .entry(format!("{provider}:{model}"))
            .or_default()
            .record(true, latency_ms, usage);
    }

    /// Record overall latency for a successful request.
    pub async fn record_overall(&self, latency_ms: u64) {
        self.overall.write().await.record(latency_ms);
    }

    pub async fn provider_snapshot(&self, provider: &str) -> Option<MetricsSnapshot> {
        self.providers.read().await.get(provider).map(Into::into)
    }

    pub async fn model_snapshot(&self, key: &str) -> Option<MetricsSnapshot> {
        self.models.read().await.get(key).map(Into::into)
    }

    pub async fn all_providers(&self) -> HashMap<String, MetricsSnapshot> {
        self.providers
            .read()
            .await
            .iter()
            .map(|(name, m)| (name.clone(), m.into()))
            .collect()
    }

    pub async fn overall_p50(&self) -> Option<u64> {
        self.overall.read().await.percentile(50.0)
    }
}
