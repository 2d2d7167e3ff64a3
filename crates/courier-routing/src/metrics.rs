//! Metrics collection for routing
//!
//! Counters are keyed by outcome only, never by exchange or message id, so
//! cardinality stays fixed regardless of traffic.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Snapshot of routing counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RoutingMetrics {
    /// Exchanges that entered a route
    pub exchanges_total: u64,
    /// Exchanges that left a route still failed
    pub failures_total: u64,
    /// Redelivery attempts scheduled
    pub redeliveries_total: u64,
    /// Exchanges whose redeliveries ran out
    pub exhausted_total: u64,
    /// Exchanges delivered to a dead-letter destination
    pub dead_lettered_total: u64,
    /// Failures marked handled
    pub handled_total: u64,
    /// Duplicates detected by idempotent consumers
    pub duplicates_total: u64,
    /// Route processing latency
    pub latency_ms: LatencyStats,
}

/// Latency statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Shared metrics collector; clones record into the same counters
#[derive(Clone)]
pub struct RoutingMetricsCollector {
    metrics: Arc<RwLock<RoutingMetrics>>,
    latency_samples: Arc<RwLock<Vec<u64>>>,
    max_samples: usize,
}

impl RoutingMetricsCollector {
    pub fn new(max_samples: usize) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(RoutingMetrics::default())),
            latency_samples: Arc::new(RwLock::new(Vec::new())),
            max_samples,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(1000)
    }

    pub async fn record_exchange(&self, failed: bool) {
        let mut metrics = self.metrics.write().await;
        metrics.exchanges_total = metrics.exchanges_total.saturating_add(1);
        if failed {
            metrics.failures_total = metrics.failures_total.saturating_add(1);
        }
    }

    pub async fn record_redelivery(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.redeliveries_total = metrics.redeliveries_total.saturating_add(1);
    }

    pub async fn record_exhausted(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.exhausted_total = metrics.exhausted_total.saturating_add(1);
    }

    pub async fn record_dead_lettered(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.dead_lettered_total = metrics.dead_lettered_total.saturating_add(1);
    }

    pub async fn record_handled(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.handled_total = metrics.handled_total.saturating_add(1);
    }

    pub async fn record_duplicate(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.duplicates_total = metrics.duplicates_total.saturating_add(1);
    }

    pub async fn record_latency(&self, duration: Duration) {
        let mut samples = self.latency_samples.write().await;
        samples.push(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));

        if samples.len() > self.max_samples {
            let drain_count = samples.len() - self.max_samples;
            samples.drain(0..drain_count);
        }

        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_unstable();

        let Some(max) = sorted.last().copied() else {
            return;
        };
        let at = |quantile: f64| {
            let idx = ((sorted.len() as f64 * quantile) as usize).min(sorted.len() - 1);
            sorted[idx] as f64
        };

        let mut metrics = self.metrics.write().await;
        metrics.latency_ms.p50 = at(0.50);
        metrics.latency_ms.p95 = at(0.95);
        metrics.latency_ms.p99 = at(0.99);
        metrics.latency_ms.max = max as f64;
    }

    pub fn start_timer(&self) -> LatencyTimer {
        LatencyTimer {
            start: Instant::now(),
            collector: self.clone(),
        }
    }

    pub async fn snapshot(&self) -> RoutingMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn reset(&self) {
        *self.metrics.write().await = RoutingMetrics::default();
        self.latency_samples.write().await.clear();
    }
}

impl Default for RoutingMetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Measures the time from creation to [`LatencyTimer::stop`]
pub struct LatencyTimer {
    start: Instant,
    collector: RoutingMetricsCollector,
}

impl LatencyTimer {
    pub async fn stop(self) {
        self.collector.record_latency(self.start.elapsed()).await;
    }
}
