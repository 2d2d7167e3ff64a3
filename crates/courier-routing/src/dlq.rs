//! In-memory dead letter queue
//!
//! Stores exchanges that exhausted redelivery, with TTL and volume limits.
//! A [`DeadLetterQueue`] is both a [`Processor`] (so it can be the target of a
//! dead letter channel) and an [`Endpoint`] registered as `dlq:<name>`.

use courier_core::{
    BoxError, CourierResult, Endpoint, Exchange, ExchangeId, Message, Processor, PropertyKey,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Configuration for a dead letter queue
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Maximum number of entries kept; the oldest is dropped beyond this
    pub max_size: usize,
    /// How long an entry is kept before cleanup removes it
    pub ttl: Duration,
    /// When false, dead-lettered exchanges are dropped
    pub enabled: bool,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            ttl: Duration::from_secs(86_400),
            enabled: true,
        }
    }
}

/// A dead-lettered message with the context of its failure
#[derive(Debug, Clone, Serialize)]
pub struct DlqEntry {
    pub exchange_id: ExchangeId,
    pub message: Message,
    pub from_endpoint: Option<String>,
    pub failure_reason: String,
    pub redeliveries: i64,
    pub added_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn from_exchange(exchange: &Exchange, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            exchange_id: exchange.id(),
            message: exchange.in_message().copy(),
            from_endpoint: exchange.from_endpoint().map(str::to_string),
            failure_reason: exchange
                .caught_exception()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string()),
            redeliveries: exchange
                .property_as::<i64>(PropertyKey::RedeliveryCounter)
                .unwrap_or(0),
            added_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Statistics for a dead letter queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStats {
    pub current_size: usize,
    pub total_added: u64,
    pub total_removed: u64,
    pub total_expired: u64,
    pub total_dropped: u64,
}

/// Dead letter queue; clones share the same storage
#[derive(Clone)]
pub struct DeadLetterQueue {
    uri: String,
    config: DlqConfig,
    queue: Arc<RwLock<VecDeque<DlqEntry>>>,
    stats: Arc<RwLock<DlqStats>>,
}

impl DeadLetterQueue {
    /// A `max_size` of 0 is raised to 1
    pub fn new(name: &str, mut config: DlqConfig) -> Self {
        let uri = format!("dlq:{}", name);
        if config.max_size == 0 {
            warn!(uri = %uri, "DLQ max_size of 0 raised to 1");
            config.max_size = 1;
        }
        Self {
            uri,
            config,
            queue: Arc::new(RwLock::new(VecDeque::new())),
            stats: Arc::new(RwLock::new(DlqStats::default())),
        }
    }

    pub fn with_defaults(name: &str) -> Self {
        Self::new(name, DlqConfig::default())
    }

    /// Stores a snapshot of `exchange`
    pub async fn add(&self, exchange: &Exchange) {
        if !self.config.enabled {
            debug!(uri = %self.uri, exchange_id = %exchange.id(), "DLQ disabled, dropping exchange");
            return;
        }

        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;

        while queue.len() >= self.config.max_size {
            let Some(dropped) = queue.pop_front() else {
                break;
            };
            warn!(uri = %self.uri, exchange_id = %dropped.exchange_id, "DLQ size limit reached, dropping oldest entry");
            stats.total_dropped += 1;
        }

        queue.push_back(DlqEntry::from_exchange(exchange, self.config.ttl));
        stats.total_added += 1;
        stats.current_size = queue.len();

        debug!(uri = %self.uri, exchange_id = %exchange.id(), size = queue.len(), "added exchange to DLQ");
    }

    pub async fn list(&self) -> Vec<DlqEntry> {
        self.queue.read().await.iter().cloned().collect()
    }

    /// Removes and returns up to `limit` of the oldest entries, for replay
    pub async fn take(&self, limit: usize) -> Vec<DlqEntry> {
        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;

        let count = limit.min(queue.len());
        let taken: Vec<DlqEntry> = queue.drain(..count).collect();
        stats.total_removed += taken.len() as u64;
        stats.current_size = queue.len();
        taken
    }

    /// Removes the entry carrying the given message id
    pub async fn remove(&self, message_id: &str) -> bool {
        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;

        let initial_len = queue.len();
        queue.retain(|entry| entry.message.id().as_str() != message_id);
        let removed = queue.len() < initial_len;
        if removed {
            stats.total_removed += 1;
            stats.current_size = queue.len();
            debug!(uri = %self.uri, message_id, "removed message from DLQ");
        }
        removed
    }

    pub async fn cleanup_expired(&self) -> usize {
        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;

        let initial_len = queue.len();
        queue.retain(|entry| !entry.is_expired());
        let removed = initial_len - queue.len();

        if removed > 0 {
            stats.total_expired += removed as u64;
            stats.current_size = queue.len();
            debug!(uri = %self.uri, removed, "cleaned up expired DLQ entries");
        }
        removed
    }

    pub async fn stats(&self) -> DlqStats {
        self.stats.read().await.clone()
    }

    pub async fn size(&self) -> usize {
        self.queue.read().await.len()
    }

    pub async fn clear(&self) {
        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;

        let cleared = queue.len();
        queue.clear();
        stats.current_size = 0;
        debug!(uri = %self.uri, cleared, "cleared DLQ");
    }

    /// Periodically removes expired entries
    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.cleanup_expired().await;
            }
        })
    }
}

#[async_trait]
impl Processor for DeadLetterQueue {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        self.add(exchange).await;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.uri
    }
}

impl Endpoint for DeadLetterQueue {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> CourierResult<Arc<dyn Processor>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{CapturedError, RouteContext};

    fn failed_exchange(body: &str) -> Exchange {
        let mut exchange = Exchange::new(RouteContext::new("dlq")).with_body(body);
        exchange.set_caught_exception(CapturedError::new("boom"));
        exchange.set_property(PropertyKey::RedeliveryCounter, 2_i64);
        exchange
    }

    #[tokio::test]
    async fn test_dlq_add_and_list() {
        let dlq = DeadLetterQueue::with_defaults("orders");
        let exchange = failed_exchange("order-1");

        dlq.add(&exchange).await;

        let entries = dlq.list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].exchange_id, exchange.id());
        assert_eq!(entries[0].failure_reason, "boom");
        assert_eq!(entries[0].redeliveries, 2);
    }

    #[tokio::test]
    async fn test_dlq_size_limit() {
        let config = DlqConfig {
            max_size: 3,
            ..Default::default()
        };
        let dlq = DeadLetterQueue::new("bounded", config);

        for i in 0..5 {
            dlq.add(&failed_exchange(&format!("msg-{}", i))).await;
        }

        assert_eq!(dlq.size().await, 3);
        assert_eq!(dlq.stats().await.total_dropped, 2);
    }

    #[tokio::test]
    async fn test_zero_max_size_keeps_latest_entry() {
        let config = DlqConfig {
            max_size: 0,
            ..Default::default()
        };
        let dlq = DeadLetterQueue::new("tiny", config);

        dlq.add(&failed_exchange("first")).await;
        let stats = dlq.stats().await;
        assert_eq!(stats.total_dropped, 0);
        assert_eq!(stats.current_size, 1);

        let second = failed_exchange("second");
        dlq.add(&second).await;

        let entries = dlq.list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].exchange_id, second.id());
        assert_eq!(dlq.stats().await.total_dropped, 1);
    }

    #[tokio::test]
    async fn test_dlq_expiry() {
        let config = DlqConfig {
            ttl: Duration::ZERO,
            ..Default::default()
        };
        let dlq = DeadLetterQueue::new("expiring", config);
        dlq.add(&failed_exchange("stale")).await;

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(dlq.cleanup_expired().await, 1);
        assert_eq!(dlq.size().await, 0);
    }

    #[tokio::test]
    async fn test_dlq_take_and_remove() {
        let dlq = DeadLetterQueue::with_defaults("replay");
        let first = failed_exchange("a");
        let message_id = first.in_message().id().to_string();
        dlq.add(&first).await;
        dlq.add(&failed_exchange("b")).await;
        dlq.add(&failed_exchange("c")).await;

        assert!(dlq.remove(&message_id).await);
        assert!(!dlq.remove(&message_id).await);

        let taken = dlq.take(5).await;
        assert_eq!(taken.len(), 2);
        assert_eq!(dlq.stats().await.total_removed, 3);
    }

    #[tokio::test]
    async fn test_dlq_as_endpoint_producer() {
        let dlq = DeadLetterQueue::with_defaults("endpoint");
        let context = RouteContext::new("dlq");
        context.register_endpoint(Arc::new(dlq.clone()));

        let producer = context.endpoint("dlq:endpoint").unwrap().create_producer().unwrap();
        let mut exchange = failed_exchange("x");
        producer.process(&mut exchange).await.unwrap();
        assert_eq!(dlq.size().await, 1);
    }

    #[tokio::test]
    async fn test_disabled_drops() {
        let dlq = DeadLetterQueue::new(
            "off",
            DlqConfig {
                enabled: false,
                ..Default::default()
            },
        );
        dlq.add(&failed_exchange("x")).await;
        assert_eq!(dlq.size().await, 0);
    }
}
