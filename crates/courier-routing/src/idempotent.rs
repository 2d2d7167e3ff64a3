//! Idempotent consumer
//!
//! Filters out exchanges whose key was already seen. The key is evaluated
//! from the exchange by an [`Expression`] and recorded in an
//! [`IdempotentRepository`]. In eager mode the key is claimed before
//! processing, so concurrent duplicates are rejected; otherwise it is only
//! recorded once the unit of work completes successfully.

use crate::metrics::RoutingMetricsCollector;
use async_trait::async_trait;
use courier_core::{
    BoxError, CourierError, Exchange, Expression, Processor, PropertyKey, Synchronization,
    convert_to, invoke,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Storage of processed message keys
pub trait IdempotentRepository: Send + Sync {
    /// Adds `key`, returning false when it was already present
    fn add(&self, key: &str) -> bool;

    fn contains(&self, key: &str) -> bool;

    fn remove(&self, key: &str) -> bool;

    /// Marks `key` as fully processed
    fn confirm(&self, key: &str) -> bool {
        let _ = key;
        true
    }
}

#[derive(Debug, Default)]
struct MemoryStore {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

/// Bounded in-memory repository that evicts the oldest key when full
#[derive(Debug)]
pub struct MemoryIdempotentRepository {
    capacity: usize,
    store: Mutex<MemoryStore>,
}

impl MemoryIdempotentRepository {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            store: Mutex::new(MemoryStore::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut store = self.lock();
        store.keys.clear();
        store.order.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryIdempotentRepository {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl IdempotentRepository for MemoryIdempotentRepository {
    fn add(&self, key: &str) -> bool {
        let mut store = self.lock();
        if store.keys.contains(key) {
            return false;
        }
        if store.keys.len() >= self.capacity
            && let Some(oldest) = store.order.pop_front()
        {
            store.keys.remove(&oldest);
            trace!(key = %oldest, "evicted idempotent key");
        }
        store.keys.insert(key.to_string());
        store.order.push_back(key.to_string());
        true
    }

    fn contains(&self, key: &str) -> bool {
        self.lock().keys.contains(key)
    }

    fn remove(&self, key: &str) -> bool {
        let mut store = self.lock();
        if store.keys.remove(key) {
            store.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotentOptions {
    /// Claim the key before processing instead of on completion
    pub eager: bool,
    /// Drop duplicates; when false they are forwarded with the duplicate flag set
    pub skip_duplicate: bool,
    /// Release the key when processing fails so the message can be retried
    pub remove_on_failure: bool,
}

impl Default for IdempotentOptions {
    fn default() -> Self {
        Self {
            eager: true,
            skip_duplicate: true,
            remove_on_failure: false,
        }
    }
}

/// Commits or releases a key when the unit of work finishes
struct IdempotentOnCompletion {
    repository: Arc<dyn IdempotentRepository>,
    key: String,
    options: IdempotentOptions,
}

impl IdempotentOnCompletion {
    fn finish(&self, exchange: &Exchange) {
        if exchange.is_failed() || exchange.property_flag(PropertyKey::FailureHandled) {
            self.failed();
        } else {
            self.completed();
        }
    }

    fn completed(&self) {
        if !self.options.eager {
            self.repository.add(&self.key);
        }
        self.repository.confirm(&self.key);
        trace!(key = %self.key, "idempotent key confirmed");
    }

    fn failed(&self) {
        if self.options.remove_on_failure {
            self.repository.remove(&self.key);
            debug!(key = %self.key, "idempotent key released after failure");
        }
    }
}

impl Synchronization for IdempotentOnCompletion {
    fn on_complete(&self, exchange: &Exchange) {
        self.finish(exchange);
    }

    fn on_failure(&self, _exchange: &Exchange) {
        self.failed();
    }
}

pub struct IdempotentConsumer {
    key_expression: Arc<dyn Expression>,
    repository: Arc<dyn IdempotentRepository>,
    processor: Arc<dyn Processor>,
    options: IdempotentOptions,
    duplicates: AtomicU64,
    metrics: Option<RoutingMetricsCollector>,
}

impl IdempotentConsumer {
    pub fn new(
        key_expression: Arc<dyn Expression>,
        repository: Arc<dyn IdempotentRepository>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            key_expression,
            repository,
            processor,
            options: IdempotentOptions::default(),
            duplicates: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_options(mut self, options: IdempotentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_metrics(mut self, metrics: RoutingMetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn options(&self) -> IdempotentOptions {
        self.options
    }

    /// Duplicates seen since creation
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    fn evaluate_key(&self, exchange: &Exchange) -> Option<String> {
        let value = self.key_expression.evaluate(exchange)?;
        if value.is_null() {
            return None;
        }
        convert_to::<String>(exchange.context().type_converter(), &value)
    }
}

#[async_trait]
impl Processor for IdempotentConsumer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        let Some(key) = self.evaluate_key(exchange) else {
            return Err(Box::new(CourierError::NoMessageId(exchange.id().to_string())));
        };

        let is_new = if self.options.eager {
            self.repository.add(&key)
        } else {
            !self.repository.contains(&key)
        };

        if !is_new {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_duplicate().await;
            }
            exchange.set_property(PropertyKey::DuplicateMessage, true);
            if self.options.skip_duplicate {
                debug!(exchange_id = %exchange.id(), key = %key, "skipping duplicate message");
                return Ok(());
            }
            debug!(exchange_id = %exchange.id(), key = %key, "forwarding duplicate message");
            invoke(self.processor.as_ref(), exchange).await;
            return Ok(());
        }

        let completion = IdempotentOnCompletion {
            repository: Arc::clone(&self.repository),
            key,
            options: self.options,
        };

        let in_unit_of_work = exchange.unit_of_work().is_some_and(|uow| uow.is_active());
        if in_unit_of_work {
            exchange.add_on_completion(Box::new(completion));
            invoke(self.processor.as_ref(), exchange).await;
        } else {
            invoke(self.processor.as_ref(), exchange).await;
            completion.finish(exchange);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "idempotent-consumer"
    }
}
