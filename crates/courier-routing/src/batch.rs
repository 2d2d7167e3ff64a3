//! Batch polling consumer
//!
//! A [`BatchConsumer`] polls a [`PollSource`] on a fixed interval and routes
//! every polled item as its own exchange, stamped with its position in the
//! batch. Items still being processed from an earlier poll are skipped until
//! their unit of work completes, so an item is never routed twice at once.

use async_trait::async_trait;
use courier_core::{
    Consumer, CourierError, CourierResult, Endpoint, Exchange, ExchangePattern, Message,
    Processor, PropertyKey, RouteContext, Synchronization, UnitOfWorkProcessor, invoke,
};
use courier_observability::exchange_span;
use dashmap::DashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

/// An item returned by a poll, identified by a stable key
#[derive(Debug, Clone)]
pub struct PolledItem {
    pub key: String,
    pub message: Message,
}

impl PolledItem {
    pub fn new(key: impl Into<String>, message: Message) -> Self {
        Self {
            key: key.into(),
            message,
        }
    }
}

/// A source of items for a [`BatchConsumer`]
///
/// Items stay available until committed; rolled-back items are polled again.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn poll(&self) -> CourierResult<Vec<PolledItem>>;

    /// The item was routed successfully
    async fn commit(&self, key: &str) -> CourierResult<()> {
        let _ = key;
        Ok(())
    }

    /// The item failed and should be offered again
    async fn rollback(&self, key: &str) -> CourierResult<()> {
        let _ = key;
        Ok(())
    }
}

/// In-memory source; committed items are removed
#[derive(Debug, Default)]
pub struct MemoryPollSource {
    items: Mutex<VecDeque<PolledItem>>,
}

impl MemoryPollSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, key: impl Into<String>, message: Message) {
        self.lock().push_back(PolledItem::new(key, message));
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PolledItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PollSource for MemoryPollSource {
    async fn poll(&self) -> CourierResult<Vec<PolledItem>> {
        Ok(self.lock().iter().cloned().collect())
    }

    async fn commit(&self, key: &str) -> CourierResult<()> {
        self.lock().retain(|item| item.key != key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Upper bound on items routed per poll; 0 means unlimited
    pub max_messages_per_poll: usize,
    pub poll_interval: Duration,
    pub initial_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_messages_per_poll: 0,
            poll_interval: Duration::from_millis(500),
            initial_delay: Duration::from_millis(1000),
        }
    }
}

/// Removes a key from the in-progress set when the unit of work finishes
struct ReleaseInProgress {
    key: String,
    in_progress: Arc<DashSet<String>>,
}

impl Synchronization for ReleaseInProgress {
    fn on_complete(&self, _exchange: &Exchange) {
        self.in_progress.remove(&self.key);
    }

    fn on_failure(&self, _exchange: &Exchange) {
        self.in_progress.remove(&self.key);
    }

    fn allow_handover(&self) -> bool {
        false
    }
}

struct ConsumerInner {
    uri: String,
    context: RouteContext,
    source: Arc<dyn PollSource>,
    processor: UnitOfWorkProcessor,
    config: BatchConfig,
    in_progress: Arc<DashSet<String>>,
}

impl ConsumerInner {
    async fn poll_once(&self) -> CourierResult<usize> {
        let polled = self.source.poll().await?;
        let limit = self.config.max_messages_per_poll;

        // a key is ours only if this poll inserted it
        let mut batch: Vec<PolledItem> = Vec::new();
        for item in polled {
            if limit > 0 && batch.len() == limit {
                debug!(uri = %self.uri, limit, "limiting batch to max messages per poll");
                break;
            }
            if self.in_progress.insert(item.key.clone()) {
                batch.push(item);
            }
        }

        let total = batch.len();
        for (index, item) in batch.into_iter().enumerate() {
            let mut exchange = self.context.create_exchange(ExchangePattern::InOnly);
            exchange.set_from_endpoint(self.uri.as_str());
            exchange.set_in_message(item.message);
            exchange.set_property(PropertyKey::BatchIndex, index);
            exchange.set_property(PropertyKey::BatchSize, total);
            exchange.set_property(PropertyKey::BatchComplete, index + 1 == total);
            exchange.add_on_completion(Box::new(ReleaseInProgress {
                key: item.key.clone(),
                in_progress: Arc::clone(&self.in_progress),
            }));

            let span = exchange_span(&exchange);
            invoke(&self.processor, &mut exchange).instrument(span).await;

            let settled = if exchange.is_failed() {
                warn!(
                    uri = %self.uri,
                    key = %item.key,
                    error = ?exchange.exception().map(ToString::to_string),
                    "polled item failed, rolling back"
                );
                self.source.rollback(&item.key).await
            } else {
                self.source.commit(&item.key).await
            };
            if let Err(e) = settled {
                warn!(uri = %self.uri, key = %item.key, error = %e, "failed to settle polled item");
            }
        }
        Ok(total)
    }
}

/// Scheduled consumer routing each polled item through a processor
pub struct BatchConsumer {
    inner: Arc<ConsumerInner>,
    running: Arc<AtomicBool>,
    shutdown_tx: Arc<RwLock<Option<mpsc::UnboundedSender<()>>>>,
    task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl BatchConsumer {
    pub fn new(
        uri: impl Into<String>,
        context: RouteContext,
        source: Arc<dyn PollSource>,
        processor: Arc<dyn Processor>,
        config: BatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                uri: uri.into(),
                context,
                source,
                processor: UnitOfWorkProcessor::new(processor),
                config,
                in_progress: Arc::new(DashSet::new()),
            }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Arc::new(RwLock::new(None)),
            task: Arc::new(RwLock::new(None)),
        }
    }

    /// Polls once and routes the batch, returning how many items were routed
    pub async fn poll_once(&self) -> CourierResult<usize> {
        self.inner.poll_once().await
    }

    /// Keys currently being routed
    pub fn in_progress(&self) -> usize {
        self.inner.in_progress.len()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }
}

#[async_trait]
impl Consumer for BatchConsumer {
    async fn start(&self) -> CourierResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CourierError::Lifecycle(format!(
                "consumer for {} is already running",
                self.inner.uri
            )));
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(inner.config.initial_delay) => {}
                _ = shutdown_rx.recv() => return,
            }

            let mut ticker = tokio::time::interval(inner.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match inner.poll_once().await {
                            Ok(0) => {}
                            Ok(routed) => debug!(uri = %inner.uri, routed, "batch routed"),
                            Err(e) => warn!(uri = %inner.uri, error = %e, "poll failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(uri = %inner.uri, "batch consumer shutting down");
                        break;
                    }
                }
            }
        });
        *self.task.write().await = Some(handle);

        info!(uri = %self.inner.uri, "batch consumer started");
        Ok(())
    }

    async fn stop(&self) -> CourierResult<()> {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            // task already gone when the receiver is dropped
            let _ = tx.send(());
        }
        if let Some(handle) = self.task.write().await.take()
            && let Err(e) = handle.await
        {
            warn!(uri = %self.inner.uri, error = %e, "batch consumer task ended abnormally");
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Endpoint whose consumers poll a [`PollSource`]
pub struct PollingEndpoint {
    uri: String,
    context: RouteContext,
    source: Arc<dyn PollSource>,
    config: BatchConfig,
}

impl PollingEndpoint {
    pub fn new(
        uri: impl Into<String>,
        context: &RouteContext,
        source: Arc<dyn PollSource>,
        config: BatchConfig,
    ) -> Self {
        Self {
            uri: uri.into(),
            context: context.clone(),
            source,
            config,
        }
    }
}

impl Endpoint for PollingEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> CourierResult<Arc<dyn Processor>> {
        Err(CourierError::Unsupported(format!(
            "polling endpoint {} cannot produce",
            self.uri
        )))
    }

    fn create_consumer(&self, processor: Arc<dyn Processor>) -> CourierResult<Box<dyn Consumer>> {
        Ok(Box::new(BatchConsumer::new(
            self.uri.clone(),
            self.context.clone(),
            Arc::clone(&self.source),
            processor,
            self.config.clone(),
        )))
    }
}
