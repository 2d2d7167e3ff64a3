//! # Mock Endpoint
//!
//! An endpoint that records a copy of every exchange delivered to it, so
//! tests can assert on what reached the end of a route.

use async_trait::async_trait;
use courier_core::{
    BoxError, CourierResult, Endpoint, Exchange, ExchangeId, Message, Processor, Value,
};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct ReceivedExchange {
    pub exchange_id: ExchangeId,
    pub message: Message,
    pub redelivered: bool,
}

#[derive(Debug, Default)]
struct MockState {
    received: Vec<ReceivedExchange>,
    expected_count: Option<usize>,
    fail_with: Option<String>,
}

/// Recording endpoint; clones share the recorded exchanges
#[derive(Debug, Clone)]
pub struct MockEndpoint {
    uri: String,
    state: Arc<Mutex<MockState>>,
}

impl MockEndpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Makes every delivery fail with `message` after being recorded
    pub fn failing(self, message: impl Into<String>) -> Self {
        self.state.lock().unwrap().fail_with = Some(message.into());
        self
    }

    pub fn expect_message_count(&self, count: usize) {
        self.state.lock().unwrap().expected_count = Some(count);
    }

    /// Panics when the received count differs from the expectation
    pub fn assert_is_satisfied(&self) {
        let state = self.state.lock().unwrap();
        if let Some(expected) = state.expected_count {
            assert_eq!(
                state.received.len(),
                expected,
                "{} expected {} exchanges but received {}",
                self.uri,
                expected,
                state.received.len()
            );
        }
    }

    pub fn received(&self) -> Vec<ReceivedExchange> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn received_count(&self) -> usize {
        self.state.lock().unwrap().received.len()
    }

    /// Inbound bodies in delivery order; missing bodies are skipped
    pub fn bodies(&self) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .received
            .iter()
            .filter_map(|r| r.message.body().cloned())
            .collect()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.received.clear();
        state.expected_count = None;
    }
}

#[async_trait]
impl Processor for MockEndpoint {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        let mut state = self.state.lock().unwrap();
        state.received.push(ReceivedExchange {
            exchange_id: exchange.id(),
            message: exchange.in_message().copy(),
            redelivered: exchange.property_flag(courier_core::PropertyKey::Redelivered),
        });
        match &state.fail_with {
            Some(message) => Err(message.clone().into()),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        &self.uri
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> CourierResult<Arc<dyn Processor>> {
        Ok(Arc::new(self.clone()))
    }
}
