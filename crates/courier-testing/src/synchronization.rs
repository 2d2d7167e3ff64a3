//! # Recording Synchronization

use courier_core::{Exchange, ExchangeId, Synchronization};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Recorded {
    completions: Vec<ExchangeId>,
    failures: Vec<ExchangeId>,
}

/// Counts `on_complete` and `on_failure` calls; clones share the counts
#[derive(Debug, Clone)]
pub struct RecordingSynchronization {
    recorded: Arc<Mutex<Recorded>>,
    allow_handover: bool,
}

impl RecordingSynchronization {
    pub fn new() -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            allow_handover: true,
        }
    }

    /// A synchronization that stays with the exchange it was registered on
    pub fn pinned() -> Self {
        Self {
            allow_handover: false,
            ..Self::new()
        }
    }

    pub fn boxed(&self) -> Box<dyn Synchronization> {
        Box::new(self.clone())
    }

    pub fn completions(&self) -> usize {
        self.recorded.lock().unwrap().completions.len()
    }

    pub fn failures(&self) -> usize {
        self.recorded.lock().unwrap().failures.len()
    }

    /// Total callbacks fired, of either kind
    pub fn calls(&self) -> usize {
        self.completions() + self.failures()
    }

    /// Exchanges that completed, in callback order
    pub fn completed_exchanges(&self) -> Vec<ExchangeId> {
        self.recorded.lock().unwrap().completions.clone()
    }
}

impl Default for RecordingSynchronization {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronization for RecordingSynchronization {
    fn on_complete(&self, exchange: &Exchange) {
        self.recorded.lock().unwrap().completions.push(exchange.id());
    }

    fn on_failure(&self, exchange: &Exchange) {
        self.recorded.lock().unwrap().failures.push(exchange.id());
    }

    fn allow_handover(&self) -> bool {
        self.allow_handover
    }
}
