//! Endpoint and consumer contracts
//!
//! Endpoints are the boundary to transports. The engine only needs them to
//! create exchanges, produce into them, and optionally start consumers that
//! feed a processor.

use crate::context::RouteContext;
use crate::error::{CourierError, CourierResult};
use crate::exchange::{Exchange, ExchangePattern};
use crate::processor::Processor;
use async_trait::async_trait;
use std::sync::Arc;

pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    /// A processor that delivers exchanges to this endpoint
    fn create_producer(&self) -> CourierResult<Arc<dyn Processor>>;

    /// A consumer that feeds exchanges from this endpoint into `processor`
    fn create_consumer(&self, processor: Arc<dyn Processor>) -> CourierResult<Box<dyn Consumer>> {
        let _ = processor;
        Err(CourierError::Unsupported(format!(
            "endpoint {} does not support consumers",
            self.uri()
        )))
    }

    fn create_exchange(&self, context: &RouteContext, pattern: ExchangePattern) -> Exchange {
        let mut exchange = context.create_exchange(pattern);
        exchange.set_from_endpoint(self.uri());
        exchange
    }
}

#[async_trait]
pub trait Consumer: Send + Sync {
    async fn start(&self) -> CourierResult<()>;

    async fn stop(&self) -> CourierResult<()>;

    fn is_running(&self) -> bool;
}
