//! # Courier Routing
//!
//! Reliability building blocks for Courier routes:
//!
//! - **Redelivery**: bounded retries with fixed, exponential or patterned
//!   delays and optional jitter
//! - **Error handling**: a redelivery error handler that ends in a handled
//!   failure, a dead letter, or an error left for the caller
//! - **Idempotent consumer**: duplicate suppression keyed by an expression
//! - **Batch consumer**: scheduled polling with per-batch properties
//! - **Routes**: builders that wire processors, endpoints and error handling
//!   into a pipeline run inside a unit of work
//!
//! ## Example
//!
//! ```rust
//! use courier_core::RouteContext;
//! use courier_routing::{DeadLetterQueue, ErrorHandlerBuilder, RedeliveryPolicy, RouteBuilder};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = RouteContext::new("orders");
//! let dlq = DeadLetterQueue::with_defaults("orders");
//! context.register_endpoint(Arc::new(dlq.clone()));
//!
//! let policy = RedeliveryPolicy::builder()
//!     .maximum_redeliveries(2)
//!     .redelivery_delay(Duration::from_millis(1))
//!     .build()?;
//!
//! let route = RouteBuilder::new(&context, "orders")
//!     .error_handler(
//!         ErrorHandlerBuilder::dead_letter_channel("dlq:orders").redelivery_policy(policy),
//!     )
//!     .process_fn("validate", |_exchange| Err("order rejected".into()))
//!     .build()?;
//!
//! let exchange = route.send_body("order-1").await?;
//! assert!(!exchange.is_failed());
//! assert_eq!(dlq.size().await, 1);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod dlq;
pub mod error_handler;
pub mod exception_policy;
pub mod idempotent;
pub mod metrics;
pub mod redelivery;
pub mod route;

pub use batch::{
    BatchConfig, BatchConsumer, MemoryPollSource, PollSource, PolledItem, PollingEndpoint,
};
pub use config::RoutingConfig;
pub use dlq::{DeadLetterQueue, DlqConfig, DlqEntry, DlqStats};
pub use error_handler::{ErrorHandlerBuilder, HandlerKind, Outcome, RedeliveryErrorHandler};
pub use exception_policy::{
    DefaultExceptionPolicyStrategy, ExceptionPolicy, ExceptionPolicyStrategy,
};
pub use idempotent::{
    IdempotentConsumer, IdempotentOptions, IdempotentRepository, MemoryIdempotentRepository,
};
pub use metrics::{LatencyStats, RoutingMetrics, RoutingMetricsCollector};
pub use redelivery::{DelayPattern, LoggingLevel, RedeliveryPolicy, RedeliveryPolicyBuilder};
pub use route::{Route, RouteBuilder};
