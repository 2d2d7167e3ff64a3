//! # Courier Core
//!
//! Exchange model and processor protocol for the Courier message routing
//! engine.
//!
//! ## Features
//!
//! - **Exchange / Message**: case-insensitive headers, shared bodies, typed
//!   accessors backed by a pluggable type converter
//! - **Processor protocol**: async in-place processing plus a
//!   continuation-passing form with exactly-once callbacks
//! - **Pipeline**: strictly ordered composition that stops on failure
//! - **Unit of Work**: completion callbacks fired once per exchange
//!
//! ## Example
//!
//! ```rust
//! use courier_core::{Exchange, FnProcessor, Pipeline, Processor, RouteContext};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let context = RouteContext::new("orders");
//! let pipeline = Pipeline::new("enrich").add_step(Arc::new(FnProcessor::new(
//!     "upper",
//!     |ex: &mut Exchange| {
//!         let body: Option<String> = ex.in_message().body_as(ex.context().type_converter());
//!         ex.out_message_mut().set_body(body.unwrap_or_default().to_uppercase());
//!         Ok(())
//!     },
//! )));
//!
//! let mut exchange = Exchange::new(context).with_body("order-1");
//! pipeline.process(&mut exchange).await?;
//! assert!(!exchange.is_failed());
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod convert;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod expression;
pub mod headers;
pub mod keys;
pub mod message;
pub mod pipeline;
pub mod processor;
pub mod unit_of_work;
pub mod value;

pub use context::RouteContext;
pub use convert::{DefaultTypeConverter, TypeConverter, convert_to};
pub use endpoint::{Consumer, Endpoint};
pub use error::{BoxError, CapturedError, CourierError, CourierResult};
pub use exchange::{Exchange, ExchangeId, ExchangePattern};
pub use expression::{Expression, Predicate};
pub use headers::Headers;
pub use keys::PropertyKey;
pub use message::{Message, MessageId};
pub use pipeline::Pipeline;
pub use processor::{
    AsyncAdapter, AsyncBridge, AsyncCallback, AsyncProcessor, FnProcessor, Processor, invoke,
};
pub use unit_of_work::{Synchronization, UnitOfWork, UnitOfWorkProcessor};
pub use value::{FromValue, Value, ValueKind};
