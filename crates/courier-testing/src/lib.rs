//! # Courier Testing
//!
//! Predictable building blocks for route tests:
//!
//! - **MockEndpoint**: records every exchange it receives and checks
//!   expectations against them
//! - **FlakyProcessor**: fails a scripted number of times, then succeeds
//! - **RecordingSynchronization**: counts unit-of-work completions
//!
//! ## Usage
//!
//! ```rust
//! use courier_core::{Exchange, Processor, RouteContext};
//! use courier_testing::FlakyProcessor;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let flaky = FlakyProcessor::failing_times(1, "not yet");
//! let mut exchange = Exchange::new(RouteContext::new("test"));
//!
//! assert!(flaky.process(&mut exchange).await.is_err());
//! assert!(flaky.process(&mut exchange).await.is_ok());
//! assert_eq!(flaky.invocations(), 2);
//! # }
//! ```

/// Recording endpoint with expectations
pub mod mock_endpoint;
/// Processors that fail on a script
pub mod processors;
/// Completion callback that counts invocations
pub mod synchronization;

pub use mock_endpoint::MockEndpoint;
pub use processors::{FlakyProcessor, ScriptedFailure};
pub use synchronization::RecordingSynchronization;
