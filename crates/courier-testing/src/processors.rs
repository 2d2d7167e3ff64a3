//! # Scripted Processors
//!
//! Processors whose failures are predictable, for exercising redelivery and
//! dead-letter paths.

use async_trait::async_trait;
use courier_core::{BoxError, Exchange, Processor};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Error raised by [`FlakyProcessor`] by default
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ScriptedFailure {
    pub message: String,
    pub attempt: usize,
}

type ErrorFactory = Arc<dyn Fn() -> BoxError + Send + Sync>;

/// Fails the first `n` invocations, then succeeds
///
/// Clones share the invocation counter.
#[derive(Clone)]
pub struct FlakyProcessor {
    name: String,
    failures: Option<usize>,
    message: String,
    factory: Option<ErrorFactory>,
    invocations: Arc<Mutex<usize>>,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl FlakyProcessor {
    /// Fails `failures` times with `message`, then succeeds
    pub fn failing_times(failures: usize, message: impl Into<String>) -> Self {
        Self {
            name: "flaky".to_string(),
            failures: Some(failures),
            message: message.into(),
            factory: None,
            invocations: Arc::new(Mutex::new(0)),
            bodies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Never succeeds
    pub fn always_failing(message: impl Into<String>) -> Self {
        Self {
            failures: None,
            ..Self::failing_times(0, message)
        }
    }

    /// Never succeeds, raising the error built by `factory`
    pub fn always_failing_with<F>(factory: F) -> Self
    where
        F: Fn() -> BoxError + Send + Sync + 'static,
    {
        Self {
            factory: Some(Arc::new(factory)),
            ..Self::always_failing("scripted")
        }
    }

    /// Fails `failures` times with the error built by `factory`, then succeeds
    pub fn failing_times_with<F>(failures: usize, factory: F) -> Self
    where
        F: Fn() -> BoxError + Send + Sync + 'static,
    {
        Self {
            factory: Some(Arc::new(factory)),
            ..Self::failing_times(failures, "scripted")
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of times `process` has been called
    pub fn invocations(&self) -> usize {
        *self.invocations.lock().unwrap()
    }

    /// Inbound text bodies seen on each call, in order
    pub fn seen_bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        *self.invocations.lock().unwrap() = 0;
        self.bodies.lock().unwrap().clear();
    }
}

#[async_trait]
impl Processor for FlakyProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        let attempt = {
            let mut invocations = self.invocations.lock().unwrap();
            *invocations += 1;
            *invocations
        };
        let body = exchange
            .in_message()
            .body()
            .and_then(|b| b.as_str())
            .unwrap_or_default()
            .to_string();
        self.bodies.lock().unwrap().push(body);

        let should_fail = match self.failures {
            Some(failures) => attempt <= failures,
            None => true,
        };
        if !should_fail {
            return Ok(());
        }

        match &self.factory {
            Some(factory) => Err(factory()),
            None => Err(Box::new(ScriptedFailure {
                message: self.message.clone(),
                attempt,
            })),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::RouteContext;

    #[tokio::test]
    async fn test_fails_then_succeeds() {
        let flaky = FlakyProcessor::failing_times(2, "nope");
        let mut exchange = Exchange::new(RouteContext::new("test")).with_body("hello");

        assert!(flaky.process(&mut exchange).await.is_err());
        assert!(flaky.process(&mut exchange).await.is_err());
        assert!(flaky.process(&mut exchange).await.is_ok());
        assert_eq!(flaky.invocations(), 3);
        assert_eq!(flaky.seen_bodies(), vec!["hello"; 3]);
    }

    #[tokio::test]
    async fn test_scripted_error_carries_attempt() {
        let flaky = FlakyProcessor::always_failing("down");
        let mut exchange = Exchange::new(RouteContext::new("test"));
        flaky.process(&mut exchange).await.ok();
        let err = flaky.process(&mut exchange).await.unwrap_err();

        let scripted = err.downcast_ref::<ScriptedFailure>().unwrap();
        assert_eq!(scripted.attempt, 2);
        assert_eq!(scripted.to_string(), "down");
    }

    #[tokio::test]
    async fn test_clones_share_counter() {
        let flaky = FlakyProcessor::always_failing("x");
        let clone = flaky.clone();
        let mut exchange = Exchange::new(RouteContext::new("test"));
        clone.process(&mut exchange).await.ok();
        assert_eq!(flaky.invocations(), 1);

        flaky.reset();
        assert_eq!(clone.invocations(), 0);
    }
}
