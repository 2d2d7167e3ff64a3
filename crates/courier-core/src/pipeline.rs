//! Sequential composition of processors

use crate::error::BoxError;
use crate::exchange::Exchange;
use crate::keys::PropertyKey;
use crate::processor::{Processor, invoke};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Runs its steps in registration order on the same exchange
///
/// Before each step after the first, an outbound message produced by the
/// previous step becomes the inbound message. Forwarding stops at the first
/// step that leaves the exchange failed, rollback-only, handled by an error
/// handler, or marked with the route-stop property.
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn Processor>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_steps(name: impl Into<String>, steps: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn add_step(mut self, step: Arc<dyn Processor>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn should_continue(&self, exchange: &Exchange, step: &dyn Processor) -> bool {
        let reason = if exchange.is_failed() {
            "exchange failed"
        } else if exchange.is_rollback_only() {
            "rollback only"
        } else if exchange.property_flag(PropertyKey::ErrorHandlerHandled) {
            "failure handled by error handler"
        } else {
            return true;
        };
        debug!(
            pipeline = %self.name,
            exchange_id = %exchange.id(),
            step = step.name(),
            reason,
            "stopping pipeline"
        );
        false
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        for (index, step) in self.steps.iter().enumerate() {
            if exchange.property_flag(PropertyKey::RouteStop) {
                debug!(pipeline = %self.name, exchange_id = %exchange.id(), "route stop requested");
                break;
            }
            if index > 0 {
                exchange.promote_out_to_in();
            }

            invoke(step.as_ref(), exchange).await;

            if !self.should_continue(exchange, step.as_ref()) {
                break;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RouteContext;
    use crate::processor::FnProcessor;
    use crate::value::Value;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn step(
        name: &'static str,
        log: &Log,
        action: fn(&mut Exchange) -> Result<(), BoxError>,
    ) -> Arc<dyn Processor> {
        let log = log.clone();
        Arc::new(FnProcessor::new(name, move |ex: &mut Exchange| {
            log.lock().unwrap().push(name);
            action(ex)
        }))
    }

    fn ok(_ex: &mut Exchange) -> Result<(), BoxError> {
        Ok(())
    }

    fn exchange() -> Exchange {
        Exchange::new(RouteContext::new("pipe")).with_body("start")
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let log = Log::default();
        let pipeline = Pipeline::new("p")
            .add_step(step("a", &log, ok))
            .add_step(step("b", &log, ok))
            .add_step(step("c", &log, ok));

        let mut ex = exchange();
        pipeline.process(&mut ex).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(!ex.is_failed());
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let log = Log::default();
        let pipeline = Pipeline::new("p")
            .add_step(step("a", &log, ok))
            .add_step(step("b", &log, |_| Err("b failed".into())))
            .add_step(step("c", &log, ok));

        let mut ex = exchange();
        pipeline.process(&mut ex).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert!(ex.is_failed());
    }

    #[tokio::test]
    async fn test_stops_on_fault_rollback_and_handled() {
        let cases: [fn(&mut Exchange) -> Result<(), BoxError>; 4] = [
            |ex| {
                ex.out_message_mut().set_fault(true);
                Ok(())
            },
            |ex| {
                ex.set_rollback_only(true);
                Ok(())
            },
            |ex| {
                ex.set_property(PropertyKey::ErrorHandlerHandled, true);
                Ok(())
            },
            |ex| {
                ex.set_property(PropertyKey::RouteStop, true);
                Ok(())
            },
        ];

        for action in cases {
            let log = Log::default();
            let pipeline = Pipeline::new("p")
                .add_step(step("a", &log, action))
                .add_step(step("b", &log, ok));
            let mut ex = exchange();
            pipeline.process(&mut ex).await.unwrap();
            assert_eq!(*log.lock().unwrap(), vec!["a"]);
        }
    }

    #[tokio::test]
    async fn test_out_becomes_next_in() {
        let seen = Arc::new(Mutex::new(None));
        let seen_by_b = seen.clone();
        let pipeline = Pipeline::new("p")
            .add_step(Arc::new(FnProcessor::new("a", |ex: &mut Exchange| {
                ex.out_message_mut().set_body("from-a");
                Ok(())
            })))
            .add_step(Arc::new(FnProcessor::new("b", move |ex: &mut Exchange| {
                *seen_by_b.lock().unwrap() = ex.in_message().body().cloned();
                Ok(())
            })));

        let mut ex = exchange();
        pipeline.process(&mut ex).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(Value::from("from-a")));
        assert!(!ex.has_out());
    }
}
