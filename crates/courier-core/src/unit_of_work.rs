//! Unit of work and completion callbacks
//!
//! A [`UnitOfWork`] records the inbound message as it arrived and the
//! [`Synchronization`]s registered while the exchange is routed. When the
//! route finishes, each synchronization fires exactly once, in registration
//! order: `on_complete` if the exchange is not failed, `on_failure` otherwise.

use crate::error::BoxError;
use crate::exchange::Exchange;
use crate::message::Message;
use crate::processor::{Processor, invoke};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

/// Completion callback registered on a unit of work
pub trait Synchronization: Send + Sync {
    fn on_complete(&self, exchange: &Exchange);

    fn on_failure(&self, exchange: &Exchange);

    /// Whether this callback may move to another exchange on handover
    fn allow_handover(&self) -> bool {
        true
    }
}

pub struct UnitOfWork {
    id: String,
    original_in: Message,
    synchronizations: Vec<Box<dyn Synchronization>>,
    active: bool,
}

impl UnitOfWork {
    /// Starts tracking `exchange`, snapshotting its inbound message
    pub fn new(exchange: &Exchange) -> Self {
        trace!(exchange_id = %exchange.id(), "unit of work created");
        Self {
            id: Uuid::new_v4().to_string(),
            original_in: exchange.in_message().copy(),
            synchronizations: Vec::new(),
            active: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn original_in_message(&self) -> &Message {
        &self.original_in
    }

    pub fn add_synchronization(&mut self, synchronization: Box<dyn Synchronization>) {
        self.synchronizations.push(synchronization);
    }

    pub fn len(&self) -> usize {
        self.synchronizations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.synchronizations.is_empty()
    }

    /// True once a processor has taken responsibility for completing it
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn activate(&mut self) {
        self.active = true;
    }

    /// Removes and returns every synchronization that allows handover
    pub(crate) fn drain_for_handover(&mut self) -> Vec<Box<dyn Synchronization>> {
        let (moved, kept): (Vec<_>, Vec<_>) = self
            .synchronizations
            .drain(..)
            .partition(|sync| sync.allow_handover());
        self.synchronizations = kept;
        moved
    }

    /// Fires every synchronization once; consuming `self` prevents a second run
    pub fn done(self, exchange: &Exchange) {
        let failed = exchange.is_failed();
        trace!(
            exchange_id = %exchange.id(),
            failed,
            callbacks = self.synchronizations.len(),
            "unit of work done"
        );
        for synchronization in &self.synchronizations {
            if failed {
                synchronization.on_failure(exchange);
            } else {
                synchronization.on_complete(exchange);
            }
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("synchronizations", &self.synchronizations.len())
            .field("active", &self.active)
            .finish()
    }
}

/// Runs a processor inside a unit of work and fires its callbacks afterwards
///
/// Nested instances defer to the outermost one, which alone completes the
/// unit of work.
pub struct UnitOfWorkProcessor {
    processor: Arc<dyn Processor>,
}

impl UnitOfWorkProcessor {
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Processor for UnitOfWorkProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        let owner = match exchange.unit_of_work_mut() {
            Some(uow) if uow.is_active() => false,
            Some(uow) => {
                uow.activate();
                true
            }
            None => {
                let mut uow = UnitOfWork::new(exchange);
                uow.activate();
                exchange.set_unit_of_work(uow);
                true
            }
        };

        invoke(self.processor.as_ref(), exchange).await;

        if owner {
            if let Some(uow) = exchange.take_unit_of_work() {
                uow.done(exchange);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "unit-of-work"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RouteContext;
    use crate::processor::FnProcessor;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
        handover: bool,
    }

    struct Tagged(&'static str, Recorder);

    impl Synchronization for Tagged {
        fn on_complete(&self, _exchange: &Exchange) {
            self.1.events.lock().unwrap().push(format!("{}:complete", self.0));
        }

        fn on_failure(&self, _exchange: &Exchange) {
            self.1.events.lock().unwrap().push(format!("{}:failure", self.0));
        }

        fn allow_handover(&self) -> bool {
            self.1.handover
        }
    }

    fn exchange() -> Exchange {
        Exchange::new(RouteContext::new("uow")).with_body("original")
    }

    #[test]
    fn test_done_fires_in_registration_order() {
        let rec = Recorder::default();
        let mut ex = exchange();
        ex.add_on_completion(Box::new(Tagged("a", rec.clone())));
        ex.add_on_completion(Box::new(Tagged("b", rec.clone())));

        let uow = ex.take_unit_of_work().unwrap();
        uow.done(&ex);
        assert_eq!(*rec.events.lock().unwrap(), vec!["a:complete", "b:complete"]);
    }

    #[test]
    fn test_failed_exchange_selects_on_failure() {
        let rec = Recorder::default();
        let mut ex = exchange();
        ex.add_on_completion(Box::new(Tagged("a", rec.clone())));
        ex.fail("broken");

        ex.take_unit_of_work().unwrap().done(&ex);
        assert_eq!(*rec.events.lock().unwrap(), vec!["a:failure"]);
    }

    #[test]
    fn test_vetoed_handover_stays() {
        let keep = Recorder::default();
        let moved = Recorder {
            handover: true,
            ..Recorder::default()
        };
        let mut source = exchange();
        source.add_on_completion(Box::new(Tagged("keep", keep)));
        source.add_on_completion(Box::new(Tagged("move", moved)));

        let mut target = exchange();
        source.handover_completions(&mut target);
        assert_eq!(source.unit_of_work().unwrap().len(), 1);
        assert_eq!(target.unit_of_work().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processor_snapshots_original_and_completes() {
        let rec = Recorder::default();
        let sync_rec = rec.clone();
        let inner = FnProcessor::new("mutate", move |ex: &mut Exchange| {
            assert_eq!(
                ex.original_message().and_then(|m| m.body()),
                Some(&crate::value::Value::from("original"))
            );
            ex.in_message_mut().set_body("changed");
            ex.add_on_completion(Box::new(Tagged("inner", sync_rec.clone())));
            Ok(())
        });
        let processor = UnitOfWorkProcessor::new(Arc::new(inner));

        let mut ex = exchange();
        processor.process(&mut ex).await.unwrap();

        assert!(ex.unit_of_work().is_none());
        assert_eq!(*rec.events.lock().unwrap(), vec!["inner:complete"]);
    }

    #[tokio::test]
    async fn test_nested_processor_defers_to_outer() {
        let rec = Recorder::default();
        let sync_rec = rec.clone();
        let inner = FnProcessor::new("register", move |ex: &mut Exchange| {
            ex.add_on_completion(Box::new(Tagged("x", sync_rec.clone())));
            Ok(())
        });
        let nested = UnitOfWorkProcessor::new(Arc::new(inner));
        let sibling = UnitOfWorkProcessor::new(Arc::new(FnProcessor::new(
            "check",
            |_ex: &mut Exchange| Ok(()),
        )));
        let mut ex = exchange();
        let mut uow = UnitOfWork::new(&ex);
        uow.activate();
        ex.set_unit_of_work(uow);

        nested.process(&mut ex).await.unwrap();
        assert!(rec.events.lock().unwrap().is_empty());
        assert_eq!(ex.unit_of_work().unwrap().len(), 1);

        sibling.process(&mut ex).await.unwrap();
        assert!(rec.events.lock().unwrap().is_empty(), "still owned by caller");
    }
}
