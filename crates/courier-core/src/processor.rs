//! The processor protocol
//!
//! Every routing step implements [`Processor`]: an async `process` that
//! mutates the exchange in place. Failures returned from `process` are
//! recorded on the exchange by [`invoke`] so that composite processors
//! inspect [`Exchange::is_failed`] instead of propagating errors.
//!
//! Steps that complete on another task use the continuation form,
//! [`AsyncProcessor`]: the exchange is handed over by value together with an
//! [`AsyncCallback`] that must be invoked exactly once. The callback is
//! consumed on use, so the type system rules out a second invocation.

use crate::error::{BoxError, CapturedError, CourierError};
use crate::exchange::Exchange;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

/// A single routing step
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError>;

    /// Short name used in logs
    fn name(&self) -> &str {
        "processor"
    }
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        (**self).process(exchange).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Runs `processor`, recording a returned error as the exchange's exception
pub async fn invoke(processor: &dyn Processor, exchange: &mut Exchange) {
    if let Err(err) = processor.process(exchange).await {
        trace!(
            exchange_id = %exchange.id(),
            processor = processor.name(),
            error = %err,
            "processor failed"
        );
        exchange.set_exception(CapturedError::new(err));
    }
}

/// Adapts a synchronous closure into a [`Processor`]
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        (self.f)(exchange)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Completion continuation for [`AsyncProcessor`]
///
/// `done_sync` is true when the step finished before `process_async` returned.
pub struct AsyncCallback {
    f: Box<dyn FnOnce(Exchange, bool) + Send>,
}

impl AsyncCallback {
    pub fn new(f: impl FnOnce(Exchange, bool) + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    pub fn done(self, exchange: Exchange, done_sync: bool) {
        (self.f)(exchange, done_sync)
    }
}

/// Continuation-passing form of a processor
pub trait AsyncProcessor: Send + Sync {
    /// Processes `exchange` and eventually hands it back through `callback`
    ///
    /// Returns `true` when processing finished synchronously, in which case
    /// the callback has already been invoked with `done_sync = true`.
    /// Returns `false` when completion continues on another task; the
    /// callback then runs exactly once, later, with `done_sync = false`.
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool;
}

/// Exposes a [`Processor`] through the continuation protocol
///
/// The processor future is polled once inline; if it is not ready it is
/// moved onto a Tokio task. Must be called from within a Tokio runtime.
pub struct AsyncAdapter {
    processor: Arc<dyn Processor>,
}

impl AsyncAdapter {
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self { processor }
    }
}

impl AsyncProcessor for AsyncAdapter {
    fn process_async(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let processor = Arc::clone(&self.processor);
        let mut future = Box::pin(async move {
            invoke(processor.as_ref(), &mut exchange).await;
            exchange
        });

        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(exchange) => {
                callback.done(exchange, true);
                true
            }
            Poll::Pending => {
                tokio::spawn(async move {
                    let exchange = future.await;
                    callback.done(exchange, false);
                });
                false
            }
        }
    }
}

/// Drives an [`AsyncProcessor`] to completion as a regular [`Processor`]
pub struct AsyncBridge {
    processor: Arc<dyn AsyncProcessor>,
}

impl AsyncBridge {
    pub fn new(processor: Arc<dyn AsyncProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Processor for AsyncBridge {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        let (tx, rx) = oneshot::channel();
        let owned = exchange.take();
        self.processor.process_async(
            owned,
            AsyncCallback::new(move |done, _| {
                // receiver gone means the caller was cancelled
                let _ = tx.send(done);
            }),
        );

        match rx.await {
            Ok(done) => {
                *exchange = done;
                Ok(())
            }
            Err(_) => Err(Box::new(CourierError::CallbackDropped)),
        }
    }

    fn name(&self) -> &str {
        "async-bridge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RouteContext;
    use crate::value::Value;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Sleepy;

    #[async_trait]
    impl Processor for Sleepy {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            exchange.in_message_mut().set_body("slept");
            Ok(())
        }
    }

    fn exchange() -> Exchange {
        Exchange::new(RouteContext::new("proc"))
    }

    #[tokio::test]
    async fn test_invoke_records_error() {
        let failing = FnProcessor::new("fail", |_ex: &mut Exchange| Err("nope".into()));
        let mut ex = exchange();
        invoke(&failing, &mut ex).await;
        assert!(ex.is_failed());
        assert_eq!(ex.exception().unwrap().to_string(), "nope");
    }

    #[tokio::test]
    async fn test_adapter_completes_synchronously() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let adapter = AsyncAdapter::new(Arc::new(FnProcessor::new(
            "set",
            |ex: &mut Exchange| {
                ex.in_message_mut().set_body("done");
                Ok(())
            },
        )));

        let (c, s) = (calls.clone(), seen.clone());
        let sync = adapter.process_async(
            exchange(),
            AsyncCallback::new(move |ex, done_sync| {
                c.fetch_add(1, Ordering::SeqCst);
                *s.lock().unwrap() = Some((ex.in_message().body().cloned(), done_sync));
            }),
        );

        assert!(sync);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            Some((Some(Value::from("done")), true))
        );
    }

    #[tokio::test]
    async fn test_adapter_continues_on_task() {
        let adapter = AsyncAdapter::new(Arc::new(Sleepy));
        let (tx, rx) = oneshot::channel();

        let sync = adapter.process_async(
            exchange(),
            AsyncCallback::new(move |ex, done_sync| {
                let _ = tx.send((ex, done_sync));
            }),
        );
        assert!(!sync);

        let (ex, done_sync) = rx.await.unwrap();
        assert!(!done_sync);
        assert_eq!(ex.in_message().body(), Some(&Value::from("slept")));
    }

    #[tokio::test]
    async fn test_bridge_round_trip_keeps_identity() {
        let bridge = AsyncBridge::new(Arc::new(AsyncAdapter::new(Arc::new(Sleepy))));
        let mut ex = exchange();
        let id = ex.id();
        ex.set_property("kept", true);

        bridge.process(&mut ex).await.unwrap();
        assert_eq!(ex.id(), id);
        assert!(ex.property_flag("kept"));
        assert_eq!(ex.in_message().body(), Some(&Value::from("slept")));
    }

    struct Dropper;

    impl AsyncProcessor for Dropper {
        fn process_async(&self, _exchange: Exchange, callback: AsyncCallback) -> bool {
            drop(callback);
            false
        }
    }

    #[tokio::test]
    async fn test_bridge_reports_dropped_callback() {
        let bridge = AsyncBridge::new(Arc::new(Dropper));
        let mut ex = exchange();
        let err = bridge.process(&mut ex).await.unwrap_err();
        assert!(err.to_string().contains("callback dropped"));
    }
}
