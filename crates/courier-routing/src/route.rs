//! Route assembly
//!
//! A [`RouteBuilder`] collects steps and wires them into a runnable
//! [`Route`]: every step is guarded by the configured error handler, the
//! steps run as a [`Pipeline`], and the whole pipeline runs inside a unit of
//! work so completion callbacks fire once per exchange.

use crate::error_handler::ErrorHandlerBuilder;
use crate::idempotent::{IdempotentConsumer, IdempotentOptions, IdempotentRepository};
use crate::metrics::RoutingMetricsCollector;
use async_trait::async_trait;
use courier_core::{
    BoxError, Consumer, CourierError, CourierResult, Exchange, ExchangePattern, Expression,
    FnProcessor, Pipeline, Processor, PropertyKey, RouteContext, UnitOfWorkProcessor, Value,
    invoke,
};
use courier_observability::{exchange_span, route_span};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{Instrument, debug, info};

/// Delivers to the producer of a registered endpoint
struct SendProcessor {
    uri: String,
    producer: Arc<dyn Processor>,
}

#[async_trait]
impl Processor for SendProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        exchange.set_property(PropertyKey::ToEndpoint, self.uri.as_str());
        self.producer.process(exchange).await
    }

    fn name(&self) -> &str {
        &self.uri
    }
}

enum Step {
    Process(Arc<dyn Processor>),
    To(String),
    Idempotent {
        key: Arc<dyn Expression>,
        repository: Arc<dyn IdempotentRepository>,
        options: IdempotentOptions,
    },
}

pub struct RouteBuilder {
    id: String,
    context: RouteContext,
    from: Option<String>,
    steps: Vec<Step>,
    error_handler: Option<ErrorHandlerBuilder>,
    metrics: Option<RoutingMetricsCollector>,
}

impl RouteBuilder {
    pub fn new(context: &RouteContext, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context: context.clone(),
            from: None,
            steps: Vec::new(),
            error_handler: None,
            metrics: None,
        }
    }

    /// Endpoint whose consumer feeds this route
    pub fn from(mut self, uri: impl Into<String>) -> Self {
        self.from = Some(uri.into());
        self
    }

    pub fn process(mut self, processor: Arc<dyn Processor>) -> Self {
        self.steps.push(Step::Process(processor));
        self
    }

    pub fn process_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.process(Arc::new(FnProcessor::new(name, f)))
    }

    /// Sends to the endpoint registered under `uri`, resolved when built
    pub fn to(mut self, uri: impl Into<String>) -> Self {
        self.steps.push(Step::To(uri.into()));
        self
    }

    /// Filters duplicates; every step added after this one runs only for new keys
    pub fn idempotent(
        mut self,
        key: Arc<dyn Expression>,
        repository: Arc<dyn IdempotentRepository>,
        options: IdempotentOptions,
    ) -> Self {
        self.steps.push(Step::Idempotent {
            key,
            repository,
            options,
        });
        self
    }

    pub fn error_handler(mut self, builder: ErrorHandlerBuilder) -> Self {
        self.error_handler = Some(builder);
        self
    }

    pub fn metrics(mut self, metrics: RoutingMetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> CourierResult<Route> {
        if self.steps.is_empty() {
            return Err(CourierError::InvalidConfig(format!(
                "route {} has no steps",
                self.id
            )));
        }
        if let Some(uri) = &self.from {
            self.context.endpoint(uri)?;
        }

        let error_handler = self.error_handler.map(|builder| match &self.metrics {
            Some(metrics) => builder.metrics(metrics.clone()),
            None => builder,
        });

        let wiring = Wiring {
            route_id: &self.id,
            context: &self.context,
            error_handler: error_handler.as_ref(),
            metrics: self.metrics.as_ref(),
        };
        let pipeline = wiring.assemble(self.steps)?;

        info!(route = %self.id, steps = pipeline.len(), "route built");
        Ok(Route {
            id: self.id,
            context: self.context,
            from: self.from,
            processor: Arc::new(UnitOfWorkProcessor::new(Arc::new(pipeline))),
            metrics: self.metrics,
            consumer: RwLock::new(None),
        })
    }
}

struct Wiring<'a> {
    route_id: &'a str,
    context: &'a RouteContext,
    error_handler: Option<&'a ErrorHandlerBuilder>,
    metrics: Option<&'a RoutingMetricsCollector>,
}

impl Wiring<'_> {
    fn assemble(&self, steps: Vec<Step>) -> CourierResult<Pipeline> {
        let mut processors: Vec<Arc<dyn Processor>> = Vec::with_capacity(steps.len());
        let mut remaining = steps.into_iter();

        while let Some(step) = remaining.next() {
            match step {
                Step::Process(processor) => processors.push(self.guard(processor)?),
                Step::To(uri) => {
                    let producer = self.context.endpoint(&uri)?.create_producer()?;
                    processors.push(self.guard(Arc::new(SendProcessor { uri, producer }))?);
                }
                Step::Idempotent {
                    key,
                    repository,
                    options,
                } => {
                    let rest = self.assemble(remaining.by_ref().collect())?;
                    let mut consumer = IdempotentConsumer::new(key, repository, Arc::new(rest))
                        .with_options(options);
                    if let Some(metrics) = self.metrics {
                        consumer = consumer.with_metrics(metrics.clone());
                    }
                    processors.push(Arc::new(consumer));
                }
            }
        }

        Ok(Pipeline::with_steps(self.route_id, processors))
    }

    fn guard(&self, processor: Arc<dyn Processor>) -> CourierResult<Arc<dyn Processor>> {
        match self.error_handler {
            Some(builder) => Ok(Arc::new(builder.build(self.context, processor)?)),
            None => Ok(processor),
        }
    }
}

/// A built route, ready to accept exchanges
pub struct Route {
    id: String,
    context: RouteContext,
    from: Option<String>,
    processor: Arc<dyn Processor>,
    metrics: Option<RoutingMetricsCollector>,
    consumer: RwLock<Option<Box<dyn Consumer>>>,
}

impl Route {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &RouteContext {
        &self.context
    }

    pub fn from_uri(&self) -> Option<&str> {
        self.from.as_deref()
    }

    /// Routes `exchange` to completion
    ///
    /// Returns the exchange when it completed or its failure was handled, and
    /// [`CourierError::RoutingFailure`] when an error is still attached.
    pub async fn send(&self, mut exchange: Exchange) -> CourierResult<Exchange> {
        let timer = self.metrics.as_ref().map(RoutingMetricsCollector::start_timer);

        let span = route_span(&self.id).in_scope(|| exchange_span(&exchange));
        invoke(self.processor.as_ref(), &mut exchange)
            .instrument(span)
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_exchange(exchange.is_failed()).await;
        }
        if let Some(timer) = timer {
            timer.stop().await;
        }

        match exchange.take_exception() {
            Some(source) => {
                debug!(route = %self.id, exchange_id = %exchange.id(), error = %source, "route failed");
                Err(CourierError::RoutingFailure {
                    exchange_id: exchange.id().to_string(),
                    source,
                })
            }
            None => Ok(exchange),
        }
    }

    /// Wraps `body` in a new exchange and routes it
    pub async fn send_body(&self, body: impl Into<Value>) -> CourierResult<Exchange> {
        let mut exchange = self.context.create_exchange(ExchangePattern::InOnly);
        if let Some(from) = &self.from {
            exchange.set_from_endpoint(from.as_str());
        }
        exchange.in_message_mut().set_body(body);
        self.send(exchange).await
    }

    /// Starts the consumer of the `from` endpoint, if any
    pub async fn start(&self) -> CourierResult<()> {
        let Some(uri) = &self.from else {
            return Ok(());
        };
        let mut slot = self.consumer.write().await;
        if slot.is_some() {
            return Err(CourierError::Lifecycle(format!(
                "route {} is already started",
                self.id
            )));
        }

        let consumer = self
            .context
            .endpoint(uri)?
            .create_consumer(Arc::clone(&self.processor))?;
        consumer.start().await?;
        *slot = Some(consumer);
        info!(route = %self.id, from = %uri, "route started");
        Ok(())
    }

    pub async fn stop(&self) -> CourierResult<()> {
        if let Some(consumer) = self.consumer.write().await.take() {
            consumer.stop().await?;
            info!(route = %self.id, "route stopped");
        }
        Ok(())
    }

    pub async fn is_started(&self) -> bool {
        self.consumer
            .read()
            .await
            .as_ref()
            .is_some_and(|consumer| consumer.is_running())
    }
}

#[async_trait]
impl Processor for Route {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        self.processor
            .process(exchange)
            .instrument(route_span(&self.id))
            .await
    }

    fn name(&self) -> &str {
        &self.id
    }
}
