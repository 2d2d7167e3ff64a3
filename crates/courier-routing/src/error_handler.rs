//! Redelivery error handler and dead letter channel
//!
//! [`RedeliveryErrorHandler`] wraps a processor and owns the recovery state
//! machine for every exchange passing through it:
//!
//! ```text
//! ATTEMPTING -> SUCCESS
//!            -> FAILED -> RETRY (wait, optional on-redelivery hook) -> ATTEMPTING
//!                      -> HANDLED | DEAD_LETTER | FATAL
//! ```
//!
//! Retries are local: the caller only sees the terminal [`Outcome`]. The
//! redelivery counter is incremented on every failure and decremented once
//! redeliveries are exhausted, so it equals the number of redeliveries that
//! actually ran.

use crate::exception_policy::{
    DefaultExceptionPolicyStrategy, ExceptionPolicy, ExceptionPolicyStrategy,
};
use crate::metrics::RoutingMetricsCollector;
use crate::redelivery::{LoggingLevel, RedeliveryPolicy};
use async_trait::async_trait;
use courier_core::{
    BoxError, CapturedError, CourierResult, Exchange, Message, Predicate, Processor, PropertyKey,
    RouteContext, invoke,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Terminal result of one pass through the error handler
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The wrapped processor eventually succeeded
    Success { redeliveries: u32 },
    /// Redeliveries ran out and the failure was marked handled
    Handled,
    /// Redeliveries ran out and the exchange went to a dead-letter destination
    DeadLettered { endpoint: String },
    /// The processor left a fault message without raising an error
    Fault,
    /// The failure is left on the exchange for the caller
    Fatal(CapturedError),
}

impl Outcome {
    /// Whether the caller sees a completed exchange
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Outcome::Success { .. } | Outcome::Handled | Outcome::DeadLettered { .. }
        )
    }
}

/// What to do after a failed attempt
enum Decision {
    Retry { delay: Duration },
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// No dead letter; exhausted failures are unhandled unless configured
    Default,
    /// Exhausted failures go to a dead letter and are handled by default
    DeadLetterChannel,
}

#[derive(Clone)]
enum DeadLetterTarget {
    Uri(String),
    Processor(String, Arc<dyn Processor>),
}

/// Configuration for [`RedeliveryErrorHandler`], reusable across processors
#[derive(Clone)]
pub struct ErrorHandlerBuilder {
    kind: HandlerKind,
    dead_letter: Option<DeadLetterTarget>,
    redelivery_policy: RedeliveryPolicy,
    handled: Option<Arc<dyn Predicate>>,
    on_redelivery: Option<Arc<dyn Processor>>,
    use_original_message: bool,
    exception_policies: Vec<ExceptionPolicy>,
    strategy: Arc<dyn ExceptionPolicyStrategy>,
    metrics: Option<RoutingMetricsCollector>,
}

impl ErrorHandlerBuilder {
    fn with_kind(kind: HandlerKind, dead_letter: Option<DeadLetterTarget>) -> Self {
        Self {
            kind,
            dead_letter,
            redelivery_policy: RedeliveryPolicy::default(),
            handled: None,
            on_redelivery: None,
            use_original_message: false,
            exception_policies: Vec::new(),
            strategy: Arc::new(DefaultExceptionPolicyStrategy),
            metrics: None,
        }
    }

    /// Redelivers, then leaves exhausted failures on the exchange
    pub fn default_error_handler() -> Self {
        Self::with_kind(HandlerKind::Default, None)
    }

    /// Redelivers, then forwards to the endpoint registered under `uri`
    pub fn dead_letter_channel(uri: impl Into<String>) -> Self {
        Self::with_kind(
            HandlerKind::DeadLetterChannel,
            Some(DeadLetterTarget::Uri(uri.into())),
        )
    }

    /// Redelivers, then forwards to `processor`
    pub fn dead_letter_processor(name: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        Self::with_kind(
            HandlerKind::DeadLetterChannel,
            Some(DeadLetterTarget::Processor(name.into(), processor)),
        )
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery_policy = policy;
        self
    }

    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = Some(courier_core::expression::constant(handled));
        self
    }

    pub fn handled_when(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.handled = Some(predicate);
        self
    }

    pub fn on_redelivery(mut self, processor: Arc<dyn Processor>) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    /// Dead-letter the inbound message as it was before the route touched it
    pub fn use_original_message(mut self, enabled: bool) -> Self {
        self.use_original_message = enabled;
        self
    }

    pub fn exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.exception_policies.push(policy);
        self
    }

    pub fn exception_policy_strategy(mut self, strategy: Arc<dyn ExceptionPolicyStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn metrics(mut self, metrics: RoutingMetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Wraps `output`, resolving the dead-letter endpoint through `context`
    pub fn build(
        &self,
        context: &RouteContext,
        output: Arc<dyn Processor>,
    ) -> CourierResult<RedeliveryErrorHandler> {
        let dead_letter = match &self.dead_letter {
            Some(DeadLetterTarget::Uri(uri)) => {
                let producer = context.endpoint(uri)?.create_producer()?;
                Some((uri.clone(), producer))
            }
            Some(DeadLetterTarget::Processor(name, processor)) => {
                Some((name.clone(), Arc::clone(processor)))
            }
            None => None,
        };

        Ok(RedeliveryErrorHandler {
            output,
            kind: self.kind,
            dead_letter,
            redelivery_policy: self.redelivery_policy.clone(),
            handled: self.handled.clone(),
            on_redelivery: self.on_redelivery.clone(),
            use_original_message: self.use_original_message,
            exception_policies: Arc::new(self.exception_policies.clone()),
            strategy: Arc::clone(&self.strategy),
            metrics: self.metrics.clone(),
        })
    }
}

impl Default for ErrorHandlerBuilder {
    fn default() -> Self {
        Self::default_error_handler()
    }
}

pub struct RedeliveryErrorHandler {
    output: Arc<dyn Processor>,
    kind: HandlerKind,
    dead_letter: Option<(String, Arc<dyn Processor>)>,
    redelivery_policy: RedeliveryPolicy,
    handled: Option<Arc<dyn Predicate>>,
    on_redelivery: Option<Arc<dyn Processor>>,
    use_original_message: bool,
    exception_policies: Arc<Vec<ExceptionPolicy>>,
    strategy: Arc<dyn ExceptionPolicyStrategy>,
    metrics: Option<RoutingMetricsCollector>,
}

impl RedeliveryErrorHandler {
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn redelivery_policy(&self) -> &RedeliveryPolicy {
        &self.redelivery_policy
    }

    fn needs_original_message(&self) -> bool {
        self.use_original_message
            || self
                .exception_policies
                .iter()
                .any(|p| p.original_message_override() == Some(true))
    }

    /// Runs the wrapped processor with redelivery, returning the terminal outcome
    pub async fn handle(&self, exchange: &mut Exchange) -> Outcome {
        let entry_snapshot = self
            .needs_original_message()
            .then(|| exchange.in_message().copy());

        let mut counter: u32 = 0;
        let mut pending_delay: Option<Duration> = None;
        let mut on_redelivery: Option<Arc<dyn Processor>> = None;

        loop {
            if let Some(delay) = pending_delay.take() {
                self.prepare_for_redelivery(exchange);
                if !delay.is_zero() {
                    trace!(exchange_id = %exchange.id(), delay_ms = delay.as_millis() as u64, "waiting before redelivery");
                    tokio::time::sleep(delay).await;
                }
                if let Some(hook) = on_redelivery.take() {
                    invoke(hook.as_ref(), exchange).await;
                }
            }

            if exchange.exception().is_none() {
                invoke(self.output.as_ref(), exchange).await;
            }

            let Some(error) = exchange.exception().cloned() else {
                if exchange.is_failed() {
                    debug!(exchange_id = %exchange.id(), "processor returned a fault");
                    return Outcome::Fault;
                }
                return Outcome::Success {
                    redeliveries: counter,
                };
            };

            exchange.set_caught_exception(error.clone());
            let policy = self.strategy.resolve(&self.exception_policies, &error);
            let redelivery_policy = policy
                .and_then(ExceptionPolicy::redelivery_policy)
                .unwrap_or(&self.redelivery_policy);

            if error.is_fatal() {
                error!(
                    exchange_id = %exchange.id(),
                    error = %error.render_chain(),
                    "fatal failure, not redelivering"
                );
                return Outcome::Fatal(error);
            }

            counter += 1;
            exchange.set_property(PropertyKey::RedeliveryCounter, counter);
            exchange.set_property(PropertyKey::Redelivered, true);

            match self.decide(exchange, policy, redelivery_policy, counter) {
                Decision::Retry { delay } => {
                    self.log_retry(exchange, &error, redelivery_policy, counter, delay);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_redelivery().await;
                    }
                    on_redelivery = policy
                        .and_then(ExceptionPolicy::on_redelivery_processor)
                        .or(self.on_redelivery.as_ref())
                        .cloned();
                    pending_delay = Some(delay);
                }
                Decision::Exhausted => {
                    counter -= 1;
                    if counter == 0 {
                        exchange.remove_property(PropertyKey::RedeliveryCounter);
                        exchange.remove_property(PropertyKey::Redelivered);
                    } else {
                        exchange.set_property(PropertyKey::RedeliveryCounter, counter);
                    }
                    return self
                        .on_exhausted(exchange, error, policy, redelivery_policy, entry_snapshot)
                        .await;
                }
            }
        }
    }

    fn decide(
        &self,
        exchange: &Exchange,
        policy: Option<&ExceptionPolicy>,
        redelivery_policy: &RedeliveryPolicy,
        counter: u32,
    ) -> Decision {
        if exchange.is_rollback_only() {
            return Decision::Exhausted;
        }

        let retry_while = policy
            .and_then(ExceptionPolicy::retry_while_predicate)
            .map(|p| p.as_ref());
        if redelivery_policy.should_redeliver(exchange, counter, retry_while) {
            Decision::Retry {
                delay: redelivery_policy.redelivery_delay_for(counter),
            }
        } else {
            Decision::Exhausted
        }
    }

    fn prepare_for_redelivery(&self, exchange: &mut Exchange) {
        exchange.clear_exception();
        exchange.clear_fault();
        exchange.remove_property(PropertyKey::ErrorHandlerHandled);
    }

    async fn on_exhausted(
        &self,
        exchange: &mut Exchange,
        error: CapturedError,
        policy: Option<&ExceptionPolicy>,
        redelivery_policy: &RedeliveryPolicy,
        entry_snapshot: Option<Message>,
    ) -> Outcome {
        exchange.set_property(PropertyKey::RedeliveryExhausted, true);
        exchange.set_property(PropertyKey::FailureHandled, true);
        self.log_exhausted(exchange, &error, redelivery_policy);
        if let Some(metrics) = &self.metrics {
            metrics.record_exhausted().await;
        }

        let dead_letter = match policy.and_then(ExceptionPolicy::dead_letter) {
            Some(uri) => match exchange
                .context()
                .endpoint(uri)
                .and_then(|endpoint| endpoint.create_producer())
            {
                Ok(producer) => Some((uri.to_string(), producer)),
                Err(err) => {
                    let fatal = CapturedError::from(err);
                    error!(exchange_id = %exchange.id(), error = %fatal, "dead letter endpoint unavailable");
                    exchange.set_exception(fatal.clone());
                    return Outcome::Fatal(fatal);
                }
            },
            None => self.dead_letter.clone(),
        };

        let use_original = policy
            .and_then(ExceptionPolicy::original_message_override)
            .unwrap_or(self.use_original_message);

        let mut dead_lettered_to = None;
        if let Some((uri, processor)) = dead_letter {
            if use_original {
                let original = exchange.original_message().cloned().or(entry_snapshot);
                if let Some(original) = original {
                    exchange.set_in_message(original);
                    exchange.take_out_message();
                }
            }

            exchange.clear_exception();
            exchange.set_property(PropertyKey::FailureEndpoint, uri.as_str());
            invoke(processor.as_ref(), exchange).await;

            if let Some(dead_letter_error) = exchange.exception().cloned() {
                error!(
                    exchange_id = %exchange.id(),
                    endpoint = %uri,
                    error = %dead_letter_error,
                    "delivery to dead letter failed"
                );
                return Outcome::Fatal(dead_letter_error);
            }
            debug!(exchange_id = %exchange.id(), endpoint = %uri, "exchange dead-lettered");
            if let Some(metrics) = &self.metrics {
                metrics.record_dead_lettered().await;
            }
            dead_lettered_to = Some(uri);
        }

        let handled = match policy
            .and_then(ExceptionPolicy::handled_predicate)
            .or(self.handled.as_ref())
        {
            Some(predicate) => predicate.matches(exchange),
            None => self.kind == HandlerKind::DeadLetterChannel,
        };

        if handled {
            exchange.clear_exception();
            exchange.set_property(PropertyKey::ErrorHandlerHandled, true);
            if redelivery_policy.log_handled() {
                info!(exchange_id = %exchange.id(), error = %error, "failure handled");
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_handled().await;
            }
            match dead_lettered_to {
                Some(endpoint) => Outcome::DeadLettered { endpoint },
                None => Outcome::Handled,
            }
        } else {
            exchange.set_property(PropertyKey::ErrorHandlerHandled, false);
            exchange.set_exception(error.clone());
            Outcome::Fatal(error)
        }
    }

    fn log_retry(
        &self,
        exchange: &Exchange,
        error: &CapturedError,
        policy: &RedeliveryPolicy,
        attempt: u32,
        delay: Duration,
    ) {
        if !policy.log_retry_attempted() {
            return;
        }
        let level = effective_level(exchange, policy.retry_attempted_log_level());
        let detail = render_error(error, policy);
        log_at(
            level,
            exchange,
            &format!(
                "failed delivery, redelivery attempt {} in {}ms: {}",
                attempt,
                delay.as_millis(),
                detail
            ),
        );
    }

    fn log_exhausted(&self, exchange: &Exchange, error: &CapturedError, policy: &RedeliveryPolicy) {
        if !policy.log_exhausted() {
            return;
        }
        let level = effective_level(exchange, policy.retries_exhausted_log_level());
        let detail = render_error(error, policy);
        let attempts = exchange
            .property_as::<i64>(PropertyKey::RedeliveryCounter)
            .unwrap_or(0);
        log_at(
            level,
            exchange,
            &format!(
                "failed delivery, exhausted after {} redeliveries: {}",
                attempts, detail
            ),
        );
    }
}

fn render_error(error: &CapturedError, policy: &RedeliveryPolicy) -> String {
    if policy.log_stack_trace() {
        error.render_chain()
    } else {
        error.to_string()
    }
}

/// Rollback-only exchanges are never logged above warn
fn effective_level(exchange: &Exchange, level: LoggingLevel) -> LoggingLevel {
    if exchange.is_rollback_only() && level == LoggingLevel::Error {
        LoggingLevel::Warn
    } else {
        level
    }
}

fn log_at(level: LoggingLevel, exchange: &Exchange, message: &str) {
    let exchange_id = exchange.id();
    match level {
        LoggingLevel::Trace => trace!(%exchange_id, "{}", message),
        LoggingLevel::Debug => debug!(%exchange_id, "{}", message),
        LoggingLevel::Info => info!(%exchange_id, "{}", message),
        LoggingLevel::Warn => warn!(%exchange_id, "{}", message),
        LoggingLevel::Error => error!(%exchange_id, "{}", message),
        LoggingLevel::Off => {}
    }
}

#[async_trait]
impl Processor for RedeliveryErrorHandler {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        self.handle(exchange).await;
        Ok(())
    }

    fn name(&self) -> &str {
        match self.kind {
            HandlerKind::Default => "error-handler",
            HandlerKind::DeadLetterChannel => "dead-letter-channel",
        }
    }
}

impl fmt::Debug for RedeliveryErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeliveryErrorHandler")
            .field("kind", &self.kind)
            .field("dead_letter", &self.dead_letter.as_ref().map(|(uri, _)| uri))
            .field("redelivery_policy", &self.redelivery_policy)
            .field("exception_policies", &self.exception_policies.len())
            .finish()
    }
}
