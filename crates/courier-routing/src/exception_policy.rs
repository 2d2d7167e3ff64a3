//! Per-error-type handling policies
//!
//! An [`ExceptionPolicy`] matches a captured error by type and can override
//! how the error handler treats it: its own redelivery policy, handled and
//! retry-while predicates, an on-redelivery hook, use of the original message
//! and a dedicated dead-letter endpoint.

use crate::redelivery::RedeliveryPolicy;
use courier_core::{CapturedError, Predicate, Processor, expression};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

type Matcher = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ExceptionPolicy {
    name: String,
    matcher: Matcher,
    redelivery_policy: Option<RedeliveryPolicy>,
    handled: Option<Arc<dyn Predicate>>,
    retry_while: Option<Arc<dyn Predicate>>,
    on_redelivery: Option<Arc<dyn Processor>>,
    use_original_message: Option<bool>,
    dead_letter_uri: Option<String>,
}

impl ExceptionPolicy {
    /// Matches errors of type `E` anywhere in the cause chain
    pub fn on<E: StdError + 'static>() -> Self {
        Self::matching(std::any::type_name::<E>(), |err| err.is::<E>())
    }

    /// Matches errors accepted by `matcher`
    pub fn matching<F>(name: impl Into<String>, matcher: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matcher: Arc::new(matcher),
            redelivery_policy: None,
            handled: None,
            retry_while: None,
            on_redelivery: None,
            use_original_message: None,
            dead_letter_uri: None,
        }
    }

    pub fn with_redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery_policy = Some(policy);
        self
    }

    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = Some(expression::constant(handled));
        self
    }

    pub fn handled_when(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.handled = Some(predicate);
        self
    }

    pub fn retry_while(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.retry_while = Some(predicate);
        self
    }

    pub fn on_redelivery(mut self, processor: Arc<dyn Processor>) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    pub fn use_original_message(mut self, enabled: bool) -> Self {
        self.use_original_message = Some(enabled);
        self
    }

    pub fn dead_letter_uri(mut self, uri: impl Into<String>) -> Self {
        self.dead_letter_uri = Some(uri.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, err: &(dyn StdError + 'static)) -> bool {
        (self.matcher)(err)
    }

    pub fn redelivery_policy(&self) -> Option<&RedeliveryPolicy> {
        self.redelivery_policy.as_ref()
    }

    pub fn handled_predicate(&self) -> Option<&Arc<dyn Predicate>> {
        self.handled.as_ref()
    }

    pub fn retry_while_predicate(&self) -> Option<&Arc<dyn Predicate>> {
        self.retry_while.as_ref()
    }

    pub fn on_redelivery_processor(&self) -> Option<&Arc<dyn Processor>> {
        self.on_redelivery.as_ref()
    }

    pub fn original_message_override(&self) -> Option<bool> {
        self.use_original_message
    }

    pub fn dead_letter(&self) -> Option<&str> {
        self.dead_letter_uri.as_deref()
    }
}

impl fmt::Debug for ExceptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionPolicy")
            .field("name", &self.name)
            .field("redelivery_policy", &self.redelivery_policy)
            .field("dead_letter_uri", &self.dead_letter_uri)
            .finish_non_exhaustive()
    }
}

/// Selects the policy that applies to a captured error
pub trait ExceptionPolicyStrategy: Send + Sync {
    fn resolve<'a>(
        &self,
        policies: &'a [ExceptionPolicy],
        error: &CapturedError,
    ) -> Option<&'a ExceptionPolicy>;
}

/// Walks the cause chain from the innermost cause outward; for each cause the
/// first registered policy that matches wins
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExceptionPolicyStrategy;

impl ExceptionPolicyStrategy for DefaultExceptionPolicyStrategy {
    fn resolve<'a>(
        &self,
        policies: &'a [ExceptionPolicy],
        error: &CapturedError,
    ) -> Option<&'a ExceptionPolicy> {
        let causes: Vec<&(dyn StdError + 'static)> = error.chain().collect();
        causes
            .iter()
            .rev()
            .find_map(|cause| policies.iter().find(|policy| policy.matches(*cause)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::CourierError;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("connection reset")]
    struct ConnectionReset;

    #[derive(Debug, Error)]
    #[error("io failure")]
    struct IoFailure(#[source] ConnectionReset);

    #[derive(Debug, Error)]
    #[error("validation failed")]
    struct ValidationFailed;

    #[test]
    fn test_innermost_cause_wins() {
        let policies = vec![
            ExceptionPolicy::on::<IoFailure>().dead_letter_uri("dlq:io"),
            ExceptionPolicy::on::<ConnectionReset>().dead_letter_uri("dlq:reset"),
        ];
        let error = CapturedError::new(IoFailure(ConnectionReset));

        let resolved = DefaultExceptionPolicyStrategy.resolve(&policies, &error);
        assert_eq!(resolved.and_then(ExceptionPolicy::dead_letter), Some("dlq:reset"));
    }

    #[test]
    fn test_falls_back_to_outer_cause() {
        let policies = vec![ExceptionPolicy::on::<IoFailure>().handled(true)];
        let error = CapturedError::new(IoFailure(ConnectionReset));
        assert!(DefaultExceptionPolicyStrategy.resolve(&policies, &error).is_some());
    }

    #[test]
    fn test_first_registered_wins_for_same_cause() {
        let policies = vec![
            ExceptionPolicy::matching("any", |_| true).dead_letter_uri("dlq:first"),
            ExceptionPolicy::on::<ValidationFailed>().dead_letter_uri("dlq:second"),
        ];
        let error = CapturedError::new(ValidationFailed);
        let resolved = DefaultExceptionPolicyStrategy.resolve(&policies, &error);
        assert_eq!(resolved.and_then(ExceptionPolicy::dead_letter), Some("dlq:first"));
    }

    #[test]
    fn test_resolves_cause_of_nested_route_failure() {
        let policies = vec![ExceptionPolicy::on::<ConnectionReset>().dead_letter_uri("dlq:reset")];
        let error = CapturedError::new(CourierError::RoutingFailure {
            exchange_id: "e".into(),
            source: CapturedError::new(ConnectionReset),
        });

        let resolved = DefaultExceptionPolicyStrategy.resolve(&policies, &error);
        assert_eq!(resolved.and_then(ExceptionPolicy::dead_letter), Some("dlq:reset"));
    }

    #[test]
    fn test_no_match() {
        let policies = vec![ExceptionPolicy::on::<ValidationFailed>()];
        let error = CapturedError::new(ConnectionReset);
        assert!(DefaultExceptionPolicyStrategy.resolve(&policies, &error).is_none());
    }
}
