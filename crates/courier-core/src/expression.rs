//! Predicates and expressions evaluated against an exchange

use crate::exchange::Exchange;
use crate::value::Value;
use std::sync::Arc;

pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> bool {
        self(exchange)
    }
}

pub trait Expression: Send + Sync {
    fn evaluate(&self, exchange: &Exchange) -> Option<Value>;
}

impl<F> Expression for F
where
    F: Fn(&Exchange) -> Option<Value> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Option<Value> {
        self(exchange)
    }
}

/// A predicate that always evaluates to `value`
pub fn constant(value: bool) -> Arc<dyn Predicate> {
    Arc::new(move |_: &Exchange| value)
}

/// Inbound header value
pub fn header(name: impl Into<String>) -> Arc<dyn Expression> {
    let name = name.into();
    Arc::new(move |exchange: &Exchange| exchange.in_message().header(&name).cloned())
}

/// Exchange property value
pub fn property(name: impl Into<String>) -> Arc<dyn Expression> {
    let name = name.into();
    Arc::new(move |exchange: &Exchange| exchange.property(&name).cloned())
}

/// Inbound body
pub fn body() -> Arc<dyn Expression> {
    Arc::new(|exchange: &Exchange| exchange.in_message().body().cloned())
}

/// Inbound message id
pub fn message_id() -> Arc<dyn Expression> {
    Arc::new(|exchange: &Exchange| Some(Value::from(exchange.in_message().id().as_str())))
}
