//! The exchange: one unit of work moving through a route
//!
//! An [`Exchange`] owns its inbound message, an optional outbound and fault
//! message, the failure captured by the last step, and a case-sensitive
//! property bag used for routing bookkeeping. It has exactly one writer at a
//! time: processors receive it by `&mut`, asynchronous steps by value.

use crate::context::RouteContext;
use crate::convert::convert_to;
use crate::error::{BoxError, CapturedError};
use crate::keys::PropertyKey;
use crate::message::Message;
use crate::unit_of_work::{Synchronization, UnitOfWork};
use crate::value::{FromValue, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique exchange identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-way or request-reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePattern {
    #[default]
    InOnly,
    InOut,
}

pub struct Exchange {
    id: ExchangeId,
    pattern: ExchangePattern,
    context: RouteContext,
    in_message: Message,
    out_message: Option<Message>,
    fault: Option<Message>,
    exception: Option<CapturedError>,
    caught_exception: Option<CapturedError>,
    properties: HashMap<String, Value>,
    unit_of_work: Option<UnitOfWork>,
    from_endpoint: Option<String>,
    created_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(context: RouteContext) -> Self {
        Self {
            id: ExchangeId::new(),
            pattern: ExchangePattern::default(),
            context,
            in_message: Message::new(),
            out_message: None,
            fault: None,
            exception: None,
            caught_exception: None,
            properties: HashMap::new(),
            unit_of_work: None,
            from_endpoint: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.in_message.set_body(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.in_message.set_header(name, value);
        self
    }

    pub fn id(&self) -> ExchangeId {
        self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn context(&self) -> &RouteContext {
        &self.context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn from_endpoint(&self) -> Option<&str> {
        self.from_endpoint.as_deref()
    }

    pub fn set_from_endpoint(&mut self, uri: impl Into<String>) {
        self.from_endpoint = Some(uri.into());
    }

    // --- messages ---

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn set_in_message(&mut self, message: Message) {
        self.in_message = message;
    }

    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    /// Returns the outbound message, creating an empty one on first access
    pub fn out_message_mut(&mut self) -> &mut Message {
        self.out_message.get_or_insert_with(Message::new)
    }

    pub fn set_out_message(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    pub fn take_out_message(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    pub fn fault(&self) -> Option<&Message> {
        self.fault.as_ref()
    }

    /// Sets a fault message, marking it as a fault
    pub fn set_fault(&mut self, mut message: Message) {
        message.set_fault(true);
        self.fault = Some(message);
    }

    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    /// The fault message if present, else the outbound, else the inbound
    pub fn active_message(&self) -> &Message {
        self.fault
            .as_ref()
            .or(self.out_message.as_ref())
            .unwrap_or(&self.in_message)
    }

    /// Makes the outbound message (if any) the inbound message of the next step
    pub fn promote_out_to_in(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
        }
    }

    // --- failure state ---

    pub fn is_failed(&self) -> bool {
        self.exception.is_some() || self.active_message().is_fault()
    }

    pub fn exception(&self) -> Option<&CapturedError> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, err: CapturedError) {
        self.exception = Some(err);
    }

    /// Records `err` as the current failure
    pub fn fail(&mut self, err: impl Into<BoxError>) {
        self.exception = Some(CapturedError::new(err));
    }

    pub fn take_exception(&mut self) -> Option<CapturedError> {
        self.exception.take()
    }

    pub fn clear_exception(&mut self) {
        self.exception = None;
    }

    /// The failure an error handler caught, kept after the exception is cleared
    pub fn caught_exception(&self) -> Option<&CapturedError> {
        self.caught_exception.as_ref()
    }

    pub fn set_caught_exception(&mut self, err: CapturedError) {
        self.set_property(PropertyKey::ExceptionCaught, err.to_string());
        self.caught_exception = Some(err);
    }

    pub fn is_rollback_only(&self) -> bool {
        self.property_flag(PropertyKey::RollbackOnly)
    }

    pub fn set_rollback_only(&mut self, rollback_only: bool) {
        if rollback_only {
            self.set_property(PropertyKey::RollbackOnly, true);
        } else {
            self.remove_property(PropertyKey::RollbackOnly);
        }
    }

    // --- properties ---

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn property(&self, key: impl AsRef<str>) -> Option<&Value> {
        self.properties.get(key.as_ref())
    }

    pub fn property_as<T: FromValue>(&self, key: impl AsRef<str>) -> Option<T> {
        self.property(key)
            .and_then(|value| convert_to(self.context.type_converter(), value))
    }

    /// True when the property is set and converts to `true`
    pub fn property_flag(&self, key: impl AsRef<str>) -> bool {
        self.property_as::<bool>(key).unwrap_or(false)
    }

    pub fn set_property(&mut self, key: impl AsRef<str>, value: impl Into<Value>) {
        self.properties
            .insert(key.as_ref().to_string(), value.into());
    }

    pub fn remove_property(&mut self, key: impl AsRef<str>) -> Option<Value> {
        self.properties.remove(key.as_ref())
    }

    pub fn has_property(&self, key: impl AsRef<str>) -> bool {
        self.properties.contains_key(key.as_ref())
    }

    // --- unit of work ---

    pub fn unit_of_work(&self) -> Option<&UnitOfWork> {
        self.unit_of_work.as_ref()
    }

    pub fn unit_of_work_mut(&mut self) -> Option<&mut UnitOfWork> {
        self.unit_of_work.as_mut()
    }

    pub fn set_unit_of_work(&mut self, unit_of_work: UnitOfWork) {
        self.unit_of_work = Some(unit_of_work);
    }

    pub fn take_unit_of_work(&mut self) -> Option<UnitOfWork> {
        self.unit_of_work.take()
    }

    /// The inbound message as it was when the unit of work began
    pub fn original_message(&self) -> Option<&Message> {
        self.unit_of_work
            .as_ref()
            .map(UnitOfWork::original_in_message)
    }

    /// Registers a completion callback, starting a unit of work if needed
    pub fn add_on_completion(&mut self, synchronization: Box<dyn Synchronization>) {
        if self.unit_of_work.is_none() {
            self.unit_of_work = Some(UnitOfWork::new(self));
        }
        if let Some(uow) = self.unit_of_work.as_mut() {
            uow.add_synchronization(synchronization);
        }
    }

    /// Moves this exchange's completion callbacks onto `target`
    pub fn handover_completions(&mut self, target: &mut Exchange) {
        if let Some(uow) = self.unit_of_work.as_mut() {
            for synchronization in uow.drain_for_handover() {
                target.add_on_completion(synchronization);
            }
        }
    }

    // --- copying ---

    /// Independent copy sharing the context
    ///
    /// The copy gets a fresh id and no unit of work; message headers and
    /// properties are cloned, message bodies are shared by reference.
    pub fn copy(&self) -> Exchange {
        Exchange {
            id: ExchangeId::new(),
            pattern: self.pattern,
            context: self.context.clone(),
            in_message: self.in_message.copy(),
            out_message: self.out_message.as_ref().map(Message::copy),
            fault: self.fault.as_ref().map(Message::copy),
            exception: self.exception.clone(),
            caught_exception: self.caught_exception.clone(),
            properties: self.properties.clone(),
            unit_of_work: None,
            from_endpoint: self.from_endpoint.clone(),
            created_at: self.created_at,
        }
    }

    /// Moves the full state out, leaving an empty exchange with the same id
    pub fn take(&mut self) -> Exchange {
        let blank = Exchange {
            id: self.id,
            pattern: self.pattern,
            context: self.context.clone(),
            in_message: Message::new(),
            out_message: None,
            fault: None,
            exception: None,
            caught_exception: None,
            properties: HashMap::new(),
            unit_of_work: None,
            from_endpoint: self.from_endpoint.clone(),
            created_at: self.created_at,
        };
        std::mem::replace(self, blank)
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("context", &self.context.name())
            .field("in", &self.in_message)
            .field("out", &self.out_message)
            .field("fault", &self.fault)
            .field("exception", &self.exception)
            .field("properties", &self.properties)
            .field(
                "synchronizations",
                &self.unit_of_work.as_ref().map_or(0, UnitOfWork::len),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RouteContext;
    use std::sync::{Arc, Mutex};

    fn exchange() -> Exchange {
        Exchange::new(RouteContext::new("test"))
    }

    #[test]
    fn test_is_failed_tracks_exception_and_fault() {
        let mut ex = exchange();
        assert!(!ex.is_failed());

        ex.fail("boom");
        assert!(ex.is_failed());
        ex.clear_exception();
        assert!(!ex.is_failed());

        ex.out_message_mut().set_fault(true);
        assert!(ex.is_failed());

        ex.set_fault(Message::new());
        ex.out_message_mut().set_fault(false);
        assert!(ex.is_failed(), "fault message takes precedence");
        ex.clear_fault();
        assert!(!ex.is_failed());
    }

    #[test]
    fn test_out_message_created_lazily() {
        let mut ex = exchange().with_body("in");
        assert!(!ex.has_out());
        ex.out_message_mut().set_body("out");
        assert!(ex.has_out());
        assert_eq!(ex.active_message().body(), Some(&Value::from("out")));

        ex.promote_out_to_in();
        assert!(!ex.has_out());
        assert_eq!(ex.in_message().body(), Some(&Value::from("out")));
    }

    #[test]
    fn test_properties_are_case_sensitive() {
        let mut ex = exchange();
        ex.set_property(PropertyKey::RedeliveryCounter, 2_i64);
        assert_eq!(ex.property_as::<i64>("CourierRedeliveryCounter"), Some(2));
        assert!(ex.property("courierredeliverycounter").is_none());

        ex.set_property("retries", "3");
        assert_eq!(ex.property_as::<i64>("retries"), Some(3));
        assert_eq!(ex.remove_property("retries"), Some(Value::from("3")));
    }

    #[test]
    fn test_rollback_flag() {
        let mut ex = exchange();
        ex.set_rollback_only(true);
        assert!(ex.is_rollback_only());
        ex.set_rollback_only(false);
        assert!(!ex.has_property(PropertyKey::RollbackOnly));
    }

    struct Flag(Arc<Mutex<Vec<&'static str>>>);

    impl Synchronization for Flag {
        fn on_complete(&self, _exchange: &Exchange) {
            self.0.lock().unwrap().push("complete");
        }

        fn on_failure(&self, _exchange: &Exchange) {
            self.0.lock().unwrap().push("failure");
        }
    }

    #[test]
    fn test_copy_does_not_carry_unit_of_work() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ex = exchange().with_body("payload").with_header("Trace", "a");
        ex.set_property("k", 1_i64);
        ex.add_on_completion(Box::new(Flag(log.clone())));

        let mut copy = ex.copy();
        assert_ne!(copy.id(), ex.id());
        assert!(copy.unit_of_work().is_none());
        assert_eq!(copy.property_as::<i64>("k"), Some(1));

        copy.in_message_mut().set_header("trace", "b");
        assert_eq!(
            ex.in_message().header("TRACE"),
            Some(&Value::from("a")),
            "headers are deep-copied"
        );
    }

    #[test]
    fn test_handover_moves_completions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut source = exchange();
        source.add_on_completion(Box::new(Flag(log.clone())));
        let mut target = exchange();

        source.handover_completions(&mut target);
        assert_eq!(source.unit_of_work().map(UnitOfWork::len), Some(0));
        assert_eq!(target.unit_of_work().map(UnitOfWork::len), Some(1));

        if let Some(uow) = target.take_unit_of_work() {
            uow.done(&target);
        }
        assert_eq!(*log.lock().unwrap(), vec!["complete"]);
    }

    #[test]
    fn test_take_leaves_blank_with_same_id() {
        let mut ex = exchange().with_body("x");
        ex.fail("err");
        let id = ex.id();
        let taken = ex.take();
        assert_eq!(taken.id(), id);
        assert!(taken.is_failed());
        assert_eq!(ex.id(), id);
        assert!(!ex.is_failed());
        assert!(ex.in_message().body().is_none());
    }
}
