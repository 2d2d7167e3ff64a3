//! The message envelope carried by an exchange

use crate::convert::{TypeConverter, convert_to};
use crate::headers::Headers;
use crate::value::{FromValue, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Unique message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Headers, a body, named binary attachments and a fault flag
///
/// Cloning a message deep-copies its headers while the body and attachments
/// are shared by reference until replaced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Message {
    id: MessageId,
    headers: Headers,
    body: Option<Arc<Value>>,
    attachments: BTreeMap<String, Arc<Vec<u8>>>,
    fault: bool,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.set_body(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn header_as<T: FromValue>(&self, name: &str, converter: &dyn TypeConverter) -> Option<T> {
        self.headers.get_as(name, converter)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_deref()
    }

    /// Shared handle to the body, used when copying a message cheaply
    pub fn body_ref(&self) -> Option<Arc<Value>> {
        self.body.clone()
    }

    pub fn body_as<T: FromValue>(&self, converter: &dyn TypeConverter) -> Option<T> {
        self.body().and_then(|body| convert_to(converter, body))
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = Some(Arc::new(body.into()));
    }

    pub fn clear_body(&mut self) {
        self.body = None;
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn add_attachment(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.attachments.insert(name.into(), Arc::new(data));
    }

    pub fn attachment(&self, name: &str) -> Option<&[u8]> {
        self.attachments.get(name).map(|data| data.as_slice())
    }

    pub fn remove_attachment(&mut self, name: &str) -> bool {
        self.attachments.remove(name).is_some()
    }

    pub fn attachment_names(&self) -> impl Iterator<Item = &str> {
        self.attachments.keys().map(String::as_str)
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn is_fault(&self) -> bool {
        self.fault
    }

    pub fn set_fault(&mut self, fault: bool) {
        self.fault = fault;
    }

    /// Copy with independent headers; body and attachments are shared
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Replaces the contents of this message with those of `other`, keeping this id
    pub fn copy_from(&mut self, other: &Message) {
        self.headers = other.headers.clone();
        self.body = other.body.clone();
        self.attachments = other.attachments.clone();
        self.fault = other.fault;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::DefaultTypeConverter;

    #[test]
    fn test_copy_shares_body_and_isolates_headers() {
        let original = Message::new().with_body("payload").with_header("A", 1_i64);
        let mut copy = original.copy();

        copy.set_header("a", 2_i64);
        assert_eq!(original.header("A"), Some(&Value::Int(1)));
        assert_eq!(copy.header("A"), Some(&Value::Int(2)));

        let (Some(a), Some(b)) = (original.body_ref(), copy.body_ref()) else {
            panic!("both messages should carry a body");
        };
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(copy.id(), original.id());
    }

    #[test]
    fn test_body_conversion_fails_softly() {
        let conv = DefaultTypeConverter;
        let msg = Message::new().with_body("17");
        assert_eq!(msg.body_as::<i64>(&conv), Some(17));
        assert_eq!(msg.body_as::<bool>(&conv), None);
        assert_eq!(Message::new().body_as::<String>(&conv), None);
    }

    #[test]
    fn test_attachments() {
        let mut msg = Message::new();
        msg.add_attachment("report.pdf", vec![1, 2, 3]);
        assert!(msg.has_attachments());
        assert_eq!(msg.attachment("report.pdf"), Some(&[1u8, 2, 3][..]));
        assert!(msg.remove_attachment("report.pdf"));
        assert!(!msg.remove_attachment("report.pdf"));
    }

    #[test]
    fn test_copy_from_keeps_id() {
        let source = Message::new().with_body("x").with_header("h", "v");
        let mut target = Message::new();
        let id = target.id().clone();
        target.copy_from(&source);
        assert_eq!(target.id(), &id);
        assert_eq!(target.body(), Some(&Value::from("x")));
        assert_eq!(target.header("H"), Some(&Value::from("v")));
    }
}
