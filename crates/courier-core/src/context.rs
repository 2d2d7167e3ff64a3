//! Shared routing context
//!
//! A [`RouteContext`] is cheap to clone and shared by every exchange it
//! creates. It resolves endpoints by URI and supplies the type converter used
//! by typed accessors.

use crate::convert::{DefaultTypeConverter, TypeConverter};
use crate::endpoint::Endpoint;
use crate::error::{CourierError, CourierResult};
use crate::exchange::{Exchange, ExchangePattern};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct RouteContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    name: String,
    converter: Arc<dyn TypeConverter>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
}

impl RouteContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_converter(name, Arc::new(DefaultTypeConverter))
    }

    pub fn with_converter(name: impl Into<String>, converter: Arc<dyn TypeConverter>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name: name.into(),
                converter,
                endpoints: DashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn type_converter(&self) -> &dyn TypeConverter {
        self.inner.converter.as_ref()
    }

    /// Registers an endpoint under its URI, returning any endpoint it replaced
    pub fn register_endpoint(&self, endpoint: Arc<dyn Endpoint>) -> Option<Arc<dyn Endpoint>> {
        let uri = endpoint.uri().to_string();
        debug!(context = %self.inner.name, uri = %uri, "registering endpoint");
        self.inner.endpoints.insert(uri, endpoint)
    }

    pub fn endpoint(&self, uri: &str) -> CourierResult<Arc<dyn Endpoint>> {
        self.inner
            .endpoints
            .get(uri)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CourierError::EndpointNotFound(uri.to_string()))
    }

    pub fn has_endpoint(&self, uri: &str) -> bool {
        self.inner.endpoints.contains_key(uri)
    }

    pub fn remove_endpoint(&self, uri: &str) -> Option<Arc<dyn Endpoint>> {
        self.inner.endpoints.remove(uri).map(|(_, endpoint)| endpoint)
    }

    pub fn endpoint_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .inner
            .endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        uris.sort();
        uris
    }

    pub fn create_exchange(&self, pattern: ExchangePattern) -> Exchange {
        Exchange::new(self.clone()).with_pattern(pattern)
    }

    /// True when both handles refer to the same context
    pub fn same_as(&self, other: &RouteContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RouteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteContext")
            .field("name", &self.inner.name)
            .field("endpoints", &self.inner.endpoints.len())
            .finish()
    }
}
