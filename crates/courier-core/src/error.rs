//! Error types for routing operations

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by processors
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type for routing operations
pub type CourierResult<T> = Result<T, CourierError>;

/// Errors raised by the routing engine itself
#[derive(Error, Debug)]
pub enum CourierError {
    /// Configuration rejected before a route starts
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No endpoint registered under the given URI
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    /// An exchange left the route with an unrecovered failure
    #[error("Routing failed for exchange {exchange_id}: {source}")]
    RoutingFailure {
        exchange_id: String,
        #[source]
        source: CapturedError,
    },

    /// An asynchronous step dropped its callback without completing
    #[error("Asynchronous callback dropped before completion")]
    CallbackDropped,

    /// The idempotent key expression produced no key
    #[error("No message id could be computed for exchange {0}")]
    NoMessageId(String),

    /// The operation is not supported by this component
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Consumer or service lifecycle misuse
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    /// Misconfiguration is never retried by an error handler
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CourierError::InvalidConfig(_) | CourierError::EndpointNotFound(_)
        )
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Serialization(err.to_string())
    }
}

/// A failure captured on an exchange
///
/// Cheap to clone; keeps the full `source()` chain so policies can match on
/// any cause.
#[derive(Clone)]
pub struct CapturedError(Arc<dyn StdError + Send + Sync + 'static>);

impl CapturedError {
    pub fn new(err: impl Into<BoxError>) -> Self {
        match err.into().downcast::<CapturedError>() {
            Ok(captured) => *captured,
            Err(other) => Self(Arc::from(other)),
        }
    }

    /// The error followed by each of its sources, outermost first
    ///
    /// Captured errors nested inside the chain are replaced by the error
    /// they wrap.
    pub fn chain(&self) -> impl Iterator<Item = &(dyn StdError + 'static)> {
        let top: &(dyn StdError + 'static) = self.0.as_ref();
        std::iter::successors(Some(unwrap_captured(top)), |&err| {
            err.source().map(unwrap_captured)
        })
    }

    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.chain().any(|err| err.is::<E>())
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.chain().find_map(|err| err.downcast_ref::<E>())
    }

    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let top: &(dyn StdError + 'static) = self.0.as_ref();
        self.chain().last().unwrap_or(top)
    }

    /// True when the chain contains a fatal [`CourierError`]
    pub fn is_fatal(&self) -> bool {
        self.chain()
            .filter_map(|err| err.downcast_ref::<CourierError>())
            .any(CourierError::is_fatal)
    }

    /// Renders the chain as `outer: cause: root`
    pub fn render_chain(&self) -> String {
        self.chain()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ")
    }
}

fn unwrap_captured<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    match err.downcast_ref::<CapturedError>() {
        Some(captured) => unwrap_captured(captured.0.as_ref()),
        None => err,
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl StdError for CapturedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<CourierError> for CapturedError {
    fn from(err: CourierError) -> Self {
        CapturedError::new(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk full")]
    struct DiskFull;

    #[derive(Debug, Error)]
    #[error("write failed")]
    struct WriteFailed(#[source] DiskFull);

    #[test]
    fn test_chain_matching() {
        let captured = CapturedError::new(WriteFailed(DiskFull));
        assert!(captured.is::<WriteFailed>());
        assert!(captured.is::<DiskFull>());
        assert!(!captured.is::<CourierError>());
        assert_eq!(captured.root_cause().to_string(), "disk full");
        assert_eq!(captured.render_chain(), "write failed: disk full");
        assert!(captured.downcast_ref::<DiskFull>().is_some());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CourierError::InvalidConfig("bad".into()).is_fatal());
        assert!(!CourierError::CallbackDropped.is_fatal());
        assert!(CapturedError::from(CourierError::EndpointNotFound("x".into())).is_fatal());
        assert!(!CapturedError::new("plain message").is_fatal());
    }

    #[test]
    fn test_nested_routing_failure_exposes_cause() {
        let nested = CapturedError::new(CourierError::RoutingFailure {
            exchange_id: "e".into(),
            source: CapturedError::new(WriteFailed(DiskFull)),
        });

        assert!(nested.is::<WriteFailed>());
        assert!(nested.is::<DiskFull>());
        assert_eq!(nested.chain().count(), 3);
        assert_eq!(nested.root_cause().to_string(), "disk full");
        assert!(!nested.is_fatal());
    }

    #[test]
    fn test_nested_misconfiguration_is_fatal() {
        let nested = CapturedError::new(CourierError::RoutingFailure {
            exchange_id: "e".into(),
            source: CapturedError::from(CourierError::InvalidConfig("bad uri".into())),
        });
        assert!(nested.is_fatal());
    }

    #[test]
    fn test_new_does_not_rewrap() {
        let captured = CapturedError::new(DiskFull);
        let again = CapturedError::new(captured.clone());
        assert_eq!(again.chain().count(), 1);
        assert!(again.is::<DiskFull>());
    }
}
