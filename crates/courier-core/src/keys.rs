//! Well-known exchange property keys
//!
//! Property names are case-sensitive. Each known key has a fixed string form;
//! [`PropertyKey::Custom`] carries any other name unchanged.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    BatchIndex,
    BatchSize,
    BatchComplete,
    RedeliveryCounter,
    Redelivered,
    RedeliveryExhausted,
    RollbackOnly,
    FailureHandled,
    ErrorHandlerHandled,
    ExceptionCaught,
    CorrelationId,
    FromEndpoint,
    ToEndpoint,
    InterceptedEndpoint,
    FailureEndpoint,
    RouteStop,
    DuplicateMessage,
    Custom(String),
}

const WELL_KNOWN: &[(PropertyKey, &str)] = &[
    (PropertyKey::BatchIndex, "CourierBatchIndex"),
    (PropertyKey::BatchSize, "CourierBatchSize"),
    (PropertyKey::BatchComplete, "CourierBatchComplete"),
    (PropertyKey::RedeliveryCounter, "CourierRedeliveryCounter"),
    (PropertyKey::Redelivered, "CourierRedelivered"),
    (PropertyKey::RedeliveryExhausted, "CourierRedeliveryExhausted"),
    (PropertyKey::RollbackOnly, "CourierRollbackOnly"),
    (PropertyKey::FailureHandled, "CourierFailureHandled"),
    (PropertyKey::ErrorHandlerHandled, "CourierErrorHandlerHandled"),
    (PropertyKey::ExceptionCaught, "CourierExceptionCaught"),
    (PropertyKey::CorrelationId, "CourierCorrelationId"),
    (PropertyKey::FromEndpoint, "CourierFromEndpoint"),
    (PropertyKey::ToEndpoint, "CourierToEndpoint"),
    (PropertyKey::InterceptedEndpoint, "CourierInterceptedEndpoint"),
    (PropertyKey::FailureEndpoint, "CourierFailureEndpoint"),
    (PropertyKey::RouteStop, "CourierRouteStop"),
    (PropertyKey::DuplicateMessage, "CourierDuplicateMessage"),
];

impl PropertyKey {
    pub fn as_str(&self) -> &str {
        if let PropertyKey::Custom(name) = self {
            return name;
        }
        WELL_KNOWN
            .iter()
            .find(|(key, _)| key == self)
            .map(|(_, name)| *name)
            .unwrap_or_default()
    }

    pub fn is_well_known(&self) -> bool {
        !matches!(self, PropertyKey::Custom(_))
    }
}

impl AsRef<str> for PropertyKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        WELL_KNOWN
            .iter()
            .find(|(_, known)| *known == name)
            .map(|(key, _)| key.clone())
            .unwrap_or_else(|| PropertyKey::Custom(name.to_string()))
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        PropertyKey::from(name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_keys_round_trip_by_name() {
        for (key, name) in WELL_KNOWN {
            assert_eq!(key.as_str(), *name);
            assert_eq!(&PropertyKey::from(*name), key);
        }
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        let key = PropertyKey::from("courierredeliverycounter");
        assert_eq!(
            key,
            PropertyKey::Custom("courierredeliverycounter".to_string())
        );
        assert!(!key.is_well_known());
    }
}
