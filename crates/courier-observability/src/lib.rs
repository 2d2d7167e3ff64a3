//! Courier Observability
//!
//! Structured logging for routes. Every component logs through `tracing`
//! with exchange ids as fields; this crate installs the subscriber that
//! renders those events and provides spans that scope them to an exchange.

#[cfg(feature = "tracing")]
pub mod trace;

pub mod span;

#[cfg(feature = "tracing")]
pub use trace::init_tracing;

pub use span::{exchange_span, route_span};

use serde::{Deserialize, Serialize};

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Human-readable multi-line output
    Pretty,
    /// Single-line human-readable output
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(ObservabilityError::Config(format!(
                "unknown log format '{}'",
                other
            ))),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
    pub format: LogFormat,
    /// Include the target module in each event
    pub with_target: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::default(),
            with_target: true,
        }
    }
}

/// Observability framework errors
#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("Tracing already initialized")]
    AlreadyInitialized,

    #[error("Configuration error: {0}")]
    Config(String),
}
