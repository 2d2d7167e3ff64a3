//! Subscriber installation

use crate::{LogFormat, ObservabilityConfig, ObservabilityError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber
///
/// `RUST_LOG` takes precedence over `config.default_filter`. Only the first
/// call succeeds; later calls return [`ObservabilityError::AlreadyInitialized`].
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_filter)
            .map_err(|e| ObservabilityError::Config(format!("invalid filter: {}", e)))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(config.with_target);
    let result = match config.format {
        LogFormat::Json => registry.with(fmt_layer.json()).try_init(),
        LogFormat::Pretty => registry.with(fmt_layer.pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt_layer.compact()).try_init(),
    };
    result.map_err(|_| ObservabilityError::AlreadyInitialized)?;

    tracing::info!(
        format = ?config.format,
        filter = %config.default_filter,
        "Initialized structured tracing"
    );
    Ok(())
}
