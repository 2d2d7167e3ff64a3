//! TOML routing configuration
//!
//! ```toml
//! [error_handler]
//! kind = "dead_letter_channel"
//! dead_letter_uri = "dlq:orders"
//! use_original_message = true
//!
//! [error_handler.redelivery]
//! maximum_redeliveries = 3
//! redelivery_delay = "250ms"
//! use_exponential_back_off = true
//!
//! [idempotent]
//! cache_size = 5000
//!
//! [consumer]
//! max_messages_per_poll = 100
//! poll_interval = "1s"
//! ```
//!
//! Every section and field is optional; missing values take the defaults of
//! the type they configure. Durations use humantime syntax.

use crate::batch::BatchConfig;
use crate::dlq::DlqConfig;
use crate::error_handler::{ErrorHandlerBuilder, HandlerKind};
use crate::idempotent::{IdempotentOptions, MemoryIdempotentRepository};
use crate::redelivery::{LoggingLevel, RedeliveryPolicy};
use courier_core::{CourierError, CourierResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub error_handler: ErrorHandlerConfig,
    pub idempotent: IdempotentConfig,
    pub consumer: ConsumerConfig,
    pub dead_letter_queue: DeadLetterQueueConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlerKind {
    #[default]
    Default,
    DeadLetterChannel,
}

impl From<ErrorHandlerKind> for HandlerKind {
    fn from(kind: ErrorHandlerKind) -> Self {
        match kind {
            ErrorHandlerKind::Default => HandlerKind::Default,
            ErrorHandlerKind::DeadLetterChannel => HandlerKind::DeadLetterChannel,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerConfig {
    pub kind: ErrorHandlerKind,
    pub dead_letter_uri: Option<String>,
    pub use_original_message: bool,
    /// Overrides the handled default of the handler kind
    pub handled: Option<bool>,
    pub redelivery: RedeliveryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    pub maximum_redeliveries: i32,
    #[serde(with = "duration_str")]
    pub redelivery_delay: Duration,
    #[serde(with = "duration_str")]
    pub maximum_redelivery_delay: Duration,
    pub back_off_multiplier: f64,
    pub use_exponential_back_off: bool,
    pub use_collision_avoidance: bool,
    pub collision_avoidance_percent: f64,
    pub delay_pattern: Option<String>,
    pub retry_attempted_log_level: LoggingLevel,
    pub retries_exhausted_log_level: LoggingLevel,
    pub log_stack_trace: bool,
    pub log_retry_attempted: bool,
    pub log_exhausted: bool,
    pub log_handled: bool,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        let policy = RedeliveryPolicy::default();
        Self {
            maximum_redeliveries: policy.maximum_redeliveries(),
            redelivery_delay: policy.redelivery_delay(),
            maximum_redelivery_delay: policy.maximum_redelivery_delay(),
            back_off_multiplier: policy.back_off_multiplier(),
            use_exponential_back_off: policy.uses_exponential_back_off(),
            use_collision_avoidance: policy.uses_collision_avoidance(),
            collision_avoidance_percent: policy.collision_avoidance_percent(),
            delay_pattern: None,
            retry_attempted_log_level: policy.retry_attempted_log_level(),
            retries_exhausted_log_level: policy.retries_exhausted_log_level(),
            log_stack_trace: policy.log_stack_trace(),
            log_retry_attempted: policy.log_retry_attempted(),
            log_exhausted: policy.log_exhausted(),
            log_handled: policy.log_handled(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotentConfig {
    pub cache_size: usize,
    pub eager: bool,
    pub skip_duplicate: bool,
    pub remove_on_failure: bool,
}

impl Default for IdempotentConfig {
    fn default() -> Self {
        let options = IdempotentOptions::default();
        Self {
            cache_size: MemoryIdempotentRepository::DEFAULT_CAPACITY,
            eager: options.eager,
            skip_duplicate: options.skip_duplicate,
            remove_on_failure: options.remove_on_failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub max_messages_per_poll: usize,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub initial_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        let batch = BatchConfig::default();
        Self {
            max_messages_per_poll: batch.max_messages_per_poll,
            poll_interval: batch.poll_interval,
            initial_delay: batch.initial_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterQueueConfig {
    pub enabled: bool,
    pub max_size: usize,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for DeadLetterQueueConfig {
    fn default() -> Self {
        let dlq = DlqConfig::default();
        Self {
            enabled: dlq.enabled,
            max_size: dlq.max_size,
            ttl: dlq.ttl,
        }
    }
}

impl RoutingConfig {
    /// Load routing configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> CourierResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CourierError::InvalidConfig(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate routing configuration from TOML
    pub fn from_toml_str(toml_content: &str) -> CourierResult<Self> {
        let config: Self = toml::from_str(toml_content).map_err(|e| {
            CourierError::InvalidConfig(format!("failed to parse TOML config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CourierResult<()> {
        self.redelivery_policy()?;

        if self.error_handler.kind == ErrorHandlerKind::DeadLetterChannel
            && self
                .error_handler
                .dead_letter_uri
                .as_deref()
                .is_none_or(|uri| uri.trim().is_empty())
        {
            return Err(CourierError::InvalidConfig(
                "dead_letter_channel requires dead_letter_uri".to_string(),
            ));
        }
        if self.idempotent.cache_size == 0 {
            return Err(CourierError::InvalidConfig(
                "idempotent.cache_size must be greater than zero".to_string(),
            ));
        }
        if self.consumer.poll_interval.is_zero() {
            return Err(CourierError::InvalidConfig(
                "consumer.poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.dead_letter_queue.max_size == 0 {
            return Err(CourierError::InvalidConfig(
                "dead_letter_queue.max_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn redelivery_policy(&self) -> CourierResult<RedeliveryPolicy> {
        let r = &self.error_handler.redelivery;
        let mut builder = RedeliveryPolicy::builder()
            .maximum_redeliveries(r.maximum_redeliveries)
            .redelivery_delay(r.redelivery_delay)
            .maximum_redelivery_delay(r.maximum_redelivery_delay)
            .back_off_multiplier(r.back_off_multiplier)
            .use_exponential_back_off(r.use_exponential_back_off)
            .use_collision_avoidance(r.use_collision_avoidance)
            .collision_avoidance_percent(r.collision_avoidance_percent)
            .retry_attempted_log_level(r.retry_attempted_log_level)
            .retries_exhausted_log_level(r.retries_exhausted_log_level)
            .log_stack_trace(r.log_stack_trace)
            .log_retry_attempted(r.log_retry_attempted)
            .log_exhausted(r.log_exhausted)
            .log_handled(r.log_handled);
        if let Some(pattern) = &r.delay_pattern {
            builder = builder.delay_pattern(pattern.as_str());
        }
        builder.build()
    }

    /// Error handler described by the `[error_handler]` section
    pub fn error_handler_builder(&self) -> CourierResult<ErrorHandlerBuilder> {
        let section = &self.error_handler;
        let mut builder = match (section.kind, &section.dead_letter_uri) {
            (ErrorHandlerKind::DeadLetterChannel, Some(uri)) => {
                ErrorHandlerBuilder::dead_letter_channel(uri.as_str())
            }
            (ErrorHandlerKind::DeadLetterChannel, None) => {
                return Err(CourierError::InvalidConfig(
                    "dead_letter_channel requires dead_letter_uri".to_string(),
                ));
            }
            (ErrorHandlerKind::Default, _) => ErrorHandlerBuilder::default_error_handler(),
        };

        builder = builder
            .redelivery_policy(self.redelivery_policy()?)
            .use_original_message(section.use_original_message);
        if let Some(handled) = section.handled {
            builder = builder.handled(handled);
        }
        Ok(builder)
    }

    pub fn idempotent_options(&self) -> IdempotentOptions {
        IdempotentOptions {
            eager: self.idempotent.eager,
            skip_duplicate: self.idempotent.skip_duplicate,
            remove_on_failure: self.idempotent.remove_on_failure,
        }
    }

    pub fn idempotent_repository(&self) -> MemoryIdempotentRepository {
        MemoryIdempotentRepository::new(self.idempotent.cache_size)
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_messages_per_poll: self.consumer.max_messages_per_poll,
            poll_interval: self.consumer.poll_interval,
            initial_delay: self.consumer.initial_delay,
        }
    }

    pub fn dlq_config(&self) -> DlqConfig {
        DlqConfig {
            max_size: self.dead_letter_queue.max_size,
            ttl: self.dead_letter_queue.ttl,
            enabled: self.dead_letter_queue.enabled,
        }
    }
}
