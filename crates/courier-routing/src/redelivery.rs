//! Redelivery policy: how often and how long to wait before retrying
//!
//! A [`RedeliveryPolicy`] is an immutable value built through
//! [`RedeliveryPolicyBuilder`]; validation happens in `build()` so a bad
//! configuration is rejected before any route runs.

use courier_core::{CourierError, CourierResult, Exchange, Predicate};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Log level selector for redelivery events
///
/// Deserialization accepts the same spellings as [`FromStr`], in any case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl FromStr for LoggingLevel {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LoggingLevel::Trace),
            "debug" => Ok(LoggingLevel::Debug),
            "info" => Ok(LoggingLevel::Info),
            "warn" | "warning" => Ok(LoggingLevel::Warn),
            "error" => Ok(LoggingLevel::Error),
            "off" => Ok(LoggingLevel::Off),
            other => Err(CourierError::InvalidConfig(format!(
                "unknown logging level '{}'",
                other
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for LoggingLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Explicit per-attempt delays, written `"threshold:millis;threshold:millis"`
///
/// The delay for attempt `n` is the one of the last group whose threshold is
/// at most `n`; attempts below the first threshold are not delayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayPattern {
    groups: Vec<(u32, Duration)>,
}

impl DelayPattern {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.groups
            .iter()
            .take_while(|(threshold, _)| *threshold <= attempt)
            .last()
            .map(|(_, delay)| *delay)
            .unwrap_or(Duration::ZERO)
    }

    pub fn groups(&self) -> &[(u32, Duration)] {
        &self.groups
    }
}

impl FromStr for DelayPattern {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: String| {
            CourierError::InvalidConfig(format!("invalid delay pattern '{}': {}", s, detail))
        };

        let mut groups: Vec<(u32, Duration)> = Vec::new();
        for group in s.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let (count, delay) = group
                .split_once(':')
                .ok_or_else(|| invalid(format!("group '{}' is not 'count:delay'", group)))?;
            let count: u32 = count
                .trim()
                .parse()
                .map_err(|_| invalid(format!("bad threshold in '{}'", group)))?;
            let delay: u64 = delay
                .trim()
                .parse()
                .map_err(|_| invalid(format!("bad delay in '{}'", group)))?;

            if let Some((previous, _)) = groups.last() {
                if count <= *previous {
                    return Err(invalid("thresholds must be strictly ascending".to_string()));
                }
            }
            groups.push((count, Duration::from_millis(delay)));
        }

        if groups.is_empty() {
            return Err(invalid("no groups".to_string()));
        }
        Ok(Self { groups })
    }
}

impl fmt::Display for DelayPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .groups
            .iter()
            .map(|(count, delay)| format!("{}:{}", count, delay.as_millis()))
            .collect();
        f.write_str(&rendered.join(";"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    maximum_redeliveries: i32,
    redelivery_delay: Duration,
    maximum_redelivery_delay: Duration,
    back_off_multiplier: f64,
    use_exponential_back_off: bool,
    use_collision_avoidance: bool,
    collision_avoidance_percent: f64,
    delay_pattern: Option<DelayPattern>,
    retry_attempted_log_level: LoggingLevel,
    retries_exhausted_log_level: LoggingLevel,
    log_stack_trace: bool,
    log_retry_attempted: bool,
    log_exhausted: bool,
    log_handled: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_millis(1000),
            maximum_redelivery_delay: Duration::from_secs(60),
            back_off_multiplier: 2.0,
            use_exponential_back_off: false,
            use_collision_avoidance: false,
            collision_avoidance_percent: 30.0,
            delay_pattern: None,
            retry_attempted_log_level: LoggingLevel::Debug,
            retries_exhausted_log_level: LoggingLevel::Error,
            log_stack_trace: true,
            log_retry_attempted: true,
            log_exhausted: true,
            log_handled: false,
        }
    }
}

impl RedeliveryPolicy {
    pub fn builder() -> RedeliveryPolicyBuilder {
        RedeliveryPolicyBuilder::default()
    }

    /// Whether the `counter`-th failure may be redelivered
    ///
    /// A `retry_while` predicate, when given, decides alone.
    pub fn should_redeliver(
        &self,
        exchange: &Exchange,
        counter: u32,
        retry_while: Option<&dyn Predicate>,
    ) -> bool {
        if let Some(predicate) = retry_while {
            return predicate.matches(exchange);
        }
        self.allows_attempt(counter)
    }

    /// Whether redelivery number `counter` is within `maximum_redeliveries`
    pub fn allows_attempt(&self, counter: u32) -> bool {
        match u32::try_from(self.maximum_redeliveries) {
            Ok(max) => counter <= max,
            Err(_) => true,
        }
    }

    /// Delay to wait before redelivery number `attempt` (1-indexed)
    pub fn redelivery_delay_for(&self, attempt: u32) -> Duration {
        if let Some(pattern) = &self.delay_pattern {
            return pattern.delay_for(attempt);
        }

        let base_ms = self.redelivery_delay.as_secs_f64() * 1000.0;
        let mut delay_ms = if self.use_exponential_back_off && self.back_off_multiplier > 1.0 {
            let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
            base_ms * self.back_off_multiplier.powi(exponent)
        } else {
            base_ms
        };
        delay_ms = self.cap(delay_ms);

        if self.use_collision_avoidance && delay_ms > 0.0 {
            let spread = self.collision_avoidance_percent / 200.0;
            let variance = rand::rng().random_range(-spread..=spread);
            delay_ms = self.cap(delay_ms + delay_ms * variance);
        }

        Duration::from_millis(delay_ms.max(0.0).round() as u64)
    }

    fn cap(&self, delay_ms: f64) -> f64 {
        let max_ms = self.maximum_redelivery_delay.as_secs_f64() * 1000.0;
        if max_ms > 0.0 && delay_ms > max_ms {
            max_ms
        } else {
            delay_ms
        }
    }

    pub fn maximum_redeliveries(&self) -> i32 {
        self.maximum_redeliveries
    }

    pub fn redelivery_delay(&self) -> Duration {
        self.redelivery_delay
    }

    pub fn maximum_redelivery_delay(&self) -> Duration {
        self.maximum_redelivery_delay
    }

    pub fn back_off_multiplier(&self) -> f64 {
        self.back_off_multiplier
    }

    pub fn uses_exponential_back_off(&self) -> bool {
        self.use_exponential_back_off
    }

    pub fn uses_collision_avoidance(&self) -> bool {
        self.use_collision_avoidance
    }

    pub fn collision_avoidance_percent(&self) -> f64 {
        self.collision_avoidance_percent
    }

    pub fn delay_pattern(&self) -> Option<&DelayPattern> {
        self.delay_pattern.as_ref()
    }

    pub fn retry_attempted_log_level(&self) -> LoggingLevel {
        self.retry_attempted_log_level
    }

    pub fn retries_exhausted_log_level(&self) -> LoggingLevel {
        self.retries_exhausted_log_level
    }

    pub fn log_stack_trace(&self) -> bool {
        self.log_stack_trace
    }

    pub fn log_retry_attempted(&self) -> bool {
        self.log_retry_attempted
    }

    pub fn log_exhausted(&self) -> bool {
        self.log_exhausted
    }

    pub fn log_handled(&self) -> bool {
        self.log_handled
    }
}

/// Builder for [`RedeliveryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RedeliveryPolicyBuilder {
    policy: RedeliveryPolicy,
    delay_pattern: Option<String>,
}

impl RedeliveryPolicyBuilder {
    /// `-1` redelivers forever, `0` disables redelivery
    pub fn maximum_redeliveries(mut self, maximum: i32) -> Self {
        self.policy.maximum_redeliveries = maximum;
        self
    }

    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.policy.redelivery_delay = delay;
        self
    }

    /// Upper bound on any computed delay; zero means unbounded
    pub fn maximum_redelivery_delay(mut self, delay: Duration) -> Self {
        self.policy.maximum_redelivery_delay = delay;
        self
    }

    pub fn back_off_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.back_off_multiplier = multiplier;
        self
    }

    pub fn use_exponential_back_off(mut self, enabled: bool) -> Self {
        self.policy.use_exponential_back_off = enabled;
        self
    }

    pub fn use_collision_avoidance(mut self, enabled: bool) -> Self {
        self.policy.use_collision_avoidance = enabled;
        self
    }

    /// Total jitter spread; the delay moves by up to half of it either way
    pub fn collision_avoidance_percent(mut self, percent: f64) -> Self {
        self.policy.collision_avoidance_percent = percent;
        self
    }

    pub fn delay_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.delay_pattern = Some(pattern.into());
        self
    }

    pub fn retry_attempted_log_level(mut self, level: LoggingLevel) -> Self {
        self.policy.retry_attempted_log_level = level;
        self
    }

    pub fn retries_exhausted_log_level(mut self, level: LoggingLevel) -> Self {
        self.policy.retries_exhausted_log_level = level;
        self
    }

    pub fn log_stack_trace(mut self, enabled: bool) -> Self {
        self.policy.log_stack_trace = enabled;
        self
    }

    pub fn log_retry_attempted(mut self, enabled: bool) -> Self {
        self.policy.log_retry_attempted = enabled;
        self
    }

    pub fn log_exhausted(mut self, enabled: bool) -> Self {
        self.policy.log_exhausted = enabled;
        self
    }

    pub fn log_handled(mut self, enabled: bool) -> Self {
        self.policy.log_handled = enabled;
        self
    }

    pub fn build(self) -> CourierResult<RedeliveryPolicy> {
        let mut policy = self.policy;

        if policy.maximum_redeliveries < -1 {
            return Err(CourierError::InvalidConfig(format!(
                "maximum_redeliveries must be -1 or greater, got {}",
                policy.maximum_redeliveries
            )));
        }
        if !policy.back_off_multiplier.is_finite() || policy.back_off_multiplier < 1.0 {
            return Err(CourierError::InvalidConfig(format!(
                "back_off_multiplier must be at least 1.0, got {}",
                policy.back_off_multiplier
            )));
        }
        if !(0.0..=100.0).contains(&policy.collision_avoidance_percent) {
            return Err(CourierError::InvalidConfig(format!(
                "collision_avoidance_percent must be within 0..=100, got {}",
                policy.collision_avoidance_percent
            )));
        }

        policy.delay_pattern = match self.delay_pattern {
            Some(raw) if !raw.trim().is_empty() => Some(raw.parse()?),
            _ => None,
        };
        Ok(policy)
    }
}
