//! CLI command implementations

use courier_core::{CourierError, Exchange, ExchangePattern, PropertyKey, RouteContext, expression};
use courier_routing::{
    DeadLetterQueue, DlqEntry, RouteBuilder, RoutingConfig, RoutingMetrics,
    RoutingMetricsCollector,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Courier(#[from] CourierError),

    #[error("failed to render output: {0}")]
    Output(#[from] serde_json::Error),
}

fn load_config(path: Option<&Path>) -> Result<RoutingConfig, CliError> {
    match path {
        Some(path) => Ok(RoutingConfig::load_from_file(path)?),
        None => Ok(RoutingConfig::default()),
    }
}

#[derive(Debug, Serialize)]
struct DelayRow {
    attempt: u32,
    delay_ms: u128,
    allowed: bool,
}

#[derive(Debug, Serialize)]
struct DelaySchedule {
    maximum_redeliveries: i32,
    schedule: Vec<DelayRow>,
}

/// Delay before each redelivery attempt, as JSON
pub fn run_delays(config: Option<&Path>, attempts: u32) -> Result<String, CliError> {
    let config = load_config(config)?;
    let policy = config.redelivery_policy()?;

    let schedule = (1..=attempts)
        .map(|attempt| DelayRow {
            attempt,
            delay_ms: policy.redelivery_delay_for(attempt).as_millis(),
            allowed: policy.allows_attempt(attempt),
        })
        .collect();

    Ok(serde_json::to_string_pretty(&DelaySchedule {
        maximum_redeliveries: policy.maximum_redeliveries(),
        schedule,
    })?)
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    messages_sent: u32,
    completed: u32,
    failed: u32,
    duplicates: u64,
    dead_lettered: usize,
    metrics: RoutingMetrics,
    dead_letters: Vec<DlqEntry>,
}

/// Routes generated messages through a step that fails `failures` times per
/// message, and summarizes the outcome as JSON
pub async fn run_simulate(
    config: Option<&Path>,
    failures: u32,
    messages: u32,
    repeat: u32,
) -> Result<String, CliError> {
    let config = load_config(config)?;
    let context = RouteContext::new("simulate");
    let metrics = RoutingMetricsCollector::with_defaults();

    let dlq = match config.error_handler.dead_letter_uri.as_deref() {
        Some(uri) => {
            let name = uri.strip_prefix("dlq:").ok_or_else(|| {
                CourierError::InvalidConfig(format!(
                    "simulation only supports dlq: dead letter endpoints, got {}",
                    uri
                ))
            })?;
            let dlq = DeadLetterQueue::new(name, config.dlq_config());
            context.register_endpoint(Arc::new(dlq.clone()));
            Some(dlq)
        }
        None => None,
    };

    let failures = i64::from(failures);
    let route = RouteBuilder::new(&context, "simulation")
        .error_handler(config.error_handler_builder()?)
        .metrics(metrics.clone())
        .idempotent(
            expression::header("messageId"),
            Arc::new(config.idempotent_repository()),
            config.idempotent_options(),
        )
        .process_fn("flaky", move |exchange: &mut Exchange| {
            let attempt = exchange
                .property_as::<i64>(PropertyKey::RedeliveryCounter)
                .unwrap_or(0);
            if attempt < failures {
                Err(format!("simulated failure on attempt {}", attempt + 1).into())
            } else {
                Ok(())
            }
        })
        .build()?;

    let mut completed = 0;
    let mut failed = 0;
    for index in 0..messages {
        for _ in 0..repeat {
            let exchange = context
                .create_exchange(ExchangePattern::InOnly)
                .with_header("messageId", format!("msg-{}", index))
                .with_body(format!("payload-{}", index));
            match route.send(exchange).await {
                Ok(_) => completed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "simulated message failed");
                    failed += 1;
                }
            }
        }
    }

    let metrics = metrics.snapshot().await;
    let dead_letters = match &dlq {
        Some(dlq) => dlq.list().await,
        None => Vec::new(),
    };
    Ok(serde_json::to_string_pretty(&SimulationSummary {
        messages_sent: messages.saturating_mul(repeat),
        completed,
        failed,
        duplicates: metrics.duplicates_total,
        dead_lettered: dead_letters.len(),
        metrics,
        dead_letters,
    })?)
}
