//! Spans scoping log events to a route or an exchange

use courier_core::Exchange;
use tracing::{Span, info_span};

/// Span for everything a route does with one exchange
pub fn route_span(route_id: &str) -> Span {
    info_span!("route", route = %route_id)
}

/// Span carrying the exchange id and its originating endpoint
pub fn exchange_span(exchange: &Exchange) -> Span {
    info_span!(
        "exchange",
        exchange_id = %exchange.id(),
        from = exchange.from_endpoint().unwrap_or("direct"),
    )
}
