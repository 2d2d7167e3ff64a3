pub use courier_core;
pub use courier_observability;
pub use courier_routing;

pub use courier_core::{
    AsyncCallback, AsyncProcessor, CourierError, CourierResult, Endpoint, Exchange,
    ExchangePattern, Message, Pipeline, Processor, PropertyKey, RouteContext, Synchronization,
    UnitOfWork, UnitOfWorkProcessor, Value,
};
pub use courier_observability::{LogFormat, ObservabilityConfig, init_tracing};
pub use courier_routing::{
    DeadLetterQueue, ErrorHandlerBuilder, IdempotentConsumer, MemoryIdempotentRepository,
    RedeliveryPolicy, Route, RouteBuilder, RoutingConfig,
};
