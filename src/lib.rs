pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod pool;
pub mod router;
pub mod server;
pub mod store;

/// Re-exports of common components for easier access
pub use api::{mount, ApiState};
pub use config::{AdminCredentials, ServerConfig};
pub use dispatch::{Dispatcher, Exchange, Next, Outcome};
pub use error::{ServerError, ServerResult};
pub use http::{HttpParser, Method, Request, Response, ResponseState, Status};
pub use metrics::{Counter, Histogram, MetricsCollector, MetricsRegistry, Timer};
pub use middleware::{
    basic_auth_middleware, cors_middleware, json_body_middleware,
    logging_middleware,
};
pub use pool::{JobHandle, PoolStats, WorkerPool};
pub use router::{Handler, HandlerKind, HandlerPos, HandlerResult, MethodFilter, Route, Router};
pub use server::Server;
pub use store::{Document, DocumentStore, Filter, FindOptions, MemoryStore};
