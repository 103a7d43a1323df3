//! wirepool - resilient, connection-pooled outbound HTTP client core

pub mod client;
pub mod config;
pub mod core;
pub mod pool;
pub mod transport;

pub use crate::client::{CallError, Executor, TimeoutPolicy};
pub use crate::config::ClientConfig;
pub use crate::core::Core;
pub use crate::pool::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ConnectionPool, PoolConfig, PoolPolicy,
    PoolStats, Route, Scheme,
};
