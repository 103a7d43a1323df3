//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - Bounded connection leasing keyed by route
//! - Circuit breaker pattern for fault tolerance
//! - Per-route connection management
//! - Automatic failure detection and recovery

pub mod circuit;
pub mod connection;
pub mod route;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats};
pub use connection::{
    ConnectionPool, Lease, PoolConfig, PoolCounters, PoolError, PoolGauges, PoolPolicy, PoolStats,
};
pub use route::{InvalidRoute, Route, Scheme};
