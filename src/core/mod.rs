use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::client::{CallError, Executor, TimeoutPolicy};
use crate::config::ClientConfig;
use crate::pool::{
    CircuitBreaker, CircuitState, CircuitStats, ConnectionPool, PoolGauges, PoolStats, Route,
};
use crate::transport::{TcpTransport, Transport};

/// Core shared by every caller of the client.
///
/// Owns one connection pool and one circuit breaker registry, both injected
/// at construction rather than ambient, so tests and independent clients get
/// isolated state. Clones share the same pool and breakers.
pub struct Core<T: Transport> {
    config: Arc<ClientConfig>,
    pool: Arc<ConnectionPool<T>>,
    breaker: Arc<CircuitBreaker>,
    executor: Executor<T>,
}

impl Core<TcpTransport> {
    /// Core over the bundled plain-TCP transport.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, TcpTransport::new())
    }
}

impl<T: Transport> Core<T> {
    /// Core over an injected transport.
    pub fn with_transport(config: ClientConfig, transport: T) -> Self {
        let pool = Arc::new(ConnectionPool::new(transport, config.pool.to_pool_config()));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.to_breaker_config()));
        let executor = Executor::new(Arc::clone(&pool));
        Self {
            config: Arc::new(config),
            pool,
            breaker,
            executor,
        }
    }

    /// Execute one request against `route`.
    ///
    /// The circuit breaker gates the call first: a rejection is cheap, takes
    /// no lease, and runs no timeout policy. Every executed call's outcome is
    /// recorded, with the elapsed wall time deciding the slow classification.
    pub async fn execute(
        &self,
        route: &Route,
        request: &[u8],
        policy: &TimeoutPolicy,
    ) -> Result<Bytes, CallError> {
        self.breaker.try_acquire(route).await?;

        let started = Instant::now();
        let result = self.executor.execute(route, request, policy).await;
        let elapsed = started.elapsed();
        self.breaker
            .record(route, result.is_ok(), elapsed)
            .await;

        if let Err(err) = &result {
            debug!(route = %route, error = %err, elapsed_ms = elapsed.as_millis() as u64, "call failed");
        }
        result
    }

    /// Timeout policy built from the configured defaults.
    pub fn default_policy(&self) -> TimeoutPolicy {
        self.config.timeouts.to_timeout_policy()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Point-in-time pool gauges and counters, per route and total.
    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Gauges for one route, if it has been used.
    pub async fn route_stats(&self, route: &Route) -> Option<PoolGauges> {
        self.pool.route_stats(route).await
    }

    /// Current breaker state for a route. Unseen routes report Closed.
    pub async fn breaker_state(&self, route: &Route) -> CircuitState {
        self.breaker.state(route).await
    }

    /// Breaker statistics for a route.
    pub async fn breaker_stats(&self, route: &Route) -> Option<CircuitStats> {
        self.breaker.stats(route).await
    }

    /// Breaker statistics for every route seen so far.
    pub async fn all_breaker_stats(&self) -> HashMap<Route, CircuitStats> {
        self.breaker.all_stats().await
    }
}

impl<T: Transport> Clone for Core<T> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            pool: Arc::clone(&self.pool),
            breaker: Arc::clone(&self.breaker),
            executor: Executor::new(Arc::clone(&self.pool)),
        }
    }
}
