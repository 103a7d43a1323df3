//! Connection pooling with bounded leasing and per-route isolation.
//!
//! This module provides per-route connection pools with:
//! - Per-route and total lease bounds
//! - `Strict` / `Lax` admission disciplines
//! - FIFO lease queueing bounded by the lease timeout
//! - Idle-expiry and lifetime-based retirement
//!
//! The pool is the sole owner of physical connections. Callers hold a
//! [`Lease`] for exactly one in-flight request and must give it back through
//! [`ConnectionPool::release`] on every exit path; a dropped lease is treated
//! as an unhealthy release.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::client::timeout::TimeoutPolicy;
use crate::transport::{CancelHandle, Connection, Transport};

use super::route::Route;

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to connect to {route}: {reason}")]
    Connect { route: Route, reason: String },

    #[error("no connection for {route} became available within {waited:?}")]
    LeaseTimeout { route: Route, waited: Duration },
}

/// How lease admission checks the pool bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPolicy {
    /// Exact bounds enforced through FIFO admission queues. Leases are
    /// granted in arrival order with no overshoot window.
    Strict,

    /// Relaxed atomic counters. Concurrent leasers can transiently push the
    /// raw counters past the bound before losers back off, in exchange for a
    /// lock-free admission hot path. Suited to many short-lived requests
    /// fanning out across many routes.
    Lax,
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum leased connections per route
    pub max_per_route: usize,

    /// Maximum leased connections across all routes
    pub max_total: usize,

    /// Admission discipline
    pub policy: PoolPolicy,

    /// Maximum idle time before a pooled connection is retired
    pub max_idle_time: Duration,

    /// Maximum age of a connection before it is retired on release
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_route: 5,
            max_total: 10,
            policy: PoolPolicy::Strict,
            max_idle_time: Duration::from_secs(90),
            max_lifetime: Duration::from_secs(600),
        }
    }
}

/// Point-in-time gauges for one route or for the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolGauges {
    /// Connections currently checked out
    pub leased: usize,

    /// Idle connections ready for reuse
    pub available: usize,

    /// Callers waiting in `lease`
    pub pending: usize,

    /// Configured bound
    pub max: usize,
}

/// Cumulative counters since pool creation.
#[derive(Debug, Clone, Default)]
pub struct PoolCounters {
    /// Connections opened against the transport
    pub total_created: u64,

    /// Leases served from the idle queue
    pub total_reused: u64,

    /// Connections retired instead of returned to the idle queue
    pub total_retired: u64,
}

/// Snapshot returned by [`ConnectionPool::stats`].
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total: PoolGauges,
    pub counters: PoolCounters,
    pub routes: HashMap<Route, PoolGauges>,
}

/// A physical connection owned by the pool.
struct PooledConn<C> {
    id: u64,
    conn: C,
    cancel: CancelHandle,
    created_at: Instant,
}

struct IdleConn<C> {
    conn: PooledConn<C>,
    idle_since: Instant,
}

/// Per-route pool state.
struct RoutePool<C> {
    route: Route,

    /// Admission permits for this route (`Strict` only).
    permits: Arc<Semaphore>,

    /// Granted leases against this route. Gauge in both modes, admission
    /// counter under `Lax`.
    leased: AtomicUsize,

    /// Callers currently waiting in `lease`.
    pending: AtomicUsize,

    /// Idle connections, most recently used last. Never locked across await.
    idle: Mutex<VecDeque<IdleConn<C>>>,
}

impl<C> RoutePool<C> {
    fn new(route: Route, max_per_route: usize) -> Self {
        Self {
            route,
            permits: Arc::new(Semaphore::new(max_per_route)),
            leased: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            idle: Mutex::new(VecDeque::new()),
        }
    }
}

/// State shared between the pool, its leases, and the cleanup task.
struct PoolShared {
    config: PoolConfig,

    /// Total admission permits (`Strict` only).
    total_permits: Arc<Semaphore>,

    /// Granted leases across all routes.
    total_leased: AtomicUsize,

    /// Wakes parked `Lax` leasers after a release frees a slot.
    lax_release: tokio::sync::Notify,

    next_conn_id: AtomicU64,
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_retired: AtomicU64,
}

/// Exclusive lease on a pooled connection.
///
/// Holds the admission slot for one in-flight request. Exactly one request
/// ever holds a given connection; giving the lease back (or dropping it)
/// frees the slot for the next queued caller.
pub struct Lease<C: Connection> {
    conn: Option<PooledConn<C>>,
    reused: bool,
    route_pool: Arc<RoutePool<C>>,
    shared: Arc<PoolShared>,
    /// Strict-mode permits; freed when the lease is given back.
    permits: Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)>,
}

impl<C: Connection> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("reused", &self.reused)
            .field("released", &self.conn.is_none())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Lease<C> {
    /// The transport connection for this request.
    pub fn connection(&mut self) -> &mut C {
        // conn is only None after give_back, which consumes the lease
        &mut self.conn.as_mut().expect("lease already released").conn
    }

    /// Cancellation handle for the leased connection.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.conn
            .as_ref()
            .expect("lease already released")
            .cancel
            .clone()
    }

    /// Identifier of the underlying physical connection. Stable across
    /// reuses, useful for logging.
    pub fn connection_id(&self) -> u64 {
        self.conn.as_ref().expect("lease already released").id
    }

    /// Whether this lease was served from the idle queue.
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    pub fn route(&self) -> &Route {
        &self.route_pool.route
    }

    fn give_back(&mut self, healthy: bool) {
        let Some(pooled) = self.conn.take() else {
            return;
        };

        let cancelled = pooled.cancel.is_cancelled();
        let lifetime_expired = pooled.created_at.elapsed() >= self.shared.config.max_lifetime;

        // A force-closed connection is always retired, even when the exchange
        // raced to a natural completion.
        if !healthy || cancelled || lifetime_expired {
            self.shared.total_retired.fetch_add(1, Ordering::Relaxed);
            if cancelled {
                warn!(
                    route = %self.route_pool.route,
                    conn_id = pooled.id,
                    "retiring force-closed connection"
                );
            } else {
                debug!(
                    route = %self.route_pool.route,
                    conn_id = pooled.id,
                    healthy = healthy,
                    age_secs = pooled.created_at.elapsed().as_secs(),
                    "retiring connection"
                );
            }
            drop(pooled);
        } else {
            let mut idle = self
                .route_pool
                .idle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            idle.push_back(IdleConn {
                conn: pooled,
                idle_since: Instant::now(),
            });
        }

        // Free the admission slot only after the connection is back in the
        // idle queue, so the next admitted caller can find it.
        self.route_pool.leased.fetch_sub(1, Ordering::Relaxed);
        self.shared.total_leased.fetch_sub(1, Ordering::Relaxed);
        self.permits = None;
        if self.shared.config.policy == PoolPolicy::Lax {
            self.shared.lax_release.notify_waiters();
        }
    }
}

impl<C: Connection> Drop for Lease<C> {
    fn drop(&mut self) {
        // a lease abandoned without release counts as unhealthy
        self.give_back(false);
    }
}

/// Connection pool manager for all routes.
pub struct ConnectionPool<T: Transport> {
    transport: T,
    shared: Arc<PoolShared>,
    routes: Arc<RwLock<HashMap<Route, Arc<RoutePool<T::Conn>>>>>,
}

impl<T: Transport> ConnectionPool<T> {
    /// Create a new connection pool over `transport`.
    pub fn new(transport: T, config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            total_permits: Arc::new(Semaphore::new(config.max_total)),
            total_leased: AtomicUsize::new(0),
            lax_release: tokio::sync::Notify::new(),
            next_conn_id: AtomicU64::new(0),
            total_created: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
            total_retired: AtomicU64::new(0),
            config,
        });
        let routes = Arc::new(RwLock::new(HashMap::new()));

        let pool = Self {
            transport,
            shared,
            routes,
        };
        pool.start_cleanup_task();
        pool
    }

    /// Lease a connection for `route`.
    ///
    /// Returns an idle connection or opens a new one when both bounds admit
    /// it (bounded by `connect_timeout`); otherwise queues until a slot
    /// frees, bounded by `lease_timeout`. Never blocks past the lease
    /// timeout, even when the pool is globally exhausted.
    pub async fn lease(
        &self,
        route: &Route,
        policy: &TimeoutPolicy,
    ) -> Result<Lease<T::Conn>, PoolError> {
        let deadline = Instant::now() + policy.lease_timeout;
        let route_pool = self.route_pool(route).await;

        route_pool.pending.fetch_add(1, Ordering::Relaxed);
        let result = self.lease_inner(&route_pool, route, policy, deadline).await;
        route_pool.pending.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Return a leased connection.
    ///
    /// Healthy connections go back to the idle queue for reuse; unhealthy,
    /// cancel-flagged, or over-lifetime connections are retired.
    pub fn release(&self, mut lease: Lease<T::Conn>, healthy: bool) {
        lease.give_back(healthy);
    }

    /// Gauges for a single route, if it has been used.
    pub async fn route_stats(&self, route: &Route) -> Option<PoolGauges> {
        let routes = self.routes.read().await;
        routes.get(route).map(|rp| self.gauges_for(rp))
    }

    /// Snapshot of the whole pool.
    pub async fn stats(&self) -> PoolStats {
        let routes = self.routes.read().await;
        let mut per_route = HashMap::new();
        let mut available = 0;
        let mut pending = 0;
        for (route, rp) in routes.iter() {
            let gauges = self.gauges_for(rp);
            available += gauges.available;
            pending += gauges.pending;
            per_route.insert(route.clone(), gauges);
        }
        PoolStats {
            total: PoolGauges {
                leased: self.shared.total_leased.load(Ordering::Relaxed),
                available,
                pending,
                max: self.shared.config.max_total,
            },
            counters: PoolCounters {
                total_created: self.shared.total_created.load(Ordering::Relaxed),
                total_reused: self.shared.total_reused.load(Ordering::Relaxed),
                total_retired: self.shared.total_retired.load(Ordering::Relaxed),
            },
            routes: per_route,
        }
    }

    fn gauges_for(&self, rp: &RoutePool<T::Conn>) -> PoolGauges {
        let available = rp
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len();
        PoolGauges {
            leased: rp.leased.load(Ordering::Relaxed),
            available,
            pending: rp.pending.load(Ordering::Relaxed),
            max: self.shared.config.max_per_route,
        }
    }

    async fn route_pool(&self, route: &Route) -> Arc<RoutePool<T::Conn>> {
        {
            let routes = self.routes.read().await;
            if let Some(rp) = routes.get(route) {
                return Arc::clone(rp);
            }
        }
        let mut routes = self.routes.write().await;
        Arc::clone(routes.entry(route.clone()).or_insert_with(|| {
            info!(route = %route, "registering route");
            Arc::new(RoutePool::new(
                route.clone(),
                self.shared.config.max_per_route,
            ))
        }))
    }

    async fn lease_inner(
        &self,
        route_pool: &Arc<RoutePool<T::Conn>>,
        route: &Route,
        policy: &TimeoutPolicy,
        deadline: Instant,
    ) -> Result<Lease<T::Conn>, PoolError> {
        let permits = match self.shared.config.policy {
            PoolPolicy::Strict => {
                Some(self.admit_strict(route_pool, route, policy, deadline).await?)
            }
            PoolPolicy::Lax => {
                self.admit_lax(route_pool, route, policy, deadline).await?;
                None
            }
        };

        // Admission granted: the slot counts as leased from here on and must
        // be undone if no connection materializes.
        route_pool.leased.fetch_add(1, Ordering::Relaxed);
        self.shared.total_leased.fetch_add(1, Ordering::Relaxed);

        if let Some(pooled) = self.pop_idle(route_pool) {
            self.shared.total_reused.fetch_add(1, Ordering::Relaxed);
            debug!(
                route = %route,
                conn_id = pooled.id,
                age_secs = pooled.created_at.elapsed().as_secs(),
                "reusing pooled connection"
            );
            return Ok(Lease {
                conn: Some(pooled),
                reused: true,
                route_pool: Arc::clone(route_pool),
                shared: Arc::clone(&self.shared),
                permits,
            });
        }

        match self.transport.open(route, policy.connect_timeout).await {
            Ok(conn) => {
                let cancel = conn.cancel_handle();
                let id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
                let created = self.shared.total_created.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    route = %route,
                    conn_id = id,
                    total_created = created,
                    "opened new connection"
                );
                Ok(Lease {
                    conn: Some(PooledConn {
                        id,
                        conn,
                        cancel,
                        created_at: Instant::now(),
                    }),
                    reused: false,
                    route_pool: Arc::clone(route_pool),
                    shared: Arc::clone(&self.shared),
                    permits,
                })
            }
            Err(err) => {
                // undo the admission before surfacing the failure
                route_pool.leased.fetch_sub(1, Ordering::Relaxed);
                self.shared.total_leased.fetch_sub(1, Ordering::Relaxed);
                drop(permits);
                if self.shared.config.policy == PoolPolicy::Lax {
                    self.shared.lax_release.notify_waiters();
                }
                warn!(route = %route, error = %err, "failed to open connection");
                Err(PoolError::Connect {
                    route: route.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Exact admission: per-route then total permit, both FIFO, both bounded
    /// by the shared lease deadline.
    async fn admit_strict(
        &self,
        route_pool: &RoutePool<T::Conn>,
        route: &Route,
        policy: &TimeoutPolicy,
        deadline: Instant,
    ) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), PoolError> {
        let deadline = tokio::time::Instant::from_std(deadline);

        let route_permit =
            tokio::time::timeout_at(deadline, Arc::clone(&route_pool.permits).acquire_owned())
                .await
                .map_err(|_| PoolError::LeaseTimeout {
                    route: route.clone(),
                    waited: policy.lease_timeout,
                })?
                .expect("pool semaphore is never closed");

        let total_permit = tokio::time::timeout_at(
            deadline,
            Arc::clone(&self.shared.total_permits).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::LeaseTimeout {
            route: route.clone(),
            waited: policy.lease_timeout,
        })?
        .expect("pool semaphore is never closed");

        Ok((route_permit, total_permit))
    }

    /// Relaxed admission: load-then-increment against the lease counters,
    /// parking on the release notification when the bounds are full. The
    /// check and the increment are not atomic together, so concurrent
    /// leasers can transiently push the counters past the bound.
    async fn admit_lax(
        &self,
        route_pool: &RoutePool<T::Conn>,
        route: &Route,
        policy: &TimeoutPolicy,
        deadline: Instant,
    ) -> Result<(), PoolError> {
        let deadline = tokio::time::Instant::from_std(deadline);
        loop {
            if self.lax_bounds_free(route_pool) {
                return Ok(());
            }

            let notified = self.shared.lax_release.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // re-check after arming the waiter so a release between the load
            // and the park is not lost
            if self.lax_bounds_free(route_pool) {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PoolError::LeaseTimeout {
                    route: route.clone(),
                    waited: policy.lease_timeout,
                });
            }
        }
    }

    fn lax_bounds_free(&self, route_pool: &RoutePool<T::Conn>) -> bool {
        route_pool.leased.load(Ordering::Relaxed) < self.shared.config.max_per_route
            && self.shared.total_leased.load(Ordering::Relaxed) < self.shared.config.max_total
    }

    /// Pop the freshest idle connection, retiring any that expired in place.
    fn pop_idle(&self, route_pool: &RoutePool<T::Conn>) -> Option<PooledConn<T::Conn>> {
        let mut idle = route_pool
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while let Some(entry) = idle.pop_back() {
            if self.is_expired(&entry) {
                self.shared.total_retired.fetch_add(1, Ordering::Relaxed);
                debug!(
                    route = %route_pool.route,
                    conn_id = entry.conn.id,
                    "discarding expired idle connection"
                );
                continue;
            }
            return Some(entry.conn);
        }
        None
    }

    fn is_expired(&self, entry: &IdleConn<T::Conn>) -> bool {
        entry.conn.cancel.is_cancelled()
            || entry.idle_since.elapsed() >= self.shared.config.max_idle_time
            || entry.conn.created_at.elapsed() >= self.shared.config.max_lifetime
    }

    /// Periodically prune expired idle connections. The task holds only weak
    /// references and stops once the pool is dropped.
    fn start_cleanup_task(&self) {
        let routes = Arc::downgrade(&self.routes);
        let shared = Arc::downgrade(&self.shared);
        let interval = Duration::from_secs(30);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (Some(routes), Some(shared)) = (routes.upgrade(), shared.upgrade()) else {
                    break;
                };
                let routes = routes.read().await;
                for (route, rp) in routes.iter() {
                    let mut idle = rp
                        .idle
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let before = idle.len();
                    idle.retain(|entry| {
                        !(entry.conn.cancel.is_cancelled()
                            || entry.idle_since.elapsed() >= shared.config.max_idle_time
                            || entry.conn.created_at.elapsed() >= shared.config.max_lifetime)
                    });
                    let removed = before - idle.len();
                    if removed > 0 {
                        shared
                            .total_retired
                            .fetch_add(removed as u64, Ordering::Relaxed);
                        debug!(
                            route = %route,
                            removed = removed,
                            remaining = idle.len(),
                            "cleaned up idle connections"
                        );
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_per_route, 5);
        assert_eq!(config.max_total, 10);
        assert_eq!(config.policy, PoolPolicy::Strict);
    }

    #[test]
    fn test_gauges_default_to_zero() {
        let gauges = PoolGauges::default();
        assert_eq!(gauges.leased, 0);
        assert_eq!(gauges.available, 0);
        assert_eq!(gauges.pending, 0);
    }
}
