//! One-request execution over the pool and transport.
//!
//! The executor drives a single exchange: lease a connection, arm the
//! watchdog, write the request, read the response chunk by chunk with the
//! effective byte-gap timer re-armed on every read, and give the connection
//! back on every exit path. Failures are surfaced as a [`CallError`] naming
//! the dimension that fired, because each kind has a different remediation.
//! No retries happen here; retrying is caller policy.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::pool::{ConnectionPool, PoolError, Route};
use crate::transport::{Chunk, Connection, Transport, TransportError};

use super::timeout::TimeoutPolicy;
use super::watchdog;

/// Terminal failure kinds for one call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Transport could not be established within the connect timeout.
    #[error("failed to establish connection to {route}: {reason}")]
    ConnectFailure { route: Route, reason: String },

    /// No pooled connection became available within the lease timeout.
    #[error("no connection for {route} became available within {waited:?}")]
    LeaseTimeoutExceeded { route: Route, waited: Duration },

    /// The gap between response chunks exceeded the active read timer.
    #[error("response from {route} stalled beyond the {timeout:?} read timer")]
    ReadTimeout { route: Route, timeout: Duration },

    /// The watchdog force-closed the exchange. Unlike [`ReadTimeout`], this
    /// can fire while bytes are still arriving, just too slowly in aggregate.
    #[error("exchange with {route} force-closed after the {limit:?} hard timeout")]
    HardTimeoutExceeded { route: Route, limit: Duration },

    /// Rejected by the circuit breaker before any I/O attempt.
    #[error("circuit breaker is open for {route}, retry in {retry_after:?}")]
    CircuitOpen { route: Route, retry_after: Duration },

    /// Low-level I/O failure not otherwise classified.
    #[error("transport error on {route}: {source}")]
    TransportError {
        route: Route,
        #[source]
        source: std::io::Error,
    },
}

impl CallError {
    /// The destination the failed call was addressed to.
    pub fn route(&self) -> &Route {
        match self {
            CallError::ConnectFailure { route, .. }
            | CallError::LeaseTimeoutExceeded { route, .. }
            | CallError::ReadTimeout { route, .. }
            | CallError::HardTimeoutExceeded { route, .. }
            | CallError::CircuitOpen { route, .. }
            | CallError::TransportError { route, .. } => route,
        }
    }
}

impl From<PoolError> for CallError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Connect { route, reason } => CallError::ConnectFailure { route, reason },
            PoolError::LeaseTimeout { route, waited } => {
                CallError::LeaseTimeoutExceeded { route, waited }
            }
        }
    }
}

impl From<crate::pool::CircuitError> for CallError {
    fn from(err: crate::pool::CircuitError) -> Self {
        match err {
            crate::pool::CircuitError::CircuitOpen { route, retry_after } => {
                CallError::CircuitOpen { route, retry_after }
            }
        }
    }
}

/// Runs single requests through a shared [`ConnectionPool`].
pub struct Executor<T: Transport> {
    pool: Arc<ConnectionPool<T>>,
}

impl<T: Transport> Executor<T> {
    pub fn new(pool: Arc<ConnectionPool<T>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<T>> {
        &self.pool
    }

    /// Execute one request and collect the complete response.
    ///
    /// The connection is released on every path: back to the idle queue
    /// after a clean, reusable exchange, retired otherwise.
    pub async fn execute(
        &self,
        route: &Route,
        request: &[u8],
        policy: &TimeoutPolicy,
    ) -> Result<Bytes, CallError> {
        let mut lease = self.pool.lease(route, policy).await?;

        // Scoped: the watchdog disarms when this frame unwinds, fired or not.
        let _watchdog = policy
            .hard_timeout
            .map(|limit| watchdog::arm(lease.cancel_handle(), limit));

        let read_timeout = policy.effective_read_timeout();
        let conn_id = lease.connection_id();
        let outcome = exchange(lease.connection(), request, read_timeout).await;

        match outcome {
            Ok(body) => {
                let reusable = lease.connection().is_reusable();
                debug!(
                    route = %route,
                    conn_id = conn_id,
                    bytes = body.len(),
                    reusable = reusable,
                    "exchange complete"
                );
                self.pool.release(lease, reusable);
                Ok(body)
            }
            Err(err) => {
                lease.connection().close().await;
                self.pool.release(lease, false);
                Err(classify(err, route, policy, read_timeout))
            }
        }
    }
}

/// Write the request and drain the response. The byte-gap timer is armed per
/// read, so it restarts on every chunk received.
async fn exchange<C: Connection>(
    conn: &mut C,
    request: &[u8],
    read_timeout: Option<Duration>,
) -> Result<Bytes, TransportError> {
    conn.write_all(request).await?;

    let mut body = BytesMut::new();
    loop {
        match conn.read_chunk(read_timeout).await? {
            Chunk::Data(chunk) => body.extend_from_slice(&chunk),
            Chunk::End => return Ok(body.freeze()),
        }
    }
}

fn classify(
    err: TransportError,
    route: &Route,
    policy: &TimeoutPolicy,
    read_timeout: Option<Duration>,
) -> CallError {
    match err {
        TransportError::TimedOut => CallError::ReadTimeout {
            route: route.clone(),
            timeout: read_timeout.unwrap_or_default(),
        },
        TransportError::Cancelled => CallError::HardTimeoutExceeded {
            route: route.clone(),
            limit: policy.hard_timeout.unwrap_or_default(),
        },
        TransportError::Unsupported(reason) => CallError::ConnectFailure {
            route: route.clone(),
            reason,
        },
        TransportError::Io(source) => CallError::TransportError {
            route: route.clone(),
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_map_to_distinct_kinds() {
        let route = Route::http("upstream.test", 9000);

        let err: CallError = PoolError::LeaseTimeout {
            route: route.clone(),
            waited: Duration::from_secs(1),
        }
        .into();
        assert!(matches!(err, CallError::LeaseTimeoutExceeded { .. }));

        let err: CallError = PoolError::Connect {
            route,
            reason: "refused".into(),
        }
        .into();
        assert!(matches!(err, CallError::ConnectFailure { .. }));
    }

    #[test]
    fn test_read_and_hard_timeouts_stay_distinct() {
        let route = Route::http("upstream.test", 9000);
        let policy = TimeoutPolicy::new().with_hard_timeout(Some(Duration::from_secs(5)));

        let read = classify(
            TransportError::TimedOut,
            &route,
            &policy,
            Some(Duration::from_secs(1)),
        );
        assert!(matches!(read, CallError::ReadTimeout { .. }));

        let hard = classify(
            TransportError::Cancelled,
            &route,
            &policy,
            Some(Duration::from_secs(1)),
        );
        assert!(matches!(
            hard,
            CallError::HardTimeoutExceeded {
                limit,
                ..
            } if limit == Duration::from_secs(5)
        ));
    }
}
