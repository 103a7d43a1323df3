//! Timeout policy for one request.
//!
//! Five independent dimensions apply at different points of a request's
//! lifecycle. The two byte-gap timers follow a strict precedence rule: a
//! request-scoped `response_timeout`, when present, is the timer actually
//! armed on the socket, overriding the pool-scoped `inter_byte_timeout` even
//! when the pool value is numerically larger or smaller.

use std::time::Duration;

/// Timeouts applied to a single request.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    /// Time allowed to establish a new transport connection.
    pub connect_timeout: Duration,

    /// Time allowed to obtain a connection from the pool.
    pub lease_timeout: Duration,

    /// Pool-scoped maximum gap between successive response chunks.
    pub inter_byte_timeout: Option<Duration>,

    /// Request-scoped byte-gap timer. Same semantics as
    /// `inter_byte_timeout`, but its presence always wins over the pool
    /// value.
    pub response_timeout: Option<Duration>,

    /// Absolute wall-clock ceiling from request start, enforced by the
    /// watchdog independently of I/O progress. Every other timeout can be
    /// legitimately renewed by trickling data; this one cannot.
    pub hard_timeout: Option<Duration>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            lease_timeout: Duration::from_secs(3),
            inter_byte_timeout: Some(Duration::from_secs(60)),
            response_timeout: None,
            hard_timeout: None,
        }
    }
}

impl TimeoutPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_inter_byte_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inter_byte_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_hard_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hard_timeout = timeout;
        self
    }

    /// The byte-gap timer armed on the socket for this request:
    /// `response_timeout` when set, else `inter_byte_timeout`.
    ///
    /// `None` means reads may block indefinitely; no default is imposed.
    /// Note that a byte-gap timer is not a total-duration limit: a peer
    /// delivering a chunk just inside the gap each time can keep the request
    /// open arbitrarily long. Use `hard_timeout` for a real ceiling.
    pub fn effective_read_timeout(&self) -> Option<Duration> {
        self.response_timeout.or(self.inter_byte_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_timeout_overrides_smaller_pool_value() {
        let policy = TimeoutPolicy::new()
            .with_inter_byte_timeout(Some(Duration::from_millis(50)))
            .with_response_timeout(Some(Duration::from_millis(300)));
        assert_eq!(
            policy.effective_read_timeout(),
            Some(Duration::from_millis(300))
        );
    }

    #[test]
    fn test_response_timeout_overrides_larger_pool_value() {
        let policy = TimeoutPolicy::new()
            .with_inter_byte_timeout(Some(Duration::from_millis(300)))
            .with_response_timeout(Some(Duration::from_millis(50)));
        assert_eq!(
            policy.effective_read_timeout(),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_falls_back_to_inter_byte_timeout() {
        let policy = TimeoutPolicy::new()
            .with_inter_byte_timeout(Some(Duration::from_millis(75)))
            .with_response_timeout(None);
        assert_eq!(
            policy.effective_read_timeout(),
            Some(Duration::from_millis(75))
        );
    }

    #[test]
    fn test_no_read_timer_when_neither_set() {
        let policy = TimeoutPolicy::new()
            .with_inter_byte_timeout(None)
            .with_response_timeout(None);
        assert_eq!(policy.effective_read_timeout(), None);
    }
}
