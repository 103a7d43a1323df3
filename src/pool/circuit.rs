//! Circuit breaker with sliding-window outcome tracking.
//!
//! This module implements a circuit breaker pattern with three states:
//! - Closed: Normal operation, calls are allowed
//! - Open: The destination breached the failure or slow-call rate, calls are
//!   rejected without touching the pool
//! - HalfOpen: Testing recovery, a limited number of probe calls allowed
//!
//! Rates are computed over a fixed-size window of the most recent call
//! outcomes. A destination that recovers the instant its circuit opens still
//! sees rejections until the next half-open probe cycle decides; that lag is
//! inherent to count-based windows and is kept on purpose.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::route::Route;

/// Circuit breaker error types
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("circuit breaker is open for {route}, retry in {retry_after:?}")]
    CircuitOpen {
        route: Route,
        retry_after: Duration,
    },
}

/// Circuit breaker states as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls are allowed
    Closed,

    /// Destination is unhealthy - calls are rejected
    Open,

    /// Testing recovery - limited probe calls allowed
    HalfOpen,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent of the window) at which the circuit opens
    pub failure_rate_threshold: f64,

    /// Slow-call rate (percent of the window) at which the circuit opens
    pub slow_call_rate_threshold: f64,

    /// Calls at least this long are classified slow
    pub slow_call_duration_threshold: Duration,

    /// Minimum samples in the window before rates are trusted
    pub minimum_calls: usize,

    /// Capacity of the outcome window
    pub sliding_window_size: usize,

    /// How long to reject calls before probing recovery
    pub wait_duration_in_open: Duration,

    /// Number of probe calls admitted in half-open state
    pub permitted_calls_in_half_open: usize,

    /// How long half-open may wait for its probes to be decided before the
    /// circuit is forced back open
    pub max_wait_duration_in_half_open: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            minimum_calls: 10,
            sliding_window_size: 50,
            wait_duration_in_open: Duration::from_secs(30),
            permitted_calls_in_half_open: 3,
            max_wait_duration_in_half_open: Duration::from_secs(60),
        }
    }
}

/// One recorded call outcome. A slow failure raises both rates.
#[derive(Debug, Clone, Copy)]
struct CallRecord {
    ok: bool,
    slow: bool,
}

/// Fixed-capacity ring of the most recent call outcomes.
#[derive(Debug)]
struct OutcomeWindow {
    records: VecDeque<CallRecord>,
    capacity: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an outcome, evicting the oldest once full.
    fn push(&mut self, record: CallRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn clear(&mut self) {
        self.records.clear();
    }

    /// Percent of recorded calls that failed.
    fn failure_rate(&self) -> f64 {
        rate(self.records.iter().filter(|r| !r.ok).count(), self.len())
    }

    /// Percent of recorded calls that were slow.
    fn slow_call_rate(&self) -> f64 {
        rate(self.records.iter().filter(|r| r.slow).count(), self.len())
    }
}

fn rate(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    count as f64 / total as f64 * 100.0
}

fn rates_breached(records: &[CallRecord], config: &CircuitBreakerConfig) -> bool {
    let failures = records.iter().filter(|r| !r.ok).count();
    let slow = records.iter().filter(|r| r.slow).count();
    rate(failures, records.len()) >= config.failure_rate_threshold
        || rate(slow, records.len()) >= config.slow_call_rate_threshold
}

/// Internal phase of one route's circuit.
#[derive(Debug)]
enum Phase {
    Closed,
    Open {
        since: Instant,
    },
    HalfOpen {
        since: Instant,
        admitted: usize,
        outcomes: Vec<CallRecord>,
    },
}

/// Per-route circuit state and statistics.
struct RouteCircuit {
    phase: Phase,
    window: OutcomeWindow,
    config: CircuitBreakerConfig,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_slow: u64,
    rejected_calls: u64,
    open_count: u64,
    last_transition: Instant,
}

impl RouteCircuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            phase: Phase::Closed,
            window: OutcomeWindow::new(config.sliding_window_size),
            config,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_slow: 0,
            rejected_calls: 0,
            open_count: 0,
            last_transition: Instant::now(),
        }
    }

    fn state(&self) -> CircuitState {
        match self.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Gate one call. Admission mutates half-open bookkeeping, so rejected
    /// calls are counted here as well.
    fn try_acquire(&mut self, route: &Route) -> Result<(), CircuitError> {
        match &mut self.phase {
            Phase::Closed => Ok(()),

            Phase::Open { since } => {
                let waited = since.elapsed();
                if waited >= self.config.wait_duration_in_open {
                    info!(route = %route, "circuit transitioning from Open to HalfOpen");
                    self.phase = Phase::HalfOpen {
                        since: Instant::now(),
                        admitted: 1,
                        outcomes: Vec::new(),
                    };
                    self.last_transition = Instant::now();
                    Ok(())
                } else {
                    self.rejected_calls += 1;
                    Err(CircuitError::CircuitOpen {
                        route: route.clone(),
                        retry_after: self.config.wait_duration_in_open - waited,
                    })
                }
            }

            Phase::HalfOpen {
                since, admitted, ..
            } => {
                if since.elapsed() >= self.config.max_wait_duration_in_half_open {
                    warn!(
                        route = %route,
                        "half-open probes undecided for too long, reopening circuit"
                    );
                    self.trip_open(route);
                    self.rejected_calls += 1;
                    return Err(CircuitError::CircuitOpen {
                        route: route.clone(),
                        retry_after: self.config.wait_duration_in_open,
                    });
                }
                if *admitted < self.config.permitted_calls_in_half_open {
                    *admitted += 1;
                    Ok(())
                } else {
                    self.rejected_calls += 1;
                    Err(CircuitError::CircuitOpen {
                        route: route.clone(),
                        retry_after: self
                            .config
                            .max_wait_duration_in_half_open
                            .saturating_sub(since.elapsed()),
                    })
                }
            }
        }
    }

    /// Record the outcome of an executed call. The only mutation path for
    /// the rates.
    fn record(&mut self, route: &Route, ok: bool, duration: Duration) {
        let slow = duration >= self.config.slow_call_duration_threshold;
        self.total_calls += 1;
        if ok {
            self.total_successes += 1;
        } else {
            self.total_failures += 1;
        }
        if slow {
            self.total_slow += 1;
        }
        let record = CallRecord { ok, slow };

        match &mut self.phase {
            Phase::Closed => {
                self.window.push(record);
                if self.window.len() >= self.config.minimum_calls {
                    let failure_rate = self.window.failure_rate();
                    let slow_rate = self.window.slow_call_rate();
                    if failure_rate >= self.config.failure_rate_threshold
                        || slow_rate >= self.config.slow_call_rate_threshold
                    {
                        warn!(
                            route = %route,
                            failure_rate = failure_rate,
                            slow_rate = slow_rate,
                            "circuit transitioning from Closed to Open"
                        );
                        self.trip_open(route);
                    }
                }
            }

            Phase::Open { .. } => {
                // late probe result after a forced reopen; totals above are
                // enough
                debug!(route = %route, "outcome recorded while circuit is open");
            }

            Phase::HalfOpen { outcomes, .. } => {
                outcomes.push(record);
                if outcomes.len() >= self.config.permitted_calls_in_half_open {
                    if rates_breached(outcomes, &self.config) {
                        warn!(route = %route, "half-open probes unhealthy, reopening circuit");
                        self.trip_open(route);
                    } else {
                        info!(route = %route, "circuit transitioning from HalfOpen to Closed");
                        self.window.clear();
                        self.phase = Phase::Closed;
                        self.last_transition = Instant::now();
                    }
                }
            }
        }
    }

    fn trip_open(&mut self, route: &Route) {
        debug!(route = %route, open_count = self.open_count + 1, "circuit opened");
        self.phase = Phase::Open {
            since: Instant::now(),
        };
        self.open_count += 1;
        self.last_transition = Instant::now();
    }

    fn reset(&mut self) {
        self.phase = Phase::Closed;
        self.window.clear();
        self.last_transition = Instant::now();
    }
}

/// Circuit breaker statistics for one route.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,

    /// Total calls recorded
    pub total_calls: u64,

    /// Total successful calls
    pub total_successes: u64,

    /// Total failed calls
    pub total_failures: u64,

    /// Total calls classified slow
    pub total_slow: u64,

    /// Calls rejected without execution
    pub rejected_calls: u64,

    /// Number of times the circuit has opened
    pub open_count: u64,

    /// Failure rate over the current window
    pub failure_rate: f64,

    /// Slow-call rate over the current window
    pub slow_call_rate: f64,

    /// Time since the last state transition
    pub time_in_state: Duration,
}

/// Circuit breaker registry for all routes.
///
/// One circuit is created per route on first use and lives for the life of
/// the registry. State is mutated only through [`try_acquire`] and
/// [`record`].
///
/// [`try_acquire`]: CircuitBreaker::try_acquire
/// [`record`]: CircuitBreaker::record
pub struct CircuitBreaker {
    circuits: RwLock<HashMap<Route, RouteCircuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker registry
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Gate a call to `route`. Cheap rejection: when the circuit is open no
    /// connection is leased and no timeout policy runs.
    pub async fn try_acquire(&self, route: &Route) -> Result<(), CircuitError> {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(route.clone())
            .or_insert_with(|| RouteCircuit::new(self.config.clone()));
        circuit.try_acquire(route)
    }

    /// Record a completed call for `route`. Calls at least
    /// `slow_call_duration_threshold` long are classified slow.
    pub async fn record(&self, route: &Route, ok: bool, duration: Duration) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(route.clone())
            .or_insert_with(|| RouteCircuit::new(self.config.clone()));
        circuit.record(route, ok, duration);
    }

    /// Current state of a route's circuit. Routes never seen are Closed.
    pub async fn state(&self, route: &Route) -> CircuitState {
        let circuits = self.circuits.read().await;
        circuits
            .get(route)
            .map(|c| c.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Statistics for a route's circuit
    pub async fn stats(&self, route: &Route) -> Option<CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits.get(route).map(Self::stats_for)
    }

    /// Statistics for all routes
    pub async fn all_stats(&self) -> HashMap<Route, CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits
            .iter()
            .map(|(route, circuit)| (route.clone(), Self::stats_for(circuit)))
            .collect()
    }

    /// Manually reset a route's circuit to Closed
    pub async fn reset(&self, route: &Route) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(route) {
            info!(route = %route, "manually resetting circuit to Closed");
            circuit.reset();
        }
    }

    fn stats_for(circuit: &RouteCircuit) -> CircuitStats {
        CircuitStats {
            state: circuit.state(),
            total_calls: circuit.total_calls,
            total_successes: circuit.total_successes,
            total_failures: circuit.total_failures,
            total_slow: circuit.total_slow,
            rejected_calls: circuit.rejected_calls,
            open_count: circuit.open_count,
            failure_rate: circuit.window.failure_rate(),
            slow_call_rate: circuit.window.slow_call_rate(),
            time_in_state: circuit.last_transition.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_route() -> Route {
        Route::http("upstream.test", 9000)
    }

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 90.0,
            slow_call_duration_threshold: Duration::from_millis(200),
            minimum_calls: 4,
            sliding_window_size: 10,
            wait_duration_in_open: Duration::from_millis(200),
            permitted_calls_in_half_open: 2,
            max_wait_duration_in_half_open: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_circuit_closed_to_open_on_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        let route = test_route();

        // window below minimum_calls: rates are not trusted yet
        breaker.try_acquire(&route).await.unwrap();
        breaker.record(&route, false, Duration::from_millis(1)).await;
        assert_eq!(breaker.state(&route).await, CircuitState::Closed);

        for _ in 0..3 {
            breaker.record(&route, false, Duration::from_millis(1)).await;
        }

        assert_eq!(breaker.state(&route).await, CircuitState::Open);
        let result = breaker.try_acquire(&route).await;
        assert!(matches!(result, Err(CircuitError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_circuit_opens_on_slow_calls() {
        let breaker = CircuitBreaker::new(fast_config());
        let route = test_route();

        // successful but slow: the slow-call rate alone must open the circuit
        for _ in 0..4 {
            breaker.try_acquire(&route).await.unwrap();
            breaker.record(&route, true, Duration::from_millis(250)).await;
        }

        assert_eq!(breaker.state(&route).await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_circuit_half_open_to_closed() {
        let breaker = CircuitBreaker::new(fast_config());
        let route = test_route();

        for _ in 0..4 {
            breaker.record(&route, false, Duration::from_millis(1)).await;
        }
        assert_eq!(breaker.state(&route).await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(250)).await;

        // probes are admitted and healthy
        breaker.try_acquire(&route).await.unwrap();
        assert_eq!(breaker.state(&route).await, CircuitState::HalfOpen);
        breaker.try_acquire(&route).await.unwrap();

        breaker.record(&route, true, Duration::from_millis(10)).await;
        breaker.record(&route, true, Duration::from_millis(10)).await;

        assert_eq!(breaker.state(&route).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_half_open_to_open_on_bad_probe() {
        let breaker = CircuitBreaker::new(fast_config());
        let route = test_route();

        for _ in 0..4 {
            breaker.record(&route, false, Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        breaker.try_acquire(&route).await.unwrap();
        breaker.try_acquire(&route).await.unwrap();
        breaker.record(&route, false, Duration::from_millis(1)).await;
        breaker.record(&route, false, Duration::from_millis(1)).await;

        assert_eq!(breaker.state(&route).await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_only_permitted_probes() {
        let breaker = CircuitBreaker::new(fast_config());
        let route = test_route();

        for _ in 0..4 {
            breaker.record(&route, false, Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        breaker.try_acquire(&route).await.unwrap();
        breaker.try_acquire(&route).await.unwrap();
        // third call exceeds permitted_calls_in_half_open = 2
        let result = breaker.try_acquire(&route).await;
        assert!(matches!(result, Err(CircuitError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_half_open_times_out_back_to_open() {
        let mut config = fast_config();
        config.max_wait_duration_in_half_open = Duration::from_millis(100);
        let breaker = CircuitBreaker::new(config);
        let route = test_route();

        for _ in 0..4 {
            breaker.record(&route, false, Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        breaker.try_acquire(&route).await.unwrap();
        assert_eq!(breaker.state(&route).await, CircuitState::HalfOpen);

        // the probe never reports; the circuit must not hang half-open
        tokio::time::sleep(Duration::from_millis(150)).await;
        let result = breaker.try_acquire(&route).await;
        assert!(matches!(result, Err(CircuitError::CircuitOpen { .. })));
        assert_eq!(breaker.state(&route).await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_window_eviction_keeps_rates_recent() {
        let config = CircuitBreakerConfig {
            minimum_calls: 4,
            sliding_window_size: 4,
            failure_rate_threshold: 75.0,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new(config);
        let route = test_route();

        // old failures are pushed out by newer successes
        breaker.record(&route, false, Duration::from_millis(1)).await;
        breaker.record(&route, false, Duration::from_millis(1)).await;
        for _ in 0..4 {
            breaker.record(&route, true, Duration::from_millis(1)).await;
        }

        assert_eq!(breaker.state(&route).await, CircuitState::Closed);
        let stats = breaker.stats(&route).await.unwrap();
        assert_eq!(stats.failure_rate, 0.0);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker = CircuitBreaker::new(fast_config());
        let route = test_route();

        for _ in 0..4 {
            breaker.record(&route, false, Duration::from_millis(1)).await;
        }
        assert_eq!(breaker.state(&route).await, CircuitState::Open);

        breaker.reset(&route).await;
        assert_eq!(breaker.state(&route).await, CircuitState::Closed);
        assert!(breaker.try_acquire(&route).await.is_ok());
    }

    #[test]
    fn test_circuit_state_names() {
        assert_eq!(CircuitState::Closed.name(), "Closed");
        assert_eq!(CircuitState::Open.name(), "Open");
        assert_eq!(CircuitState::HalfOpen.name(), "HalfOpen");
    }
}
