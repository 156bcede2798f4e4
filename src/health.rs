//! Health monitoring and circuit breaker (C3)
//!
//! Each backend owns one [`HealthState`]: the health-status state
//! machine (Healthy/Degraded/Unhealthy/Unknown) driven by active probes
//! and passive request outcomes, composed with an independent circuit
//! breaker (Closed/Open/HalfOpen). Per cyclic-reference note,
//! this module has no back-reference to the registry; callers look
//! records up by backend id through a handle they already hold.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{CircuitBreakerConfig, HealthConfig};
use crate::error::BreakerError;

const OUTCOME_WINDOW: usize = 100;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Circuit breaker phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Closed,
    Open,
    HalfOpen,
}

/// A sliding window of the last `OUTCOME_WINDOW` request outcomes, used
/// for the windowed-error-rate thresholds in
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    failures: u32,
}

impl OutcomeWindow {
    fn new() -> Self {
        Self {
            outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            failures: 0,
        }
    }

    fn record(&mut self, success: bool) {
        if self.outcomes.len() == OUTCOME_WINDOW
            && let Some(oldest) = self.outcomes.pop_front()
            && !oldest
        {
            self.failures -= 1;
        }
        if !success {
            self.failures += 1;
        }
        self.outcomes.push_back(success);
    }

    fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.outcomes.len() as f64
        }
    }
}

/// Inner mutable health/breaker state, single-writer (the per-backend
/// monitor task) behind one mutex, per discipline.
struct Inner {
    status: Status,
    consecutive_success: u32,
    consecutive_failure: u32,
    window: OutcomeWindow,
    last_probe_at: Option<Instant>,
    degraded_since: Option<Instant>,
    p99_latency: Duration,

    phase: Phase,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    failure_counter: u32,
    half_open_successes: u32,
    current_backoff: Duration,
}

/// Per-backend health record + circuit breaker. Read paths (the EWMA
/// error rate and in-flight counters used by the router) are
/// lock-free atomics; state transitions go through the mutex.
pub struct HealthState {
    inner: Mutex<Inner>,
    error_rate_ewma_bits: AtomicU64, // f64 bit pattern
    latency_ewma_micros: AtomicU64,
    in_flight: AtomicU32,
    health_cfg: HealthConfig,
    breaker_cfg: CircuitBreakerConfig,
}

const EWMA_ALPHA: f64 = 0.1;

impl HealthState {
    pub fn new(health_cfg: HealthConfig, breaker_cfg: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: Status::Unknown,
                consecutive_success: 0,
                consecutive_failure: 0,
                window: OutcomeWindow::new(),
                last_probe_at: None,
                degraded_since: None,
                p99_latency: Duration::ZERO,
                phase: Phase::Closed,
                opened_at: None,
                half_open_in_flight: 0,
                failure_counter: 0,
                half_open_successes: 0,
                current_backoff: breaker_cfg.recovery_timeout,
            }),
            error_rate_ewma_bits: AtomicU64::new(0f64.to_bits()),
            latency_ewma_micros: AtomicU64::new(0),
            in_flight: AtomicU32::new(0),
            health_cfg,
            breaker_cfg,
        }
    }

    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().unwrap().phase
    }

    pub fn error_rate_ewma(&self) -> f64 {
        f64::from_bits(self.error_rate_ewma_bits.load(Ordering::Relaxed))
    }

    pub fn latency_ewma(&self) -> Duration {
        Duration::from_micros(self.latency_ewma_micros.load(Ordering::Relaxed))
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Is this backend currently serviceable by the router: health is
    /// Healthy/Degraded and the breaker has dispatch capacity.
    pub fn is_serviceable(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let health_ok = matches!(inner.status, Status::Healthy | Status::Degraded);
        let breaker_ok = match inner.phase {
            Phase::Closed => true,
            Phase::Open => false,
            Phase::HalfOpen => inner.half_open_in_flight < self.breaker_cfg.half_open_limit,
        };
        health_ok && breaker_ok
    }

    /// Active-probe interval to use given current health status
    /// (10s/5s/30s for healthy/degraded/unhealthy).
    pub fn probe_interval(&self) -> Duration {
        match self.status() {
            Status::Healthy | Status::Unknown => self.health_cfg.healthy_interval,
            Status::Degraded => self.health_cfg.degraded_interval,
            Status::Unhealthy => self.health_cfg.unhealthy_interval,
        }
    }

    /// Attempt to admit a request through the breaker. Returns an error
    /// if the circuit is open or half-open at capacity, otherwise
    /// increments in-flight accounting and, for `HalfOpen`, the probe
    /// counter.
    pub fn try_admit(&self, backend_id: &str) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            Phase::Closed => {}
            Phase::Open => {
                if let Some(opened_at) = inner.opened_at
                    && opened_at.elapsed() >= inner.current_backoff
                {
                    inner.phase = Phase::HalfOpen;
                    inner.half_open_in_flight = 0;
                    inner.half_open_successes = 0;
                } else {
                    return Err(BreakerError::Open(backend_id.to_string()));
                }
            }
            Phase::HalfOpen => {
                if inner.half_open_in_flight >= self.breaker_cfg.half_open_limit {
                    return Err(BreakerError::Open(backend_id.to_string()));
                }
            }
        }
        if inner.phase == Phase::HalfOpen {
            inner.half_open_in_flight += 1;
        }
        drop(inner);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record the outcome of a real (non-probe) request: updates EWMA
    /// error rate/latency, the sliding outcome window, consecutive
    /// counters, health transitions, and breaker transitions.
    pub fn record_outcome(&self, success: bool, latency: Duration) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.update_ewma(success, latency);

        let mut inner = self.inner.lock().unwrap();
        if inner.phase == Phase::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.window.record(success);
        if success {
            inner.consecutive_success += 1;
            inner.consecutive_failure = 0;
        } else {
            inner.consecutive_failure += 1;
            inner.consecutive_success = 0;
        }

        self.apply_health_transition(&mut inner);
        self.apply_breaker_transition(&mut inner, success);
    }

    /// Record the outcome of an active probe : probe
    /// successes never force `Closed` on their own — only `HalfOpen`
    /// test requests (handled in `record_outcome`) do that.
    pub fn record_probe(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_probe_at = Some(Instant::now());
        if success {
            inner.consecutive_success += 1;
            inner.consecutive_failure = 0;
        } else {
            inner.consecutive_failure += 1;
            inner.consecutive_success = 0;
        }
        self.apply_health_transition(&mut inner);
    }

    fn update_ewma(&self, success: bool, latency: Duration) {
        let sample = if success { 0.0 } else { 1.0 };
        let prev = self.error_rate_ewma();
        let next = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * prev;
        self.error_rate_ewma_bits.store(next.to_bits(), Ordering::Relaxed);

        let prev_latency = self.latency_ewma_micros.load(Ordering::Relaxed) as f64;
        let next_latency =
            EWMA_ALPHA * latency.as_micros() as f64 + (1.0 - EWMA_ALPHA) * prev_latency;
        self.latency_ewma_micros
            .store(next_latency as u64, Ordering::Relaxed);
    }

    fn apply_health_transition(&self, inner: &mut Inner) {
        let cfg = &self.health_cfg;
        let window_error_rate = inner.window.error_rate();
        match inner.status {
            Status::Unknown => {
                if inner.consecutive_success >= 1 {
                    inner.status = Status::Healthy;
                }
            }
            Status::Healthy => {
                if inner.consecutive_failure >= cfg.fall_threshold || window_error_rate > cfg.err_rate_degraded
                {
                    inner.status = Status::Degraded;
                    inner.degraded_since = Some(Instant::now());
                }
            }
            Status::Degraded => {
                let latency_breach = inner.p99_latency > cfg.latency_unhealthy;
                if inner.consecutive_failure >= 5
                    || window_error_rate > cfg.err_rate_unhealthy
                    || latency_breach
                {
                    inner.status = Status::Unhealthy;
                    inner.degraded_since = None;
                } else if inner.consecutive_success >= 5
                    && window_error_rate < 0.05
                    && inner
                        .degraded_since
                        .is_none_or(|since| since.elapsed() >= Duration::from_secs(60))
                {
                    inner.status = Status::Healthy;
                    inner.degraded_since = None;
                }
            }
            Status::Unhealthy => {
                if inner.consecutive_success >= 2 {
                    inner.status = Status::Degraded;
                    inner.degraded_since = Some(Instant::now());
                }
            }
        }
    }

    fn apply_breaker_transition(&self, inner: &mut Inner, success: bool) {
        let cfg = &self.breaker_cfg;
        match inner.phase {
            Phase::Closed => {
                if success {
                    inner.failure_counter = 0;
                } else {
                    inner.failure_counter += 1;
                }
                if inner.failure_counter >= cfg.failure_threshold
                    || inner.window.error_rate() > cfg.error_rate_threshold
                {
                    self.trip_open(inner, false);
                }
            }
            Phase::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= cfg.success_threshold {
                        inner.phase = Phase::Closed;
                        inner.failure_counter = 0;
                        inner.current_backoff = cfg.recovery_timeout;
                        inner.half_open_successes = 0;
                    }
                } else {
                    self.trip_open(inner, true);
                }
            }
            Phase::Open => {}
        }
    }

    fn trip_open(&self, inner: &mut Inner, doubled: bool) {
        let cfg = &self.breaker_cfg;
        inner.phase = Phase::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
        inner.failure_counter = 0;
        if doubled {
            let doubled_backoff = inner.current_backoff.mul_f64(cfg.backoff_multiplier);
            inner.current_backoff = doubled_backoff.min(cfg.max_backoff);
        } else {
            inner.current_backoff = cfg.recovery_timeout;
        }
    }

    /// Update the p99 latency sketch consulted by the Degraded->Unhealthy
    /// transition. A full HDR histogram lives in [`crate::tracker`]; this
    /// is fed the tracker's computed p99 periodically by the monitor
    /// task rather than recomputing it per-request.
    pub fn set_p99_latency(&self, p99: Duration) {
        self.inner.lock().unwrap().p99_latency = p99;
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock().unwrap();
        HealthSnapshot {
            status: inner.status,
            phase: inner.phase,
            consecutive_success: inner.consecutive_success,
            consecutive_failure: inner.consecutive_failure,
            error_rate_ewma: self.error_rate_ewma(),
            latency_ewma_ms: self.latency_ewma().as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Status,
    pub phase: Phase,
    pub consecutive_success: u32,
    pub consecutive_failure: u32,
    pub error_rate_ewma: f64,
    pub latency_ewma_ms: f64,
}

/// Registry of per-backend [`HealthState`], owned by the engine. Per
///, components never hold a back-reference to the registry or
/// to each other — the router/pool/protocol handler each look up a
/// backend's health state by id through this handle.
#[derive(Default)]
pub struct HealthManager {
    states: dashmap::DashMap<String, Arc<HealthState>>,
}

impl HealthManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, backend_id: &str, health_cfg: HealthConfig, breaker_cfg: CircuitBreakerConfig) {
        self.states
            .insert(backend_id.to_string(), Arc::new(HealthState::new(health_cfg, breaker_cfg)));
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<HealthState>> {
        self.states.get(backend_id).map(|r| Arc::clone(&r))
    }

    pub fn remove(&self, backend_id: &str) {
        self.states.remove(backend_id);
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.states.iter().map(|r| r.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> HealthState {
        HealthState::new(HealthConfig::default(), CircuitBreakerConfig::default())
    }

    #[test]
    fn starts_unknown_and_closed() {
        let s = state();
        assert_eq!(s.status(), Status::Unknown);
        assert_eq!(s.phase(), Phase::Closed);
        assert!(s.is_serviceable());
    }

    #[test]
    fn becomes_healthy_after_first_success() {
        let s = state();
        s.record_outcome(true, Duration::from_millis(5));
        assert_eq!(s.status(), Status::Healthy);
    }

    #[test]
    fn three_consecutive_failures_degrade_health() {
        let s = state();
        s.record_outcome(true, Duration::from_millis(5));
        for _ in 0..3 {
            s.record_outcome(false, Duration::from_millis(5));
        }
        assert_eq!(s.status(), Status::Degraded);
    }

    #[test]
    fn five_consecutive_circuit_failures_trip_breaker_open() {
        let s = state();
        for _ in 0..5 {
            s.try_admit("b").unwrap();
            s.record_outcome(false, Duration::from_millis(5));
        }
        assert_eq!(s.phase(), Phase::Open);
        assert!(s.try_admit("b").is_err());
    }

    #[test]
    fn half_open_allows_limited_probes_after_recovery_timeout() {
        let mut cfg = CircuitBreakerConfig::default();
        cfg.recovery_timeout = Duration::from_millis(10);
        let s = HealthState::new(HealthConfig::default(), cfg);
        for _ in 0..5 {
            s.try_admit("b").unwrap();
            s.record_outcome(false, Duration::from_millis(5));
        }
        assert_eq!(s.phase(), Phase::Open);
        std::thread::sleep(Duration::from_millis(15));
        assert!(s.try_admit("b").is_ok());
        assert_eq!(s.phase(), Phase::HalfOpen);
    }

    #[test]
    fn half_open_limit_is_enforced() {
        let mut cfg = CircuitBreakerConfig::default();
        cfg.recovery_timeout = Duration::from_millis(1);
        cfg.half_open_limit = 2;
        let s = HealthState::new(HealthConfig::default(), cfg);
        for _ in 0..5 {
            s.try_admit("b").unwrap();
            s.record_outcome(false, Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(5));
        s.try_admit("b").unwrap();
        s.try_admit("b").unwrap();
        assert!(s.try_admit("b").is_err());
    }

    #[test]
    fn half_open_single_failure_reopens_with_doubled_backoff() {
        let mut cfg = CircuitBreakerConfig::default();
        cfg.recovery_timeout = Duration::from_millis(1);
        let s = HealthState::new(HealthConfig::default(), cfg);
        for _ in 0..5 {
            s.try_admit("b").unwrap();
            s.record_outcome(false, Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(5));
        s.try_admit("b").unwrap();
        s.record_outcome(false, Duration::from_millis(5));
        assert_eq!(s.phase(), Phase::Open);
        let backoff = s.inner.lock().unwrap().current_backoff;
        assert!(backoff > Duration::from_secs(30));
    }

    #[test]
    fn half_open_success_threshold_closes_circuit() {
        let mut cfg = CircuitBreakerConfig::default();
        cfg.recovery_timeout = Duration::from_millis(1);
        cfg.success_threshold = 3;
        let s = HealthState::new(HealthConfig::default(), cfg);
        for _ in 0..5 {
            s.try_admit("b").unwrap();
            s.record_outcome(false, Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(5));
        for _ in 0..3 {
            s.try_admit("b").unwrap();
            s.record_outcome(true, Duration::from_millis(5));
        }
        assert_eq!(s.phase(), Phase::Closed);
    }

    #[test]
    fn probe_success_alone_does_not_close_an_open_circuit() {
        let s = state();
        for _ in 0..5 {
            s.try_admit("b").unwrap();
            s.record_outcome(false, Duration::from_millis(5));
        }
        assert_eq!(s.phase(), Phase::Open);
        s.record_probe(true);
        assert_eq!(s.phase(), Phase::Open);
    }

    #[test]
    fn error_rate_ewma_moves_toward_failures() {
        let s = state();
        for _ in 0..20 {
            s.record_outcome(false, Duration::from_millis(1));
        }
        assert!(s.error_rate_ewma() > 0.8);
    }
}
