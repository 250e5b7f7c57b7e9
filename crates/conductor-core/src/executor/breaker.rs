//! Circuit breaker keyed by capability name
//!
//! Opens after a run of consecutive transient failures and short-circuits
//! further calls for a cooldown window. After the cooldown a single trial
//! call is let through (half-open); its outcome closes or re-opens the circuit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive transient failures before the circuit opens
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Successful trial calls needed to close a half-open circuit
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct CircuitState {
    status: CircuitStatus,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn should_allow(&mut self, config: &BreakerConfig) -> bool {
        match self.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => {
                let cooled = self
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= config.cooldown);
                if cooled {
                    self.status = CircuitStatus::HalfOpen;
                    self.success_count = 0;
                    self.trial_in_flight = true;
                }
                cooled
            }
            CircuitStatus::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&mut self, config: &BreakerConfig) {
        self.trial_in_flight = false;
        match self.status {
            CircuitStatus::Closed => self.failure_count = 0,
            CircuitStatus::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= config.success_threshold {
                    self.status = CircuitStatus::Closed;
                    self.failure_count = 0;
                    self.opened_at = None;
                }
            }
            CircuitStatus::Open => {}
        }
    }

    fn record_failure(&mut self, config: &BreakerConfig) {
        self.trial_in_flight = false;
        self.failure_count += 1;
        match self.status {
            CircuitStatus::Closed => {
                if self.failure_count >= config.failure_threshold {
                    self.status = CircuitStatus::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitStatus::HalfOpen => {
                self.status = CircuitStatus::Open;
                self.opened_at = Some(Instant::now());
            }
            CircuitStatus::Open => {}
        }
    }
}

/// Shared across plans and sessions
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn with_circuit<R>(&self, capability: &str, f: impl FnOnce(&mut CircuitState) -> R) -> R {
        let mut circuits = self
            .circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let circuit = circuits
            .entry(capability.to_string())
            .or_insert_with(CircuitState::new);
        f(circuit)
    }

    /// Whether a call to `capability` may go out now
    pub fn allow(&self, capability: &str) -> bool {
        let config = self.config;
        self.with_circuit(capability, |c| c.should_allow(&config))
    }

    pub fn record_success(&self, capability: &str) {
        let config = self.config;
        self.with_circuit(capability, |c| c.record_success(&config));
    }

    pub fn record_failure(&self, capability: &str) {
        let config = self.config;
        self.with_circuit(capability, |c| c.record_failure(&config));
    }

    pub fn status(&self, capability: &str) -> CircuitStatus {
        self.with_circuit(capability, |c| c.status)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
            success_threshold: 1,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = breaker(3, 60_000);
        for _ in 0..2 {
            assert!(breaker.allow("send_email"));
            breaker.record_failure("send_email");
        }
        assert_eq!(breaker.status("send_email"), CircuitStatus::Closed);
        assert!(breaker.allow("send_email"));
        breaker.record_failure("send_email");
        assert_eq!(breaker.status("send_email"), CircuitStatus::Open);
        assert!(!breaker.allow("send_email"));
        // keyed by capability
        assert!(breaker.allow("web_search"));
    }

    #[test]
    fn test_success_resets_the_run() {
        let breaker = breaker(2, 60_000);
        breaker.record_failure("x");
        breaker.record_success("x");
        breaker.record_failure("x");
        assert_eq!(breaker.status("x"), CircuitStatus::Closed);
    }

    #[test]
    fn test_half_open_allows_single_trial_call() {
        let breaker = breaker(1, 10);
        breaker.record_failure("x");
        assert!(!breaker.allow("x"));
        std::thread::sleep(Duration::from_millis(20));

        assert!(breaker.allow("x"));
        assert_eq!(breaker.status("x"), CircuitStatus::HalfOpen);
        assert!(!breaker.allow("x"));

        breaker.record_success("x");
        assert_eq!(breaker.status("x"), CircuitStatus::Closed);
        assert!(breaker.allow("x"));
    }

    #[test]
    fn test_failed_trial_call_reopens() {
        let breaker = breaker(1, 10);
        breaker.record_failure("x");
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow("x"));
        breaker.record_failure("x");
        assert_eq!(breaker.status("x"), CircuitStatus::Open);
        assert!(!breaker.allow("x"));
    }
}
