use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::provider::ProviderError;

/// Breaker lifecycle: `Closed → Open → HalfOpen → Closed|Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// In half-open, set while the single trial call is outstanding.
    trial_in_flight: bool,
}

/// Per-provider circuit breaker.
///
/// Closed counts consecutive failures and trips at `failure_threshold`;
/// open rejects immediately until `timeout` has elapsed since the last
/// failure; half-open admits exactly one trial call whose outcome decides
/// the next state. State is process-local and never persisted; a restart
/// assumes the provider is healthy.
///
/// The mutex guards simple counter updates and is never held across an
/// await. Concurrent callers racing `record_*` can shift the trip point by
/// one call; that is accepted, not a correctness bug.
pub struct CircuitBreaker {
    provider: String,
    failure_threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            provider: provider.into(),
            failure_threshold,
            timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask to place a call. `Ok` admits the caller; the caller must follow
    /// up with `record_success` or `record_failure`.
    pub fn try_acquire(&self) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.timeout);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(provider = %self.provider, "circuit breaker half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(ProviderError::BreakerOpen {
                        provider: self.provider.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(ProviderError::BreakerOpen {
                        provider: self.provider.clone(),
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Closed {
            info!(provider = %self.provider, "circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        provider = %self.provider,
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                warn!(provider = %self.provider, "circuit breaker reopened after failed trial");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_admits_calls() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.try_acquire(),
            Err(ProviderError::BreakerOpen { .. })
        ));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn admits_exactly_one_trial_after_cooldown() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(0));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Second caller is rejected while the trial is outstanding.
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn trial_success_closes() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(0));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        cb.try_acquire().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn trial_failure_reopens_and_restarts_cooldown() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_secs(60));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Force the cooldown to lapse by using a zero-timeout breaker.
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(0));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        cb.try_acquire().unwrap();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_until_cooldown_elapses() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(30));
        cb.record_failure();
        assert!(cb.try_acquire().is_err());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.try_acquire().is_ok());
    }
}
