//! Error Recovery
//!
//! Retry and isolation primitives shared by the execution loop and router:
//! - Error classification from collaborator messages
//! - Exponential backoff with jitter
//! - Circuit breaker for flaky collaborators

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::policy::ExecutionPolicy;

/// Classification of errors for recovery strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure, retry likely to succeed
    Transient,
    /// Rate limiting, need backoff
    RateLimited,
    /// Resource unavailable, may recover
    ResourceUnavailable,
    /// Invalid input, retry won't help
    ValidationError,
    /// Authorization failed, needs intervention
    AuthError,
    /// Missing binary or file, retry won't help
    NotFound,
    Unknown,
}

impl ErrorClass {
    /// Classify an error from its message
    pub fn from_error(error: &str) -> Self {
        let lower = error.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
            Self::RateLimited
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("temporar")
            || lower.contains("try again")
        {
            Self::Transient
        } else if lower.contains("unavailable") || lower.contains("503") || lower.contains("busy") {
            Self::ResourceUnavailable
        } else if lower.contains("command not found") || lower.contains("no such file") {
            Self::NotFound
        } else if lower.contains("invalid") || lower.contains("syntax error") || lower.contains("400") {
            Self::ValidationError
        } else if lower.contains("permission denied")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("401")
            || lower.contains("403")
        {
            Self::AuthError
        } else {
            Self::Unknown
        }
    }

    /// Unknown errors are treated as permanent: a step that fails for an
    /// unrecognised reason goes to replanning rather than burning retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited | Self::ResourceUnavailable)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add jitter to prevent thundering herd
    pub add_jitter: bool,
    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Retry policy for skill steps
    pub fn from_execution(policy: &ExecutionPolicy) -> Self {
        Self {
            max_retries: policy.max_step_retries,
            initial_delay: Duration::from_millis(policy.backoff_initial_ms),
            max_delay: Duration::from_millis(policy.backoff_max_ms),
            ..Default::default()
        }
    }

    /// Calculate delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.add_jitter {
            let jitter = capped * self.jitter_factor * (rand_simple() * 2.0 - 1.0);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

/// Simple pseudo-random for jitter (avoid heavy rand dependency)
fn rand_simple() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// One probe allowed through
    HalfOpen,
    /// Blocking all requests
    Open,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
}

/// Circuit breaker guarding one collaborator
pub struct CircuitBreaker {
    name: String,
    failure_threshold: usize,
    open_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: usize, open_duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: failure_threshold.max(1),
            open_duration,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call may go through now
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_duration {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit {} half-open", self.name);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit {} closed", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            warn!(
                "Circuit {} opened after {} consecutive failures",
                self.name, inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(ErrorClass::from_error("Rate limit exceeded"), ErrorClass::RateLimited);
        assert_eq!(ErrorClass::from_error("connection refused"), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_error("service unavailable"), ErrorClass::ResourceUnavailable);
        assert_eq!(ErrorClass::from_error("sh: foo: command not found"), ErrorClass::NotFound);
        assert_eq!(ErrorClass::from_error("Permission denied"), ErrorClass::AuthError);
        assert!(!ErrorClass::from_error("exit code 1: boom").is_retryable());
        assert!(ErrorClass::from_error("Resource temporarily unavailable").is_retryable());
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            add_jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_policy_max_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 10.0,
            max_delay: Duration::from_secs(5),
            add_jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
    }

    #[test]
    fn test_policy_from_execution() {
        let exec = ExecutionPolicy {
            max_step_retries: 7,
            backoff_initial_ms: 10,
            backoff_max_ms: 20,
            ..Default::default()
        };
        let policy = RetryPolicy::from_execution(&exec);
        assert_eq!(policy.max_retries, 7);
        assert!(policy.delay_for_attempt(5) <= Duration::from_millis(24));
    }

    #[test]
    fn test_circuit_breaker_opens_and_recovers() {
        let cb = CircuitBreaker::new("external", 2, Duration::from_millis(0));
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Zero open duration: next call is the half-open probe
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_blocks_while_open() {
        let cb = CircuitBreaker::new("external", 1, Duration::from_secs(60));
        cb.record_failure();
        assert!(!cb.allow());
    }
}
