//! Convergence polling primitives.
//!
//! Everything that waits on remote state in a validation run (a lifecycle
//! state on the control plane, an uptime counter on a device, a namespace
//! appearing in a cluster) follows the same shape: probe, sleep a fixed
//! interval, probe again, give up after a bound.
//!
//! # Invariants
//!
//! - Probes never overlap; the next probe starts after the previous one returned
//! - Every wait has an upper bound
//! - The last observation is always reported on timeout

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Convergence errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvergeError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource} (last observed: {last_observed})")]
    Timeout {
        resource: String,
        elapsed: Duration,
        last_observed: String,
    },
}

impl ConvergeError {
    /// The last value observed before giving up.
    pub fn last_observed(&self) -> &str {
        match self {
            Self::Timeout { last_observed, .. } => last_observed,
        }
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence<T> {
    /// Desired state reached; carries the final observation.
    Converged(T),

    /// Still moving; carries a description of what was seen.
    Pending(String),
}

/// How often and for how long to probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between two probes.
    pub interval: Duration,

    /// Upper bound for the whole wait.
    pub timeout: Duration,

    /// Sleep before the first probe.
    pub initial_delay: Duration,
}

impl PollPolicy {
    /// Policy with the given interval and timeout, probing immediately.
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            initial_delay: Duration::ZERO,
        }
    }

    /// Delay the first probe.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Probe until convergence or until the policy's timeout elapses.
///
/// The probe is always run at least once, even with a zero timeout. The
/// initial delay counts against the timeout.
pub async fn poll_until<T, F, Fut>(
    resource: &str,
    policy: PollPolicy,
    mut probe: F,
) -> Result<T, ConvergeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Convergence<T>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;

    if !policy.initial_delay.is_zero() {
        tokio::time::sleep(policy.initial_delay).await;
    }

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match probe().await {
            Convergence::Converged(value) => {
                debug!(resource, attempts, elapsed = ?started.elapsed(), "Converged");
                return Ok(value);
            }
            Convergence::Pending(observed) => {
                if Instant::now() + policy.interval > deadline {
                    let elapsed = started.elapsed();
                    warn!(resource, attempts, ?elapsed, last_observed = %observed, "Gave up waiting");
                    return Err(ConvergeError::Timeout {
                        resource: resource.to_string(),
                        elapsed,
                        last_observed: observed,
                    });
                }
                debug!(resource, attempts, observed = %observed, "Not converged yet");
            }
        }
        tokio::time::sleep(policy.interval).await;
    }
}

/// Retry a fallible probe a fixed number of times.
///
/// Returns the first `Some` produced, or `None` once the attempts are spent.
pub async fn retry_find<T, F, Fut>(attempts: u32, interval: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
    T: Debug,
{
    for attempt in 1..=attempts.max(1) {
        if let Some(found) = probe().await {
            debug!(attempt, ?found, "Found");
            return Some(found);
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    None
}
