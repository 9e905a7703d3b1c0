//! Bounded Retry
//!
//! Bus operations never block indefinitely. Each one is wrapped in one of two
//! shapes, both parameterized by a reinitialize callback:
//!
//! - [`collect_samples`]: gather up to N accepted samples, spending one unit
//!   of a fixed budget per failed attempt, reinitializing when the budget runs
//!   out.
//! - [`reinit_on_error`]: on a failed operation, reinitialize and hand the
//!   original error back.

use std::time::Duration;

use tracing::{debug, warn};

/// Retry budget and pacing for sample collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before giving up.
    pub max_failures: u32,
    /// Pause after every attempt.
    pub interval: Duration,
    /// Extra pause after a failed attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failures: 3,
            interval: Duration::from_millis(100),
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Same budget, no sleeping.
    pub fn immediate(max_failures: u32) -> Self {
        Self {
            max_failures,
            interval: Duration::ZERO,
            backoff: Duration::ZERO,
        }
    }
}

/// Result of a single sampling attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    /// Sample accepted into the batch.
    Accepted(T),
    /// Sample read but discarded (out of range).
    Rejected,
}

/// What [`collect_samples`] gathered.
#[derive(Debug)]
pub struct Collected<T, E> {
    /// Accepted samples, in acquisition order.
    pub samples: Vec<T>,
    /// Failed attempts (bus errors plus rejected samples).
    pub failures: u32,
    /// Whether the budget ran out before the target was reached.
    pub exhausted: bool,
    /// Most recent bus error, if any.
    pub last_error: Option<E>,
}

async fn pause(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}

/// Collect up to `target` accepted samples.
///
/// Bus errors and rejected samples both consume the failure budget, so a
/// sensor stuck outside the sanity range cannot spin forever. When the budget
/// is spent, `reinit` runs once before returning; a reinit failure is logged
/// and otherwise ignored since the caller decides what an empty batch means.
pub async fn collect_samples<S, T, E, A, R>(
    state: &mut S,
    target: usize,
    policy: &RetryPolicy,
    mut attempt: A,
    reinit: R,
) -> Collected<T, E>
where
    A: FnMut(&mut S) -> Result<Attempt<T>, E>,
    R: FnOnce(&mut S) -> Result<(), E>,
    E: std::fmt::Display,
{
    let mut samples = Vec::with_capacity(target);
    let mut failures = 0u32;
    let mut last_error = None;

    while samples.len() < target && failures < policy.max_failures {
        match attempt(state) {
            Ok(Attempt::Accepted(sample)) => {
                samples.push(sample);
                pause(policy.interval).await;
            }
            Ok(Attempt::Rejected) => {
                failures += 1;
                debug!("Sample rejected ({}/{})", failures, policy.max_failures);
                pause(policy.interval).await;
            }
            Err(e) => {
                failures += 1;
                warn!("Sample read failed ({}/{}): {}", failures, policy.max_failures, e);
                last_error = Some(e);
                pause(policy.backoff).await;
            }
        }
    }

    let exhausted = samples.len() < target;
    if exhausted {
        warn!(
            "Retry budget exhausted with {}/{} samples, reinitializing",
            samples.len(),
            target
        );
        if let Err(e) = reinit(state) {
            warn!("Reinitialize failed: {}", e);
        }
    }

    Collected {
        samples,
        failures,
        exhausted,
        last_error,
    }
}

/// Pass `result` through; if it is an error, run `reinit` first.
///
/// Used as the tail of every multi-step bus transaction so a failure never
/// leaves the converter half-configured.
pub fn reinit_on_error<S, T, E, R>(state: &mut S, result: Result<T, E>, reinit: R) -> Result<T, E>
where
    R: FnOnce(&mut S) -> Result<(), E>,
    E: std::fmt::Display,
{
    if let Err(e) = &result {
        warn!("Bus operation failed, reinitializing: {}", e);
        if let Err(reinit_err) = reinit(state) {
            warn!("Reinitialize failed: {}", reinit_err);
        }
    }
    result
}
