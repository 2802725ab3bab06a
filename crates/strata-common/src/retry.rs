//! Retry and polling utilities.
//!
//! Two shapes of waiting show up during provisioning:
//!
//! - [`retry_with_backoff`] re-runs a fallible operation until it succeeds or
//!   runs out of attempts (IAM replication lag, throttled cloud APIs).
//! - [`poll_until`] re-runs a readiness check that reports "not yet" as
//!   `Ok(None)` until it yields a value or the step budget is exhausted
//!   (control-plane endpoint, long-running cloud operations).
//!
//! # Example
//!
//! ```ignore
//! use strata_common::retry::{poll_until, Backoff};
//!
//! let endpoint = poll_until(&Backoff::default(), "control plane endpoint", || async {
//!     match store.get(&key).await {
//!         Ok(cluster) => Ok(cluster.control_plane_endpoint()),
//!         Err(e) if e.is_not_found() => Ok(None),
//!         Err(e) => Err(e),
//!     }
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = fixed interval)
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fixed-interval retry without jitter
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Execute an async operation with exponential backoff and optional jitter.
///
/// Retries until success or until `max_attempts` is exhausted, in which case
/// the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but only errors accepted by `should_retry`
/// are retried; any other error is returned at once.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed with a permanent error"
                    );
                    return Err(e);
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let sleep_for = if config.jitter {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                } else {
                    delay
                };

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = sleep_for.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(sleep_for).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Bounded exponential backoff for readiness polling.
///
/// The default is 10s initial, x1.5 per step, 32 steps, with a single delay
/// capped at four minutes.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay after the first unsuccessful check
    pub initial: Duration,
    /// Growth factor applied after every step
    pub factor: f64,
    /// Number of checks before giving up
    pub steps: u32,
    /// Upper bound on a single delay
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            factor: 1.5,
            steps: 32,
            cap: Duration::from_secs(240),
        }
    }
}

impl Backoff {
    /// Delay to sleep after check number `step` (0-based)
    pub fn delay_for(&self, step: u32) -> Duration {
        let secs = self.initial.as_secs_f64() * self.factor.powi(step as i32);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }
}

/// Poll `check` until it yields a value.
///
/// - `Ok(Some(v))` ends the wait with `v`
/// - `Ok(None)` means "not yet", sleep and poll again
/// - `Err(e)` aborts immediately
///
/// Exhausting `backoff.steps` checks returns [`Error::Timeout`].
pub async fn poll_until<T, F, Fut>(
    backoff: &Backoff,
    description: &str,
    mut check: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<Option<T>>>,
{
    for step in 0..backoff.steps {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if step + 1 < backoff.steps {
            let delay = backoff.delay_for(step);
            debug!(
                waiting_for = %description,
                step = step + 1,
                delay_ms = delay.as_millis(),
                "Not ready yet"
            );
            tokio::time::sleep(delay).await;
        }
    }
    Err(Error::timeout(description, backoff.steps))
}
