//! Bounded exponential backoff shared by every control-plane calling path.
//!
//! Delays come from [`backoff::ExponentialBackoff`]; the attempt budget and
//! the transient/permanent split of [`ControlPlaneError`] are layered on top
//! through [`backoff::future::retry_notify`].

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;

use crate::control_plane::ControlPlaneError;

/// Why a retried call gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Every attempt failed transiently.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: ControlPlaneError,
    },
    /// The control plane refused the request; not retried.
    Rejected(ControlPlaneError),
    /// Cancellation was observed before or between attempts.
    Cancelled {
        /// Attempts already dispatched.
        attempts: u32,
    },
}

impl RetryError {
    /// Number of requests that reached the control plane.
    #[must_use]
    pub const fn dispatched(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts } => *attempts,
            Self::Rejected(_) => 1,
        }
    }
}

/// Exponential backoff policy with an attempt cap.
///
/// The nominal delay after failed attempt `n` is
/// `min(base_delay * 2^(n-1), max_delay)`; each delay is drawn uniformly from
/// `nominal * (1 ± randomization_factor)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap on the nominal delay.
    pub max_delay: Duration,
    /// Relative spread of each delay, between `0.0` and `1.0`.
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            randomization_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Fresh delay schedule for this policy. Never gives up on its own; the
    /// attempt cap is enforced by [`Self::run`].
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: self.randomization_factor.clamp(0.0, 1.0),
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Runs `call` until it succeeds, fails permanently, the attempt budget
    /// runs out, or `cancel` fires.
    ///
    /// Each attempt is bounded by `attempt_timeout`; an elapsed attempt counts
    /// as a transient [`ControlPlaneError::Timeout`]. A server-suggested
    /// `retry_after` replaces the computed delay.
    ///
    /// # Errors
    ///
    /// Returns the [`RetryError`] describing how the call gave up.
    pub async fn run<T, F, Fut>(
        &self,
        attempt_timeout: Duration,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ControlPlaneError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let attempts = AtomicU32::new(0);

        let operation = || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let pending = call();
            async move {
                let err = match tokio::time::timeout(attempt_timeout, pending).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(err)) => err,
                    Err(_) => ControlPlaneError::Timeout,
                };
                Err(classify(err, attempt, max_attempts))
            }
        };
        let notify = |failure: RetryError, delay: Duration| {
            if let RetryError::Exhausted { attempts, last } = &failure {
                tracing::warn!(
                    attempt = attempts,
                    error = %last,
                    delay_ms = delay.as_millis(),
                    "transient control-plane failure, retrying"
                );
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RetryError::Cancelled {
                attempts: attempts.load(Ordering::SeqCst),
            }),
            result = backoff::future::retry_notify(self.backoff(), operation, notify) => result,
        }
    }
}

/// Maps one failed attempt onto the backoff crate's retry decision.
fn classify(err: ControlPlaneError, attempt: u32, max_attempts: u32) -> backoff::Error<RetryError> {
    if !err.is_transient() {
        return backoff::Error::permanent(RetryError::Rejected(err));
    }
    let retry_after = match &err {
        ControlPlaneError::RateLimited { retry_after } => *retry_after,
        _ => None,
    };
    let failure = RetryError::Exhausted {
        attempts: attempt,
        last: err,
    };
    if attempt >= max_attempts {
        tracing::warn!(attempt, "retry budget exhausted");
        return backoff::Error::permanent(failure);
    }
    match retry_after {
        Some(after) => backoff::Error::retry_after(failure, after),
        None => backoff::Error::transient(failure),
    }
}
