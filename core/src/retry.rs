//! Exponential backoff with jitter for transient transport failures.
//!
//! The retry primitive only retries; it never picks a different execution
//! target. An attempt that needs one reports [`Attempt::Fallback`] and the
//! caller's policy decides where to go next.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Disposition, MeshError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Relative jitter applied to each delay, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.2,
        }
    }
}

/// Result of one attempt, tagged by what the caller should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    Ok(T),
    Retryable(MeshError),
    Fallback(MeshError),
    Fatal(MeshError),
}

impl<T> From<crate::Result<T>> for Attempt<T> {
    fn from(res: crate::Result<T>) -> Self {
        match res {
            Ok(v) => Attempt::Ok(v),
            Err(e) => match e.disposition() {
                Disposition::Retry => Attempt::Retryable(e),
                Disposition::Fallback => Attempt::Fallback(e),
                Disposition::Fail => Attempt::Fatal(e),
            },
        }
    }
}

/// Final outcome of [`RetryPolicy::run_tagged`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Ok(T),
    /// The operation asked for a different execution target.
    FallbackRequired(MeshError),
    /// Non-retryable failure, or retries exhausted.
    Failed { attempts: u32, error: MeshError },
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> crate::Result<T> {
        match self {
            RetryOutcome::Ok(v) => Ok(v),
            RetryOutcome::FallbackRequired(e) => Err(MeshError::FallbackRequired(e.to_string())),
            RetryOutcome::Failed { error, .. } => Err(error),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based) without jitter:
    /// `base * multiplier^(attempt-1)`, capped at `max_delay_ms`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// [`raw_delay`](Self::raw_delay) with uniform ±`jitter` applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || raw == 0.0 {
            return Duration::from_millis(raw as u64);
        }
        let factor = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_millis((raw * (1.0 + factor)).max(0.0) as u64)
    }

    /// Runs `op` until it succeeds, fails for good, or asks for a fallback.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run_tagged<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Attempt::Ok(v) => return RetryOutcome::Ok(v),
                Attempt::Fallback(e) => return RetryOutcome::FallbackRequired(e),
                Attempt::Fatal(e) => {
                    return RetryOutcome::Failed {
                        attempts: attempt,
                        error: e,
                    }
                }
                Attempt::Retryable(e) if attempt >= max => {
                    warn!(target: "transport", attempts = attempt, error = %e, "Retries exhausted");
                    return RetryOutcome::Failed {
                        attempts: attempt,
                        error: e,
                    };
                }
                Attempt::Retryable(e) => {
                    let delay = self.delay(attempt);
                    debug!(target: "transport", attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Convenience wrapper over [`run_tagged`](Self::run_tagged) for plain
    /// `Result`-returning operations.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> crate::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        self.run_tagged(|n| {
            let fut = op(n);
            async move { Attempt::from(fut.await) }
        })
        .await
        .into_result()
    }
}
