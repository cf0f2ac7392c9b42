//! Retry with exponential backoff and jitter
//!
//! Repeats an async operation until it succeeds, the attempt budget runs
//! out, the caller's predicate refuses, or a cancellation signal fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::RetryConfig;
use crate::error::{Error, Result};

type RetryPredicate = Arc<dyn Fn(&Error, usize) -> bool + Send + Sync>;
type RetryHook = Arc<dyn Fn(&Error, usize, Duration) + Send + Sync>;

/// Retry policy: backoff configuration plus runtime hooks.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    retry_if: Option<RetryPredicate>,
    on_retry: Option<RetryHook>,
    signal: Option<CancellationToken>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_if: None,
            on_retry: None,
            signal: None,
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Only retry when the predicate approves the error for the given
    /// attempt number. Default: every error is retried.
    pub fn retry_if(mut self, predicate: impl Fn(&Error, usize) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Observe each scheduled retry with the failed error, the attempt
    /// number that failed, and the delay about to be slept.
    pub fn on_retry(mut self, hook: impl Fn(&Error, usize, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Abort retrying (and any in-progress backoff sleep) when this token
    /// cancels.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Backoff delay for the given 1-based attempt, jitter applied.
    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.config.base_delay.as_secs_f64() * self.config.backoff_factor.powi(exponent);
        let capped = raw.min(self.config.max_delay.as_secs_f64());
        let jittered = if self.config.jitter_factor > 0.0 {
            use rand::Rng;
            let band = 1.0 - self.config.jitter_factor..=1.0 + self.config.jitter_factor;
            capped * rand::thread_rng().gen_range(band)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Retry an async operation with exponential backoff.
///
/// Attempt 1 runs immediately. A failed attempt is retried only while the
/// attempt budget allows it, the `retry_if` predicate approves, and the
/// signal has not cancelled; any of those exhausting yields
/// [`Error::RetryExhausted`] wrapping the last underlying error. A signal
/// firing mid-backoff aborts the sleep with [`Error::Cancelled`].
pub async fn with_retry<F, Fut, T>(
    mut operation: F,
    policy: RetryPolicy,
    label: impl Into<String>,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let label = label.into();
    let max_attempts = policy.config.max_attempts.max(1);
    let mut attempt = 1usize;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %label, attempt, "operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => {
                let budget_left = attempt < max_attempts;
                let approved = policy
                    .retry_if
                    .as_ref()
                    .map_or(true, |predicate| predicate(&error, attempt));
                let signal_cancelled = policy
                    .signal
                    .as_ref()
                    .is_some_and(|signal| signal.is_cancelled());

                if !budget_left || !approved || signal_cancelled {
                    warn!(
                        operation = %label,
                        attempt,
                        %error,
                        "giving up"
                    );
                    return Err(Error::RetryExhausted {
                        operation: label,
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                if let Some(hook) = &policy.on_retry {
                    hook(&error, attempt, delay);
                }
                warn!(
                    operation = %label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "attempt failed; backing off"
                );

                match &policy.signal {
                    Some(signal) => {
                        tokio::select! {
                            _ = sleep(delay) => {}
                            reason = signal.cancelled() => {
                                return Err(reason.into());
                            }
                        }
                    }
                    None => sleep(delay).await,
                }
                attempt += 1;
            }
        }
    }
}
