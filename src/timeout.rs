//! Deadline enforcement for async operations
//!
//! Races an operation against a timeout token derived from the caller's
//! cancellation signal, so "took too long" and "caller gave up" stay
//! distinguishable failure kinds.

use std::future::Future;
use std::time::Duration;

use crate::cancel::{CancelReason, CancellationToken, DisposeGuard};
use crate::error::{Error, Result};

/// Options for [`with_timeout_opts`].
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    /// Deadline for the operation
    pub timeout: Duration,
    /// Label identifying the operation in timeout errors
    pub operation: String,
    /// Optional external cancellation signal
    pub signal: Option<CancellationToken>,
}

impl TimeoutOptions {
    pub fn new(timeout: Duration, operation: impl Into<String>) -> Self {
        Self {
            timeout,
            operation: operation.into(),
            signal: None,
        }
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Race `operation` against `timeout`.
///
/// Resolves with the operation's result if it settles first; fails with
/// [`Error::Timeout`] once the deadline elapses. The loser keeps running
/// until its future is dropped; only its result is discarded.
pub async fn with_timeout<F, T>(
    operation: F,
    timeout: Duration,
    label: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout_opts(operation, TimeoutOptions::new(timeout, label)).await
}

/// Race `operation` against a deadline and an optional external signal.
///
/// The deadline firing yields [`Error::Timeout`]; the external signal
/// firing first yields [`Error::Cancelled`] instead, so callers can tell
/// the two apart. The internal deadline token is disposed on every exit
/// path, releasing its timer.
pub async fn with_timeout_opts<F, T>(operation: F, options: TimeoutOptions) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let TimeoutOptions {
        timeout,
        operation: label,
        signal,
    } = options;

    if let Some(signal) = &signal {
        if let Some(reason) = signal.reason() {
            return Err(reason.into());
        }
    }

    let deadline = match &signal {
        Some(signal) => signal.with_timeout(timeout),
        None => CancellationToken::new().with_timeout(timeout),
    };
    let _guard = DisposeGuard::new(deadline.clone());

    tokio::select! {
        result = operation => result,
        reason = deadline.cancelled() => match reason {
            CancelReason::Timeout => Err(Error::Timeout {
                operation: label,
                timeout,
            }),
            CancelReason::Manual(reason) => Err(Error::Cancelled { reason }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn after(delay: Duration, value: u32) -> Result<u32> {
        tokio::time::sleep(delay).await;
        Ok(value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_wins() {
        let result = with_timeout(
            after(Duration::from_millis(50), 7),
            Duration::from_millis(100),
            "fast",
        )
        .await;
        assert_eq!(result.expect("should win the race"), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_times_out() {
        let result = with_timeout(
            after(Duration::from_millis(500), 7),
            Duration::from_millis(100),
            "slow",
        )
        .await;
        match result {
            Err(Error::Timeout { operation, timeout }) => {
                assert_eq!(operation, "slow");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_signal_beats_deadline() {
        let signal = CancellationToken::new();
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel_with_reason("caller gave up");
        });

        let result = with_timeout_opts(
            after(Duration::from_millis(500), 7),
            TimeoutOptions::new(Duration::from_millis(100), "watched").signal(signal),
        )
        .await;

        match result {
            Err(Error::Cancelled { reason }) => {
                assert_eq!(reason.as_deref(), Some("caller gave up"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_signal_short_circuits() {
        let signal = CancellationToken::new();
        signal.cancel();
        let result: Result<u32> = with_timeout_opts(
            after(Duration::from_millis(10), 7),
            TimeoutOptions::new(Duration::from_millis(100), "dead").signal(signal),
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_releases_timer() {
        let signal = CancellationToken::new();
        let result = with_timeout_opts(
            after(Duration::from_millis(10), 1),
            TimeoutOptions::new(Duration::from_millis(50), "tidy").signal(signal.clone()),
        )
        .await;
        assert!(result.is_ok());

        // the deadline child was disposed; advancing past the deadline must
        // not cancel anything reachable from the caller's signal
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!signal.is_cancelled());
    }
}
