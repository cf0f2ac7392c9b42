//! Bounded-concurrency fan-out and fan-in
//!
//! Runs a batch of zero-argument async operations with a concurrency bound
//! and one of three result policies: fail-fast, settle-all, or race. Results
//! are always reported by input position, never by completion order.
//!
//! Every batch shares one cancellation token derived from the caller's
//! signal. Cancelling it (externally, by batch timeout, or by a fail-fast
//! failure) makes the coordinator settle early; tasks still in flight are
//! discarded cooperatively rather than forcibly stopped.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::cancel::{CancelReason, CancellationToken, DisposeGuard};
use crate::error::{Error, Result};

/// Options for a parallel batch.
#[derive(Debug, Clone)]
pub struct ParallelOptions {
    /// Maximum tasks in flight at once; unbounded when `None`
    pub concurrency: Option<usize>,
    /// Abort the whole batch on the first failure
    pub fail_fast: bool,
    /// External cancellation signal for the batch
    pub signal: Option<CancellationToken>,
    /// Deadline for the whole batch
    pub timeout: Option<Duration>,
    /// Label identifying the batch in errors
    pub operation: String,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            fail_fast: true,
            signal: None,
            timeout: None,
            operation: "parallel".to_string(),
        }
    }
}

impl ParallelOptions {
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn operation(mut self, label: impl Into<String>) -> Self {
        self.operation = label.into();
        self
    }
}

/// Outcome of one task in a settle-all batch.
#[derive(Debug)]
pub enum SettledOutcome<T> {
    Fulfilled(T),
    Rejected(Error),
}

impl<T> SettledOutcome<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, SettledOutcome::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, SettledOutcome::Rejected(_))
    }
}

/// One task's outcome tagged with its input position.
#[derive(Debug)]
pub struct SettledResult<T> {
    pub index: usize,
    pub outcome: SettledOutcome<T>,
}

/// Run every task, failing fast or aggregating failures.
///
/// Up to `concurrency` tasks run at once; the result vector is ordered by
/// input position regardless of completion order. With `fail_fast` the
/// first failure cancels the batch token and is returned immediately; the
/// results of tasks still in flight are discarded. Without it, every task
/// runs to completion and any failures are reported together as
/// [`Error::Aggregate`], in input order. Empty input resolves immediately.
pub async fn parallel_all<F, Fut, T>(tasks: Vec<F>, options: ParallelOptions) -> Result<Vec<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let total = tasks.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let batch = batch_token(&options);
    let _guard = DisposeGuard::new(batch.clone());
    if let Some(reason) = batch.reason() {
        return Err(batch_error(reason, &options));
    }

    let limit = options.concurrency.unwrap_or(total).max(1);
    let mut pending = tasks.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    for _ in 0..limit {
        if let Some((index, task)) = pending.next() {
            in_flight.push(indexed(index, task));
        }
    }

    let mut completed: Vec<(usize, T)> = Vec::with_capacity(total);
    let mut failures: Vec<(usize, Error)> = Vec::new();

    while !in_flight.is_empty() {
        tokio::select! {
            reason = batch.cancelled() => {
                return Err(batch_error(reason, &options));
            }
            settled = in_flight.next() => {
                let Some((index, result)) = settled else { break };
                match result {
                    Ok(value) => completed.push((index, value)),
                    Err(error) if options.fail_fast => {
                        batch.cancel_with_reason("sibling task failed");
                        return Err(error);
                    }
                    Err(error) => failures.push((index, error)),
                }
                if let Some((index, task)) = pending.next() {
                    in_flight.push(indexed(index, task));
                }
            }
        }
    }

    if !failures.is_empty() {
        failures.sort_by_key(|(index, _)| *index);
        return Err(Error::Aggregate {
            operation: options.operation,
            errors: failures.into_iter().map(|(_, error)| error).collect(),
        });
    }
    completed.sort_by_key(|(index, _)| *index);
    Ok(completed.into_iter().map(|(_, value)| value).collect())
}

/// Run every task to a tagged outcome; never fails as a whole.
///
/// Tasks are processed in `concurrency`-sized chunks, so index assignment
/// is deterministic while execution within a chunk is concurrent. If the
/// batch token cancels mid-way, the remaining tasks are reported rejected
/// with the corresponding cancellation or timeout error.
pub async fn parallel_settled<F, Fut, T>(
    tasks: Vec<F>,
    options: ParallelOptions,
) -> Vec<SettledResult<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }
    let batch = batch_token(&options);
    let _guard = DisposeGuard::new(batch.clone());

    let chunk_size = options.concurrency.unwrap_or(total).max(1);
    let mut results: Vec<SettledResult<T>> = Vec::with_capacity(total);
    let mut tasks_iter = tasks.into_iter();
    let mut next_index = 0usize;

    while next_index < total {
        let chunk: Vec<F> = tasks_iter.by_ref().take(chunk_size).collect();
        let start = next_index;
        next_index += chunk.len();

        if let Some(reason) = batch.reason() {
            for index in start..next_index {
                results.push(rejected(index, reason.clone(), &options));
            }
            continue;
        }

        let chunk_futures = chunk
            .into_iter()
            .enumerate()
            .map(|(offset, task)| async move { (start + offset, task().await) });

        tokio::select! {
            settled = join_all(chunk_futures) => {
                for (index, result) in settled {
                    results.push(SettledResult {
                        index,
                        outcome: match result {
                            Ok(value) => SettledOutcome::Fulfilled(value),
                            Err(error) => SettledOutcome::Rejected(error),
                        },
                    });
                }
            }
            reason = batch.cancelled() => {
                for index in start..next_index {
                    results.push(rejected(index, reason.clone(), &options));
                }
            }
        }
    }
    results
}

/// Settle with whichever task settles first, value or error.
///
/// Losers are cancelled through the shared batch token and their eventual
/// results discarded; they are not forcibly stopped.
pub async fn race_all<F, Fut, T>(tasks: Vec<F>, label: impl Into<String>) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    race_all_opts(tasks, ParallelOptions::default().operation(label)).await
}

/// [`race_all`] with an external signal and batch timeout.
pub async fn race_all_opts<F, Fut, T>(tasks: Vec<F>, options: ParallelOptions) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if tasks.is_empty() {
        return Err(Error::operation(format!(
            "race '{}' needs at least one task",
            options.operation
        )));
    }
    let batch = batch_token(&options);
    let _guard = DisposeGuard::new(batch.clone());
    if let Some(reason) = batch.reason() {
        return Err(batch_error(reason, &options));
    }

    let mut in_flight: FuturesUnordered<Fut> = tasks.into_iter().map(|task| task()).collect();
    tokio::select! {
        winner = in_flight.next() => {
            batch.cancel_with_reason("race settled");
            match winner {
                Some(result) => result,
                None => Err(Error::operation(format!(
                    "race '{}' produced no result",
                    options.operation
                ))),
            }
        }
        reason = batch.cancelled() => Err(batch_error(reason, &options)),
    }
}

async fn indexed<F, Fut, T>(index: usize, task: F) -> (usize, Result<T>)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    (index, task().await)
}

fn batch_token(options: &ParallelOptions) -> CancellationToken {
    let token = match &options.signal {
        Some(signal) => signal.child(),
        None => CancellationToken::new(),
    };
    if let Some(timeout) = options.timeout {
        token.attach_timer(timeout);
    }
    token
}

fn batch_error(reason: CancelReason, options: &ParallelOptions) -> Error {
    match reason {
        // a Timeout reason with no batch deadline came from the external
        // signal, so it is a cancellation from this batch's point of view
        CancelReason::Timeout => match options.timeout {
            Some(timeout) => Error::Timeout {
                operation: options.operation.clone(),
                timeout,
            },
            None => Error::Cancelled {
                reason: Some("timeout".to_string()),
            },
        },
        CancelReason::Manual(reason) => Error::Cancelled { reason },
    }
}

fn rejected<T>(index: usize, reason: CancelReason, options: &ParallelOptions) -> SettledResult<T> {
    SettledResult {
        index,
        outcome: SettledOutcome::Rejected(batch_error(reason, options)),
    }
}
