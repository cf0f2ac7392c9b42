//! # breakwater
//!
//! Composable resilience primitives for async operations: retry with
//! backoff and jitter, deadline enforcement, per-key circuit breaking,
//! cooperative cancellation, and bounded-concurrency fan-out — all
//! producing one context-carrying error taxonomy callers can
//! pattern-match on.
//!
//! ## Core Concepts
//!
//! - **Wrapping functions**: each primitive takes an async operation plus
//!   a configuration and returns the operation's result or a typed
//!   failure. They nest freely; the conventional order is circuit
//!   outermost, retry in the middle, timeout innermost.
//! - **[`CancellationToken`]**: a cooperative signal threaded through every
//!   layer, so timeouts, retry sleeps, and parallel batches can unwind
//!   early without forcibly aborting in-flight work.
//! - **[`CircuitBreakerRegistry`]**: an explicit, injectable registry of
//!   named circuits — no process-wide singleton. Callers pick the keys
//!   (typically a downstream dependency name) and read snapshots for
//!   metrics.
//! - **[`Error`]**: the closed set of failure kinds (`Timeout`,
//!   `Cancelled`, `CircuitOpen`, `RetryExhausted`, `Aggregate`,
//!   `Operation`, `Context`) with retryability and cancellation flags and
//!   lossless context chaining.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use breakwater::{with_retry, with_timeout, CircuitBreakerRegistry, Error, RetryPolicy};
//!
//! async fn fetch_quote() -> breakwater::Result<String> {
//!     Ok("42.0".to_string())
//! }
//!
//! # async fn example() -> breakwater::Result<()> {
//! let registry = CircuitBreakerRegistry::new();
//!
//! // circuit outermost, retry in the middle, timeout innermost
//! let quote = registry
//!     .execute("pricing", || {
//!         with_retry(
//!             || with_timeout(fetch_quote(), Duration::from_millis(250), "fetch_quote"),
//!             RetryPolicy::default().max_attempts(3),
//!             "fetch_quote",
//!         )
//!     })
//!     .await?;
//!
//! match registry.execute("pricing", || fetch_quote()).await {
//!     Ok(_) => {}
//!     Err(Error::CircuitOpen { .. }) => {
//!         // fail fast while the dependency cools down
//!     }
//!     Err(other) => return Err(other),
//! }
//! # let _ = quote;
//! # Ok(())
//! # }
//! ```
//!
//! Tower services pick the same primitives up through the adapters in
//! [`layer`].

pub mod cancel;
pub mod circuit;
pub mod config;
pub mod error;
pub mod layer;
pub mod parallel;
pub mod retry;
pub mod timeout;

pub use cancel::{CancelReason, CancellationToken};
pub use circuit::{
    CircuitBreakerOptions, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use config::{
    from_env, from_file, CircuitBreakerConfig, ConfigBuilder, ParallelConfig, ResilienceConfig,
    RetryConfig, TimeoutConfig,
};
pub use error::{BoxError, ContextualError, Error, ErrorContext, Result, ResultExt};
pub use layer::{CircuitBreakerLayer, RetryLayer, TimeoutLayer};
pub use parallel::{
    parallel_all, parallel_settled, race_all, race_all_opts, ParallelOptions, SettledOutcome,
    SettledResult,
};
pub use retry::{with_retry, RetryPolicy};
pub use timeout::{with_timeout, with_timeout_opts, TimeoutOptions};
