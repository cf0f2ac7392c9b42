//! Cooperative cancellation tokens
//!
//! A [`CancellationToken`] lets any composition point in this crate unwind
//! early once a caller gives up on an operation. Cancellation is cooperative:
//! it never aborts work that is already running, it only makes waiting points
//! (timeout races, retry backoff sleeps, parallel fan-outs) settle early and
//! discard the loser's eventual result.
//!
//! Tokens form a tree. Cancelling a parent cancels every derived child with
//! the same reason; cancelling a child never touches the parent. A
//! [`CancellationToken::with_timeout`] child owns a single timer task and
//! self-cancels with [`CancelReason::Timeout`] when the deadline elapses.
//!
//! Every token is disposed when the operation that owns it settles, on every
//! exit path. Disposal aborts the pending timer and drops listeners; calling
//! any method on a disposed token is a no-op, never an error.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Error;

/// Why a token was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A timeout child's deadline elapsed
    Timeout,
    /// Explicit cancellation, optionally with a caller-supplied reason
    Manual(Option<String>),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => f.write_str("timeout"),
            CancelReason::Manual(Some(reason)) => f.write_str(reason),
            CancelReason::Manual(None) => f.write_str("cancelled"),
        }
    }
}

impl From<CancelReason> for Error {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Timeout => Error::Cancelled {
                reason: Some("timeout".to_string()),
            },
            CancelReason::Manual(reason) => Error::Cancelled { reason },
        }
    }
}

type Listener = Box<dyn FnOnce(&CancelReason) + Send>;

struct State {
    cancelled: Option<CancelReason>,
    disposed: bool,
    listeners: Vec<Listener>,
    children: Vec<Weak<Shared>>,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    // fires once on cancellation; subscribers see the latest value, so
    // `cancelled()` cannot miss a cancel that raced its registration
    fired: watch::Sender<bool>,
}

/// Cooperative cancellation primitive.
///
/// Cloning shares the same underlying token.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("CancellationToken")
            .field("cancelled", &state.cancelled)
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl CancellationToken {
    /// Create a root token.
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    cancelled: None,
                    disposed: false,
                    listeners: Vec::new(),
                    children: Vec::new(),
                    timer: None,
                }),
                fired,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        // listeners never run under the lock, so a poisoned guard still
        // holds consistent state
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancel the token with no reason. Idempotent.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Manual(None));
    }

    /// Cancel the token with a caller-supplied reason. Idempotent.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        self.cancel_with(CancelReason::Manual(Some(reason.into())));
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) {
        let (listeners, children) = {
            let mut state = self.lock_state();
            if state.disposed || state.cancelled.is_some() {
                return;
            }
            state.cancelled = Some(reason.clone());
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.children),
            )
        };
        // send_replace stores the value even with no live subscribers, so a
        // later cancelled() call still observes the cancellation
        self.shared.fired.send_replace(true);
        // listeners run exactly once, outside the lock; a listener that
        // re-enters cancel() sees the flag already set and returns
        for listener in listeners {
            listener(&reason);
        }
        for child in children {
            if let Some(shared) = child.upgrade() {
                CancellationToken { shared }.cancel_with(reason.clone());
            }
        }
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.lock_state().cancelled.is_some()
    }

    /// The cancellation reason, if cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.lock_state().cancelled.clone()
    }

    /// Register a listener invoked once on cancellation.
    ///
    /// If the token is already cancelled the listener fires synchronously.
    /// On a disposed token this is a no-op.
    pub fn on_cancel(&self, listener: impl FnOnce(&CancelReason) + Send + 'static) {
        let mut state = self.lock_state();
        if state.disposed {
            return;
        }
        if let Some(reason) = state.cancelled.clone() {
            drop(state);
            listener(&reason);
        } else {
            state.listeners.push(Box::new(listener));
        }
    }

    /// Derive a child token. Cancelling `self` cancels the child with the
    /// same reason; cancelling the child leaves `self` untouched.
    pub fn child(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let mut state = self.lock_state();
        if state.disposed {
            return child;
        }
        if let Some(reason) = state.cancelled.clone() {
            drop(state);
            child.cancel_with(reason);
        } else {
            state.children.push(Arc::downgrade(&child.shared));
        }
        child
    }

    /// Derive a child token that self-cancels with [`CancelReason::Timeout`]
    /// after `timeout`, backed by a single timer task the child owns.
    /// Disposing the child aborts the timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_timeout(&self, timeout: Duration) -> CancellationToken {
        let child = self.child();
        child.attach_timer(timeout);
        child
    }

    /// Arm this token's timer: self-cancel with [`CancelReason::Timeout`]
    /// once `timeout` elapses. Replaces a previously armed timer.
    pub(crate) fn attach_timer(&self, timeout: Duration) {
        if self.is_cancelled() {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                CancellationToken { shared }.cancel_with(CancelReason::Timeout);
            }
        });
        let mut state = self.lock_state();
        if state.disposed {
            drop(state);
            handle.abort();
            return;
        }
        if let Some(previous) = state.timer.replace(handle) {
            previous.abort();
        }
    }

    /// Resolve once the token is cancelled, yielding the reason.
    ///
    /// On a disposed (and never-cancelled) token the future never resolves,
    /// matching the everything-is-a-no-op contract after disposal.
    pub async fn cancelled(&self) -> CancelReason {
        if let Some(reason) = self.reason() {
            return reason;
        }
        let mut rx = self.shared.fired.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
        self.reason().unwrap_or(CancelReason::Manual(None))
    }

    /// Release the token's resources: abort the pending timer, drop
    /// listeners, forget children. Idempotent; all methods become no-ops.
    pub fn dispose(&self) {
        let timer = {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.listeners.clear();
            state.children.clear();
            state.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

/// Disposes the wrapped token when dropped, covering every exit path of the
/// operation that owns it.
pub(crate) struct DisposeGuard {
    token: CancellationToken,
}

impl DisposeGuard {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        self.token.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        token.on_cancel(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel_with_reason("first");
        token.cancel_with_reason("second");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            token.reason(),
            Some(CancelReason::Manual(Some("first".to_string())))
        );
    }

    #[test]
    fn test_listener_on_already_cancelled_token_fires_synchronously() {
        let token = CancellationToken::new();
        token.cancel();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        token.on_cancel(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_cancel_from_listener_fires_once() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let reentrant = token.clone();
        token.on_cancel(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            reentrant.cancel();
        });
        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parent_cancels_child_not_vice_versa() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel();
        assert!(!parent.is_cancelled());

        let second = parent.child();
        parent.cancel_with_reason("shutdown");
        assert!(second.is_cancelled());
        assert_eq!(
            second.reason(),
            Some(CancelReason::Manual(Some("shutdown".to_string())))
        );
    }

    #[test]
    fn test_child_of_cancelled_parent_is_born_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel_with_reason("gone");
        let child = parent.child();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_disposed_token_ignores_everything() {
        let token = CancellationToken::new();
        token.dispose();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        token.on_cancel(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        assert!(!token.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_child_self_cancels() {
        let parent = CancellationToken::new();
        let child = parent.with_timeout(Duration::from_millis(50));

        let reason = child.cancelled().await;
        assert_eq!(reason, CancelReason::Timeout);
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_aborts_pending_timer() {
        let token = CancellationToken::new().with_timeout(Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        token.on_cancel(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        token.dispose();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!token.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_on_cancel() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel_with_reason("done waiting");
        let reason = handle.await.expect("join");
        assert_eq!(reason, CancelReason::Manual(Some("done waiting".to_string())));
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(CancelReason::Timeout.to_string(), "timeout");
        assert_eq!(
            CancelReason::Manual(Some("shutdown".into())).to_string(),
            "shutdown"
        );
        assert_eq!(CancelReason::Manual(None).to_string(), "cancelled");
    }
}
