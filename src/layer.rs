//! Tower middleware adapters
//!
//! Thin `tower::Layer` wrappers so any `Service` speaking `BoxError` picks
//! up the crate's primitives without bespoke glue: a timeout around each
//! call, a retry loop driving the inner service, and a named circuit
//! guarding admission.
//!
//! Composition follows the usual nesting: circuit outermost, then retry,
//! then timeout innermost, e.g.
//! `ServiceBuilder::new().layer(breaker).layer(retry).layer(timeout).service(inner)`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tower::{BoxError, Layer, Service, ServiceExt};

use crate::circuit::CircuitBreakerRegistry;
use crate::error::Error;
use crate::retry::{with_retry, RetryPolicy};
use crate::timeout::with_timeout;

// ===== Timeout =====

/// Applies a deadline to every call of the wrapped service.
pub struct TimeoutLayer {
    timeout: Duration,
    label: String,
}

impl TimeoutLayer {
    pub fn new(timeout: Duration, label: impl Into<String>) -> Self {
        Self {
            timeout,
            label: label.into(),
        }
    }
}

pub struct Timeout<S> {
    inner: S,
    timeout: Duration,
    label: String,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            timeout: self.timeout,
            label: self.label.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Timeout<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        let timeout = self.timeout;
        let label = self.label.clone();
        Box::pin(async move {
            with_timeout(
                async move { fut.await.map_err(Error::from) },
                timeout,
                label,
            )
            .await
            .map_err(BoxError::from)
        })
    }
}

// ===== Retry =====

/// Drives the wrapped service through the crate's retry loop.
///
/// Requests must be `Clone` so each attempt gets its own copy; the inner
/// service sits behind a lock so attempts run one at a time.
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

pub struct Retry<S> {
    inner: Arc<Mutex<S>>,
    policy: RetryPolicy,
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner: Arc::new(Mutex::new(inner)),
            policy: self.policy.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Retry<S>
where
    Req: Clone + Send + Sync + 'static,
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let policy = self.policy.clone();
        Box::pin(async move {
            with_retry(
                || {
                    let inner = inner.clone();
                    let req = req.clone();
                    async move {
                        let mut guard = inner.lock().await;
                        let ready = ServiceExt::ready(&mut *guard)
                            .await
                            .map_err(Error::from)?;
                        ready.call(req).await.map_err(Error::from)
                    }
                },
                policy,
                "retry_layer",
            )
            .await
            .map_err(BoxError::from)
        })
    }
}

// ===== Circuit breaker =====

/// Guards the wrapped service behind a named circuit in a shared registry.
pub struct CircuitBreakerLayer {
    registry: Arc<CircuitBreakerRegistry>,
    key: String,
}

impl CircuitBreakerLayer {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, key: impl Into<String>) -> Self {
        Self {
            registry,
            key: key.into(),
        }
    }
}

pub struct CircuitBreaker<S> {
    inner: S,
    registry: Arc<CircuitBreakerRegistry>,
    key: String,
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreaker<S>;
    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreaker {
            inner,
            registry: self.registry.clone(),
            key: self.key.clone(),
        }
    }
}

impl<S, Req> Service<Req> for CircuitBreaker<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        let registry = self.registry.clone();
        let key = self.key.clone();
        Box::pin(async move {
            registry
                .execute(&key, move || async move { fut.await.map_err(Error::from) })
                .await
                .map_err(BoxError::from)
        })
    }
}
