//! Circuit breaker state machine, driven end to end through the registry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use breakwater::{
    CircuitBreakerOptions, CircuitBreakerRegistry, CircuitState, Error, Result,
};

async fn fail(registry: &CircuitBreakerRegistry, key: &str) -> Result<u32> {
    registry
        .execute(key, || async { Err(Error::operation("dependency down")) })
        .await
}

async fn succeed(registry: &CircuitBreakerRegistry, key: &str) -> Result<u32> {
    registry.execute(key, || async { Ok(1) }).await
}

fn state(registry: &CircuitBreakerRegistry, key: &str) -> CircuitState {
    registry.snapshot(key).expect("circuit registered").state
}

#[tokio::test(start_paused = true)]
async fn full_lifecycle_closed_open_half_open_closed() {
    let transitions: Arc<Mutex<Vec<(CircuitState, CircuitState)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let transitions_clone = transitions.clone();

    let registry = CircuitBreakerRegistry::new();
    registry.register(
        "payments",
        CircuitBreakerOptions::default()
            .failure_threshold(2)
            .reset_timeout(Duration::from_millis(100))
            .half_open_max(2)
            .on_state_change(move |_key, from, to| {
                transitions_clone.lock().expect("lock").push((from, to));
            }),
    );

    // two counted failures open the circuit
    let _ = fail(&registry, "payments").await;
    assert_eq!(state(&registry, "payments"), CircuitState::Closed);
    let _ = fail(&registry, "payments").await;
    assert_eq!(state(&registry, "payments"), CircuitState::Open);

    // cooling down: rejected without execution
    let rejected = succeed(&registry, "payments").await;
    assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));

    tokio::time::sleep(Duration::from_millis(120)).await;

    // first probe is admitted and succeeds, but one success is not enough
    assert_eq!(succeed(&registry, "payments").await.expect("probe"), 1);
    assert_eq!(state(&registry, "payments"), CircuitState::HalfOpen);

    // the second success closes the circuit
    assert_eq!(succeed(&registry, "payments").await.expect("probe"), 1);
    assert_eq!(state(&registry, "payments"), CircuitState::Closed);

    assert_eq!(
        *transitions.lock().expect("lock"),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn half_open_strike_restarts_the_cooldown() {
    let registry = CircuitBreakerRegistry::new();
    registry.register(
        "search",
        CircuitBreakerOptions::default()
            .failure_threshold(1)
            .reset_timeout(Duration::from_millis(100))
            .half_open_max(1),
    );

    let _ = fail(&registry, "search").await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    // probe fails: straight back to open with a fresh cooldown
    let _ = fail(&registry, "search").await;
    assert_eq!(state(&registry, "search"), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let still_cooling = succeed(&registry, "search").await;
    assert!(matches!(still_cooling, Err(Error::CircuitOpen { .. })));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(succeed(&registry, "search").await.expect("recovered"), 1);
    assert_eq!(state(&registry, "search"), CircuitState::Closed);
}

#[tokio::test]
async fn closed_successes_floor_the_failure_count_at_zero() {
    let registry = CircuitBreakerRegistry::new();
    registry.register(
        "ledger",
        CircuitBreakerOptions::default().failure_threshold(2),
    );

    for _ in 0..3 {
        let _ = succeed(&registry, "ledger").await;
    }
    assert_eq!(
        registry.snapshot("ledger").expect("registered").failure_count,
        0
    );

    // the earlier successes bank no extra credit: two failures still open
    let _ = fail(&registry, "ledger").await;
    let _ = fail(&registry, "ledger").await;
    assert_eq!(state(&registry, "ledger"), CircuitState::Open);
}

#[tokio::test]
async fn operator_reset_restores_traffic_immediately() {
    let registry = CircuitBreakerRegistry::new();
    registry.register(
        "mail",
        CircuitBreakerOptions::default()
            .failure_threshold(1)
            .reset_timeout(Duration::from_secs(3600)),
    );

    let _ = fail(&registry, "mail").await;
    assert!(matches!(
        succeed(&registry, "mail").await,
        Err(Error::CircuitOpen { .. })
    ));

    registry.reset("mail");
    assert_eq!(succeed(&registry, "mail").await.expect("reset"), 1);
}

#[tokio::test]
async fn snapshots_serialize_for_metrics_export() {
    let registry = CircuitBreakerRegistry::new();
    registry.register(
        "cache",
        CircuitBreakerOptions::default().failure_threshold(1),
    );
    let _ = fail(&registry, "cache").await;

    let snapshot = registry.snapshot("cache").expect("registered");
    let encoded = serde_json::to_value(&snapshot).expect("serializable");
    assert_eq!(encoded["key"], "cache");
    assert_eq!(encoded["state"], "Open");
    assert_eq!(encoded["failure_count"], 1);

    assert_eq!(registry.all_snapshots().len(), 1);
}
