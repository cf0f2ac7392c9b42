//! Configuration for the resilience core
//!
//! Provides serde-backed configuration for every primitive, with defaults,
//! a builder, and environment/TOML loading.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration aggregating all primitives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Retry loop configuration
    pub retry: RetryConfig,

    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,

    /// Timeout configuration
    pub timeout: TimeoutConfig,

    /// Parallel fan-out configuration
    pub parallel: ParallelConfig,

    /// Enable verbose logging
    pub debug_mode: bool,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, counting the first call
    pub max_attempts: usize,

    /// Base delay before the first retry
    pub base_delay: Duration,

    /// Cap applied to the computed backoff delay
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_factor: f64,

    /// Multiplicative jitter band: delay is drawn uniformly from
    /// `[delay * (1 - jitter_factor), delay * (1 + jitter_factor)]`
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Counted failures that open a closed circuit
    pub failure_threshold: u32,

    /// Cooldown before an open circuit admits probes again
    pub reset_timeout: Duration,

    /// Probe budget while half-open; also the consecutive successes
    /// required to close
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max: 1,
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline applied when the caller does not supply one
    pub default_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Parallel fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Concurrency bound applied when the caller does not supply one
    pub max_concurrency: usize,

    /// Abort the batch on the first failure
    pub fail_fast: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            fail_fast: true,
        }
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: ResilienceConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.retry.backoff_factor = factor;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.retry.jitter_factor = factor;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker.reset_timeout = timeout;
        self
    }

    pub fn half_open_max(mut self, max: u32) -> Self {
        self.config.circuit_breaker.half_open_max = max;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout.default_timeout = timeout;
        self
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.config.parallel.max_concurrency = limit;
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.config.parallel.fail_fast = enabled;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> ResilienceConfig {
        self.config
    }
}

/// Load configuration from environment variables
pub fn from_env() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();

    if let Ok(attempts) = std::env::var("BREAKWATER_MAX_ATTEMPTS") {
        if let Ok(n) = attempts.parse::<usize>() {
            config.retry.max_attempts = n;
        }
    }

    if let Ok(delay) = std::env::var("BREAKWATER_BASE_DELAY_MS") {
        if let Ok(ms) = delay.parse::<u64>() {
            config.retry.base_delay = Duration::from_millis(ms);
        }
    }

    if let Ok(threshold) = std::env::var("BREAKWATER_FAILURE_THRESHOLD") {
        if let Ok(n) = threshold.parse::<u32>() {
            config.circuit_breaker.failure_threshold = n;
        }
    }

    if let Ok(timeout) = std::env::var("BREAKWATER_RESET_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.circuit_breaker.reset_timeout = Duration::from_millis(ms);
        }
    }

    if let Ok(timeout) = std::env::var("BREAKWATER_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.timeout.default_timeout = Duration::from_millis(ms);
        }
    }

    if let Ok(limit) = std::env::var("BREAKWATER_MAX_CONCURRENCY") {
        if let Ok(n) = limit.parse::<usize>() {
            config.parallel.max_concurrency = n;
        }
    }

    if let Ok(debug) = std::env::var("BREAKWATER_DEBUG") {
        config.debug_mode = debug.to_lowercase() == "true" || debug == "1";
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(
    path: impl AsRef<std::path::Path>,
) -> std::result::Result<ResilienceConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ResilienceConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ResilienceConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
        assert_eq!(config.retry.backoff_factor, 2.0);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.half_open_max, 1);
        assert!(config.parallel.fail_fast);
        assert!(!config.debug_mode);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .max_attempts(5)
            .base_delay(Duration::from_millis(250))
            .failure_threshold(2)
            .half_open_max(3)
            .max_concurrency(4)
            .fail_fast(false)
            .debug(true)
            .build();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.half_open_max, 3);
        assert_eq!(config.parallel.max_concurrency, 4);
        assert!(!config.parallel.fail_fast);
        assert!(config.debug_mode);
    }

    #[test]
    fn test_config_round_trips_through_serde() {
        let config = ConfigBuilder::new()
            .reset_timeout(Duration::from_secs(5))
            .build();
        let encoded = serde_json::to_string(&config).expect("serialize");
        let decoded: ResilienceConfig = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(
            decoded.circuit_breaker.reset_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(decoded.retry.max_attempts, config.retry.max_attempts);
    }
}
