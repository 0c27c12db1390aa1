//! Tests for retry utilities

use mesh_node::utils::retry::{retry_with_backoff, RetryConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_retry_config_default() {
    let config = RetryConfig::default();
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.initial_delay, Duration::from_millis(100));
    assert_eq!(config.max_delay, Duration::from_secs(30));
    assert_eq!(config.backoff_multiplier, 2.0);
}

#[test]
fn test_retry_config_new() {
    let config = RetryConfig::new(5, Duration::from_millis(200));
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.initial_delay, Duration::from_millis(200));
    assert_eq!(config.max_delay, Duration::from_secs(30));
    assert_eq!(config.backoff_multiplier, 2.0);
}

#[test]
fn test_retry_config_network() {
    let config = RetryConfig::network();
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.initial_delay, Duration::from_millis(500));
    assert_eq!(config.max_delay, Duration::from_secs(60));
}

#[test]
fn test_retry_config_storage() {
    let config = RetryConfig::storage();
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.initial_delay, Duration::from_millis(100));
    assert_eq!(config.max_delay, Duration::from_secs(10));
    assert_eq!(config.backoff_multiplier, 1.5);
}

#[tokio::test]
async fn test_retry_success_first_attempt() {
    let config = RetryConfig::new(3, Duration::from_millis(10));
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result: Result<u32, String> = retry_with_backoff(&config, || {
        let counter = counter.clone();
        async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
    })
    .await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_success_after_failures() {
    let config = RetryConfig::new(4, Duration::from_millis(5));
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result: Result<u32, String> = retry_with_backoff(&config, || {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("transient failure {}", n))
            } else {
                Ok(n)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_exhaustion_returns_last_error() {
    let config = RetryConfig::new(2, Duration::from_millis(5));
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result: Result<(), String> = retry_with_backoff(&config, || {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("failure {}", n))
        }
    })
    .await;

    assert_eq!(result.unwrap_err(), "failure 2");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_backoff_delay_is_capped() {
    // Tiny cap so the three retries stay fast even with a huge multiplier.
    let config = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 100.0,
    };

    let started = std::time::Instant::now();
    let result: Result<(), String> =
        retry_with_backoff(&config, || async { Err("always".to_string()) }).await;
    assert!(result.is_err());
    // 1ms + 5ms of sleeping, not 1ms + 100ms.
    assert!(started.elapsed() < Duration::from_millis(100));
}
