//! Retry with exponential backoff
//!
//! Used where a transient failure is worth absorbing instead of surfacing,
//! e.g. delivering the initial advertisement to bootstrap peers that may
//! still be starting up.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry behavior configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Self::default()
        }
    }

    /// Profile for network operations: more attempts, longer delays.
    pub fn network() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    /// Profile for local storage operations: fewer attempts, gentler backoff.
    pub fn storage() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
        }
    }
}

/// Run `op` until it succeeds or the attempt budget is spent.
///
/// Returns the first success, or the last error once `max_attempts` have
/// failed.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= config.max_attempts => return Err(e),
            Err(e) => {
                debug!("attempt {}/{} failed: {}", attempt, config.max_attempts, e);
                tokio::time::sleep(delay).await;
                let next = delay.as_secs_f64() * config.backoff_multiplier;
                delay = Duration::from_secs_f64(next).min(config.max_delay);
            }
        }
    }
}
