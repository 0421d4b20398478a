//! Exponential backoff for queue retries and snapshot fetches.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use sanctuary_common::Result;

/// Backoff parameters.
///
/// Queues retry forever and only use the delay fields; `max_retries`
/// bounds one-shot operations run through [`RetryExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt for one-shot operations.
    pub max_retries: u32,
    /// Delay before the first retry of a one-shot operation, and the base
    /// a queue backoff grows from.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per failure.
    pub backoff_multiplier: f64,
    /// Spread delays by +/- 25%.
    pub jitter: bool,
}

impl RetryConfig {
    /// Doubling backoff from 1s up to 60s, with jitter.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Progress queue: 1.2s doubling up to 15s.
    pub fn progress_queue() -> Self {
        Self::new(u32::MAX)
            .with_initial_delay(Duration::from_millis(1200))
            .with_max_delay(Duration::from_secs(15))
            .with_jitter(false)
    }

    /// Session queue: 1.5s doubling up to 20s.
    pub fn session_queue() -> Self {
        Self::new(u32::MAX)
            .with_initial_delay(Duration::from_millis(1500))
            .with_max_delay(Duration::from_secs(20))
            .with_jitter(false)
    }

    /// Snapshot fetches: 3 quick retries, then give up.
    pub fn fetch() -> Self {
        Self::new(3)
            .with_initial_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(2))
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-based) of a one-shot operation.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(self.jittered(capped) as u64)
    }

    fn jittered(&self, millis: f64) -> f64 {
        if !self.jitter {
            return millis;
        }
        millis * (0.75 + rand::random::<f64>() * 0.5)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Running backoff state for a retry loop that never gives up.
///
/// Each failure multiplies the delay (capped at `max_delay`); a success
/// resets it to `initial_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    /// Grow the delay after a failure and return how long to wait.
    pub fn on_failure(&mut self) -> Duration {
        let grown_ms = (self.current.as_millis() as f64
            * self.config.backoff_multiplier.max(1.0))
        .round();
        let max_ms = self.config.max_delay.as_millis() as f64;
        self.current = Duration::from_millis(grown_ms.min(max_ms) as u64);

        let millis = self.config.jittered(self.current.as_millis() as f64);
        Duration::from_millis(millis as u64).min(self.config.max_delay)
    }

    /// Back to the initial delay after a clean pass.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }

    /// Current un-jittered delay.
    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Runs a one-shot remote operation, retrying transient failures.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent. Only transient errors (see
    /// [`sanctuary_common::Error::is_transient`]) are retried.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("Succeeded after {} retries", retries);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() || retries >= self.config.max_retries {
                if retries > 0 {
                    warn!("Giving up after {} attempts: {}", retries + 1, err);
                }
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(retries);
            retries += 1;
            warn!("Attempt {} failed: {}. Retrying in {:?}", retries, err, delay);
            sleep(delay).await;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
