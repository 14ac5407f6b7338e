//! Bounded retry with randomized exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{EmbeddingError, FailureClass};

/// Why a retried call ultimately failed.
#[derive(Error, Debug)]
pub enum RetryError {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: EmbeddingError },

    /// A non-retryable error stopped the loop early.
    #[error("aborted on attempt {attempt} ({class}): {source}")]
    Aborted {
        attempt: u32,
        class: FailureClass,
        source: EmbeddingError,
    },
}

impl RetryError {
    /// The error returned by the final attempt.
    pub fn last_error(&self) -> &EmbeddingError {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { source, .. } => source,
        }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    /// Take the error returned by the final attempt.
    pub fn into_last_error(self) -> EmbeddingError {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { source, .. } => source,
        }
    }

    /// Whether the failure was caused by bad or missing credentials.
    pub fn is_auth(&self) -> bool {
        self.last_error().is_auth()
    }
}

/// Retry policy wrapping a fallible remote call.
///
/// The delay before attempt `n + 1` is drawn uniformly from
/// `[min_delay, min(max_delay, min_delay * 2^(n - 1))]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Lower bound for every backoff delay.
    #[serde(rename = "min_delay_ms", with = "millis")]
    pub min_delay: Duration,

    /// Upper bound for every backoff delay.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set the backoff bounds.
    pub fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    /// Policy that never sleeps between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts).with_delays(Duration::ZERO, Duration::ZERO)
    }

    /// Upper bound of the random delay that follows `attempt` (1-based).
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min_delay
            .saturating_mul(factor)
            .clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }

    /// Draw the delay that follows `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let low = self.min_delay.as_millis() as u64;
        let high = self.delay_ceiling(attempt).as_millis() as u64;
        if high <= low {
            return Duration::from_millis(low);
        }
        Duration::from_millis(rand::rng().random_range(low..=high))
    }

    /// Run `op` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// `label` only feeds the log lines.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EmbeddingError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{label}: succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.classify();
            if !class.is_retryable() {
                warn!(
                    "{label}: attempt {attempt}/{max_attempts} failed ({class}), not retrying: {err}"
                );
                return Err(RetryError::Aborted {
                    attempt,
                    class,
                    source: err,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    "{label}: attempt {attempt}/{max_attempts} failed ({class}), giving up: {err}"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.backoff(attempt);
            debug!(
                "{label}: attempt {attempt}/{max_attempts} failed ({class}), retrying in {}ms: {err}",
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
