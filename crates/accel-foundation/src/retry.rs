//! Backoff policies for retrying failed activations.

use std::future::Future;
use std::time::Duration;

#[cfg(feature = "random-jitter")]
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Delay strategy between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay every attempt.
    Fixed { delay_ms: u64 },
    /// `base_ms * attempt`.
    Linear { base_ms: u64 },
    /// Doubling delay capped at `max_ms`.
    ///
    /// With `jitter`, the `random-jitter` feature spreads delays uniformly
    /// over 75–100% of the capped value; without it a deterministic ±12.5%
    /// alternation is used.
    ExponentialBackoff {
        base_ms: u64,
        max_ms: u64,
        jitter: bool,
    },
}

impl RetryPolicy {
    /// Sleep before the retry following failed attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Linear { base_ms } => base_ms.saturating_mul((attempt + 1) as u64),
            Self::ExponentialBackoff {
                base_ms,
                max_ms,
                jitter,
            } => {
                let capped = 1u64
                    .checked_shl(attempt as u32)
                    .and_then(|factor| base_ms.checked_mul(factor))
                    .unwrap_or(*max_ms)
                    .min(*max_ms);
                if *jitter {
                    jittered(capped, attempt).min(*max_ms)
                } else {
                    capped
                }
            }
        };
        Duration::from_millis(ms)
    }
}

#[cfg(feature = "random-jitter")]
fn jittered(capped: u64, _attempt: usize) -> u64 {
    let floor = capped.saturating_mul(3) / 4;
    rand::thread_rng().gen_range(floor..=capped)
}

#[cfg(not(feature = "random-jitter"))]
fn jittered(capped: u64, attempt: usize) -> u64 {
    let eighth = capped / 8;
    if attempt % 2 == 0 {
        capped.saturating_add(eighth)
    } else {
        capped.saturating_sub(eighth)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Fixed { delay_ms: 1_000 }
    }
}

/// Attempt count plus the [`RetryPolicy`] between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts; 1 means no retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default)]
    pub policy: RetryPolicy,
}

fn default_max_attempts() -> usize {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            policy: RetryPolicy::default(),
        }
    }
}

impl RetryConfig {
    /// Single attempt.
    pub fn none() -> Self {
        Self::default()
    }

    /// Jittered exponential backoff.
    pub fn exponential(max_attempts: usize, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            policy: RetryPolicy::ExponentialBackoff {
                base_ms,
                max_ms,
                jitter: true,
            },
        }
    }

    pub fn fixed(max_attempts: usize, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            policy: RetryPolicy::Fixed { delay_ms },
        }
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or
/// `config.max_attempts` is exhausted. The last error is returned.
pub async fn retry_with_policy<F, Fut, T, E>(
    config: &RetryConfig,
    is_retryable: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = config.policy.delay_for(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
