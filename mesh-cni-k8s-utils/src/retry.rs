use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Bounded exponential backoff.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Total number of attempts, including the first one.
    pub steps: u32,
    /// Delay before the second attempt.
    pub duration: Duration,
    /// Multiplier applied to the delay after every retry.
    pub factor: f64,
    /// Each delay is stretched by a random fraction in `0..=jitter`.
    pub jitter: f64,
    /// Upper bound for a single delay.
    pub cap: Duration,
}

impl Default for Backoff {
    /// Backoff for optimistic-concurrency conflicts on updates.
    fn default() -> Self {
        Self {
            steps: 4,
            duration: Duration::from_millis(10),
            factor: 5.0,
            jitter: 0.1,
            cap: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let stretch = rand::rng().random_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + stretch)
    }

    fn next(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor.max(1.0)).min(self.cap)
    }
}

/// Runs `operation` until it succeeds, fails with an error `retryable`
/// rejects, or `backoff.steps` attempts have been made. The last error is
/// returned when the attempts run out.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    backoff: &Backoff,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let steps = backoff.steps.max(1);
    let mut delay = backoff.duration;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !retryable(&err) {
            debug!(attempt, error = %err, "operation failed with non-retryable error");
            return Err(err);
        }
        if attempt >= steps {
            warn!(attempt, error = %err, "operation failed after max retries");
            return Err(err);
        }
        let sleep = backoff.jittered(delay);
        debug!(
            attempt,
            error = %err,
            delay_ms = sleep.as_millis() as u64,
            "operation failed, retrying"
        );
        tokio::time::sleep(sleep).await;
        delay = backoff.next(delay);
    }
}
