use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Waits a fixed delay between attempts and gives up after `max_attempts` tries in total.
    RepeatConstant { sleep: Duration, max_attempts: u64 },
}

impl RetryPolicy {
    pub fn repeat_constant(sleep: Duration, max_attempts: u64) -> Self {
        RetryPolicy::RepeatConstant {
            sleep,
            max_attempts,
        }
    }

    /// Delay before the next attempt, or `None` once the attempts are used up.
    fn delay(&self, failed_attempts: u64) -> Option<Duration> {
        match self {
            RetryPolicy::RepeatConstant {
                sleep,
                max_attempts,
            } => (failed_attempts < *max_attempts).then_some(*sleep),
        }
    }
}

/// Runs the future produced by `get_future` until it succeeds or the policy gives up. The
/// error of the last attempt is returned.
pub async fn with_retry<F, Fut, R, Err>(mut get_future: F, policy: RetryPolicy) -> Result<R, Err>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, Err>>,
{
    let mut failed_attempts = 0u64;

    loop {
        match get_future().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                failed_attempts = failed_attempts.saturating_add(1);

                match policy.delay(failed_attempts) {
                    Some(delay) => sleep(delay).await,
                    None => return Err(err),
                }
            }
        }
    }
}
