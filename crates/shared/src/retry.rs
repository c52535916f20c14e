use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::CommonError;

/// Bounded exponential backoff for idempotent outbound calls (IdP admin
/// operations, proxy reload signalling). Non-transient errors abort
/// immediately.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given retry attempt (1-based), with jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt - 1));
        let capped = exp.min(self.max_delay);
        // Jitter in [50%, 100%] of the capped delay avoids thundering herds
        // when several workers hit the same dead dependency.
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(jitter)
    }
}

pub async fn retry_with_backoff<T, F, Fut>(
    policy: BackoffPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, CommonError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CommonError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
