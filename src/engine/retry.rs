use std::future::Future;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::errors::StageError;

/// Per-stage timeout plus bounded exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub stage_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout,
            max_retries: config.stage_retries,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Run one stage call under the policy.
///
/// Each attempt gets its own timeout; an elapsed timeout counts as a
/// transient failure. `on_retry` sees the attempt number, the error and the
/// delay before the next attempt.
pub async fn call_stage<T, F, Fut, R>(
    policy: &RetryPolicy,
    stage: &'static str,
    mut op: F,
    mut on_retry: R,
) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
    R: FnMut(u32, &StageError, Duration),
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.stage_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(policy.stage_timeout)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                tracing::warn!(stage, attempt = attempt + 1, ?delay, error = %err, "Retrying stage call");
                on_retry(attempt + 1, &err, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
