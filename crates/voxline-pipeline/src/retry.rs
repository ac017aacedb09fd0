//! Bounded exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use voxline_core::config::RetryConfig;
use voxline_providers::ProviderError;

use crate::error::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            factor: cfg.factor.max(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, base*factor, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(exp))
    }

    /// Run `op`, retrying transient failures. Exhaustion escalates to fatal.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(ProviderError::Fatal(msg)) => return Err(StageError::FatalStage(msg)),
                Err(ProviderError::Transient(msg)) if attempt >= self.max_attempts => {
                    return Err(StageError::FatalStage(format!(
                        "{what} failed after {attempt} attempts: {msg}"
                    )));
                }
                Err(ProviderError::Transient(msg)) => {
                    let delay = self.delay_for(attempt);
                    warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %msg, "Transient provider error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
