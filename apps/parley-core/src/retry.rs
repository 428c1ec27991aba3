use crate::error::UpstreamError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff, applied only to transient upstream failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { attempts: 3, initial_delay: Duration::from_secs(1), factor: 2 } }
}

impl RetryPolicy {
    pub fn from_config(cfg: &crate::config::MemoryConfig) -> Self {
        Self {
            attempts: cfg.retry_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.retry_initial_ms),
            factor: cfg.retry_factor.max(1),
        }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(what, attempt, error = %e, ?delay, "transient upstream failure; retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(self.factor);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
