//! Fixed-backoff retry

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// How often and how long to retry a failing operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between attempts
    pub backoff: Duration,

    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    /// `op` receives the 1-based attempt number.
    pub async fn run<F, Fut, T, E>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("Retry: {} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        warn!("Retry: {} giving up after {} attempts: {}", label, attempt, e);
                        return Err(e);
                    }
                    warn!(
                        "Retry: {} failed (attempt {}), retrying in {:?}: {}",
                        label, attempt, self.backoff, e
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
