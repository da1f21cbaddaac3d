//! Exponential backoff for write-path backend operations that must not be
//! silently skipped (drains, deletions, timestamp bumps).

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::domain::entities::EntityKey;

use super::config::CacheConfig;
use super::error::{BackendError, CacheError};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    attempts: Option<NonZeroU32>,
}

impl RetryPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            initial: config.drain_retry_initial(),
            max: config.drain_retry_max(),
            attempts: config.drain_attempt_limit(),
        }
    }

    /// Runs `op` until it succeeds or the attempt budget is spent.
    pub async fn run<T, F, Fut>(
        &self,
        name: &'static str,
        entity: &EntityKey,
        mut op: F,
    ) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut delay = self.initial;
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match op().await {
                Ok(value) => return Ok(value),
                Err(source) => {
                    if self.attempts.is_some_and(|limit| attempt >= limit.get()) {
                        return Err(CacheError::RetriesExhausted {
                            op: name,
                            entity: entity.clone(),
                            attempts: attempt,
                            source,
                        });
                    }
                    warn!(
                        op = name,
                        entity = %entity,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %source,
                        "Backend operation failed; retrying"
                    );
                    sleep(delay).await;
                    delay = delay.saturating_mul(2).min(self.max);
                }
            }
        }
    }
}
