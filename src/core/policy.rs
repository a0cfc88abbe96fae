//! Uniform failure handling for sources, steps and sinks.
//!
//! Every unit of work runs through [`ErrorPolicy::execute`]. The policy
//! decides how many attempts a unit gets; the caller decides what a final
//! failure means for the run via [`ErrorPolicy::aborts_on_failure`].

use std::future::Future;

use tracing::warn;

use super::pipeline::{ErrorHandling, PipelineConfig, RetryBackoff};
use crate::error::PipelineError;

/// A unit that failed on every allowed attempt
#[derive(Debug)]
pub struct UnitFailure {
    pub error: PipelineError,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    mode: ErrorHandling,
    retry_attempts: u32,
    backoff: RetryBackoff,
}

impl ErrorPolicy {
    pub fn new(mode: ErrorHandling, retry_attempts: u32, backoff: RetryBackoff) -> Self {
        Self {
            mode,
            retry_attempts,
            backoff,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.error_handling,
            config.retry_attempts,
            config.retry_backoff.clone(),
        )
    }

    pub fn mode(&self) -> ErrorHandling {
        self.mode
    }

    /// Initial attempt plus retries
    pub fn max_attempts(&self) -> u32 {
        match self.mode {
            ErrorHandling::Retry => self.retry_attempts.saturating_add(1),
            ErrorHandling::Skip | ErrorHandling::Fail => 1,
        }
    }

    /// Whether a unit's final failure ends the run
    pub fn aborts_on_failure(&self) -> bool {
        self.mode == ErrorHandling::Fail
    }

    /// Run `op` until it succeeds or attempts are exhausted.
    ///
    /// Cancellation is returned immediately and never retried.
    pub async fn execute<T, F, Fut>(&self, unit: &str, mut op: F) -> Result<T, UnitFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(PipelineError::Cancelled) => {
                    return Err(UnitFailure {
                        error: PipelineError::Cancelled,
                        attempts: attempt,
                    })
                }
                Err(error) if attempt < max_attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        %unit,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Unit failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => {
                    return Err(UnitFailure {
                        error,
                        attempts: attempt,
                    })
                }
            }
        }
    }
}
