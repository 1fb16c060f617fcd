//! Bounded retry for remote calls, shared by inventory reads and plan
//! execution.

use crate::config::Config;
use crate::error::RemoteError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Upper bound on any single wait, including a server's Retry-After.
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.retry.max_retries,
            backoff_base: config.retry.backoff_base(),
            max_backoff: config.retry.max_backoff(),
            attempt_timeout: config.cloudflare.request_timeout(),
        }
    }

    /// `base * 2^(attempt-1)`, unless the server asked for a specific wait.
    /// Either way capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32, error: &RemoteError) -> Duration {
        let wait = match error {
            RemoteError::Transient {
                retry_after: Some(wait),
                ..
            } => *wait,
            _ => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.backoff_base.saturating_mul(factor)
            }
        };
        wait.min(self.max_backoff)
    }

    /// Runs `call` until it succeeds, fails permanently or runs out of
    /// retries. A fatal error cancels `token`.
    pub async fn run<T, F, Fut>(
        &self,
        label: &(dyn Display + Sync),
        token: &CancellationToken,
        mut call: F,
    ) -> Retried<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempts: u32 = 0;
        let mut last_error: Option<RemoteError> = None;

        loop {
            if token.is_cancelled() {
                return match last_error {
                    Some(error) => Retried::Failed { error, attempts },
                    None => Retried::Cancelled,
                };
            }
            attempts += 1;

            let error = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(Ok(value)) => return Retried::Succeeded { value, attempts },
                Ok(Err(error)) => error,
                Err(_) => {
                    RemoteError::transient(format!("timed out after {:?}", self.attempt_timeout))
                }
            };

            if error.is_fatal() {
                error!("✗ {}: {}. Cancelling run.", label, error);
                token.cancel();
                return Retried::Failed { error, attempts };
            }
            if !error.is_transient() || attempts > self.max_retries {
                error!("✗ {} failed after {} attempt(s): {}", label, attempts, error);
                return Retried::Failed { error, attempts };
            }

            let delay = self.backoff(attempts, &error);
            warn!(
                "{} failed: {}. Retry {}/{} in {:?}",
                label, error, attempts, self.max_retries, delay
            );
            last_error = Some(error);
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retried<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: RemoteError, attempts: u32 },
    /// The token was cancelled before the first attempt.
    Cancelled,
}

impl<T> Retried<T> {
    /// Collapses into a plain result; a cancelled call reports `cancelled`.
    pub fn into_result(self, cancelled: impl FnOnce() -> RemoteError) -> Result<T, RemoteError> {
        match self {
            Retried::Succeeded { value, .. } => Ok(value),
            Retried::Failed { error, .. } => Err(error),
            Retried::Cancelled => Err(cancelled()),
        }
    }
}
