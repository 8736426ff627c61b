use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use tracing::warn;

use crate::types::MailerError;

/// Failure classification used by [`RetryPolicy`]. Transient failures get
/// another attempt, terminal ones end the operation immediately.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for MailerError {
    fn is_transient(&self) -> bool {
        MailerError::is_transient(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("{0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(e) => e,
        }
    }
}

/// Bounded-attempt exponential backoff. `max_retries` counts the attempts
/// after the first one, so the operation runs at most `max_retries + 1`
/// times. Delays double from `initial_delay` up to `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(160),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: initial_delay * 32,
        }
    }

    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> std::result::Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            max_interval: self.max_delay,
            multiplier: 2.0,
            // Retries are capped by attempt count, not wall-clock time.
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(RetryError::Fatal(e)),
                Err(e) => {
                    if attempts > self.max_retries {
                        return Err(RetryError::Exhausted { attempts, last: e });
                    }
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                "Attempt {} of {} failed: {}; retrying in {:?}",
                                attempts, what, e, delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(RetryError::Exhausted { attempts, last: e }),
                    }
                }
            }
        }
    }
}
