use larder_core::Error;
use rand::Rng;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff policy. The core never retries on its own; callers
/// wrap contended or transient operations in [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Adds up to 25% random delay so contending hosts drift apart.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Short policy for single object writes.
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let millis = scaled.min(self.max_backoff.as_millis() as f64) as u64;

        let jitter = if self.jitter && millis >= 4 {
            rand::thread_rng().gen_range(0..=millis / 4)
        } else {
            0
        };
        Duration::from_millis(millis + jitter)
    }
}

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::LockTimeout { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::WouldBlock
                    | ErrorKind::TimedOut
                    | ErrorKind::ResourceBusy
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
            ),
            Error::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                ["timed out", "timeout", "temporarily unavailable", "try again", "busy"]
                    .iter()
                    .any(|needle| msg.contains(needle))
            }
            _ => false,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error,
/// or `config.max_attempts` is used up.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        attempt += 1;
        if !error.is_retryable() {
            debug!(operation = operation_name, error = %error, "Not retryable");
            return Err(error);
        }
        if attempt >= attempts {
            warn!(
                operation = operation_name,
                attempts,
                error = %error,
                "Giving up after retries"
            );
            return Err(error);
        }

        let backoff = config.backoff_duration(attempt - 1);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts = attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Retrying after backoff"
        );
        sleep(backoff).await;
    }
}
