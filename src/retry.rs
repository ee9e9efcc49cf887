//! Retry classification and exponential backoff
//!
//! A [`DownloadTask`](crate::download::DownloadTask) consults [`IsRetryable`] to decide
//! whether its default error hook grants another attempt, and sleeps for
//! [`Backoff::next_delay`] between attempts, with optional jitter.

use crate::config::RetryConfig;
use crate::error::{DownloadError, Error};
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (connection reset, timeout, server busy) should return `true`.
/// Permanent failures (not found, not authorized, corrupt data) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Failed { .. } => true,
            // Only a delegate repair (new credentials, another mirror) can help these
            DownloadError::NotFound { .. } | DownloadError::NotAuthorized { .. } => false,
            DownloadError::Unsupported { .. } => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Download(e) => e.is_retryable(),
            // I/O errors can be retryable in some cases
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Corrupt data stays corrupt
            Error::Validation(_) => false,
            Error::Database(_) | Error::Sqlx(_) => false,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
            Error::ShuttingDown => false,
            Error::Other(_) => false,
        }
    }
}

/// Exponential backoff state for one retry sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Start a new sequence at `config.initial_delay`
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let current = if self.jitter {
            add_jitter(self.delay)
        } else {
            self.delay
        };

        let next = Duration::from_secs_f64(self.delay.as_secs_f64() * self.multiplier);
        self.delay = next.min(self.max_delay);

        current
    }

    /// Sleep for the next delay (no-op for a zero delay)
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    fn config(initial_ms: u64, max_ms: u64, multiplier: f64, jitter: bool) -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_multiplier: multiplier,
            jitter,
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let mut backoff = Backoff::new(&config(10, 1000, 2.0, false));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let mut backoff = Backoff::new(&config(100, 250, 2.0, false));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn immediate_config_never_waits() {
        let mut backoff = Backoff::new(&RetryConfig::immediate(3));
        for _ in 0..3 {
            assert_eq!(backoff.next_delay(), Duration::ZERO);
        }
    }

    #[test]
    fn test_jitter_range() {
        let delay = Duration::from_millis(100);

        for _ in 0..100 {
            let jittered = add_jitter(delay);
            assert!(
                jittered >= delay && jittered <= delay * 2,
                "jittered delay {:?} should be between {:?} and {:?}",
                jittered,
                delay,
                delay * 2
            );
        }
    }

    #[test]
    fn transport_failures_are_retryable() {
        let err = Error::Download(DownloadError::failed("http://x", "connection reset"));
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_and_not_authorized_are_not_retryable() {
        let not_found = Error::Download(DownloadError::NotFound {
            url: "http://x".into(),
        });
        let denied = Error::Download(DownloadError::NotAuthorized {
            url: "http://x".into(),
        });
        assert!(!not_found.is_retryable());
        assert!(!denied.is_retryable());
    }

    #[test]
    fn unusable_urls_are_not_retryable() {
        let err = Error::Download(DownloadError::unsupported("gopher://x", "unsupported scheme"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_failures_are_never_retryable() {
        let err = Error::Validation(ValidationError::SizeMismatch {
            expected: 1,
            actual: 2,
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_io_errors_are_retryable() {
        let reset = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        let denied = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(reset.is_retryable());
        assert!(!denied.is_retryable());
    }

    #[tokio::test]
    async fn wait_sleeps_for_the_delay() {
        let mut backoff = Backoff::new(&config(20, 1000, 2.0, false));
        let start = std::time::Instant::now();
        backoff.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
