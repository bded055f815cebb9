//! Capped exponential backoff for filesystem calls that fail transiently.
//!
//! Desktop environments hold short-lived locks on files the vault needs to
//! delete (indexers, virus scanners, the mail client flushing an attachment).
//! Deletions during a restore therefore go through [`with_backoff`] instead
//! of failing on the first `EBUSY`.

use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Result, VaultError};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(retry: &RetryConfig) -> Self {
        BackoffPolicy {
            max_attempts: retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(retry.initial_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
        }
    }

    /// Delay before the retry following `attempt` (1-based): doubles each
    /// attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = (self.initial_delay.as_millis() as u64).saturating_mul(1u64 << shift);
        Duration::from_millis(ms).min(self.max_delay)
    }
}

/// Run `attempt_fn` until it succeeds or the attempt budget is spent.
///
/// The terminal error carries the operation name and attempt count so the
/// failure report can say what was stuck, not just that something was.
pub fn with_backoff<T, F>(operation: &str, policy: &BackoffPolicy, mut attempt_fn: F) -> Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut attempt = 1u32;
    loop {
        match attempt_fn() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Recovered after retry");
                }
                return Ok(value);
            }
            Err(source) if attempt >= policy.max_attempts => {
                return Err(VaultError::TransientIo {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source,
                });
            }
            Err(error) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, backing off"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Delete a file with backoff. A file that is already gone counts as done.
pub fn remove_file_retrying(path: &Path, policy: &BackoffPolicy) -> Result<()> {
    with_backoff(
        &format!("remove file {}", path.display()),
        policy,
        || match std::fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    )
}

/// Delete a directory tree with backoff. An absent tree counts as done.
pub fn remove_dir_all_retrying(path: &Path, policy: &BackoffPolicy) -> Result<()> {
    with_backoff(
        &format!("remove directory {}", path.display()),
        policy,
        || match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    )
}
