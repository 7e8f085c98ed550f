//! Startup connectivity retry.
//!
//! Only transport-level failures are retried: I/O errors, TLS and protocol
//! errors, and pool acquire timeouts. Everything else (bad credentials, a
//! missing database file, SQL errors) is returned on the first attempt.
//! Whatever the cause, a final failure is reported as
//! [`IsolationError::Unreachable`] carrying the number of attempts made.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::Instrument;

use crate::error::IsolationError;

fn duration_to_i64_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Backoff policy for reaching the database at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[must_use]
pub struct RetryCfg {
    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// Backoff before retry `n` is `base_backoff * n`, capped at `max_backoff`.
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryCfg {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_base_backoff(mut self, duration: Duration) -> Self {
        self.base_backoff = duration;
        self
    }

    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Backoff before the given retry attempt (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        (self.base_backoff * attempt).min(self.max_backoff)
    }
}

/// True for failures that may go away on their own.
#[must_use]
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
    )
}

/// Run `call` until it succeeds, retrying transient failures with linear backoff.
///
/// # Errors
/// Returns [`IsolationError::Unreachable`] when the call fails with a
/// non-transient error or keeps failing after `cfg.max_retries` retries.
pub async fn with_retry<T, F, Fut>(
    op_name: &'static str,
    cfg: &RetryCfg,
    mut call: F,
) -> Result<T, IsolationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let span = tracing::debug_span!("db_connect", op = op_name, attempt);
        let result = call().instrument(span).await;

        match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(op = op_name, attempt, "database reachable after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                let transient = is_transient(&err);
                if !transient || attempt > cfg.max_retries {
                    tracing::error!(
                        op = op_name,
                        attempt,
                        transient,
                        error = %err,
                        "giving up on database"
                    );
                    return Err(IsolationError::Unreachable {
                        attempts: attempt,
                        source: err,
                    });
                }

                let backoff = cfg.backoff_for(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    backoff_ms = duration_to_i64_ms(backoff),
                    error = %err,
                    "database not reachable yet, retrying"
                );
                sleep(backoff).await;
            }
        }
    }
}
