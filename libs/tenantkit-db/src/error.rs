use std::time::Duration;

use tenantkit_security::ScopeError;

use crate::tables::TableError;

/// Library-local result type.
pub type Result<T> = std::result::Result<T, IsolationError>;

/// Infrastructure failures of the isolation core.
///
/// None of these variants is ever turned into an "allow" outcome: a unit of
/// work that hits one of them does not run its callback, or its writes are
/// rolled back.
#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Tables(#[from] TableError),

    #[error("failed to acquire a pooled connection: {0}")]
    Acquire(#[source] sqlx::Error),

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    /// The setter could not establish the session marker; the callback did not run.
    #[error("session marker could not be established, unit of work aborted: {0}")]
    SetterFailed(#[source] sqlx::Error),

    /// The clearer could not erase the session marker; the connection was discarded.
    #[error("session marker could not be cleared, connection discarded: {0}")]
    ClearerFailed(#[source] sqlx::Error),

    /// The callback rewrote the session marker; its writes were rolled back
    /// and its result withheld.
    #[error("session marker changed inside the unit of work (now {found}), result withheld")]
    MarkerTampered { found: String },

    #[error("failed to commit unit of work: {0}")]
    Commit(#[source] sqlx::Error),

    #[error("unit of work timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Database reachable but isolation is not enforced (missing functions or policies).
    #[error("isolation policy not enforced: {0}")]
    PolicyMisconfigured(String),

    /// Database answered the startup health check with an unhealthy status.
    #[error("database unhealthy: {0}")]
    Unhealthy(String),

    #[error("database unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] Box<figment::Error>),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl From<figment::Error> for IsolationError {
    fn from(e: figment::Error) -> Self {
        IsolationError::Config(Box::new(e))
    }
}

impl IsolationError {
    /// True when the failure happened before the callback could run.
    #[must_use]
    pub fn is_pre_callback(&self) -> bool {
        matches!(
            self,
            IsolationError::Scope(_)
                | IsolationError::Acquire(_)
                | IsolationError::Begin(_)
                | IsolationError::SetterFailed(_)
        )
    }
}
