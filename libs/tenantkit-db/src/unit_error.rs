//! Result type of a tenant-scoped unit of work.
//!
//! Callback errors travel through the manager untouched, separately from the
//! isolation core's own infrastructure failures.

use std::fmt;

use crate::error::IsolationError;

/// Error of a unit of work: either the callback's own error or an isolation failure.
///
/// # Example
///
/// ```ignore
/// let rows = manager
///     .with_tenant(&ctx, |conn| Box::pin(async move { repo.list(conn).await }))
///     .await
///     .map_err(|e| e.into_domain(DomainError::infra))?;
/// ```
#[derive(Debug)]
pub enum UnitError<E> {
    /// Error returned by the callback; its writes were rolled back.
    Domain(E),
    /// Failure of the isolation core itself.
    Isolation(IsolationError),
}

impl<E> UnitError<E> {
    /// Collapse into the caller's error type, mapping isolation failures with `map_isolation`.
    pub fn into_domain<F>(self, map_isolation: F) -> E
    where
        F: FnOnce(IsolationError) -> E,
    {
        match self {
            UnitError::Domain(e) => e,
            UnitError::Isolation(e) => map_isolation(e),
        }
    }

    #[must_use]
    pub fn domain(&self) -> Option<&E> {
        match self {
            UnitError::Domain(e) => Some(e),
            UnitError::Isolation(_) => None,
        }
    }

    #[must_use]
    pub fn isolation(&self) -> Option<&IsolationError> {
        match self {
            UnitError::Isolation(e) => Some(e),
            UnitError::Domain(_) => None,
        }
    }
}

impl<E> From<IsolationError> for UnitError<E> {
    fn from(e: IsolationError) -> Self {
        UnitError::Isolation(e)
    }
}

impl<E: fmt::Display> fmt::Display for UnitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitError::Domain(e) => write!(f, "{e}"),
            UnitError::Isolation(e) => write!(f, "isolation error: {e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for UnitError<E> {}
