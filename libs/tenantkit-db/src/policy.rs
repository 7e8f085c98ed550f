//! Read-only view of the session marker from inside a unit of work.
//!
//! These mirror the database-side lookups the row policies use, so consumer
//! code can ask "who am I acting as" on the connection it was handed.
//!
//! ```ignore
//! manager
//!     .with_tenant(&ctx, |conn| Box::pin(async move {
//!         let tenant = policy::current_tenant::<Sqlite>(conn).await?;
//!         Ok::<_, IsolationError>(tenant)
//!     }))
//!     .await?;
//! ```

use tenantkit_security::{TenantId, UserId};

use crate::backend::IsolationBackend;
use crate::error::Result;

/// Tenant of the current marker, `None` when unset or acting as super admin.
///
/// # Errors
/// Returns `IsolationError::Sqlx` when the marker cannot be read.
pub async fn current_tenant<DB: IsolationBackend>(
    conn: &mut DB::Connection,
) -> Result<Option<TenantId>> {
    Ok(DB::read_marker(conn)
        .await?
        .and_then(|m| m.tenant().cloned()))
}

/// # Errors
/// Returns `IsolationError::Sqlx` when the marker cannot be read.
pub async fn current_user<DB: IsolationBackend>(
    conn: &mut DB::Connection,
) -> Result<Option<UserId>> {
    Ok(DB::read_marker(conn).await?.and_then(|m| m.user().cloned()))
}

/// # Errors
/// Returns `IsolationError::Sqlx` when the marker cannot be read.
pub async fn current_role<DB: IsolationBackend>(
    conn: &mut DB::Connection,
) -> Result<Option<String>> {
    Ok(DB::read_marker(conn)
        .await?
        .and_then(|m| m.role().map(str::to_owned)))
}

/// True only while a super-admin marker is set.
///
/// # Errors
/// Returns `IsolationError::Sqlx` when the marker cannot be read.
pub async fn is_super_admin<DB: IsolationBackend>(conn: &mut DB::Connection) -> Result<bool> {
    Ok(DB::read_marker(conn)
        .await?
        .is_some_and(|m| m.is_super_admin()))
}
