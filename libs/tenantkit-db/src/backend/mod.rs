//! Storage engines that can enforce tenant row policies.
//!
//! A backend knows how to write, erase and read back the session marker on one
//! physical connection, and how to install and audit the row policies that
//! consult it. Everything engine-specific lives behind [`IsolationBackend`];
//! the manager is generic over it.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Database;
use sqlx::pool::PoolOptions;

use crate::marker::{MarkerScope, SessionMarker};
use crate::tables::{TableSpec, TenantTables};

#[cfg(feature = "pg")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Message raised by a write that would cross the tenant boundary.
pub const POLICY_VIOLATION: &str = "row violates tenant isolation policy";

#[async_trait]
pub trait IsolationBackend: Database {
    /// Engine name used in log fields.
    const BACKEND: &'static str;

    /// Whether the engine enforces the row policies against any SQL the
    /// connection runs. An emulated backend only guards the documented access
    /// paths and must be opted into explicitly.
    const ENFORCED: bool;

    /// Write the marker onto the connection.
    async fn set_marker(
        conn: &mut Self::Connection,
        marker: &SessionMarker,
        scope: MarkerScope,
    ) -> Result<(), sqlx::Error>;

    /// Erase the marker. Clearing an already-clear connection succeeds.
    async fn clear_marker(conn: &mut Self::Connection) -> Result<(), sqlx::Error>;

    /// Marker currently carried by the connection, if any.
    async fn read_marker(conn: &mut Self::Connection) -> Result<Option<SessionMarker>, sqlx::Error>;

    async fn ping(conn: &mut Self::Connection) -> Result<(), sqlx::Error>;

    /// Call the policy lookups once; fails when the database is not set up for isolation.
    async fn probe_policy(conn: &mut Self::Connection) -> Result<(), sqlx::Error>;

    /// Human-readable list of policy objects that are absent or disabled.
    async fn missing_policies(
        conn: &mut Self::Connection,
        tables: &TenantTables,
    ) -> Result<Vec<String>, sqlx::Error>;

    /// Create or replace the context functions and row policies.
    async fn install_policies(
        conn: &mut Self::Connection,
        tables: &TenantTables,
        app_role: Option<&str>,
    ) -> Result<(), sqlx::Error>;

    /// Flip `active_column` to false on the row keyed by `id`, under the row policy.
    async fn soft_delete(
        conn: &mut Self::Connection,
        spec: &TableSpec,
        active_column: &str,
        id: &str,
    ) -> Result<bool, sqlx::Error>;

    /// Engine-specific pool setup, run before the pool opens any connection.
    #[must_use]
    fn prepare_pool(opts: PoolOptions<Self>, tables: Arc<TenantTables>) -> PoolOptions<Self>;
}
