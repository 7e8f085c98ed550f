//! Tenant-scoped units of work over a connection pool.
//!
//! Every unit of work follows one protocol on one checked-out connection:
//!
//! 1. acquire a connection and begin a transaction;
//! 2. write the session marker (abort before the callback if that fails);
//! 3. run the callback, bounded by `unit_timeout` when configured;
//! 4. check the callback left the marker as written, clear it, then commit,
//!    or roll back and clear again outside the transaction;
//! 5. return the connection to the pool, or close it when clearing failed.
//!
//! The callback only ever sees the connection through a `&mut` borrow tied to
//! the transaction, so it cannot keep the connection past its unit of work.
//!
//! # Example
//!
//! ```ignore
//! let manager = IsolationManager::<Sqlite>::connect(&cfg, tables).await?;
//! let names: Vec<String> = manager
//!     .with_tenant(&ctx, |conn| Box::pin(async move {
//!         sqlx::query_scalar("SELECT name FROM products").fetch_all(conn).await
//!     }))
//!     .await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sqlx::pool::PoolOptions;
use sqlx::{Connection, Pool, Transaction};
use tenantkit_security::{RequestScope, SuperAdminContext, TenantContext, TenantId};
use tracing::Instrument;
use uuid::Uuid;

use crate::backend::IsolationBackend;
use crate::checkout::Checkout;
use crate::config::{IsolationConfig, ManagerSettings, QueryDefaults};
use crate::error::{IsolationError, Result};
use crate::health::{self, HealthReport, HealthStatus};
use crate::marker::SessionMarker;
use crate::pool_opts::ApplyPoolOpts;
use crate::retry::with_retry;
use crate::tables::TenantTables;
use crate::unit_error::UnitError;

/// Future returned by a unit-of-work callback, borrowing the connection for `'c`.
pub type UnitFuture<'c, T, E> = Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send + 'c>>;

/// What happens to the connection once the unit of work is over.
enum Disposition {
    Release,
    Discard(&'static str),
}

/// Owns the pool and runs every tenant-scoped unit of work.
pub struct IsolationManager<DB: IsolationBackend> {
    pool: Pool<DB>,
    tables: Arc<TenantTables>,
    settings: ManagerSettings,
}

impl<DB: IsolationBackend> Clone for IsolationManager<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            tables: self.tables.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<DB: IsolationBackend> std::fmt::Debug for IsolationManager<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationManager")
            .field("backend", &DB::BACKEND)
            .field("tables", &self.tables.names())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<DB: IsolationBackend> IsolationManager<DB> {
    /// Build the pool, wait for the database and verify isolation is in force.
    ///
    /// # Errors
    /// - `IsolationError::InvalidConfig` for a bad config or DSN, or an
    ///   emulated backend without `allow_emulated_isolation`;
    /// - `IsolationError::Unreachable` when the database cannot be reached;
    /// - `IsolationError::PolicyMisconfigured` when it is reachable but the
    ///   health check reports missing isolation objects;
    /// - `IsolationError::Unhealthy` for any other failed health check.
    pub async fn connect(cfg: &IsolationConfig, tables: TenantTables) -> Result<Self> {
        cfg.validate()?;
        if !DB::ENFORCED {
            if !cfg.allow_emulated_isolation {
                return Err(IsolationError::InvalidConfig(format!(
                    "the {} backend only emulates row policies; set allow_emulated_isolation for development and tests",
                    DB::BACKEND
                )));
            }
            tracing::warn!(
                target: "security",
                backend = DB::BACKEND,
                "row policies are emulated, SQL that bypasses the tenant views is not isolated"
            );
        }
        let tables = Arc::new(tables);

        let mut opts = DB::prepare_pool(PoolOptions::<DB>::new().apply(&cfg.pool), tables.clone());
        if cfg.leak_guard {
            opts = install_leak_guard(opts);
        }

        tracing::info!(backend = DB::BACKEND, dsn = %cfg.redacted_dsn(), "connecting isolation pool");
        let pool = opts
            .connect_lazy(&cfg.dsn)
            .map_err(|e| IsolationError::InvalidConfig(format!("invalid dsn: {e}")))?;

        if let Err(e) = with_retry("isolation.connect", &cfg.retry, || {
            let pool = pool.clone();
            async move { pool.acquire().await.map(drop) }
        })
        .await
        {
            pool.close().await;
            return Err(e);
        }

        let manager = Self {
            pool,
            tables,
            settings: cfg.settings(),
        };
        let report = manager.health().await;
        let detail = report.detail.clone().unwrap_or_default();
        match report.status {
            HealthStatus::Healthy => {
                tracing::info!(backend = DB::BACKEND, latency_ms = report.latency_ms, "isolation pool ready");
                Ok(manager)
            }
            HealthStatus::Degraded => {
                manager.close().await;
                Err(IsolationError::PolicyMisconfigured(detail))
            }
            HealthStatus::Unhealthy => {
                manager.close().await;
                Err(IsolationError::Unhealthy(detail))
            }
        }
    }

    /// Wrap a pool built elsewhere. No connection hooks are added, so the pool
    /// must already prepare its connections for isolation.
    #[must_use]
    pub fn from_pool(pool: Pool<DB>, tables: TenantTables, settings: ManagerSettings) -> Self {
        Self {
            pool,
            tables: Arc::new(tables),
            settings,
        }
    }

    /// Run `f` as the tenant (and user and role) of `ctx`.
    ///
    /// # Errors
    /// `UnitError::Domain` carries the callback's error after rollback;
    /// `UnitError::Isolation` reports failures of the isolation protocol.
    pub async fn with_tenant<T, E, F>(&self, ctx: &TenantContext, f: F) -> std::result::Result<T, UnitError<E>>
    where
        F: for<'c> FnOnce(&'c mut DB::Connection) -> UnitFuture<'c, T, E> + Send,
        T: Send,
        E: Send,
    {
        self.run_unit(SessionMarker::for_context(ctx), f).await
    }

    /// Run `f` as `tenant` with no user or role.
    ///
    /// # Errors
    /// See [`IsolationManager::with_tenant`].
    pub async fn for_tenant<T, E, F>(&self, tenant: &TenantId, f: F) -> std::result::Result<T, UnitError<E>>
    where
        F: for<'c> FnOnce(&'c mut DB::Connection) -> UnitFuture<'c, T, E> + Send,
        T: Send,
        E: Send,
    {
        self.run_unit(SessionMarker::for_tenant(tenant), f).await
    }

    /// Run `f` as the tenant bound to a request scope.
    ///
    /// Only tenant principals are accepted; a super-admin scope must go
    /// through [`IsolationManager::with_super_admin`].
    ///
    /// # Errors
    /// Fails with `IsolationError::Scope` before touching the pool when no
    /// tenant is bound; otherwise see [`IsolationManager::with_tenant`].
    pub async fn with_scope<T, E, F>(&self, scope: &RequestScope, f: F) -> std::result::Result<T, UnitError<E>>
    where
        F: for<'c> FnOnce(&'c mut DB::Connection) -> UnitFuture<'c, T, E> + Send,
        T: Send,
        E: Send,
    {
        let ctx = scope.require_context().map_err(IsolationError::from)?;
        self.with_tenant(ctx, f).await
    }

    /// Run `f` with cross-tenant visibility.
    ///
    /// # Errors
    /// See [`IsolationManager::with_tenant`].
    pub async fn with_super_admin<T, E, F>(
        &self,
        admin: &SuperAdminContext,
        f: F,
    ) -> std::result::Result<T, UnitError<E>>
    where
        F: for<'c> FnOnce(&'c mut DB::Connection) -> UnitFuture<'c, T, E> + Send,
        T: Send,
        E: Send,
    {
        tracing::info!(target: "security", user = %admin.user_id(), "super admin unit of work");
        self.run_unit(SessionMarker::super_admin(admin), f).await
    }

    /// Check connectivity and isolation objects on one pooled connection.
    pub async fn health(&self) -> HealthReport {
        health::check(&self.pool, &self.tables).await
    }

    /// Raw pool access for infrastructure tasks (migrations, policy install).
    /// Connections taken from it carry no marker and see no tenant rows.
    #[must_use]
    pub fn pool(&self) -> &Pool<DB> {
        &self.pool
    }

    #[must_use]
    pub fn tables(&self) -> &TenantTables {
        &self.tables
    }

    #[must_use]
    pub fn query_defaults(&self) -> QueryDefaults {
        self.settings.query_defaults
    }

    #[must_use]
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_unit<T, E, F>(&self, marker: SessionMarker, f: F) -> std::result::Result<T, UnitError<E>>
    where
        F: for<'c> FnOnce(&'c mut DB::Connection) -> UnitFuture<'c, T, E> + Send,
        T: Send,
        E: Send,
    {
        let unit_id = Uuid::new_v4();
        let span = tracing::debug_span!(
            "unit_of_work",
            %unit_id,
            tenant = marker.label(),
            backend = DB::BACKEND
        );

        async move {
            let conn = self.pool.acquire().await.map_err(IsolationError::Acquire)?;
            let mut checkout = Checkout::new(conn);
            let (result, disposition) = self.drive(checkout.conn(), &marker, f).await;
            match disposition {
                Disposition::Release => checkout.release(),
                Disposition::Discard(reason) => checkout.discard(reason),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn drive<T, E, F>(
        &self,
        conn: &mut DB::Connection,
        marker: &SessionMarker,
        f: F,
    ) -> (std::result::Result<T, UnitError<E>>, Disposition)
    where
        F: for<'c> FnOnce(&'c mut DB::Connection) -> UnitFuture<'c, T, E> + Send,
        T: Send,
        E: Send,
    {
        let mut tx = match conn.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                return (
                    Err(IsolationError::Begin(e).into()),
                    Disposition::Discard("begin failed"),
                );
            }
        };

        if let Err(e) = DB::set_marker(&mut *tx, marker, self.settings.marker_scope).await {
            tracing::error!(
                target: "security",
                error = %e,
                "context setter failed, unit of work aborted before callback"
            );
            if !rollback(tx).await {
                return (
                    Err(IsolationError::SetterFailed(e).into()),
                    Disposition::Discard("rollback failed"),
                );
            }
            let disposition = clear_after_rollback::<DB>(conn).await;
            return (Err(IsolationError::SetterFailed(e).into()), disposition);
        }

        let outcome = match self.settings.unit_timeout {
            Some(limit) => match tokio::time::timeout(limit, f(&mut *tx)).await {
                Ok(res) => res.map_err(UnitError::Domain),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        "unit of work timed out"
                    );
                    Err(IsolationError::Timeout(limit).into())
                }
            },
            None => f(&mut *tx).await.map_err(UnitError::Domain),
        };

        let outcome = if matches!(outcome, Err(UnitError::Isolation(_))) {
            outcome
        } else if let Some(tampered) = verify_marker::<DB>(&mut *tx, marker).await {
            Err(tampered.into())
        } else {
            outcome
        };

        match outcome {
            Ok(value) => {
                if let Err(e) = DB::clear_marker(&mut *tx).await {
                    tracing::error!(target: "security", error = %e, "context clearer failed");
                    let rolled_back = rollback(tx).await;
                    tracing::debug!(rolled_back, "connection will be discarded");
                    return (
                        Err(IsolationError::ClearerFailed(e).into()),
                        Disposition::Discard("context clearer failed"),
                    );
                }
                if let Err(e) = tx.commit().await {
                    tracing::warn!(error = %e, "commit failed, unit of work rolled back");
                    let disposition = clear_after_rollback::<DB>(conn).await;
                    return (Err(IsolationError::Commit(e).into()), disposition);
                }
                (Ok(value), Disposition::Release)
            }
            Err(UnitError::Isolation(tampered @ IsolationError::MarkerTampered { .. })) => {
                let rolled_back = rollback(tx).await;
                tracing::debug!(rolled_back, "connection will be discarded");
                (
                    Err(tampered.into()),
                    Disposition::Discard("session marker changed inside the unit of work"),
                )
            }
            Err(err) => {
                // May be rejected by an aborted transaction; the clear after
                // rollback is the one that counts.
                if let Err(e) = DB::clear_marker(&mut *tx).await {
                    tracing::debug!(error = %e, "in-transaction clear skipped");
                }
                if !rollback(tx).await {
                    return (Err(err), Disposition::Discard("rollback failed"));
                }
                let disposition = clear_after_rollback::<DB>(conn).await;
                (Err(err), disposition)
            }
        }
    }
}

async fn rollback<DB: IsolationBackend>(tx: Transaction<'_, DB>) -> bool {
    match tx.rollback().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "rollback failed");
            false
        }
    }
}

/// Compare the marker on the connection with the one the setter wrote.
///
/// An unreadable marker (for instance inside an aborted transaction) is not
/// treated as tampering; the rollback and clear that follow still run.
async fn verify_marker<DB: IsolationBackend>(
    conn: &mut DB::Connection,
    expected: &SessionMarker,
) -> Option<IsolationError> {
    match DB::read_marker(conn).await {
        Ok(Some(found)) if found == *expected => None,
        Ok(found) => {
            let found = found.as_ref().map_or("<unset>", SessionMarker::label).to_owned();
            tracing::error!(
                target: "security",
                expected = expected.label(),
                found = %found,
                "session marker changed inside the unit of work"
            );
            Some(IsolationError::MarkerTampered { found })
        }
        Err(e) => {
            tracing::debug!(error = %e, "marker not verifiable after callback");
            None
        }
    }
}

async fn clear_after_rollback<DB: IsolationBackend>(conn: &mut DB::Connection) -> Disposition {
    match DB::clear_marker(conn).await {
        Ok(()) => Disposition::Release,
        Err(e) => {
            tracing::error!(target: "security", error = %e, "context clearer failed after rollback");
            Disposition::Discard("context clearer failed")
        }
    }
}

/// Close any pooled connection that carries a marker, or whose marker cannot be read.
fn install_leak_guard<DB: IsolationBackend>(opts: PoolOptions<DB>) -> PoolOptions<DB> {
    opts.before_acquire(|conn, _meta| Box::pin(async move { Ok(marker_free::<DB>(conn, "acquire").await) }))
        .after_release(|conn, _meta| Box::pin(async move { Ok(marker_free::<DB>(conn, "release").await) }))
}

async fn marker_free<DB: IsolationBackend>(conn: &mut DB::Connection, stage: &'static str) -> bool {
    match DB::read_marker(conn).await {
        Ok(None) => true,
        Ok(Some(marker)) => {
            tracing::error!(
                target: "security",
                stage,
                tenant = marker.label(),
                "pooled connection carries a session marker, closing it"
            );
            false
        }
        Err(e) => {
            tracing::warn!(target: "security", stage, error = %e, "cannot audit pooled connection, closing it");
            false
        }
    }
}
