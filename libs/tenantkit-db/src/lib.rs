#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Tenant data isolation over pooled database connections.
//!
//! Row-level policies in the database filter every tenant-owned table by a
//! session marker that only this crate writes. [`IsolationManager`] binds the
//! marker to one checked-out connection for exactly one unit of work and
//! guarantees it is cleared, or the connection closed, before anyone else can
//! use that connection.
//!
//! ```ignore
//! use tenantkit_db::{IsolationConfig, IsolationManager, TenantTables};
//! use tenantkit_security::{TenantContext, TenantId};
//!
//! let cfg = IsolationConfig::load("config/app.yaml".as_ref())?;
//! let tables = TenantTables::builder().register::<Product>().build()?;
//! let db = IsolationManager::<sqlx::Postgres>::connect(&cfg, tables).await?;
//!
//! let ctx = TenantContext::new(TenantId::parse("acme")?);
//! let count: i64 = db
//!     .with_tenant(&ctx, |conn| Box::pin(async move {
//!         sqlx::query_scalar("SELECT count(*) FROM products").fetch_one(conn).await
//!     }))
//!     .await?;
//! ```
//!
//! Backends: `sqlite` (default feature) emulates the policies with
//! connection-local TEMP objects and must be enabled with
//! `allow_emulated_isolation`; `pg` uses `PostgreSQL` row-level security.

pub mod backend;
mod checkout;
pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod marker;
pub mod policy;
pub mod pool_opts;
pub mod retry;
mod soft_delete;
pub mod tables;
pub mod unit_error;

pub use backend::{IsolationBackend, POLICY_VIOLATION};
pub use config::{IsolationConfig, ManagerSettings, PoolCfg, QueryDefaults, redact_dsn};
pub use error::{IsolationError, Result};
pub use health::{HealthReport, HealthStatus};
pub use manager::{IsolationManager, UnitFuture};
pub use marker::{MarkerScope, SessionMarker};
pub use retry::RetryCfg;
pub use soft_delete::soft_delete;
pub use tables::{SoftDelete, TableError, TableSpec, TenantOwned, TenantTables};
pub use unit_error::UnitError;

pub use tenantkit_security::{
    RequestScope, Role, SUPER_ADMIN_ROLE, ScopeError, SuperAdminContext, TenantContext, TenantId,
    UserId,
};
