//! `SQLite` backend.
//!
//! `SQLite` has no row-level security, so the policy is emulated with
//! connection-local TEMP objects created on every new pooled connection:
//!
//! - `temp.tenant_session` holds the marker in a single row. Writes to it are
//!   transactional, so a rolled-back unit of work cannot leave it behind.
//! - A TEMP view named after each tenant-owned table shadows `main.<table>`
//!   for unqualified reads and only yields the current tenant's rows.
//! - TEMP triggers on `main.<table>` reject inserts for another tenant,
//!   skip updates and deletes of foreign rows, and reject moving a row to
//!   another tenant.
//!
//! Reads address `<table>`; writes address `main.<table>` because the view is
//! not writable. With no marker the view is empty and every insert is
//! rejected.
//!
//! `SQLite` has no privileges, so none of this binds SQL that reads
//! `main.<table>` directly or rewrites `temp.tenant_session`. The backend is
//! therefore not [`IsolationBackend::ENFORCED`]: the manager refuses it unless
//! the config opts in, and detects a marker rewritten inside a unit of work.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::pool::PoolOptions;
use sqlx::{Executor, Sqlite, SqliteConnection};

use super::{IsolationBackend, POLICY_VIOLATION};
use crate::marker::{MarkerScope, SessionMarker};
use crate::tables::{TableSpec, TenantTables};
use tenantkit_security::{TenantId, UserId};

macro_rules! session_table {
    () => {
        "tenant_session"
    };
}

/// Connection-local table holding the marker.
pub const SESSION_TABLE: &str = session_table!();

const CURRENT_TENANT: &str = concat!("(SELECT tenant FROM temp.", session_table!(), " WHERE slot = 1)");
const IS_SUPER_ADMIN: &str = concat!(
    "coalesce((SELECT role FROM temp.",
    session_table!(),
    " WHERE slot = 1), '') = 'SUPER_ADMIN'"
);

fn trigger_names(table: &str) -> [String; 3] {
    [
        format!("{table}_tenant_insert"),
        format!("{table}_tenant_update"),
        format!("{table}_tenant_delete"),
    ]
}

fn session_table_ddl() -> String {
    format!(
        "CREATE TEMP TABLE IF NOT EXISTS {SESSION_TABLE} (\
         slot INTEGER PRIMARY KEY CHECK (slot = 1), \
         tenant TEXT, user_id TEXT, role TEXT)"
    )
}

fn policy_ddl(spec: &TableSpec) -> String {
    let TableSpec {
        name: t,
        tenant_column: c,
        ..
    } = *spec;
    let [ins, upd, del] = trigger_names(t);
    format!(
        "CREATE TEMP VIEW IF NOT EXISTS {t} AS SELECT * FROM main.{t} \
         WHERE {c} = {CURRENT_TENANT} OR {IS_SUPER_ADMIN};
         CREATE TEMP TRIGGER IF NOT EXISTS {ins} BEFORE INSERT ON main.{t} \
         WHEN NOT ({IS_SUPER_ADMIN}) AND coalesce(NEW.{c} = {CURRENT_TENANT}, 0) = 0 \
         BEGIN SELECT RAISE(ABORT, '{POLICY_VIOLATION}'); END;
         CREATE TEMP TRIGGER IF NOT EXISTS {upd} BEFORE UPDATE ON main.{t} \
         WHEN NOT ({IS_SUPER_ADMIN}) \
         BEGIN SELECT CASE \
         WHEN coalesce(OLD.{c} = {CURRENT_TENANT}, 0) = 0 THEN RAISE(IGNORE) \
         WHEN coalesce(NEW.{c} = {CURRENT_TENANT}, 0) = 0 THEN RAISE(ABORT, '{POLICY_VIOLATION}') \
         END; END;
         CREATE TEMP TRIGGER IF NOT EXISTS {del} BEFORE DELETE ON main.{t} \
         WHEN NOT ({IS_SUPER_ADMIN}) AND coalesce(OLD.{c} = {CURRENT_TENANT}, 0) = 0 \
         BEGIN SELECT RAISE(IGNORE); END;"
    )
}

async fn main_table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool, sqlx::Error> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM main.sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

/// Create the marker table, views and triggers on one connection.
///
/// Tables missing from `main` are skipped with a warning; the health probe
/// reports them as missing policy objects.
///
/// # Errors
/// Returns the underlying `sqlx::Error` when DDL fails.
pub async fn install_session_objects(
    conn: &mut SqliteConnection,
    tables: &TenantTables,
) -> Result<(), sqlx::Error> {
    let ddl = session_table_ddl();
    Executor::execute(&mut *conn, ddl.as_str()).await?;

    for spec in tables.specs() {
        if !main_table_exists(conn, spec.name).await? {
            tracing::warn!(table = spec.name, "tenant-owned table does not exist, policy not installed");
            continue;
        }
        let ddl = policy_ddl(spec);
        Executor::execute(&mut *conn, ddl.as_str()).await?;
    }
    Ok(())
}

#[async_trait]
impl IsolationBackend for Sqlite {
    const BACKEND: &'static str = "sqlite";
    const ENFORCED: bool = false;

    async fn set_marker(
        conn: &mut SqliteConnection,
        marker: &SessionMarker,
        _scope: MarkerScope,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(concat!(
            "INSERT OR REPLACE INTO temp.",
            session_table!(),
            " (slot, tenant, user_id, role) VALUES (1, ?, ?, ?)"
        ))
        .bind(marker.tenant().map(TenantId::as_str))
        .bind(marker.user().map(UserId::as_str))
        .bind(marker.role())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn clear_marker(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query(concat!("DELETE FROM temp.", session_table!()))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn read_marker(conn: &mut SqliteConnection) -> Result<Option<SessionMarker>, sqlx::Error> {
        let row: Option<(Option<String>, Option<String>, Option<String>)> = sqlx::query_as(concat!(
            "SELECT tenant, user_id, role FROM temp.",
            session_table!(),
            " WHERE slot = 1"
        ))
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.and_then(|(tenant, user, role)| SessionMarker::from_raw(tenant, user, role)))
    }

    async fn ping(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&mut *conn).await?;
        Ok(())
    }

    async fn probe_policy(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query(&format!("SELECT {CURRENT_TENANT}, {IS_SUPER_ADMIN}"))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn missing_policies(
        conn: &mut SqliteConnection,
        tables: &TenantTables,
    ) -> Result<Vec<String>, sqlx::Error> {
        let present: HashSet<String> = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_temp_master WHERE type IN ('table', 'view', 'trigger')",
        )
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .collect();

        let mut missing = Vec::new();
        if !present.contains(SESSION_TABLE) {
            missing.push(format!("session table temp.{SESSION_TABLE}"));
        }
        for spec in tables.specs() {
            if !main_table_exists(conn, spec.name).await? {
                missing.push(format!("table {}", spec.name));
                continue;
            }
            if !present.contains(spec.name) {
                missing.push(format!("tenant view {}", spec.name));
            }
            for trigger in trigger_names(spec.name) {
                if !present.contains(&trigger) {
                    missing.push(format!("trigger {trigger}"));
                }
            }
        }
        Ok(missing)
    }

    async fn install_policies(
        conn: &mut SqliteConnection,
        tables: &TenantTables,
        _app_role: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        install_session_objects(conn, tables).await
    }

    async fn soft_delete(
        conn: &mut SqliteConnection,
        spec: &TableSpec,
        active_column: &str,
        id: &str,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "UPDATE main.{} SET {active_column} = 0 WHERE {} = ?",
            spec.name, spec.key_column
        );
        let done = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
        Ok(done.rows_affected() > 0)
    }

    fn prepare_pool(opts: PoolOptions<Sqlite>, tables: Arc<TenantTables>) -> PoolOptions<Sqlite> {
        opts.after_connect(move |conn, _meta| {
            let tables = tables.clone();
            Box::pin(async move { install_session_objects(conn, &tables).await })
        })
    }
}
