//! `PostgreSQL` backend.
//!
//! The marker lives in three custom settings (`app.current_tenant`,
//! `app.current_user`, `app.current_role`) written through the
//! `SECURITY DEFINER` function `set_user_context` and erased by
//! `clear_user_context`. Custom settings carry no privileges, so any role can
//! still `set_config` them; the manager re-reads the marker after the callback
//! and rolls the unit back if it changed. Row policies compare the tenant column against
//! `current_tenant_id()`; an unset marker compares against NULL, so no row
//! matches and every write fails its `WITH CHECK`.
//!
//! Tables are switched to `FORCE ROW LEVEL SECURITY` so the table owner is
//! filtered too. Superusers and `BYPASSRLS` roles are never filtered; the
//! application must connect as an ordinary role.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::pool::PoolOptions;
use sqlx::{Executor, PgConnection, Postgres};
use tenantkit_security::{SUPER_ADMIN_ROLE, TenantId, UserId};

use super::IsolationBackend;
use crate::marker::{MarkerScope, SessionMarker};
use crate::tables::{TableSpec, TenantTables};

pub const TENANT_SETTING: &str = "app.current_tenant";
pub const USER_SETTING: &str = "app.current_user";
pub const ROLE_SETTING: &str = "app.current_role";

/// Functions the policies and the manager depend on.
pub const CONTEXT_FUNCTIONS: [&str; 6] = [
    "set_user_context",
    "clear_user_context",
    "current_tenant_id",
    "current_user_id",
    "current_user_role",
    "is_super_admin",
];

fn context_functions_ddl() -> String {
    format!(
        "CREATE OR REPLACE FUNCTION set_user_context(\
             p_tenant text, p_user text, p_role text, p_local boolean)
         RETURNS void LANGUAGE plpgsql SECURITY DEFINER
         SET search_path = pg_catalog, pg_temp AS $fn$
         BEGIN
             PERFORM set_config('{TENANT_SETTING}', coalesce(p_tenant, ''), p_local);
             PERFORM set_config('{USER_SETTING}', coalesce(p_user, ''), p_local);
             PERFORM set_config('{ROLE_SETTING}', coalesce(p_role, ''), p_local);
         END $fn$;

         CREATE OR REPLACE FUNCTION clear_user_context()
         RETURNS void LANGUAGE plpgsql SECURITY DEFINER
         SET search_path = pg_catalog, pg_temp AS $fn$
         BEGIN
             PERFORM set_config('{TENANT_SETTING}', '', false);
             PERFORM set_config('{USER_SETTING}', '', false);
             PERFORM set_config('{ROLE_SETTING}', '', false);
         END $fn$;

         CREATE OR REPLACE FUNCTION current_tenant_id() RETURNS text
         LANGUAGE sql STABLE AS $fn$
             SELECT nullif(current_setting('{TENANT_SETTING}', true), '')
         $fn$;

         CREATE OR REPLACE FUNCTION current_user_id() RETURNS text
         LANGUAGE sql STABLE AS $fn$
             SELECT nullif(current_setting('{USER_SETTING}', true), '')
         $fn$;

         CREATE OR REPLACE FUNCTION current_user_role() RETURNS text
         LANGUAGE sql STABLE AS $fn$
             SELECT nullif(current_setting('{ROLE_SETTING}', true), '')
         $fn$;

         CREATE OR REPLACE FUNCTION is_super_admin() RETURNS boolean
         LANGUAGE sql STABLE AS $fn$
             SELECT coalesce(current_setting('{ROLE_SETTING}', true), '') = '{SUPER_ADMIN_ROLE}'
         $fn$;

         REVOKE ALL ON FUNCTION set_user_context(text, text, text, boolean) FROM PUBLIC;
         REVOKE ALL ON FUNCTION clear_user_context() FROM PUBLIC;"
    )
}

fn grant_ddl(role: &str) -> String {
    format!(
        "GRANT EXECUTE ON FUNCTION set_user_context(text, text, text, boolean) TO {role};
         GRANT EXECUTE ON FUNCTION clear_user_context() TO {role};"
    )
}

fn isolation_policy(table: &str) -> String {
    format!("{table}_tenant_isolation")
}

fn super_admin_policy(table: &str) -> String {
    format!("{table}_super_admin")
}

fn table_policy_ddl(spec: &TableSpec) -> String {
    let TableSpec {
        name: t,
        tenant_column: c,
        ..
    } = *spec;
    let iso = isolation_policy(t);
    let admin = super_admin_policy(t);
    format!(
        "ALTER TABLE {t} ENABLE ROW LEVEL SECURITY;
         ALTER TABLE {t} FORCE ROW LEVEL SECURITY;
         DROP POLICY IF EXISTS {iso} ON {t};
         CREATE POLICY {iso} ON {t}
             USING ({c}::text = current_tenant_id())
             WITH CHECK ({c}::text = current_tenant_id());
         DROP POLICY IF EXISTS {admin} ON {t};
         CREATE POLICY {admin} ON {t}
             USING (is_super_admin())
             WITH CHECK (is_super_admin());"
    )
}

#[async_trait]
impl IsolationBackend for Postgres {
    const BACKEND: &'static str = "postgres";
    const ENFORCED: bool = true;

    async fn set_marker(
        conn: &mut PgConnection,
        marker: &SessionMarker,
        scope: MarkerScope,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT set_user_context($1, $2, $3, $4)")
            .bind(marker.tenant().map(TenantId::as_str))
            .bind(marker.user().map(UserId::as_str))
            .bind(marker.role())
            .bind(scope.is_local())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn clear_marker(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT clear_user_context()")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // Reads the settings directly so a connection can be audited even when the
    // context functions are missing.
    async fn read_marker(conn: &mut PgConnection) -> Result<Option<SessionMarker>, sqlx::Error> {
        let (tenant, user, role): (Option<String>, Option<String>, Option<String>) =
            sqlx::query_as("SELECT current_setting($1, true), current_setting($2, true), current_setting($3, true)")
                .bind(TENANT_SETTING)
                .bind(USER_SETTING)
                .bind(ROLE_SETTING)
                .fetch_one(&mut *conn)
                .await?;
        Ok(SessionMarker::from_raw(tenant, user, role))
    }

    async fn ping(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&mut *conn).await?;
        Ok(())
    }

    async fn probe_policy(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT current_tenant_id(), current_user_id(), current_user_role(), is_super_admin()")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn missing_policies(
        conn: &mut PgConnection,
        tables: &TenantTables,
    ) -> Result<Vec<String>, sqlx::Error> {
        let mut missing = Vec::new();

        let names: Vec<String> = CONTEXT_FUNCTIONS.iter().map(|f| (*f).to_owned()).collect();
        let found: HashSet<String> = sqlx::query_scalar::<_, String>(
            "SELECT p.proname::text FROM pg_proc p \
             JOIN pg_namespace n ON n.oid = p.pronamespace \
             WHERE n.nspname = current_schema() AND p.proname::text = ANY($1)",
        )
        .bind(&names)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .collect();
        for name in CONTEXT_FUNCTIONS {
            if !found.contains(name) {
                missing.push(format!("function {name}()"));
            }
        }

        for spec in tables.specs() {
            let flags: Option<(bool, bool)> = sqlx::query_as(
                "SELECT relrowsecurity, relforcerowsecurity FROM pg_class WHERE oid = to_regclass($1)",
            )
            .bind(spec.name)
            .fetch_optional(&mut *conn)
            .await?;
            let Some((enabled, forced)) = flags else {
                missing.push(format!("table {}", spec.name));
                continue;
            };
            if !enabled {
                missing.push(format!("row level security on {}", spec.name));
            }
            if !forced {
                missing.push(format!("forced row level security on {}", spec.name));
            }

            let policies: HashSet<String> = sqlx::query_scalar::<_, String>(
                "SELECT policyname::text FROM pg_policies \
                 WHERE schemaname = current_schema() AND tablename = $1",
            )
            .bind(spec.name)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();
            for policy in [isolation_policy(spec.name), super_admin_policy(spec.name)] {
                if !policies.contains(&policy) {
                    missing.push(format!("policy {policy}"));
                }
            }
        }
        Ok(missing)
    }

    async fn install_policies(
        conn: &mut PgConnection,
        tables: &TenantTables,
        app_role: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let ddl = context_functions_ddl();
        Executor::execute(&mut *conn, ddl.as_str()).await?;
        if let Some(role) = app_role {
            let ddl = grant_ddl(role);
            Executor::execute(&mut *conn, ddl.as_str()).await?;
        }
        for spec in tables.specs() {
            let ddl = table_policy_ddl(spec);
            Executor::execute(&mut *conn, ddl.as_str()).await?;
            tracing::info!(table = spec.name, "row level security policies installed");
        }
        Ok(())
    }

    async fn soft_delete(
        conn: &mut PgConnection,
        spec: &TableSpec,
        active_column: &str,
        id: &str,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!(
            "UPDATE {} SET {active_column} = false WHERE {}::text = $1",
            spec.name, spec.key_column
        );
        let done = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
        Ok(done.rows_affected() > 0)
    }

    fn prepare_pool(opts: PoolOptions<Postgres>, _tables: Arc<TenantTables>) -> PoolOptions<Postgres> {
        opts
    }
}
