use std::sync::Arc;
use std::time::Duration;

use sqlx::Sqlite;
use sqlx::sqlite::SqlitePoolOptions;
use tenantkit_db::{
    HealthStatus, IsolationBackend, IsolationConfig, IsolationError, IsolationManager,
    ManagerSettings, MarkerScope, RetryCfg, SessionMarker, TableSpec, TenantId, TenantTables,
};

use crate::common::{bring_up_sqlite, config, connect, tables};

#[tokio::test]
async fn connected_manager_is_healthy() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;

    let report = manager.health().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.detail.is_none());
}

#[tokio::test]
async fn unprepared_pool_is_degraded_not_unhealthy() {
    let db = bring_up_sqlite().await;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db.url)
        .await
        .unwrap();
    let manager = IsolationManager::from_pool(pool, tables(), ManagerSettings::default());

    let report = manager.health().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(report.detail.unwrap().contains("policy probe failed"));
}

#[tokio::test]
async fn closed_pool_is_unhealthy() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;
    manager.close().await;

    let report = manager.health().await;
    assert_eq!(report.status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn missing_table_policy_blocks_startup() {
    let db = bring_up_sqlite().await;
    let registry = TenantTables::builder()
        .spec(TableSpec::new("products", "tenant_id", "id"))
        .spec(TableSpec::new("appointments", "tenant_id", "id"))
        .build()
        .unwrap();

    let err = IsolationManager::<Sqlite>::connect(&config(&db), registry)
        .await
        .unwrap_err();
    match err {
        IsolationError::PolicyMisconfigured(detail) => assert!(detail.contains("table appointments")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_database_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/missing/dir/app.db", dir.path().display());
    let mut cfg = IsolationConfig::new(url);
    cfg.allow_emulated_isolation = true;
    cfg.pool.acquire_timeout = Some(Duration::from_secs(2));
    cfg.retry = RetryCfg::new(1).with_base_backoff(Duration::from_millis(5));

    let err = IsolationManager::<Sqlite>::connect(&cfg, tables())
        .await
        .unwrap_err();
    assert!(matches!(err, IsolationError::Unreachable { .. }));
}

/// A connection that went back to the pool still marked is reported and closed.
#[tokio::test]
async fn residual_marker_degrades_health_and_is_discarded() {
    let db = bring_up_sqlite().await;
    let pool = <Sqlite as IsolationBackend>::prepare_pool(
        SqlitePoolOptions::new().max_connections(1),
        Arc::new(tables()),
    )
    .connect(&db.url)
    .await
    .unwrap();
    {
        let mut conn = pool.acquire().await.unwrap();
        let marker = SessionMarker::for_tenant(&TenantId::parse("t1").unwrap());
        Sqlite::set_marker(&mut *conn, &marker, MarkerScope::Session)
            .await
            .unwrap();
    }
    let manager = IsolationManager::from_pool(pool, tables(), ManagerSettings::default());

    let report = manager.health().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(report.detail.unwrap().contains("session marker for t1"));

    assert_eq!(manager.health().await.status, HealthStatus::Healthy);
}

/// With the leak guard on, a marked connection never makes it back into circulation.
#[tokio::test]
async fn leak_guard_closes_marked_connections() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;
    {
        let mut conn = manager.pool().acquire().await.unwrap();
        let marker = SessionMarker::for_tenant(&TenantId::parse("t1").unwrap());
        Sqlite::set_marker(&mut *conn, &marker, MarkerScope::Session)
            .await
            .unwrap();
    }

    let mut conn = manager.pool().acquire().await.unwrap();
    assert_eq!(Sqlite::read_marker(&mut *conn).await.unwrap(), None);
    drop(conn);
    assert_eq!(manager.health().await.status, HealthStatus::Healthy);
}
