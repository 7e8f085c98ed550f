use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlx::Sqlite;
use sqlx::sqlite::SqlitePoolOptions;
use tenantkit_db::{
    IsolationBackend, IsolationError, IsolationManager, ManagerSettings, UnitError,
};
use tracing_test::traced_test;

use crate::common::{bring_up_sqlite, config, connect, insert_product, tables, tenant, visible_products};

async fn marker_on_pool(manager: &IsolationManager<Sqlite>) -> Option<String> {
    let mut raw = manager.pool().acquire().await.unwrap();
    Sqlite::read_marker(&mut *raw)
        .await
        .unwrap()
        .map(|m| m.label().to_owned())
}

#[tokio::test]
async fn marker_is_cleared_after_success() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;

    insert_product(&manager, "t1", "p1").await;

    assert_eq!(marker_on_pool(&manager).await, None);
}

#[tokio::test]
async fn marker_is_cleared_after_callback_error() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;

    let result = manager
        .with_tenant(&tenant("t1"), |_conn| {
            Box::pin(async move { Err::<(), _>("boom") })
        })
        .await;

    assert!(matches!(result, Err(UnitError::Domain("boom"))));
    assert_eq!(marker_on_pool(&manager).await, None);
}

#[tokio::test]
async fn clearing_twice_is_a_no_op() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;
    let mut raw = manager.pool().acquire().await.unwrap();

    Sqlite::clear_marker(&mut *raw).await.unwrap();
    Sqlite::clear_marker(&mut *raw).await.unwrap();

    assert_eq!(Sqlite::read_marker(&mut *raw).await.unwrap(), None);
}

#[tokio::test]
async fn timeout_rolls_back_and_clears() {
    let db = bring_up_sqlite().await;
    let mut cfg = config(&db);
    cfg.unit_timeout = Some(Duration::from_millis(100));
    let manager = IsolationManager::<Sqlite>::connect(&cfg, tables()).await.unwrap();

    let result = manager
        .with_tenant(&tenant("t1"), |conn| {
            Box::pin(async move {
                sqlx::query("INSERT INTO main.products (id, tenant_id, name) VALUES ('slow', 't1', 'x')")
                    .execute(&mut *conn)
                    .await?;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, sqlx::Error>(())
            })
        })
        .await;

    assert!(matches!(
        result,
        Err(UnitError::Isolation(IsolationError::Timeout(_)))
    ));
    assert_eq!(marker_on_pool(&manager).await, None);
    assert!(visible_products(&manager, "t1").await.is_empty());
}

#[tokio::test]
#[traced_test]
async fn dropped_unit_discards_its_connection() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        manager.with_tenant(&tenant("t1"), |_conn| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, sqlx::Error>(())
            })
        }),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(logs_contain("unit of work abandoned before cleanup"));

    // The pool hands out a fresh connection with no marker.
    assert_eq!(marker_on_pool(&manager).await, None);
    insert_product(&manager, "t2", "p2").await;
    assert_eq!(visible_products(&manager, "t2").await.len(), 1);
}

#[tokio::test]
#[traced_test]
async fn clearer_failure_discards_connection() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;
    insert_product(&manager, "t1", "p1").await;

    let result = manager
        .with_tenant(&tenant("t1"), |conn| {
            Box::pin(async move {
                sqlx::query("DROP TABLE temp.tenant_session")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .await;

    assert!(matches!(
        result,
        Err(UnitError::Isolation(IsolationError::ClearerFailed(_)))
    ));
    assert!(logs_contain("context clearer failed"));
    assert!(logs_contain("rolled_back=true"));
    assert!(logs_contain("discarding pooled connection"));

    // Next unit gets a freshly bootstrapped connection.
    assert_eq!(visible_products(&manager, "t1").await.len(), 1);
    assert_eq!(marker_on_pool(&manager).await, None);
}

/// A pool whose connections were never prepared for isolation: the setter
/// fails and the callback must not run.
#[tokio::test]
async fn setter_failure_aborts_before_callback() {
    let db = bring_up_sqlite().await;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db.url)
        .await
        .unwrap();
    let manager = IsolationManager::from_pool(pool, tables(), ManagerSettings::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let result = manager
        .with_tenant(&tenant("t1"), move |conn| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sqlx::query("INSERT INTO main.products (id, tenant_id, name) VALUES ('p1', 't1', 'x')")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .await;

    let err = result.unwrap_err();
    let isolation = err.isolation().unwrap();
    assert!(matches!(isolation, IsolationError::SetterFailed(_)));
    assert!(isolation.is_pre_callback());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM main.products")
        .fetch_one(manager.pool())
        .await
        .unwrap();
    assert_eq!(rows, 0);
}
