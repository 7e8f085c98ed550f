use sqlx::Sqlite;
use tenantkit_db::{IsolationBackend, IsolationError, SuperAdminContext, UserId, policy};

use crate::common::{bring_up_sqlite, connect, insert_product, tenant, visible_products};

fn ops() -> SuperAdminContext {
    SuperAdminContext::new(UserId::parse("ops").unwrap())
}

#[tokio::test]
async fn super_admin_reads_across_tenants() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;
    insert_product(&manager, "t1", "p1").await;
    insert_product(&manager, "t2", "p2").await;

    let (tenants, admin, current) = manager
        .with_super_admin(&ops(), |conn| {
            Box::pin(async move {
                let tenants: Vec<String> =
                    sqlx::query_scalar("SELECT tenant_id FROM products ORDER BY tenant_id")
                        .fetch_all(&mut *conn)
                        .await?;
                let admin = policy::is_super_admin::<Sqlite>(&mut *conn).await?;
                let current = policy::current_tenant::<Sqlite>(&mut *conn).await?;
                Ok::<_, IsolationError>((tenants, admin, current))
            })
        })
        .await
        .unwrap();

    assert_eq!(tenants, vec!["t1".to_owned(), "t2".to_owned()]);
    assert!(admin);
    assert_eq!(current, None);

    // Ordinary units on the same connection are still scoped afterwards.
    assert_eq!(
        visible_products(&manager, "t1").await,
        vec![("p1".to_owned(), "t1".to_owned())]
    );
    let mut raw = manager.pool().acquire().await.unwrap();
    assert_eq!(Sqlite::read_marker(&mut *raw).await.unwrap(), None);
}

#[tokio::test]
async fn tenant_unit_is_never_super_admin() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;

    let admin = manager
        .with_tenant(&tenant("t1"), |conn| {
            Box::pin(async move { policy::is_super_admin::<Sqlite>(&mut *conn).await })
        })
        .await
        .unwrap();
    assert!(!admin);
}

#[tokio::test]
async fn super_admin_can_repair_rows_of_any_tenant() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;
    insert_product(&manager, "t1", "p1").await;

    let updated = manager
        .with_super_admin(&ops(), |conn| {
            Box::pin(async move {
                let done = sqlx::query("UPDATE main.products SET name = 'renamed' WHERE id = 'p1'")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(done.rows_affected())
            })
        })
        .await
        .unwrap();
    assert_eq!(updated, 1);
}
