use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlx::Sqlite;
use tenantkit_db::{
    IsolationError, RequestScope, Role, ScopeError, SuperAdminContext, TenantId, UnitError,
    UserId, policy,
};

use crate::common::{bring_up_sqlite, connect, insert_product, tenant, visible_products};

#[derive(Debug, PartialEq)]
enum InventoryError {
    OutOfStock,
    Db(String),
}

impl From<sqlx::Error> for InventoryError {
    fn from(e: sqlx::Error) -> Self {
        InventoryError::Db(e.to_string())
    }
}

#[tokio::test]
async fn sequential_tenants_on_one_connection() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;

    insert_product(&manager, "t1", "p1").await;
    insert_product(&manager, "t1", "p2").await;
    insert_product(&manager, "t2", "p3").await;

    assert_eq!(
        visible_products(&manager, "t1").await,
        vec![
            ("p1".to_owned(), "t1".to_owned()),
            ("p2".to_owned(), "t1".to_owned())
        ]
    );
    assert_eq!(
        visible_products(&manager, "t2").await,
        vec![("p3".to_owned(), "t2".to_owned())]
    );
    assert_eq!(visible_products(&manager, "t1").await.len(), 2);
}

#[tokio::test]
async fn failed_callback_rolls_back_partial_write() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;
    insert_product(&manager, "t1", "p1").await;

    let result = manager
        .with_tenant(&tenant("t1"), |conn| {
            Box::pin(async move {
                sqlx::query("UPDATE main.products SET quantity = quantity - 5 WHERE id = 'p1'")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("INSERT INTO main.products (id, tenant_id, name) VALUES ('p9', 't1', 'x')")
                    .execute(&mut *conn)
                    .await?;
                Err::<(), _>(InventoryError::OutOfStock)
            })
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(
        err.into_domain(|e| InventoryError::Db(e.to_string())),
        InventoryError::OutOfStock
    );

    let quantity: i64 = manager
        .with_tenant(&tenant("t1"), |conn| {
            Box::pin(async move {
                sqlx::query_scalar("SELECT quantity FROM products WHERE id = 'p1'")
                    .fetch_one(&mut *conn)
                    .await
            })
        })
        .await
        .unwrap();
    assert_eq!(quantity, 5);
    assert_eq!(visible_products(&manager, "t1").await.len(), 1);
}

#[tokio::test]
async fn unauthenticated_scope_fails_before_touching_the_pool() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;
    let calls = Arc::new(AtomicUsize::new(0));

    for scope in [
        RequestScope::anonymous(),
        RequestScope::super_admin(SuperAdminContext::new(UserId::parse("ops").unwrap())),
    ] {
        let counter = calls.clone();
        let result = manager
            .with_scope(&scope, move |_conn| {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, sqlx::Error>(())
                })
            })
            .await;
        assert!(matches!(
            result,
            Err(UnitError::Isolation(IsolationError::Scope(
                ScopeError::UnauthenticatedScope
            )))
        ));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn request_scope_drives_marker_values() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;

    let ctx = tenant("acme")
        .with_user(UserId::parse("alice").unwrap())
        .with_role(Role::Manager);
    let scope = RequestScope::tenant(ctx);

    let (tenant_id, user, role, admin) = manager
        .with_scope(&scope, |conn| {
            Box::pin(async move {
                let tenant_id = policy::current_tenant::<Sqlite>(&mut *conn).await?;
                let user = policy::current_user::<Sqlite>(&mut *conn).await?;
                let role = policy::current_role::<Sqlite>(&mut *conn).await?;
                let admin = policy::is_super_admin::<Sqlite>(&mut *conn).await?;
                Ok::<_, IsolationError>((tenant_id, user, role, admin))
            })
        })
        .await
        .unwrap();

    assert_eq!(tenant_id, Some(TenantId::parse("acme").unwrap()));
    assert_eq!(user.as_ref().map(UserId::as_str), Some("alice"));
    assert_eq!(role.as_deref(), Some("MANAGER"));
    assert!(!admin);
}

#[tokio::test]
async fn for_tenant_sets_only_the_tenant() {
    let db = bring_up_sqlite().await;
    let manager = connect(&db).await;
    insert_product(&manager, "t1", "p1").await;

    let (count, user) = manager
        .for_tenant(&TenantId::parse("t1").unwrap(), |conn| {
            Box::pin(async move {
                let count: i64 = sqlx::query_scalar("SELECT count(*) FROM products")
                    .fetch_one(&mut *conn)
                    .await?;
                let user = policy::current_user::<Sqlite>(&mut *conn).await?;
                Ok::<_, IsolationError>((count, user))
            })
        })
        .await
        .unwrap();

    assert_eq!(count, 1);
    assert_eq!(user, None);
}

#[tokio::test]
async fn query_defaults_come_from_config() {
    let db = bring_up_sqlite().await;
    let mut cfg = crate::common::config(&db);
    cfg.query_defaults.page_size = 2;
    let manager = tenantkit_db::IsolationManager::<Sqlite>::connect(&cfg, crate::common::tables())
        .await
        .unwrap();
    for id in ["p1", "p2", "p3"] {
        insert_product(&manager, "t1", id).await;
    }

    let limit = i64::from(manager.query_defaults().resolve_page_size(None));
    let page: Vec<String> = manager
        .with_tenant(&tenant("t1"), move |conn| {
            Box::pin(async move {
                sqlx::query_scalar("SELECT id FROM products ORDER BY id LIMIT ?")
                    .bind(limit)
                    .fetch_all(&mut *conn)
                    .await
            })
        })
        .await
        .unwrap();
    assert_eq!(page, vec!["p1".to_owned(), "p2".to_owned()]);
}
