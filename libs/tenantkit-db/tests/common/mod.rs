#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use std::time::Duration;

use sqlx::{Connection, Sqlite, SqliteConnection};
use tempfile::TempDir;
use tenantkit_db::{
    IsolationConfig, IsolationManager, RetryCfg, SoftDelete, TableSpec, TenantContext, TenantId,
    TenantOwned, TenantTables,
};

pub struct Product;

impl TenantOwned for Product {
    const TABLE: TableSpec = TableSpec::new("products", "tenant_id", "id");
}

impl SoftDelete for Product {
    const ACTIVE_COLUMN: &'static str = "active";
}

pub struct Supplier;

impl TenantOwned for Supplier {
    const TABLE: TableSpec = TableSpec::new("suppliers", "tenant_id", "id");
}

const SCHEMA: &str = "
CREATE TABLE products (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    quantity INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE suppliers (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL
);
";

/// File-backed `SQLite` database with the inventory schema.
pub struct SqliteDb {
    pub url: String,
    _dir: TempDir,
}

pub async fn bring_up_sqlite() -> SqliteDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inventory.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());

    let mut conn = SqliteConnection::connect(&url).await.unwrap();
    sqlx::raw_sql(SCHEMA).execute(&mut conn).await.unwrap();
    conn.close().await.unwrap();

    SqliteDb { url, _dir: dir }
}

pub fn tables() -> TenantTables {
    TenantTables::builder()
        .register::<Product>()
        .register::<Supplier>()
        .build()
        .unwrap()
}

/// Single-connection pool so consecutive units of work share one physical connection.
pub fn config(db: &SqliteDb) -> IsolationConfig {
    let mut cfg = IsolationConfig::new(db.url.clone());
    cfg.allow_emulated_isolation = true;
    cfg.pool.max_conns = Some(1);
    cfg.pool.acquire_timeout = Some(Duration::from_secs(10));
    cfg.retry = RetryCfg::new(2)
        .with_base_backoff(Duration::from_millis(10))
        .with_max_backoff(Duration::from_millis(50));
    cfg
}

pub async fn connect(db: &SqliteDb) -> IsolationManager<Sqlite> {
    IsolationManager::connect(&config(db), tables()).await.unwrap()
}

pub fn tenant(id: &str) -> TenantContext {
    TenantContext::new(TenantId::parse(id).unwrap())
}

pub async fn insert_product(manager: &IsolationManager<Sqlite>, tenant_id: &str, id: &str) {
    let id = id.to_owned();
    let owner = tenant_id.to_owned();
    manager
        .with_tenant(&tenant(tenant_id), move |conn| {
            Box::pin(async move {
                sqlx::query(
                    "INSERT INTO main.products (id, tenant_id, name, quantity) VALUES (?, ?, 'widget', 5)",
                )
                .bind(id)
                .bind(owner)
                .execute(&mut *conn)
                .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .await
        .unwrap();
}

/// `(id, tenant_id)` of every product visible to `tenant_id`.
pub async fn visible_products(
    manager: &IsolationManager<Sqlite>,
    tenant_id: &str,
) -> Vec<(String, String)> {
    manager
        .with_tenant(&tenant(tenant_id), |conn| {
            Box::pin(async move {
                sqlx::query_as::<_, (String, String)>("SELECT id, tenant_id FROM products ORDER BY id")
                    .fetch_all(&mut *conn)
                    .await
            })
        })
        .await
        .unwrap()
}
