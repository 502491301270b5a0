//! Per-tenant SQLite databases.
//!
//! Each tenant owns one database file under the data directory. Pools are
//! opened once, migrated, and cached for the life of the process; every
//! `TenantStore` handed out for a tenant shares that tenant's pool and its
//! single-writer lock.

pub mod store;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};

pub use store::{NewInvoice, TenantStore};

const DATABASE_EXTENSION: &str = "db";

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections per tenant pool
    pub max_connections: u32,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// How long SQLite waits on a locked database before failing
    pub busy_timeout: Duration,
    /// Maximum idle time before a connection is closed
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// Open a tenant database pool.
pub async fn create_pool(path: &Path, config: &PoolConfig, create: bool) -> BillingResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect_with(options)
        .await?;

    tracing::debug!(
        "Tenant pool opened: path={}, max={}",
        path.display(),
        config.max_connections
    );

    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> BillingResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Registry of tenant databases, one SQLite file per tenant.
pub struct TenantPools {
    data_dir: PathBuf,
    config: PoolConfig,
    stores: RwLock<HashMap<String, TenantStore>>,
}

impl TenantPools {
    pub fn new(data_dir: impl Into<PathBuf>, config: PoolConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            config,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// List tenant ids present on disk, sorted.
    pub async fn discover(&self) -> BillingResult<Vec<String>> {
        let mut tenants = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(tenants),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(DATABASE_EXTENSION) {
                continue;
            }
            if let Some(tenant_id) = path.file_stem().and_then(|stem| stem.to_str()) {
                if is_valid_tenant_id(tenant_id) {
                    tenants.push(tenant_id.to_string());
                }
            }
        }

        tenants.sort();
        Ok(tenants)
    }

    /// Store for an existing tenant database.
    pub async fn store(&self, tenant_id: &str) -> BillingResult<TenantStore> {
        self.open(tenant_id, false).await
    }

    /// Create the tenant database if needed and return its store.
    pub async fn provision(&self, tenant_id: &str) -> BillingResult<TenantStore> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        self.open(tenant_id, true).await
    }

    async fn open(&self, tenant_id: &str, create: bool) -> BillingResult<TenantStore> {
        if let Some(store) = self.stores.read().await.get(tenant_id) {
            return Ok(store.clone());
        }

        let path = self.path_for(tenant_id)?;
        let mut stores = self.stores.write().await;
        if let Some(store) = stores.get(tenant_id) {
            return Ok(store.clone());
        }

        let pool = create_pool(&path, &self.config, create).await?;
        migrate(&pool).await?;

        let store = TenantStore::new(tenant_id, pool);
        stores.insert(tenant_id.to_string(), store.clone());
        tracing::info!(tenant = tenant_id, "Opened tenant database {}", path.display());

        Ok(store)
    }

    fn path_for(&self, tenant_id: &str) -> BillingResult<PathBuf> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(BillingError::Config(format!("invalid tenant id {tenant_id:?}")));
        }
        Ok(self.data_dir.join(format!("{tenant_id}.{DATABASE_EXTENSION}")))
    }

    pub async fn close_all(&self) {
        let stores = std::mem::take(&mut *self.stores.write().await);
        for (_, store) in stores {
            store.pool().close().await;
        }
    }
}

fn is_valid_tenant_id(tenant_id: &str) -> bool {
    !tenant_id.is_empty()
        && tenant_id.len() <= 64
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
