// Test modules for the billing engine

pub mod helpers;
pub mod integration;

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::BillingConfig;
use crate::database::{PoolConfig, TenantPools, TenantStore};
use crate::jobs::RecurringBillingJob;
use crate::services::{DeliveryService, DocumentRenderer, MailTransport};

// Test context holding a scratch data directory with per-tenant databases
pub struct TestContext {
    pub dir: TempDir,
    pub tenants: Arc<TenantPools>,
}

impl TestContext {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create scratch directory");
        let tenants = Arc::new(TenantPools::new(dir.path().join("tenants"), PoolConfig::default()));
        Self { dir, tenants }
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.dir.path().join("documents")
    }

    /// Provision a tenant database and run migrations on it.
    pub async fn tenant(&self, tenant_id: &str) -> TenantStore {
        self.tenants
            .provision(tenant_id)
            .await
            .expect("Failed to provision tenant")
    }

    pub fn billing_job(
        &self,
        transport: Arc<dyn MailTransport>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> RecurringBillingJob {
        let delivery = DeliveryService::new(transport, &helpers::smtp_config());
        self.billing_job_with(delivery, renderer)
    }

    pub fn billing_job_with(
        &self,
        delivery: DeliveryService,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> RecurringBillingJob {
        RecurringBillingJob::new(
            self.tenants.clone(),
            renderer,
            Arc::new(delivery),
            &BillingConfig::default(),
            self.documents_dir(),
            4,
        )
    }
}
