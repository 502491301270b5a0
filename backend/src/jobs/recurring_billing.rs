// Recurring Billing Job - Generates due invoices per contract, renders and delivers them

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tally_shared::{Client, Company, Contract, DeliveryStatus, Invoice, InvoiceStatus, PeriodWindow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::scheduler::JobResult;
use crate::config::BillingConfig;
use crate::database::{TenantPools, TenantStore};
use crate::error::{BillingError, BillingResult};
use crate::services::delivery::{DeliveryReport, DeliveryService};
use crate::services::email::{self, Recipient};
use crate::services::invoice_builder::InvoiceBuilder;
use crate::services::rate_engine::{RateEngine, RateOutcome};
use crate::services::recurrence::RecurrenceEngine;
use crate::services::renderer::{self, DocumentRenderer, InvoiceDocument};

pub struct RecurringBillingJob {
    tenants: Arc<TenantPools>,
    renderer: Arc<dyn DocumentRenderer>,
    delivery: Arc<DeliveryService>,
    rate_engine: RateEngine,
    recurrence: RecurrenceEngine,
    builder: InvoiceBuilder,
    documents_dir: PathBuf,
    workers: usize,
    delivery_lease: Duration,
}

/// What happened to one contract during a cycle.
#[derive(Debug)]
pub enum ContractOutcome {
    NotDue,
    NothingToBill { window: PeriodWindow },
    AlreadyGenerated { window: PeriodWindow },
    Generated {
        window: PeriodWindow,
        invoice_id: Uuid,
        number: String,
        total: Decimal,
        currency: String,
        delivery: DeliveryStatus,
    },
    /// A draft from an earlier run that had not been delivered yet.
    Resumed {
        window: Option<PeriodWindow>,
        invoice_id: Uuid,
        number: String,
        delivery: DeliveryStatus,
    },
    Failed {
        window: Option<PeriodWindow>,
        error: BillingError,
    },
    Cancelled,
}

#[derive(Debug)]
pub struct ContractReport {
    pub tenant_id: String,
    pub contract_id: Uuid,
    pub outcome: ContractOutcome,
}

#[derive(Debug, Default)]
pub struct BillingJobResult {
    pub tenants_processed: i32,
    pub contracts_checked: i32,
    pub invoices_generated: i32,
    pub invoices_delivered: i32,
    pub invoices_resumed: i32,
    pub already_generated: i32,
    pub nothing_to_bill: i32,
    pub overdue_marked: i32,
    pub total_amount_invoiced: BTreeMap<String, Decimal>,
    pub errors: Vec<String>,
    pub contracts: Vec<ContractReport>,
}

impl BillingJobResult {
    fn record(&mut self, report: ContractReport) {
        self.contracts_checked += 1;
        match &report.outcome {
            ContractOutcome::Generated {
                total,
                currency,
                delivery,
                ..
            } => {
                self.invoices_generated += 1;
                if *delivery == DeliveryStatus::Delivered {
                    self.invoices_delivered += 1;
                }
                *self
                    .total_amount_invoiced
                    .entry(currency.clone())
                    .or_insert(Decimal::ZERO) += *total;
            }
            ContractOutcome::Resumed { delivery, .. } => {
                self.invoices_resumed += 1;
                if *delivery == DeliveryStatus::Delivered {
                    self.invoices_delivered += 1;
                }
            }
            ContractOutcome::AlreadyGenerated { .. } => self.already_generated += 1,
            ContractOutcome::NothingToBill { .. } => self.nothing_to_bill += 1,
            ContractOutcome::Failed { window, error } => {
                let period = window.map(|w| w.to_string()).unwrap_or_else(|| "-".to_string());
                self.errors.push(format!(
                    "tenant {} contract {} period {}: [{}] {}",
                    report.tenant_id,
                    report.contract_id,
                    period,
                    error.error_code(),
                    error
                ));
            }
            ContractOutcome::NotDue | ContractOutcome::Cancelled => {}
        }
        self.contracts.push(report);
    }
}

impl RecurringBillingJob {
    pub fn new(
        tenants: Arc<TenantPools>,
        renderer: Arc<dyn DocumentRenderer>,
        delivery: Arc<DeliveryService>,
        billing: &BillingConfig,
        documents_dir: impl Into<PathBuf>,
        workers: usize,
    ) -> Self {
        Self {
            tenants,
            renderer,
            delivery,
            rate_engine: RateEngine::new(),
            recurrence: RecurrenceEngine::new(billing),
            builder: InvoiceBuilder::new(billing),
            documents_dir: documents_dir.into(),
            workers: workers.max(1),
            delivery_lease: Duration::minutes(i64::from(billing.delivery_lease_minutes)),
        }
    }

    /// One billing cycle over every tenant.
    pub async fn run(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> JobResult<BillingJobResult> {
        let mut result = BillingJobResult::default();
        let mut work: Vec<(TenantStore, Contract)> = Vec::new();

        for tenant_id in self.tenants.discover().await? {
            if cancel.is_cancelled() {
                break;
            }

            match self.prepare_tenant(&tenant_id, now, &mut result).await {
                Ok(contracts) => work.extend(contracts),
                Err(e) => {
                    error!(tenant = %tenant_id, "Failed to load tenant: {}", e);
                    result.errors.push(format!("tenant {}: [{}] {}", tenant_id, e.error_code(), e));
                }
            }
        }

        let reports: Vec<ContractReport> = stream::iter(work)
            .map(|(store, contract)| async move {
                let outcome = self.process_contract(&store, &contract, now, cancel).await;
                ContractReport {
                    tenant_id: store.tenant_id().to_string(),
                    contract_id: contract.id,
                    outcome,
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for report in reports {
            result.record(report);
        }

        Ok(result)
    }

    /// Overdue sweep plus the list of contracts to look at.
    async fn prepare_tenant(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        result: &mut BillingJobResult,
    ) -> BillingResult<Vec<(TenantStore, Contract)>> {
        let store = self.tenants.store(tenant_id).await?;

        let overdue = store.mark_overdue(now.date_naive()).await?;
        if overdue > 0 {
            info!(tenant = %tenant_id, "Marked {} invoices overdue", overdue);
        }
        result.overdue_marked += overdue as i32;
        result.tenants_processed += 1;

        let contracts = store.list_active_recurring_contracts().await?;
        Ok(contracts
            .into_iter()
            .map(|contract| (store.clone(), contract))
            .collect())
    }

    pub async fn process_contract(
        &self,
        store: &TenantStore,
        contract: &Contract,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> ContractOutcome {
        if cancel.is_cancelled() {
            return ContractOutcome::Cancelled;
        }

        // Finish what an earlier run left undelivered before opening a new window.
        match self.resume_pending(store, contract, now, cancel).await {
            Ok(Some(outcome)) => return outcome,
            Ok(None) => {}
            Err(error) => {
                error!(
                    tenant = store.tenant_id(),
                    contract = %contract.id,
                    "Failed to look up undelivered drafts: {}",
                    error
                );
                return ContractOutcome::Failed { window: None, error };
            }
        }

        let window = match self.recurrence.due_window(store, contract, now).await {
            Ok(Some(window)) => window,
            Ok(None) => return ContractOutcome::NotDue,
            Err(error) => {
                error!(
                    tenant = store.tenant_id(),
                    contract = %contract.id,
                    "Failed to evaluate recurrence: {}",
                    error
                );
                return ContractOutcome::Failed { window: None, error };
            }
        };

        match self.generate(store, contract, window, now, cancel).await {
            Ok(outcome) => outcome,
            Err(BillingError::DuplicatePeriod) => {
                info!(
                    tenant = store.tenant_id(),
                    contract = %contract.id,
                    period = %window,
                    "Invoice already generated by another run"
                );
                ContractOutcome::AlreadyGenerated { window }
            }
            Err(error) => {
                error!(
                    tenant = store.tenant_id(),
                    contract = %contract.id,
                    period = %window,
                    code = error.error_code(),
                    "Contract billing failed: {}",
                    error
                );
                ContractOutcome::Failed {
                    window: Some(window),
                    error,
                }
            }
        }
    }

    async fn generate(
        &self,
        store: &TenantStore,
        contract: &Contract,
        window: PeriodWindow,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> BillingResult<ContractOutcome> {
        let entries = store.list_uninvoiced_billable_entries(contract.id, &window).await?;
        let charge = match self.rate_engine.compute_amount(contract, &window, &entries)? {
            RateOutcome::Billable(charge) => charge,
            RateOutcome::NothingToBill => {
                store.record_skipped_period(contract.id, &window).await?;
                info!(
                    tenant = store.tenant_id(),
                    contract = %contract.id,
                    period = %window,
                    "No billable time, skipping period"
                );
                return Ok(ContractOutcome::NothingToBill { window });
            }
        };

        if !self.delivery.is_configured() {
            return Err(BillingError::Config("SMTP_HOST is not set".to_string()));
        }

        let company = store.company().await?;
        let client = store.client(contract.client_id).await?;
        let invoice = self
            .builder
            .build(store, contract, &client, &company, &charge, &window, now.date_naive())
            .await?;

        let delivery = if store
            .claim_delivery(invoice.id, now, now + self.delivery_lease)
            .await?
        {
            let report = self
                .render_and_deliver(store, &invoice, &company, &client, cancel)
                .await;
            self.settle_claim(store, &invoice, report).await?.delivery_status()
        } else {
            info!(
                tenant = store.tenant_id(),
                invoice = %invoice.display_number(),
                "Delivery picked up by another run"
            );
            DeliveryStatus::Pending
        };

        Ok(ContractOutcome::Generated {
            window,
            invoice_id: invoice.id,
            number: invoice.display_number(),
            total: invoice.total(),
            currency: invoice.currency.to_string(),
            delivery,
        })
    }

    /// Render and deliver the oldest draft of the contract that never finished
    /// delivery, for instance after a render failure or a crash mid-cycle.
    async fn resume_pending(
        &self,
        store: &TenantStore,
        contract: &Contract,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> BillingResult<Option<ContractOutcome>> {
        let Some(invoice) = store
            .claim_pending_invoice(contract.id, now, now + self.delivery_lease)
            .await?
        else {
            return Ok(None);
        };
        let window = invoice.period;

        info!(
            tenant = store.tenant_id(),
            contract = %contract.id,
            invoice = %invoice.display_number(),
            "Resuming undelivered draft"
        );

        let report = self.deliver_existing(store, &invoice, cancel).await;
        match self.settle_claim(store, &invoice, report).await {
            Ok(report) => Ok(Some(ContractOutcome::Resumed {
                window,
                invoice_id: invoice.id,
                number: invoice.display_number(),
                delivery: report.delivery_status(),
            })),
            Err(error) => {
                error!(
                    tenant = store.tenant_id(),
                    contract = %contract.id,
                    invoice = %invoice.display_number(),
                    code = error.error_code(),
                    "Undelivered draft still failing: {}",
                    error
                );
                Ok(Some(ContractOutcome::Failed { window, error }))
            }
        }
    }

    async fn deliver_existing(
        &self,
        store: &TenantStore,
        invoice: &Invoice,
        cancel: &CancellationToken,
    ) -> BillingResult<DeliveryReport> {
        if !self.delivery.is_configured() {
            return Err(BillingError::Config("SMTP_HOST is not set".to_string()));
        }
        let company = store.company().await?;
        let client = store.client(invoice.client_id).await?;
        self.render_and_deliver(store, invoice, &company, &client, cancel)
            .await
    }

    /// Give the claim back when delivery never ran so the next cycle can retry.
    async fn settle_claim(
        &self,
        store: &TenantStore,
        invoice: &Invoice,
        report: BillingResult<DeliveryReport>,
    ) -> BillingResult<DeliveryReport> {
        if report.is_err() {
            if let Err(e) = store.release_delivery(invoice.id).await {
                warn!(invoice = %invoice.display_number(), "Failed to release delivery claim: {}", e);
            }
        }
        report
    }

    async fn render_and_deliver(
        &self,
        store: &TenantStore,
        invoice: &Invoice,
        company: &Company,
        client: &Client,
        cancel: &CancellationToken,
    ) -> BillingResult<DeliveryReport> {
        let pdf = self.render_document(store, invoice, company, client).await?;

        let content = email::invoice_email(invoice, company, client);
        let recipient = Recipient::for_client(client);
        let report = self
            .delivery
            .send(store, invoice, &content, &pdf, &recipient, cancel)
            .await?;

        let updated = store
            .record_delivery_status(invoice.id, report.delivery_status())
            .await?;
        info!(
            tenant = store.tenant_id(),
            invoice = %updated.display_number(),
            status = %updated.status,
            delivery = updated.delivery_status.as_str(),
            attempts = report.attempts.len(),
            "Delivery finished"
        );

        Ok(report)
    }

    /// Render the invoice and keep the document next to the tenant's others.
    async fn render_document(
        &self,
        store: &TenantStore,
        invoice: &Invoice,
        company: &Company,
        client: &Client,
    ) -> BillingResult<Vec<u8>> {
        let document = InvoiceDocument {
            invoice: invoice.clone(),
            company: company.clone(),
            client: client.clone(),
        };
        let pdf = self.renderer.render(document).await?;

        let path = renderer::store_document(&self.documents_dir, store.tenant_id(), invoice, &pdf).await?;
        store
            .set_document_path(invoice.id, &path.to_string_lossy())
            .await?;

        Ok(pdf)
    }

    /// Send an undelivered invoice again, rendering it first if no document exists.
    pub async fn redeliver(
        &self,
        tenant_id: &str,
        invoice_id: Uuid,
        cancel: &CancellationToken,
    ) -> BillingResult<DeliveryReport> {
        let store = self.tenants.store(tenant_id).await?;
        let invoice = store.invoice(invoice_id).await?;

        if matches!(invoice.status, InvoiceStatus::Paid | InvoiceStatus::Void)
            || invoice.delivery_status == DeliveryStatus::Delivered
        {
            return Err(BillingError::NotDeliverable(invoice.display_number()));
        }
        if !self.delivery.is_configured() {
            return Err(BillingError::Config("SMTP_HOST is not set".to_string()));
        }

        let company = store.company().await?;
        let client = store.client(invoice.client_id).await?;

        let stored = match &invoice.document_path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(invoice = %invoice.display_number(), "Stored document unreadable, rendering again: {}", e);
                    None
                }
            },
            None => None,
        };
        let pdf = match stored {
            Some(bytes) => bytes,
            None => self.render_document(&store, &invoice, &company, &client).await?,
        };

        let content = email::invoice_email(&invoice, &company, &client);
        let recipient = Recipient::for_client(&client);
        let report = self
            .delivery
            .send(&store, &invoice, &content, &pdf, &recipient, cancel)
            .await?;
        store
            .record_delivery_status(invoice.id, report.delivery_status())
            .await?;

        Ok(report)
    }

    pub async fn mark_paid(&self, tenant_id: &str, invoice_id: Uuid) -> BillingResult<Invoice> {
        let store = self.tenants.store(tenant_id).await?;
        store.transition_status(invoice_id, InvoiceStatus::Paid).await
    }

    pub async fn void(&self, tenant_id: &str, invoice_id: Uuid) -> BillingResult<Invoice> {
        let store = self.tenants.store(tenant_id).await?;
        store.transition_status(invoice_id, InvoiceStatus::Void).await
    }
}
