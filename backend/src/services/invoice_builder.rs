use chrono::{Duration, NaiveDate};
use tally_shared::{Client, Company, Contract, Invoice, PeriodWindow};

use crate::config::BillingConfig;
use crate::database::{NewInvoice, TenantStore};
use crate::error::{BillingError, BillingResult};
use crate::services::rate_engine::Charge;

/// Assembles invoice aggregates from a charge and persists them.
#[derive(Debug, Clone)]
pub struct InvoiceBuilder {
    default_payment_terms_days: u32,
}

impl InvoiceBuilder {
    pub fn new(config: &BillingConfig) -> Self {
        Self {
            default_payment_terms_days: config.payment_terms_days,
        }
    }

    pub fn due_date(&self, contract: &Contract, issue_date: NaiveDate) -> NaiveDate {
        let days = contract
            .payment_terms_days
            .unwrap_or(self.default_payment_terms_days);
        issue_date + Duration::days(i64::from(days))
    }

    pub fn draft(
        &self,
        contract: &Contract,
        client: &Client,
        company: &Company,
        charge: &Charge,
        window: &PeriodWindow,
        issue_date: NaiveDate,
    ) -> BillingResult<NewInvoice> {
        if contract.currency != company.default_currency {
            return Err(BillingError::CurrencyMismatch {
                contract: contract.currency.clone(),
                company: company.default_currency.clone(),
            });
        }
        if contract.client_id != client.id {
            return Err(BillingError::InvalidData(format!(
                "contract {} belongs to client {}, not {}",
                contract.id, contract.client_id, client.id
            )));
        }

        Ok(NewInvoice {
            company_id: company.id,
            client_id: client.id,
            contract_id: Some(contract.id),
            period: Some(*window),
            currency: contract.currency.clone(),
            line_items: charge.line_items.clone(),
            issue_date,
            due_date: self.due_date(contract, issue_date),
            consumed_entry_ids: charge.consumed_entry_ids.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn build(
        &self,
        store: &TenantStore,
        contract: &Contract,
        client: &Client,
        company: &Company,
        charge: &Charge,
        window: &PeriodWindow,
        issue_date: NaiveDate,
    ) -> BillingResult<Invoice> {
        let draft = self.draft(contract, client, company, charge, window, issue_date)?;
        let invoice = store.insert_invoice(&draft).await?;

        tracing::info!(
            tenant = store.tenant_id(),
            contract = %contract.id,
            period = %window,
            "Built invoice {} for {} {}",
            invoice.display_number(),
            invoice.total(),
            invoice.currency
        );

        Ok(invoice)
    }
}
