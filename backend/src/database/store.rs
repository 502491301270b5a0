use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tally_shared::{
    Cadence, Client, Company, Contract, Currency, DeliveryAttempt, DeliveryStatus, Invoice,
    InvoiceStatus, LineItem, PeriodWindow, PricingModel, TimeEntry,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::services::delivery::DeliveryLog;

/// Handle on one tenant's database.
///
/// Clones share the pool and the writer lock, so every write transaction for
/// a tenant runs one at a time regardless of which clone issued it.
#[derive(Clone)]
pub struct TenantStore {
    tenant_id: Arc<str>,
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

/// Everything needed to persist a new invoice in one transaction.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub company_id: Uuid,
    pub client_id: Uuid,
    pub contract_id: Option<Uuid>,
    pub period: Option<PeriodWindow>,
    pub currency: Currency,
    pub line_items: Vec<LineItem>,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub consumed_entry_ids: Vec<Uuid>,
}

#[derive(Debug, FromRow)]
struct CompanyRow {
    id: Uuid,
    name: String,
    email: String,
    default_currency: String,
}

#[derive(Debug, FromRow)]
struct ClientRow {
    id: Uuid,
    name: String,
    email: Option<String>,
}

#[derive(Debug, FromRow)]
struct ContractRow {
    id: Uuid,
    client_id: Uuid,
    name: String,
    pricing_model: String,
    pricing_amount: String,
    retainer_cadence: Option<String>,
    retainer_cadence_days: Option<i64>,
    currency: String,
    cadence: String,
    cadence_days: Option<i64>,
    billing_start: NaiveDate,
    always_bill: bool,
    payment_terms_days: Option<i64>,
    active: bool,
}

#[derive(Debug, FromRow)]
struct TimeEntryRow {
    id: Uuid,
    contract_id: Uuid,
    description: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_secs: Option<i64>,
    billable: bool,
    invoice_id: Option<Uuid>,
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    id: Uuid,
    company_id: Uuid,
    client_id: Uuid,
    contract_id: Option<Uuid>,
    number: i64,
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
    currency: String,
    status: String,
    delivery_status: String,
    issue_date: NaiveDate,
    due_date: NaiveDate,
    document_path: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct LineItemRow {
    description: String,
    quantity: String,
    unit_rate: String,
    amount: String,
}

#[derive(Debug, FromRow)]
struct DeliveryAttemptRow {
    id: Uuid,
    invoice_id: Uuid,
    recipient: String,
    attempted_at: DateTime<Utc>,
    outcome: String,
    error_detail: Option<String>,
    attempt: i64,
    exhausted: bool,
}

const CONTRACT_COLUMNS: &str = "id, client_id, name, pricing_model, pricing_amount, retainer_cadence, \
     retainer_cadence_days, currency, cadence, cadence_days, billing_start, always_bill, \
     payment_terms_days, active";

const INVOICE_COLUMNS: &str = "id, company_id, client_id, contract_id, number, period_start, period_end, \
     currency, status, delivery_status, issue_date, due_date, document_path, created_at";

fn parse_decimal(field: &str, value: &str) -> BillingResult<Decimal> {
    Decimal::from_str(value).map_err(|_| BillingError::InvalidData(format!("{field} = {value:?}")))
}

impl TryFrom<CompanyRow> for Company {
    type Error = BillingError;

    fn try_from(row: CompanyRow) -> Result<Self, Self::Error> {
        Ok(Company {
            id: row.id,
            name: row.name,
            email: row.email,
            default_currency: Currency::new(&row.default_currency)?,
        })
    }
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Client {
            id: row.id,
            name: row.name,
            email: row.email.filter(|email| !email.trim().is_empty()),
        }
    }
}

impl TryFrom<ContractRow> for Contract {
    type Error = BillingError;

    fn try_from(row: ContractRow) -> Result<Self, Self::Error> {
        let figure = parse_decimal("contracts.pricing_amount", &row.pricing_amount)?;
        let pricing = match row.pricing_model.as_str() {
            "hourly" => PricingModel::Hourly { rate: figure },
            "fixed" => PricingModel::Fixed { price: figure },
            "retainer" => {
                let kind = row.retainer_cadence.as_deref().unwrap_or("none");
                PricingModel::Retainer {
                    amount: figure,
                    cadence: Cadence::from_parts(kind, row.retainer_cadence_days)?,
                }
            }
            other => {
                return Err(BillingError::InvalidData(format!(
                    "contracts.pricing_model = {other:?}"
                )));
            }
        };

        let payment_terms_days = row
            .payment_terms_days
            .map(|days| {
                u32::try_from(days).map_err(|_| {
                    BillingError::InvalidData(format!("contracts.payment_terms_days = {days}"))
                })
            })
            .transpose()?;

        Ok(Contract {
            id: row.id,
            client_id: row.client_id,
            name: row.name,
            pricing,
            currency: Currency::new(&row.currency)?,
            cadence: Cadence::from_parts(&row.cadence, row.cadence_days)?,
            billing_start: row.billing_start,
            always_bill: row.always_bill,
            payment_terms_days,
            active: row.active,
        })
    }
}

impl From<TimeEntryRow> for TimeEntry {
    fn from(row: TimeEntryRow) -> Self {
        TimeEntry {
            id: row.id,
            contract_id: row.contract_id,
            description: row.description,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_secs: row.duration_secs,
            billable: row.billable,
            invoice_id: row.invoice_id,
        }
    }
}

impl TryFrom<LineItemRow> for LineItem {
    type Error = BillingError;

    fn try_from(row: LineItemRow) -> Result<Self, Self::Error> {
        Ok(LineItem {
            description: row.description,
            quantity: parse_decimal("invoice_line_items.quantity", &row.quantity)?,
            unit_rate: parse_decimal("invoice_line_items.unit_rate", &row.unit_rate)?,
            amount: parse_decimal("invoice_line_items.amount", &row.amount)?,
        })
    }
}

impl InvoiceRow {
    fn into_invoice(self, line_items: Vec<LineItem>) -> BillingResult<Invoice> {
        let period = match (self.period_start, self.period_end) {
            (Some(start), Some(end)) => Some(PeriodWindow::new(start, end)?),
            _ => None,
        };

        Ok(Invoice {
            id: self.id,
            company_id: self.company_id,
            client_id: self.client_id,
            contract_id: self.contract_id,
            number: self.number,
            period,
            currency: Currency::new(&self.currency)?,
            line_items,
            status: self.status.parse()?,
            delivery_status: self.delivery_status.parse()?,
            issue_date: self.issue_date,
            due_date: self.due_date,
            document_path: self.document_path,
            created_at: self.created_at,
        })
    }
}

impl TryFrom<DeliveryAttemptRow> for DeliveryAttempt {
    type Error = BillingError;

    fn try_from(row: DeliveryAttemptRow) -> Result<Self, Self::Error> {
        Ok(DeliveryAttempt {
            id: row.id,
            invoice_id: row.invoice_id,
            recipient: row.recipient,
            attempted_at: row.attempted_at,
            outcome: row.outcome.parse()?,
            error_detail: row.error_detail,
            attempt: u32::try_from(row.attempt).map_err(|_| {
                BillingError::InvalidData(format!("delivery_attempts.attempt = {}", row.attempt))
            })?,
            exhausted: row.exhausted,
        })
    }
}

impl TenantStore {
    pub fn new(tenant_id: &str, pool: SqlitePool) -> Self {
        Self {
            tenant_id: Arc::from(tenant_id),
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn shares_writer_with(&self, other: &TenantStore) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }

    /// The tenant's own company. Each tenant database holds exactly one.
    pub async fn company(&self) -> BillingResult<Company> {
        let row = sqlx::query_as::<_, CompanyRow>(
            "SELECT id, name, email, default_currency FROM companies ORDER BY created_at LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound("Company".to_string()))?;

        row.try_into()
    }

    pub async fn client(&self, client_id: Uuid) -> BillingResult<Client> {
        let row = sqlx::query_as::<_, ClientRow>("SELECT id, name, email FROM clients WHERE id = ?")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Client {client_id}")))?;

        Ok(row.into())
    }

    pub async fn contract(&self, contract_id: Uuid) -> BillingResult<Contract> {
        let row = sqlx::query_as::<_, ContractRow>(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE id = ?"
        ))
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Contract {contract_id}")))?;

        row.try_into()
    }

    /// Active contracts with a recurrence cadence.
    ///
    /// Rows that fail to decode are skipped with a warning so one corrupt
    /// contract cannot stall the rest of the tenant.
    pub async fn list_active_recurring_contracts(&self) -> BillingResult<Vec<Contract>> {
        let rows = sqlx::query_as::<_, ContractRow>(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts
             WHERE active = 1 AND cadence <> 'none'
             ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut contracts = Vec::with_capacity(rows.len());
        for row in rows {
            let contract_id = row.id;
            match Contract::try_from(row) {
                Ok(contract) => contracts.push(contract),
                Err(e) => tracing::warn!(
                    tenant = %self.tenant_id,
                    contract = %contract_id,
                    "Skipping contract with invalid data: {}",
                    e
                ),
            }
        }

        Ok(contracts)
    }

    /// Billable, not yet invoiced entries of a contract that start inside the window.
    pub async fn list_uninvoiced_billable_entries(
        &self,
        contract_id: Uuid,
        window: &PeriodWindow,
    ) -> BillingResult<Vec<TimeEntry>> {
        let rows = sqlx::query_as::<_, TimeEntryRow>(
            "SELECT id, contract_id, description, started_at, ended_at, duration_secs, billable, invoice_id
             FROM time_entries
             WHERE contract_id = ? AND billable = 1 AND invoice_id IS NULL
             ORDER BY started_at, id",
        )
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(TimeEntry::from)
            .filter(|entry| window.contains(entry.started_at))
            .collect())
    }

    /// End of the latest live invoice period or skipped window for a contract.
    pub async fn latest_period_end(&self, contract_id: Uuid) -> BillingResult<Option<NaiveDate>> {
        let end: Option<NaiveDate> = sqlx::query_scalar(
            "SELECT period_end FROM (
                 SELECT period_end FROM invoices
                 WHERE contract_id = ? AND status <> 'void' AND period_end IS NOT NULL
                 UNION ALL
                 SELECT period_end FROM skipped_periods WHERE contract_id = ?
             )
             ORDER BY period_end DESC
             LIMIT 1",
        )
        .bind(contract_id)
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(end)
    }

    /// Remember that a window closed with nothing to bill.
    pub async fn record_skipped_period(&self, contract_id: Uuid, window: &PeriodWindow) -> BillingResult<()> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            "INSERT OR IGNORE INTO skipped_periods (contract_id, period_start, period_end, recorded_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(contract_id)
        .bind(window.start)
        .bind(window.end)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn invoice_for_window(
        &self,
        contract_id: Uuid,
        window: &PeriodWindow,
    ) -> BillingResult<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE contract_id = ? AND period_start = ? AND period_end = ? AND status <> 'void'"
        ))
        .bind(contract_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.with_line_items(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Invoice {invoice_id}")))?;

        self.with_line_items(row).await
    }

    pub async fn invoices_for_contract(&self, contract_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE contract_id = ? ORDER BY number"
        ))
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;

        let mut invoices = Vec::with_capacity(rows.len());
        for row in rows {
            invoices.push(self.with_line_items(row).await?);
        }
        Ok(invoices)
    }

    async fn with_line_items(&self, row: InvoiceRow) -> BillingResult<Invoice> {
        let items = sqlx::query_as::<_, LineItemRow>(
            "SELECT description, quantity, unit_rate, amount FROM invoice_line_items
             WHERE invoice_id = ? ORDER BY line_number",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(LineItem::try_from)
        .collect::<BillingResult<Vec<_>>>()?;

        row.into_invoice(items)
    }

    /// Persist a new invoice: number allocation, header, line items and entry
    /// consumption commit together or not at all.
    pub async fn insert_invoice(&self, new: &NewInvoice) -> BillingResult<Invoice> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let number: i64 = sqlx::query_scalar(
            "INSERT INTO invoice_counters (company_id, last_number) VALUES (?, 1)
             ON CONFLICT(company_id) DO UPDATE SET last_number = last_number + 1
             RETURNING last_number",
        )
        .bind(new.company_id)
        .fetch_one(&mut *tx)
        .await?;

        let invoice = Invoice {
            id: Uuid::new_v4(),
            company_id: new.company_id,
            client_id: new.client_id,
            contract_id: new.contract_id,
            number,
            period: new.period,
            currency: new.currency.clone(),
            line_items: new.line_items.clone(),
            status: InvoiceStatus::Draft,
            delivery_status: DeliveryStatus::Pending,
            issue_date: new.issue_date,
            due_date: new.due_date,
            document_path: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO invoices (
                id, company_id, client_id, contract_id, number, period_start, period_end,
                currency, status, delivery_status, issue_date, due_date, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(invoice.id)
        .bind(invoice.company_id)
        .bind(invoice.client_id)
        .bind(invoice.contract_id)
        .bind(invoice.number)
        .bind(invoice.period.map(|period| period.start))
        .bind(invoice.period.map(|period| period.end))
        .bind(invoice.currency.code())
        .bind(invoice.status.as_str())
        .bind(invoice.delivery_status.as_str())
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(invoice.created_at)
        .execute(&mut *tx)
        .await?;

        for (index, item) in invoice.line_items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO invoice_line_items (id, invoice_id, line_number, description, quantity, unit_rate, amount)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(invoice.id)
            .bind(index as i64 + 1)
            .bind(&item.description)
            .bind(item.quantity.to_string())
            .bind(item.unit_rate.to_string())
            .bind(item.amount.to_string())
            .execute(&mut *tx)
            .await?;
        }

        for entry_id in &new.consumed_entry_ids {
            let result = sqlx::query(
                "UPDATE time_entries SET invoice_id = ? WHERE id = ? AND invoice_id IS NULL",
            )
            .bind(invoice.id)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                // Dropping the transaction rolls back the number and the header.
                return Err(BillingError::EntryAlreadyInvoiced(*entry_id));
            }
        }

        tx.commit().await?;

        tracing::debug!(
            tenant = %self.tenant_id,
            invoice = %invoice.id,
            number = %invoice.display_number(),
            entries = new.consumed_entry_ids.len(),
            "Invoice persisted"
        );

        Ok(invoice)
    }

    /// Claim the oldest draft of a contract that has never finished a delivery.
    ///
    /// Drafts claimed by another run are left alone until the claim lapses.
    pub async fn claim_pending_invoice(
        &self,
        contract_id: Uuid,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> BillingResult<Option<Invoice>> {
        let claimed: Option<Uuid> = {
            let _guard = self.writer.lock().await;
            sqlx::query_scalar(
                "UPDATE invoices SET delivery_claimed_until = ?
                 WHERE id = (
                     SELECT id FROM invoices
                     WHERE contract_id = ? AND status = 'draft' AND delivery_status = 'pending'
                       AND (delivery_claimed_until IS NULL OR delivery_claimed_until <= ?)
                     ORDER BY number
                     LIMIT 1
                 )
                 RETURNING id",
            )
            .bind(claim_until)
            .bind(contract_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
        };

        match claimed {
            Some(invoice_id) => Ok(Some(self.invoice(invoice_id).await?)),
            None => Ok(None),
        }
    }

    /// Claim a freshly built draft for delivery. False when another run holds it
    /// or it is no longer awaiting delivery.
    pub async fn claim_delivery(
        &self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query(
            "UPDATE invoices SET delivery_claimed_until = ?
             WHERE id = ? AND status = 'draft' AND delivery_status = 'pending'
               AND (delivery_claimed_until IS NULL OR delivery_claimed_until <= ?)",
        )
        .bind(claim_until)
        .bind(invoice_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn release_delivery(&self, invoice_id: Uuid) -> BillingResult<()> {
        let _guard = self.writer.lock().await;
        sqlx::query("UPDATE invoices SET delivery_claimed_until = NULL WHERE id = ?")
            .bind(invoice_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_document_path(&self, invoice_id: Uuid, path: &str) -> BillingResult<()> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query("UPDATE invoices SET document_path = ? WHERE id = ?")
            .bind(path)
            .bind(invoice_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Invoice {invoice_id}")));
        }
        Ok(())
    }

    /// Record where delivery ended up. A delivered draft becomes sent.
    pub async fn record_delivery_status(
        &self,
        invoice_id: Uuid,
        delivery_status: DeliveryStatus,
    ) -> BillingResult<Invoice> {
        {
            let _guard = self.writer.lock().await;
            let result = sqlx::query(
                "UPDATE invoices
                 SET delivery_status = ?,
                     status = CASE WHEN ? = 'delivered' AND status = 'draft' THEN 'sent' ELSE status END,
                     delivery_claimed_until = NULL
                 WHERE id = ?",
            )
            .bind(delivery_status.as_str())
            .bind(delivery_status.as_str())
            .bind(invoice_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(BillingError::NotFound(format!("Invoice {invoice_id}")));
            }
        }

        self.invoice(invoice_id).await
    }

    /// Move an invoice to a new billing status if the lifecycle allows it.
    pub async fn transition_status(
        &self,
        invoice_id: Uuid,
        next: InvoiceStatus,
    ) -> BillingResult<Invoice> {
        {
            let _guard = self.writer.lock().await;
            let current: String = sqlx::query_scalar("SELECT status FROM invoices WHERE id = ?")
                .bind(invoice_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("Invoice {invoice_id}")))?;

            let current: InvoiceStatus = current.parse()?;
            current.transition(next)?;

            let result = sqlx::query("UPDATE invoices SET status = ? WHERE id = ? AND status = ?")
                .bind(next.as_str())
                .bind(invoice_id)
                .bind(current.as_str())
                .execute(&self.pool)
                .await?;

            if result.rows_affected() != 1 {
                return Err(tally_shared::DomainError::IllegalTransition { from: current, to: next }.into());
            }
        }

        self.invoice(invoice_id).await
    }

    /// Flip sent invoices whose due date has passed to overdue.
    pub async fn mark_overdue(&self, today: NaiveDate) -> BillingResult<u64> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query("UPDATE invoices SET status = 'overdue' WHERE status = 'sent' AND due_date < ?")
            .bind(today)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn append_delivery_attempt(&self, attempt: &DeliveryAttempt) -> BillingResult<()> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            "INSERT INTO delivery_attempts (id, invoice_id, recipient, attempted_at, outcome, error_detail, attempt, exhausted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.id)
        .bind(attempt.invoice_id)
        .bind(&attempt.recipient)
        .bind(attempt.attempted_at)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.error_detail)
        .bind(i64::from(attempt.attempt))
        .bind(attempt.exhausted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delivery_attempts(&self, invoice_id: Uuid) -> BillingResult<Vec<DeliveryAttempt>> {
        sqlx::query_as::<_, DeliveryAttemptRow>(
            "SELECT id, invoice_id, recipient, attempted_at, outcome, error_detail, attempt, exhausted
             FROM delivery_attempts WHERE invoice_id = ? ORDER BY attempted_at, attempt",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(DeliveryAttempt::try_from)
        .collect()
    }
}

#[async_trait]
impl DeliveryLog for TenantStore {
    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> BillingResult<()> {
        self.append_delivery_attempt(attempt).await
    }
}
