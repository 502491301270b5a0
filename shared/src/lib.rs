use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),
    #[error("Invalid cadence: {0}")]
    InvalidCadence(String),
    #[error("Invalid pricing model: {0}")]
    InvalidPricing(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid period window: {start} is not before {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },
    #[error("Illegal invoice status transition from {from} to {to}")]
    IllegalTransition { from: InvoiceStatus, to: InvoiceStatus },
}

/// ISO 4217 currency code, stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, DomainError> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::InvalidCurrency(code));
        }
        Ok(Self(code))
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Number of decimal places in the currency's minor unit.
    pub fn minor_units(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "UGX" | "XAF" | "XOF" => 0,
            "BHD" | "JOD" | "KWD" | "OMR" | "TND" | "LYD" | "IQD" => 3,
            _ => 2,
        }
    }

    /// Round half-up to the minor unit.
    pub fn round(&self, amount: Decimal) -> Decimal {
        let mut rounded =
            amount.round_dp_with_strategy(self.minor_units(), RoundingStrategy::MidpointAwayFromZero);
        rounded.rescale(self.minor_units());
        rounded
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

/// How often a contract produces a billing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "days")]
pub enum Cadence {
    None,
    Weekly,
    Monthly,
    EveryDays(u32),
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::None => "none",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
            Cadence::EveryDays(_) => "custom",
        }
    }

    pub fn custom_days(&self) -> Option<u32> {
        match self {
            Cadence::EveryDays(days) => Some(*days),
            _ => None,
        }
    }

    /// Rebuild from the `(kind, days)` column pair used in storage.
    pub fn from_parts(kind: &str, days: Option<i64>) -> Result<Self, DomainError> {
        match (kind, days) {
            ("none", _) => Ok(Cadence::None),
            ("weekly", _) => Ok(Cadence::Weekly),
            ("monthly", _) => Ok(Cadence::Monthly),
            ("custom", Some(days)) if days > 0 && days <= u32::MAX as i64 => {
                Ok(Cadence::EveryDays(days as u32))
            }
            _ => Err(DomainError::InvalidCadence(format!("{kind} ({days:?})"))),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Cadence::None)
    }

    pub fn label(&self) -> String {
        match self {
            Cadence::None => "One-off".to_string(),
            Cadence::Weekly => "Weekly".to_string(),
            Cadence::Monthly => "Monthly".to_string(),
            Cadence::EveryDays(days) => format!("Every {days} days"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "model")]
pub enum PricingModel {
    Hourly { rate: Decimal },
    Fixed { price: Decimal },
    Retainer { amount: Decimal, cadence: Cadence },
}

impl PricingModel {
    pub fn kind(&self) -> &'static str {
        match self {
            PricingModel::Hourly { .. } => "hourly",
            PricingModel::Fixed { .. } => "fixed",
            PricingModel::Retainer { .. } => "retainer",
        }
    }

    /// The single money figure of the model: rate, price or retainer amount.
    pub fn figure(&self) -> Decimal {
        match self {
            PricingModel::Hourly { rate } => *rate,
            PricingModel::Fixed { price } => *price,
            PricingModel::Retainer { amount, .. } => *amount,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: Uuid,
    pub client_id: Uuid,
    pub name: String,
    pub pricing: PricingModel,
    pub currency: Currency,
    pub cadence: Cadence,
    /// Anchor for the first window and for custom-day windows.
    pub billing_start: NaiveDate,
    /// Bill even when an hourly period has no tracked time.
    pub always_bill: bool,
    pub payment_terms_days: Option<u32>,
    pub active: bool,
}

impl Contract {
    pub fn is_recurring(&self) -> bool {
        self.active && self.cadence.is_recurring()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub billable: bool,
    pub invoice_id: Option<Uuid>,
}

impl TimeEntry {
    /// Explicit duration wins over start/end; a running timer counts as zero.
    pub fn duration(&self) -> Duration {
        if let Some(secs) = self.duration_secs {
            return Duration::seconds(secs.max(0));
        }
        match self.ended_at {
            Some(ended_at) if ended_at > self.started_at => ended_at - self.started_at,
            _ => Duration::zero(),
        }
    }

    pub fn is_invoiced(&self) -> bool {
        self.invoice_id.is_some()
    }
}

/// Half-open date range `[start, end)` covered by a recurring invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl PeriodWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DomainError> {
        if start >= end {
            return Err(DomainError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start_instant() && at < self.end_instant()
    }

    pub fn start_instant(&self) -> DateTime<Utc> {
        self.start.and_time(NaiveTime::MIN).and_utc()
    }

    pub fn end_instant(&self) -> DateTime<Utc> {
        self.end.and_time(NaiveTime::MIN).and_utc()
    }

    /// Last day inside the window, for display.
    pub fn last_day(&self) -> NaiveDate {
        self.end.pred_opt().unwrap_or(self.start)
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn describe(&self) -> String {
        format!("{} - {}", self.start.format("%b %d, %Y"), self.last_day().format("%b %d, %Y"))
    }
}

impl fmt::Display for PeriodWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Sent) | (Draft, Void) | (Sent, Paid) | (Sent, Overdue) | (Sent, Void)
                | (Overdue, Paid) | (Overdue, Void)
        )
    }

    pub fn transition(self, next: InvoiceStatus) -> Result<InvoiceStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::IllegalTransition { from: self, to: next })
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "sent" => Ok(InvoiceStatus::Sent),
            "paid" => Ok(InvoiceStatus::Paid),
            "overdue" => Ok(InvoiceStatus::Overdue),
            "void" => Ok(InvoiceStatus::Void),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// Where an invoice stands with respect to email delivery, independent of
/// its billing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Undelivered, // transient retries exhausted, needs a manual resend
    Failed,      // permanent failure
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Undelivered => "undelivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "undelivered" => Ok(DeliveryStatus::Undelivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_rate: Decimal,
    pub amount: Decimal,
}

impl LineItem {
    /// Time-based item; the amount is rounded once from the exact quantity.
    pub fn hourly(description: impl Into<String>, hours: Decimal, rate: Decimal, currency: &Currency) -> Self {
        Self {
            description: description.into(),
            quantity: hours,
            unit_rate: rate,
            amount: currency.round(hours * rate),
        }
    }

    pub fn flat(description: impl Into<String>, amount: Decimal, currency: &Currency) -> Self {
        Self {
            description: description.into(),
            quantity: Decimal::ONE,
            unit_rate: amount,
            amount: currency.round(amount),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub company_id: Uuid,
    pub client_id: Uuid,
    pub contract_id: Option<Uuid>,
    pub number: i64,
    pub period: Option<PeriodWindow>,
    pub currency: Currency,
    pub line_items: Vec<LineItem>,
    pub status: InvoiceStatus,
    pub delivery_status: DeliveryStatus,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub document_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    pub fn display_number(&self) -> String {
        format_invoice_number(self.number)
    }

    pub fn total(&self) -> Decimal {
        self.line_items.iter().map(|item| item.amount).sum()
    }

    pub fn attachment_filename(&self) -> String {
        format!("{}.pdf", self.display_number())
    }
}

pub fn format_invoice_number(number: i64) -> String {
    format!("INV-{:06}", number)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::TransientFailure => "transient_failure",
            DeliveryOutcome::PermanentFailure => "permanent_failure",
        }
    }
}

impl FromStr for DeliveryOutcome {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(DeliveryOutcome::Success),
            "transient_failure" => Ok(DeliveryOutcome::TransientFailure),
            "permanent_failure" => Ok(DeliveryOutcome::PermanentFailure),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// One send try. Rows are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub recipient: String,
    pub attempted_at: DateTime<Utc>,
    pub outcome: DeliveryOutcome,
    pub error_detail: Option<String>,
    pub attempt: u32,
    /// Set on the last transient failure once the retry budget is spent.
    pub exhausted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub default_currency: Currency,
}
