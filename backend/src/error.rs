//! Error taxonomy for the billing engine.
//!
//! Every failure that can end one contract's processing is a `BillingError`.
//! The scheduler logs it with tenant/contract/window context and moves on.

use tally_shared::{Currency, DomainError};
use thiserror::Error;
use uuid::Uuid;

use crate::services::rate_engine::RateError;
use crate::services::renderer::RenderError;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Currency mismatch: contract bills in {contract}, company default is {company}")]
    CurrencyMismatch { contract: Currency, company: Currency },
    #[error("An invoice already exists for this contract period")]
    DuplicatePeriod,
    #[error("Time entry {0} is already attached to an invoice")]
    EntryAlreadyInvoiced(Uuid),
    #[error("Invoice {0} cannot be delivered in its current state")]
    NotDeliverable(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invalid stored value: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Rate(#[from] RateError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("Document storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl BillingError {
    /// Stable code used in logs and cycle reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            Self::DuplicatePeriod => "DUPLICATE_PERIOD",
            Self::EntryAlreadyInvoiced(_) => "ENTRY_ALREADY_INVOICED",
            Self::NotDeliverable(_) => "NOT_DELIVERABLE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidData(_) => "INVALID_DATA",
            Self::Domain(_) => "DOMAIN_ERROR",
            Self::Rate(_) => "RATE_ERROR",
            Self::Render(_) => "RENDER_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Errors an operator fixes by correcting settings or contract data.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::CurrencyMismatch { .. } | Self::Rate(_) | Self::InvalidData(_)
        )
    }

    /// Another run already produced this period's invoice.
    pub fn is_idempotency_conflict(&self) -> bool {
        matches!(self, Self::DuplicatePeriod)
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() && db.message().contains("period_start") {
                return Self::DuplicatePeriod;
            }
        }
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Record".to_string()),
            other => Self::Database(other),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
