use rust_decimal::Decimal;
use tally_shared::{Contract, LineItem, PeriodWindow, PricingModel, TimeEntry};
use thiserror::Error;
use uuid::Uuid;

const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateError {
    #[error("{model} contract {contract} has a non-positive figure: {value}")]
    NonPositiveFigure {
        contract: Uuid,
        model: &'static str,
        value: Decimal,
    },
    #[error("Tracked time on contract {0} overflows the billable total")]
    Overflow(Uuid),
}

/// What a contract owes for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub amount: Decimal,
    pub line_items: Vec<LineItem>,
    /// Entries the invoice will claim, including audit-only claims on flat contracts.
    pub consumed_entry_ids: Vec<Uuid>,
    pub billed_hours: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateOutcome {
    Billable(Charge),
    NothingToBill,
}

/// Turns a contract's pricing model and tracked time into a charge.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateEngine;

impl RateEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn compute_amount(
        &self,
        contract: &Contract,
        window: &PeriodWindow,
        entries: &[TimeEntry],
    ) -> Result<RateOutcome, RateError> {
        let figure = contract.pricing.figure();
        if figure <= Decimal::ZERO {
            return Err(RateError::NonPositiveFigure {
                contract: contract.id,
                model: contract.pricing.kind(),
                value: figure,
            });
        }

        let eligible: Vec<&TimeEntry> = entries
            .iter()
            .filter(|entry| {
                entry.contract_id == contract.id
                    && entry.billable
                    && !entry.is_invoiced()
                    && window.contains(entry.started_at)
            })
            .collect();

        let total_secs = eligible
            .iter()
            .try_fold(0i64, |total, entry| total.checked_add(entry.duration().num_seconds()))
            .ok_or(RateError::Overflow(contract.id))?;
        let hours = Decimal::from(total_secs) / Decimal::from(SECONDS_PER_HOUR);
        let consumed_entry_ids: Vec<Uuid> = eligible.iter().map(|entry| entry.id).collect();

        let line_item = match &contract.pricing {
            PricingModel::Hourly { rate } => {
                if total_secs == 0 && !contract.always_bill {
                    return Ok(RateOutcome::NothingToBill);
                }
                LineItem::hourly(
                    format!("{} ({})", contract.name, window.describe()),
                    hours.normalize(),
                    *rate,
                    &contract.currency,
                )
            }
            PricingModel::Fixed { price } => LineItem::flat(
                format!("{} ({})", contract.name, window.describe()),
                *price,
                &contract.currency,
            ),
            PricingModel::Retainer { amount, cadence } => LineItem::flat(
                format!("{} retainer: {} ({})", cadence.label(), contract.name, window.describe()),
                *amount,
                &contract.currency,
            ),
        };

        Ok(RateOutcome::Billable(Charge {
            amount: line_item.amount,
            line_items: vec![line_item],
            consumed_entry_ids,
            billed_hours: hours.normalize(),
        }))
    }
}
