use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use tally_shared::{Cadence, Contract, PeriodWindow};

use crate::config::BillingConfig;
use crate::database::TenantStore;
use crate::error::BillingResult;

/// Decides which billing window a contract is due for.
///
/// The invoice ledger is the only state: the next window starts where the
/// latest live invoice period ended.
#[derive(Debug, Clone)]
pub struct RecurrenceEngine {
    trigger_offset: Duration,
}

impl RecurrenceEngine {
    pub fn new(config: &BillingConfig) -> Self {
        Self {
            trigger_offset: Duration::days(i64::from(config.trigger_offset_days)),
        }
    }

    /// Window following `last_end`, or the aligned window containing the
    /// contract's billing start when nothing has been invoiced yet.
    pub fn next_window(&self, contract: &Contract, last_end: Option<NaiveDate>) -> Option<PeriodWindow> {
        if !contract.is_recurring() {
            return None;
        }

        let start = match last_end {
            Some(end) => end,
            None => aligned_start(contract.cadence, contract.billing_start)?,
        };
        let end = match contract.cadence {
            Cadence::None => return None,
            Cadence::Weekly => start.checked_add_signed(Duration::days(7))?,
            Cadence::Monthly => first_of_month(start)?.checked_add_months(Months::new(1))?,
            Cadence::EveryDays(days) => start.checked_add_signed(Duration::days(i64::from(days)))?,
        };

        PeriodWindow::new(start, end).ok()
    }

    /// Instant from which the window may be generated.
    pub fn trigger_time(&self, window: &PeriodWindow) -> DateTime<Utc> {
        window.end_instant() + self.trigger_offset
    }

    pub fn next_due(
        &self,
        contract: &Contract,
        last_end: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Option<PeriodWindow> {
        self.next_window(contract, last_end)
            .filter(|window| now >= self.trigger_time(window))
    }

    /// The window to generate now, if any, judged against the tenant's ledger.
    pub async fn due_window(
        &self,
        store: &TenantStore,
        contract: &Contract,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<PeriodWindow>> {
        let last_end = store.latest_period_end(contract.id).await?;
        let Some(window) = self.next_due(contract, last_end, now) else {
            return Ok(None);
        };

        if store.invoice_for_window(contract.id, &window).await?.is_some() {
            return Ok(None);
        }

        Ok(Some(window))
    }
}

fn first_of_month(date: NaiveDate) -> Option<NaiveDate> {
    date.with_day(1)
}

fn aligned_start(cadence: Cadence, anchor: NaiveDate) -> Option<NaiveDate> {
    match cadence {
        Cadence::None => None,
        Cadence::Weekly => {
            let offset = i64::from(anchor.weekday().num_days_from_monday());
            anchor.checked_sub_signed(Duration::days(offset))
        }
        Cadence::Monthly => first_of_month(anchor),
        Cadence::EveryDays(_) => Some(anchor),
    }
}
