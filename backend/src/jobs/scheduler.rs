// Job Scheduler - Daily driver for the recurring billing cycle

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use super::recurring_billing::{BillingJobResult, RecurringBillingJob};
use crate::error::BillingError;

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),
}

pub type JobResult<T> = Result<T, JobError>;

/// Fires once a day at a fixed UTC time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTrigger {
    pub at: NaiveTime,
}

impl DailyTrigger {
    pub fn new(at: NaiveTime) -> Self {
        Self { at }
    }

    /// First firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.at).and_utc();
        if today > now {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Completed,
    Failed,
    PartialFailure,
}

pub struct JobScheduler {
    billing: Arc<RecurringBillingJob>,
    trigger: DailyTrigger,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

impl JobScheduler {
    pub fn new(billing: Arc<RecurringBillingJob>, trigger: DailyTrigger) -> Self {
        Self {
            billing,
            trigger,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn billing(&self) -> &RecurringBillingJob {
        &self.billing
    }

    /// Sleep until each trigger, run a cycle, repeat until cancelled.
    pub async fn start(&self, cancel: CancellationToken) -> JobResult<()> {
        info!("Starting billing scheduler, daily at {} UTC", self.trigger.at);

        loop {
            let now = Utc::now();
            let next = self.trigger.next_after(now);
            let wait = (next - now).to_std().unwrap_or_default();
            info!("Next billing cycle at {}", next);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.run_once(&cancel).await {
                error!("Recurring billing failed: {}", e);
            }
        }

        info!("Billing scheduler stopped");
        Ok(())
    }

    pub async fn run_once(&self, cancel: &CancellationToken) -> JobResult<BillingJobResult> {
        self.run_cycle(Utc::now(), cancel).await
    }

    /// Run one cycle as of `now` and keep its execution log.
    pub async fn run_cycle(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> JobResult<BillingJobResult> {
        let started_at = Utc::now();
        info!("Running recurring billing job");

        let outcome = self.billing.run(now, cancel).await;
        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds();

        let log = match &outcome {
            Ok(result) => {
                info!(
                    "Recurring billing completed: {} contracts checked, {} invoices generated, {} resumed, {} delivered, {} errors",
                    result.contracts_checked,
                    result.invoices_generated,
                    result.invoices_resumed,
                    result.invoices_delivered,
                    result.errors.len()
                );
                JobExecutionLog {
                    id: Uuid::new_v4(),
                    job_name: "Recurring Billing".to_string(),
                    started_at,
                    completed_at: Some(completed_at),
                    status: if result.errors.is_empty() { JobStatus::Completed } else { JobStatus::PartialFailure },
                    items_processed: result.contracts_checked,
                    errors: result.errors.clone(),
                    duration_ms: Some(duration),
                }
            }
            Err(e) => JobExecutionLog {
                id: Uuid::new_v4(),
                job_name: "Recurring Billing".to_string(),
                started_at,
                completed_at: Some(completed_at),
                status: JobStatus::Failed,
                items_processed: 0,
                errors: vec![e.to_string()],
                duration_ms: Some(duration),
            },
        };

        let mut logs = self.execution_logs.write().await;
        logs.push(log);
        // Keep only the most recent logs
        if logs.len() > MAX_EXECUTION_LOGS {
            let excess = logs.len() - MAX_EXECUTION_LOGS;
            logs.drain(..excess);
        }
        drop(logs);

        outcome
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }
}
