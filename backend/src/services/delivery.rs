use async_trait::async_trait;
use chrono::Utc;
use lettre::message::Mailbox;
use std::sync::Arc;
use std::time::Duration;
use tally_shared::{DeliveryAttempt, DeliveryOutcome, DeliveryStatus, Invoice};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::error::{BillingError, BillingResult};
use crate::services::email::{self, EmailContent, MailError, MailTransport, Recipient};

/// Append-only sink for delivery attempts.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> BillingResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SmtpConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Wait after the given failed attempt: `base * 2^(attempt - 1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Every attempt made for one send, oldest first.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub attempts: Vec<DeliveryAttempt>,
}

impl DeliveryReport {
    pub fn final_attempt(&self) -> Option<&DeliveryAttempt> {
        self.attempts.last()
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        self.final_attempt()
            .map(delivery_status_for)
            .unwrap_or(DeliveryStatus::Pending)
    }
}

pub fn delivery_status_for(attempt: &DeliveryAttempt) -> DeliveryStatus {
    match attempt.outcome {
        DeliveryOutcome::Success => DeliveryStatus::Delivered,
        DeliveryOutcome::TransientFailure => DeliveryStatus::Undelivered,
        DeliveryOutcome::PermanentFailure => DeliveryStatus::Failed,
    }
}

/// Sends invoice emails with retry and records every attempt.
pub struct DeliveryService {
    transport: Option<Arc<dyn MailTransport>>,
    from_email: String,
    from_name: String,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl DeliveryService {
    pub fn new(transport: Arc<dyn MailTransport>, config: &SmtpConfig) -> Self {
        Self::build(Some(transport), config)
    }

    /// A service that refuses to send, for deployments without SMTP settings.
    pub fn disabled(config: &SmtpConfig) -> Self {
        Self::build(None, config)
    }

    fn build(transport: Option<Arc<dyn MailTransport>>, config: &SmtpConfig) -> Self {
        Self {
            transport,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
            policy: RetryPolicy::from_config(config),
            permits: Arc::new(Semaphore::new(config.max_connections.max(1) as usize)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn sender(&self) -> Result<Mailbox, MailError> {
        email::mailbox(&self.from_email, Some(&self.from_name))
    }

    /// Deliver one invoice, retrying transient failures.
    ///
    /// Cancellation is only observed between attempts; a send in flight runs
    /// until it completes or hits the transport timeout.
    pub async fn send(
        &self,
        log: &dyn DeliveryLog,
        invoice: &Invoice,
        content: &EmailContent,
        pdf: &[u8],
        recipient: &Recipient,
        cancel: &CancellationToken,
    ) -> BillingResult<DeliveryReport> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| BillingError::Config("SMTP is not configured".to_string()))?;

        let message = self.sender().and_then(|from| {
            email::build_invoice_message(&from, recipient, content, &invoice.attachment_filename(), pdf)
        });

        let mut attempts = Vec::new();
        for attempt in 1..=self.policy.max_attempts {
            let result = match &message {
                Ok(message) => {
                    let _permit = self
                        .permits
                        .acquire()
                        .await
                        .map_err(|_| BillingError::NotDeliverable(invoice.display_number()))?;
                    transport.send(message.clone()).await
                }
                Err(e) => Err(e.clone()),
            };

            let last = attempt == self.policy.max_attempts;
            let (outcome, error_detail, retry) = match result {
                Ok(()) => (DeliveryOutcome::Success, None, false),
                Err(e) if e.is_permanent() => (DeliveryOutcome::PermanentFailure, Some(e.detail), false),
                Err(e) => (DeliveryOutcome::TransientFailure, Some(e.detail), !last),
            };

            let record = DeliveryAttempt {
                id: Uuid::new_v4(),
                invoice_id: invoice.id,
                recipient: recipient.email.clone(),
                attempted_at: Utc::now(),
                outcome,
                error_detail,
                attempt,
                exhausted: outcome == DeliveryOutcome::TransientFailure && last,
            };
            log.append_attempt(&record).await?;

            match record.outcome {
                DeliveryOutcome::Success => info!(
                    invoice = %invoice.display_number(),
                    attempt,
                    "Invoice delivered to {}",
                    recipient.email
                ),
                _ => warn!(
                    invoice = %invoice.display_number(),
                    attempt,
                    outcome = record.outcome.as_str(),
                    exhausted = record.exhausted,
                    "Delivery to {} failed: {}",
                    recipient.email,
                    record.error_detail.as_deref().unwrap_or("")
                ),
            }
            attempts.push(record);

            if !retry {
                break;
            }

            let delay = self.policy.delay_for(attempt);
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(invoice = %invoice.display_number(), "Delivery retries cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Ok(DeliveryReport { attempts })
    }
}
