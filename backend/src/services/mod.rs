pub mod delivery;
pub mod email;
pub mod invoice_builder;
pub mod rate_engine;
pub mod recurrence;
pub mod renderer;

pub use delivery::{DeliveryLog, DeliveryReport, DeliveryService, RetryPolicy};
pub use email::{MailError, MailTransport, Recipient, SmtpMailer};
pub use invoice_builder::InvoiceBuilder;
pub use rate_engine::{Charge, RateEngine, RateError, RateOutcome};
pub use recurrence::RecurrenceEngine;
pub use renderer::{CommandRenderer, DocumentRenderer, InvoiceDocument, RenderError};
