use async_trait::async_trait;
use lettre::{
    address::Address,
    message::{
        header::{self, ContentType},
        Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{Tls, TlsParameters},
        PoolConfig,
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tally_shared::{Client, Company, Invoice};
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, SmtpConfig};

/// How a failed send should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    /// 4xx replies may succeed later; everything else the server refused for good.
    pub fn from_reply_code(code: u16) -> Self {
        match code {
            400..=499 => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} failure: {detail}")]
pub struct MailError {
    pub kind: FailureKind,
    pub detail: String,
}

impl MailError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            detail: detail.into(),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            detail: detail.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == FailureKind::Permanent
    }
}

/// Map an SMTP client error onto the retry taxonomy.
pub fn classify(err: &lettre::transport::smtp::Error) -> FailureKind {
    if let Some(code) = err.status() {
        if let Ok(code) = code.to_string().parse::<u16>() {
            return FailureKind::from_reply_code(code);
        }
    }

    if err.is_permanent() {
        FailureKind::Permanent
    } else if err.is_transient() || err.is_timeout() {
        FailureKind::Transient
    } else if err.is_tls() || err.is_client() {
        FailureKind::Permanent
    } else {
        // Connection refused, reset and other network I/O.
        FailureKind::Transient
    }
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub email: String,
    pub name: Option<String>,
}

impl Recipient {
    pub fn for_client(client: &Client) -> Self {
        Self {
            email: client.email.clone().unwrap_or_default(),
            name: Some(client.name.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailContent {
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
}

pub fn mailbox(email: &str, name: Option<&str>) -> Result<Mailbox, MailError> {
    let address: Address = email
        .trim()
        .parse()
        .map_err(|e| MailError::permanent(format!("invalid address {email:?}: {e}")))?;
    Ok(Mailbox::new(name.map(str::to_string), address))
}

// Template for invoice delivery
pub fn invoice_email(invoice: &Invoice, company: &Company, client: &Client) -> EmailContent {
    let number = invoice.display_number();
    let subject = format!("Invoice {} from {}", number, company.name);
    let period = invoice
        .period
        .map(|period| format!("for {}", period.describe()))
        .unwrap_or_default();
    let amount = format!("{} {}", invoice.total(), invoice.currency);
    let due = invoice.due_date.format("%B %d, %Y");

    let html_body = format!(
        r#"
        <html>
        <body style="font-family: Arial, sans-serif; color: #1f2937;">
            <p>Hello {client},</p>
            <p>Please find attached invoice <strong>{number}</strong> {period}.</p>
            <table style="border-left: 4px solid #2563eb; padding: 10px 15px; background: #f8fafc;">
                <tr><td><strong>Amount due:</strong></td><td>{amount}</td></tr>
                <tr><td><strong>Due date:</strong></td><td>{due}</td></tr>
            </table>
            <p>Thank you for your business.</p>
            <p>Best regards,<br>{company}</p>
        </body>
        </html>
        "#,
        client = client.name,
        number = number,
        period = period,
        amount = amount,
        due = due,
        company = company.name,
    );

    let text_body = format!(
        "Hello {},\n\n\
        Please find attached invoice {} {}.\n\n\
        Amount due: {}\n\
        Due date: {}\n\n\
        Thank you for your business.\n\n\
        Best regards,\n\
        {}",
        client.name, number, period, amount, due, company.name
    );

    EmailContent {
        subject,
        text_body,
        html_body: Some(html_body),
    }
}

/// Build the outbound message: text (or text + HTML alternative) followed by
/// the PDF attachment in a `multipart/mixed` body.
pub fn build_invoice_message(
    from: &Mailbox,
    recipient: &Recipient,
    content: &EmailContent,
    attachment_name: &str,
    pdf: &[u8],
) -> Result<Message, MailError> {
    let to = mailbox(&recipient.email, recipient.name.as_deref())?;

    let body = match &content.html_body {
        Some(html) => MultiPart::alternative()
            .singlepart(SinglePart::plain(content.text_body.clone()))
            .singlepart(SinglePart::html(html.clone())),
        None => MultiPart::mixed().singlepart(SinglePart::plain(content.text_body.clone())),
    };

    let pdf_type = ContentType::parse("application/pdf")
        .map_err(|e| MailError::permanent(format!("invalid attachment type: {e}")))?;
    let attachment = SinglePart::builder()
        .header(pdf_type)
        .header(header::ContentDisposition::attachment(attachment_name))
        .header(header::ContentTransferEncoding::Base64)
        .body(pdf.to_vec());

    let mixed = match content.html_body {
        Some(_) => MultiPart::mixed().multipart(body).singlepart(attachment),
        None => body.singlepart(attachment),
    };

    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(content.subject.clone())
        .date_now()
        .multipart(mixed)
        .map_err(|e| MailError::permanent(format!("failed to build message: {e}")))
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), MailError>;
}

/// SMTP transport over lettre with implicit TLS and PLAIN authentication.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    send_timeout: Duration,
}

impl SmtpMailer {
    pub fn new(smtp_config: &SmtpConfig) -> Result<Self, ConfigError> {
        if !smtp_config.is_configured() {
            return Err(ConfigError::Smtp("SMTP_HOST is not set".to_string()));
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            .port(smtp_config.port)
            .pool_config(PoolConfig::new().max_size(smtp_config.max_connections))
            .timeout(Some(smtp_config.connect_timeout()));

        if smtp_config.use_tls {
            // TLS from the first byte, certificate checked against the configured host.
            let parameters = TlsParameters::new(smtp_config.host.clone())
                .map_err(|e| ConfigError::Smtp(e.to_string()))?;
            builder = builder.tls(Tls::Wrapper(parameters));
        }

        if !smtp_config.username.is_empty() {
            let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());
            builder = builder
                .credentials(creds)
                .authentication(vec![Mechanism::Plain]);
        }

        Ok(SmtpMailer {
            transport: builder.build(),
            send_timeout: smtp_config.send_timeout(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, message: Message) -> Result<(), MailError> {
        match tokio::time::timeout(self.send_timeout, self.transport.send(message)).await {
            Ok(Ok(response)) => {
                debug!("SMTP accepted message: {:?}", response.code());
                Ok(())
            }
            Ok(Err(e)) => Err(MailError {
                kind: classify(&e),
                detail: e.to_string(),
            }),
            Err(_) => Err(MailError::transient(format!(
                "send timed out after {:?}",
                self.send_timeout
            ))),
        }
    }
}
