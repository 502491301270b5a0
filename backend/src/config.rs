use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

use crate::database::PoolConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("Failed to set up SMTP transport: {0}")]
    Smtp(String),
}

/// Process-wide configuration, built once at start and passed down explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub documents_dir: PathBuf,
    pub database: PoolConfig,
    pub smtp: SmtpConfig,
    pub billing: BillingConfig,
    pub scheduler: SchedulerConfig,
    pub renderer: RendererConfig,
}

/// SMTP configuration for sending invoices
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SmtpConfig {
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[validate(email)]
    pub from_email: String,
    #[validate(length(min = 1))]
    pub from_name: String,
    /// Implicit TLS from the first byte; STARTTLS is not used.
    pub use_tls: bool,
    #[validate(range(min = 1))]
    pub connect_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub send_timeout_secs: u64,
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    #[validate(range(min = 1, max = 100))]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BillingConfig {
    /// Used when a contract carries no payment terms of its own.
    #[validate(range(max = 365))]
    pub payment_terms_days: u32,
    /// Days after a window's end before it is generated. A window is never
    /// generated before it closes.
    #[validate(range(max = 28))]
    pub trigger_offset_days: u32,
    /// How long a run holds a draft while rendering and delivering it.
    #[validate(range(min = 1, max = 1440))]
    pub delivery_lease_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchedulerConfig {
    /// Daily run time, UTC.
    pub run_at: NaiveTime,
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    pub command: Option<String>,
    pub timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let data_dir = PathBuf::from(get("TALLY_DATA_DIR", "./data/tenants"));
        let documents_dir = PathBuf::from(get("TALLY_DOCUMENTS_DIR", "./data/documents"));

        let database = PoolConfig {
            max_connections: parse(&lookup, "DB_MAX_CONNECTIONS", 4)?,
            busy_timeout: Duration::from_secs(parse(&lookup, "DB_BUSY_TIMEOUT_SECS", 5)?),
            ..PoolConfig::default()
        };

        let smtp = SmtpConfig {
            host: get("SMTP_HOST", ""),
            port: parse(&lookup, "SMTP_PORT", 465)?,
            username: get("SMTP_USERNAME", ""),
            password: get("SMTP_PASSWORD", ""),
            from_email: get("SMTP_FROM_EMAIL", "billing@example.com"),
            from_name: get("SMTP_FROM_NAME", "Billing"),
            use_tls: parse(&lookup, "SMTP_USE_TLS", true)?,
            connect_timeout_secs: parse(&lookup, "SMTP_CONNECT_TIMEOUT_SECS", 10)?,
            send_timeout_secs: parse(&lookup, "SMTP_SEND_TIMEOUT_SECS", 60)?,
            max_attempts: parse(&lookup, "SMTP_MAX_ATTEMPTS", 3)?,
            backoff_base_ms: parse(&lookup, "SMTP_BACKOFF_BASE_MS", 2_000)?,
            backoff_max_ms: parse(&lookup, "SMTP_BACKOFF_MAX_MS", 60_000)?,
            max_connections: parse(&lookup, "SMTP_MAX_CONNECTIONS", 4)?,
        };

        let billing = BillingConfig {
            payment_terms_days: parse(&lookup, "BILLING_PAYMENT_TERMS_DAYS", 30)?,
            trigger_offset_days: parse(&lookup, "BILLING_TRIGGER_OFFSET_DAYS", 0)?,
            delivery_lease_minutes: parse(&lookup, "BILLING_DELIVERY_LEASE_MINUTES", 60)?,
        };

        let run_at = get("SCHEDULER_RUN_AT", "09:00");
        let scheduler = SchedulerConfig {
            run_at: NaiveTime::parse_from_str(&run_at, "%H:%M").map_err(|_| ConfigError::InvalidValue {
                key: "SCHEDULER_RUN_AT",
                value: run_at.clone(),
            })?,
            workers: parse(&lookup, "SCHEDULER_WORKERS", 8)?,
        };

        let renderer = RendererConfig {
            command: lookup("RENDER_COMMAND").filter(|command| !command.trim().is_empty()),
            timeout_secs: parse(&lookup, "RENDER_TIMEOUT_SECS", 60)?,
        };

        Ok(Config {
            data_dir,
            documents_dir,
            database,
            smtp,
            billing,
            scheduler,
            renderer,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.smtp.validate()?;
        self.billing.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

impl SmtpConfig {
    /// Check if SMTP is properly configured
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            payment_terms_days: 30,
            trigger_offset_days: 0,
            delivery_lease_minutes: 60,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_at: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            workers: 8,
        }
    }
}
