use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_backend::config::Config;
use tally_backend::database::TenantPools;
use tally_backend::jobs::{DailyTrigger, JobScheduler, RecurringBillingJob};
use tally_backend::services::{CommandRenderer, DeliveryService, MailTransport, SmtpMailer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    config.validate()?;

    let tenants = Arc::new(TenantPools::new(&config.data_dir, config.database.clone()));

    let delivery = if config.smtp.is_configured() {
        let mailer: Arc<dyn MailTransport> = Arc::new(SmtpMailer::new(&config.smtp)?);
        DeliveryService::new(mailer, &config.smtp)
    } else {
        tracing::warn!("SMTP_HOST is not set; due contracts will fail until it is configured");
        DeliveryService::disabled(&config.smtp)
    };

    let Some(renderer) = CommandRenderer::from_config(&config.renderer) else {
        anyhow::bail!("RENDER_COMMAND must name the invoice document renderer");
    };

    let billing = RecurringBillingJob::new(
        tenants.clone(),
        Arc::new(renderer),
        Arc::new(delivery),
        &config.billing,
        &config.documents_dir,
        config.scheduler.workers,
    );
    let scheduler = JobScheduler::new(Arc::new(billing), DailyTrigger::new(config.scheduler.run_at));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing in-flight work");
            shutdown.cancel();
        }
    });

    match std::env::args().nth(1).as_deref() {
        Some("once") => {
            let result = scheduler.run_once(&cancel).await?;
            tracing::info!(
                "Cycle finished: {} invoices generated, {} errors",
                result.invoices_generated,
                result.errors.len()
            );
        }
        Some(other) => anyhow::bail!("unknown command {other:?}, expected \"once\""),
        None => scheduler.start(cancel).await?,
    }

    tenants.close_all().await;
    Ok(())
}
