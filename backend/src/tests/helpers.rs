// Helper functions for tests

use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};

use crate::config::SmtpConfig;
use crate::services::email::{MailError, MockMailTransport};
use crate::services::renderer::{MockDocumentRenderer, RenderError};
use crate::services::{DocumentRenderer, MailTransport};

pub const FAKE_PDF: &[u8] = b"%PDF-1.7\n% tally test document\n%%EOF\n";

/// SMTP settings with millisecond backoff so retry tests stay fast.
pub fn smtp_config() -> SmtpConfig {
    SmtpConfig {
        host: "smtp.studio.test".to_string(),
        port: 465,
        username: "billing".to_string(),
        password: "secret".to_string(),
        from_email: "billing@studio.test".to_string(),
        from_name: "Studio North".to_string(),
        use_tls: true,
        connect_timeout_secs: 5,
        send_timeout_secs: 5,
        max_attempts: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 4,
        max_connections: 2,
    }
}

pub async fn count_table_rows(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}

pub fn pdf_renderer() -> Arc<dyn DocumentRenderer> {
    let mut renderer = MockDocumentRenderer::new();
    renderer.expect_render().returning(|_| Ok(FAKE_PDF.to_vec()));
    Arc::new(renderer)
}

pub fn failing_renderer() -> Arc<dyn DocumentRenderer> {
    let mut renderer = MockDocumentRenderer::new();
    renderer
        .expect_render()
        .returning(|_| Err(RenderError::EmptyOutput));
    Arc::new(renderer)
}

/// Transport that accepts every message and keeps its wire form.
pub fn recording_transport() -> (Arc<dyn MailTransport>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sink = sent.clone();
    let mut transport = MockMailTransport::new();
    transport.expect_send().returning(move |message| {
        sink.lock().unwrap().push(message.formatted());
        Ok(())
    });
    (Arc::new(transport), sent)
}

pub fn accepting_transport() -> Arc<dyn MailTransport> {
    recording_transport().0
}

pub fn rejecting_transport(code: u16, times: usize) -> Arc<dyn MailTransport> {
    let mut transport = MockMailTransport::new();
    transport.expect_send().times(times).returning(move |_| {
        if code >= 500 {
            Err(MailError::permanent(format!("{code} mailbox unavailable")))
        } else {
            Err(MailError::transient(format!("{code} try again later")))
        }
    });
    Arc::new(transport)
}

pub fn unused_transport() -> Arc<dyn MailTransport> {
    let mut transport = MockMailTransport::new();
    transport.expect_send().never();
    Arc::new(transport)
}
