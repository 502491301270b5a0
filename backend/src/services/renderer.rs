//! Invoice document rendering.
//!
//! Layout is owned by an external renderer. The engine hands it a JSON
//! document on stdin and takes PDF bytes from stdout.

use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tally_shared::{Client, Company, Invoice};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::RendererConfig;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to start renderer {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("Renderer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("Renderer produced no output")]
    EmptyOutput,
    #[error("Renderer timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to encode invoice document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Renderer I/O error: {0}")]
    Io(io::Error),
}

/// Everything a renderer needs to lay out one invoice.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDocument {
    pub invoice: Invoice,
    pub company: Company,
    pub client: Client,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(&self, document: InvoiceDocument) -> Result<Vec<u8>, RenderError>;
}

/// Runs an external program per document.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRenderer {
    pub fn new(command_line: &str, timeout: Duration) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    pub fn from_config(config: &RendererConfig) -> Option<Self> {
        let command = config.command.as_deref()?;
        Self::new(command, Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl DocumentRenderer for CommandRenderer {
    async fn render(&self, document: InvoiceDocument) -> Result<Vec<u8>, RenderError> {
        let payload = serde_json::to_vec(&document)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RenderError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            RenderError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "renderer stdin unavailable"))
        })?;
        // Feed stdin concurrently so a renderer that streams output cannot deadlock on a full pipe.
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&payload).await;
            drop(stdin);
            result
        });

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(RenderError::Io)?,
            Err(_) => {
                writer.abort();
                return Err(RenderError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            return Err(RenderError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if let Ok(Err(e)) = writer.await {
            if e.kind() != io::ErrorKind::BrokenPipe {
                return Err(RenderError::Io(e));
            }
        }

        if output.stdout.is_empty() {
            return Err(RenderError::EmptyOutput);
        }

        Ok(output.stdout)
    }
}

/// Write rendered bytes to `<documents_dir>/<tenant>/<INV-number>.pdf`.
pub async fn store_document(
    documents_dir: &Path,
    tenant_id: &str,
    invoice: &Invoice,
    bytes: &[u8],
) -> io::Result<PathBuf> {
    let dir = documents_dir.join(tenant_id);
    tokio::fs::create_dir_all(&dir).await?;

    let path = dir.join(invoice.attachment_filename());
    let partial = path.with_extension("pdf.partial");
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, &path).await?;

    Ok(path)
}
