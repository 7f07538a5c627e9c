//! Out-of-process implementations of the collaborator traits.
//!
//! Each adapter stages its input in a temp file, runs the configured tool
//! through a [`CommandExecutor`] under a timeout, and reads the tool's
//! stdout. Temp files are removed when the call returns.

use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::errors::{GeneratorError, PortalError, SignerError};
use super::parser::parse_portal_output;
use super::traits::{DocumentGenerator, PortalRequest, PortalSubmitter, Signer};
use super::types::{InvoiceSubmissionRecord, PortalResponse, SigningCertificate};
use crate::config::PortalConfig;
use crate::external::{CommandError, CommandExecutor};

fn stage(prefix: &str, suffix: &str, contents: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn flag(name: &str, path: &Path) -> String {
    format!("--{name}={}", path.display())
}

/// Runs the portal upload tool.
pub struct ProcessPortalSubmitter {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    args: Vec<String>,
}

impl ProcessPortalSubmitter {
    pub fn new(executor: Arc<dyn CommandExecutor>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            executor,
            program: program.into(),
            args,
        }
    }

    pub fn from_config(executor: Arc<dyn CommandExecutor>, config: &PortalConfig) -> Self {
        Self::new(executor, config.upload_program.clone(), config.upload_args.clone())
    }
}

#[async_trait]
impl PortalSubmitter for ProcessPortalSubmitter {
    async fn submit(
        &self,
        signed_document: &str,
        request: &PortalRequest,
    ) -> Result<PortalResponse, PortalError> {
        let staged = stage("einvoice", ".xml", signed_document)
            .map_err(|e| PortalError::Unreachable(format!("failed to stage signed document: {e}")))?;

        let mut args = self.args.clone();
        args.push(flag("xml", staged.path()));
        args.push(format!("--mode={}", request.mode));
        args.push(format!("--idempotency-key={}", request.idempotency_key));

        debug!(
            program = %self.program,
            idempotency_key = %request.idempotency_key,
            mode = %request.mode,
            "Invoking portal upload tool"
        );

        let output = self
            .executor
            .execute(&self.program, &args, request.timeout)
            .await
            .map_err(|e| match e {
                CommandError::Timeout { .. } => PortalError::Timeout {
                    timeout_secs: request.timeout.as_secs(),
                },
                other => PortalError::from(other),
            })?;

        if !output.success() {
            warn!(
                status_code = output.status_code,
                stderr = %output.stderr.trim(),
                "Portal upload tool exited with failure"
            );
            return Err(PortalError::ToolFailed {
                status_code: output.status_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(parse_portal_output(&output.stdout))
    }
}

/// Runs the signing tool with the certificate file and an optional
/// password file.
pub struct ProcessSigner {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessSigner {
    pub fn from_config(executor: Arc<dyn CommandExecutor>, config: &PortalConfig) -> Self {
        Self {
            executor,
            program: config.signer_program.clone(),
            args: config.signer_args.clone(),
            timeout: Duration::from_secs(config.tool_timeout_seconds),
        }
    }
}

#[async_trait]
impl Signer for ProcessSigner {
    async fn sign(
        &self,
        document: &str,
        certificate: &SigningCertificate,
        password: Option<&str>,
    ) -> Result<String, SignerError> {
        let staged = stage("einvoice", ".xml", document)
            .map_err(|e| SignerError::Failed(format!("failed to stage document: {e}")))?;

        let mut args = self.args.clone();
        args.push(flag("input", staged.path()));
        args.push(flag("certificate", &certificate.certificate_path));

        // The password never appears on the command line.
        let password_file = match password {
            Some(password) => Some(
                stage("einvoice-pass", ".txt", password)
                    .map_err(|e| SignerError::Failed(format!("failed to stage password: {e}")))?,
            ),
            None => None,
        };
        if let Some(file) = &password_file {
            args.push(flag("password-file", file.path()));
        }

        let output = self.executor.execute(&self.program, &args, self.timeout).await?;

        if !output.success() {
            return Err(SignerError::Failed(format!(
                "signer exited with status {}: {}",
                output.status_code,
                output.stderr.trim()
            )));
        }
        if output.stdout.trim().is_empty() {
            return Err(SignerError::Failed("signer produced no output".to_string()));
        }

        Ok(output.stdout)
    }
}

/// Runs the document generator for one invoice.
pub struct ProcessDocumentGenerator {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessDocumentGenerator {
    pub fn from_config(executor: Arc<dyn CommandExecutor>, config: &PortalConfig) -> Self {
        Self {
            executor,
            program: config.generator_program.clone(),
            args: config.generator_args.clone(),
            timeout: Duration::from_secs(config.tool_timeout_seconds),
        }
    }
}

#[async_trait]
impl DocumentGenerator for ProcessDocumentGenerator {
    async fn generate(&self, record: &InvoiceSubmissionRecord) -> Result<String, GeneratorError> {
        let mut args = self.args.clone();
        args.push(format!("--invoice-id={}", record.invoice_id));
        args.push(format!("--tenant-id={}", record.tenant_id));

        let output = self.executor.execute(&self.program, &args, self.timeout).await?;

        if !output.success() {
            return Err(GeneratorError::Failed(format!(
                "generator exited with status {}: {}",
                output.status_code,
                output.stderr.trim()
            )));
        }
        if output.stdout.trim().is_empty() {
            return Err(GeneratorError::Failed("generator produced an empty document".to_string()));
        }

        Ok(output.stdout)
    }
}
