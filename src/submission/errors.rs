//! Error taxonomy for the submission pipeline.
//!
//! Callers branch on [`ErrorKind`] rather than on concrete variants, so the
//! scheduler can decide whether to retry without knowing which collaborator
//! failed.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{AttemptId, RecordId, TenantId};
use crate::external::CommandError;

/// A status change the entity accessors refused to make.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal {entity} transition {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

/// Failures from a [`SubmissionStore`](super::traits::SubmissionStore) or
/// [`CertificateStore`](super::traits::CertificateStore) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record {0} not found")]
    RecordNotFound(RecordId),
    #[error("attempt {0} not found")]
    AttemptNotFound(AttemptId),
    #[error("version conflict on record {record_id}: expected {expected}, found {found}")]
    Conflict {
        record_id: RecordId,
        expected: u64,
        found: u64,
    },
    #[error("idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),
    #[error("attempt {0} is final and cannot be modified")]
    ImmutableAttempt(AttemptId),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("document generation failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("signing failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Transport-level failures talking to the portal. Business rejections are
/// not errors here; they come back as a parsed
/// [`PortalResponse`](super::types::PortalResponse).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortalError {
    #[error("portal submission timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("portal unreachable: {0}")]
    Unreachable(String),
    #[error("upload tool exited with status {status_code}: {stderr}")]
    ToolFailed { status_code: i32, stderr: String },
}

impl From<CommandError> for PortalError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout { timeout_ms } => PortalError::Timeout {
                timeout_secs: timeout_ms / 1000,
            },
            other => PortalError::Unreachable(other.to_string()),
        }
    }
}

/// Classification used by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    NoActiveCertificate,
    Generation,
    Signing,
    PortalTransient,
    PortalRejected,
    Unknown,
    Storage,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("submission record not found: {0}")]
    NotFound(RecordId),
    #[error("no active certificate found for tenant: {tenant_id}")]
    NoActiveCertificate { tenant_id: TenantId },
    #[error("failed to generate document: {0}")]
    Generation(#[from] GeneratorError),
    #[error("failed to sign document: {0}")]
    Signing(#[from] SignerError),
    #[error("portal unreachable: {0}")]
    PortalUnreachable(String),
    #[error("portal submission timed out after {timeout_secs}s")]
    PortalTimeout { timeout_secs: u64 },
    #[error("rejected by tax authority: {reason}")]
    PortalRejected { reason: String },
    #[error("unexpected portal response: {reason}")]
    UnknownPortalResponse { reason: String, raw_output: String },
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl From<PortalError> for SubmissionError {
    fn from(err: PortalError) -> Self {
        match err {
            PortalError::Timeout { timeout_secs } => SubmissionError::PortalTimeout { timeout_secs },
            PortalError::Unreachable(message) => SubmissionError::PortalUnreachable(message),
            PortalError::ToolFailed { .. } => SubmissionError::PortalUnreachable(err.to_string()),
        }
    }
}

impl SubmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmissionError::NotFound(_) => ErrorKind::NotFound,
            SubmissionError::NoActiveCertificate { .. } => ErrorKind::NoActiveCertificate,
            SubmissionError::Generation(_) => ErrorKind::Generation,
            SubmissionError::Signing(_) => ErrorKind::Signing,
            SubmissionError::PortalUnreachable(_) | SubmissionError::PortalTimeout { .. } => {
                ErrorKind::PortalTransient
            }
            SubmissionError::PortalRejected { .. } => ErrorKind::PortalRejected,
            SubmissionError::UnknownPortalResponse { .. } => ErrorKind::Unknown,
            SubmissionError::Storage(_) | SubmissionError::InvalidTransition(_) => ErrorKind::Storage,
        }
    }

    /// Whether another attempt could succeed without operator action.
    ///
    /// `retry_missing_certificate` carries the configured policy for
    /// [`ErrorKind::NoActiveCertificate`].
    pub fn is_retryable(&self, retry_missing_certificate: bool) -> bool {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::PortalRejected => false,
            ErrorKind::NoActiveCertificate => retry_missing_certificate,
            _ => true,
        }
    }
}

/// A submission that ended in an error after the failure was persisted.
///
/// `next_retry_at` is the scheduler directive: `None` means do not retry.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("submission of record {record_id} failed: {error}")]
pub struct SubmissionFailure {
    pub record_id: RecordId,
    pub attempt_id: Option<AttemptId>,
    pub next_retry_at: Option<DateTime<Utc>>,
    #[source]
    pub error: SubmissionError,
}

impl SubmissionFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn will_retry(&self) -> bool {
        self.next_retry_at.is_some()
    }
}
