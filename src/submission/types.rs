// Core types for the e-invoice submission state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::errors::TransitionError;

pub type RecordId = u64;
pub type AttemptId = u64;
pub type TenantId = u64;
pub type InvoiceId = u64;
pub type CertificateId = u64;
pub type UserId = u64;

/// Lifecycle of an [`InvoiceSubmissionRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Created upstream, nothing generated yet
    Draft,
    /// Document generated and signed
    Signed,
    /// An attempt exists and the authority has not answered definitively
    Submitted,
    /// Accepted by the authority (terminal)
    Accepted,
    /// Rejected by the authority (terminal)
    Rejected,
    /// Retries exhausted; recoverable only by an operator resubmission
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Draft => "DRAFT",
            RecordStatus::Signed => "SIGNED",
            RecordStatus::Submitted => "SUBMITTED",
            RecordStatus::Accepted => "ACCEPTED",
            RecordStatus::Rejected => "REJECTED",
            RecordStatus::Failed => "FAILED",
        }
    }

    /// The authority answered; the record must never change again.
    pub fn is_final(&self) -> bool {
        matches!(self, RecordStatus::Accepted | RecordStatus::Rejected)
    }

    /// No automatic transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        self.is_final() || *self == RecordStatus::Failed
    }

    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        matches!(
            (self, next),
            (Draft, Signed)
                | (Signed, Signed)
                | (Signed, Submitted)
                | (Submitted, Signed)
                | (Submitted, Accepted)
                | (Submitted, Rejected)
                | (Draft | Signed | Submitted, Failed)
                | (Failed, Signed)
                | (Failed, Failed)
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for RecordStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(RecordStatus::Draft),
            "SIGNED" => Ok(RecordStatus::Signed),
            "SUBMITTED" => Ok(RecordStatus::Submitted),
            "ACCEPTED" => Ok(RecordStatus::Accepted),
            "REJECTED" => Ok(RecordStatus::Rejected),
            "FAILED" => Ok(RecordStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Exclusive claim on a record held by one worker while it runs an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// One invoice that must be reported to the tax authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSubmissionRecord {
    pub id: RecordId,
    pub invoice_id: InvoiceId,
    pub tenant_id: TenantId,
    pub status: RecordStatus,
    pub document: Option<String>,
    pub signed_document: Option<String>,
    pub certificate_id: Option<CertificateId>,
    pub signed_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub cycle: u32,
    pub preparation_failures: u32,
    pub last_error: Option<String>,
    /// When the scheduler should run this record again
    pub next_retry_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceSubmissionRecord {
    pub fn new_draft(
        id: RecordId,
        invoice_id: InvoiceId,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            invoice_id,
            tenant_id,
            status: RecordStatus::Draft,
            document: None,
            signed_document: None,
            certificate_id: None,
            signed_at: None,
            submitted_at: None,
            accepted_at: None,
            rejected_at: None,
            rejection_reason: None,
            cycle: 1,
            preparation_failures: 0,
            last_error: None,
            next_retry_at: None,
            lease: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: RecordStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: "record",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), TransitionError> {
        if self.status.is_final() {
            return Err(TransitionError {
                entity: "record",
                from: self.status.to_string(),
                to: self.status.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_document(&mut self, document: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_mutable()?;
        self.document = Some(document);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_signed(
        &mut self,
        signed_document: String,
        certificate_id: CertificateId,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(RecordStatus::Signed, now)?;
        self.signed_document = Some(signed_document);
        self.certificate_id = Some(certificate_id);
        self.signed_at = Some(now);
        Ok(())
    }

    pub fn mark_submitted(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RecordStatus::Submitted, now)?;
        self.submitted_at = Some(now);
        self.last_error = None;
        Ok(())
    }

    pub fn mark_accepted(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RecordStatus::Accepted, now)?;
        self.next_retry_at = None;
        self.accepted_at = Some(now);
        self.submitted_at = Some(now);
        self.rejection_reason = None;
        Ok(())
    }

    pub fn mark_rejected(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RecordStatus::Rejected, now)?;
        self.next_retry_at = None;
        self.rejected_at = Some(now);
        self.rejection_reason = Some(reason.to_string());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RecordStatus::Failed, now)?;
        self.next_retry_at = None;
        self.rejection_reason = Some(reason.to_string());
        self.last_error = Some(reason.to_string());
        Ok(())
    }

    /// Note a failure that happened before any attempt row was written.
    pub fn record_preparation_failure(&mut self, message: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_mutable()?;
        self.preparation_failures += 1;
        self.last_error = Some(message.to_string());
        self.updated_at = now;
        Ok(())
    }

    pub fn schedule_retry(&mut self, at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_mutable()?;
        self.next_retry_at = at;
        self.updated_at = now;
        Ok(())
    }

    /// Open a fresh submission cycle on a FAILED record. The status itself
    /// moves on when the document is signed again.
    pub fn begin_cycle(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != RecordStatus::Failed {
            return Err(TransitionError {
                entity: "record",
                from: self.status.to_string(),
                to: "new cycle".to_string(),
            });
        }
        self.cycle += 1;
        self.preparation_failures = 0;
        self.last_error = None;
        self.rejection_reason = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self.status,
            RecordStatus::Signed
                | RecordStatus::Submitted
                | RecordStatus::Accepted
                | RecordStatus::Rejected
        )
    }

    pub fn is_submitted(&self) -> bool {
        matches!(
            self.status,
            RecordStatus::Submitted | RecordStatus::Accepted | RecordStatus::Rejected
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A live lease held by someone other than `holder`.
    pub fn foreign_lease(&self, holder: &str, now: DateTime<Utc>) -> Option<&Lease> {
        self.lease
            .as_ref()
            .filter(|lease| lease.is_live(now) && lease.holder != holder)
    }

    /// Push the lease out to `expires_at` when `holder` still owns it.
    /// Takes effect with the next versioned write of the record.
    pub fn renew_lease(&mut self, holder: &str, expires_at: DateTime<Utc>) -> bool {
        match self.lease.as_mut() {
            Some(lease) if lease.holder == holder => {
                lease.expires_at = lease.expires_at.max(expires_at);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Pending,
    Accepted,
    Rejected,
    Error,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "PENDING",
            AttemptStatus::Accepted => "ACCEPTED",
            AttemptStatus::Rejected => "REJECTED",
            AttemptStatus::Error => "ERROR",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, AttemptStatus::Accepted | AttemptStatus::Rejected)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AttemptStatus::Pending),
            "ACCEPTED" => Ok(AttemptStatus::Accepted),
            "REJECTED" => Ok(AttemptStatus::Rejected),
            "ERROR" => Ok(AttemptStatus::Error),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Fields the orchestrator supplies when appending an attempt. The store
/// assigns the id and starts the row as PENDING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttempt {
    pub record_id: RecordId,
    pub tenant_id: TenantId,
    pub initiator_id: Option<UserId>,
    pub ordinal: u32,
    pub cycle: u32,
    pub retry_count: u32,
    pub idempotency_key: String,
    pub submitted_at: DateTime<Utc>,
}

/// One try against the portal. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub id: AttemptId,
    pub record_id: RecordId,
    pub tenant_id: TenantId,
    pub initiator_id: Option<UserId>,
    pub ordinal: u32,
    pub cycle: u32,
    pub submitted_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub receipt_number: Option<String>,
    pub upload_id: Option<String>,
    pub error_message: Option<String>,
    pub response: serde_json::Value,
    pub idempotency_key: String,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubmissionAttempt {
    /// Deduplication key sent to the authority. Depends only on the record
    /// and the attempt's position, so a redelivered attempt reproduces it.
    pub fn idempotency_key_for(record_id: RecordId, ordinal: u32) -> String {
        format!("einvoice-{record_id}-attempt-{ordinal}")
    }

    pub fn from_new(id: AttemptId, new: NewAttempt) -> Self {
        Self {
            id,
            record_id: new.record_id,
            tenant_id: new.tenant_id,
            initiator_id: new.initiator_id,
            ordinal: new.ordinal,
            cycle: new.cycle,
            submitted_at: new.submitted_at,
            status: AttemptStatus::Pending,
            retry_count: new.retry_count,
            next_retry_at: None,
            receipt_number: None,
            upload_id: None,
            error_message: None,
            response: serde_json::json!({ "idempotency_key": new.idempotency_key }),
            idempotency_key: new.idempotency_key,
            completed_at: None,
        }
    }

    fn ensure_open(&self, to: AttemptStatus) -> Result<(), TransitionError> {
        if self.status.is_final() {
            return Err(TransitionError {
                entity: "attempt",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    fn merge_response(&mut self, extra: serde_json::Value) {
        match (&mut self.response, extra) {
            (serde_json::Value::Object(current), serde_json::Value::Object(extra)) => {
                current.extend(extra);
            }
            (_, serde_json::Value::Null) => {}
            (current, extra) => *current = extra,
        }
    }

    pub fn mark_accepted(
        &mut self,
        receipt_number: Option<String>,
        upload_id: Option<String>,
        response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_open(AttemptStatus::Accepted)?;
        self.status = AttemptStatus::Accepted;
        if receipt_number.is_some() {
            self.receipt_number = receipt_number;
        }
        self.upload_id = upload_id.or(self.upload_id.take());
        self.merge_response(response);
        self.next_retry_at = None;
        self.error_message = None;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_rejected(
        &mut self,
        reason: &str,
        response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_open(AttemptStatus::Rejected)?;
        self.status = AttemptStatus::Rejected;
        self.error_message = Some(reason.to_string());
        self.merge_response(response);
        self.next_retry_at = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// `next_retry_at` of `None` means no further attempt will follow.
    pub fn mark_error(
        &mut self,
        message: &str,
        response: serde_json::Value,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_open(AttemptStatus::Error)?;
        self.status = AttemptStatus::Error;
        self.error_message = Some(message.to_string());
        self.merge_response(response);
        self.next_retry_at = next_retry_at;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Retry budget left in this attempt's cycle.
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        self.retry_count + 1 < max_attempts
            && matches!(self.status, AttemptStatus::Pending | AttemptStatus::Error)
    }

    pub fn is_pending_retry(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_some_and(|at| at > now)
    }

    pub fn is_ready_for_retry(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.status == AttemptStatus::Error
            && self.can_retry(max_attempts)
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

/// Tenant-scoped signing credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningCertificate {
    pub id: CertificateId,
    pub tenant_id: TenantId,
    pub name: String,
    pub certificate_path: PathBuf,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: DateTime<Utc>,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl SigningCertificate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_to <= now
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }

    /// Negative once expired.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.valid_to - now).num_days()
    }
}

/// Per-call options for [`submit`](super::orchestrator::SubmissionOrchestrator::submit)
#[derive(Clone, Default)]
pub struct SubmitOptions {
    pub certificate_password: Option<String>,
    /// Operator resubmission: lets a FAILED record start a new cycle.
    pub resubmit: bool,
    /// Overrides the configured portal mode for this call.
    pub mode: Option<String>,
}

impl fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitOptions")
            .field(
                "certificate_password",
                &self.certificate_password.as_ref().map(|_| "<redacted>"),
            )
            .field("resubmit", &self.resubmit)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Structured result from the portal upload tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalResponse {
    pub success: bool,
    /// Lowercased status word, `"unknown"` when absent
    pub status: String,
    pub upload_id: Option<String>,
    pub receipt_number: Option<String>,
    pub error_message: Option<String>,
    pub raw_output: String,
}

/// How a [`PortalResponse`] resolves the attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalVerdict {
    Accepted { receipt_number: Option<String> },
    Rejected { reason: String },
    Indeterminate { reason: String },
}

pub const DEFAULT_REJECTION_REASON: &str = "Submission rejected by tax authority";

impl PortalResponse {
    pub fn verdict(&self) -> PortalVerdict {
        match self.status.as_str() {
            "accepted" | "success" if self.success => PortalVerdict::Accepted {
                receipt_number: self.receipt_number.clone(),
            },
            "rejected" | "failed" => PortalVerdict::Rejected {
                reason: self
                    .error_message
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string()),
            },
            other => PortalVerdict::Indeterminate {
                reason: format!("Unexpected upload status: {other}"),
            },
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Result of one [`submit`](super::orchestrator::SubmissionOrchestrator::submit) call
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing to do; the record is already resolved
    Skipped { status: RecordStatus },
    /// Another worker holds the record
    Busy {
        holder: String,
        lease_expires_at: DateTime<Utc>,
    },
    Accepted {
        attempt_id: AttemptId,
        receipt_number: Option<String>,
    },
    Rejected { attempt_id: AttemptId, reason: String },
    /// A retry is already scheduled and not yet due
    RetryScheduled {
        attempt_id: Option<AttemptId>,
        next_retry_at: DateTime<Utc>,
    },
    /// The cycle budget was already spent when the run started
    Failed {
        attempt_id: Option<AttemptId>,
        reason: String,
    },
}

impl Outcome {
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Outcome::RetryScheduled { next_retry_at, .. } => Some(*next_retry_at),
            _ => None,
        }
    }
}
