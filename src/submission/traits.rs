// Traits for dependency injection - every collaborator of the orchestrator
// sits behind one of these so the state machine can be tested without
// processes, files or a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::errors::{GeneratorError, PortalError, SignerError, StoreError};
use super::types::*;

/// Source of "now". Injected so retry schedules are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Renders the invoice behind a record as the authority's document format.
#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    async fn generate(&self, record: &InvoiceSubmissionRecord) -> Result<String, GeneratorError>;
}

/// Applies a digital signature with a tenant certificate.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(
        &self,
        document: &str,
        certificate: &SigningCertificate,
        password: Option<&str>,
    ) -> Result<String, SignerError>;
}

/// Parameters for one portal upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub idempotency_key: String,
    pub mode: String,
    pub timeout: Duration,
}

/// Hands a signed document to the tax portal.
///
/// Implementations return a parsed [`PortalResponse`] for anything the tool
/// printed, and a [`PortalError`] only when no usable output exists.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PortalSubmitter: Send + Sync {
    async fn submit(
        &self,
        signed_document: &str,
        request: &PortalRequest,
    ) -> Result<PortalResponse, PortalError>;
}

/// Result of trying to claim a record
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Acquired(InvoiceSubmissionRecord),
    Held(Lease),
    NotFound,
}

/// Counters for the operator retry queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub error: usize,
    pub ready_for_retry: usize,
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn load_record(&self, id: RecordId) -> Result<Option<InvoiceSubmissionRecord>, StoreError>;

    /// Claim the record for `holder` until `now + ttl`. Succeeds when no live
    /// lease exists or `holder` already owns it.
    async fn acquire_lease(
        &self,
        id: RecordId,
        holder: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<LeaseOutcome, StoreError>;

    /// Drop the lease if `holder` still owns it.
    async fn release_lease(&self, id: RecordId, holder: &str) -> Result<(), StoreError>;

    /// Write the record if its `version` matches the stored one. Returns the
    /// stored copy with the bumped version.
    async fn update_record(
        &self,
        record: &InvoiceSubmissionRecord,
    ) -> Result<InvoiceSubmissionRecord, StoreError>;

    /// All attempts for the record, oldest first.
    async fn list_attempts(&self, record_id: RecordId) -> Result<Vec<SubmissionAttempt>, StoreError>;

    /// Append a PENDING attempt. Fails on a reused idempotency key.
    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<SubmissionAttempt, StoreError>;

    /// Persist a resolved attempt. Rows already ACCEPTED or REJECTED are refused.
    async fn update_attempt(&self, attempt: &SubmissionAttempt) -> Result<(), StoreError>;

    /// Records whose scheduled retry is due.
    async fn records_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecordId>, StoreError>;

    async fn queue_stats(
        &self,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<QueueStats, StoreError>;

    async fn latest_attempt(&self, record_id: RecordId) -> Result<Option<SubmissionAttempt>, StoreError> {
        Ok(self.list_attempts(record_id).await?.pop())
    }
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn find_certificate(&self, id: CertificateId) -> Result<Option<SigningCertificate>, StoreError>;

    async fn certificates_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<SigningCertificate>, StoreError>;

    /// Last-writer-wins; no lease needed.
    async fn touch_certificate(&self, id: CertificateId, at: DateTime<Utc>) -> Result<(), StoreError>;
}
