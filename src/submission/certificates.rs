// Certificate selection for signing.

use chrono::{DateTime, Utc};

use super::errors::SubmissionError;
use super::traits::CertificateStore;
use super::types::{InvoiceSubmissionRecord, SigningCertificate, TenantId};

/// Pick the certificate to sign `record` with.
///
/// A certificate already bound to the record is reused while it stays
/// usable, so re-signing after a transient failure keeps the same key.
/// Otherwise the tenant's usable certificate with the latest `valid_to`
/// wins; ties go to the lowest id.
pub async fn resolve_certificate(
    record: &InvoiceSubmissionRecord,
    store: &dyn CertificateStore,
    now: DateTime<Utc>,
) -> Result<SigningCertificate, SubmissionError> {
    if let Some(bound_id) = record.certificate_id {
        if let Some(bound) = store.find_certificate(bound_id).await? {
            if bound.tenant_id == record.tenant_id && bound.is_usable(now) {
                return Ok(bound);
            }
        }
    }

    let candidates = store.certificates_for_tenant(record.tenant_id).await?;
    select_certificate(candidates, record.tenant_id, now)
        .ok_or(SubmissionError::NoActiveCertificate {
            tenant_id: record.tenant_id,
        })
}

pub fn select_certificate(
    candidates: Vec<SigningCertificate>,
    tenant_id: TenantId,
    now: DateTime<Utc>,
) -> Option<SigningCertificate> {
    candidates
        .into_iter()
        .filter(|cert| cert.tenant_id == tenant_id && cert.is_usable(now))
        .min_by(|a, b| b.valid_to.cmp(&a.valid_to).then(a.id.cmp(&b.id)))
}

/// Best effort; a failed touch never fails the submission.
pub async fn touch_quietly(store: &dyn CertificateStore, certificate: &SigningCertificate, now: DateTime<Utc>) {
    if let Err(e) = store.touch_certificate(certificate.id, now).await {
        tracing::warn!(
            certificate_id = certificate.id,
            error = %e,
            "Failed to update certificate last_used_at"
        );
    }
}
