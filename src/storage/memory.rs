use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

use crate::submission::errors::StoreError;
use crate::submission::traits::{CertificateStore, LeaseOutcome, QueueStats, SubmissionStore};
use crate::submission::types::*;

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<RecordId, InvoiceSubmissionRecord>,
    attempts: Vec<SubmissionAttempt>,
    idempotency_keys: HashSet<String>,
    certificates: BTreeMap<CertificateId, SigningCertificate>,
    next_attempt_id: AttemptId,
    writes: usize,
}

/// Process-local store. One mutex guards everything, so each trait call is
/// atomic with respect to the others.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record. Not counted as a write.
    pub async fn insert_record(&self, record: InvoiceSubmissionRecord) {
        self.state.lock().await.records.insert(record.id, record);
    }

    /// Seed a certificate. Not counted as a write.
    pub async fn insert_certificate(&self, certificate: SigningCertificate) {
        self.state
            .lock()
            .await
            .certificates
            .insert(certificate.id, certificate);
    }

    /// Mutating trait calls made so far.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn records(&self) -> Vec<InvoiceSubmissionRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl SubmissionStore for InMemoryStore {
    async fn load_record(&self, id: RecordId) -> Result<Option<InvoiceSubmissionRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn acquire_lease(
        &self,
        id: RecordId,
        holder: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<LeaseOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(LeaseOutcome::NotFound);
        };

        if let Some(lease) = record.foreign_lease(holder, now) {
            return Ok(LeaseOutcome::Held(lease.clone()));
        }

        record.lease = Some(Lease {
            holder: holder.to_string(),
            expires_at: now + ttl,
        });
        record.version += 1;
        let acquired = record.clone();
        state.writes += 1;
        Ok(LeaseOutcome::Acquired(acquired))
    }

    async fn release_lease(&self, id: RecordId, holder: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or(StoreError::RecordNotFound(id))?;

        if record.lease.as_ref().is_some_and(|lease| lease.holder == holder) {
            record.lease = None;
            record.version += 1;
            state.writes += 1;
        }
        Ok(())
    }

    async fn update_record(
        &self,
        record: &InvoiceSubmissionRecord,
    ) -> Result<InvoiceSubmissionRecord, StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .records
            .get_mut(&record.id)
            .ok_or(StoreError::RecordNotFound(record.id))?;

        if stored.version != record.version {
            return Err(StoreError::Conflict {
                record_id: record.id,
                expected: record.version,
                found: stored.version,
            });
        }

        let mut next = record.clone();
        next.version += 1;
        *stored = next.clone();
        state.writes += 1;
        Ok(next)
    }

    async fn list_attempts(&self, record_id: RecordId) -> Result<Vec<SubmissionAttempt>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .iter()
            .filter(|attempt| attempt.record_id == record_id)
            .cloned()
            .collect())
    }

    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<SubmissionAttempt, StoreError> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(&attempt.record_id) {
            return Err(StoreError::RecordNotFound(attempt.record_id));
        }
        if !state.idempotency_keys.insert(attempt.idempotency_key.clone()) {
            return Err(StoreError::DuplicateIdempotencyKey(attempt.idempotency_key));
        }

        state.next_attempt_id += 1;
        let row = SubmissionAttempt::from_new(state.next_attempt_id, attempt);
        state.attempts.push(row.clone());
        state.writes += 1;
        Ok(row)
    }

    async fn update_attempt(&self, attempt: &SubmissionAttempt) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .attempts
            .iter_mut()
            .find(|row| row.id == attempt.id)
            .ok_or(StoreError::AttemptNotFound(attempt.id))?;

        if stored.status.is_final() {
            return Err(StoreError::ImmutableAttempt(attempt.id));
        }

        *stored = attempt.clone();
        state.writes += 1;
        Ok(())
    }

    async fn records_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecordId>, StoreError> {
        let state = self.state.lock().await;
        let mut due: Vec<_> = state
            .records
            .values()
            .filter(|record| !record.status.is_final())
            .filter_map(|record| {
                record
                    .next_retry_at
                    .filter(|at| *at <= now)
                    .map(|at| (at, record.id))
            })
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn queue_stats(
        &self,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<QueueStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        let mut latest: HashMap<RecordId, &SubmissionAttempt> = HashMap::new();

        for attempt in state
            .attempts
            .iter()
            .filter(|attempt| tenant_id.map_or(true, |tenant| attempt.tenant_id == tenant))
        {
            match attempt.status {
                AttemptStatus::Pending => stats.pending += 1,
                AttemptStatus::Error => stats.error += 1,
                _ => {}
            }
            latest.insert(attempt.record_id, attempt);
        }

        stats.ready_for_retry = latest
            .values()
            .filter(|attempt| attempt.is_ready_for_retry(now, max_attempts))
            .filter(|attempt| {
                state
                    .records
                    .get(&attempt.record_id)
                    .is_some_and(|record| !record.is_terminal())
            })
            .count();

        Ok(stats)
    }
}

#[async_trait]
impl CertificateStore for InMemoryStore {
    async fn find_certificate(&self, id: CertificateId) -> Result<Option<SigningCertificate>, StoreError> {
        Ok(self.state.lock().await.certificates.get(&id).cloned())
    }

    async fn certificates_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<SigningCertificate>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .certificates
            .values()
            .filter(|cert| cert.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn touch_certificate(&self, id: CertificateId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(cert) = state.certificates.get_mut(&id) {
            cert.last_used_at = Some(at);
            state.writes += 1;
        }
        Ok(())
    }
}
