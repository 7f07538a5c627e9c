//! Drives one invoice through generation, signing and portal submission.
//!
//! A run holds the record's lease from the first write to the last, so
//! attempts for one record never overlap. Every failure is persisted on the
//! attempt or the record before it is returned to the caller.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use super::certificates::{resolve_certificate, touch_quietly};
use super::errors::{SubmissionError, SubmissionFailure};
use super::retry::RetryPolicy;
use super::traits::*;
use super::types::*;
use crate::config::SubmissionConfig;
use crate::telemetry::{create_submission_span, generate_correlation_id, worker_identity};

const ABANDONED_MESSAGE: &str = "Attempt abandoned: worker lease expired before a result was recorded";
const DEFAULT_MODE: &str = "portal";

pub struct SubmissionOrchestrator {
    config: SubmissionConfig,
    policy: RetryPolicy,
    store: Arc<dyn SubmissionStore>,
    certificates: Arc<dyn CertificateStore>,
    generator: Arc<dyn DocumentGenerator>,
    signer: Arc<dyn Signer>,
    portal: Arc<dyn PortalSubmitter>,
    clock: Arc<dyn Clock>,
    mode: String,
    worker_id: String,
}

/// Budget bookkeeping for the record's current cycle
#[derive(Debug, Clone, Copy)]
struct CycleUsage {
    attempts: u32,
    preparation_failures: u32,
}

impl CycleUsage {
    fn used(&self) -> u32 {
        self.attempts + self.preparation_failures
    }
}

impl SubmissionOrchestrator {
    pub fn new(
        config: SubmissionConfig,
        store: Arc<dyn SubmissionStore>,
        certificates: Arc<dyn CertificateStore>,
        generator: Arc<dyn DocumentGenerator>,
        signer: Arc<dyn Signer>,
        portal: Arc<dyn PortalSubmitter>,
    ) -> Self {
        Self {
            policy: RetryPolicy::from(&config),
            config,
            store,
            certificates,
            generator,
            signer,
            portal,
            clock: Arc::new(SystemClock),
            mode: DEFAULT_MODE.to_string(),
            worker_id: worker_identity(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Portal mode flag used unless a call overrides it.
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run one submission step for `record_id`.
    ///
    /// Returns an [`Outcome`] when the run ended in a definite state, and a
    /// [`SubmissionFailure`] carrying the scheduler directive otherwise.
    pub async fn submit(
        &self,
        record_id: RecordId,
        initiator: Option<UserId>,
        options: &SubmitOptions,
    ) -> Result<Outcome, SubmissionFailure> {
        let correlation_id = generate_correlation_id();
        let span = create_submission_span(record_id, initiator, &self.worker_id, &correlation_id);

        async move {
            let now = self.clock.now();

            // Read-only pre-check: resolved records cost zero writes.
            let record = self
                .store
                .load_record(record_id)
                .await
                .map_err(|e| self.unpersisted(record_id, e.into(), now))?
                .ok_or_else(|| SubmissionFailure {
                    record_id,
                    attempt_id: None,
                    next_retry_at: None,
                    error: SubmissionError::NotFound(record_id),
                })?;
            tracing::Span::current().record("tenant.id", record.tenant_id);

            if let Some(outcome) = self.short_circuit(&record, options, now).await {
                debug!(?outcome, status = %record.status, "Nothing to do for record");
                return Ok(outcome);
            }

            // One holder per run: overlapping calls through the same
            // orchestrator must not share a lease.
            let holder = format!("{}/{}", self.worker_id, correlation_id);
            let record = match self
                .store
                .acquire_lease(record_id, &holder, now, self.lease_ttl())
                .await
                .map_err(|e| self.unpersisted(record_id, e.into(), now))?
            {
                LeaseOutcome::Acquired(record) => record,
                LeaseOutcome::Held(lease) => {
                    info!(holder = %lease.holder, expires_at = %lease.expires_at, "Record is leased by another run");
                    return Ok(Outcome::Busy {
                        holder: lease.holder,
                        lease_expires_at: lease.expires_at,
                    });
                }
                LeaseOutcome::NotFound => {
                    return Err(SubmissionFailure {
                        record_id,
                        attempt_id: None,
                        next_retry_at: None,
                        error: SubmissionError::NotFound(record_id),
                    })
                }
            };

            let result = self.run_leased(record, &holder, initiator, options).await;

            if let Err(e) = self.store.release_lease(record_id, &holder).await {
                warn!(error = %e, "Failed to release record lease; it will expire on its own");
            }

            match &result {
                Ok(outcome) => info!(?outcome, "Submission run finished"),
                Err(failure) => warn!(
                    error = %failure.error,
                    kind = ?failure.kind(),
                    next_retry_at = ?failure.next_retry_at,
                    "Submission run failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Decide without writing whether the run can stop right away.
    async fn short_circuit(
        &self,
        record: &InvoiceSubmissionRecord,
        options: &SubmitOptions,
        now: DateTime<Utc>,
    ) -> Option<Outcome> {
        if record.status.is_final() {
            return Some(Outcome::Skipped { status: record.status });
        }
        // A FAILED record with a retry scheduled is a resubmission in progress.
        if record.status == RecordStatus::Failed
            && record.next_retry_at.is_none()
            && !options.resubmit
        {
            return Some(Outcome::Skipped { status: record.status });
        }
        match record.next_retry_at {
            Some(at) if at > now => {
                let attempt_id = match self.store.latest_attempt(record.id).await {
                    Ok(attempt) => attempt.map(|a| a.id),
                    Err(e) => {
                        warn!(error = %e, "Could not load latest attempt for retry outcome");
                        None
                    }
                };
                Some(Outcome::RetryScheduled {
                    attempt_id,
                    next_retry_at: at,
                })
            }
            _ => None,
        }
    }

    fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.lease_ttl_seconds as i64)
    }

    async fn run_leased(
        &self,
        mut record: InvoiceSubmissionRecord,
        holder: &str,
        initiator: Option<UserId>,
        options: &SubmitOptions,
    ) -> Result<Outcome, SubmissionFailure> {
        let now = self.clock.now();
        let record_id = record.id;

        // Someone may have resolved the record between the pre-check and the lease.
        if let Some(outcome) = self.short_circuit(&record, options, now).await {
            return Ok(outcome);
        }

        if record.status == RecordStatus::Failed && record.next_retry_at.is_none() {
            record
                .begin_cycle(now)
                .map_err(|e| self.unpersisted(record_id, e.into(), now))?;
            record = self.persist_record(&record, now).await?;
            info!(cycle = record.cycle, "Operator resubmission opened a new cycle");
        }

        let mut attempts = self
            .store
            .list_attempts(record_id)
            .await
            .map_err(|e| self.unpersisted(record_id, e.into(), now))?;
        self.close_abandoned(&mut attempts, now).await;

        // The authority already answered but the record write was lost.
        if let Some(answered) = attempts
            .last()
            .filter(|a| a.cycle == record.cycle && a.status.is_final())
        {
            return self.settle_from_attempt(record, answered, now).await;
        }

        let usage = CycleUsage {
            attempts: attempts.iter().filter(|a| a.cycle == record.cycle).count() as u32,
            preparation_failures: record.preparation_failures,
        };

        if usage.used() >= self.policy.max_attempts {
            return self.exhaust_on_entry(record, &attempts, now).await;
        }

        if let Err(error) = self.prepare(&mut record, options, now).await {
            return Err(self.preparation_failed(record, usage, error, now).await);
        }

        let ordinal = attempts.len() as u32 + 1;
        let idempotency_key = SubmissionAttempt::idempotency_key_for(record_id, ordinal);
        let attempt = match self
            .store
            .insert_attempt(NewAttempt {
                record_id,
                tenant_id: record.tenant_id,
                initiator_id: initiator,
                ordinal,
                cycle: record.cycle,
                retry_count: usage.attempts,
                idempotency_key: idempotency_key.clone(),
                submitted_at: now,
            })
            .await
        {
            Ok(attempt) => attempt,
            Err(e) => return Err(self.preparation_failed(record, usage, e.into(), now).await),
        };
        tracing::Span::current().record("attempt.id", attempt.id);
        info!(
            attempt_id = attempt.id,
            ordinal,
            cycle = record.cycle,
            idempotency_key = %idempotency_key,
            "Created submission attempt"
        );

        let tries_used = usage.used() + 1;
        let mut submitted = record.clone();
        // Generation and signing ate into the lease; the portal call gets a
        // full one. The versioned write fails if another run took over.
        submitted.renew_lease(holder, self.clock.now() + self.lease_ttl());
        let marked = submitted.mark_submitted(now).and_then(|_| submitted.schedule_retry(None, now));
        if let Err(e) = marked {
            return Err(self
                .attempt_failed(record, attempt, tries_used, e.into(), json!({}), now)
                .await);
        }
        let record = match self.store.update_record(&submitted).await {
            Ok(stored) => stored,
            Err(e) => {
                return Err(self
                    .attempt_failed(record, attempt, tries_used, e.into(), json!({}), now)
                    .await)
            }
        };

        let request = PortalRequest {
            idempotency_key,
            mode: options.mode.clone().unwrap_or_else(|| self.mode.clone()),
            timeout: self.policy.attempt_timeout,
        };
        let signed_document = record.signed_document.clone().unwrap_or_default();

        let response = match tokio::time::timeout(
            self.policy.attempt_timeout,
            self.portal.submit(&signed_document, &request),
        )
        .await
        {
            Ok(result) => result.map_err(SubmissionError::from),
            Err(_) => Err(SubmissionError::PortalTimeout {
                timeout_secs: self.policy.attempt_timeout.as_secs(),
            }),
        };
        // Results are stamped when they arrive, not when the run started.
        let now = self.clock.now();

        match response {
            Ok(response) => self.resolve(record, attempt, tries_used, response, now).await,
            Err(error) => {
                let payload = json!({ "error": error.to_string(), "kind": format!("{:?}", error.kind()) });
                Err(self
                    .attempt_failed(record, attempt, tries_used, error, payload, now)
                    .await)
            }
        }
    }

    /// Steps before an attempt exists: regenerate, pick a certificate, sign.
    /// `record` always holds the last stored version.
    async fn prepare(
        &self,
        record: &mut InvoiceSubmissionRecord,
        options: &SubmitOptions,
        now: DateTime<Utc>,
    ) -> Result<(), SubmissionError> {
        let document = self.generator.generate(record).await?;
        let mut next = record.clone();
        next.set_document(document, now)?;
        *record = self.store.update_record(&next).await?;

        let certificate = resolve_certificate(record, self.certificates.as_ref(), now).await?;
        debug!(
            certificate_id = certificate.id,
            days_until_expiry = certificate.days_until_expiry(now),
            "Resolved signing certificate"
        );

        let document = record.document.as_deref().unwrap_or_default();
        let signed = self
            .signer
            .sign(document, &certificate, options.certificate_password.as_deref())
            .await?;

        let mut next = record.clone();
        next.mark_signed(signed, certificate.id, now)?;
        *record = self.store.update_record(&next).await?;
        touch_quietly(self.certificates.as_ref(), &certificate, now).await;

        Ok(())
    }

    async fn resolve(
        &self,
        record: InvoiceSubmissionRecord,
        mut attempt: SubmissionAttempt,
        tries_used: u32,
        response: PortalResponse,
        now: DateTime<Utc>,
    ) -> Result<Outcome, SubmissionFailure> {
        let payload = response.to_payload();
        match response.verdict() {
            PortalVerdict::Accepted { receipt_number } => {
                let mut next = record.clone();
                let applied = next.mark_accepted(now).and_then(|_| {
                    attempt.mark_accepted(
                        receipt_number.clone(),
                        response.upload_id.clone(),
                        payload.clone(),
                        now,
                    )
                });
                if let Err(e) = applied {
                    return Err(self
                        .attempt_failed(record, attempt, tries_used, e.into(), payload, now)
                        .await);
                }
                self.commit_resolution(&attempt, &next, now).await?;

                info!(
                    attempt_id = attempt.id,
                    receipt_number = receipt_number.as_deref().unwrap_or(""),
                    upload_id = response.upload_id.as_deref().unwrap_or(""),
                    "Invoice accepted by tax authority"
                );
                Ok(Outcome::Accepted {
                    attempt_id: attempt.id,
                    receipt_number,
                })
            }
            PortalVerdict::Rejected { reason } => {
                let mut next = record.clone();
                let applied = next
                    .mark_rejected(&reason, now)
                    .and_then(|_| attempt.mark_rejected(&reason, payload.clone(), now));
                if let Err(e) = applied {
                    return Err(self
                        .attempt_failed(record, attempt, tries_used, e.into(), payload, now)
                        .await);
                }
                self.commit_resolution(&attempt, &next, now).await?;

                warn!(attempt_id = attempt.id, reason = %reason, "Invoice rejected by tax authority");
                Ok(Outcome::Rejected {
                    attempt_id: attempt.id,
                    reason,
                })
            }
            PortalVerdict::Indeterminate { reason } => {
                let error = SubmissionError::UnknownPortalResponse {
                    reason,
                    raw_output: response.raw_output.clone(),
                };
                Err(self
                    .attempt_failed(record, attempt, tries_used, error, payload, now)
                    .await)
            }
        }
    }

    /// Bring the record in line with an attempt that is already ACCEPTED or
    /// REJECTED. The portal is not called again.
    async fn settle_from_attempt(
        &self,
        mut record: InvoiceSubmissionRecord,
        attempt: &SubmissionAttempt,
        now: DateTime<Utc>,
    ) -> Result<Outcome, SubmissionFailure> {
        let outcome = match attempt.status {
            AttemptStatus::Accepted => {
                record
                    .mark_accepted(now)
                    .map_err(|e| self.unpersisted(record.id, e.into(), now))?;
                Outcome::Accepted {
                    attempt_id: attempt.id,
                    receipt_number: attempt.receipt_number.clone(),
                }
            }
            _ => {
                let reason = attempt
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Rejected by tax authority".to_string());
                record
                    .mark_rejected(&reason, now)
                    .map_err(|e| self.unpersisted(record.id, e.into(), now))?;
                Outcome::Rejected {
                    attempt_id: attempt.id,
                    reason,
                }
            }
        };
        self.persist_record(&record, now).await?;

        warn!(
            attempt_id = attempt.id,
            attempt_status = %attempt.status,
            "Recovered authority answer that was not applied to the record"
        );
        Ok(outcome)
    }

    /// Write a definite answer: attempt first, then the record.
    async fn commit_resolution(
        &self,
        attempt: &SubmissionAttempt,
        record: &InvoiceSubmissionRecord,
        now: DateTime<Utc>,
    ) -> Result<(), SubmissionFailure> {
        let written = match self.store.update_attempt(attempt).await {
            Ok(()) => self.store.update_record(record).await.map(|_| ()),
            Err(e) => Err(e),
        };
        written.map_err(|e| {
            error!(
                attempt_id = attempt.id,
                error = %e,
                "Failed to persist the authority's answer"
            );
            SubmissionFailure {
                record_id: record.id,
                attempt_id: Some(attempt.id),
                next_retry_at: self.policy.next_retry_at(1, now),
                error: e.into(),
            }
        })
    }

    /// Close PENDING rows left behind by a worker whose lease expired.
    async fn close_abandoned(&self, attempts: &mut [SubmissionAttempt], now: DateTime<Utc>) {
        for attempt in attempts
            .iter_mut()
            .filter(|a| a.status == AttemptStatus::Pending)
        {
            let mut closed = attempt.clone();
            if closed
                .mark_error(ABANDONED_MESSAGE, json!({ "abandoned": true }), None, now)
                .is_err()
            {
                continue;
            }
            match self.store.update_attempt(&closed).await {
                Ok(()) => {
                    warn!(attempt_id = attempt.id, "Closed abandoned attempt");
                    *attempt = closed;
                }
                Err(e) => error!(attempt_id = attempt.id, error = %e, "Failed to close abandoned attempt"),
            }
        }
    }

    async fn exhaust_on_entry(
        &self,
        mut record: InvoiceSubmissionRecord,
        attempts: &[SubmissionAttempt],
        now: DateTime<Utc>,
    ) -> Result<Outcome, SubmissionFailure> {
        let reason = record
            .last_error
            .clone()
            .or_else(|| attempts.last().and_then(|a| a.error_message.clone()))
            .unwrap_or_else(|| "Retry budget exhausted".to_string());

        record
            .mark_failed(&reason, now)
            .map_err(|e| self.unpersisted(record.id, e.into(), now))?;
        self.persist_record(&record, now).await?;

        warn!(reason = %reason, "Retry budget exhausted; record failed");
        Ok(Outcome::Failed {
            attempt_id: attempts.last().map(|a| a.id),
            reason,
        })
    }

    /// A failure before any attempt row was written. Counted against the
    /// cycle on the record itself.
    async fn preparation_failed(
        &self,
        mut record: InvoiceSubmissionRecord,
        usage: CycleUsage,
        error: SubmissionError,
        now: DateTime<Utc>,
    ) -> SubmissionFailure {
        let message = error.to_string();
        let tries_used = usage.used() + 1;
        let next_retry_at = if error.is_retryable(self.config.retry_missing_certificate) {
            self.policy.next_retry_at(tries_used, now)
        } else {
            None
        };

        let updated = record.record_preparation_failure(&message, now).and_then(|_| {
            match next_retry_at {
                Some(at) => record.schedule_retry(Some(at), now),
                None => record.mark_failed(&message, now),
            }
        });

        match updated {
            Ok(()) => {
                if let Err(e) = self.store.update_record(&record).await {
                    error!(error = %e, original_error = %message, "Failed to persist preparation failure");
                }
            }
            Err(e) => error!(error = %e, "Could not record preparation failure"),
        }

        warn!(
            error = %message,
            kind = ?error.kind(),
            tries_used,
            next_retry_at = ?next_retry_at,
            "Submission failed before an attempt was created"
        );

        SubmissionFailure {
            record_id: record.id,
            attempt_id: None,
            next_retry_at,
            error,
        }
    }

    /// Close `attempt` as ERROR and schedule the next try, or fail the
    /// record when the cycle budget is spent.
    async fn attempt_failed(
        &self,
        mut record: InvoiceSubmissionRecord,
        mut attempt: SubmissionAttempt,
        tries_used: u32,
        error: SubmissionError,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> SubmissionFailure {
        let message = error.to_string();
        let next_retry_at = if error.is_retryable(self.config.retry_missing_certificate) {
            self.policy.next_retry_at(tries_used, now)
        } else {
            None
        };

        match attempt.mark_error(&message, payload, next_retry_at, now) {
            Ok(()) => {
                if let Err(e) = self.store.update_attempt(&attempt).await {
                    error!(attempt_id = attempt.id, error = %e, "Failed to persist attempt error");
                }
            }
            Err(e) => error!(attempt_id = attempt.id, error = %e, "Could not close attempt"),
        }

        let updated = match next_retry_at {
            Some(at) => {
                record.last_error = Some(message.clone());
                record.schedule_retry(Some(at), now)
            }
            None => record.mark_failed(&message, now),
        };
        match updated {
            Ok(()) => {
                if let Err(e) = self.store.update_record(&record).await {
                    error!(error = %e, original_error = %message, "Failed to persist record after attempt error");
                }
            }
            Err(e) => error!(error = %e, "Could not update record after attempt error"),
        }

        if next_retry_at.is_none() {
            warn!(attempt_id = attempt.id, error = %message, "Retries exhausted; record failed");
        }

        SubmissionFailure {
            record_id: record.id,
            attempt_id: Some(attempt.id),
            next_retry_at,
            error,
        }
    }

    async fn persist_record(
        &self,
        record: &InvoiceSubmissionRecord,
        now: DateTime<Utc>,
    ) -> Result<InvoiceSubmissionRecord, SubmissionFailure> {
        self.store
            .update_record(record)
            .await
            .map_err(|e| self.unpersisted(record.id, e.into(), now))
    }

    /// A failure that could not be written anywhere. Retryable storage
    /// problems get the first rung of the ladder as a directive.
    fn unpersisted(&self, record_id: RecordId, error: SubmissionError, now: DateTime<Utc>) -> SubmissionFailure {
        let next_retry_at = if error.is_retryable(self.config.retry_missing_certificate) {
            self.policy.next_retry_at(1, now)
        } else {
            None
        };
        SubmissionFailure {
            record_id,
            attempt_id: None,
            next_retry_at,
            error,
        }
    }
}
