// Tests for the submission state machine, run entirely in memory

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::errors::*;
use super::mocks::*;
use super::orchestrator::SubmissionOrchestrator;
use super::traits::*;
use super::types::*;
use crate::config::SubmissionConfig;
use crate::storage::InMemoryStore;

const RECORD: RecordId = 1;
const TENANT: TenantId = 7;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn certificate(id: CertificateId, valid_days: i64) -> SigningCertificate {
    SigningCertificate {
        id,
        tenant_id: TENANT,
        name: format!("cert-{id}"),
        certificate_path: PathBuf::from(format!("/certs/{id}.pfx")),
        valid_from: Some(t0() - Duration::days(30)),
        valid_to: t0() + Duration::days(valid_days),
        is_active: true,
        last_used_at: None,
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
    generator: Arc<FakeGenerator>,
    signer: Arc<FakeSigner>,
    portal: Arc<ScriptedPortal>,
    orchestrator: SubmissionOrchestrator,
}

impl Harness {
    async fn new() -> Self {
        Self::build(SubmissionConfig::default(), ScriptedPortal::new(), true).await
    }

    async fn build(config: SubmissionConfig, portal: ScriptedPortal, with_certificate: bool) -> Self {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_record(InvoiceSubmissionRecord::new_draft(RECORD, 100, TENANT, t0()))
            .await;
        if with_certificate {
            store.insert_certificate(certificate(3, 365)).await;
        }

        let clock = Arc::new(ManualClock::new(t0()));
        let generator = Arc::new(FakeGenerator::default());
        let signer = Arc::new(FakeSigner::new());
        let portal = Arc::new(portal);

        let orchestrator = Self::orchestrator_for(
            config,
            &store,
            &clock,
            &generator,
            &signer,
            &portal,
            "worker-a",
        );

        Self {
            store,
            clock,
            generator,
            signer,
            portal,
            orchestrator,
        }
    }

    fn orchestrator_for(
        config: SubmissionConfig,
        store: &Arc<InMemoryStore>,
        clock: &Arc<ManualClock>,
        generator: &Arc<FakeGenerator>,
        signer: &Arc<FakeSigner>,
        portal: &Arc<ScriptedPortal>,
        worker_id: &str,
    ) -> SubmissionOrchestrator {
        SubmissionOrchestrator::new(
            config,
            store.clone(),
            store.clone(),
            generator.clone(),
            signer.clone(),
            portal.clone(),
        )
        .with_clock(clock.clone())
        .with_worker_id(worker_id)
    }

    async fn submit(&self) -> Result<Outcome, SubmissionFailure> {
        self.orchestrator
            .submit(RECORD, Some(11), &SubmitOptions::default())
            .await
    }

    async fn record(&self) -> InvoiceSubmissionRecord {
        self.store.load_record(RECORD).await.unwrap().unwrap()
    }

    async fn attempts(&self) -> Vec<SubmissionAttempt> {
        self.store.list_attempts(RECORD).await.unwrap()
    }
}

#[tokio::test]
async fn test_happy_path_draft_to_accepted() {
    let h = Harness::new().await;

    let outcome = h.submit().await.unwrap();

    let attempts = h.attempts().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(
        outcome,
        Outcome::Accepted {
            attempt_id: attempts[0].id,
            receipt_number: Some("R-1".to_string())
        }
    );

    let attempt = &attempts[0];
    assert_eq!(attempt.status, AttemptStatus::Accepted);
    assert_eq!(attempt.receipt_number.as_deref(), Some("R-1"));
    assert_eq!(attempt.idempotency_key, "einvoice-1-attempt-1");
    assert_eq!(attempt.initiator_id, Some(11));
    assert_eq!(attempt.retry_count, 0);
    assert_eq!(attempt.response["receipt_number"], "R-1");

    let record = h.record().await;
    assert_eq!(record.status, RecordStatus::Accepted);
    assert_eq!(record.submitted_at, Some(t0()));
    assert_eq!(record.accepted_at, Some(t0()));
    assert_eq!(record.document.as_deref(), Some("<Invoice/>"));
    assert_eq!(record.certificate_id, Some(3));
    assert!(record.lease.is_none());

    assert_eq!(h.signer.used_certificates(), vec![3]);
    assert_eq!(h.portal.requests()[0].idempotency_key, "einvoice-1-attempt-1");
    assert_eq!(h.portal.requests()[0].mode, "portal");

    let cert = h.store.find_certificate(3).await.unwrap().unwrap();
    assert_eq!(cert.last_used_at, Some(t0()));
}

#[tokio::test]
async fn test_resolved_records_are_skipped_without_writes() {
    let h = Harness::new().await;
    h.submit().await.unwrap();
    let writes = h.store.write_count().await;

    let outcome = h.submit().await.unwrap();

    assert_eq!(outcome, Outcome::Skipped { status: RecordStatus::Accepted });
    assert_eq!(h.store.write_count().await, writes);
    assert_eq!(h.portal.calls(), 1);
    assert_eq!(h.generator.calls(), 1);
}

#[tokio::test]
async fn test_rejection_is_terminal() {
    let h = Harness::new().await;
    h.portal.push(Ok(rejected_response("bad VAT id")));

    let outcome = h.submit().await.unwrap();

    let attempts = h.attempts().await;
    assert_eq!(
        outcome,
        Outcome::Rejected {
            attempt_id: attempts[0].id,
            reason: "bad VAT id".to_string()
        }
    );
    assert_eq!(attempts[0].status, AttemptStatus::Rejected);
    assert_eq!(attempts[0].error_message.as_deref(), Some("bad VAT id"));

    let record = h.record().await;
    assert_eq!(record.status, RecordStatus::Rejected);
    assert_eq!(record.rejection_reason.as_deref(), Some("bad VAT id"));
    assert!(record.next_retry_at.is_none());

    let writes = h.store.write_count().await;
    h.clock.advance(Duration::hours(1));
    assert_eq!(
        h.submit().await.unwrap(),
        Outcome::Skipped { status: RecordStatus::Rejected }
    );
    assert_eq!(h.attempts().await.len(), 1);
    assert_eq!(h.store.write_count().await, writes);
}

#[tokio::test]
async fn test_backoff_ladder_then_failed() {
    let h = Harness::new().await;
    for _ in 0..3 {
        h.portal.push(Err(PortalError::Timeout { timeout_secs: 120 }));
    }

    // Attempt 1
    let failure = h.submit().await.unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::PortalTransient);
    let next = failure.next_retry_at.unwrap();
    assert!(next >= t0() + Duration::seconds(60) && next < t0() + Duration::seconds(61));

    let record = h.record().await;
    assert_eq!(record.status, RecordStatus::Submitted);
    assert_eq!(record.next_retry_at, Some(next));
    assert!(record.lease.is_none());

    // Not yet due: nothing happens.
    let early = h.submit().await.unwrap();
    assert_eq!(
        early,
        Outcome::RetryScheduled {
            attempt_id: failure.attempt_id,
            next_retry_at: next
        }
    );
    assert_eq!(h.portal.calls(), 1);

    // Attempt 2
    h.clock.set(next);
    let failure = h.submit().await.unwrap_err();
    let next = failure.next_retry_at.unwrap();
    assert!(next >= h.clock.now() + Duration::seconds(300));
    assert!(next < h.clock.now() + Duration::seconds(301));

    // Attempt 3 exhausts the cycle
    h.clock.set(next);
    let failure = h.submit().await.unwrap_err();
    assert!(failure.next_retry_at.is_none());
    assert!(!failure.will_retry());

    let record = h.record().await;
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(
        record.last_error.as_deref(),
        Some("portal submission timed out after 120s")
    );

    let attempts = h.attempts().await;
    assert_eq!(attempts.len(), 3);
    assert_eq!(
        attempts.iter().map(|a| a.retry_count).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Error));
    assert!(attempts[2].next_retry_at.is_none());
    assert_eq!(attempts[2].idempotency_key, "einvoice-1-attempt-3");

    h.clock.advance(Duration::hours(1));
    assert_eq!(
        h.submit().await.unwrap(),
        Outcome::Skipped { status: RecordStatus::Failed }
    );
    assert_eq!(h.portal.calls(), 3);
}

#[tokio::test]
async fn test_malformed_output_is_recorded_as_error() {
    let h = Harness::new().await;
    h.portal.push(Ok(garbage_response()));

    let failure = h.submit().await.unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::Unknown);
    assert!(failure.will_retry());
    match &failure.error {
        SubmissionError::UnknownPortalResponse { reason, raw_output } => {
            assert_eq!(reason, "Unexpected upload status: unknown");
            assert_eq!(raw_output, "%%% segmentation fault %%%");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let attempt = &h.attempts().await[0];
    assert_eq!(attempt.status, AttemptStatus::Error);
    assert_eq!(attempt.response["raw_output"], "%%% segmentation fault %%%");
    assert_eq!(attempt.response["idempotency_key"], "einvoice-1-attempt-1");
    assert_eq!(h.record().await.status, RecordStatus::Submitted);
}

#[tokio::test]
async fn test_success_flag_without_accepted_status_is_not_accepted() {
    let h = Harness::new().await;
    let mut response = accepted_response("R-9");
    response.status = "processing".to_string();
    h.portal.push(Ok(response));

    let failure = h.submit().await.unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::Unknown);
    assert_eq!(h.record().await.status, RecordStatus::Submitted);
}

#[tokio::test]
async fn test_concurrent_submits_call_portal_once() {
    let h = Harness::build(
        SubmissionConfig::default(),
        ScriptedPortal::with_delay(std::time::Duration::from_millis(200)),
        true,
    )
    .await;
    let other = Harness::orchestrator_for(
        SubmissionConfig::default(),
        &h.store,
        &h.clock,
        &h.generator,
        &h.signer,
        &h.portal,
        "worker-b",
    );
    let options = SubmitOptions::default();

    let (a, b) = tokio::join!(
        h.orchestrator.submit(RECORD, None, &options),
        other.submit(RECORD, None, &options)
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(h.portal.calls(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Accepted { .. }))
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Busy { .. }))
            .count(),
        1
    );
    assert_eq!(h.attempts().await.len(), 1);
}

#[tokio::test]
async fn test_foreign_lease_returns_busy_until_expiry() {
    let h = Harness::new().await;
    h.store
        .acquire_lease(RECORD, "worker-z", t0(), Duration::seconds(180))
        .await
        .unwrap();

    let outcome = h.submit().await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Busy {
            holder: "worker-z".to_string(),
            lease_expires_at: t0() + Duration::seconds(180)
        }
    );
    assert_eq!(h.portal.calls(), 0);

    h.clock.advance(Duration::seconds(180));
    assert!(matches!(h.submit().await.unwrap(), Outcome::Accepted { .. }));
}

#[tokio::test]
async fn test_abandoned_attempt_is_closed_before_next() {
    let h = Harness::new().await;
    h.store
        .acquire_lease(RECORD, "crashed-worker", t0(), Duration::seconds(180))
        .await
        .unwrap();
    h.store
        .insert_attempt(NewAttempt {
            record_id: RECORD,
            tenant_id: TENANT,
            initiator_id: None,
            ordinal: 1,
            cycle: 1,
            retry_count: 0,
            idempotency_key: SubmissionAttempt::idempotency_key_for(RECORD, 1),
            submitted_at: t0(),
        })
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(181));
    let outcome = h.submit().await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted { .. }));

    let attempts = h.attempts().await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, AttemptStatus::Error);
    assert!(attempts[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("abandoned"));
    assert_eq!(attempts[1].status, AttemptStatus::Accepted);
    assert_eq!(attempts[1].ordinal, 2);
    assert_eq!(attempts[1].retry_count, 1);
    assert_eq!(attempts[1].idempotency_key, "einvoice-1-attempt-2");
}

#[tokio::test]
async fn test_missing_certificate_counts_against_budget() {
    let h = Harness::build(SubmissionConfig::default(), ScriptedPortal::new(), false).await;

    let failure = h.submit().await.unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::NoActiveCertificate);
    assert_eq!(failure.attempt_id, None);
    assert_eq!(failure.next_retry_at, Some(t0() + Duration::seconds(60)));
    assert_eq!(h.portal.calls(), 0);
    assert!(h.attempts().await.is_empty());

    let record = h.record().await;
    assert_eq!(record.preparation_failures, 1);
    assert_eq!(
        record.last_error.as_deref(),
        Some("no active certificate found for tenant: 7")
    );
    assert_eq!(record.status, RecordStatus::Draft);
}

#[tokio::test]
async fn test_missing_certificate_can_fail_immediately() {
    let config = SubmissionConfig {
        retry_missing_certificate: false,
        ..SubmissionConfig::default()
    };
    let h = Harness::build(config, ScriptedPortal::new(), false).await;

    let failure = h.submit().await.unwrap_err();

    assert!(failure.next_retry_at.is_none());
    assert_eq!(h.record().await.status, RecordStatus::Failed);
}

#[tokio::test]
async fn test_preparation_failures_exhaust_cycle() {
    let h = Harness::new().await;
    for _ in 0..3 {
        h.generator
            .push_result(Err(GeneratorError::Failed("template missing".to_string())));
    }

    for _ in 0..2 {
        let failure = h.submit().await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::Generation);
        h.clock.set(failure.next_retry_at.unwrap());
    }
    let failure = h.submit().await.unwrap_err();
    assert!(failure.next_retry_at.is_none());

    let record = h.record().await;
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.preparation_failures, 3);
    assert_eq!(h.portal.calls(), 0);
}

#[tokio::test]
async fn test_signing_failure_then_success() {
    let h = Harness::new().await;
    h.signer
        .fail_next(SignerError::Failed("token locked".to_string()));

    let failure = h.submit().await.unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::Signing);

    h.clock.set(failure.next_retry_at.unwrap());
    let outcome = h.submit().await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted { .. }));

    let attempts = h.attempts().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].retry_count, 0);
}

#[tokio::test]
async fn test_resubmit_opens_new_cycle() {
    let config = SubmissionConfig {
        max_attempts: 1,
        ..SubmissionConfig::default()
    };
    let h = Harness::build(config, ScriptedPortal::new(), true).await;
    h.portal
        .push(Err(PortalError::Unreachable("connection refused".to_string())));

    let failure = h.submit().await.unwrap_err();
    assert!(failure.next_retry_at.is_none());
    assert_eq!(h.record().await.status, RecordStatus::Failed);

    assert_eq!(
        h.submit().await.unwrap(),
        Outcome::Skipped { status: RecordStatus::Failed }
    );

    let options = SubmitOptions {
        resubmit: true,
        ..SubmitOptions::default()
    };
    let outcome = h.orchestrator.submit(RECORD, Some(12), &options).await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted { .. }));

    let record = h.record().await;
    assert_eq!(record.status, RecordStatus::Accepted);
    assert_eq!(record.cycle, 2);

    let attempts = h.attempts().await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].cycle, 2);
    assert_eq!(attempts[1].retry_count, 0);
    assert_eq!(attempts[1].idempotency_key, "einvoice-1-attempt-2");
    assert_eq!(attempts[1].initiator_id, Some(12));
}

#[tokio::test]
async fn test_options_reach_signer_and_portal() {
    let h = Harness::new().await;
    let options = SubmitOptions {
        certificate_password: Some("s3cret".to_string()),
        mode: Some("test".to_string()),
        ..SubmitOptions::default()
    };

    h.orchestrator.submit(RECORD, None, &options).await.unwrap();

    assert_eq!(h.signer.passwords(), vec![Some("s3cret".to_string())]);
    assert_eq!(h.portal.requests()[0].mode, "test");
}

#[tokio::test]
async fn test_unknown_record_is_not_found() {
    let h = Harness::new().await;

    let failure = h
        .orchestrator
        .submit(99, None, &SubmitOptions::default())
        .await
        .unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::NotFound);
    assert!(failure.next_retry_at.is_none());
    assert_eq!(h.store.write_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_portal_is_cut_off_at_attempt_timeout() {
    let h = Harness::build(
        SubmissionConfig::default(),
        ScriptedPortal::with_delay(std::time::Duration::from_secs(600)),
        true,
    )
    .await;

    let failure = h.submit().await.unwrap_err();

    assert_eq!(
        failure.error,
        SubmissionError::PortalTimeout { timeout_secs: 120 }
    );
    assert_eq!(h.attempts().await[0].status, AttemptStatus::Error);
}

#[tokio::test]
async fn test_queue_stats_reflect_retry_queue() {
    let h = Harness::new().await;
    h.portal
        .push(Err(PortalError::Unreachable("connection refused".to_string())));
    let failure = h.submit().await.unwrap_err();

    let stats = h.store.queue_stats(Some(TENANT), t0(), 3).await.unwrap();
    assert_eq!(stats.error, 1);
    assert_eq!(stats.ready_for_retry, 0);

    let due = failure.next_retry_at.unwrap();
    let stats = h.store.queue_stats(Some(TENANT), due, 3).await.unwrap();
    assert_eq!(stats.ready_for_retry, 1);
    assert_eq!(h.store.records_due_for_retry(due, 10).await.unwrap(), vec![RECORD]);
}

#[tokio::test]
async fn test_overlapping_submits_on_one_orchestrator_call_portal_once() {
    let h = Harness::build(
        SubmissionConfig::default(),
        ScriptedPortal::with_delay(std::time::Duration::from_millis(200)),
        true,
    )
    .await;
    let options = SubmitOptions::default();

    let (first, second) = tokio::join!(h.orchestrator.submit(RECORD, None, &options), async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        h.orchestrator.submit(RECORD, None, &options).await
    });

    assert!(matches!(first.unwrap(), Outcome::Accepted { .. }));
    match second.unwrap() {
        Outcome::Busy { holder, .. } => assert!(holder.starts_with("worker-a/")),
        other => panic!("expected Busy, got {other:?}"),
    }
    assert_eq!(h.portal.calls(), 1);

    let attempts = h.attempts().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Accepted);
    let record = h.record().await;
    assert_eq!(record.status, RecordStatus::Accepted);
    assert!(record.lease.is_none());
}

/// In-memory store with switchable faults: the first write of a resolved
/// record can be lost, and attempt reads can fail.
struct FaultyStore {
    inner: Arc<InMemoryStore>,
    lose_resolved_write: AtomicBool,
    fail_attempt_reads: AtomicBool,
}

impl FaultyStore {
    fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            lose_resolved_write: AtomicBool::new(false),
            fail_attempt_reads: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SubmissionStore for FaultyStore {
    async fn load_record(&self, id: RecordId) -> Result<Option<InvoiceSubmissionRecord>, StoreError> {
        self.inner.load_record(id).await
    }

    async fn acquire_lease(
        &self,
        id: RecordId,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseOutcome, StoreError> {
        self.inner.acquire_lease(id, holder, now, ttl).await
    }

    async fn release_lease(&self, id: RecordId, holder: &str) -> Result<(), StoreError> {
        self.inner.release_lease(id, holder).await
    }

    async fn update_record(
        &self,
        record: &InvoiceSubmissionRecord,
    ) -> Result<InvoiceSubmissionRecord, StoreError> {
        if record.status.is_final() && self.lose_resolved_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.update_record(record).await
    }

    async fn list_attempts(&self, record_id: RecordId) -> Result<Vec<SubmissionAttempt>, StoreError> {
        if self.fail_attempt_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("read timeout".to_string()));
        }
        self.inner.list_attempts(record_id).await
    }

    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<SubmissionAttempt, StoreError> {
        self.inner.insert_attempt(attempt).await
    }

    async fn update_attempt(&self, attempt: &SubmissionAttempt) -> Result<(), StoreError> {
        self.inner.update_attempt(attempt).await
    }

    async fn records_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecordId>, StoreError> {
        self.inner.records_due_for_retry(now, limit).await
    }

    async fn queue_stats(
        &self,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<QueueStats, StoreError> {
        self.inner.queue_stats(tenant_id, now, max_attempts).await
    }
}

fn faulty_orchestrator(h: &Harness, store: Arc<FaultyStore>) -> SubmissionOrchestrator {
    SubmissionOrchestrator::new(
        SubmissionConfig::default(),
        store,
        h.store.clone(),
        h.generator.clone(),
        h.signer.clone(),
        h.portal.clone(),
    )
    .with_clock(h.clock.clone())
    .with_worker_id("worker-a")
}

async fn lost_write_run(
    portal: ScriptedPortal,
) -> (Harness, SubmissionOrchestrator, SubmissionFailure) {
    let h = Harness::build(SubmissionConfig::default(), portal, true).await;
    let store = Arc::new(FaultyStore::new(h.store.clone()));
    store.lose_resolved_write.store(true, Ordering::SeqCst);
    let orchestrator = faulty_orchestrator(&h, store);

    let failure = orchestrator
        .submit(RECORD, None, &SubmitOptions::default())
        .await
        .unwrap_err();
    (h, orchestrator, failure)
}

#[tokio::test]
async fn test_lost_acceptance_write_is_recovered_without_resending() {
    let (h, orchestrator, failure) = lost_write_run(ScriptedPortal::new()).await;

    assert_eq!(failure.error, SubmissionError::Storage(StoreError::Backend("disk full".to_string())));
    assert!(failure.will_retry());
    let attempts = h.attempts().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Accepted);
    assert_eq!(h.record().await.status, RecordStatus::Submitted);

    h.clock.set(failure.next_retry_at.unwrap());
    let outcome = orchestrator
        .submit(RECORD, None, &SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Outcome::Accepted {
            attempt_id: attempts[0].id,
            receipt_number: Some("R-1".to_string())
        }
    );
    assert_eq!(h.portal.calls(), 1);
    assert_eq!(h.attempts().await.len(), 1);
    let record = h.record().await;
    assert_eq!(record.status, RecordStatus::Accepted);
    assert!(record.accepted_at.is_some());
}

#[tokio::test]
async fn test_lost_rejection_write_is_recovered_without_resending() {
    let portal = ScriptedPortal::new();
    portal.push(Ok(rejected_response("invalid tax id")));
    let (h, orchestrator, failure) = lost_write_run(portal).await;
    assert!(failure.will_retry());

    h.clock.set(failure.next_retry_at.unwrap());
    let outcome = orchestrator
        .submit(RECORD, None, &SubmitOptions::default())
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Rejected { ref reason, .. } if reason == "invalid tax id"));
    assert_eq!(h.portal.calls(), 1);
    let record = h.record().await;
    assert_eq!(record.status, RecordStatus::Rejected);
    assert_eq!(record.rejection_reason.as_deref(), Some("invalid tax id"));
}

#[tokio::test]
async fn test_scheduled_retry_survives_attempt_read_failure() {
    let h = Harness::new().await;
    let retry_at = t0() + Duration::seconds(300);
    let mut record = h.record().await;
    record.schedule_retry(Some(retry_at), t0()).unwrap();
    h.store.update_record(&record).await.unwrap();

    let store = Arc::new(FaultyStore::new(h.store.clone()));
    store.fail_attempt_reads.store(true, Ordering::SeqCst);
    let orchestrator = faulty_orchestrator(&h, store);

    let outcome = orchestrator
        .submit(RECORD, None, &SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Outcome::RetryScheduled {
            attempt_id: None,
            next_retry_at: retry_at
        }
    );
    assert_eq!(h.portal.calls(), 0);
}

/// Signer that takes `stall` of clock time. With `rival` set, another run
/// claims the record once the stall outlived the lease.
struct StallingSigner {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryStore>,
    stall: Duration,
    rival: Option<&'static str>,
}

#[async_trait]
impl Signer for StallingSigner {
    async fn sign(
        &self,
        document: &str,
        _certificate: &SigningCertificate,
        _password: Option<&str>,
    ) -> Result<String, SignerError> {
        self.clock.advance(self.stall);
        if let Some(rival) = self.rival {
            let claimed = self
                .store
                .acquire_lease(RECORD, rival, self.clock.now(), Duration::seconds(180))
                .await
                .unwrap();
            assert!(matches!(claimed, LeaseOutcome::Acquired(_)));
        }
        Ok(format!("<Signed>{document}</Signed>"))
    }
}

/// Portal that notes the record's lease at the moment of the call.
struct LeaseCheckingPortal {
    store: Arc<InMemoryStore>,
    seen: std::sync::Mutex<Option<Lease>>,
}

#[async_trait]
impl PortalSubmitter for LeaseCheckingPortal {
    async fn submit(
        &self,
        _signed_document: &str,
        _request: &PortalRequest,
    ) -> Result<PortalResponse, PortalError> {
        let record = self.store.load_record(RECORD).await.unwrap().unwrap();
        *self.seen.lock().unwrap() = record.lease;
        Ok(accepted_response("R-9"))
    }
}

fn stalling_orchestrator(
    h: &Harness,
    stall: Duration,
    rival: Option<&'static str>,
    portal: Arc<dyn PortalSubmitter>,
) -> SubmissionOrchestrator {
    let signer = Arc::new(StallingSigner {
        clock: h.clock.clone(),
        store: h.store.clone(),
        stall,
        rival,
    });
    SubmissionOrchestrator::new(
        SubmissionConfig::default(),
        h.store.clone(),
        h.store.clone(),
        h.generator.clone(),
        signer,
        portal,
    )
    .with_clock(h.clock.clone())
    .with_worker_id("worker-a")
}

#[tokio::test]
async fn test_lease_is_renewed_before_portal_call() {
    let h = Harness::new().await;
    let portal = Arc::new(LeaseCheckingPortal {
        store: h.store.clone(),
        seen: std::sync::Mutex::new(None),
    });
    let orchestrator = stalling_orchestrator(&h, Duration::seconds(170), None, portal.clone());

    let outcome = orchestrator
        .submit(RECORD, None, &SubmitOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Accepted { .. }));

    // Signing used 170 of the 180 seconds; the portal call starts with a
    // fresh lease.
    let lease = portal.seen.lock().unwrap().clone().unwrap();
    assert!(lease.holder.starts_with("worker-a/"));
    assert_eq!(lease.expires_at, t0() + Duration::seconds(170 + 180));
    assert!(h.record().await.lease.is_none());
}

#[tokio::test]
async fn test_lease_taken_over_during_preparation_blocks_portal_call() {
    let h = Harness::new().await;
    let orchestrator = stalling_orchestrator(
        &h,
        Duration::seconds(200),
        Some("worker-b/rival"),
        h.portal.clone(),
    );

    let failure = orchestrator
        .submit(RECORD, None, &SubmitOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SubmissionError::Storage(StoreError::Conflict { .. })));
    assert_eq!(h.portal.calls(), 0);
    let record = h.record().await;
    assert_eq!(record.lease.map(|l| l.holder).as_deref(), Some("worker-b/rival"));
}
