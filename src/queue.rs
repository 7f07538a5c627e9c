//! Worker pool that drives submissions and their retries.
//!
//! The orchestrator never sleeps; this queue does. Jobs arrive over an mpsc
//! channel, wait for their `not_before` time, and run under a semaphore.
//! Retry directives coming back from a run are turned into deferred jobs,
//! and a periodic sweep of the store picks up retries that were scheduled
//! before a restart.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::submission::{Outcome, SubmissionFailure, SubmissionOrchestrator, SubmitOptions};
use crate::submission::types::{RecordId, UserId};

#[derive(Debug, Clone)]
pub struct SubmissionJob {
    pub record_id: RecordId,
    pub initiator: Option<UserId>,
    pub options: SubmitOptions,
    pub not_before: Option<DateTime<Utc>>,
}

impl SubmissionJob {
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            initiator: None,
            options: SubmitOptions::default(),
            not_before: None,
        }
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Follow-up run for the same record; operator flags do not carry over.
    fn follow_up(&self, at: DateTime<Utc>) -> Self {
        Self {
            record_id: self.record_id,
            initiator: self.initiator,
            options: SubmitOptions {
                resubmit: false,
                ..self.options.clone()
            },
            not_before: Some(at),
        }
    }
}

/// Counters for everything the queue has run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub processed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub retries_scheduled: usize,
    pub failed: usize,
    pub busy: usize,
    pub skipped: usize,
}

impl QueueReport {
    fn record(&mut self, result: &Result<Outcome, SubmissionFailure>) {
        self.processed += 1;
        match result {
            Ok(Outcome::Accepted { .. }) => self.accepted += 1,
            Ok(Outcome::Rejected { .. }) => self.rejected += 1,
            Ok(Outcome::RetryScheduled { .. }) => self.retries_scheduled += 1,
            Ok(Outcome::Failed { .. }) => self.failed += 1,
            Ok(Outcome::Busy { .. }) => self.busy += 1,
            Ok(Outcome::Skipped { .. }) => self.skipped += 1,
            Err(failure) if failure.will_retry() => self.retries_scheduled += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Cloneable entry point for adding jobs to a running queue.
///
/// A record is queued at most once at a time; duplicates are dropped until
/// its job has finished running.
#[derive(Clone)]
pub struct QueueHandle {
    sender: mpsc::UnboundedSender<SubmissionJob>,
    scheduled: Arc<Mutex<HashSet<RecordId>>>,
}

impl QueueHandle {
    pub fn enqueue(&self, job: SubmissionJob) -> bool {
        {
            let mut scheduled = self.scheduled.lock().unwrap_or_else(|e| e.into_inner());
            if !scheduled.insert(job.record_id) {
                debug!(record_id = job.record_id, "Record already queued");
                return false;
            }
        }
        let record_id = job.record_id;
        if self.sender.send(job).is_err() {
            self.finished(record_id);
            return false;
        }
        true
    }

    fn finished(&self, record_id: RecordId) {
        self.scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&record_id);
    }

    pub fn queued(&self) -> usize {
        self.scheduled.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct SubmissionQueue {
    orchestrator: Arc<SubmissionOrchestrator>,
    config: WorkerConfig,
    handle: QueueHandle,
    receiver: mpsc::UnboundedReceiver<SubmissionJob>,
    report: Arc<Mutex<QueueReport>>,
}

impl SubmissionQueue {
    pub fn new(orchestrator: Arc<SubmissionOrchestrator>, config: WorkerConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            orchestrator,
            config,
            handle: QueueHandle {
                sender,
                scheduled: Arc::new(Mutex::new(HashSet::new())),
            },
            receiver,
            report: Arc::new(Mutex::new(QueueReport::default())),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Queue every record whose scheduled retry is due.
    pub async fn sweep(&self) -> usize {
        sweep_due(&self.orchestrator, &self.handle, self.config.sweep_batch).await
    }

    /// Process jobs until `shutdown` flips to `true`, then wait for running
    /// submissions to finish. Deferred jobs and jobs still waiting for a
    /// permit are dropped on shutdown; the next start finds them again
    /// through the sweep.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> QueueReport {
        let SubmissionQueue {
            orchestrator,
            config,
            handle,
            mut receiver,
            report,
        } = self;

        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut running = JoinSet::new();
        let mut deferred = JoinSet::new();
        let mut sweep = tokio::time::interval(Duration::from_secs(config.sweep_interval_seconds.max(1)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            concurrency = config.concurrency,
            worker_id = orchestrator.worker_id(),
            "Submission queue started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    sweep_due(&orchestrator, &handle, config.sweep_batch).await;
                }
                Some(job) = receiver.recv() => {
                    let now = orchestrator.now();
                    match job.not_before.filter(|at| *at > now) {
                        Some(at) => {
                            let delay = (at - now).to_std().unwrap_or_default();
                            let sender = handle.sender.clone();
                            debug!(record_id = job.record_id, delay_secs = delay.as_secs(), "Deferring job");
                            deferred.spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = sender.send(SubmissionJob { not_before: None, ..job });
                            });
                        }
                        None => {
                            let semaphore = semaphore.clone();
                            let orchestrator = orchestrator.clone();
                            let handle = handle.clone();
                            let report = report.clone();
                            // Waiting for a permit happens off the loop so
                            // shutdown and completions stay observed.
                            running.spawn(async move {
                                let guard = ScheduledGuard { handle, record_id: job.record_id };
                                let Ok(_permit) = semaphore.acquire_owned().await else {
                                    debug!(record_id = guard.record_id, "Queue stopped before job started");
                                    return;
                                };
                                run_job(orchestrator, guard, report, job).await;
                            });
                        }
                    }
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Submission task panicked or was cancelled");
                    }
                }
                Some(_) = deferred.join_next(), if !deferred.is_empty() => {}
            }
        }

        deferred.abort_all();
        // Jobs still waiting for a permit give up; running ones finish.
        semaphore.close();
        info!(in_flight = running.len(), "Submission queue stopping");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Submission task panicked or was cancelled");
            }
        }

        let report = *report.lock().unwrap_or_else(|e| e.into_inner());
        info!(?report, "Submission queue stopped");
        report
    }
}

async fn sweep_due(orchestrator: &SubmissionOrchestrator, handle: &QueueHandle, batch: usize) -> usize {
    let now = orchestrator.now();
    match orchestrator.store().records_due_for_retry(now, batch).await {
        Ok(due) => {
            let queued = due
                .into_iter()
                .filter(|id| handle.enqueue(SubmissionJob::new(*id)))
                .count();
            if queued > 0 {
                info!(queued, "Queued due retries from store");
            }
            queued
        }
        Err(e) => {
            error!(error = %e, "Failed to sweep store for due retries");
            0
        }
    }
}

/// Keeps a record marked as queued until its job is over, panics included.
struct ScheduledGuard {
    handle: QueueHandle,
    record_id: RecordId,
}

impl Drop for ScheduledGuard {
    fn drop(&mut self) {
        self.handle.finished(self.record_id);
    }
}

async fn run_job(
    orchestrator: Arc<SubmissionOrchestrator>,
    guard: ScheduledGuard,
    report: Arc<Mutex<QueueReport>>,
    job: SubmissionJob,
) {
    let result = orchestrator
        .submit(job.record_id, job.initiator, &job.options)
        .await;

    let follow_up = match &result {
        Ok(Outcome::RetryScheduled { next_retry_at, .. }) => Some(*next_retry_at),
        Ok(Outcome::Busy { lease_expires_at, .. }) => Some(*lease_expires_at),
        Ok(_) => None,
        Err(failure) => failure.next_retry_at,
    };

    report
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .record(&result);

    let handle = guard.handle.clone();
    drop(guard);
    if let Some(at) = follow_up {
        if !handle.enqueue(job.follow_up(at)) {
            warn!(record_id = job.record_id, "Follow-up run not queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubmissionConfig;
    use crate::storage::InMemoryStore;
    use crate::submission::errors::PortalError;
    use crate::submission::mocks::*;
    use crate::submission::traits::SubmissionStore;
    use crate::submission::types::*;
    use std::path::PathBuf;

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            sweep_interval_seconds: 3600,
            sweep_batch: 10,
            shutdown_grace_seconds: 5,
        }
    }

    async fn setup(portal: Arc<ScriptedPortal>, records: &[RecordId]) -> (Arc<InMemoryStore>, Arc<SubmissionOrchestrator>) {
        let now = Utc::now();
        let store = Arc::new(InMemoryStore::new());
        for id in records {
            store
                .insert_record(InvoiceSubmissionRecord::new_draft(*id, 100 + id, 7, now))
                .await;
        }
        store
            .insert_certificate(SigningCertificate {
                id: 3,
                tenant_id: 7,
                name: "primary".to_string(),
                certificate_path: PathBuf::from("/certs/primary.pfx"),
                valid_from: None,
                valid_to: now + chrono::Duration::days(365),
                is_active: true,
                last_used_at: None,
            })
            .await;

        let config = SubmissionConfig {
            backoff_seconds: vec![0],
            ..SubmissionConfig::default()
        };
        let orchestrator = SubmissionOrchestrator::new(
            config,
            store.clone(),
            store.clone(),
            Arc::new(FakeGenerator::default()),
            Arc::new(FakeSigner::new()),
            portal,
        )
        .with_worker_id("queue-test");
        (store, Arc::new(orchestrator))
    }

    async fn wait_until_resolved(store: &InMemoryStore, ids: &[RecordId]) {
        for _ in 0..200 {
            let mut resolved = 0;
            for id in ids {
                if let Some(record) = store.load_record(*id).await.unwrap() {
                    if record.is_terminal() {
                        resolved += 1;
                    }
                }
            }
            if resolved == ids.len() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("records were not resolved in time");
    }

    #[tokio::test]
    async fn test_queue_retries_until_accepted() {
        let portal = Arc::new(ScriptedPortal::new());
        portal.push(Err(PortalError::Unreachable("connection refused".to_string())));
        let (store, orchestrator) = setup(portal.clone(), &[1]).await;

        let queue = SubmissionQueue::new(orchestrator, worker_config());
        let handle = queue.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(queue.run(shutdown_rx));

        assert!(handle.enqueue(SubmissionJob::new(1)));
        wait_until_resolved(&store, &[1]).await;

        shutdown_tx.send(true).unwrap();
        let report = worker.await.unwrap();

        assert_eq!(store.load_record(1).await.unwrap().unwrap().status, RecordStatus::Accepted);
        assert_eq!(portal.calls(), 2);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.retries_scheduled, 1);
    }

    #[tokio::test]
    async fn test_sweep_picks_up_due_records() {
        let portal = Arc::new(ScriptedPortal::new());
        let (store, orchestrator) = setup(portal.clone(), &[1, 2]).await;

        let now = orchestrator.now();
        for id in [1, 2] {
            let mut record = store.load_record(id).await.unwrap().unwrap();
            record.schedule_retry(Some(now), now).unwrap();
            store.update_record(&record).await.unwrap();
        }

        let queue = SubmissionQueue::new(orchestrator, worker_config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // The first interval tick fires immediately and sweeps.
        let worker = tokio::spawn(queue.run(shutdown_rx));

        wait_until_resolved(&store, &[1, 2]).await;
        shutdown_tx.send(true).unwrap();
        let report = worker.await.unwrap();

        assert_eq!(report.accepted, 2);
        assert_eq!(portal.calls(), 2);
    }

    async fn wait_for_calls(portal: &ScriptedPortal, calls: usize) {
        for _ in 0..200 {
            if portal.calls() >= calls {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("portal was not called in time");
    }

    #[tokio::test]
    async fn test_running_record_is_not_queued_again() {
        let portal = Arc::new(ScriptedPortal::with_delay(Duration::from_millis(300)));
        let (store, orchestrator) = setup(portal.clone(), &[1]).await;

        let queue = SubmissionQueue::new(orchestrator.clone(), worker_config());
        let handle = queue.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(queue.run(shutdown_rx));

        assert!(handle.enqueue(SubmissionJob::new(1)));
        wait_for_calls(&portal, 1).await;

        // Mid-run, neither a caller nor a sweep can queue the record again.
        assert!(!handle.enqueue(SubmissionJob::new(1)));
        assert_eq!(sweep_due(&orchestrator, &handle, 10).await, 0);
        assert_eq!(handle.queued(), 1);

        wait_until_resolved(&store, &[1]).await;
        for _ in 0..200 {
            if handle.queued() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.queued(), 0);

        shutdown_tx.send(true).unwrap();
        let report = worker.await.unwrap();
        assert_eq!(portal.calls(), 1);
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_seen_while_permits_are_taken() {
        let portal = Arc::new(ScriptedPortal::with_delay(Duration::from_millis(500)));
        let (store, orchestrator) = setup(portal.clone(), &[1, 2]).await;

        let config = WorkerConfig {
            concurrency: 1,
            ..worker_config()
        };
        let queue = SubmissionQueue::new(orchestrator, config);
        let handle = queue.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(queue.run(shutdown_rx));

        assert!(handle.enqueue(SubmissionJob::new(1)));
        wait_for_calls(&portal, 1).await;
        assert!(handle.enqueue(SubmissionJob::new(2)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("queue did not stop")
            .unwrap();

        // The running job finishes; the one waiting for a permit never starts.
        assert_eq!(report.processed, 1);
        assert_eq!(portal.calls(), 1);
        assert_eq!(store.load_record(1).await.unwrap().unwrap().status, RecordStatus::Accepted);
        assert_eq!(store.load_record(2).await.unwrap().unwrap().status, RecordStatus::Draft);
    }

    #[tokio::test]
    async fn test_duplicate_jobs_are_dropped() {
        let portal = Arc::new(ScriptedPortal::new());
        let (_store, orchestrator) = setup(portal, &[1]).await;
        let queue = SubmissionQueue::new(orchestrator, worker_config());
        let handle = queue.handle();

        assert!(handle.enqueue(SubmissionJob::new(1)));
        assert!(!handle.enqueue(SubmissionJob::new(1)));
        assert_eq!(handle.queued(), 1);
    }

    #[test]
    fn test_report_counts_failures_by_directive() {
        let mut report = QueueReport::default();
        let retrying = SubmissionFailure {
            record_id: 1,
            attempt_id: Some(1),
            next_retry_at: Some(Utc::now()),
            error: PortalError::Unreachable("down".to_string()).into(),
        };
        let terminal = SubmissionFailure {
            next_retry_at: None,
            ..retrying.clone()
        };

        report.record(&Err(retrying));
        report.record(&Err(terminal));
        report.record(&Ok(Outcome::Skipped { status: RecordStatus::Accepted }));

        assert_eq!(report.processed, 3);
        assert_eq!(report.retries_scheduled, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
    }
}
