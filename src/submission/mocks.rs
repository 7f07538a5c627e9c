// Fake collaborators for testing - no processes, no files, no wall clock

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::errors::{GeneratorError, PortalError, SignerError};
use super::traits::*;
use super::types::*;

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returns scripted results first, then a fixed document
#[derive(Debug)]
pub struct FakeGenerator {
    document: String,
    script: Mutex<VecDeque<Result<String, GeneratorError>>>,
    calls: AtomicUsize,
}

impl Default for FakeGenerator {
    fn default() -> Self {
        Self::new("<Invoice/>")
    }
}

impl FakeGenerator {
    pub fn new(document: &str) -> Self {
        Self {
            document: document.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_result(&self, result: Result<String, GeneratorError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentGenerator for FakeGenerator {
    async fn generate(&self, _record: &InvoiceSubmissionRecord) -> Result<String, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        scripted.unwrap_or_else(|| Ok(self.document.clone()))
    }
}

/// Wraps the document in a marker naming the certificate
#[derive(Debug, Default)]
pub struct FakeSigner {
    failures: Mutex<VecDeque<SignerError>>,
    used_certificates: Mutex<Vec<CertificateId>>,
    passwords: Mutex<Vec<Option<String>>>,
}

impl FakeSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: SignerError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn used_certificates(&self) -> Vec<CertificateId> {
        self.used_certificates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn passwords(&self) -> Vec<Option<String>> {
        self.passwords.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign(
        &self,
        document: &str,
        certificate: &SigningCertificate,
        password: Option<&str>,
    ) -> Result<String, SignerError> {
        if let Some(error) = self.failures.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
            return Err(error);
        }
        self.used_certificates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(certificate.id);
        self.passwords
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(password.map(str::to_string));
        Ok(format!("<Signed cert=\"{}\">{document}</Signed>", certificate.id))
    }
}

pub fn accepted_response(receipt: &str) -> PortalResponse {
    PortalResponse {
        success: true,
        status: "accepted".to_string(),
        upload_id: Some(format!("UP-{receipt}")),
        receipt_number: Some(receipt.to_string()),
        error_message: None,
        raw_output: format!("Success: Yes\nStatus: accepted\nReceipt: {receipt}\n"),
    }
}

pub fn rejected_response(reason: &str) -> PortalResponse {
    PortalResponse {
        success: false,
        status: "rejected".to_string(),
        upload_id: None,
        receipt_number: None,
        error_message: Some(reason.to_string()),
        raw_output: format!("Success: false\nStatus: rejected\nError: {reason}\n"),
    }
}

pub fn garbage_response() -> PortalResponse {
    super::parser::parse_portal_output("%%% segmentation fault %%%")
}

/// Plays back scripted portal results, then accepts with receipt `R-1`.
/// An optional delay makes overlapping calls observable.
#[derive(Debug, Default)]
pub struct ScriptedPortal {
    script: Mutex<VecDeque<Result<PortalResponse, PortalError>>>,
    requests: Mutex<Vec<PortalRequest>>,
    delay: Option<std::time::Duration>,
    calls: AtomicUsize,
}

impl ScriptedPortal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: std::time::Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push(&self, result: Result<PortalResponse, PortalError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<PortalRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PortalSubmitter for ScriptedPortal {
    async fn submit(
        &self,
        _signed_document: &str,
        request: &PortalRequest,
    ) -> Result<PortalResponse, PortalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        scripted.unwrap_or_else(|| Ok(accepted_response("R-1")))
    }
}
