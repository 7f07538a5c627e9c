// Submission Module - e-invoice lifecycle against the tax authority portal
//
// The orchestrator owns the record state machine; every collaborator it
// talks to sits behind a trait in `traits` so runs can be tested in memory.

pub mod adapters;
pub mod certificates;
pub mod errors;
pub mod orchestrator;
pub mod parser;
pub mod retry;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod mocks;

#[cfg(test)]
mod tests;

pub use adapters::{ProcessDocumentGenerator, ProcessPortalSubmitter, ProcessSigner};
pub use certificates::resolve_certificate;
pub use errors::{ErrorKind, StoreError, SubmissionError, SubmissionFailure};
pub use orchestrator::SubmissionOrchestrator;
pub use parser::parse_portal_output;
pub use retry::RetryPolicy;
pub use traits::{
    CertificateStore, Clock, DocumentGenerator, LeaseOutcome, PortalRequest, PortalSubmitter,
    QueueStats, Signer, SubmissionStore, SystemClock,
};
pub use types::{
    AttemptStatus, InvoiceSubmissionRecord, Outcome, PortalResponse, PortalVerdict, RecordStatus,
    SigningCertificate, SubmissionAttempt, SubmitOptions,
};
