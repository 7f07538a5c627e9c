// einvoice-pipeline library - e-invoice submission to the tax authority portal
// This exposes the core components for testing and integration

pub mod config;
pub mod database;
pub mod external;
pub mod queue;
pub mod shutdown;
pub mod storage;
pub mod submission;
pub mod telemetry;

// Re-export key types for easy access
pub use config::{DatabaseConfig, PipelineConfig, PortalConfig, SubmissionConfig, WorkerConfig};
#[cfg(feature = "database")]
pub use database::SqliteStore;
pub use external::{CommandExecutor, ProcessCommandExecutor};
pub use queue::{QueueHandle, QueueReport, SubmissionJob, SubmissionQueue};
pub use shutdown::ShutdownCoordinator;
pub use storage::InMemoryStore;
pub use submission::{
    InvoiceSubmissionRecord, Outcome, RecordStatus, SigningCertificate, SubmissionAttempt,
    SubmissionFailure, SubmissionOrchestrator, SubmitOptions,
};
pub use telemetry::{create_submission_span, generate_correlation_id, init_telemetry};
