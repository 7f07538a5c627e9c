/// Test fixtures: shell-script stand-ins for the generator, signer and
/// upload tools, plus seeded in-memory stores.
use chrono::{Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use einvoice_pipeline::config::{PortalConfig, SubmissionConfig};
use einvoice_pipeline::external::ProcessCommandExecutor;
use einvoice_pipeline::storage::InMemoryStore;
use einvoice_pipeline::submission::types::RecordId;
use einvoice_pipeline::submission::{
    InvoiceSubmissionRecord, ProcessDocumentGenerator, ProcessPortalSubmitter, ProcessSigner,
    SigningCertificate, SubmissionOrchestrator,
};

pub const TENANT_ID: u64 = 7;
pub const CERTIFICATE_ID: u64 = 3;

const GENERATOR: &str = r#"
invoice=""
for arg in "$@"; do
  case "$arg" in
    --invoice-id=*) invoice="${arg#--invoice-id=}" ;;
  esac
done
printf '<Invoice id="%s"/>' "$invoice"
"#;

const SIGNER: &str = r#"
dir="$(dirname "$0")"
input=""
for arg in "$@"; do
  case "$arg" in
    --input=*) input="${arg#--input=}" ;;
    --password-file=*) cat "${arg#--password-file=}" > "$dir/password.seen" ;;
  esac
done
echo "$@" >> "$dir/signer.args"
printf '<Signed>'
cat "$input"
printf '</Signed>'
"#;

/// Upload script that prints an accepted report with the given receipt.
pub fn accepting_upload(receipt: &str) -> String {
    format!(
        "echo 'Uploading...'\necho 'Success: yes'\necho 'Status: accepted'\necho 'Upload ID: UP-{receipt}'\necho 'Receipt: {receipt}'\n"
    )
}

/// Upload script that prints a rejection report.
pub fn rejecting_upload(reason: &str) -> String {
    format!("echo 'Success: no'\necho 'Status: rejected'\necho 'Error: {reason}'\n")
}

/// Scratch directory holding the tool scripts and what they observed.
pub struct ToolBox {
    dir: TempDir,
}

impl ToolBox {
    /// `upload_body` runs after a preamble that appends the call's
    /// arguments to `upload.calls`.
    pub fn new(upload_body: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let toolbox = Self { dir };
        toolbox.write("generate.sh", GENERATOR);
        toolbox.write("sign.sh", SIGNER);
        toolbox.set_upload(upload_body);
        toolbox
    }

    pub fn set_upload(&self, body: &str) {
        let script = format!("echo \"$@\" >> \"$(dirname \"$0\")/upload.calls\"\n{body}");
        self.write("upload.sh", &script);
    }

    fn write(&self, name: &str, contents: &str) {
        std::fs::write(self.path(name), contents).expect("write script");
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.path(name)).unwrap_or_default()
    }

    pub fn upload_calls(&self) -> Vec<String> {
        self.read("upload.calls").lines().map(str::to_string).collect()
    }

    pub fn portal_config(&self) -> PortalConfig {
        let script = |name: &str| vec![self.path(name).to_string_lossy().to_string()];
        PortalConfig {
            upload_program: "sh".to_string(),
            upload_args: script("upload.sh"),
            mode: "test".to_string(),
            signer_program: "sh".to_string(),
            signer_args: script("sign.sh"),
            generator_program: "sh".to_string(),
            generator_args: script("generate.sh"),
            tool_timeout_seconds: 10,
        }
    }
}

pub fn submission_config() -> SubmissionConfig {
    SubmissionConfig {
        max_attempts: 3,
        backoff_seconds: vec![0],
        attempt_timeout_seconds: 10,
        lease_ttl_seconds: 30,
        retry_missing_certificate: true,
    }
}

pub async fn seeded_store(records: &[RecordId]) -> Arc<InMemoryStore> {
    let now = Utc::now();
    let store = Arc::new(InMemoryStore::new());
    for id in records {
        store
            .insert_record(InvoiceSubmissionRecord::new_draft(*id, 1000 + id, TENANT_ID, now))
            .await;
    }
    store
        .insert_certificate(SigningCertificate {
            id: CERTIFICATE_ID,
            tenant_id: TENANT_ID,
            name: "qualified".to_string(),
            certificate_path: PathBuf::from("/certs/qualified.pfx"),
            valid_from: Some(now - Duration::days(30)),
            valid_to: now + Duration::days(365),
            is_active: true,
            last_used_at: None,
        })
        .await;
    store
}

pub fn orchestrator(
    toolbox: &ToolBox,
    config: SubmissionConfig,
    store: Arc<InMemoryStore>,
    worker_id: &str,
) -> SubmissionOrchestrator {
    let portal = toolbox.portal_config();
    let executor = Arc::new(ProcessCommandExecutor);
    SubmissionOrchestrator::new(
        config,
        store.clone(),
        store,
        Arc::new(ProcessDocumentGenerator::from_config(executor.clone(), &portal)),
        Arc::new(ProcessSigner::from_config(executor.clone(), &portal)),
        Arc::new(ProcessPortalSubmitter::from_config(executor, &portal)),
    )
    .with_mode(portal.mode.clone())
    .with_worker_id(worker_id)
}
