use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Slack a lease keeps beyond the longest step it has to cover
pub const LEASE_MARGIN_SECONDS: u64 = 10;

/// Main configuration structure for the submission pipeline
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PipelineConfig {
    /// Retry, backoff and timeout settings
    pub submission: SubmissionConfig,
    /// External tools: upload, signing and document generation
    pub portal: PortalConfig,
    /// Queue worker settings
    pub worker: WorkerConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SubmissionConfig {
    /// Maximum attempts per submission cycle
    pub max_attempts: u32,
    /// Delay before the next try, indexed by failed attempt number
    pub backoff_seconds: Vec<u64>,
    /// Upper bound for one portal call
    pub attempt_timeout_seconds: u64,
    /// How long a worker may hold a record before others can take over
    pub lease_ttl_seconds: u64,
    /// Retry when the tenant has no usable certificate
    pub retry_missing_certificate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PortalConfig {
    /// Executable that uploads a signed document to the portal
    pub upload_program: String,
    /// Leading arguments, e.g. the script path for an interpreter
    pub upload_args: Vec<String>,
    /// Value of the `--mode` flag
    pub mode: String,
    /// Executable that signs a document
    pub signer_program: String,
    pub signer_args: Vec<String>,
    /// Executable that renders an invoice as a document
    pub generator_program: String,
    pub generator_args: Vec<String>,
    /// Timeout for the signer and the generator
    pub tool_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WorkerConfig {
    /// Submissions running at the same time
    pub concurrency: usize,
    /// How often the store is swept for due retries
    pub sweep_interval_seconds: u64,
    /// Records taken per sweep
    pub sweep_batch: usize,
    /// Time allowed for in-flight submissions on shutdown
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON log lines instead of human readable ones
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_seconds: vec![60, 300, 900], // 1, 5 and 15 minutes
            attempt_timeout_seconds: 120,
            lease_ttl_seconds: 180,
            retry_missing_certificate: true,
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            upload_program: "efaktura-upload".to_string(),
            upload_args: Vec::new(),
            mode: "portal".to_string(),
            signer_program: "efaktura-sign".to_string(),
            signer_args: Vec::new(),
            generator_program: "efaktura-ubl".to_string(),
            generator_args: Vec::new(),
            tool_timeout_seconds: 30,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            sweep_interval_seconds: 30,
            sweep_batch: 100,
            shutdown_grace_seconds: 150,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            submission: SubmissionConfig::default(),
            portal: PortalConfig::default(),
            worker: WorkerConfig::default(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
            },
            database: Some(DatabaseConfig {
                url: "sqlite://einvoice-pipeline.db".to_string(),
                max_connections: 10,
                auto_migrate: true,
            }),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (einvoice-pipeline.toml, or `path` when given)
    /// 3. Environment variables (prefixed with EINVOICE__, nested with `__`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None if Path::new("einvoice-pipeline.toml").exists() => {
                builder = builder.add_source(File::with_name("einvoice-pipeline"));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("EINVOICE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("submission.backoff_seconds")
                .with_list_parse_key("portal.upload_args")
                .with_list_parse_key("portal.signer_args")
                .with_list_parse_key("portal.generator_args"),
        );

        let config: PipelineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let submission = &self.submission;
        if submission.max_attempts == 0 {
            bail!("submission.max_attempts must be at least 1");
        }
        if submission.attempt_timeout_seconds == 0 {
            bail!("submission.attempt_timeout_seconds must be positive");
        }
        // The lease is renewed right before the portal call, so it has to
        // cover generation plus signing, and separately the call itself,
        // each with room for the storage writes around them.
        let call_hold = submission.attempt_timeout_seconds + LEASE_MARGIN_SECONDS;
        if submission.lease_ttl_seconds < call_hold {
            bail!(
                "submission.lease_ttl_seconds ({}) must be at least attempt_timeout_seconds + {} ({})",
                submission.lease_ttl_seconds,
                LEASE_MARGIN_SECONDS,
                call_hold
            );
        }
        let preparation_hold = 2 * self.portal.tool_timeout_seconds + LEASE_MARGIN_SECONDS;
        if submission.lease_ttl_seconds < preparation_hold {
            bail!(
                "submission.lease_ttl_seconds ({}) must be at least 2 * portal.tool_timeout_seconds + {} ({})",
                submission.lease_ttl_seconds,
                LEASE_MARGIN_SECONDS,
                preparation_hold
            );
        }
        if self.worker.concurrency == 0 {
            bail!("worker.concurrency must be at least 1");
        }
        if self.worker.sweep_interval_seconds == 0 {
            bail!("worker.sweep_interval_seconds must be positive");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
