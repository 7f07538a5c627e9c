use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use einvoice_pipeline::config::PipelineConfig;
use einvoice_pipeline::telemetry::init_telemetry;

#[derive(Parser)]
#[command(name = "einvoice-pipeline")]
#[command(about = "Sign and submit e-invoices to the tax authority portal")]
#[command(long_about = "einvoice-pipeline generates, signs and uploads invoice documents, \
                       records every portal attempt and retries transient failures with backoff. \
                       Run 'einvoice-pipeline worker' to process due retries continuously.")]
struct Cli {
    /// Configuration file (defaults to ./einvoice-pipeline.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one submission step for a record
    Submit {
        /// Record to submit
        #[arg(long)]
        record: u64,
        /// Start a new cycle for a record whose retries were exhausted
        #[arg(long)]
        resubmit: bool,
        /// User that triggered the submission
        #[arg(long)]
        initiator: Option<u64>,
        /// Override the portal mode flag
        #[arg(long)]
        mode: Option<String>,
        /// Read the certificate password from this environment variable
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,
    },
    /// Process submissions and due retries until interrupted
    Worker {
        /// Submissions running at the same time
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Show retry queue counters
    Queue {
        /// Only count attempts for this tenant
        #[arg(long)]
        tenant: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    PipelineConfig::load_env_file()?;
    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        command => {
            init_telemetry(&config.observability)?;
            tokio::runtime::Runtime::new()?.block_on(async { run(command, config).await })
        }
    }
}

#[cfg(feature = "database")]
async fn run(command: Commands, mut config: PipelineConfig) -> Result<()> {
    use einvoice_pipeline::database::SqliteStore;
    use einvoice_pipeline::external::ProcessCommandExecutor;
    use einvoice_pipeline::queue::SubmissionQueue;
    use einvoice_pipeline::shutdown::ShutdownCoordinator;
    use einvoice_pipeline::submission::{
        Outcome, ProcessDocumentGenerator, ProcessPortalSubmitter, ProcessSigner,
        SubmissionOrchestrator, SubmissionStore, SubmitOptions,
    };
    use std::sync::Arc;
    use std::time::Duration;

    let Some(database) = config.database.clone() else {
        anyhow::bail!("no [database] section configured");
    };
    let store = Arc::new(SqliteStore::connect(&database).await?);

    let executor = Arc::new(ProcessCommandExecutor);
    let orchestrator = SubmissionOrchestrator::new(
        config.submission.clone(),
        store.clone(),
        store.clone(),
        Arc::new(ProcessDocumentGenerator::from_config(executor.clone(), &config.portal)),
        Arc::new(ProcessSigner::from_config(executor.clone(), &config.portal)),
        Arc::new(ProcessPortalSubmitter::from_config(executor, &config.portal)),
    )
    .with_mode(config.portal.mode.clone());

    let result = match command {
        Commands::Submit {
            record,
            resubmit,
            initiator,
            mode,
            password_env,
        } => {
            let options = SubmitOptions {
                certificate_password: password_env.and_then(|var| std::env::var(var).ok()),
                resubmit,
                mode,
            };
            match orchestrator.submit(record, initiator, &options).await {
                Ok(Outcome::Accepted { attempt_id, receipt_number }) => {
                    println!(
                        "✅ Record {record} accepted (attempt {attempt_id}, receipt {})",
                        receipt_number.as_deref().unwrap_or("-")
                    );
                    Ok(())
                }
                Ok(Outcome::Rejected { attempt_id, reason }) => {
                    println!("❌ Record {record} rejected (attempt {attempt_id}): {reason}");
                    Ok(())
                }
                Ok(Outcome::RetryScheduled { next_retry_at, .. }) => {
                    println!("⏳ Record {record} has a retry scheduled at {next_retry_at}");
                    Ok(())
                }
                Ok(Outcome::Busy { holder, lease_expires_at }) => {
                    println!("🔒 Record {record} is being processed by {holder} until {lease_expires_at}");
                    Ok(())
                }
                Ok(Outcome::Skipped { status }) => {
                    println!("ℹ️  Record {record} is {status}; nothing to do");
                    Ok(())
                }
                Ok(Outcome::Failed { reason, .. }) => {
                    println!("🛑 Record {record} failed: {reason}");
                    println!("   → Start a new cycle with: einvoice-pipeline submit --record {record} --resubmit");
                    Ok(())
                }
                Err(failure) => {
                    match failure.next_retry_at {
                        Some(at) => println!("⚠️  {failure}; retry scheduled at {at}"),
                        None => println!("🛑 {failure}"),
                    }
                    Err(failure.into())
                }
            }
        }
        Commands::Worker { concurrency } => {
            if let Some(concurrency) = concurrency {
                config.worker.concurrency = concurrency;
                config.validate()?;
            }
            let grace = Duration::from_secs(config.worker.shutdown_grace_seconds);
            let coordinator = Arc::new(ShutdownCoordinator::new());
            let queue = SubmissionQueue::new(Arc::new(orchestrator), config.worker.clone());
            let worker = tokio::spawn(queue.run(coordinator.subscribe()));

            coordinator.wait_for_signal().await?;
            let report = ShutdownCoordinator::drain(grace, worker).await??;
            println!(
                "Processed {} submissions: {} accepted, {} rejected, {} retrying, {} failed",
                report.processed, report.accepted, report.rejected, report.retries_scheduled, report.failed
            );
            Ok(())
        }
        Commands::Queue { tenant } => {
            let stats = store
                .queue_stats(tenant, orchestrator.now(), config.submission.max_attempts)
                .await?;
            println!("📋 Submission queue");
            println!("   Pending:         {}", stats.pending);
            println!("   Error:           {}", stats.error);
            println!("   Ready for retry: {}", stats.ready_for_retry);
            Ok(())
        }
        Commands::Config => Ok(()),
    };

    store.shutdown().await;
    result
}

#[cfg(not(feature = "database"))]
async fn run(_command: Commands, _config: PipelineConfig) -> Result<()> {
    anyhow::bail!(
        "einvoice-pipeline was built without storage support; rebuild with `--features database`"
    )
}
