use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use db_backup::config::{self, BackupJob, Config};
use db_backup::credentials::{CredentialProvider, StaticCredentials};
use db_backup::destinations::naming;
use db_backup::managers::backup::BackupOrchestrator;
use db_backup::managers::factory::{AdapterFactory, DefaultAdapterFactory};
use db_backup::managers::logging::{self, LoggingConfig};
use db_backup::managers::notification::NotificationManager;
use db_backup::report::{JobReport, JobStatus};
use db_backup::utils::cancel::CancelHandle;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "db-backup")]
#[command(about = "Dump databases and ship compressed, encrypted backups to several destinations", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/db-backup/config.toml")]
    config: PathBuf,

    /// Path to the secrets file (TOML keyed by secret kind, then id)
    #[arg(short, long)]
    secrets: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one job or every enabled job
    #[command(group(ArgGroup::new("target").required(true).args(["job", "all"])))]
    Run {
        /// Job to run
        #[arg(short, long)]
        job: Option<String>,

        /// Run all enabled jobs
        #[arg(long)]
        all: bool,
    },

    /// Validate configuration file
    Validate,

    /// List configured jobs
    Jobs,

    /// List stored artifacts of a job at each of its destinations
    List {
        #[arg(short, long)]
        job: String,

        /// Only this destination
        #[arg(short, long)]
        destination: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = config::load_config(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    match cli.command {
        Commands::Validate => {
            logging::init_console_logging();
            handle_validate(&config, cli.secrets.as_deref())
        }
        Commands::Jobs => {
            logging::init_console_logging();
            handle_jobs(&config)
        }
        Commands::Run { job, .. } => {
            let _log_guard = logging::init_logging(&LoggingConfig::from_config(&config.global))?;
            let credentials = load_credentials(cli.secrets.as_deref())?;
            let jobs = select_jobs(&config, job.as_deref())?;
            handle_run(&config, credentials, jobs).await
        }
        Commands::List { job, destination } => {
            let _log_guard = logging::init_logging(&LoggingConfig::from_config(&config.global))?;
            let credentials = load_credentials(cli.secrets.as_deref())?;
            handle_list(&config, credentials.as_ref(), &job, destination.as_deref()).await
        }
    }
}

fn load_credentials(path: Option<&Path>) -> Result<Arc<dyn CredentialProvider>> {
    let credentials = match path {
        Some(path) => StaticCredentials::from_toml_file(&config::expand_tilde(path))
            .with_context(|| format!("Failed to load secrets from {:?}", path))?,
        None => StaticCredentials::new(),
    };
    Ok(Arc::new(credentials))
}

/// The named job, or every enabled job when none is named
fn select_jobs(config: &Config, job: Option<&str>) -> Result<Vec<BackupJob>> {
    if let Some(name) = job {
        return Ok(vec![config::resolve_job(name, config)?]);
    }
    Ok(config::resolve_all_jobs(config)?
        .into_values()
        .filter(|job| {
            if !job.enabled {
                info!("Job '{}' is disabled, skipping", job.name);
            }
            job.enabled
        })
        .collect())
}

async fn handle_run(
    config: &Config,
    credentials: Arc<dyn CredentialProvider>,
    jobs: Vec<BackupJob>,
) -> Result<ExitCode> {
    if jobs.is_empty() {
        warn!("No enabled jobs to run");
        return Ok(ExitCode::SUCCESS);
    }

    let (handle, cancel) = CancelHandle::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            handle.cancel();
        }
    });

    let orchestrator = BackupOrchestrator::new(Arc::new(DefaultAdapterFactory), credentials)
        .with_lock_directory(config.global.lock_directory.clone());

    let notifier = if config.notifications.discord_webhook_url.is_empty() {
        None
    } else {
        Some(NotificationManager::new(config.notifications.clone())?)
    };

    let mut worst = JobStatus::AllSucceeded;
    for job in &jobs {
        if !job.enabled {
            println!("Job '{}' is disabled, skipping", job.name);
            continue;
        }

        println!("Running backup job: {}", job.name);
        let report = orchestrator.run(job, &cancel).await;
        print_report(&report);

        if let Some(notifier) = &notifier {
            if let Err(e) = notifier.notify(&report, &job.notify_on).await {
                warn!("Failed to send notification: {}", e);
            }
        }

        worst = worse(worst, report.status);
        if cancel.is_cancelled() {
            error!("Run cancelled, remaining jobs skipped");
            break;
        }
    }

    Ok(ExitCode::from(worst.exit_code() as u8))
}

/// AllFailed outranks PartialFailure, which outranks AllSucceeded
fn worse(a: JobStatus, b: JobStatus) -> JobStatus {
    let rank = |s: JobStatus| match s {
        JobStatus::AllSucceeded => 0,
        JobStatus::PartialFailure => 1,
        JobStatus::AllFailed => 2,
    };
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}

fn print_report(report: &JobReport) {
    let mark = match report.status {
        JobStatus::AllSucceeded => "✓",
        JobStatus::PartialFailure => "⚠",
        JobStatus::AllFailed => "✗",
    };
    println!(
        "{} Job '{}': {} in {}s",
        mark,
        report.job,
        report.status,
        report.duration().num_seconds()
    );
    if let Some(artifact) = &report.artifact {
        println!(
            "  Artifact: {} ({} bytes, sha256 {})",
            artifact.name, artifact.size_bytes, artifact.checksum
        );
    }
    if let Some(err) = &report.fatal_error {
        println!("  Aborted: {}", err);
    }
    for line in report.summary_lines() {
        println!("  {}", line);
    }
}

fn handle_validate(config: &Config, secrets: Option<&Path>) -> Result<ExitCode> {
    let jobs = config::resolve_all_jobs(config)?;

    println!("✓ Configuration is valid");
    println!("  Sources: {}", config.sources.len());
    println!("  Destinations: {}", config.destinations.len());
    println!("  Jobs: {}", jobs.len());

    if let Some(path) = secrets {
        let credentials = StaticCredentials::from_toml_file(&config::expand_tilde(path))
            .with_context(|| format!("Failed to load secrets from {:?}", path))?;
        println!("✓ Secrets file is valid ({} entries)", credentials.len());
    }

    Ok(ExitCode::SUCCESS)
}

fn handle_jobs(config: &Config) -> Result<ExitCode> {
    let jobs = config::resolve_all_jobs(config)?;

    if jobs.is_empty() {
        println!("No jobs configured");
        return Ok(ExitCode::SUCCESS);
    }

    println!("=== Configured Jobs ===\n");
    for (name, job) in &jobs {
        println!("{}{}", name, if job.enabled { "" } else { " (disabled)" });
        if !job.description.is_empty() {
            println!("  Description: {}", job.description);
        }
        println!(
            "  Source: {} ({} @ {})",
            job.source_name,
            job.source.engine.as_str(),
            job.source.host
        );
        for target in &job.destinations {
            println!(
                "  Destination: {} [{}] {}",
                target.name,
                target.config.kind(),
                target.config.location()
            );
        }
        let mut transforms = Vec::new();
        if job.transform.compress {
            transforms.push(format!("gzip (level {})", job.transform.compression_level));
        }
        if job.transform.encryption_key_ref.is_some() {
            transforms.push("aes-256-gcm".to_string());
        }
        if !transforms.is_empty() {
            println!("  Transforms: {}", transforms.join(", "));
        }
        if let Some(keep) = job.retention.keep_last {
            println!("  Retention: keep last {}", keep);
        }
        if let Some(days) = job.retention.max_age_days {
            println!("  Retention: max age {} days", days);
        }
        println!();
    }

    Ok(ExitCode::SUCCESS)
}

async fn handle_list(
    config: &Config,
    credentials: &dyn CredentialProvider,
    job_name: &str,
    only: Option<&str>,
) -> Result<ExitCode> {
    let job = config::resolve_job(job_name, config)?;
    let prefix = naming::artifact_prefix(&job.name);
    let factory = DefaultAdapterFactory;

    let targets: Vec<_> = job
        .destinations
        .iter()
        .filter(|t| only.map_or(true, |name| t.name == name))
        .collect();
    if targets.is_empty() {
        anyhow::bail!(
            "Job '{}' does not use destination '{}'",
            job.name,
            only.unwrap_or_default()
        );
    }

    let mut failures = 0;
    for target in targets {
        println!("Destination: {} ({})", target.name, target.config.location());

        let listed = async {
            let mut adapter = factory.destination(target, credentials)?;
            adapter.connect().await?;
            let listed = adapter.list_existing(&prefix).await;
            if let Err(e) = adapter.close().await {
                warn!("Failed to close destination '{}': {}", target.name, e);
            }
            listed
        }
        .await;

        match listed {
            Ok(mut artifacts) => {
                artifacts.retain(|a| naming::is_artifact(&prefix, &a.name));
                artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
                if artifacts.is_empty() {
                    println!("  (no artifacts)");
                }
                for artifact in artifacts {
                    println!(
                        "  {}  {:>12} bytes  {}",
                        artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
                        artifact.size_bytes,
                        artifact.name
                    );
                }
            }
            Err(e) => {
                failures += 1;
                println!("  ✗ {}", e);
            }
        }
        println!();
    }

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
