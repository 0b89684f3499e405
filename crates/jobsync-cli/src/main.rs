use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jobsync_sync::{
    build_scheduler, run_sync_until, CommitPolicy, NullKeyPolicy, SyncConfig, SyncError,
    SyncRunSummary,
};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "jobsync")]
#[command(about = "Copy job postings missing from the jobs table out of MongoDB")]
struct Cli {
    /// YAML config file (default: JOBSYNC_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass (default)
    Sync(SyncArgs),
    /// Run sync passes on a cron schedule until Ctrl-C
    Schedule {
        /// Six-field cron expression, seconds first
        #[arg(long)]
        cron: Option<String>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Perform lookups and inserts, then roll back
    #[arg(long)]
    dry_run: bool,

    /// single-batch or per-row
    #[arg(long)]
    commit_policy: Option<CommitPolicy>,

    /// null-safe or strict
    #[arg(long)]
    null_keys: Option<NullKeyPolicy>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "jobsync failed");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            args.apply(&mut config);
            let summary = run_sync_until(&config, shutdown_signal()).await?;
            print_summary(&summary, cli.json)?;
            Ok(summary.exit_code())
        }
        Commands::Schedule { cron } => {
            if let Some(cron) = cron {
                config.schedule_cron = cron;
            }
            let sched = build_scheduler(config).await?;
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("ctrl-c received, cancelling active run");
            sched.stop().await.context("stopping scheduler")?;
            Ok(0)
        }
    }
}

impl SyncArgs {
    fn apply(self, config: &mut SyncConfig) {
        config.dry_run |= self.dry_run;
        if let Some(policy) = self.commit_policy {
            config.commit_policy = policy;
        }
        if let Some(policy) = self.null_keys {
            config.null_keys = policy;
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::from_yaml_file(path),
        None => SyncConfig::from_env(),
    };
    Ok(config.map_err(SyncError::from)?)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn print_summary(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(summary).context("serializing run summary")?;
        println!("{text}");
        return Ok(());
    }

    let verb = if summary.dry_run { "would insert" } else { "inserted" };
    let count = if summary.dry_run { summary.novel } else { summary.inserted };
    println!(
        "sync complete: run_id={} scanned={} skipped={} {verb}={count} failed={}",
        summary.run_id,
        summary.scanned,
        summary.skipped_existing,
        summary.failures.len()
    );
    for failure in &summary.failures {
        println!("  failed {}: {}", failure.key, failure.error);
    }
    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<SyncError>()
        .map(SyncError::exit_code)
        .unwrap_or(1)
}
