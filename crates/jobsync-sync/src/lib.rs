//! Sync pipeline: scan the source, filter by natural key, insert what is new.

mod config;
#[cfg(test)]
mod memory;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobsync_core::{JobPosting, JobRow, NaturalKey};
use jobsync_source::{JobSource, MongoJobSource, SourceError};
use jobsync_storage::{JobDestination, PgJobStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{CommitPolicy, ConfigError, SyncConfig};
pub use jobsync_storage::NullKeyPolicy;

pub const CRATE_NAME: &str = "jobsync-sync";

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_CONNECTION: u8 = 3;
pub const EXIT_QUERY: u8 = 4;
pub const EXIT_INSERT: u8 = 5;
pub const EXIT_PARTIAL: u8 = 6;
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("source connection failed: {0}")]
    SourceConnection(#[source] SourceError),
    #[error("destination connection failed: {0}")]
    DestinationConnection(#[source] StoreError),
    #[error("source scan failed: {0}")]
    SourceScan(#[source] SourceError),
    #[error("existence check failed: {0}")]
    Query(#[source] StoreError),
    #[error("insert of {key} failed: {source}")]
    Insertion {
        key: NaturalKey,
        #[source]
        source: StoreError,
    },
    #[error("destination transaction failed: {0}")]
    Transaction(#[source] StoreError),
    #[error("sync cancelled before commit")]
    Cancelled,
    #[error("scheduler: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

impl SyncError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            Self::SourceConnection(_) | Self::DestinationConnection(_) => EXIT_CONNECTION,
            Self::SourceScan(_) | Self::Query(_) => EXIT_QUERY,
            Self::Insertion { .. } | Self::Transaction(_) => EXIT_INSERT,
            Self::Cancelled => EXIT_CANCELLED,
            Self::Scheduler(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub commit_policy: CommitPolicy,
    pub dry_run: bool,
}

impl From<&SyncConfig> for RunOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            commit_policy: config.commit_policy,
            dry_run: config.dry_run,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RowFailure {
    pub key: NaturalKey,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub commit_policy: String,
    pub dry_run: bool,
    pub scanned: usize,
    pub skipped_existing: usize,
    pub null_key_documents: usize,
    /// Rows that passed the filter and were written (or would have been, on a dry run).
    pub novel: usize,
    /// Rows durably committed by this run.
    pub inserted: usize,
    pub failures: Vec<RowFailure>,
}

impl SyncRunSummary {
    pub fn exit_code(&self) -> u8 {
        if self.failures.is_empty() {
            0
        } else {
            EXIT_PARTIAL
        }
    }
}

/// Owns both store handles for exactly one run.
pub struct SyncContext {
    source: Box<dyn JobSource>,
    destination: Box<dyn JobDestination>,
}

impl SyncContext {
    pub fn new(source: Box<dyn JobSource>, destination: Box<dyn JobDestination>) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Connects the source, then the destination. If the destination fails
    /// the already-open source is closed before returning.
    pub async fn connect(config: &SyncConfig) -> Result<Self, SyncError> {
        let mut source = MongoJobSource::connect(&config.source)
            .await
            .map_err(SyncError::SourceConnection)?;

        match PgJobStore::connect(&config.destination, config.null_keys).await {
            Ok(destination) => Ok(Self::new(Box::new(source), Box::new(destination))),
            Err(err) => {
                source.close().await;
                Err(match err {
                    StoreError::InvalidConfig(invalid) => SyncError::Config(invalid.into()),
                    other => SyncError::DestinationConnection(other),
                })
            }
        }
    }

    pub async fn close(mut self) {
        self.source.close().await;
        self.destination.close().await;
    }
}

/// Decides whether a posting is absent from the destination.
#[derive(Debug, Default)]
pub struct NoveltyFilter {
    existing: usize,
    null_keys: usize,
}

impl NoveltyFilter {
    pub async fn is_novel(
        &mut self,
        destination: &mut dyn JobDestination,
        posting: &JobPosting,
    ) -> Result<bool, SyncError> {
        let key = posting.natural_key();
        if key.has_nulls() {
            self.null_keys += 1;
            warn!(%key, "natural key has null components; novelty depends on the null key policy");
        }

        let exists = destination.exists(&key).await.map_err(SyncError::Query)?;
        if exists {
            self.existing += 1;
            debug!(%key, "already present, skipping");
        }
        Ok(!exists)
    }

    pub fn existing(&self) -> usize {
        self.existing
    }

    pub fn null_key_documents(&self) -> usize {
        self.null_keys
    }
}

/// Writes novel rows, either queued in the run's transaction or one transaction per row.
#[derive(Debug, Default)]
pub struct DestinationWriter {
    written: usize,
    failures: Vec<RowFailure>,
}

impl DestinationWriter {
    pub async fn queue(
        &mut self,
        destination: &mut dyn JobDestination,
        row: &JobRow,
    ) -> Result<(), SyncError> {
        destination
            .insert(row)
            .await
            .map_err(|source| SyncError::Insertion {
                key: row.natural_key(),
                source,
            })?;
        self.written += 1;
        Ok(())
    }

    /// Inserts `row` in its own transaction. A row-level failure is rolled back
    /// and recorded; only transaction plumbing errors are returned.
    pub async fn write_isolated(
        &mut self,
        destination: &mut dyn JobDestination,
        row: &JobRow,
        dry_run: bool,
    ) -> Result<(), SyncError> {
        destination.begin().await.map_err(SyncError::Transaction)?;

        let written = match destination.insert(row).await {
            Ok(()) if dry_run => destination.rollback().await,
            Ok(()) => destination.commit().await,
            Err(err) => Err(err),
        };

        match written {
            Ok(()) => {
                self.written += 1;
                Ok(())
            }
            Err(err) => {
                let key = row.natural_key();
                warn!(%key, error = %err, "row rejected by destination");
                destination.rollback().await.map_err(SyncError::Transaction)?;
                self.failures.push(RowFailure {
                    key,
                    error: err.to_string(),
                });
                Ok(())
            }
        }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

#[derive(Debug, Default)]
struct RunState {
    scanned: usize,
    filter: NoveltyFilter,
    writer: DestinationWriter,
}

pub struct SyncPipeline {
    options: RunOptions,
}

impl SyncPipeline {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    pub async fn run(&self, ctx: SyncContext) -> Result<SyncRunSummary, SyncError> {
        self.run_until(ctx, std::future::pending()).await
    }

    /// Runs once, stopping early if `shutdown` resolves first. The context is
    /// closed on every path; anything uncommitted is rolled back.
    pub async fn run_until<F>(
        &self,
        mut ctx: SyncContext,
        shutdown: F,
    ) -> Result<SyncRunSummary, SyncError>
    where
        F: Future<Output = ()>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut state = RunState::default();
        info!(
            %run_id,
            commit_policy = %self.options.commit_policy,
            dry_run = self.options.dry_run,
            "sync run started"
        );

        let outcome = {
            let transfer = self
                .transfer(&mut ctx, &mut state)
                .instrument(info_span!("sync_run", %run_id));
            tokio::select! {
                biased;
                () = shutdown => Err(SyncError::Cancelled),
                result = transfer => result,
            }
        };

        if let Err(err) = &outcome {
            warn!(%run_id, error = %err, "sync run aborted, rolling back");
            if let Err(rollback_err) = ctx.destination.rollback().await {
                warn!(%run_id, error = %rollback_err, "rollback failed");
            }
        }
        ctx.close().await;
        let committed = outcome?;

        let novel = state.writer.written();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            commit_policy: self.options.commit_policy.to_string(),
            dry_run: self.options.dry_run,
            scanned: state.scanned,
            skipped_existing: state.filter.existing(),
            null_key_documents: state.filter.null_key_documents(),
            novel,
            inserted: if committed { novel } else { 0 },
            failures: state.writer.failures,
        };
        info!(
            %run_id,
            scanned = summary.scanned,
            skipped = summary.skipped_existing,
            inserted = summary.inserted,
            failed = summary.failures.len(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// Returns whether the written rows were committed.
    async fn transfer(
        &self,
        ctx: &mut SyncContext,
        state: &mut RunState,
    ) -> Result<bool, SyncError> {
        let single_batch = self.options.commit_policy == CommitPolicy::SingleBatch;
        if single_batch {
            ctx.destination
                .begin()
                .await
                .map_err(SyncError::Transaction)?;
        }

        while let Some(posting) = ctx
            .source
            .next_posting()
            .await
            .map_err(SyncError::SourceScan)?
        {
            state.scanned += 1;
            if !state
                .filter
                .is_novel(ctx.destination.as_mut(), &posting)
                .await?
            {
                continue;
            }

            let row = JobRow::from(posting);
            if single_batch {
                state.writer.queue(ctx.destination.as_mut(), &row).await?;
            } else {
                state
                    .writer
                    .write_isolated(ctx.destination.as_mut(), &row, self.options.dry_run)
                    .await?;
            }
        }

        if !single_batch {
            return Ok(!self.options.dry_run);
        }
        if self.options.dry_run {
            ctx.destination
                .rollback()
                .await
                .map_err(SyncError::Transaction)?;
            info!(rows = state.writer.written(), "dry run, batch rolled back");
            return Ok(false);
        }
        ctx.destination
            .commit()
            .await
            .map_err(SyncError::Transaction)?;
        info!(rows = state.writer.written(), "batch committed");
        Ok(true)
    }
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary, SyncError> {
    run_sync_until(config, std::future::pending()).await
}

/// Connects, runs once, and closes. `shutdown` cancels the run and rolls it back.
pub async fn run_sync_until<F>(
    config: &SyncConfig,
    shutdown: F,
) -> Result<SyncRunSummary, SyncError>
where
    F: Future<Output = ()>,
{
    config.validate()?;
    let ctx = SyncContext::connect(config).await?;
    SyncPipeline::new(RunOptions::from(config))
        .run_until(ctx, shutdown)
        .await
}

/// Resolves once `true` is published on `shutdown`. Never resolves if the sender is dropped first.
pub async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

/// Cron-driven sync runs. Stopping cancels the active run and waits for its cleanup.
pub struct SyncScheduler {
    scheduler: JobScheduler,
    running: Arc<Mutex<()>>,
    shutdown: watch::Sender<bool>,
}

impl SyncScheduler {
    pub async fn start(&self) -> Result<(), SyncError> {
        self.scheduler.start().await?;
        Ok(())
    }

    pub async fn stop(mut self) -> Result<(), SyncError> {
        let _idle = cancel_active_run(&self.shutdown, &self.running).await;
        self.scheduler.shutdown().await?;
        info!("scheduler stopped");
        Ok(())
    }
}

/// Signals shutdown, then waits until no run holds `running`.
async fn cancel_active_run<'a>(
    shutdown: &watch::Sender<bool>,
    running: &'a Mutex<()>,
) -> MutexGuard<'a, ()> {
    shutdown.send_replace(true);
    running.lock().await
}

/// One tick. Skipped while the previous run is still active or once shutdown was requested.
async fn scheduled_tick<R, Fut>(running: &Mutex<()>, shutdown: watch::Receiver<bool>, run: R)
where
    R: FnOnce(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<SyncRunSummary, SyncError>>,
{
    let Ok(_guard) = running.try_lock() else {
        warn!("previous sync run still active, skipping tick");
        return;
    };
    if *shutdown.borrow() {
        debug!("shutdown requested, skipping tick");
        return;
    }

    match run(shutdown).await {
        Ok(summary) => info!(
            run_id = %summary.run_id,
            inserted = summary.inserted,
            failed = summary.failures.len(),
            "scheduled sync finished"
        ),
        Err(SyncError::Cancelled) => warn!("scheduled sync cancelled and rolled back"),
        Err(err) => error!(error = %err, "scheduled sync failed"),
    }
}

pub async fn build_scheduler(config: SyncConfig) -> Result<SyncScheduler, SyncError> {
    config.validate()?;
    let scheduler = JobScheduler::new().await?;
    let running = Arc::new(Mutex::new(()));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let cron = config.schedule_cron.clone();

    let job = {
        let running = Arc::clone(&running);
        Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let config = config.clone();
            let running = Arc::clone(&running);
            let shutdown = shutdown_rx.clone();
            Box::pin(async move {
                scheduled_tick(&running, shutdown, |signal| {
                    run_sync_until(&config, shutdown_requested(signal))
                })
                .await;
            })
        })?
    };
    scheduler.add(job).await?;
    info!(cron = %cron, "scheduler configured");
    Ok(SyncScheduler {
        scheduler,
        running,
        shutdown,
    })
}
