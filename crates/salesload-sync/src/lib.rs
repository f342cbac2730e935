//! Ingest run orchestration: claim, validate, persist and file away every incoming sales file.

pub mod config;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use salesload_core::{classify_filename, FileBatch, FileClass, FileError, RegisterKey, WriteOutcome};
use salesload_parse::transform_sales_file;
use salesload_storage::{
    ClaimedFile, IncomingFile, LifecycleAreas, LifecycleError, PgSalesStore, ReleasedClaims, SalesStore,
    StoreCounts,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::LoadConfig;

/// Raised to stop claiming new files. Files already claimed run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Raise `flag` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(flag: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight files and stopping");
            flag.cancel();
        }
    });
}

/// What happened to one incoming file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Processed {
        file: String,
        destination: PathBuf,
        inserted: usize,
        duplicates: usize,
    },
    Rejected {
        file: String,
        destination: PathBuf,
        reason: String,
        message: String,
    },
    /// Another worker owns the file, or a stale claim blocks it; it was left in place.
    Skipped { file: String, message: String },
    /// The file could not be relocated and is still in `location`.
    Stranded {
        file: String,
        location: PathBuf,
        message: String,
    },
}

impl FileOutcome {
    pub fn file(&self) -> &str {
        match self {
            Self::Processed { file, .. }
            | Self::Rejected { file, .. }
            | Self::Skipped { file, .. }
            | Self::Stranded { file, .. } => file,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_date: NaiveDate,
    pub processed: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub stranded: usize,
    pub inserted_rows: usize,
    pub duplicate_rows: usize,
    pub cancelled: bool,
    pub files: Vec<FileOutcome>,
}

impl RunSummary {
    fn tally(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        run_date: NaiveDate,
        cancelled: bool,
        files: Vec<FileOutcome>,
    ) -> Self {
        let mut summary = Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            run_date,
            processed: 0,
            rejected: 0,
            skipped: 0,
            stranded: 0,
            inserted_rows: 0,
            duplicate_rows: 0,
            cancelled,
            files: Vec::new(),
        };
        for outcome in &files {
            match outcome {
                FileOutcome::Processed {
                    inserted, duplicates, ..
                } => {
                    summary.processed += 1;
                    summary.inserted_rows += inserted;
                    summary.duplicate_rows += duplicates;
                }
                FileOutcome::Rejected { .. } => summary.rejected += 1,
                FileOutcome::Skipped { .. } => summary.skipped += 1,
                FileOutcome::Stranded { .. } => summary.stranded += 1,
            }
        }
        summary.files = files;
        summary
    }
}

/// Everything one run needs, passed explicitly to every worker.
pub struct RunContext {
    pub config: LoadConfig,
    pub areas: LifecycleAreas,
    pub store: Arc<dyn SalesStore>,
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub cancel: CancelFlag,
}

pub struct IngestPipeline {
    ctx: Arc<RunContext>,
}

impl IngestPipeline {
    pub fn new(config: LoadConfig, store: Arc<dyn SalesStore>) -> Self {
        Self::with_run_date(config, store, Local::now().date_naive())
    }

    /// Like `new`, with the date used for `processed/<date>` fixed by the caller.
    pub fn with_run_date(config: LoadConfig, store: Arc<dyn SalesStore>, run_date: NaiveDate) -> Self {
        let areas = config.areas();
        Self {
            ctx: Arc::new(RunContext {
                config,
                areas,
                store,
                run_id: Uuid::new_v4(),
                run_date,
                cancel: CancelFlag::default(),
            }),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.ctx.cancel.clone()
    }

    /// Process every file currently in the incoming area.
    ///
    /// Only setup failures (directories, schema) abort the run; each file's own
    /// failure is recorded in the summary and the run moves on.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let ctx = &self.ctx;

        ctx.areas.prepare().await.context("preparing lifecycle directories")?;
        ctx.store
            .ensure_schema()
            .await
            .context("provisioning sales schema")?;

        let entries = ctx.areas.list_incoming().await?;
        info!(
            run_id = %ctx.run_id,
            files = entries.len(),
            workers = ctx.config.workers,
            incoming = %ctx.areas.incoming().display(),
            "ingest run started"
        );

        let queue = Arc::new(Mutex::new(entries.into_iter().enumerate().collect::<VecDeque<_>>()));
        let mut workers = JoinSet::new();
        for _ in 0..ctx.config.workers.max(1) {
            let ctx = Arc::clone(ctx);
            let queue = Arc::clone(&queue);
            workers.spawn(async move {
                let mut done = Vec::new();
                loop {
                    if ctx.cancel.is_cancelled() {
                        break;
                    }
                    let Some((idx, entry)) = queue.lock().await.pop_front() else {
                        break;
                    };
                    done.push((idx, process_entry(&ctx, entry).await));
                }
                done
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            outcomes.extend(joined.context("ingest worker panicked")?);
        }
        outcomes.sort_by_key(|(idx, _)| *idx);

        let summary = RunSummary::tally(
            ctx.run_id,
            started_at,
            ctx.run_date,
            ctx.cancel.is_cancelled(),
            outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
        );
        info!(
            run_id = %summary.run_id,
            processed = summary.processed,
            rejected = summary.rejected,
            skipped = summary.skipped,
            stranded = summary.stranded,
            inserted_rows = summary.inserted_rows,
            duplicate_rows = summary.duplicate_rows,
            cancelled = summary.cancelled,
            "ingest run finished"
        );
        Ok(summary)
    }
}

async fn process_entry(ctx: &Arc<RunContext>, entry: IncomingFile) -> FileOutcome {
    let span = info_span!("ingest_file", run_id = %ctx.run_id, file = %entry.name);
    async move {
        match classify_filename(&entry.name, &ctx.config.extension) {
            FileClass::Matched(register) => process_matched(ctx, entry, register).await,
            FileClass::Unmatched => reject_unmatched(ctx, entry).await,
        }
    }
    .instrument(span)
    .await
}

async fn reject_unmatched(ctx: &RunContext, entry: IncomingFile) -> FileOutcome {
    let err = FileError::Naming {
        name: entry.name.clone(),
        extension: ctx.config.extension.clone(),
    };
    match ctx.areas.reject_unclaimed(&entry).await {
        Ok(destination) => rejected(entry.name, destination, &err),
        Err(LifecycleError::Vanished(_)) => skipped(entry.name, "file vanished before it could be rejected"),
        Err(move_err) => stranded(entry.name, entry.path, &move_err),
    }
}

async fn process_matched(ctx: &Arc<RunContext>, entry: IncomingFile, register: RegisterKey) -> FileOutcome {
    let claimed = match ctx.areas.claim(&entry).await {
        Ok(claimed) => claimed,
        Err(LifecycleError::Vanished(_)) => {
            debug!("file claimed elsewhere");
            return skipped(entry.name, "claimed by another worker");
        }
        Err(err @ LifecycleError::StaleClaim(_)) => {
            warn!(error = %err, "stale claim blocks file; leaving it in incoming");
            return skipped(entry.name, &err.to_string());
        }
        Err(err) => return stranded(entry.name, entry.path, &err),
    };

    match load_isolated(ctx, &claimed, register).await {
        Ok(outcome) => match ctx.areas.mark_processed(&claimed, ctx.run_date).await {
            Ok(destination) => {
                info!(
                    shop_num = register.shop_num,
                    cash_num = register.cash_num,
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    destination = %destination.display(),
                    "processed"
                );
                FileOutcome::Processed {
                    file: claimed.name,
                    destination,
                    inserted: outcome.inserted,
                    duplicates: outcome.duplicates,
                }
            }
            Err(err) => stranded(claimed.name, claimed.path, &err),
        },
        Err(file_err) => match ctx.areas.mark_rejected(&claimed).await {
            Ok(destination) => rejected(claimed.name, destination, &file_err),
            Err(err) => {
                error!(reason = file_err.kind(), error = %file_err, "rejected but could not be moved");
                stranded(claimed.name, claimed.path, &err)
            }
        },
    }
}

/// Run [`load_claimed`] on its own task so a panic rejects this file instead of the run.
async fn load_isolated(
    ctx: &Arc<RunContext>,
    claimed: &ClaimedFile,
    register: RegisterKey,
) -> Result<WriteOutcome, FileError> {
    let task_ctx = Arc::clone(ctx);
    let task_claimed = claimed.clone();
    tokio::spawn(async move { load_claimed(&task_ctx, &task_claimed, register).await }.in_current_span())
        .await
        .unwrap_or_else(|join_err| Err(FileError::Internal(join_err.to_string())))
}

async fn load_claimed(
    ctx: &RunContext,
    claimed: &ClaimedFile,
    register: RegisterKey,
) -> Result<WriteOutcome, FileError> {
    let bytes = tokio::fs::read(&claimed.path)
        .await
        .map_err(|err| FileError::Read(format!("{}: {err}", claimed.path.display())))?;
    let source_file = claimed.incoming_path.display().to_string();
    let lines = transform_sales_file(&bytes, register, &source_file)?;
    debug!(rows = lines.len(), "validated");

    let batch = FileBatch {
        register,
        source_file,
        lines,
    };
    Ok(ctx.store.write_file(&batch).await?)
}

fn rejected(file: String, destination: PathBuf, err: &FileError) -> FileOutcome {
    match err {
        FileError::Persistence(_) | FileError::Read(_) | FileError::Internal(_) => {
            error!(reason = err.kind(), error = %err, destination = %destination.display(), "rejected")
        }
        _ => warn!(reason = err.kind(), error = %err, destination = %destination.display(), "rejected"),
    }
    FileOutcome::Rejected {
        file,
        destination,
        reason: err.kind().to_string(),
        message: err.to_string(),
    }
}

fn skipped(file: String, message: &str) -> FileOutcome {
    FileOutcome::Skipped {
        file,
        message: message.to_string(),
    }
}

fn stranded(file: String, location: PathBuf, err: &LifecycleError) -> FileOutcome {
    error!(error = %err, location = %location.display(), "file could not be relocated");
    FileOutcome::Stranded {
        file,
        location,
        message: err.to_string(),
    }
}

pub async fn connect_store(config: &LoadConfig) -> Result<PgSalesStore> {
    PgSalesStore::connect(&config.database_url, config.max_connections)
        .await
        .with_context(|| format!("connecting to {}", config.database_url_masked()))
}

/// Connect to the configured database and run one ingest pass; Ctrl-C stops it between files.
pub async fn run_ingest_once(config: LoadConfig) -> Result<RunSummary> {
    let store = connect_store(&config).await?;
    let pipeline = IngestPipeline::new(config, Arc::new(store));
    cancel_on_ctrl_c(pipeline.cancel_flag());
    pipeline.run_once().await
}

pub async fn migrate(config: &LoadConfig) -> Result<()> {
    let store = connect_store(config).await?;
    store.ensure_schema().await.context("applying migrations")?;
    Ok(())
}

pub async fn store_counts(config: &LoadConfig) -> Result<StoreCounts> {
    let store = connect_store(config).await?;
    Ok(store.counts().await?)
}

/// Move every claimed file back to incoming after an interrupted run.
pub async fn recover_claims(config: &LoadConfig) -> Result<ReleasedClaims> {
    let areas = config.areas();
    areas.prepare().await?;
    let report = areas.release_claims().await?;
    for path in &report.released {
        info!(path = %path.display(), "claim released");
    }
    for path in &report.conflicts {
        warn!(path = %path.display(), "incoming already holds this name; claim left in place");
    }
    Ok(report)
}
