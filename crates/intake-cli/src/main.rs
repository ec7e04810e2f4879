use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use intake_adapters::SourceRegistry;
use intake_pipeline::{
    export_failed_rows, maybe_build_scheduler, purge_expired_jobs, BatchWorker,
    EnrichBatchHandler, HttpNotifier, HttpScorer, IngestPipeline, JobWorker, PipelineConfig,
    RefreshReadModelHandler, StoreBackend, Submission,
};
use intake_storage::{HookClient, IntakeStore, MemoryStore, PayloadStore, PgStore};
use intake_web::AppState;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "intake")]
#[command(about = "Judgment export intake pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WorkerKind {
    All,
    Batches,
    Jobs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// HTTP API plus in-process batch and job workers.
    Serve {
        #[arg(long)]
        no_workers: bool,
    },
    /// Workers without the HTTP API.
    Worker {
        #[arg(long, value_enum, default_value_t = WorkerKind::All)]
        kind: WorkerKind,
        /// Drain what is claimable now, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Submit an export file for a source.
    Submit {
        source: String,
        file: PathBuf,
        #[arg(long)]
        vendor_reference: Option<String>,
        /// Drive pending batches to completion before exiting.
        #[arg(long)]
        process: bool,
    },
    Status {
        batch_id: Uuid,
        #[arg(long)]
        error_limit: Option<usize>,
    },
    ResolveFailedRow {
        id: Uuid,
        #[arg(long)]
        by: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Write a batch's dead-letter rows to Parquet with a manifest.
    ExportFailures {
        batch_id: Uuid,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete finished queue jobs past the retention window.
    PurgeJobs {
        #[arg(long)]
        older_than_days: Option<i64>,
    },
}

struct Runtime {
    config: PipelineConfig,
    store: Arc<dyn IntakeStore>,
    pipeline: Arc<IngestPipeline>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { no_workers: false }) {
        Commands::Migrate => migrate(&config).await?,
        Commands::Serve { no_workers } => {
            let rt = build_runtime(config).await?;
            serve(&rt, !no_workers).await?;
        }
        Commands::Worker { kind, once } => {
            let rt = build_runtime(config).await?;
            run_workers(&rt, kind, once).await?;
        }
        Commands::Submit {
            source,
            file,
            vendor_reference,
            process,
        } => {
            let rt = build_runtime(config).await?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let mut submission = Submission::new(source, bytes);
            submission.vendor_reference = vendor_reference;
            submission.filename = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            let receipt = rt.pipeline.submit(submission).await?;
            print_json(&receipt)?;
            if process {
                batch_worker(&rt).drain().await?;
                print_json(&rt.pipeline.status_report(receipt.batch_id, None).await?)?;
            }
        }
        Commands::Status {
            batch_id,
            error_limit,
        } => {
            let rt = build_runtime(config).await?;
            print_json(&rt.pipeline.status_report(batch_id, error_limit).await?)?;
        }
        Commands::ResolveFailedRow { id, by, notes } => {
            let rt = build_runtime(config).await?;
            print_json(&rt.pipeline.resolve_failed_row(id, &by, notes).await?)?;
        }
        Commands::ExportFailures { batch_id, out } => {
            let rt = build_runtime(config).await?;
            let out_dir = out.unwrap_or_else(|| rt.config.export_dir.clone());
            let export = export_failed_rows(rt.store.as_ref(), batch_id, &out_dir).await?;
            println!(
                "exported {} failed rows to {} (manifest {})",
                export.manifest.files.iter().map(|f| f.rows).sum::<u64>(),
                export.directory.display(),
                export.manifest_path.display()
            );
        }
        Commands::PurgeJobs { older_than_days } => {
            let rt = build_runtime(config).await?;
            let retention = older_than_days
                .map(|days| chrono::Duration::days(days.max(0)))
                .unwrap_or_else(|| rt.config.job_retention());
            let purged = purge_expired_jobs(rt.store.as_ref(), retention).await?;
            println!("purged {purged} finished jobs");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = std::env::var("INTAKE_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn migrate(config: &PipelineConfig) -> Result<()> {
    if config.store_backend == StoreBackend::Memory {
        info!("in-memory store selected; nothing to migrate");
        return Ok(());
    }
    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("applying migrations")?;
    Ok(())
}

async fn build_runtime(config: PipelineConfig) -> Result<Runtime> {
    let store: Arc<dyn IntakeStore> = match config.store_backend {
        StoreBackend::Postgres => Arc::new(
            PgStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to postgres")?,
        ),
        StoreBackend::Memory => {
            warn!("using the in-memory store; state does not outlive this process");
            Arc::new(MemoryStore::new())
        }
    };
    let registry = SourceRegistry::load(&config.sources_file)?;
    info!(
        sources = registry.enabled().count(),
        file = %config.sources_file.display(),
        "source registry loaded"
    );
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        PayloadStore::new(&config.payload_dir),
        Arc::new(registry),
        config.ingest_options(),
    ));
    Ok(Runtime {
        config,
        store,
        pipeline,
    })
}

fn batch_worker(rt: &Runtime) -> BatchWorker {
    BatchWorker::new(
        rt.pipeline.clone(),
        rt.config.worker_id.clone(),
        rt.config.stale_batch_after(),
    )
}

/// Handlers are registered only for collaborators that are configured; other
/// job types stay queued for a worker that has them.
fn job_worker(rt: &Runtime) -> Result<JobWorker> {
    let config = &rt.config;
    let client = Arc::new(HookClient::new(config.http_client_config())?);
    let mut worker = JobWorker::new(
        rt.store.clone(),
        config.worker_id.clone(),
        config.stale_job_after(),
        config.job_backoff(),
    );
    match &config.scoring_url {
        Some(url) => {
            let scorer = Arc::new(HttpScorer::new(client.clone(), url.clone()));
            worker = worker.register(Arc::new(EnrichBatchHandler::new(rt.store.clone(), scorer)));
        }
        None => warn!("INTAKE_SCORING_URL is not set; enrich_batch jobs will not run here"),
    }
    match &config.cache_refresh_url {
        Some(url) => {
            let notifier = Arc::new(HttpNotifier::new(client, url.clone()));
            worker = worker.register(Arc::new(RefreshReadModelHandler::new(notifier)));
        }
        None => warn!("INTAKE_CACHE_REFRESH_URL is not set; refresh_read_model jobs will not run here"),
    }
    Ok(worker)
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

fn spawn_workers(
    rt: &Runtime,
    kind: WorkerKind,
    shutdown: &watch::Receiver<bool>,
    tasks: &mut JoinSet<()>,
) -> Result<()> {
    let poll = rt.config.poll_interval();
    if matches!(kind, WorkerKind::All | WorkerKind::Batches) {
        let worker = batch_worker(rt);
        let shutdown = shutdown.clone();
        tasks.spawn(async move { worker.run(poll, shutdown).await });
    }
    if matches!(kind, WorkerKind::All | WorkerKind::Jobs) {
        let worker = job_worker(rt)?;
        let shutdown = shutdown.clone();
        tasks.spawn(async move { worker.run(poll, shutdown).await });
    }
    Ok(())
}

async fn run_workers(rt: &Runtime, kind: WorkerKind, once: bool) -> Result<()> {
    if once {
        if matches!(kind, WorkerKind::All | WorkerKind::Batches) {
            let batches = batch_worker(rt).drain().await?;
            println!("processed {batches} batches");
        }
        if matches!(kind, WorkerKind::All | WorkerKind::Jobs) {
            let jobs = job_worker(rt)?.drain().await?;
            println!("ran {jobs} jobs");
        }
        return Ok(());
    }

    let shutdown = shutdown_signal();
    let mut scheduler = maybe_build_scheduler(&rt.config, rt.store.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let mut tasks = JoinSet::new();
    spawn_workers(rt, kind, &shutdown, &mut tasks)?;
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "worker task panicked");
        }
    }

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn serve(rt: &Runtime, with_workers: bool) -> Result<()> {
    let shutdown = shutdown_signal();
    let mut scheduler = maybe_build_scheduler(&rt.config, rt.store.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let mut tasks = JoinSet::new();
    if with_workers {
        spawn_workers(rt, WorkerKind::All, &shutdown, &mut tasks)?;
    }

    let mut stop = shutdown.clone();
    intake_web::serve(
        AppState::new(rt.pipeline.clone()),
        rt.config.web_port,
        async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        },
    )
    .await?;

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "worker task panicked");
        }
    }
    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
