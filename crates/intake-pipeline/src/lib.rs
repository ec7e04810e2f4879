//! Batch intake orchestration: submission, the staged batch state machine,
//! follow-up job workers, scheduled maintenance and dead-letter export.

pub mod config;
pub mod export;
pub mod ingest;
pub mod scheduler;
pub mod transform;
pub mod worker;

pub use config::{PipelineConfig, StoreBackend, DEFAULT_MAX_PAYLOAD_BYTES};
pub use export::{export_failed_rows, DeadLetterExport, ExportManifest, ManifestFile};
pub use ingest::{
    BatchReport, IngestOptions, IngestPipeline, PipelineError, RowErrorRecord, SubmitReceipt,
    Submission, DEFAULT_ERROR_LIMIT, MAX_ERROR_LIMIT,
};
pub use scheduler::{maybe_build_scheduler, purge_expired_jobs};
pub use worker::{
    BatchWorker, CollectabilityScorer, EnrichBatchHandler, HttpNotifier, HttpScorer, JobHandler,
    JobRun, JobWorker, ReadModelNotifier, RefreshReadModelHandler,
};

pub const CRATE_NAME: &str = "intake-pipeline";
