//! Persistence for the intake pipeline: store traits, the PostgreSQL and
//! in-memory backends, the content-addressed payload store, and outbound HTTP
//! retry utilities.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use intake_core::{
    Batch, BatchTransition, FailedRow, JobType, Judgment, JudgmentDraft, NewBatch, NewFailedRow,
    NewJob, Plaintiff, QueueJob, RawRow, ResolutionError, RowCounts, TransitionError,
    UpsertOutcome, ValidatedRow,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod payload;
pub mod postgres;

pub use http::{BackoffPolicy, HookClient, HookError, HttpClientConfig, Retry};
pub use memory::MemoryStore;
pub use payload::{PayloadStore, StoredPayload};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "intake-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} {id} is not held by `{worker}` in the expected state")]
    LeaseMismatch {
        entity: &'static str,
        id: String,
        worker: String,
    },
    #[error("judgment draft is missing its {0}")]
    MissingKey(&'static str),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("corrupt value in column `{column}`: {message}")]
    Decode { column: &'static str, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn lease(entity: &'static str, id: impl ToString, worker: &str) -> Self {
        Self::LeaseMismatch {
            entity,
            id: id.to_string(),
            worker: worker.to_string(),
        }
    }
}

/// Outcome of the admission lookup-or-create.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub batch: Batch,
    /// True when an existing batch was returned instead of a new one.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    pub judgment_id: Uuid,
    pub plaintiff_id: Uuid,
    pub outcome: UpsertOutcome,
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Single atomic lookup-or-create keyed on (source, digest) or
    /// (source, vendor reference), ignoring aborted batches.
    async fn admit_batch(&self, new: NewBatch) -> Result<Admission, StoreError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, StoreError>;

    /// Take ownership of the oldest non-terminal batch that is unclaimed or
    /// whose claim went stale.
    async fn claim_batch(
        &self,
        worker: &str,
        stale_after: Duration,
    ) -> Result<Option<Batch>, StoreError>;

    /// Compare-and-set on (status, owner); refreshes the claim heartbeat.
    async fn transition_batch(
        &self,
        id: Uuid,
        worker: &str,
        transition: &BatchTransition,
    ) -> Result<Batch, StoreError>;

    /// Refresh the claim heartbeat mid-stage; fails once ownership is lost.
    async fn touch_batch(&self, id: Uuid, worker: &str) -> Result<(), StoreError>;

    async fn release_batch(&self, id: Uuid, worker: &str) -> Result<(), StoreError>;

    /// Idempotent on (batch_id, row_index); returns the number of new rows.
    async fn insert_raw_rows(&self, rows: &[RawRow]) -> Result<u64, StoreError>;

    async fn list_raw_rows(&self, batch_id: Uuid) -> Result<Vec<RawRow>, StoreError>;

    /// Idempotent on (batch_id, row_index); returns the number of new rows.
    async fn insert_validated_rows(&self, rows: &[ValidatedRow]) -> Result<u64, StoreError>;

    async fn list_validated_rows(&self, batch_id: Uuid) -> Result<Vec<ValidatedRow>, StoreError>;

    async fn record_upsert_outcome(
        &self,
        batch_id: Uuid,
        row_index: u64,
        outcome: UpsertOutcome,
    ) -> Result<(), StoreError>;

    /// `None` when an entry for (batch, row, stage) already exists.
    async fn insert_failed_row(&self, row: NewFailedRow) -> Result<Option<FailedRow>, StoreError>;

    async fn list_failed_rows(
        &self,
        batch_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<FailedRow>, StoreError>;

    async fn get_failed_row(&self, id: Uuid) -> Result<Option<FailedRow>, StoreError>;

    async fn resolve_failed_row(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<FailedRow, StoreError>;

    /// Counters derived from the persisted per-row state.
    async fn row_tally(&self, batch_id: Uuid) -> Result<RowCounts, StoreError>;
}

#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn existing_case_numbers(
        &self,
        case_numbers: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    /// Resolve-or-create the plaintiff, then insert-or-update the judgment.
    async fn upsert_judgment(
        &self,
        batch_id: Uuid,
        draft: &JudgmentDraft,
    ) -> Result<UpsertResult, StoreError>;

    /// `upsert_judgment` plus the row's outcome in one write, so a replayed
    /// row can never be counted twice. Refused once `worker` has lost the
    /// batch claim.
    async fn upsert_validated_row(
        &self,
        batch_id: Uuid,
        worker: &str,
        row_index: u64,
        draft: &JudgmentDraft,
    ) -> Result<UpsertResult, StoreError>;

    async fn find_plaintiff(&self, name: &str) -> Result<Option<Plaintiff>, StoreError>;

    async fn get_judgment(&self, case_number: &str) -> Result<Option<Judgment>, StoreError>;

    async fn judgments_for_batch(&self, batch_id: Uuid) -> Result<Vec<Judgment>, StoreError>;

    async fn set_collectability_score(
        &self,
        judgment_id: Uuid,
        score: f64,
        scored_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<QueueJob, StoreError>;

    /// Oldest claimable job of the given types (all types when empty).
    async fn claim(
        &self,
        worker: &str,
        job_types: &[JobType],
        stale_after: Duration,
    ) -> Result<Option<QueueJob>, StoreError>;

    async fn complete(&self, id: Uuid, worker: &str) -> Result<QueueJob, StoreError>;

    /// Back to pending after `retry_delay` while attempts remain, else failed.
    async fn fail(
        &self,
        id: Uuid,
        worker: &str,
        error: &str,
        retry_delay: Duration,
    ) -> Result<QueueJob, StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>, StoreError>;

    /// Delete terminal jobs last touched before `older_than`.
    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Everything the pipeline needs from one backend.
pub trait IntakeStore: BatchStore + CanonicalStore + JobQueue {}

impl<T: BatchStore + CanonicalStore + JobQueue> IntakeStore for T {}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical byte form used for content identity: UTF-8 BOM stripped, line
/// endings unified to LF, trailing whitespace at end of document removed.
pub fn normalize_for_digest(bytes: &[u8]) -> Vec<u8> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' {
            if iter.peek() == Some(&&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    while out.last().is_some_and(|b| b.is_ascii_whitespace()) {
        out.pop();
    }
    out
}

pub fn content_digest(bytes: &[u8]) -> String {
    sha256_hex(&normalize_for_digest(bytes))
}
