//! Batch admission and the staged ingest: capture, validate and gate,
//! canonical upsert. Each stage ends in a guarded transition, so a batch
//! taken over by another worker resumes from whatever status it reached.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use intake_adapters::{reader_for, RegistryError, SourceConfig, SourceRegistry};
use intake_core::{
    Batch, BatchStatus, BatchTransition, ErrorCode, ExportFormat, FailedRow, FailureStage,
    JobType, NewBatch, NewFailedRow, NewJob, RawRecord, RawRow, RejectionReason, RowCounts,
    UpsertOutcome, ValidatedRow, DEFAULT_JOB_MAX_ATTEMPTS,
};
use intake_storage::{IntakeStore, PayloadStore, StoreError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::transform::{assess_row, quarantine_entry, KeyTracker};

pub const DEFAULT_ERROR_LIMIT: usize = 100;
pub const MAX_ERROR_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("submitted payload is empty")]
    EmptyPayload,
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("batch {0} not found")]
    BatchNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub max_payload_bytes: usize,
    /// A batch claimed more often than this is failed as stalled.
    pub max_batch_claims: u32,
    pub job_max_attempts: u32,
    pub row_chunk_size: usize,
    /// Rows processed between claim heartbeats.
    pub heartbeat_every: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_batch_claims: 5,
            job_max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
            row_chunk_size: 500,
            heartbeat_every: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub source: String,
    pub vendor_reference: Option<String>,
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

impl Submission {
    pub fn new(source: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.into(),
            vendor_reference: None,
            filename: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_vendor_reference(mut self, reference: impl Into<String>) -> Self {
        self.vendor_reference = Some(reference.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowErrorRecord {
    pub id: Uuid,
    pub row_index: u64,
    pub stage: FailureStage,
    pub error_code: ErrorCode,
    pub error_message: String,
    pub raw_data: RawRecord,
    pub resolved: bool,
}

impl From<FailedRow> for RowErrorRecord {
    fn from(row: FailedRow) -> Self {
        Self {
            id: row.id,
            row_index: row.row_index,
            stage: row.stage,
            error_code: row.error_code,
            error_message: row.error_message,
            raw_data: row.raw_data,
            resolved: row.resolution.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub source: String,
    pub status: BatchStatus,
    pub format: ExportFormat,
    pub vendor_reference: Option<String>,
    pub filename: Option<String>,
    pub counts: RowCounts,
    pub error_rate: f64,
    pub error_threshold_percent: f64,
    pub rejection_reason: Option<RejectionReason>,
    pub error_summary: Option<String>,
    pub capture_duration_ms: Option<u64>,
    pub db_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub errors: Vec<RowErrorRecord>,
    pub errors_truncated: bool,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

pub struct IngestPipeline {
    store: Arc<dyn IntakeStore>,
    payloads: PayloadStore,
    registry: Arc<SourceRegistry>,
    options: IngestOptions,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn IntakeStore>,
        payloads: PayloadStore,
        registry: Arc<SourceRegistry>,
        options: IngestOptions,
    ) -> Self {
        Self {
            store,
            payloads,
            registry,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn IntakeStore> {
        &self.store
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    /// Persist the payload and admit a batch for it, or return the batch that
    /// already holds the same content or vendor reference.
    pub async fn submit(&self, submission: Submission) -> Result<SubmitReceipt, PipelineError> {
        let source = self.registry.get(&submission.source)?;
        if submission.bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(PipelineError::EmptyPayload);
        }
        if submission.bytes.len() > self.options.max_payload_bytes {
            return Err(PipelineError::PayloadTooLarge {
                size: submission.bytes.len(),
                limit: self.options.max_payload_bytes,
            });
        }

        let stored = self
            .payloads
            .store_payload(
                &source.source,
                source.format.file_extension(),
                &submission.bytes,
            )
            .await?;
        let admission = self
            .store
            .admit_batch(NewBatch {
                source: source.source.clone(),
                content_digest: stored.content_digest.clone(),
                vendor_reference: non_blank(submission.vendor_reference),
                filename: non_blank(submission.filename),
                format: source.format,
                payload_path: stored.relative_path.to_string_lossy().into_owned(),
                error_threshold_percent: source.error_threshold_percent,
            })
            .await?;

        let batch = admission.batch;
        info!(
            batch_id = %batch.id,
            source = %batch.source,
            digest = %stored.content_digest,
            bytes = stored.byte_size,
            deduplicated = admission.deduplicated,
            status = %batch.status,
            "batch admitted"
        );
        Ok(SubmitReceipt {
            batch_id: batch.id,
            status: batch.status,
            deduplicated: admission.deduplicated,
        })
    }

    /// Run a batch this worker has claimed through every remaining stage.
    pub async fn drive(&self, batch: Batch, worker: &str) -> Result<Batch, PipelineError> {
        let span = info_span!(
            "batch",
            batch_id = %batch.id,
            source = %batch.source,
            worker,
            claim = batch.claim_count
        );
        self.drive_stages(batch, worker).instrument(span).await
    }

    async fn drive_stages(&self, batch: Batch, worker: &str) -> Result<Batch, PipelineError> {
        let source = self
            .registry
            .find(&batch.source)
            .ok_or_else(|| RegistryError::UnknownSource(batch.source.clone()))?;

        let mut batch = batch;
        if !batch.status.is_terminal() && batch.claim_count > self.options.max_batch_claims {
            warn!(claims = batch.claim_count, "batch keeps getting reclaimed; failing as stalled");
            let transition = BatchTransition::reject(
                batch.status,
                RejectionReason::Stalled,
                format!(
                    "abandoned in {} after {} claims",
                    batch.status, batch.claim_count
                ),
            );
            return Ok(self
                .store
                .transition_batch(batch.id, worker, &transition)
                .await?);
        }

        loop {
            batch = match batch.status {
                BatchStatus::Pending => self.start(&batch, worker).await?,
                BatchStatus::Staging => self.capture(&batch, source, worker).await?,
                BatchStatus::Transforming => self.validate(&batch, source, worker).await?,
                BatchStatus::Upserting => self.upsert(&batch, worker).await?,
                BatchStatus::Completed | BatchStatus::Failed => return Ok(batch),
            };
        }
    }

    async fn start(&self, batch: &Batch, worker: &str) -> Result<Batch, PipelineError> {
        let transition = BatchTransition::new(BatchStatus::Pending, BatchStatus::Staging);
        let batch = self
            .store
            .transition_batch(batch.id, worker, &transition)
            .await?;
        debug!("capture started");
        Ok(batch)
    }

    async fn capture(
        &self,
        batch: &Batch,
        source: &SourceConfig,
        worker: &str,
    ) -> Result<Batch, PipelineError> {
        let started = Instant::now();
        let bytes = self.payloads.read_payload(&batch.payload_path).await?;

        let parsed = match reader_for(source).read(&bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(code = %ErrorCode::ParseError, error = %err, "export unreadable; rejecting batch");
                let transition = BatchTransition::reject(
                    BatchStatus::Staging,
                    RejectionReason::ParseError,
                    format!("{}: {err}", ErrorCode::ParseError),
                )
                .with_capture_duration_ms(elapsed_ms(started));
                return Ok(self
                    .store
                    .transition_batch(batch.id, worker, &transition)
                    .await?);
            }
        };

        let captured_at = Utc::now();
        let rows: Vec<RawRow> = parsed
            .rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| RawRow {
                batch_id: batch.id,
                row_index: index as u64,
                data: row.data,
                parse_error: row.parse_error,
                captured_at,
            })
            .collect();

        let mut inserted = 0;
        for chunk in rows.chunks(self.options.row_chunk_size.max(1)) {
            inserted += self.store.insert_raw_rows(chunk).await?;
            self.store.touch_batch(batch.id, worker).await?;
        }

        let total = rows.len() as u64;
        let transition = BatchTransition::new(BatchStatus::Staging, BatchStatus::Transforming)
            .with_counts(RowCounts {
                total,
                ..RowCounts::default()
            })
            .with_columns(parsed.columns)
            .with_capture_duration_ms(elapsed_ms(started));
        let batch = self
            .store
            .transition_batch(batch.id, worker, &transition)
            .await?;
        info!(total, inserted, "raw rows captured");
        Ok(batch)
    }

    async fn validate(
        &self,
        batch: &Batch,
        source: &SourceConfig,
        worker: &str,
    ) -> Result<Batch, PipelineError> {
        let raw_rows = self.store.list_raw_rows(batch.id).await?;
        let done: BTreeMap<u64, ValidatedRow> = self
            .store
            .list_validated_rows(batch.id)
            .await?
            .into_iter()
            .map(|row| (row.row_index, row))
            .collect();

        let today = Utc::now().date_naive();
        let mut assessments: HashMap<u64, _> = raw_rows
            .iter()
            .filter(|raw| !done.contains_key(&raw.row_index))
            .map(|raw| (raw.row_index, assess_row(source, raw, today)))
            .collect();

        let mut tracker = KeyTracker::new(HashSet::new(), source.on_existing);
        let mut keys: Vec<String> = assessments
            .values()
            .filter_map(|a| a.natural_key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        for chunk in keys.chunks(self.options.row_chunk_size.max(1)) {
            tracker.extend_existing(self.store.existing_case_numbers(chunk).await?);
        }

        let now = Utc::now();
        let mut fresh = Vec::with_capacity(assessments.len());
        let mut quarantined = Vec::new();
        for raw in &raw_rows {
            let row = match done.get(&raw.row_index) {
                Some(existing) => {
                    tracker.remember(existing);
                    existing.clone()
                }
                None => {
                    let Some(assessment) = assessments.remove(&raw.row_index) else {
                        continue;
                    };
                    let row = tracker.classify(batch.id, raw.row_index, assessment, now);
                    fresh.push(row.clone());
                    row
                }
            };
            if let Some(entry) = quarantine_entry(raw, &row) {
                warn!(
                    row_index = entry.row_index,
                    code = %entry.error_code,
                    stage = %entry.stage,
                    "row quarantined"
                );
                quarantined.push(entry);
            }
        }

        for (n, chunk) in fresh.chunks(self.options.row_chunk_size.max(1)).enumerate() {
            self.store.insert_validated_rows(chunk).await?;
            if n > 0 {
                self.store.touch_batch(batch.id, worker).await?;
            }
        }
        for entry in quarantined {
            self.store.insert_failed_row(entry).await?;
        }

        let counts = self.store.row_tally(batch.id).await?;
        if !counts.reconciles() {
            warn!(?counts, "row tally does not reconcile");
        }
        let budget = batch.error_budget(source.warning_policy);
        let rate = counts.error_rate(source.warning_policy);
        let transition = if budget.validation_exceeded(&counts) {
            warn!(
                error_rate = rate,
                threshold = budget.threshold_percent,
                "error budget exceeded; upsert skipped"
            );
            BatchTransition::reject(
                BatchStatus::Transforming,
                RejectionReason::ErrorThresholdExceeded,
                format!(
                    "{}: {} of {} rows invalid ({:.2}% > {:.2}%)",
                    ErrorCode::ThresholdExceeded,
                    counts.invalid,
                    counts.total,
                    rate * 100.0,
                    budget.threshold_percent
                ),
            )
        } else {
            BatchTransition::new(BatchStatus::Transforming, BatchStatus::Upserting)
        }
        .with_counts(counts);

        let batch = self
            .store
            .transition_batch(batch.id, worker, &transition)
            .await?;
        info!(
            valid = counts.valid,
            warning = counts.warning,
            invalid = counts.invalid,
            duplicate = counts.duplicate,
            status = %batch.status,
            "validation finished"
        );
        Ok(batch)
    }

    async fn upsert(&self, batch: &Batch, worker: &str) -> Result<Batch, PipelineError> {
        let started = Instant::now();
        let rows = self.store.list_validated_rows(batch.id).await?;
        let raw_data: HashMap<u64, RawRecord> = self
            .store
            .list_raw_rows(batch.id)
            .await?
            .into_iter()
            .map(|raw| (raw.row_index, raw.data))
            .collect();

        let pending = rows
            .iter()
            .filter(|row| row.status.is_upsert_eligible() && row.upsert_outcome.is_none());
        for (n, row) in pending.enumerate() {
            if n > 0 && n % self.options.heartbeat_every.max(1) == 0 {
                self.store.touch_batch(batch.id, worker).await?;
            }
            let written = self
                .store
                .upsert_validated_row(batch.id, worker, row.row_index, &row.values)
                .await;
            match written {
                Ok(_) => {}
                Err(err @ (StoreError::LeaseMismatch { .. } | StoreError::NotFound { .. })) => {
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(row_index = row.row_index, code = %ErrorCode::UpsertError, error = %err, "upsert failed; row dead-lettered");
                    self.store
                        .insert_failed_row(NewFailedRow {
                            batch_id: batch.id,
                            row_index: row.row_index,
                            stage: FailureStage::Upsert,
                            error_code: ErrorCode::UpsertError,
                            error_message: err.to_string(),
                            raw_data: raw_data.get(&row.row_index).cloned().unwrap_or_default(),
                        })
                        .await?;
                    self.store
                        .record_upsert_outcome(batch.id, row.row_index, UpsertOutcome::Failed)
                        .await?;
                }
            }
        }

        let counts = self.store.row_tally(batch.id).await?;
        let warning_policy = self
            .registry
            .find(&batch.source)
            .map(|s| s.warning_policy)
            .unwrap_or_default();
        let budget = batch.error_budget(warning_policy);

        let transition = if budget.upsert_exceeded(&counts) {
            warn!(
                upsert_failed = counts.upsert_failed,
                total = counts.total,
                "upsert failures exceed the error budget"
            );
            BatchTransition::reject(
                BatchStatus::Upserting,
                RejectionReason::UpsertThresholdExceeded,
                format!(
                    "{}: {} of {} rows failed to upsert ({:.2}% > {:.2}%)",
                    ErrorCode::UpsertError,
                    counts.upsert_failed,
                    counts.total,
                    counts.upsert_failure_rate() * 100.0,
                    budget.threshold_percent
                ),
            )
        } else {
            self.announce_change(batch).await?;
            BatchTransition::new(BatchStatus::Upserting, BatchStatus::Completed)
        }
        .with_counts(counts)
        .with_db_duration_ms(elapsed_ms(started));

        let batch = self
            .store
            .transition_batch(batch.id, worker, &transition)
            .await?;
        info!(
            inserted = counts.inserted,
            updated = counts.updated,
            upsert_failed = counts.upsert_failed,
            status = %batch.status,
            "canonical upsert finished"
        );
        Ok(batch)
    }

    /// Queue the downstream follow-ups for a batch whose rows landed. Handlers
    /// are idempotent, so a repeat after a crash only costs a second run.
    async fn announce_change(&self, batch: &Batch) -> Result<(), PipelineError> {
        let payload = json!({ "batch_id": batch.id, "source": batch.source });
        for job_type in [JobType::RefreshReadModel, JobType::EnrichBatch] {
            let job = self
                .store
                .enqueue(
                    NewJob::new(job_type, payload.clone())
                        .with_max_attempts(self.options.job_max_attempts),
                )
                .await?;
            debug!(job_id = %job.id, job_type = %job_type, "follow-up job queued");
        }
        Ok(())
    }

    pub async fn batch(&self, id: Uuid) -> Result<Batch, PipelineError> {
        self.store
            .get_batch(id)
            .await?
            .ok_or(PipelineError::BatchNotFound(id))
    }

    /// Status snapshot with up to `error_limit` per-row error records
    /// (default 100, capped at 500).
    pub async fn status_report(
        &self,
        id: Uuid,
        error_limit: Option<usize>,
    ) -> Result<BatchReport, PipelineError> {
        let batch = self.batch(id).await?;
        let counts = if batch.status.is_terminal() {
            batch.counts
        } else {
            self.store.row_tally(id).await?
        };
        let warning_policy = self
            .registry
            .find(&batch.source)
            .map(|s| s.warning_policy)
            .unwrap_or_default();

        let limit = error_limit.unwrap_or(DEFAULT_ERROR_LIMIT).min(MAX_ERROR_LIMIT);
        let mut errors = self.store.list_failed_rows(id, Some(limit + 1)).await?;
        let errors_truncated = errors.len() > limit;
        errors.truncate(limit);

        Ok(BatchReport {
            batch_id: batch.id,
            source: batch.source,
            status: batch.status,
            format: batch.format,
            vendor_reference: batch.vendor_reference,
            filename: batch.filename,
            counts,
            error_rate: counts.error_rate(warning_policy),
            error_threshold_percent: batch.error_threshold_percent,
            rejection_reason: batch.rejection_reason,
            error_summary: batch.error_summary,
            capture_duration_ms: batch.capture_duration_ms,
            db_duration_ms: batch.db_duration_ms,
            created_at: batch.created_at,
            updated_at: batch.updated_at,
            completed_at: batch.completed_at,
            failed_at: batch.failed_at,
            errors: errors.into_iter().map(RowErrorRecord::from).collect(),
            errors_truncated,
        })
    }

    pub async fn failed_rows(&self, batch_id: Uuid) -> Result<Vec<FailedRow>, PipelineError> {
        self.batch(batch_id).await?;
        Ok(self.store.list_failed_rows(batch_id, None).await?)
    }

    pub async fn resolve_failed_row(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<FailedRow, PipelineError> {
        let row = self
            .store
            .resolve_failed_row(id, resolved_by, non_blank(notes))
            .await?;
        info!(failed_row_id = %id, batch_id = %row.batch_id, resolved_by, "failed row resolved");
        Ok(row)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use chrono::Duration;
    use intake_core::{JobStatus, ValidationStatus};
    use intake_storage::{BatchStore, CanonicalStore, JobQueue, MemoryStore};
    use tempfile::TempDir;

    use super::*;

    pub(crate) const TEST_REGISTRY: &str = r#"
sources:
  - source: bulk
    display_name: Bulk CSV
    format: csv
    error_threshold_percent: 10
    date_formats: ["%m/%d/%Y"]
    fields:
      - { target: case_number, column: "Case No", required: true }
      - { target: plaintiff_name, column: Plaintiff, required: true }
      - { target: judgment_amount, column: Amount, required: true }
      - { target: entry_date, column: Entered, required: true }
      - { target: county, column: County }
  - source: docket
    display_name: Docket JSON
    format: json_array
    fields:
      - { target: case_number, column: docket, required: true }
      - { target: plaintiff_name, column: plaintiff, required: true }
"#;

    pub(crate) struct Harness {
        pub store: Arc<MemoryStore>,
        pub pipeline: Arc<IngestPipeline>,
        _payload_dir: TempDir,
    }

    pub(crate) fn harness_with(registry: SourceRegistry, options: IngestOptions) -> Harness {
        let payload_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(IngestPipeline::new(
            store.clone(),
            PayloadStore::new(payload_dir.path()),
            Arc::new(registry),
            options,
        ));
        Harness {
            store,
            pipeline,
            _payload_dir: payload_dir,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(
            SourceRegistry::from_yaml_str(TEST_REGISTRY).unwrap(),
            IngestOptions::default(),
        )
    }

    pub(crate) fn csv_line(case: &str, plaintiff: &str, amount: &str) -> String {
        format!("{case},{plaintiff},{amount},01/15/2023,Kings\n")
    }

    pub(crate) fn bulk_csv(lines: impl IntoIterator<Item = String>) -> String {
        let mut out = String::from("Case No,Plaintiff,Amount,Entered,County\n");
        out.extend(lines);
        out
    }

    pub(crate) fn clean_csv(rows: usize) -> String {
        bulk_csv((0..rows).map(|i| csv_line(&format!("CV-{i:04}"), &format!("Plaintiff {}", i % 7), "$100.00")))
    }

    pub(crate) async fn run_to_end(h: &Harness, worker: &str) -> Batch {
        let batch = h
            .store
            .claim_batch(worker, Duration::minutes(5))
            .await
            .unwrap()
            .expect("a claimable batch");
        h.pipeline.drive(batch, worker).await.unwrap()
    }

    #[tokio::test]
    async fn error_budget_rejects_before_any_upsert() {
        let h = harness();
        let csv = bulk_csv((0..100).map(|i| {
            let plaintiff = if i % 8 == 3 && i < 96 { "" } else { "Acme" };
            csv_line(&format!("CV-{i:04}"), plaintiff, "10.00")
        }));
        let receipt = h.pipeline.submit(Submission::new("bulk", csv)).await.unwrap();
        assert_eq!(receipt.status, BatchStatus::Pending);

        let batch = run_to_end(&h, "w1").await;
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(
            batch.rejection_reason,
            Some(RejectionReason::ErrorThresholdExceeded)
        );
        assert_eq!(batch.counts.total, 100);
        assert_eq!(batch.counts.invalid, 12);
        assert!(batch.counts.reconciles());
        assert_eq!(h.store.judgment_count().await, 0);

        let failed = h.store.list_failed_rows(batch.id, None).await.unwrap();
        assert_eq!(failed.len(), 12);
        assert!(failed
            .iter()
            .all(|f| f.error_code == ErrorCode::MissingRequiredField
                && f.stage == FailureStage::Validate));
        assert!(batch.error_summary.unwrap().starts_with("THRESHOLD_EXCEEDED"));
        assert!(h
            .store
            .claim("jobs", &[], Duration::minutes(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mostly_clean_batch_completes_and_signals_downstream() {
        let h = harness();
        let mut lines: Vec<String> = (0..92)
            .map(|i| csv_line(&format!("CV-{i:04}"), "Acme Funding", "$1,000.00"))
            .collect();
        lines.extend((92..97).map(|i| csv_line(&format!("CV-{i:04}"), "Acme Funding", "lots")));
        lines.extend((0..3).map(|i| csv_line(&format!("cv-{i:04}"), "Acme Funding", "5")));
        h.pipeline
            .submit(Submission::new("bulk", bulk_csv(lines)))
            .await
            .unwrap();

        let batch = run_to_end(&h, "w1").await;
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.counts.total, 100);
        assert_eq!(batch.counts.valid, 92);
        assert_eq!(batch.counts.invalid, 5);
        assert_eq!(batch.counts.duplicate, 3);
        assert_eq!(batch.counts.inserted, 92);
        assert!(batch.counts.reconciles());
        assert!(batch.claimed_by.is_none());
        assert!(batch.db_duration_ms.is_some());
        assert!(batch.capture_duration_ms.is_some());

        let failed = h.store.list_failed_rows(batch.id, None).await.unwrap();
        assert_eq!(failed.len(), 5);
        assert!(failed.iter().all(|f| f.error_code == ErrorCode::InvalidAmount));
        assert_eq!(h.store.judgment_count().await, 92);
        assert_eq!(h.store.plaintiff_count().await, 1);

        let dupes: Vec<_> = h
            .store
            .list_validated_rows(batch.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.status == ValidationStatus::Duplicate)
            .map(|r| r.row_index)
            .collect();
        assert_eq!(dupes, vec![97, 98, 99]);

        let mut job_types = Vec::new();
        while let Some(job) = h.store.claim("jobs", &[], Duration::minutes(5)).await.unwrap() {
            assert_eq!(job.payload["batch_id"], json!(batch.id));
            assert_eq!(job.status, JobStatus::Processing);
            job_types.push(job.job_type);
        }
        job_types.sort_by_key(|t| t.as_str());
        assert_eq!(job_types, vec![JobType::EnrichBatch, JobType::RefreshReadModel]);
    }

    #[tokio::test]
    async fn one_bad_upsert_does_not_stop_the_rest() {
        let h = harness();
        h.store.inject_upsert_fault("CV-0042").await;
        h.pipeline
            .submit(Submission::new("bulk", clean_csv(100)))
            .await
            .unwrap();

        let batch = run_to_end(&h, "w1").await;
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.counts.inserted, 99);
        assert_eq!(batch.counts.upsert_failed, 1);
        assert_eq!(h.store.judgment_count().await, 99);
        assert!(h.store.get_judgment("CV-0041").await.unwrap().is_some());
        assert!(h.store.get_judgment("CV-0043").await.unwrap().is_some());
        assert!(h.store.get_judgment("CV-0042").await.unwrap().is_none());

        let failed = h.store.list_failed_rows(batch.id, None).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].row_index, 42);
        assert_eq!(failed[0].stage, FailureStage::Upsert);
        assert_eq!(failed[0].error_code, ErrorCode::UpsertError);
        assert_eq!(failed[0].raw_data["Case No"], "CV-0042");
    }

    #[tokio::test]
    async fn widespread_upsert_failure_fails_the_batch_after_the_fact() {
        let h = harness();
        for i in 0..11 {
            h.store.inject_upsert_fault(&format!("CV-{:04}", i * 9)).await;
        }
        h.pipeline
            .submit(Submission::new("bulk", clean_csv(100)))
            .await
            .unwrap();

        let batch = run_to_end(&h, "w1").await;
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(
            batch.rejection_reason,
            Some(RejectionReason::UpsertThresholdExceeded)
        );
        assert_eq!(batch.counts.upsert_failed, 11);
        assert_eq!(h.store.judgment_count().await, 89);
        assert!(h
            .store
            .claim("jobs", &[], Duration::minutes(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn resubmission_returns_the_same_batch_without_new_rows() {
        let h = harness();
        let csv = clean_csv(10);
        let first = h
            .pipeline
            .submit(Submission::new("bulk", csv.clone()).with_filename("drop.csv"))
            .await
            .unwrap();
        let batch = run_to_end(&h, "w1").await;
        assert_eq!(batch.id, first.batch_id);

        let crlf = csv.replace('\n', "\r\n");
        let again = h
            .pipeline
            .submit(Submission::new("bulk", crlf))
            .await
            .unwrap();
        assert!(again.deduplicated);
        assert_eq!(again.batch_id, first.batch_id);
        assert_eq!(again.status, BatchStatus::Completed);

        assert!(h
            .store
            .claim_batch("w2", Duration::minutes(5))
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.store.list_raw_rows(first.batch_id).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn vendor_reference_alone_identifies_a_resend() {
        let h = harness();
        let first = h
            .pipeline
            .submit(Submission::new("bulk", clean_csv(3)).with_vendor_reference("EXP-77"))
            .await
            .unwrap();
        let second = h
            .pipeline
            .submit(Submission::new("bulk", clean_csv(4)).with_vendor_reference(" EXP-77 "))
            .await
            .unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.batch_id, second.batch_id);
    }

    #[tokio::test]
    async fn structural_problems_are_refused_at_submission() {
        let options = IngestOptions {
            max_payload_bytes: 64,
            ..IngestOptions::default()
        };
        let h = harness_with(SourceRegistry::from_yaml_str(TEST_REGISTRY).unwrap(), options);

        let err = h
            .pipeline
            .submit(Submission::new("nobody", "a,b\n1,2\n"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Registry(RegistryError::UnknownSource(_))
        ));
        assert!(matches!(
            h.pipeline.submit(Submission::new("bulk", " \n ")).await,
            Err(PipelineError::EmptyPayload)
        ));
        assert!(matches!(
            h.pipeline.submit(Submission::new("bulk", clean_csv(5))).await,
            Err(PipelineError::PayloadTooLarge { limit: 64, .. })
        ));
    }

    #[tokio::test]
    async fn unreadable_export_fails_fast_with_parse_error() {
        let h = harness();
        h.pipeline
            .submit(Submission::new("docket", "{\"docket\": 1"))
            .await
            .unwrap();
        let batch = run_to_end(&h, "w1").await;
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.rejection_reason, Some(RejectionReason::ParseError));
        assert!(batch.error_summary.unwrap().starts_with("PARSE_ERROR"));
        assert!(batch.transforming_at.is_none());
        assert!(h.store.list_raw_rows(batch.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaimed_batch_resumes_capture_without_duplicating_rows() {
        let h = harness();
        let csv = clean_csv(20);
        let receipt = h
            .pipeline
            .submit(Submission::new("bulk", csv.clone()))
            .await
            .unwrap();

        // first worker gets as far as a partial capture, then goes quiet
        let claimed = h
            .store
            .claim_batch("w1", Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        h.store
            .transition_batch(
                claimed.id,
                "w1",
                &BatchTransition::new(BatchStatus::Pending, BatchStatus::Staging),
            )
            .await
            .unwrap();
        let source = h.pipeline.registry().get("bulk").unwrap();
        let parsed = reader_for(source).read(csv.as_bytes()).unwrap();
        let partial: Vec<RawRow> = parsed
            .rows
            .into_iter()
            .take(5)
            .enumerate()
            .map(|(i, row)| RawRow {
                batch_id: claimed.id,
                row_index: i as u64,
                data: row.data,
                parse_error: None,
                captured_at: Utc::now(),
            })
            .collect();
        h.store.insert_raw_rows(&partial).await.unwrap();

        h.store.advance_clock(Duration::minutes(10)).await;
        let batch = run_to_end(&h, "w2").await;
        assert_eq!(batch.id, receipt.batch_id);
        assert_eq!(batch.claim_count, 2);
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.counts.total, 20);
        assert_eq!(h.store.list_raw_rows(batch.id).await.unwrap().len(), 20);

        let stale = h
            .store
            .transition_batch(
                batch.id,
                "w1",
                &BatchTransition::new(BatchStatus::Staging, BatchStatus::Transforming),
            )
            .await;
        assert!(matches!(stale, Err(StoreError::LeaseMismatch { .. })));
    }

    #[tokio::test]
    async fn reclaimed_upsert_counts_rows_written_before_the_crash_once() {
        let h = harness();
        h.pipeline
            .submit(Submission::new("bulk", clean_csv(3)))
            .await
            .unwrap();
        let claimed = h
            .store
            .claim_batch("w1", Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        let source = h.pipeline.registry().get("bulk").unwrap();
        let batch = h.pipeline.start(&claimed, "w1").await.unwrap();
        let batch = h.pipeline.capture(&batch, source, "w1").await.unwrap();
        let batch = h.pipeline.validate(&batch, source, "w1").await.unwrap();
        assert_eq!(batch.status, BatchStatus::Upserting);

        // w1 writes one judgment, then dies
        let rows = h.store.list_validated_rows(batch.id).await.unwrap();
        h.store
            .upsert_validated_row(batch.id, "w1", rows[0].row_index, &rows[0].values)
            .await
            .unwrap();

        h.store.advance_clock(Duration::minutes(10)).await;
        let done = run_to_end(&h, "w2").await;
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.counts.inserted, 3);
        assert_eq!(done.counts.updated, 0);
        assert_eq!(h.store.judgments_for_batch(done.id).await.unwrap().len(), 3);

        let late = h
            .store
            .upsert_validated_row(batch.id, "w1", rows[1].row_index, &rows[1].values)
            .await;
        assert!(matches!(late, Err(StoreError::LeaseMismatch { .. })));
        let done = h.pipeline.batch(done.id).await.unwrap();
        assert_eq!(done.counts.updated, 0);
    }

    #[tokio::test]
    async fn endlessly_reclaimed_batch_is_stalled_and_can_be_resubmitted() {
        let options = IngestOptions {
            max_batch_claims: 2,
            ..IngestOptions::default()
        };
        let h = harness_with(SourceRegistry::from_yaml_str(TEST_REGISTRY).unwrap(), options);
        let csv = clean_csv(5);
        let first = h
            .pipeline
            .submit(Submission::new("bulk", csv.clone()))
            .await
            .unwrap();

        for worker in ["w1", "w2"] {
            h.store
                .claim_batch(worker, Duration::minutes(5))
                .await
                .unwrap()
                .unwrap();
            h.store.advance_clock(Duration::minutes(10)).await;
        }
        let batch = run_to_end(&h, "w3").await;
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.rejection_reason, Some(RejectionReason::Stalled));

        let fresh = h
            .pipeline
            .submit(Submission::new("bulk", csv))
            .await
            .unwrap();
        assert!(!fresh.deduplicated);
        assert_ne!(fresh.batch_id, first.batch_id);
        let redone = run_to_end(&h, "w4").await;
        assert_eq!(redone.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn update_policy_refreshes_existing_judgments() {
        let yaml = TEST_REGISTRY.replace(
            "    error_threshold_percent: 10\n",
            "    error_threshold_percent: 10\n    on_existing: update\n",
        );
        let h = harness_with(SourceRegistry::from_yaml_str(&yaml).unwrap(), IngestOptions::default());
        h.pipeline
            .submit(Submission::new("bulk", clean_csv(3)))
            .await
            .unwrap();
        run_to_end(&h, "w1").await;

        let corrected = bulk_csv([csv_line("CV-0001", "Plaintiff 1", "$250.00")]);
        h.pipeline
            .submit(Submission::new("bulk", corrected))
            .await
            .unwrap();
        let batch = run_to_end(&h, "w1").await;
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.counts.updated, 1);
        assert_eq!(batch.counts.inserted, 0);
        let judgment = h.store.get_judgment("CV-0001").await.unwrap().unwrap();
        assert_eq!(judgment.judgment_amount_cents, Some(25_000));
        assert_eq!(judgment.source_batch_id, batch.id);
    }

    #[tokio::test]
    async fn default_policy_treats_known_case_numbers_as_duplicates() {
        let h = harness();
        h.pipeline
            .submit(Submission::new("bulk", clean_csv(3)))
            .await
            .unwrap();
        run_to_end(&h, "w1").await;

        h.pipeline
            .submit(Submission::new(
                "bulk",
                bulk_csv([csv_line("CV-0002", "Someone", "1.00"), csv_line("CV-0100", "Someone", "1.00")]),
            ))
            .await
            .unwrap();
        let batch = run_to_end(&h, "w1").await;
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.counts.duplicate, 1);
        assert_eq!(batch.counts.inserted, 1);
    }

    #[tokio::test]
    async fn status_report_pages_row_errors() {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let registry = SourceRegistry::load(root.join("sources.yaml")).unwrap();
        let h = harness_with(registry, IngestOptions::default());
        let bytes = std::fs::read(root.join("fixtures/simplicity/sample.csv")).unwrap();
        let receipt = h
            .pipeline
            .submit(Submission::new("simplicity", bytes).with_filename("sample.csv"))
            .await
            .unwrap();

        let pending = h.pipeline.status_report(receipt.batch_id, None).await.unwrap();
        assert_eq!(pending.status, BatchStatus::Pending);
        assert!(pending.errors.is_empty());

        run_to_end(&h, "w1").await;
        let report = h.pipeline.status_report(receipt.batch_id, None).await.unwrap();
        assert_eq!(report.status, BatchStatus::Failed);
        assert_eq!(
            report.rejection_reason,
            Some(RejectionReason::ErrorThresholdExceeded)
        );
        assert_eq!(report.counts.total, 5);
        assert_eq!(report.counts.invalid, 2);
        assert_eq!(report.counts.warning, 1);
        assert_eq!(report.counts.duplicate, 1);
        assert!((report.error_rate - 0.4).abs() < 1e-9);
        assert_eq!(report.filename.as_deref(), Some("sample.csv"));
        let codes: Vec<_> = report.errors.iter().map(|e| e.error_code).collect();
        assert_eq!(codes, vec![ErrorCode::InvalidAmount, ErrorCode::InvalidDate]);
        assert!(!report.errors_truncated);

        let capped = h
            .pipeline
            .status_report(receipt.batch_id, Some(1))
            .await
            .unwrap();
        assert_eq!(capped.errors.len(), 1);
        assert!(capped.errors_truncated);

        assert!(matches!(
            h.pipeline.status_report(Uuid::new_v4(), None).await,
            Err(PipelineError::BatchNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_rows_resolve_exactly_once() {
        let h = harness();
        h.pipeline
            .submit(Submission::new(
                "bulk",
                bulk_csv([csv_line("CV-1", "Acme", "bad"), csv_line("CV-2", "Acme", "1"), csv_line("CV-3", "Acme", "1")]),
            ))
            .await
            .unwrap();
        let batch = run_to_end(&h, "w1").await;
        let rows = h.pipeline.failed_rows(batch.id).await.unwrap();
        assert_eq!(rows.len(), 1);

        let resolved = h
            .pipeline
            .resolve_failed_row(rows[0].id, "ops@example.com", Some("  ".into()))
            .await
            .unwrap();
        let resolution = resolved.resolution.unwrap();
        assert_eq!(resolution.resolved_by, "ops@example.com");
        assert!(resolution.notes.is_none());

        let again = h
            .pipeline
            .resolve_failed_row(rows[0].id, "someone-else", None)
            .await;
        assert!(matches!(
            again,
            Err(PipelineError::Store(StoreError::Resolution(_)))
        ));
    }
}
