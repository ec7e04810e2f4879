//! Core domain model for the judgment intake pipeline: batches, staged rows,
//! dead-letter entries, canonical entities and background queue jobs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "intake-core";

pub const DEFAULT_ERROR_THRESHOLD_PERCENT: f64 = 10.0;
pub const DEFAULT_JOB_MAX_ATTEMPTS: u32 = 5;

/// Verbatim vendor row: column header -> cell text, exactly as exported.
pub type RawRecord = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal {machine} transition {from} -> {to}")]
    Illegal {
        machine: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Batch lifecycle. Monotonic, except that any non-terminal state may be
/// rejected straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Staging,
    Transforming,
    Upserting,
    Completed,
    Failed,
}

text_enum!(BatchStatus, "batch status", {
    Pending => "pending",
    Staging => "staging",
    Transforming => "transforming",
    Upserting => "upserting",
    Completed => "completed",
    Failed => "failed",
});

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        match (self, next) {
            (Pending, Staging)
            | (Staging, Transforming)
            | (Transforming, Upserting)
            | (Upserting, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(self, next: BatchStatus) -> Result<BatchStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::Illegal {
                machine: "batch",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    ParseError,
    ErrorThresholdExceeded,
    UpsertThresholdExceeded,
    Stalled,
}

text_enum!(RejectionReason, "rejection reason", {
    ParseError => "parse_error",
    ErrorThresholdExceeded => "error_threshold_exceeded",
    UpsertThresholdExceeded => "upsert_threshold_exceeded",
    Stalled => "stalled",
});

impl RejectionReason {
    /// Operational rejections say nothing about the file contents, so an
    /// identical resubmission is allowed to start over.
    pub fn is_operational(self) -> bool {
        matches!(self, RejectionReason::Stalled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    JsonLines,
    JsonArray,
}

text_enum!(ExportFormat, "export format", {
    Csv => "csv",
    JsonLines => "json_lines",
    JsonArray => "json_array",
});

impl ExportFormat {
    pub fn file_extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::JsonLines => "jsonl",
            ExportFormat::JsonArray => "json",
        }
    }
}

/// Whether `warning` rows count toward the error-rate numerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningPolicy {
    #[default]
    Exclude,
    Include,
}

/// What to do with a row whose natural key already exists in the canonical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingKeyPolicy {
    #[default]
    Duplicate,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowCounts {
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
    pub duplicate: u64,
    /// Subset of `valid` that carried soft issues.
    pub warning: u64,
    pub inserted: u64,
    pub updated: u64,
    pub upsert_failed: u64,
}

impl RowCounts {
    pub fn reconciles(&self) -> bool {
        self.valid + self.invalid + self.duplicate == self.total
    }

    pub fn eligible(&self) -> u64 {
        self.valid
    }

    pub fn error_rate(&self, policy: WarningPolicy) -> f64 {
        let numerator = match policy {
            WarningPolicy::Exclude => self.invalid,
            WarningPolicy::Include => self.invalid + self.warning,
        };
        ratio(numerator, self.total)
    }

    pub fn upsert_failure_rate(&self) -> f64 {
        ratio(self.upsert_failed, self.total)
    }
}

fn ratio(numerator: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        numerator as f64 / total as f64
    }
}

/// Batch-level accept/reject rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorBudget {
    pub threshold_percent: f64,
    pub warning_policy: WarningPolicy,
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self {
            threshold_percent: DEFAULT_ERROR_THRESHOLD_PERCENT,
            warning_policy: WarningPolicy::default(),
        }
    }
}

impl ErrorBudget {
    pub fn threshold_ratio(&self) -> f64 {
        self.threshold_percent / 100.0
    }

    pub fn validation_exceeded(&self, counts: &RowCounts) -> bool {
        counts.error_rate(self.warning_policy) > self.threshold_ratio()
    }

    pub fn upsert_exceeded(&self, counts: &RowCounts) -> bool {
        counts.upsert_failure_rate() > self.threshold_ratio()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub source: String,
    pub content_digest: String,
    pub vendor_reference: Option<String>,
    pub filename: Option<String>,
    pub format: ExportFormat,
    pub payload_path: String,
    /// Header order as exported; raw rows themselves are key-sorted maps.
    pub columns: Vec<String>,
    pub status: BatchStatus,
    pub counts: RowCounts,
    pub error_threshold_percent: f64,
    pub rejection_reason: Option<RejectionReason>,
    pub error_summary: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_count: u32,
    pub capture_duration_ms: Option<u64>,
    pub db_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub staging_at: Option<DateTime<Utc>>,
    pub transforming_at: Option<DateTime<Utc>>,
    pub upserting_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    pub fn from_new(new: NewBatch, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: new.source,
            content_digest: new.content_digest,
            vendor_reference: new.vendor_reference,
            filename: new.filename,
            format: new.format,
            payload_path: new.payload_path,
            columns: Vec::new(),
            status: BatchStatus::Pending,
            counts: RowCounts::default(),
            error_threshold_percent: new.error_threshold_percent,
            rejection_reason: None,
            error_summary: None,
            claimed_by: None,
            claimed_at: None,
            claim_count: 0,
            capture_duration_ms: None,
            db_duration_ms: None,
            created_at: now,
            staging_at: None,
            transforming_at: None,
            upserting_at: None,
            completed_at: None,
            failed_at: None,
            updated_at: now,
        }
    }

    /// Failed for operational reasons; a fresh admission may supersede it.
    pub fn is_aborted(&self) -> bool {
        self.status == BatchStatus::Failed
            && self
                .rejection_reason
                .map(RejectionReason::is_operational)
                .unwrap_or(false)
    }

    pub fn matches_admission(&self, new: &NewBatch) -> bool {
        if self.source != new.source || self.is_aborted() {
            return false;
        }
        if self.content_digest == new.content_digest {
            return true;
        }
        matches!(
            (&self.vendor_reference, &new.vendor_reference),
            (Some(a), Some(b)) if a == b
        )
    }

    pub fn is_claimable(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match self.claimed_at {
            None => true,
            Some(at) => now - at > stale_after,
        }
    }

    pub fn stamp(&mut self, status: BatchStatus, at: DateTime<Utc>) {
        let slot = match status {
            BatchStatus::Pending => return,
            BatchStatus::Staging => &mut self.staging_at,
            BatchStatus::Transforming => &mut self.transforming_at,
            BatchStatus::Upserting => &mut self.upserting_at,
            BatchStatus::Completed => &mut self.completed_at,
            BatchStatus::Failed => &mut self.failed_at,
        };
        *slot = Some(at);
    }

    pub fn error_budget(&self, warning_policy: WarningPolicy) -> ErrorBudget {
        ErrorBudget {
            threshold_percent: self.error_threshold_percent,
            warning_policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatch {
    pub source: String,
    pub content_digest: String,
    pub vendor_reference: Option<String>,
    pub filename: Option<String>,
    pub format: ExportFormat,
    pub payload_path: String,
    pub error_threshold_percent: f64,
}

/// Guarded status change applied by the current claim owner.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchTransitionPatch {
    pub counts: Option<RowCounts>,
    pub columns: Option<Vec<String>>,
    pub rejection_reason: Option<RejectionReason>,
    pub error_summary: Option<String>,
    pub capture_duration_ms: Option<u64>,
    pub db_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchTransition {
    pub from: BatchStatus,
    pub to: BatchStatus,
    pub patch: BatchTransitionPatch,
}

impl BatchTransition {
    pub fn new(from: BatchStatus, to: BatchStatus) -> Self {
        Self {
            from,
            to,
            patch: BatchTransitionPatch::default(),
        }
    }

    pub fn reject(from: BatchStatus, reason: RejectionReason, summary: impl Into<String>) -> Self {
        let mut t = Self::new(from, BatchStatus::Failed);
        t.patch.rejection_reason = Some(reason);
        t.patch.error_summary = Some(summary.into());
        t
    }

    pub fn with_counts(mut self, counts: RowCounts) -> Self {
        self.patch.counts = Some(counts);
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.patch.columns = Some(columns);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.patch.error_summary = Some(summary.into());
        self
    }

    pub fn with_capture_duration_ms(mut self, ms: u64) -> Self {
        self.patch.capture_duration_ms = Some(ms);
        self
    }

    pub fn with_db_duration_ms(mut self, ms: u64) -> Self {
        self.patch.db_duration_ms = Some(ms);
        self
    }

    pub fn validate(&self) -> Result<(), TransitionError> {
        self.from.transition(self.to).map(|_| ())
    }

    /// Apply to an in-memory batch; callers have already checked ownership.
    pub fn apply(&self, batch: &mut Batch, now: DateTime<Utc>) -> Result<(), TransitionError> {
        batch.status = batch.status.transition(self.to)?;
        batch.stamp(self.to, now);
        let patch = &self.patch;
        if let Some(counts) = patch.counts {
            batch.counts = counts;
        }
        if let Some(columns) = &patch.columns {
            batch.columns = columns.clone();
        }
        if patch.rejection_reason.is_some() {
            batch.rejection_reason = patch.rejection_reason;
        }
        if patch.error_summary.is_some() {
            batch.error_summary = patch.error_summary.clone();
        }
        if patch.capture_duration_ms.is_some() {
            batch.capture_duration_ms = patch.capture_duration_ms;
        }
        if patch.db_duration_ms.is_some() {
            batch.db_duration_ms = patch.db_duration_ms;
        }
        if self.to.is_terminal() {
            batch.claimed_by = None;
            batch.claimed_at = None;
        } else {
            batch.claimed_at = Some(now);
        }
        batch.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub batch_id: Uuid,
    pub row_index: u64,
    pub data: RawRecord,
    /// Reader diagnostic for rows that could not be decoded cleanly; kept
    /// beside the verbatim data, never merged into it.
    pub parse_error: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    MalformedRow,
    MissingRequiredField,
    InvalidAmount,
    InvalidDate,
    DuplicateInBatch,
    DuplicateExisting,
    MissingOptionalField,
    ThresholdExceeded,
    UpsertError,
    QueueJobFailure,
}

text_enum!(ErrorCode, "error code", {
    ParseError => "PARSE_ERROR",
    MalformedRow => "MALFORMED_ROW",
    MissingRequiredField => "MISSING_REQUIRED_FIELD",
    InvalidAmount => "INVALID_AMOUNT",
    InvalidDate => "INVALID_DATE",
    DuplicateInBatch => "DUPLICATE_IN_BATCH",
    DuplicateExisting => "DUPLICATE_EXISTING",
    MissingOptionalField => "MISSING_OPTIONAL_FIELD",
    ThresholdExceeded => "THRESHOLD_EXCEEDED",
    UpsertError => "UPSERT_ERROR",
    QueueJobFailure => "QUEUE_JOB_FAILURE",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub code: ErrorCode,
    pub field: Option<String>,
    pub message: String,
}

impl RowIssue {
    pub fn new(code: ErrorCode, field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code,
            field: field.map(ToString::to_string),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Invalid,
    Duplicate,
    Warning,
}

text_enum!(ValidationStatus, "validation status", {
    Valid => "valid",
    Invalid => "invalid",
    Duplicate => "duplicate",
    Warning => "warning",
});

impl ValidationStatus {
    pub fn is_upsert_eligible(self) -> bool {
        matches!(self, ValidationStatus::Valid | ValidationStatus::Warning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Failed,
}

text_enum!(UpsertOutcome, "upsert outcome", {
    Inserted => "inserted",
    Updated => "updated",
    Failed => "failed",
});

/// Canonical values after mapping and coercion. `None` means the vendor did
/// not supply the field, so an update must leave the stored value alone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JudgmentDraft {
    pub case_number: Option<String>,
    pub plaintiff_name: Option<String>,
    pub defendant_name: Option<String>,
    pub judgment_amount_cents: Option<i64>,
    pub entry_date: Option<NaiveDate>,
    pub court: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub defendant_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedRow {
    pub batch_id: Uuid,
    pub row_index: u64,
    pub natural_key: Option<String>,
    pub status: ValidationStatus,
    pub values: JudgmentDraft,
    pub errors: Vec<RowIssue>,
    pub warnings: Vec<RowIssue>,
    pub upsert_outcome: Option<UpsertOutcome>,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Parse,
    Validate,
    Transform,
    Upsert,
}

text_enum!(FailureStage, "failure stage", {
    Parse => "parse",
    Validate => "validate",
    Transform => "transform",
    Upsert => "upsert",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_at: DateTime<Utc>,
    pub resolved_by: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("failed row {0} is already resolved")]
    AlreadyResolved(Uuid),
    #[error("resolver must not be empty")]
    MissingResolver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFailedRow {
    pub batch_id: Uuid,
    pub row_index: u64,
    pub stage: FailureStage,
    pub error_code: ErrorCode,
    pub error_message: String,
    pub raw_data: RawRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRow {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub row_index: u64,
    pub stage: FailureStage,
    pub error_code: ErrorCode,
    pub error_message: String,
    pub raw_data: RawRecord,
    pub created_at: DateTime<Utc>,
    pub resolution: Option<Resolution>,
}

impl FailedRow {
    pub fn from_new(new: NewFailedRow, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id: new.batch_id,
            row_index: new.row_index,
            stage: new.stage,
            error_code: new.error_code,
            error_message: new.error_message,
            raw_data: new.raw_data,
            created_at: now,
            resolution: None,
        }
    }

    /// Resolution is write-once.
    pub fn resolve(
        &mut self,
        resolved_by: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ResolutionError> {
        if self.resolution.is_some() {
            return Err(ResolutionError::AlreadyResolved(self.id));
        }
        let resolved_by = resolved_by.trim();
        if resolved_by.is_empty() {
            return Err(ResolutionError::MissingResolver);
        }
        self.resolution = Some(Resolution {
            resolved_at: now,
            resolved_by: resolved_by.to_string(),
            notes,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plaintiff {
    pub id: Uuid,
    pub name: String,
    pub name_normalized: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub id: Uuid,
    pub case_number: String,
    pub plaintiff_id: Uuid,
    pub defendant_name: Option<String>,
    pub judgment_amount_cents: Option<i64>,
    pub entry_date: Option<NaiveDate>,
    pub court: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub defendant_address: Option<String>,
    pub source_batch_id: Uuid,
    /// Written only by the enrichment job.
    pub collectability_score: Option<f64>,
    pub scored_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Judgment {
    /// Overwrite only what the draft supplies; enriched fields survive.
    pub fn merge_draft(
        &mut self,
        plaintiff_id: Uuid,
        draft: &JudgmentDraft,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) {
        fn take<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
            if let Some(value) = incoming {
                *slot = Some(value.clone());
            }
        }
        self.plaintiff_id = plaintiff_id;
        take(&mut self.defendant_name, &draft.defendant_name);
        take(&mut self.judgment_amount_cents, &draft.judgment_amount_cents);
        take(&mut self.entry_date, &draft.entry_date);
        take(&mut self.court, &draft.court);
        take(&mut self.county, &draft.county);
        take(&mut self.state, &draft.state);
        take(&mut self.defendant_address, &draft.defendant_address);
        self.source_batch_id = batch_id;
        self.updated_at = now;
    }
}

/// Lowercased alphanumeric words joined by single spaces; plaintiff lookup key.
pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case numbers compare case-insensitively and ignore internal whitespace.
pub fn normalize_case_number(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<String>()
        .to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EnrichBatch,
    RefreshReadModel,
    GenerateDocument,
}

text_enum!(JobType, "job type", {
    EnrichBatch => "enrich_batch",
    RefreshReadModel => "refresh_read_model",
    GenerateDocument => "generate_document",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

text_enum!(JobStatus, "job status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `Processing -> Processing` is the stale takeover.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
        )
    }

    pub fn transition(self, next: JobStatus) -> Result<JobStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::Illegal {
                machine: "job",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub run_after: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: new.job_type,
            payload: new.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts.max(1),
            locked_at: None,
            locked_by: None,
            run_after: now,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match self.status {
            JobStatus::Pending => self.run_after <= now,
            JobStatus::Processing => self
                .locked_at
                .map(|at| now - at > stale_after)
                .unwrap_or(true),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).single().unwrap()
    }

    fn new_batch(digest: &str, vendor_reference: Option<&str>) -> NewBatch {
        NewBatch {
            source: "simplicity".into(),
            content_digest: digest.into(),
            vendor_reference: vendor_reference.map(ToString::to_string),
            filename: Some("export.csv".into()),
            format: ExportFormat::Csv,
            payload_path: format!("simplicity/{digest}.csv"),
            error_threshold_percent: DEFAULT_ERROR_THRESHOLD_PERCENT,
        }
    }

    #[test]
    fn batch_happy_path_transitions_are_allowed() {
        let path = [
            BatchStatus::Pending,
            BatchStatus::Staging,
            BatchStatus::Transforming,
            BatchStatus::Upserting,
            BatchStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn batch_status_never_moves_backwards_or_out_of_terminal() {
        assert!(!BatchStatus::Transforming.can_transition_to(BatchStatus::Staging));
        assert!(!BatchStatus::Pending.can_transition_to(BatchStatus::Upserting));
        assert!(!BatchStatus::Completed.can_transition_to(BatchStatus::Failed));
        assert!(!BatchStatus::Failed.can_transition_to(BatchStatus::Pending));
        let err = BatchStatus::Completed
            .transition(BatchStatus::Staging)
            .unwrap_err();
        assert_eq!(err.to_string(), "illegal batch transition completed -> staging");
    }

    #[test]
    fn early_reject_is_allowed_from_every_open_state() {
        for status in BatchStatus::ALL {
            assert_eq!(
                status.can_transition_to(BatchStatus::Failed),
                !status.is_terminal()
            );
        }
    }

    #[test]
    fn status_text_round_trips_through_from_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), *status);
        }
        assert_eq!(
            "MISSING_REQUIRED_FIELD".parse::<ErrorCode>().unwrap(),
            ErrorCode::MissingRequiredField
        );
        let err = "archived".parse::<BatchStatus>().unwrap_err();
        assert_eq!(err.kind, "batch status");
    }

    #[test]
    fn error_rate_respects_warning_policy() {
        let counts = RowCounts {
            total: 100,
            valid: 90,
            invalid: 6,
            duplicate: 4,
            warning: 5,
            ..Default::default()
        };
        assert!(counts.reconciles());
        assert!((counts.error_rate(WarningPolicy::Exclude) - 0.06).abs() < 1e-9);
        assert!((counts.error_rate(WarningPolicy::Include) - 0.11).abs() < 1e-9);

        let budget = ErrorBudget::default();
        assert!(!budget.validation_exceeded(&counts));
        let strict = ErrorBudget {
            warning_policy: WarningPolicy::Include,
            ..budget
        };
        assert!(strict.validation_exceeded(&counts));
    }

    #[test]
    fn empty_batch_has_zero_error_rate() {
        let counts = RowCounts::default();
        assert_eq!(counts.error_rate(WarningPolicy::Include), 0.0);
        assert!(!ErrorBudget::default().validation_exceeded(&counts));
    }

    #[test]
    fn budget_is_exceeded_strictly_above_threshold() {
        let at_threshold = RowCounts {
            total: 100,
            valid: 90,
            invalid: 10,
            ..Default::default()
        };
        assert!(!ErrorBudget::default().validation_exceeded(&at_threshold));
        let above = RowCounts {
            total: 100,
            valid: 88,
            invalid: 12,
            ..Default::default()
        };
        assert!(ErrorBudget::default().validation_exceeded(&above));
    }

    #[test]
    fn admission_matches_digest_or_vendor_reference_but_not_aborted_batches() {
        let mut batch = Batch::from_new(new_batch("abc", Some("EXP-7")), ts(9, 0));
        assert!(batch.matches_admission(&new_batch("abc", None)));
        assert!(batch.matches_admission(&new_batch("def", Some("EXP-7"))));
        assert!(!batch.matches_admission(&new_batch("def", Some("EXP-8"))));

        let mut other_source = new_batch("abc", None);
        other_source.source = "fairway".into();
        assert!(!batch.matches_admission(&other_source));

        batch.status = BatchStatus::Failed;
        batch.rejection_reason = Some(RejectionReason::ErrorThresholdExceeded);
        assert!(batch.matches_admission(&new_batch("abc", None)));
        batch.rejection_reason = Some(RejectionReason::Stalled);
        assert!(!batch.matches_admission(&new_batch("abc", None)));
    }

    #[test]
    fn transition_apply_stamps_time_and_releases_claim_on_terminal() {
        let mut batch = Batch::from_new(new_batch("abc", None), ts(9, 0));
        batch.claimed_by = Some("worker-a".into());
        batch.claimed_at = Some(ts(9, 1));

        BatchTransition::new(BatchStatus::Pending, BatchStatus::Staging)
            .apply(&mut batch, ts(9, 2))
            .unwrap();
        assert_eq!(batch.staging_at, Some(ts(9, 2)));
        assert_eq!(batch.claimed_at, Some(ts(9, 2)));

        BatchTransition::reject(
            BatchStatus::Staging,
            RejectionReason::ParseError,
            "no header row",
        )
        .apply(&mut batch, ts(9, 3))
        .unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.failed_at, Some(ts(9, 3)));
        assert_eq!(batch.claimed_by, None);
        assert_eq!(batch.error_summary.as_deref(), Some("no header row"));
    }

    #[test]
    fn claimability_follows_stale_threshold() {
        let mut batch = Batch::from_new(new_batch("abc", None), ts(9, 0));
        let stale = Duration::minutes(5);
        assert!(batch.is_claimable(ts(9, 0), stale));
        batch.claimed_at = Some(ts(9, 0));
        assert!(!batch.is_claimable(ts(9, 4), stale));
        assert!(batch.is_claimable(ts(9, 6), stale));
        batch.status = BatchStatus::Completed;
        assert!(!batch.is_claimable(ts(10, 0), stale));
    }

    #[test]
    fn failed_row_resolution_is_write_once() {
        let mut row = FailedRow::from_new(
            NewFailedRow {
                batch_id: Uuid::new_v4(),
                row_index: 3,
                stage: FailureStage::Validate,
                error_code: ErrorCode::InvalidAmount,
                error_message: "amount `12,x` is not a number".into(),
                raw_data: RawRecord::from([("Amount".to_string(), "12,x".to_string())]),
            },
            ts(9, 0),
        );
        assert_eq!(
            row.resolve("  ", None, ts(9, 1)),
            Err(ResolutionError::MissingResolver)
        );
        row.resolve("ops@firm", Some("vendor resent".into()), ts(9, 1))
            .unwrap();
        assert_eq!(
            row.resolve("someone-else", None, ts(9, 2)),
            Err(ResolutionError::AlreadyResolved(row.id))
        );
        assert_eq!(row.resolution.as_ref().unwrap().resolved_by, "ops@firm");
    }

    #[test]
    fn merge_draft_only_overwrites_supplied_fields() {
        let batch_a = Uuid::new_v4();
        let batch_b = Uuid::new_v4();
        let plaintiff = Uuid::new_v4();
        let mut judgment = Judgment {
            id: Uuid::new_v4(),
            case_number: "CV-2024-001".into(),
            plaintiff_id: plaintiff,
            defendant_name: Some("Jane Roe".into()),
            judgment_amount_cents: Some(150_000),
            entry_date: NaiveDate::from_ymd_opt(2024, 1, 5),
            court: Some("Civil Court".into()),
            county: Some("Kings".into()),
            state: Some("NY".into()),
            defendant_address: Some("1 Main St".into()),
            source_batch_id: batch_a,
            collectability_score: Some(0.72),
            scored_at: Some(ts(8, 0)),
            created_at: ts(8, 0),
            updated_at: ts(8, 0),
        };
        let draft = JudgmentDraft {
            case_number: Some("CV-2024-001".into()),
            judgment_amount_cents: Some(175_000),
            ..Default::default()
        };
        judgment.merge_draft(plaintiff, &draft, batch_b, ts(9, 0));
        assert_eq!(judgment.judgment_amount_cents, Some(175_000));
        assert_eq!(judgment.defendant_address.as_deref(), Some("1 Main St"));
        assert_eq!(judgment.collectability_score, Some(0.72));
        assert_eq!(judgment.source_batch_id, batch_b);
    }

    #[test]
    fn normalization_collapses_noise() {
        assert_eq!(normalize_name("  ACME Funding, LLC. "), "acme funding llc");
        assert_eq!(normalize_case_number(" cv 2024 / 001 "), "CV2024/001");
    }

    #[test]
    fn job_claimability_covers_pending_due_and_stale_processing() {
        let stale = Duration::minutes(5);
        let mut job = QueueJob::from_new(
            NewJob::new(JobType::EnrichBatch, serde_json::json!({})),
            ts(9, 0),
        );
        assert!(job.is_claimable(ts(9, 0), stale));
        job.run_after = ts(9, 10);
        assert!(!job.is_claimable(ts(9, 5), stale));

        job.status = JobStatus::Processing;
        job.locked_at = Some(ts(9, 0));
        assert!(!job.is_claimable(ts(9, 3), stale));
        assert!(job.is_claimable(ts(9, 6), stale));

        job.status = JobStatus::Completed;
        assert!(!job.is_claimable(ts(12, 0), stale));
    }

    #[test]
    fn job_transitions_reject_leaving_terminal_states() {
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Failed.transition(JobStatus::Pending).is_err());
    }
}
