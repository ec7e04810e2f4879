//! In-process backend. One async mutex arbitrates every operation, so each
//! claim or admission is a single critical section.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use intake_core::{
    normalize_case_number, normalize_name, Batch, BatchTransition, FailedRow, JobStatus, JobType,
    Judgment, JudgmentDraft, NewBatch, NewFailedRow, NewJob, Plaintiff, QueueJob, RawRow,
    RowCounts, UpsertOutcome, ValidatedRow, ValidationStatus,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    Admission, BatchStore, CanonicalStore, JobQueue, StoreError, UpsertResult,
};

#[derive(Debug)]
struct State {
    skew: Duration,
    batches: BTreeMap<Uuid, Batch>,
    raw_rows: BTreeMap<(Uuid, u64), RawRow>,
    validated_rows: BTreeMap<(Uuid, u64), ValidatedRow>,
    failed_rows: Vec<FailedRow>,
    plaintiffs: HashMap<String, Plaintiff>,
    judgments: HashMap<String, Judgment>,
    jobs: HashMap<Uuid, QueueJob>,
    upsert_faults: HashSet<String>,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.skew
    }

    /// Resolve-or-create the plaintiff, then insert-or-update the judgment.
    fn upsert_judgment(
        &mut self,
        batch_id: Uuid,
        draft: &JudgmentDraft,
    ) -> Result<UpsertResult, StoreError> {
        let case_number = draft
            .case_number
            .as_deref()
            .map(normalize_case_number)
            .filter(|c| !c.is_empty())
            .ok_or(StoreError::MissingKey("case number"))?;
        let plaintiff_name = draft
            .plaintiff_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(StoreError::MissingKey("plaintiff name"))?;

        if self.upsert_faults.contains(&case_number) {
            return Err(StoreError::Backend(format!(
                "write rejected for judgment {case_number}"
            )));
        }
        let now = self.now();
        let plaintiff_id = self
            .plaintiffs
            .entry(normalize_name(plaintiff_name))
            .or_insert_with_key(|key| Plaintiff {
                id: Uuid::new_v4(),
                name: plaintiff_name.to_string(),
                name_normalized: key.clone(),
                created_at: now,
                updated_at: now,
            })
            .id;

        if let Some(existing) = self.judgments.get_mut(&case_number) {
            existing.merge_draft(plaintiff_id, draft, batch_id, now);
            return Ok(UpsertResult {
                judgment_id: existing.id,
                plaintiff_id,
                outcome: UpsertOutcome::Updated,
            });
        }

        let judgment = Judgment {
            id: Uuid::new_v4(),
            case_number: case_number.clone(),
            plaintiff_id,
            defendant_name: draft.defendant_name.clone(),
            judgment_amount_cents: draft.judgment_amount_cents,
            entry_date: draft.entry_date,
            court: draft.court.clone(),
            county: draft.county.clone(),
            state: draft.state.clone(),
            defendant_address: draft.defendant_address.clone(),
            source_batch_id: batch_id,
            collectability_score: None,
            scored_at: None,
            created_at: now,
            updated_at: now,
        };
        let judgment_id = judgment.id;
        self.judgments.insert(case_number, judgment);
        Ok(UpsertResult {
            judgment_id,
            plaintiff_id,
            outcome: UpsertOutcome::Inserted,
        })
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                skew: Duration::zero(),
                batches: BTreeMap::new(),
                raw_rows: BTreeMap::new(),
                validated_rows: BTreeMap::new(),
                failed_rows: Vec::new(),
                plaintiffs: HashMap::new(),
                judgments: HashMap::new(),
                jobs: HashMap::new(),
                upsert_faults: HashSet::new(),
            }),
        }
    }

    /// Shift this store's clock forward; lets callers age claims and locks.
    pub async fn advance_clock(&self, by: Duration) {
        let mut state = self.state.lock().await;
        state.skew += by;
    }

    /// Make every upsert of `case_number` fail with a backend error.
    pub async fn inject_upsert_fault(&self, case_number: &str) {
        let mut state = self.state.lock().await;
        state
            .upsert_faults
            .insert(normalize_case_number(case_number));
    }

    pub async fn judgment_count(&self) -> usize {
        self.state.lock().await.judgments.len()
    }

    pub async fn plaintiff_count(&self) -> usize {
        self.state.lock().await.plaintiffs.len()
    }
}

fn batch_range<V>(
    map: &BTreeMap<(Uuid, u64), V>,
    batch_id: Uuid,
) -> impl Iterator<Item = &V> {
    map.range((batch_id, 0)..=(batch_id, u64::MAX)).map(|(_, v)| v)
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn admit_batch(&self, new: NewBatch) -> Result<Admission, StoreError> {
        let mut state = self.state.lock().await;
        let existing = state
            .batches
            .values()
            .filter(|b| b.matches_admission(&new))
            .min_by_key(|b| b.created_at)
            .cloned();
        if let Some(batch) = existing {
            return Ok(Admission {
                batch,
                deduplicated: true,
            });
        }
        let batch = Batch::from_new(new, state.now());
        state.batches.insert(batch.id, batch.clone());
        Ok(Admission {
            batch,
            deduplicated: false,
        })
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, StoreError> {
        Ok(self.state.lock().await.batches.get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        worker: &str,
        stale_after: Duration,
    ) -> Result<Option<Batch>, StoreError> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let candidate = state
            .batches
            .values()
            .filter(|b| b.is_claimable(now, stale_after))
            .min_by_key(|b| (b.created_at, b.id))
            .map(|b| b.id);
        let Some(id) = candidate else {
            return Ok(None);
        };
        let batch = state
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("batch", id))?;
        batch.claimed_by = Some(worker.to_string());
        batch.claimed_at = Some(now);
        batch.claim_count += 1;
        batch.updated_at = now;
        Ok(Some(batch.clone()))
    }

    async fn transition_batch(
        &self,
        id: Uuid,
        worker: &str,
        transition: &BatchTransition,
    ) -> Result<Batch, StoreError> {
        transition.validate()?;
        let mut state = self.state.lock().await;
        let now = state.now();
        let batch = state
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("batch", id))?;
        if batch.status != transition.from || batch.claimed_by.as_deref() != Some(worker) {
            return Err(StoreError::lease("batch", id, worker));
        }
        transition.apply(batch, now)?;
        Ok(batch.clone())
    }

    async fn touch_batch(&self, id: Uuid, worker: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let batch = state
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("batch", id))?;
        if batch.claimed_by.as_deref() != Some(worker) {
            return Err(StoreError::lease("batch", id, worker));
        }
        batch.claimed_at = Some(now);
        Ok(())
    }

    async fn release_batch(&self, id: Uuid, worker: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let batch = state
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("batch", id))?;
        match batch.claimed_by.as_deref() {
            None => Ok(()),
            Some(owner) if owner == worker => {
                batch.claimed_by = None;
                batch.claimed_at = None;
                Ok(())
            }
            Some(_) => Err(StoreError::lease("batch", id, worker)),
        }
    }

    async fn insert_raw_rows(&self, rows: &[RawRow]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for row in rows {
            if let Entry::Vacant(slot) = state.raw_rows.entry((row.batch_id, row.row_index)) {
                slot.insert(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_raw_rows(&self, batch_id: Uuid) -> Result<Vec<RawRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(batch_range(&state.raw_rows, batch_id).cloned().collect())
    }

    async fn insert_validated_rows(&self, rows: &[ValidatedRow]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for row in rows {
            if state
                .validated_rows
                .contains_key(&(row.batch_id, row.row_index))
            {
                continue;
            }
            if row.status.is_upsert_eligible() {
                let clash = batch_range(&state.validated_rows, row.batch_id).any(|other| {
                    other.status.is_upsert_eligible()
                        && other.natural_key.is_some()
                        && other.natural_key == row.natural_key
                });
                if clash {
                    return Err(StoreError::Backend(format!(
                        "natural key {:?} already eligible in batch {}",
                        row.natural_key, row.batch_id
                    )));
                }
            }
            state
                .validated_rows
                .insert((row.batch_id, row.row_index), row.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn list_validated_rows(&self, batch_id: Uuid) -> Result<Vec<ValidatedRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(batch_range(&state.validated_rows, batch_id)
            .cloned()
            .collect())
    }

    async fn record_upsert_outcome(
        &self,
        batch_id: Uuid,
        row_index: u64,
        outcome: UpsertOutcome,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .validated_rows
            .get_mut(&(batch_id, row_index))
            .ok_or_else(|| StoreError::not_found("validated row", format!("{batch_id}/{row_index}")))?;
        row.upsert_outcome = Some(outcome);
        Ok(())
    }

    async fn insert_failed_row(&self, row: NewFailedRow) -> Result<Option<FailedRow>, StoreError> {
        let mut state = self.state.lock().await;
        let exists = state.failed_rows.iter().any(|f| {
            f.batch_id == row.batch_id && f.row_index == row.row_index && f.stage == row.stage
        });
        if exists {
            return Ok(None);
        }
        let failed = FailedRow::from_new(row, state.now());
        state.failed_rows.push(failed.clone());
        Ok(Some(failed))
    }

    async fn list_failed_rows(
        &self,
        batch_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<FailedRow>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<FailedRow> = state
            .failed_rows
            .iter()
            .filter(|f| f.batch_id == batch_id)
            .cloned()
            .collect();
        rows.sort_by_key(|f| (f.row_index, f.created_at));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn get_failed_row(&self, id: Uuid) -> Result<Option<FailedRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.failed_rows.iter().find(|f| f.id == id).cloned())
    }

    async fn resolve_failed_row(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<FailedRow, StoreError> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let row = state
            .failed_rows
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| StoreError::not_found("failed row", id))?;
        row.resolve(resolved_by, notes, now)?;
        Ok(row.clone())
    }

    async fn row_tally(&self, batch_id: Uuid) -> Result<RowCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = RowCounts {
            total: batch_range(&state.raw_rows, batch_id).count() as u64,
            ..RowCounts::default()
        };
        for row in batch_range(&state.validated_rows, batch_id) {
            match row.status {
                ValidationStatus::Valid => counts.valid += 1,
                ValidationStatus::Warning => {
                    counts.valid += 1;
                    counts.warning += 1;
                }
                ValidationStatus::Invalid => counts.invalid += 1,
                ValidationStatus::Duplicate => counts.duplicate += 1,
            }
            match row.upsert_outcome {
                Some(UpsertOutcome::Inserted) => counts.inserted += 1,
                Some(UpsertOutcome::Updated) => counts.updated += 1,
                Some(UpsertOutcome::Failed) => counts.upsert_failed += 1,
                None => {}
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn existing_case_numbers(
        &self,
        case_numbers: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(case_numbers
            .iter()
            .map(|c| normalize_case_number(c))
            .filter(|c| state.judgments.contains_key(c))
            .collect())
    }

    async fn upsert_judgment(
        &self,
        batch_id: Uuid,
        draft: &JudgmentDraft,
    ) -> Result<UpsertResult, StoreError> {
        self.state.lock().await.upsert_judgment(batch_id, draft)
    }

    async fn upsert_validated_row(
        &self,
        batch_id: Uuid,
        worker: &str,
        row_index: u64,
        draft: &JudgmentDraft,
    ) -> Result<UpsertResult, StoreError> {
        let mut state = self.state.lock().await;
        let owner = state
            .batches
            .get(&batch_id)
            .ok_or_else(|| StoreError::not_found("batch", batch_id))?
            .claimed_by
            .clone();
        if owner.as_deref() != Some(worker) {
            return Err(StoreError::lease("batch", batch_id, worker));
        }
        if !state.validated_rows.contains_key(&(batch_id, row_index)) {
            return Err(StoreError::not_found(
                "validated row",
                format!("{batch_id}/{row_index}"),
            ));
        }
        let result = state.upsert_judgment(batch_id, draft)?;
        if let Some(row) = state.validated_rows.get_mut(&(batch_id, row_index)) {
            row.upsert_outcome = Some(result.outcome);
        }
        Ok(result)
    }

    async fn find_plaintiff(&self, name: &str) -> Result<Option<Plaintiff>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.plaintiffs.get(&normalize_name(name)).cloned())
    }

    async fn get_judgment(&self, case_number: &str) -> Result<Option<Judgment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .judgments
            .get(&normalize_case_number(case_number))
            .cloned())
    }

    async fn judgments_for_batch(&self, batch_id: Uuid) -> Result<Vec<Judgment>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<Judgment> = state
            .judgments
            .values()
            .filter(|j| j.source_batch_id == batch_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.case_number.cmp(&b.case_number));
        Ok(out)
    }

    async fn set_collectability_score(
        &self,
        judgment_id: Uuid,
        score: f64,
        scored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let judgment = state
            .judgments
            .values_mut()
            .find(|j| j.id == judgment_id)
            .ok_or_else(|| StoreError::not_found("judgment", judgment_id))?;
        judgment.collectability_score = Some(score);
        judgment.scored_at = Some(scored_at);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<QueueJob, StoreError> {
        let mut state = self.state.lock().await;
        let job = QueueJob::from_new(job, state.now());
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim(
        &self,
        worker: &str,
        job_types: &[JobType],
        stale_after: Duration,
    ) -> Result<Option<QueueJob>, StoreError> {
        let mut state = self.state.lock().await;
        let now = state.now();

        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Processing
                && job.is_claimable(now, stale_after)
                && !job.has_attempts_remaining()
            {
                job.status = JobStatus::Failed;
                job.last_error = Some("lock expired after final attempt".to_string());
                job.locked_at = None;
                job.locked_by = None;
                job.updated_at = now;
            }
        }

        let candidate = state
            .jobs
            .values()
            .filter(|j| job_types.is_empty() || job_types.contains(&j.job_type))
            .filter(|j| j.is_claimable(now, stale_after))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);
        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        job.status = job.status.transition(JobStatus::Processing)?;
        job.attempts += 1;
        job.locked_at = Some(now);
        job.locked_by = Some(worker.to_string());
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: Uuid, worker: &str) -> Result<QueueJob, StoreError> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        if job.status != JobStatus::Processing || job.locked_by.as_deref() != Some(worker) {
            return Err(StoreError::lease("job", id, worker));
        }
        job.status = job.status.transition(JobStatus::Completed)?;
        job.locked_at = None;
        job.locked_by = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn fail(
        &self,
        id: Uuid,
        worker: &str,
        error: &str,
        retry_delay: Duration,
    ) -> Result<QueueJob, StoreError> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        if job.status != JobStatus::Processing || job.locked_by.as_deref() != Some(worker) {
            return Err(StoreError::lease("job", id, worker));
        }
        if job.has_attempts_remaining() {
            job.status = job.status.transition(JobStatus::Pending)?;
            job.run_after = now + retry_delay;
        } else {
            job.status = job.status.transition(JobStatus::Failed)?;
        }
        job.last_error = Some(error.to_string());
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < older_than));
        Ok((before - state.jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use intake_core::{
        BatchStatus, BatchTransition, ErrorCode, ExportFormat, FailureStage, RawRecord,
        DEFAULT_ERROR_THRESHOLD_PERCENT,
    };
    use serde_json::json;

    use super::*;

    fn new_batch(digest: &str) -> NewBatch {
        NewBatch {
            source: "simplicity".into(),
            content_digest: digest.into(),
            vendor_reference: None,
            filename: None,
            format: ExportFormat::Csv,
            payload_path: format!("simplicity/{digest}.csv"),
            error_threshold_percent: DEFAULT_ERROR_THRESHOLD_PERCENT,
        }
    }

    fn raw(batch_id: Uuid, row_index: u64) -> RawRow {
        RawRow {
            batch_id,
            row_index,
            data: RawRecord::from([("Case".to_string(), format!("CV-{row_index}"))]),
            parse_error: None,
            captured_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_admissions_converge_on_one_batch() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.admit_batch(new_batch("same")).await.unwrap()
            }));
        }
        let mut ids = HashSet::new();
        let mut fresh = 0;
        for handle in handles {
            let admission = handle.await.unwrap();
            ids.insert(admission.batch.id);
            if !admission.deduplicated {
                fresh += 1;
            }
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(fresh, 1);
    }

    #[tokio::test]
    async fn stalled_batches_are_superseded_on_resubmission() {
        let store = MemoryStore::new();
        let first = store.admit_batch(new_batch("abc")).await.unwrap().batch;
        store
            .claim_batch("w1", Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        store
            .transition_batch(
                first.id,
                "w1",
                &BatchTransition::reject(
                    BatchStatus::Pending,
                    intake_core::RejectionReason::Stalled,
                    "claimed too many times",
                ),
            )
            .await
            .unwrap();

        let second = store.admit_batch(new_batch("abc")).await.unwrap();
        assert!(!second.deduplicated);
        assert_ne!(second.batch.id, first.id);
    }

    #[tokio::test]
    async fn transitions_require_matching_owner_and_status() {
        let store = MemoryStore::new();
        let batch = store.admit_batch(new_batch("abc")).await.unwrap().batch;
        store
            .claim_batch("w1", Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        let staging = BatchTransition::new(BatchStatus::Pending, BatchStatus::Staging);
        let err = store
            .transition_batch(batch.id, "w2", &staging)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseMismatch { .. }));

        store
            .transition_batch(batch.id, "w1", &staging)
            .await
            .unwrap();
        let err = store
            .transition_batch(batch.id, "w1", &staging)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseMismatch { .. }));
    }

    #[tokio::test]
    async fn stale_batch_claims_are_taken_over() {
        let store = MemoryStore::new();
        store.admit_batch(new_batch("abc")).await.unwrap();
        let stale = Duration::minutes(5);

        let first = store.claim_batch("w1", stale).await.unwrap().unwrap();
        assert!(store.claim_batch("w2", stale).await.unwrap().is_none());

        store.advance_clock(Duration::minutes(6)).await;
        let second = store.claim_batch("w2", stale).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.claimed_by.as_deref(), Some("w2"));
        assert_eq!(second.claim_count, 2);
    }

    #[tokio::test]
    async fn raw_row_inserts_are_idempotent() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();
        let rows: Vec<RawRow> = (0..3).map(|i| raw(batch_id, i)).collect();
        assert_eq!(store.insert_raw_rows(&rows).await.unwrap(), 3);
        assert_eq!(store.insert_raw_rows(&rows).await.unwrap(), 0);
        assert_eq!(store.list_raw_rows(batch_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_rows_are_unique_per_stage_and_resolve_once() {
        let store = MemoryStore::new();
        let new = NewFailedRow {
            batch_id: Uuid::new_v4(),
            row_index: 4,
            stage: FailureStage::Upsert,
            error_code: ErrorCode::UpsertError,
            error_message: "connection reset".into(),
            raw_data: RawRecord::new(),
        };
        let created = store.insert_failed_row(new.clone()).await.unwrap().unwrap();
        assert!(store.insert_failed_row(new).await.unwrap().is_none());

        store
            .resolve_failed_row(created.id, "ops", None)
            .await
            .unwrap();
        let err = store
            .resolve_failed_row(created.id, "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Resolution(_)));
    }

    #[tokio::test]
    async fn upsert_overwrites_only_supplied_fields() {
        let store = MemoryStore::new();
        let first_batch = Uuid::new_v4();
        let draft = JudgmentDraft {
            case_number: Some("cv-1".into()),
            plaintiff_name: Some("Acme Funding LLC".into()),
            defendant_address: Some("1 Main St".into()),
            judgment_amount_cents: Some(1_000),
            ..Default::default()
        };
        let inserted = store.upsert_judgment(first_batch, &draft).await.unwrap();
        assert_eq!(inserted.outcome, UpsertOutcome::Inserted);

        let second = JudgmentDraft {
            case_number: Some("CV-1".into()),
            plaintiff_name: Some("ACME FUNDING, LLC".into()),
            judgment_amount_cents: Some(2_500),
            ..Default::default()
        };
        let updated = store.upsert_judgment(Uuid::new_v4(), &second).await.unwrap();
        assert_eq!(updated.outcome, UpsertOutcome::Updated);
        assert_eq!(updated.judgment_id, inserted.judgment_id);
        assert_eq!(updated.plaintiff_id, inserted.plaintiff_id);
        assert_eq!(store.plaintiff_count().await, 1);

        let stored = store.get_judgment("CV-1").await.unwrap().unwrap();
        assert_eq!(stored.judgment_amount_cents, Some(2_500));
        assert_eq!(stored.defendant_address.as_deref(), Some("1 Main St"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_pending_job_ten_claimers_exactly_one_wins() {
        let store = Arc::new(MemoryStore::new());
        store
            .enqueue(NewJob::new(JobType::EnrichBatch, json!({"batch_id": "x"})))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim(&format!("worker-{i}"), &[], Duration::minutes(5))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_receive_distinct_jobs() {
        let store = Arc::new(MemoryStore::new());
        for n in 0..4 {
            store
                .enqueue(NewJob::new(JobType::RefreshReadModel, json!({ "n": n })))
                .await
                .unwrap();
        }
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim(&format!("worker-{i}"), &[], Duration::minutes(5))
                    .await
                    .unwrap()
            }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                assert!(ids.insert(job.id), "job handed out twice");
            }
        }
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stale_processing_job_is_reclaimed_by_exactly_one_caller() {
        let store = Arc::new(MemoryStore::new());
        let job = store
            .enqueue(NewJob::new(JobType::EnrichBatch, json!({})))
            .await
            .unwrap();
        let stale = Duration::minutes(5);
        store.claim("crashed", &[], stale).await.unwrap().unwrap();
        store.advance_clock(Duration::minutes(10)).await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim(&format!("rescuer-{i}"), &[], stale).await.unwrap()
            }));
        }
        let mut reclaimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                reclaimed.push(job);
            }
        }
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, job.id);
        assert_eq!(reclaimed[0].attempts, 2);

        let err = store.complete(job.id, "crashed").await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseMismatch { .. }));
    }

    #[tokio::test]
    async fn failed_jobs_retry_with_backoff_then_dead_letter() {
        let store = MemoryStore::new();
        let job = store
            .enqueue(NewJob::new(JobType::EnrichBatch, json!({})).with_max_attempts(2))
            .await
            .unwrap();
        let stale = Duration::minutes(5);

        store.claim("w", &[], stale).await.unwrap().unwrap();
        let retry = store
            .fail(job.id, "w", "scorer timed out", Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(retry.status, JobStatus::Pending);
        assert!(store.claim("w", &[], stale).await.unwrap().is_none());

        store.advance_clock(Duration::seconds(31)).await;
        store.claim("w", &[], stale).await.unwrap().unwrap();
        let dead = store
            .fail(job.id, "w", "scorer timed out", Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(dead.status, JobStatus::Failed);
        assert_eq!(dead.attempts, 2);
        assert_eq!(dead.last_error.as_deref(), Some("scorer timed out"));
    }

    #[tokio::test]
    async fn claim_filters_by_job_type() {
        let store = MemoryStore::new();
        store
            .enqueue(NewJob::new(JobType::GenerateDocument, json!({})))
            .await
            .unwrap();
        let stale = Duration::minutes(5);
        assert!(store
            .claim("w", &[JobType::EnrichBatch], stale)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim("w", &[JobType::GenerateDocument], stale)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn purge_only_removes_old_terminal_jobs() {
        let store = MemoryStore::new();
        store
            .enqueue(NewJob::new(JobType::RefreshReadModel, json!({})))
            .await
            .unwrap();
        store
            .enqueue(NewJob::new(JobType::RefreshReadModel, json!({})))
            .await
            .unwrap();
        let done = store
            .claim("w", &[], Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        store.complete(done.id, "w").await.unwrap();

        store.advance_clock(Duration::days(30)).await;
        let cutoff = Utc::now() + Duration::days(15);
        assert_eq!(store.purge(cutoff).await.unwrap(), 1);
        assert!(store.get_job(done.id).await.unwrap().is_none());
    }
}
