//! Long-running loops: one drives claimed batches through the ingest stages,
//! the other drains the background job queue through registered handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use intake_core::{Batch, ErrorCode, JobType, Judgment, QueueJob};
use intake_storage::{BackoffPolicy, HookClient, IntakeStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ingest::{IngestPipeline, PipelineError};

/// Sleep for `interval` unless shutdown is signalled first; true on shutdown.
async fn idle(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let closed = tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    closed || *shutdown.borrow()
}

pub struct BatchWorker {
    pipeline: Arc<IngestPipeline>,
    worker_id: String,
    stale_after: chrono::Duration,
}

impl BatchWorker {
    pub fn new(
        pipeline: Arc<IngestPipeline>,
        worker_id: impl Into<String>,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            pipeline,
            worker_id: worker_id.into(),
            stale_after,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim one batch and drive it to a terminal status. `None` when nothing
    /// is claimable. On error the claim is released so another pass can retry.
    pub async fn run_once(&self) -> Result<Option<Batch>, PipelineError> {
        let store = self.pipeline.store();
        let Some(batch) = store.claim_batch(&self.worker_id, self.stale_after).await? else {
            return Ok(None);
        };
        let id = batch.id;
        match self.pipeline.drive(batch, &self.worker_id).await {
            Ok(done) => Ok(Some(done)),
            Err(err) => {
                warn!(batch_id = %id, worker = %self.worker_id, error = %err, "batch pass aborted; releasing claim");
                match store.release_batch(id, &self.worker_id).await {
                    Ok(()) | Err(StoreError::LeaseMismatch { .. }) => {}
                    Err(release_err) => {
                        warn!(batch_id = %id, error = %release_err, "could not release batch claim")
                    }
                }
                Err(err)
            }
        }
    }

    /// Process batches until none is claimable; returns how many finished.
    pub async fn drain(&self) -> Result<usize, PipelineError> {
        let mut finished = 0;
        while self.run_once().await?.is_some() {
            finished += 1;
        }
        Ok(finished)
    }

    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, "batch worker started");
        loop {
            let outcome = self.run_once().await;
            let busy = matches!(outcome, Ok(Some(_)));
            if let Err(err) = outcome {
                error!(worker = %self.worker_id, error = %err, "batch worker pass failed");
            }
            if *shutdown.borrow() {
                break;
            }
            if !busy && idle(poll_interval, &mut shutdown).await {
                break;
            }
        }
        info!(worker = %self.worker_id, "batch worker stopped");
    }
}

/// Executes one job type. Handlers must tolerate running more than once for
/// the same payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;
    async fn handle(&self, job: &QueueJob) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub job: QueueJob,
    pub succeeded: bool,
}

pub struct JobWorker {
    store: Arc<dyn IntakeStore>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    worker_id: String,
    stale_after: chrono::Duration,
    backoff: BackoffPolicy,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn IntakeStore>,
        worker_id: impl Into<String>,
        stale_after: chrono::Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            worker_id: worker_id.into(),
            stale_after,
            backoff,
        }
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    pub fn handled_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Claim and execute one job of a registered type.
    pub async fn run_once(&self) -> Result<Option<JobRun>, StoreError> {
        let types = self.handled_types();
        if types.is_empty() {
            return Ok(None);
        }
        let Some(job) = self
            .store
            .claim(&self.worker_id, &types, self.stale_after)
            .await?
        else {
            return Ok(None);
        };
        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            return Ok(None);
        };

        let span = info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts
        );
        self.execute(handler.as_ref(), job)
            .instrument(span)
            .await
            .map(Some)
    }

    async fn execute(&self, handler: &dyn JobHandler, job: QueueJob) -> Result<JobRun, StoreError> {
        match handler.handle(&job).await {
            Ok(()) => {
                let job = self.store.complete(job.id, &self.worker_id).await?;
                info!("job completed");
                Ok(JobRun {
                    job,
                    succeeded: true,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                let retry_delay = self.backoff.for_job_attempt(job.attempts);
                let job = self
                    .store
                    .fail(job.id, &self.worker_id, &message, retry_delay)
                    .await?;
                warn!(
                    code = %ErrorCode::QueueJobFailure,
                    error = %message,
                    status = %job.status,
                    "job failed"
                );
                Ok(JobRun {
                    job,
                    succeeded: false,
                })
            }
        }
    }

    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut ran = 0;
        while self.run_once().await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, types = ?self.handled_types(), "job worker started");
        loop {
            let outcome = self.run_once().await;
            let busy = matches!(outcome, Ok(Some(_)));
            if let Err(err) = outcome {
                error!(worker = %self.worker_id, error = %err, "job worker pass failed");
            }
            if *shutdown.borrow() {
                break;
            }
            if !busy && idle(poll_interval, &mut shutdown).await {
                break;
            }
        }
        info!(worker = %self.worker_id, "job worker stopped");
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BatchJobPayload {
    batch_id: Uuid,
}

fn batch_payload(job: &QueueJob) -> anyhow::Result<BatchJobPayload> {
    serde_json::from_value(job.payload.clone())
        .with_context(|| format!("job {} payload has no usable batch_id", job.id))
}

/// Opaque collectability model; returns a score in `0.0..=1.0`.
#[async_trait]
pub trait CollectabilityScorer: Send + Sync {
    async fn score(&self, judgment: &Judgment) -> anyhow::Result<f64>;
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    judgment_id: Uuid,
    case_number: &'a str,
    judgment_amount_cents: Option<i64>,
    entry_date: Option<chrono::NaiveDate>,
    county: Option<&'a str>,
    state: Option<&'a str>,
    defendant_name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ScoreReply {
    score: f64,
}

pub struct HttpScorer {
    client: Arc<HookClient>,
    url: String,
}

impl HttpScorer {
    pub fn new(client: Arc<HookClient>, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CollectabilityScorer for HttpScorer {
    async fn score(&self, judgment: &Judgment) -> anyhow::Result<f64> {
        let request = ScoreRequest {
            judgment_id: judgment.id,
            case_number: &judgment.case_number,
            judgment_amount_cents: judgment.judgment_amount_cents,
            entry_date: judgment.entry_date,
            county: judgment.county.as_deref(),
            state: judgment.state.as_deref(),
            defendant_name: judgment.defendant_name.as_deref(),
        };
        let reply = self
            .client
            .post_json(&self.url, &serde_json::to_value(&request)?)
            .await
            .with_context(|| format!("scoring {}", judgment.case_number))?;
        let reply: ScoreReply = serde_json::from_value(reply)
            .with_context(|| format!("scorer reply for {} has no score", judgment.case_number))?;
        Ok(reply.score)
    }
}

/// Scores every judgment the batch touched that has not been scored since
/// its last change.
pub struct EnrichBatchHandler {
    store: Arc<dyn IntakeStore>,
    scorer: Arc<dyn CollectabilityScorer>,
}

impl EnrichBatchHandler {
    pub fn new(store: Arc<dyn IntakeStore>, scorer: Arc<dyn CollectabilityScorer>) -> Self {
        Self { store, scorer }
    }
}

#[async_trait]
impl JobHandler for EnrichBatchHandler {
    fn job_type(&self) -> JobType {
        JobType::EnrichBatch
    }

    async fn handle(&self, job: &QueueJob) -> anyhow::Result<()> {
        let payload = batch_payload(job)?;
        let judgments = self.store.judgments_for_batch(payload.batch_id).await?;
        let mut failures = 0usize;
        let mut scored = 0usize;
        for judgment in &judgments {
            if judgment
                .scored_at
                .is_some_and(|at| at >= judgment.updated_at)
            {
                continue;
            }
            match self.scorer.score(judgment).await {
                Ok(score) if score.is_finite() => {
                    self.store
                        .set_collectability_score(judgment.id, score.clamp(0.0, 1.0), Utc::now())
                        .await?;
                    scored += 1;
                }
                Ok(score) => {
                    warn!(case_number = %judgment.case_number, score, "scorer returned a non-finite score");
                    failures += 1;
                }
                Err(err) => {
                    warn!(case_number = %judgment.case_number, error = ?err, "scoring failed");
                    failures += 1;
                }
            }
        }
        debug!(batch_id = %payload.batch_id, scored, failures, "enrichment pass finished");
        if failures > 0 {
            bail!("{failures} of {} judgments could not be scored", judgments.len());
        }
        Ok(())
    }
}

/// Where "canonical data changed" notices go.
#[async_trait]
pub trait ReadModelNotifier: Send + Sync {
    async fn notify(&self, notice: &serde_json::Value) -> anyhow::Result<()>;
}

pub struct HttpNotifier {
    client: Arc<HookClient>,
    url: String,
}

impl HttpNotifier {
    pub fn new(client: Arc<HookClient>, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReadModelNotifier for HttpNotifier {
    async fn notify(&self, notice: &serde_json::Value) -> anyhow::Result<()> {
        self.client
            .post_json(&self.url, notice)
            .await
            .context("posting read-model refresh")?;
        Ok(())
    }
}

pub struct RefreshReadModelHandler {
    notifier: Arc<dyn ReadModelNotifier>,
}

impl RefreshReadModelHandler {
    pub fn new(notifier: Arc<dyn ReadModelNotifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl JobHandler for RefreshReadModelHandler {
    fn job_type(&self) -> JobType {
        JobType::RefreshReadModel
    }

    async fn handle(&self, job: &QueueJob) -> anyhow::Result<()> {
        let payload = batch_payload(job)?;
        let notice = serde_json::json!({
            "event": "canonical_data_changed",
            "batch_id": payload.batch_id,
            "job_id": job.id,
        });
        self.notifier.notify(&notice).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;
    use intake_core::{BatchStatus, JobStatus, NewJob};
    use intake_storage::{CanonicalStore, JobQueue, MemoryStore};
    use tokio::sync::Mutex;

    use super::*;
    use crate::ingest::tests::{clean_csv, harness};
    use crate::ingest::Submission;

    struct FixedScorer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CollectabilityScorer for FixedScorer {
        async fn score(&self, judgment: &Judgment) -> anyhow::Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if judgment.case_number == "CV-0001" {
                return Ok(1.7);
            }
            Ok(0.25)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<serde_json::Value>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl ReadModelNotifier for RecordingNotifier {
        async fn notify(&self, notice: &serde_json::Value) -> anyhow::Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                bail!("cache endpoint unavailable");
            }
            self.notices.lock().await.push(notice.clone());
            Ok(())
        }
    }

    fn quick_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: std::time::Duration::from_secs(30),
            max_delay: std::time::Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn batch_worker_drains_queue_and_jobs_follow() {
        let h = harness();
        h.pipeline
            .submit(Submission::new("bulk", clean_csv(4)))
            .await
            .unwrap();
        let worker = BatchWorker::new(h.pipeline.clone(), "batch-1", ChronoDuration::minutes(5));
        assert_eq!(worker.drain().await.unwrap(), 1);
        assert!(worker.run_once().await.unwrap().is_none());

        let scorer = Arc::new(FixedScorer {
            calls: AtomicUsize::new(0),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let jobs = JobWorker::new(
            h.store.clone(),
            "jobs-1",
            ChronoDuration::minutes(5),
            quick_backoff(),
        )
        .register(Arc::new(EnrichBatchHandler::new(h.store.clone(), scorer.clone())))
        .register(Arc::new(RefreshReadModelHandler::new(notifier.clone())));
        assert_eq!(jobs.drain().await.unwrap(), 2);

        assert_eq!(scorer.calls.load(Ordering::SeqCst), 4);
        let clamped = h.store.get_judgment("CV-0001").await.unwrap().unwrap();
        assert_eq!(clamped.collectability_score, Some(1.0));
        let regular = h.store.get_judgment("CV-0002").await.unwrap().unwrap();
        assert_eq!(regular.collectability_score, Some(0.25));
        assert!(regular.scored_at.is_some());

        let notices = notifier.notices.lock().await;
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0]["event"], "canonical_data_changed");
    }

    #[tokio::test]
    async fn rerunning_enrichment_skips_already_scored_judgments() {
        let h = harness();
        h.pipeline
            .submit(Submission::new("bulk", clean_csv(3)))
            .await
            .unwrap();
        let batch = BatchWorker::new(h.pipeline.clone(), "b", ChronoDuration::minutes(5))
            .run_once()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);

        let scorer = Arc::new(FixedScorer {
            calls: AtomicUsize::new(0),
        });
        let handler = EnrichBatchHandler::new(h.store.clone(), scorer.clone());
        let job = h
            .store
            .enqueue(NewJob::new(
                JobType::EnrichBatch,
                serde_json::json!({ "batch_id": batch.id }),
            ))
            .await
            .unwrap();
        handler.handle(&job).await.unwrap();
        handler.handle(&job).await.unwrap();
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_handler_is_retried_later_then_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier {
            fail_first: AtomicUsize::new(1),
            ..RecordingNotifier::default()
        });
        let worker = JobWorker::new(
            store.clone(),
            "jobs-1",
            ChronoDuration::minutes(5),
            quick_backoff(),
        )
        .register(Arc::new(RefreshReadModelHandler::new(notifier.clone())));
        let job = store
            .enqueue(NewJob::new(
                JobType::RefreshReadModel,
                serde_json::json!({ "batch_id": Uuid::new_v4() }),
            ))
            .await
            .unwrap();

        let first = worker.run_once().await.unwrap().unwrap();
        assert!(!first.succeeded);
        assert_eq!(first.job.status, JobStatus::Pending);
        assert!(first.job.last_error.unwrap().contains("cache endpoint unavailable"));
        // backoff keeps it out of reach until run_after passes
        assert!(worker.run_once().await.unwrap().is_none());

        store.advance_clock(ChronoDuration::seconds(31)).await;
        let second = worker.run_once().await.unwrap().unwrap();
        assert!(second.succeeded);
        assert_eq!(second.job.id, job.id);
        assert_eq!(second.job.status, JobStatus::Completed);
        assert_eq!(second.job.attempts, 2);
    }

    #[tokio::test]
    async fn bad_payload_dead_letters_after_max_attempts() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let worker = JobWorker::new(
            store.clone(),
            "jobs-1",
            ChronoDuration::minutes(5),
            quick_backoff(),
        )
        .register(Arc::new(RefreshReadModelHandler::new(notifier)));
        store
            .enqueue(
                NewJob::new(JobType::RefreshReadModel, serde_json::json!({ "nope": true }))
                    .with_max_attempts(2),
            )
            .await
            .unwrap();

        let first = worker.run_once().await.unwrap().unwrap();
        assert_eq!(first.job.status, JobStatus::Pending);
        store.advance_clock(ChronoDuration::minutes(5)).await;
        let last = worker.run_once().await.unwrap().unwrap();
        assert_eq!(last.job.status, JobStatus::Failed);
        assert!(last.job.last_error.unwrap().contains("batch_id"));
    }

    #[tokio::test]
    async fn unregistered_job_types_are_left_for_other_workers() {
        let store = Arc::new(MemoryStore::new());
        store
            .enqueue(NewJob::new(
                JobType::GenerateDocument,
                serde_json::json!({ "template": "demand_letter" }),
            ))
            .await
            .unwrap();
        let worker = JobWorker::new(
            store.clone(),
            "jobs-1",
            ChronoDuration::minutes(5),
            quick_backoff(),
        )
        .register(Arc::new(RefreshReadModelHandler::new(Arc::new(
            RecordingNotifier::default(),
        ))));
        assert!(worker.run_once().await.unwrap().is_none());

        let bare = JobWorker::new(store, "idle", ChronoDuration::minutes(5), quick_backoff());
        assert!(bare.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_loop_exits_on_shutdown() {
        let h = harness();
        let worker = BatchWorker::new(h.pipeline.clone(), "loop", ChronoDuration::minutes(5));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            worker.run(std::time::Duration::from_millis(20), rx).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("worker stops promptly")
            .unwrap();
    }
}
