use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use intake_storage::{IntakeStore, JobQueue, StoreError};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::PipelineConfig;

/// Delete terminal jobs whose last update is older than `retention`.
pub async fn purge_expired_jobs<Q: JobQueue + ?Sized>(
    queue: &Q,
    retention: chrono::Duration,
) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - retention;
    let purged = queue.purge(cutoff).await?;
    info!(purged, %cutoff, "purged terminal queue jobs");
    Ok(purged)
}

/// Cron-driven queue housekeeping; `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &PipelineConfig,
    store: Arc<dyn IntakeStore>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let retention = config.job_retention();
    let cron = config.job_purge_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let store = store.clone();
        Box::pin(async move {
            if let Err(err) = purge_expired_jobs(store.as_ref(), retention).await {
                error!(error = %err, "scheduled job purge failed");
            }
        })
    })
    .with_context(|| format!("creating purge job for cron {cron}"))?;
    sched.add(job).await.context("adding purge job")?;
    info!(cron, retention_days = retention.num_days(), "job purge scheduled");
    Ok(Some(sched))
}
