//! PostgreSQL backend. Claims use `FOR UPDATE SKIP LOCKED`, admission
//! serializes per source with a transaction-scoped advisory lock.

use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use intake_core::{
    normalize_case_number, normalize_name, Batch, BatchTransition, FailedRow, JobType, Judgment,
    JudgmentDraft, NewBatch, NewFailedRow, NewJob, Plaintiff, QueueJob, RawRecord, RawRow,
    Resolution, ResolutionError, RowCounts, RowIssue, UnknownVariant, UpsertOutcome, ValidatedRow,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Admission, BatchStore, CanonicalStore, JobQueue, StoreError, UpsertResult};

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const BATCH_COLUMNS: &str = "id, source, content_digest, vendor_reference, filename, format, \
    payload_path, columns, status, row_count_total, row_count_valid, row_count_invalid, \
    row_count_duplicate, row_count_warning, row_count_inserted, row_count_updated, \
    row_count_upsert_failed, error_threshold_percent, rejection_reason, error_summary, \
    claimed_by, claimed_at, claim_count, capture_duration_ms, db_duration_ms, created_at, \
    staging_at, transforming_at, upserting_at, completed_at, failed_at, updated_at";

const FAILED_ROW_COLUMNS: &str = "id, batch_id, row_index, stage, error_code, error_message, \
    raw_data, created_at, resolved_at, resolved_by, resolution_notes";

const JUDGMENT_COLUMNS: &str = "id, case_number, plaintiff_id, defendant_name, \
    judgment_amount_cents, entry_date, court, county, state, defendant_address, \
    source_batch_id, collectability_score, scored_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, locked_at, \
    locked_by, run_after, last_error, created_at, updated_at, completed_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!(migrations = MIGRATOR.iter().count(), "database migrations applied");
        Ok(())
    }
}

fn seconds(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

fn decode_err(column: &'static str) -> impl Fn(UnknownVariant) -> StoreError {
    move |err| StoreError::Decode {
        column,
        message: err.to_string(),
    }
}

fn text_enum<T: FromStr<Err = UnknownVariant>>(
    row: &PgRow,
    column: &'static str,
) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(decode_err(column))
}

fn opt_text_enum<T: FromStr<Err = UnknownVariant>>(
    row: &PgRow,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|v| v.parse().map_err(decode_err(column)))
        .transpose()
}

fn count(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

fn opt_millis(row: &PgRow, column: &str) -> Result<Option<u64>, StoreError> {
    let value: Option<i64> = row.try_get(column)?;
    Ok(value.map(|v| v.max(0) as u64))
}

fn batch_from_row(row: &PgRow) -> Result<Batch, StoreError> {
    let columns: Json<Vec<String>> = row.try_get("columns")?;
    let claim_count: i32 = row.try_get("claim_count")?;
    Ok(Batch {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        content_digest: row.try_get("content_digest")?,
        vendor_reference: row.try_get("vendor_reference")?,
        filename: row.try_get("filename")?,
        format: text_enum(row, "format")?,
        payload_path: row.try_get("payload_path")?,
        columns: columns.0,
        status: text_enum(row, "status")?,
        counts: RowCounts {
            total: count(row, "row_count_total")?,
            valid: count(row, "row_count_valid")?,
            invalid: count(row, "row_count_invalid")?,
            duplicate: count(row, "row_count_duplicate")?,
            warning: count(row, "row_count_warning")?,
            inserted: count(row, "row_count_inserted")?,
            updated: count(row, "row_count_updated")?,
            upsert_failed: count(row, "row_count_upsert_failed")?,
        },
        error_threshold_percent: row.try_get("error_threshold_percent")?,
        rejection_reason: opt_text_enum(row, "rejection_reason")?,
        error_summary: row.try_get("error_summary")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        claim_count: claim_count.max(0) as u32,
        capture_duration_ms: opt_millis(row, "capture_duration_ms")?,
        db_duration_ms: opt_millis(row, "db_duration_ms")?,
        created_at: row.try_get("created_at")?,
        staging_at: row.try_get("staging_at")?,
        transforming_at: row.try_get("transforming_at")?,
        upserting_at: row.try_get("upserting_at")?,
        completed_at: row.try_get("completed_at")?,
        failed_at: row.try_get("failed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn raw_row_from_row(row: &PgRow) -> Result<RawRow, StoreError> {
    let data: Json<RawRecord> = row.try_get("data")?;
    Ok(RawRow {
        batch_id: row.try_get("batch_id")?,
        row_index: count(row, "row_index")?,
        data: data.0,
        parse_error: row.try_get("parse_error")?,
        captured_at: row.try_get("captured_at")?,
    })
}

fn validated_row_from_row(row: &PgRow) -> Result<ValidatedRow, StoreError> {
    let values: Json<JudgmentDraft> = row.try_get("canonical")?;
    let errors: Json<Vec<RowIssue>> = row.try_get("errors")?;
    let warnings: Json<Vec<RowIssue>> = row.try_get("warnings")?;
    Ok(ValidatedRow {
        batch_id: row.try_get("batch_id")?,
        row_index: count(row, "row_index")?,
        natural_key: row.try_get("natural_key")?,
        status: text_enum(row, "status")?,
        values: values.0,
        errors: errors.0,
        warnings: warnings.0,
        upsert_outcome: opt_text_enum(row, "upsert_outcome")?,
        validated_at: row.try_get("validated_at")?,
    })
}

fn failed_row_from_row(row: &PgRow) -> Result<FailedRow, StoreError> {
    let raw_data: Json<RawRecord> = row.try_get("raw_data")?;
    let resolved_at: Option<DateTime<Utc>> = row.try_get("resolved_at")?;
    let resolved_by: Option<String> = row.try_get("resolved_by")?;
    let resolution = match (resolved_at, resolved_by) {
        (Some(resolved_at), Some(resolved_by)) => Some(Resolution {
            resolved_at,
            resolved_by,
            notes: row.try_get("resolution_notes")?,
        }),
        _ => None,
    };
    Ok(FailedRow {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        row_index: count(row, "row_index")?,
        stage: text_enum(row, "stage")?,
        error_code: text_enum(row, "error_code")?,
        error_message: row.try_get("error_message")?,
        raw_data: raw_data.0,
        created_at: row.try_get("created_at")?,
        resolution,
    })
}

fn plaintiff_from_row(row: &PgRow) -> Result<Plaintiff, StoreError> {
    Ok(Plaintiff {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        name_normalized: row.try_get("name_normalized")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn judgment_from_row(row: &PgRow) -> Result<Judgment, StoreError> {
    Ok(Judgment {
        id: row.try_get("id")?,
        case_number: row.try_get("case_number")?,
        plaintiff_id: row.try_get("plaintiff_id")?,
        defendant_name: row.try_get("defendant_name")?,
        judgment_amount_cents: row.try_get("judgment_amount_cents")?,
        entry_date: row.try_get("entry_date")?,
        court: row.try_get("court")?,
        county: row.try_get("county")?,
        state: row.try_get("state")?,
        defendant_address: row.try_get("defendant_address")?,
        source_batch_id: row.try_get("source_batch_id")?,
        collectability_score: row.try_get("collectability_score")?,
        scored_at: row.try_get("scored_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<QueueJob, StoreError> {
    let attempts: i32 = row.try_get("attempts")?;
    let max_attempts: i32 = row.try_get("max_attempts")?;
    Ok(QueueJob {
        id: row.try_get("id")?,
        job_type: text_enum(row, "job_type")?,
        payload: row.try_get("payload")?,
        status: text_enum(row, "status")?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        run_after: row.try_get("run_after")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl BatchStore for PgStore {
    async fn admit_batch(&self, new: NewBatch) -> Result<Admission, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&new.source)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM ingest_batches \
             WHERE source = $1 \
               AND rejection_reason IS DISTINCT FROM 'stalled' \
               AND (content_digest = $2 OR ($3::text IS NOT NULL AND vendor_reference = $3)) \
             ORDER BY created_at \
             LIMIT 1"
        );
        let existing = sqlx::query(&sql)
            .bind(&new.source)
            .bind(&new.content_digest)
            .bind(&new.vendor_reference)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = existing {
            tx.commit().await?;
            return Ok(Admission {
                batch: batch_from_row(&row)?,
                deduplicated: true,
            });
        }

        let batch = Batch::from_new(new, Utc::now());
        let sql = format!(
            "INSERT INTO ingest_batches \
               (id, source, content_digest, vendor_reference, filename, format, payload_path, \
                error_threshold_percent, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', now(), now()) \
             RETURNING {BATCH_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(batch.id)
            .bind(&batch.source)
            .bind(&batch.content_digest)
            .bind(&batch.vendor_reference)
            .bind(&batch.filename)
            .bind(batch.format.as_str())
            .bind(&batch.payload_path)
            .bind(batch.error_threshold_percent)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(batch_id = %batch.id, source = %batch.source, "batch admitted");
        Ok(Admission {
            batch: batch_from_row(&row)?,
            deduplicated: false,
        })
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, StoreError> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM ingest_batches WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn claim_batch(
        &self,
        worker: &str,
        stale_after: Duration,
    ) -> Result<Option<Batch>, StoreError> {
        let sql = format!(
            "UPDATE ingest_batches \
             SET claimed_by = $1, claimed_at = now(), claim_count = claim_count + 1, \
                 updated_at = now() \
             WHERE id = ( \
               SELECT id FROM ingest_batches \
               WHERE status NOT IN ('completed', 'failed') \
                 AND (claimed_at IS NULL OR claimed_at < now() - make_interval(secs => $2)) \
               ORDER BY created_at, id \
               LIMIT 1 \
               FOR UPDATE SKIP LOCKED) \
             RETURNING {BATCH_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(worker)
            .bind(seconds(stale_after))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn transition_batch(
        &self,
        id: Uuid,
        worker: &str,
        transition: &BatchTransition,
    ) -> Result<Batch, StoreError> {
        transition.validate()?;
        let patch = &transition.patch;
        let counts = patch.counts;
        let pick = |f: fn(&RowCounts) -> u64| counts.as_ref().map(|c| f(c) as i64);
        let sql = format!(
            "UPDATE ingest_batches SET \
               status = $3, \
               staging_at = CASE WHEN $3 = 'staging' THEN now() ELSE staging_at END, \
               transforming_at = CASE WHEN $3 = 'transforming' THEN now() ELSE transforming_at END, \
               upserting_at = CASE WHEN $3 = 'upserting' THEN now() ELSE upserting_at END, \
               completed_at = CASE WHEN $3 = 'completed' THEN now() ELSE completed_at END, \
               failed_at = CASE WHEN $3 = 'failed' THEN now() ELSE failed_at END, \
               row_count_total = COALESCE($5, row_count_total), \
               row_count_valid = COALESCE($6, row_count_valid), \
               row_count_invalid = COALESCE($7, row_count_invalid), \
               row_count_duplicate = COALESCE($8, row_count_duplicate), \
               row_count_warning = COALESCE($9, row_count_warning), \
               row_count_inserted = COALESCE($10, row_count_inserted), \
               row_count_updated = COALESCE($11, row_count_updated), \
               row_count_upsert_failed = COALESCE($12, row_count_upsert_failed), \
               columns = COALESCE($13, columns), \
               rejection_reason = COALESCE($14, rejection_reason), \
               error_summary = COALESCE($15, error_summary), \
               capture_duration_ms = COALESCE($16, capture_duration_ms), \
               db_duration_ms = COALESCE($17, db_duration_ms), \
               claimed_by = CASE WHEN $3 IN ('completed', 'failed') THEN NULL ELSE claimed_by END, \
               claimed_at = CASE WHEN $3 IN ('completed', 'failed') THEN NULL ELSE now() END, \
               updated_at = now() \
             WHERE id = $1 AND status = $2 AND claimed_by = $4 \
             RETURNING {BATCH_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(transition.from.as_str())
            .bind(transition.to.as_str())
            .bind(worker)
            .bind(pick(|c| c.total))
            .bind(pick(|c| c.valid))
            .bind(pick(|c| c.invalid))
            .bind(pick(|c| c.duplicate))
            .bind(pick(|c| c.warning))
            .bind(pick(|c| c.inserted))
            .bind(pick(|c| c.updated))
            .bind(pick(|c| c.upsert_failed))
            .bind(patch.columns.as_ref().map(Json))
            .bind(patch.rejection_reason.map(|r| r.as_str()))
            .bind(&patch.error_summary)
            .bind(patch.capture_duration_ms.map(|v| v as i64))
            .bind(patch.db_duration_ms.map(|v| v as i64))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => batch_from_row(&row),
            None => match self.get_batch(id).await? {
                None => Err(StoreError::not_found("batch", id)),
                Some(_) => Err(StoreError::lease("batch", id, worker)),
            },
        }
    }

    async fn touch_batch(&self, id: Uuid, worker: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ingest_batches SET claimed_at = now() WHERE id = $1 AND claimed_by = $2",
        )
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return match self.get_batch(id).await? {
                None => Err(StoreError::not_found("batch", id)),
                Some(_) => Err(StoreError::lease("batch", id, worker)),
            };
        }
        Ok(())
    }

    async fn release_batch(&self, id: Uuid, worker: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ingest_batches SET claimed_by = NULL, claimed_at = NULL, updated_at = now() \
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_batch(id).await? {
            None => Err(StoreError::not_found("batch", id)),
            Some(batch) if batch.claimed_by.is_none() => Ok(()),
            Some(_) => Err(StoreError::lease("batch", id, worker)),
        }
    }

    async fn insert_raw_rows(&self, rows: &[RawRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO ingest_raw_rows (batch_id, row_index, data, parse_error, captured_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (batch_id, row_index) DO NOTHING",
            )
            .bind(row.batch_id)
            .bind(row.row_index as i64)
            .bind(Json(&row.data))
            .bind(&row.parse_error)
            .bind(row.captured_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_raw_rows(&self, batch_id: Uuid) -> Result<Vec<RawRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT batch_id, row_index, data, parse_error, captured_at \
             FROM ingest_raw_rows WHERE batch_id = $1 ORDER BY row_index",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(raw_row_from_row).collect()
    }

    async fn insert_validated_rows(&self, rows: &[ValidatedRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO ingest_validated_rows \
                   (batch_id, row_index, natural_key, status, canonical, errors, warnings, \
                    upsert_outcome, validated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (batch_id, row_index) DO NOTHING",
            )
            .bind(row.batch_id)
            .bind(row.row_index as i64)
            .bind(&row.natural_key)
            .bind(row.status.as_str())
            .bind(Json(&row.values))
            .bind(Json(&row.errors))
            .bind(Json(&row.warnings))
            .bind(row.upsert_outcome.map(|o| o.as_str()))
            .bind(row.validated_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_validated_rows(&self, batch_id: Uuid) -> Result<Vec<ValidatedRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT batch_id, row_index, natural_key, status, canonical, errors, warnings, \
                    upsert_outcome, validated_at \
             FROM ingest_validated_rows WHERE batch_id = $1 ORDER BY row_index",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(validated_row_from_row).collect()
    }

    async fn record_upsert_outcome(
        &self,
        batch_id: Uuid,
        row_index: u64,
        outcome: UpsertOutcome,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE ingest_validated_rows SET upsert_outcome = $3 \
             WHERE batch_id = $1 AND row_index = $2",
        )
        .bind(batch_id)
        .bind(row_index as i64)
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(
                "validated row",
                format!("{batch_id}/{row_index}"),
            ));
        }
        Ok(())
    }

    async fn insert_failed_row(&self, row: NewFailedRow) -> Result<Option<FailedRow>, StoreError> {
        let sql = format!(
            "INSERT INTO ingest_failed_rows \
               (id, batch_id, row_index, stage, error_code, error_message, raw_data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (batch_id, row_index, stage) DO NOTHING \
             RETURNING {FAILED_ROW_COLUMNS}"
        );
        let inserted = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(row.batch_id)
            .bind(row.row_index as i64)
            .bind(row.stage.as_str())
            .bind(row.error_code.as_str())
            .bind(&row.error_message)
            .bind(Json(&row.raw_data))
            .fetch_optional(&self.pool)
            .await?;
        inserted.as_ref().map(failed_row_from_row).transpose()
    }

    async fn list_failed_rows(
        &self,
        batch_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<FailedRow>, StoreError> {
        let sql = format!(
            "SELECT {FAILED_ROW_COLUMNS} FROM ingest_failed_rows \
             WHERE batch_id = $1 ORDER BY row_index, created_at LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id)
            .bind(limit.map(|l| l as i64))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(failed_row_from_row).collect()
    }

    async fn get_failed_row(&self, id: Uuid) -> Result<Option<FailedRow>, StoreError> {
        let sql = format!("SELECT {FAILED_ROW_COLUMNS} FROM ingest_failed_rows WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(failed_row_from_row).transpose()
    }

    async fn resolve_failed_row(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<FailedRow, StoreError> {
        let resolved_by = resolved_by.trim();
        if resolved_by.is_empty() {
            return Err(ResolutionError::MissingResolver.into());
        }
        let sql = format!(
            "UPDATE ingest_failed_rows \
             SET resolved_at = now(), resolved_by = $2, resolution_notes = $3 \
             WHERE id = $1 AND resolved_at IS NULL \
             RETURNING {FAILED_ROW_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(resolved_by)
            .bind(&notes)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => failed_row_from_row(&row),
            None => match self.get_failed_row(id).await? {
                None => Err(StoreError::not_found("failed row", id)),
                Some(_) => Err(ResolutionError::AlreadyResolved(id).into()),
            },
        }
    }

    async fn row_tally(&self, batch_id: Uuid) -> Result<RowCounts, StoreError> {
        let row = sqlx::query(
            "SELECT \
               (SELECT COUNT(*) FROM ingest_raw_rows WHERE batch_id = $1) AS total, \
               COUNT(*) FILTER (WHERE status IN ('valid', 'warning')) AS valid, \
               COUNT(*) FILTER (WHERE status = 'invalid') AS invalid, \
               COUNT(*) FILTER (WHERE status = 'duplicate') AS duplicate, \
               COUNT(*) FILTER (WHERE status = 'warning') AS warning, \
               COUNT(*) FILTER (WHERE upsert_outcome = 'inserted') AS inserted, \
               COUNT(*) FILTER (WHERE upsert_outcome = 'updated') AS updated, \
               COUNT(*) FILTER (WHERE upsert_outcome = 'failed') AS upsert_failed \
             FROM ingest_validated_rows WHERE batch_id = $1",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(RowCounts {
            total: count(&row, "total")?,
            valid: count(&row, "valid")?,
            invalid: count(&row, "invalid")?,
            duplicate: count(&row, "duplicate")?,
            warning: count(&row, "warning")?,
            inserted: count(&row, "inserted")?,
            updated: count(&row, "updated")?,
            upsert_failed: count(&row, "upsert_failed")?,
        })
    }
}

#[async_trait]
impl CanonicalStore for PgStore {
    async fn existing_case_numbers(
        &self,
        case_numbers: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let keys: Vec<String> = case_numbers
            .iter()
            .map(|c| normalize_case_number(c))
            .collect();
        let rows = sqlx::query("SELECT case_number FROM judgments WHERE case_number = ANY($1)")
            .bind(&keys)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("case_number").map_err(StoreError::from))
            .collect()
    }

    async fn upsert_judgment(
        &self,
        batch_id: Uuid,
        draft: &JudgmentDraft,
    ) -> Result<UpsertResult, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = write_judgment(&mut tx, batch_id, draft).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn upsert_validated_row(
        &self,
        batch_id: Uuid,
        worker: &str,
        row_index: u64,
        draft: &JudgmentDraft,
    ) -> Result<UpsertResult, StoreError> {
        let mut tx = self.pool.begin().await?;
        let owned = sqlx::query(
            "SELECT id FROM ingest_batches WHERE id = $1 AND claimed_by = $2 FOR SHARE",
        )
        .bind(batch_id)
        .bind(worker)
        .fetch_optional(&mut *tx)
        .await?;
        if owned.is_none() {
            drop(tx);
            return match self.get_batch(batch_id).await? {
                None => Err(StoreError::not_found("batch", batch_id)),
                Some(_) => Err(StoreError::lease("batch", batch_id, worker)),
            };
        }

        let result = write_judgment(&mut tx, batch_id, draft).await?;
        let stamped = sqlx::query(
            "UPDATE ingest_validated_rows SET upsert_outcome = $3 \
             WHERE batch_id = $1 AND row_index = $2",
        )
        .bind(batch_id)
        .bind(row_index as i64)
        .bind(result.outcome.as_str())
        .execute(&mut *tx)
        .await?;
        if stamped.rows_affected() == 0 {
            return Err(StoreError::not_found(
                "validated row",
                format!("{batch_id}/{row_index}"),
            ));
        }
        tx.commit().await?;
        Ok(result)
    }

    async fn find_plaintiff(&self, name: &str) -> Result<Option<Plaintiff>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, name_normalized, created_at, updated_at \
             FROM plaintiffs WHERE name_normalized = $1",
        )
        .bind(normalize_name(name))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(plaintiff_from_row).transpose()
    }

    async fn get_judgment(&self, case_number: &str) -> Result<Option<Judgment>, StoreError> {
        let sql = format!("SELECT {JUDGMENT_COLUMNS} FROM judgments WHERE case_number = $1");
        let row = sqlx::query(&sql)
            .bind(normalize_case_number(case_number))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(judgment_from_row).transpose()
    }

    async fn judgments_for_batch(&self, batch_id: Uuid) -> Result<Vec<Judgment>, StoreError> {
        let sql = format!(
            "SELECT {JUDGMENT_COLUMNS} FROM judgments \
             WHERE source_batch_id = $1 ORDER BY case_number"
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(judgment_from_row).collect()
    }

    async fn set_collectability_score(
        &self,
        judgment_id: Uuid,
        score: f64,
        scored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE judgments SET collectability_score = $2, scored_at = $3 WHERE id = $1",
        )
        .bind(judgment_id)
        .bind(score)
        .bind(scored_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("judgment", judgment_id));
        }
        Ok(())
    }
}

/// Resolve-or-create the plaintiff, then insert-or-update the judgment, on
/// the caller's connection.
async fn write_judgment(
    conn: &mut PgConnection,
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

    let plaintiff_id: Uuid = sqlx::query(
        "INSERT INTO plaintiffs (id, name, name_normalized) VALUES ($1, $2, $3) \
         ON CONFLICT (name_normalized) DO UPDATE SET updated_at = now() \
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(plaintiff_name)
    .bind(normalize_name(plaintiff_name))
    .fetch_one(&mut *conn)
    .await?
    .try_get("id")?;

    let row = sqlx::query(
        "INSERT INTO judgments \
           (id, case_number, plaintiff_id, defendant_name, judgment_amount_cents, entry_date, \
            court, county, state, defendant_address, source_batch_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (case_number) DO UPDATE SET \
           plaintiff_id = EXCLUDED.plaintiff_id, \
           defendant_name = COALESCE(EXCLUDED.defendant_name, judgments.defendant_name), \
           judgment_amount_cents = COALESCE(EXCLUDED.judgment_amount_cents, judgments.judgment_amount_cents), \
           entry_date = COALESCE(EXCLUDED.entry_date, judgments.entry_date), \
           court = COALESCE(EXCLUDED.court, judgments.court), \
           county = COALESCE(EXCLUDED.county, judgments.county), \
           state = COALESCE(EXCLUDED.state, judgments.state), \
           defendant_address = COALESCE(EXCLUDED.defendant_address, judgments.defendant_address), \
           source_batch_id = EXCLUDED.source_batch_id, \
           updated_at = now() \
         RETURNING id, (xmax = 0) AS inserted",
    )
    .bind(Uuid::new_v4())
    .bind(&case_number)
    .bind(plaintiff_id)
    .bind(&draft.defendant_name)
    .bind(draft.judgment_amount_cents)
    .bind(draft.entry_date)
    .bind(&draft.court)
    .bind(&draft.county)
    .bind(&draft.state)
    .bind(&draft.defendant_address)
    .bind(batch_id)
    .fetch_one(&mut *conn)
    .await?;

    let inserted: bool = row.try_get("inserted")?;
    Ok(UpsertResult {
        judgment_id: row.try_get("id")?,
        plaintiff_id,
        outcome: if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        },
    })
}

#[async_trait]
impl JobQueue for PgStore {
    async fn enqueue(&self, job: NewJob) -> Result<QueueJob, StoreError> {
        let sql = format!(
            "INSERT INTO queue_jobs (id, job_type, payload, status, max_attempts) \
             VALUES ($1, $2, $3, 'pending', $4) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(job.job_type.as_str())
            .bind(&job.payload)
            .bind(job.max_attempts.max(1) as i32)
            .fetch_one(&self.pool)
            .await?;
        job_from_row(&row)
    }

    async fn claim(
        &self,
        worker: &str,
        job_types: &[JobType],
        stale_after: Duration,
    ) -> Result<Option<QueueJob>, StoreError> {
        let stale_secs = seconds(stale_after);
        let types: Vec<String> = job_types.iter().map(|t| t.as_str().to_string()).collect();
        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query(
            "UPDATE queue_jobs \
             SET status = 'failed', last_error = 'lock expired after final attempt', \
                 locked_at = NULL, locked_by = NULL, updated_at = now() \
             WHERE status = 'processing' \
               AND locked_at < now() - make_interval(secs => $1) \
               AND attempts >= max_attempts",
        )
        .bind(stale_secs)
        .execute(&mut *tx)
        .await?;
        if expired.rows_affected() > 0 {
            debug!(count = expired.rows_affected(), "expired exhausted job locks");
        }

        let sql = format!(
            "UPDATE queue_jobs \
             SET status = 'processing', attempts = attempts + 1, locked_at = now(), \
                 locked_by = $1, updated_at = now() \
             WHERE id = ( \
               SELECT id FROM queue_jobs \
               WHERE ((status = 'pending' AND run_after <= now()) \
                   OR (status = 'processing' AND (locked_at IS NULL \
                       OR locked_at < now() - make_interval(secs => $2)))) \
                 AND (cardinality($3::text[]) = 0 OR job_type = ANY($3::text[])) \
               ORDER BY created_at, id \
               LIMIT 1 \
               FOR UPDATE SKIP LOCKED) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(worker)
            .bind(stale_secs)
            .bind(&types)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete(&self, id: Uuid, worker: &str) -> Result<QueueJob, StoreError> {
        let sql = format!(
            "UPDATE queue_jobs \
             SET status = 'completed', locked_at = NULL, locked_by = NULL, \
                 completed_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'processing' AND locked_by = $2 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(worker)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => self.lease_failure(id, worker).await,
        }
    }

    async fn fail(
        &self,
        id: Uuid,
        worker: &str,
        error: &str,
        retry_delay: Duration,
    ) -> Result<QueueJob, StoreError> {
        let sql = format!(
            "UPDATE queue_jobs SET \
               status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END, \
               run_after = CASE WHEN attempts < max_attempts \
                 THEN now() + make_interval(secs => $4) ELSE run_after END, \
               last_error = $3, locked_at = NULL, locked_by = NULL, updated_at = now() \
             WHERE id = $1 AND status = 'processing' AND locked_by = $2 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(worker)
            .bind(error)
            .bind(seconds(retry_delay))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => self.lease_failure(id, worker).await,
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs \
             WHERE status IN ('completed', 'failed') AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

impl PgStore {
    async fn lease_failure(&self, id: Uuid, worker: &str) -> Result<QueueJob, StoreError> {
        match self.get_job(id).await? {
            None => Err(StoreError::not_found("job", id)),
            Some(_) => Err(StoreError::lease("job", id, worker)),
        }
    }
}
