//! Offline triage export: a batch's dead-letter rows as Parquet, plus a
//! manifest carrying checksums.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use intake_core::FailedRow;
use intake_storage::{sha256_hex, BatchStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub batch_id: Uuid,
    pub source: String,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: u64,
}

#[derive(Debug, Clone)]
pub struct DeadLetterExport {
    pub directory: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: ExportManifest,
}

/// Write `<out_dir>/<batch_id>/failed_rows.parquet` and `manifest.json`.
pub async fn export_failed_rows<S: BatchStore + ?Sized>(
    store: &S,
    batch_id: Uuid,
    out_dir: &Path,
) -> Result<DeadLetterExport> {
    let batch = store
        .get_batch(batch_id)
        .await?
        .with_context(|| format!("batch {batch_id} not found"))?;
    let rows = store.list_failed_rows(batch_id, None).await?;

    let directory = out_dir.join(batch_id.to_string());
    fs::create_dir_all(&directory)
        .await
        .with_context(|| format!("creating {}", directory.display()))?;

    let parquet_path = directory.join("failed_rows.parquet");
    write_failed_rows_parquet(&parquet_path, &rows)?;

    let manifest = ExportManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        batch_id,
        source: batch.source,
        files: vec![manifest_entry("failed_rows", &directory, &parquet_path, rows.len())?],
    };
    let manifest_path = directory.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(%batch_id, rows = rows.len(), path = %directory.display(), "dead-letter rows exported");
    Ok(DeadLetterExport {
        directory,
        manifest_path,
        manifest,
    })
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_failed_rows_parquet(path: &Path, rows: &[FailedRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("batch_id", DataType::Utf8, false),
        ArrowField::new("row_index", DataType::UInt64, false),
        ArrowField::new("stage", DataType::Utf8, false),
        ArrowField::new("error_code", DataType::Utf8, false),
        ArrowField::new("error_message", DataType::Utf8, false),
        ArrowField::new("raw_data", DataType::Utf8, false),
        ArrowField::new("created_at", DataType::Utf8, false),
        ArrowField::new("resolved", DataType::Boolean, false),
        ArrowField::new("resolved_by", DataType::Utf8, true),
        ArrowField::new("resolved_at", DataType::Utf8, true),
    ]));

    let raw_data = rows
        .iter()
        .map(|r| serde_json::to_string(&r.raw_data))
        .collect::<Result<Vec<_>, _>>()
        .context("serializing raw row data")?;
    fn strings(rows: &[FailedRow], f: impl Fn(&FailedRow) -> String) -> StringArray {
        StringArray::from(rows.iter().map(f).collect::<Vec<_>>())
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(rows, |r| r.id.to_string())),
            Arc::new(strings(rows, |r| r.batch_id.to_string())),
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.row_index).collect::<Vec<_>>(),
            )),
            Arc::new(strings(rows, |r| r.stage.to_string())),
            Arc::new(strings(rows, |r| r.error_code.to_string())),
            Arc::new(strings(rows, |r| r.error_message.clone())),
            Arc::new(StringArray::from(raw_data)),
            Arc::new(strings(rows, |r| r.created_at.to_rfc3339())),
            Arc::new(BooleanArray::from(
                rows.iter().map(|r| r.resolution.is_some()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| r.resolution.as_ref().map(|res| res.resolved_by.clone()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| r.resolution.as_ref().map(|res| res.resolved_at.to_rfc3339()))
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building failed rows record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path, rows: usize) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows: rows as u64,
    })
}
