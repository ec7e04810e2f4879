//! Source registry and per-source adapters: which export format a vendor
//! sends, how its columns map onto canonical judgment fields, and how tolerant
//! the pipeline should be of its data.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use intake_core::{
    ErrorBudget, ExistingKeyPolicy, ExportFormat, RawRecord, WarningPolicy,
    DEFAULT_ERROR_THRESHOLD_PERCENT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod readers;

pub use readers::{reader_for, ExportReader, ParsedExport, ParsedRow, ReadError};

pub const CRATE_NAME: &str = "intake-adapters";

/// Closed set of canonical judgment fields a vendor column can feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    CaseNumber,
    PlaintiffName,
    DefendantName,
    JudgmentAmount,
    EntryDate,
    Court,
    County,
    State,
    DefendantAddress,
}

impl CanonicalField {
    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalField::CaseNumber => "case_number",
            CanonicalField::PlaintiffName => "plaintiff_name",
            CanonicalField::DefendantName => "defendant_name",
            CanonicalField::JudgmentAmount => "judgment_amount",
            CanonicalField::EntryDate => "entry_date",
            CanonicalField::Court => "court",
            CanonicalField::County => "county",
            CanonicalField::State => "state",
            CanonicalField::DefendantAddress => "defendant_address",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub target: CanonicalField,
    pub column: String,
    #[serde(default)]
    pub required: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_threshold() -> f64 {
    DEFAULT_ERROR_THRESHOLD_PERCENT
}

pub fn default_date_formats() -> Vec<String> {
    ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%d-%b-%Y", "%Y%m%d", "%B %d, %Y"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub format: ExportFormat,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default = "default_threshold")]
    pub error_threshold_percent: f64,
    #[serde(default)]
    pub warning_policy: WarningPolicy,
    #[serde(default)]
    pub on_existing: ExistingKeyPolicy,
    #[serde(default = "default_date_formats")]
    pub date_formats: Vec<String>,
    pub fields: Vec<FieldMapping>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Canonical values pulled out of one raw record. Blank cells count as absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MappedRecord {
    pub values: BTreeMap<CanonicalField, String>,
    pub missing_required: Vec<CanonicalField>,
    pub missing_optional: Vec<CanonicalField>,
}

impl MappedRecord {
    pub fn get(&self, field: CanonicalField) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }
}

impl SourceConfig {
    pub fn error_budget(&self) -> ErrorBudget {
        ErrorBudget {
            threshold_percent: self.error_threshold_percent,
            warning_policy: self.warning_policy,
        }
    }

    pub fn mapping_for(&self, target: CanonicalField) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.target == target)
    }

    /// Header matching is exact first, then trimmed and case-insensitive.
    pub fn apply_mapping(&self, record: &RawRecord) -> MappedRecord {
        let mut mapped = MappedRecord::default();
        for mapping in &self.fields {
            let cell = record.get(&mapping.column).or_else(|| {
                let wanted = mapping.column.trim();
                record
                    .iter()
                    .find(|(k, _)| k.trim().eq_ignore_ascii_case(wanted))
                    .map(|(_, v)| v)
            });
            match cell.map(|v| v.trim()).filter(|v| !v.is_empty()) {
                Some(value) => {
                    mapped.values.insert(mapping.target, value.to_string());
                }
                None if mapping.required => mapped.missing_required.push(mapping.target),
                None => mapped.missing_optional.push(mapping.target),
            }
        }
        mapped
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidSource {
            tag: self.source.clone(),
            reason,
        };
        if self.source.trim().is_empty() {
            return Err(invalid("source tag must not be empty".into()));
        }
        if !(0.0..=100.0).contains(&self.error_threshold_percent) {
            return Err(invalid(format!(
                "error_threshold_percent {} outside 0..=100",
                self.error_threshold_percent
            )));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.target) {
                return Err(invalid(format!("{} mapped more than once", field.target)));
            }
        }
        for key in [CanonicalField::CaseNumber, CanonicalField::PlaintiffName] {
            match self.mapping_for(key) {
                Some(m) if m.required => {}
                Some(_) => return Err(invalid(format!("{key} must be required"))),
                None => return Err(invalid(format!("{key} is not mapped"))),
            }
        }
        if self.date_formats.is_empty() {
            return Err(invalid("date_formats must not be empty".into()));
        }
        if let Some(delimiter) = self.delimiter {
            if self.format != ExportFormat::Csv {
                return Err(invalid("delimiter only applies to csv sources".into()));
            }
            if !delimiter.is_ascii() || delimiter == '"' || delimiter == '\n' {
                return Err(invalid(format!("unusable delimiter {delimiter:?}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("source `{0}` is disabled")]
    Disabled(String),
    #[error("source `{0}` is declared more than once")]
    DuplicateSource(String),
    #[error("source `{tag}` is misconfigured: {reason}")]
    InvalidSource { tag: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source.as_str()) {
                return Err(RegistryError::DuplicateSource(source.source.clone()));
            }
            source.validate()?;
        }
        Ok(())
    }

    /// Any declared source, enabled or not. Batches admitted before a source
    /// was disabled still need its mapping to finish.
    pub fn find(&self, source: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source == source)
    }

    /// Look up an enabled source by tag.
    pub fn get(&self, source: &str) -> Result<&SourceConfig, RegistryError> {
        let config = self
            .find(source)
            .ok_or_else(|| RegistryError::UnknownSource(source.to_string()))?;
        if !config.enabled {
            return Err(RegistryError::Disabled(source.to_string()));
        }
        Ok(config)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}
