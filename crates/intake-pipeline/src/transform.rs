//! Row-level coercion and classification. Everything here is pure; the
//! ingest stages feed it raw rows and persist what it decides.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use intake_adapters::{CanonicalField, SourceConfig};
use intake_core::{
    normalize_case_number, ErrorCode, ExistingKeyPolicy, FailureStage, JudgmentDraft, NewFailedRow,
    RawRow, RowIssue, ValidatedRow, ValidationStatus,
};
use uuid::Uuid;

/// Parse a currency cell into minor units. Accepts `$`, `USD`, thousands
/// separators and up to two decimals; negatives, including accounting
/// parentheses, are rejected.
pub fn parse_amount_cents(input: &str) -> Result<i64, String> {
    let trimmed = input.trim();
    if trimmed.starts_with('-') || (trimmed.starts_with('(') && trimmed.ends_with(')')) {
        return Err(format!("negative amount `{trimmed}`"));
    }
    let body = trimmed
        .strip_prefix("USD")
        .or_else(|| trimmed.strip_suffix("USD"))
        .unwrap_or(trimmed)
        .trim();
    let body = body.strip_prefix('$').unwrap_or(body).trim();
    if body.starts_with('-') {
        return Err(format!("negative amount `{trimmed}`"));
    }
    let cleaned: String = body.chars().filter(|c| *c != ',' && *c != ' ').collect();
    if cleaned.is_empty() {
        return Err(format!("no digits in amount `{trimmed}`"));
    }

    let (whole, fraction) = match cleaned.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (cleaned.as_str(), ""),
    };
    let digits_only = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if !digits_only(whole) || !digits_only(fraction) || (whole.is_empty() && fraction.is_empty()) {
        return Err(format!("unparseable amount `{trimmed}`"));
    }
    if fraction.len() > 2 {
        return Err(format!("amount `{trimmed}` has more than two decimal places"));
    }

    let overflow = || format!("amount `{trimmed}` is out of range");
    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|_| overflow())? * 10,
        _ => fraction.parse().map_err(|_| overflow())?,
    };
    whole
        .checked_mul(100)
        .and_then(|v| v.checked_add(cents))
        .ok_or_else(overflow)
}

/// Try each configured format in order; full timestamps are cut to their
/// date part first.
pub fn parse_date(input: &str, formats: &[String], today: NaiveDate) -> Result<NaiveDate, String> {
    let trimmed = input.trim();
    let parsed = formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|dt| dt.date_naive())
        })
        .ok_or_else(|| format!("`{trimmed}` matches none of {}", formats.join(", ")))?;
    if parsed > today {
        return Err(format!("entry date {parsed} is in the future"));
    }
    Ok(parsed)
}

/// Collapse runs of whitespace to a single space.
pub fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Issues found on one row before cross-row duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowAssessment {
    pub natural_key: Option<String>,
    pub values: JudgmentDraft,
    pub errors: Vec<RowIssue>,
    pub warnings: Vec<RowIssue>,
    pub malformed: bool,
}

pub fn assess_row(source: &SourceConfig, raw: &RawRow, today: NaiveDate) -> RowAssessment {
    if let Some(reason) = &raw.parse_error {
        return RowAssessment {
            natural_key: None,
            values: JudgmentDraft::default(),
            errors: vec![RowIssue::new(ErrorCode::MalformedRow, None, reason.clone())],
            warnings: Vec::new(),
            malformed: true,
        };
    }

    let mapped = source.apply_mapping(&raw.data);
    let mut errors: Vec<RowIssue> = mapped
        .missing_required
        .iter()
        .map(|field| {
            RowIssue::new(
                ErrorCode::MissingRequiredField,
                Some(field.as_str()),
                format!("{field} is required"),
            )
        })
        .collect();
    let warnings: Vec<RowIssue> = mapped
        .missing_optional
        .iter()
        .map(|field| {
            RowIssue::new(
                ErrorCode::MissingOptionalField,
                Some(field.as_str()),
                format!("{field} is missing"),
            )
        })
        .collect();

    let text = |field| mapped.get(field).map(normalize_text);
    let mut values = JudgmentDraft {
        case_number: mapped.get(CanonicalField::CaseNumber).map(normalize_case_number),
        plaintiff_name: text(CanonicalField::PlaintiffName),
        defendant_name: text(CanonicalField::DefendantName),
        court: text(CanonicalField::Court),
        county: text(CanonicalField::County),
        state: text(CanonicalField::State).map(|s| s.to_uppercase()),
        defendant_address: text(CanonicalField::DefendantAddress),
        ..JudgmentDraft::default()
    };

    if let Some(raw_amount) = mapped.get(CanonicalField::JudgmentAmount) {
        match parse_amount_cents(raw_amount) {
            Ok(cents) => values.judgment_amount_cents = Some(cents),
            Err(message) => errors.push(RowIssue::new(
                ErrorCode::InvalidAmount,
                Some(CanonicalField::JudgmentAmount.as_str()),
                message,
            )),
        }
    }
    if let Some(raw_date) = mapped.get(CanonicalField::EntryDate) {
        match parse_date(raw_date, &source.date_formats, today) {
            Ok(date) => values.entry_date = Some(date),
            Err(message) => errors.push(RowIssue::new(
                ErrorCode::InvalidDate,
                Some(CanonicalField::EntryDate.as_str()),
                message,
            )),
        }
    }

    RowAssessment {
        natural_key: values.case_number.clone().filter(|k| !k.is_empty()),
        values,
        errors,
        warnings,
        malformed: false,
    }
}

/// Tracks natural keys across a batch in row order. Only rows that survive
/// validation register their key, so an invalid first occurrence does not
/// turn a later good row into a duplicate.
#[derive(Debug, Default)]
pub struct KeyTracker {
    seen: HashMap<String, u64>,
    existing: HashSet<String>,
    policy: ExistingKeyPolicy,
}

impl KeyTracker {
    pub fn new(existing: HashSet<String>, policy: ExistingKeyPolicy) -> Self {
        Self {
            seen: HashMap::new(),
            existing,
            policy,
        }
    }

    pub fn extend_existing(&mut self, keys: impl IntoIterator<Item = String>) {
        self.existing.extend(keys);
    }

    /// Record a row already classified in an earlier pass.
    pub fn remember(&mut self, row: &ValidatedRow) {
        if row.status.is_upsert_eligible() {
            if let Some(key) = &row.natural_key {
                self.seen.entry(key.clone()).or_insert(row.row_index);
            }
        }
    }

    /// Classify with precedence invalid, duplicate, warning, valid.
    pub fn classify(
        &mut self,
        batch_id: Uuid,
        row_index: u64,
        assessment: RowAssessment,
        now: DateTime<Utc>,
    ) -> ValidatedRow {
        let RowAssessment {
            natural_key,
            values,
            mut errors,
            warnings,
            ..
        } = assessment;

        let status = if !errors.is_empty() {
            ValidationStatus::Invalid
        } else if let Some(first) = natural_key.as_ref().and_then(|k| self.seen.get(k)) {
            errors.push(RowIssue::new(
                ErrorCode::DuplicateInBatch,
                Some(CanonicalField::CaseNumber.as_str()),
                format!("case number already appears at row {first}"),
            ));
            ValidationStatus::Duplicate
        } else if natural_key
            .as_ref()
            .is_some_and(|k| self.existing.contains(k))
            && self.policy == ExistingKeyPolicy::Duplicate
        {
            errors.push(RowIssue::new(
                ErrorCode::DuplicateExisting,
                Some(CanonicalField::CaseNumber.as_str()),
                "case number already exists in the canonical store",
            ));
            ValidationStatus::Duplicate
        } else if !warnings.is_empty() {
            ValidationStatus::Warning
        } else {
            ValidationStatus::Valid
        };

        if status.is_upsert_eligible() {
            if let Some(key) = &natural_key {
                self.seen.insert(key.clone(), row_index);
            }
        }

        ValidatedRow {
            batch_id,
            row_index,
            natural_key,
            status,
            values,
            errors,
            warnings,
            upsert_outcome: None,
            validated_at: now,
        }
    }
}

/// Dead-letter entry for an invalid row; `None` for every other status.
pub fn quarantine_entry(raw: &RawRow, row: &ValidatedRow) -> Option<NewFailedRow> {
    if row.status != ValidationStatus::Invalid {
        return None;
    }
    let first = row.errors.first()?;
    let stage = if first.code == ErrorCode::MalformedRow {
        FailureStage::Parse
    } else {
        FailureStage::Validate
    };
    Some(NewFailedRow {
        batch_id: row.batch_id,
        row_index: row.row_index,
        stage,
        error_code: first.code,
        error_message: row
            .errors
            .iter()
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>()
            .join("; "),
        raw_data: raw.data.clone(),
    })
}
