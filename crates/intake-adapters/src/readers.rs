//! Export readers. Each turns the submitted bytes into verbatim string maps,
//! one per source row, and only fails outright when the document as a whole
//! cannot be read as rows.

use std::collections::HashSet;

use intake_core::{ExportFormat, RawRecord};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::SourceConfig;

/// Key holding the verbatim text of a JSON line that did not decode.
pub const RAW_LINE_KEY: &str = "__line__";
/// Key holding the verbatim JSON of an array element that is not an object.
pub const RAW_VALUE_KEY: &str = "__value__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRow {
    pub data: RawRecord,
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedExport {
    pub columns: Vec<String>,
    pub rows: Vec<ParsedRow>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("export contains no rows")]
    Empty,
    #[error("header row is not valid UTF-8")]
    HeaderEncoding,
    #[error("header column {0} is blank")]
    BlankHeader(usize),
    #[error("header column `{0}` appears more than once")]
    DuplicateHeader(String),
    #[error("export is not a JSON array of objects: {0}")]
    NotArray(String),
    #[error("no line of the export is a JSON object")]
    NoRecords,
    #[error("csv: {0}")]
    Csv(String),
}

pub trait ExportReader: Send + Sync {
    fn format(&self) -> ExportFormat;
    fn read(&self, bytes: &[u8]) -> Result<ParsedExport, ReadError>;
}

pub fn reader_for(source: &SourceConfig) -> Box<dyn ExportReader> {
    match source.format {
        ExportFormat::Csv => {
            let delimiter = source
                .delimiter
                .filter(char::is_ascii)
                .map(|c| c as u8)
                .unwrap_or(b',');
            Box::new(CsvReader { delimiter })
        }
        ExportFormat::JsonLines => Box::new(JsonLinesReader),
        ExportFormat::JsonArray => Box::new(JsonArrayReader),
    }
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

#[derive(Debug, Clone, Copy)]
pub struct CsvReader {
    pub delimiter: u8,
}

impl Default for CsvReader {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl ExportReader for CsvReader {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    fn read(&self, bytes: &[u8]) -> Result<ParsedExport, ReadError> {
        let bytes = strip_bom(bytes);
        if is_blank(bytes) {
            return Err(ReadError::Empty);
        }
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .has_headers(true)
            .from_reader(bytes);

        let headers = reader
            .byte_headers()
            .map_err(|e| ReadError::Csv(e.to_string()))?
            .clone();
        let mut columns = Vec::with_capacity(headers.len());
        let mut seen = HashSet::new();
        for (i, raw) in headers.iter().enumerate() {
            let name = std::str::from_utf8(raw)
                .map_err(|_| ReadError::HeaderEncoding)?
                .trim()
                .to_string();
            if name.is_empty() {
                return Err(ReadError::BlankHeader(i + 1));
            }
            if !seen.insert(name.clone()) {
                return Err(ReadError::DuplicateHeader(name));
            }
            columns.push(name);
        }

        let mut rows = Vec::new();
        for record in reader.byte_records() {
            rows.push(match record {
                Ok(record) => csv_row(&columns, &record),
                Err(err) => ParsedRow {
                    data: RawRecord::new(),
                    parse_error: Some(err.to_string()),
                },
            });
        }
        Ok(ParsedExport { columns, rows })
    }
}

fn csv_row(columns: &[String], record: &csv::ByteRecord) -> ParsedRow {
    let mut data = RawRecord::new();
    let mut problems = Vec::new();
    if record.len() != columns.len() {
        problems.push(format!(
            "expected {} fields, found {}",
            columns.len(),
            record.len()
        ));
    }
    for (i, field) in record.iter().enumerate() {
        let value = match std::str::from_utf8(field) {
            Ok(v) => v.to_string(),
            Err(_) => {
                problems.push(format!("field {} is not valid UTF-8", i + 1));
                String::from_utf8_lossy(field).into_owned()
            }
        };
        let key = columns
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("__extra_{}", i + 1));
        data.insert(key, value);
    }
    ParsedRow {
        data,
        parse_error: (!problems.is_empty()).then(|| problems.join("; ")),
    }
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn object_row(
    map: &Map<String, JsonValue>,
    columns: &mut Vec<String>,
    seen: &mut HashSet<String>,
) -> ParsedRow {
    let mut data = RawRecord::new();
    for (key, value) in map {
        if seen.insert(key.clone()) {
            columns.push(key.clone());
        }
        data.insert(key.clone(), cell_text(value));
    }
    ParsedRow {
        data,
        parse_error: None,
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesReader;

impl ExportReader for JsonLinesReader {
    fn format(&self) -> ExportFormat {
        ExportFormat::JsonLines
    }

    fn read(&self, bytes: &[u8]) -> Result<ParsedExport, ReadError> {
        let bytes = strip_bom(bytes);
        let mut columns = Vec::new();
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        let mut objects = 0usize;

        for line in bytes.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if is_blank(line) {
                continue;
            }
            let malformed = |text: String, reason: String| ParsedRow {
                data: RawRecord::from([(RAW_LINE_KEY.to_string(), text)]),
                parse_error: Some(reason),
            };
            let text = match std::str::from_utf8(line) {
                Ok(text) => text,
                Err(_) => {
                    rows.push(malformed(
                        String::from_utf8_lossy(line).into_owned(),
                        "line is not valid UTF-8".into(),
                    ));
                    continue;
                }
            };
            match serde_json::from_str::<JsonValue>(text) {
                Ok(JsonValue::Object(map)) => {
                    objects += 1;
                    rows.push(object_row(&map, &mut columns, &mut seen));
                }
                Ok(other) => rows.push(malformed(
                    text.to_string(),
                    format!("expected a JSON object, found {}", json_kind(&other)),
                )),
                Err(err) => rows.push(malformed(text.to_string(), err.to_string())),
            }
        }

        if rows.is_empty() {
            return Err(ReadError::Empty);
        }
        if objects == 0 {
            return Err(ReadError::NoRecords);
        }
        Ok(ParsedExport { columns, rows })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonArrayReader;

impl ExportReader for JsonArrayReader {
    fn format(&self) -> ExportFormat {
        ExportFormat::JsonArray
    }

    fn read(&self, bytes: &[u8]) -> Result<ParsedExport, ReadError> {
        let bytes = strip_bom(bytes);
        if is_blank(bytes) {
            return Err(ReadError::Empty);
        }
        let document: JsonValue =
            serde_json::from_slice(bytes).map_err(|e| ReadError::NotArray(e.to_string()))?;
        let JsonValue::Array(items) = document else {
            return Err(ReadError::NotArray(format!(
                "top level is {}",
                json_kind(&document)
            )));
        };
        if items.is_empty() {
            return Err(ReadError::Empty);
        }

        let mut columns = Vec::new();
        let mut seen = HashSet::new();
        let rows = items
            .iter()
            .map(|item| match item {
                JsonValue::Object(map) => object_row(map, &mut columns, &mut seen),
                other => ParsedRow {
                    data: RawRecord::from([(RAW_VALUE_KEY.to_string(), other.to_string())]),
                    parse_error: Some(format!(
                        "expected a JSON object, found {}",
                        json_kind(other)
                    )),
                },
            })
            .collect();
        Ok(ParsedExport { columns, rows })
    }
}
