// 📥 Source Readers
// One trait, three formats: delimited text, JSON reference table, Parquet.
// Readers only check structure; row contents are Cleaning's job.

use crate::config::{CurrencyColumns, FraudSignalColumns, TransactionColumns};
use crate::deadline::run_with_timeout;
use crate::error::{PipelineError, Result};
use crate::records::{fields, RawRecord};
use parquet::basic::Type as PhysicalType;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// FORMATS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Delimited,
    JsonReference,
    Columnar,
}

impl SourceFormat {
    pub fn name(&self) -> &'static str {
        match self {
            SourceFormat::Delimited => "delimited",
            SourceFormat::JsonReference => "json",
            SourceFormat::Columnar => "parquet",
        }
    }
}

/// Detect the format from the file extension.
pub fn detect_format(path: &Path) -> Result<SourceFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "csv" | "tsv" | "txt" => Ok(SourceFormat::Delimited),
        "json" => Ok(SourceFormat::JsonReference),
        "parquet" | "pq" => Ok(SourceFormat::Columnar),
        _ => Err(PipelineError::malformed(
            path,
            format!("cannot detect source format from extension '{}'", ext),
        )),
    }
}

/// Get the reader for a format (tab-separated when the file says so).
pub fn get_reader(format: SourceFormat, path: &Path) -> Box<dyn SourceReader> {
    match format {
        SourceFormat::Delimited => {
            let is_tsv = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("tsv"))
                .unwrap_or(false);
            Box::new(DelimitedReader {
                delimiter: if is_tsv { b'\t' } else { b',' },
            })
        }
        SourceFormat::JsonReference => Box::new(JsonReferenceReader),
        SourceFormat::Columnar => Box::new(ColumnarReader),
    }
}

// ============================================================================
// EXPECTED SCHEMA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Flag,
    Number,
}

impl ColumnKind {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Flag => "flag",
            ColumnKind::Number => "number",
        }
    }

    /// Whether a Parquet physical type can carry this kind.
    fn accepts(&self, physical: PhysicalType) -> bool {
        match self {
            ColumnKind::Text => true,
            ColumnKind::Flag => matches!(
                physical,
                PhysicalType::BOOLEAN
                    | PhysicalType::INT32
                    | PhysicalType::INT64
                    | PhysicalType::BYTE_ARRAY
            ),
            ColumnKind::Number => matches!(
                physical,
                PhysicalType::INT32
                    | PhysicalType::INT64
                    | PhysicalType::FLOAT
                    | PhysicalType::DOUBLE
                    | PhysicalType::FIXED_LEN_BYTE_ARRAY
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub logical: String,
    pub physical: String,
    pub kind: ColumnKind,
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectedSchema {
    pub columns: Vec<ColumnSpec>,
}

impl ExpectedSchema {
    pub fn new() -> Self {
        ExpectedSchema::default()
    }

    /// Builder pattern: add a required column
    pub fn required(mut self, logical: &str, physical: &str, kind: ColumnKind) -> Self {
        self.columns.push(ColumnSpec {
            logical: logical.to_string(),
            physical: physical.to_string(),
            kind,
            required: true,
        });
        self
    }

    /// Builder pattern: add an optional column
    pub fn optional(mut self, logical: &str, physical: &str, kind: ColumnKind) -> Self {
        self.columns.push(ColumnSpec {
            logical: logical.to_string(),
            physical: physical.to_string(),
            kind,
            required: false,
        });
        self
    }

    pub fn transactions(map: &TransactionColumns) -> Self {
        let schema = ExpectedSchema::new()
            .required(fields::TRANSACTION_ID, &map.transaction_id, ColumnKind::Text)
            .required(fields::TIMESTAMP, &map.timestamp, ColumnKind::Text)
            .required(fields::SOURCE_ACCOUNT, &map.source_account, ColumnKind::Text)
            .required(fields::DEST_ACCOUNT, &map.dest_account, ColumnKind::Text)
            .required(fields::AMOUNT, &map.amount, ColumnKind::Number)
            .required(fields::CURRENCY_CODE, &map.currency_code, ColumnKind::Text);
        match &map.raw_flags {
            Some(col) => schema.optional(fields::RAW_FLAGS, col, ColumnKind::Text),
            None => schema,
        }
    }

    pub fn currency(map: &CurrencyColumns) -> Self {
        ExpectedSchema::new()
            .required(fields::CURRENCY_CODE, &map.code, ColumnKind::Text)
            .required(fields::RATE, &map.rate, ColumnKind::Number)
    }

    pub fn fraud_signals(map: &FraudSignalColumns) -> Self {
        let mut schema = ExpectedSchema::new()
            .required(fields::TRANSACTION_ID, &map.transaction_id, ColumnKind::Text)
            .required(fields::IS_FRAUD, &map.is_fraud, ColumnKind::Flag)
            .required(fields::FRAUD_SCORE, &map.fraud_score, ColumnKind::Number);
        if let Some(col) = &map.amount {
            schema = schema.optional(fields::AMOUNT, col, ColumnKind::Number);
        }
        if let Some(col) = &map.signal_source {
            schema = schema.optional(fields::SIGNAL_SOURCE, col, ColumnKind::Text);
        }
        schema
    }

    pub fn column(&self, logical: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.logical == logical)
    }

    /// Map each expected column to its index in `headers`.
    /// Fails with SchemaMismatch listing every missing required column.
    fn resolve(&self, path: &Path, headers: &[String]) -> Result<Vec<(usize, &ColumnSpec)>> {
        let mut resolved = Vec::new();
        let mut missing = Vec::new();

        for spec in &self.columns {
            match headers.iter().position(|h| h == &spec.physical) {
                Some(idx) => resolved.push((idx, spec)),
                None if spec.required => missing.push(spec.physical.clone()),
                None => {}
            }
        }

        if !missing.is_empty() {
            return Err(PipelineError::SchemaMismatch {
                path: path.to_path_buf(),
                missing,
            });
        }
        Ok(resolved)
    }
}

// ============================================================================
// READER TRAIT
// ============================================================================

/// SourceReader - uniform interface so Cleaning never sees the file format.
pub trait SourceReader: Send + Sync {
    /// Read every row, keyed by logical field name, in file order.
    fn read(&self, path: &Path, schema: &ExpectedSchema) -> Result<Vec<RawRecord>>;

    fn format(&self) -> SourceFormat;
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| PipelineError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

// ============================================================================
// DELIMITED (CSV / TSV)
// ============================================================================

pub struct DelimitedReader {
    pub delimiter: u8,
}

impl SourceReader for DelimitedReader {
    fn read(&self, path: &Path, schema: &ExpectedSchema) -> Result<Vec<RawRecord>> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(BufReader::new(open(path)?));

        let headers: Vec<String> = rdr
            .headers()
            .map_err(|e| PipelineError::malformed(path, e.to_string()))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        if headers.iter().all(|h| h.is_empty()) {
            return Err(PipelineError::malformed(path, "no header row"));
        }

        let columns = schema.resolve(path, &headers)?;
        let mut records = Vec::new();

        // Byte records: a bad UTF-8 cell is a row problem, not a file problem
        for (position, result) in rdr.byte_records().enumerate() {
            let row = result.map_err(|e| {
                PipelineError::malformed(path, format!("row {}: {}", position + 1, e))
            })?;

            let mut raw = RawRecord::new(position);
            for (idx, spec) in &columns {
                if let Some(cell) = row.get(*idx) {
                    raw.fields.insert(
                        spec.logical.clone(),
                        String::from_utf8_lossy(cell).into_owned(),
                    );
                }
            }
            records.push(raw);
        }

        Ok(records)
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Delimited
    }
}

// ============================================================================
// JSON REFERENCE TABLE
// ============================================================================

/// Accepts `{code: {rate, ...}}`, `{code: rate}` or `[{code, rate, ...}]`.
/// Keys that are not mapped columns are kept under their own names as metadata.
pub struct JsonReferenceReader;

impl JsonReferenceReader {
    fn cell(value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn object_row(
        position: usize,
        obj: &serde_json::Map<String, Value>,
        schema: &ExpectedSchema,
    ) -> (RawRecord, Vec<String>) {
        let mut raw = RawRecord::new(position);
        let mut missing = Vec::new();

        for spec in &schema.columns {
            match obj.get(&spec.physical) {
                Some(v) => {
                    raw.fields.insert(spec.logical.clone(), Self::cell(v));
                }
                None if spec.required => missing.push(spec.physical.clone()),
                None => {}
            }
        }
        for (key, v) in obj {
            if schema.columns.iter().all(|c| &c.physical != key) {
                raw.fields.insert(key.clone(), Self::cell(v));
            }
        }
        (raw, missing)
    }
}

impl SourceReader for JsonReferenceReader {
    fn read(&self, path: &Path, schema: &ExpectedSchema) -> Result<Vec<RawRecord>> {
        let doc: Value = serde_json::from_reader(BufReader::new(open(path)?))
            .map_err(|e| PipelineError::malformed(path, e.to_string()))?;

        let code_spec = schema
            .column(fields::CURRENCY_CODE)
            .ok_or_else(|| PipelineError::Config("reference schema has no code column".into()))?;

        let mut records = Vec::new();
        let mut missing: Vec<String> = Vec::new();

        match &doc {
            Value::Object(map) => {
                for (position, (code, entry)) in map.iter().enumerate() {
                    let raw = match entry {
                        Value::Object(obj) => {
                            let (raw, miss) = Self::object_row(position, obj, schema);
                            // The key is the code; an entry need not repeat it
                            missing.extend(miss.into_iter().filter(|m| m != &code_spec.physical));
                            raw
                        }
                        scalar => RawRecord::new(position)
                            .with_field(fields::RATE, Self::cell(scalar)),
                    };
                    records.push(raw.with_field(fields::CURRENCY_CODE, code.clone()));
                }
            }
            Value::Array(items) => {
                for (position, item) in items.iter().enumerate() {
                    let obj = item.as_object().ok_or_else(|| {
                        PipelineError::malformed(path, format!("entry {} is not an object", position))
                    })?;
                    let (raw, miss) = Self::object_row(position, obj, schema);
                    missing.extend(miss);
                    records.push(raw);
                }
            }
            _ => {
                return Err(PipelineError::malformed(
                    path,
                    "reference must be a JSON object or array",
                ))
            }
        }

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(PipelineError::SchemaMismatch {
                path: path.to_path_buf(),
                missing,
            });
        }

        Ok(records)
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::JsonReference
    }
}

// ============================================================================
// COLUMNAR (PARQUET)
// ============================================================================

pub struct ColumnarReader;

impl ColumnarReader {
    fn cell(field: &Field) -> String {
        match field {
            Field::Null => String::new(),
            Field::Bool(b) => b.to_string(),
            Field::Str(s) => s.clone(),
            Field::Bytes(b) => String::from_utf8_lossy(b.data()).into_owned(),
            other => other.to_string(),
        }
    }
}

impl SourceReader for ColumnarReader {
    fn read(&self, path: &Path, schema: &ExpectedSchema) -> Result<Vec<RawRecord>> {
        let reader = SerializedFileReader::new(open(path)?)
            .map_err(|e| PipelineError::malformed(path, e.to_string()))?;

        let descr = reader.metadata().file_metadata().schema_descr();
        let physical: HashMap<String, PhysicalType> = descr
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.physical_type()))
            .collect();
        let headers: Vec<String> = descr.columns().iter().map(|c| c.name().to_string()).collect();

        let columns = schema.resolve(path, &headers)?;
        for (_, spec) in &columns {
            let found = physical[&spec.physical];
            if !spec.kind.accepts(found) {
                return Err(PipelineError::ColumnType {
                    path: path.to_path_buf(),
                    column: spec.physical.clone(),
                    found: format!("{:?}", found),
                    expected: spec.kind.name().to_string(),
                });
            }
        }

        let lookup: HashMap<&str, &str> = columns
            .iter()
            .map(|(_, spec)| (spec.physical.as_str(), spec.logical.as_str()))
            .collect();

        let rows = reader
            .get_row_iter(None)
            .map_err(|e| PipelineError::malformed(path, e.to_string()))?;

        let mut records = Vec::new();
        for (position, row) in rows.enumerate() {
            let row = row.map_err(|e| {
                PipelineError::malformed(path, format!("row {}: {}", position + 1, e))
            })?;
            let mut raw = RawRecord::new(position);
            for (name, field) in row.get_column_iter() {
                if let Some(logical) = lookup.get(name.as_str()) {
                    raw.fields.insert(logical.to_string(), Self::cell(field));
                }
            }
            records.push(raw);
        }

        Ok(records)
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Columnar
    }
}

// ============================================================================
// POLICY-DRIVEN READ (timeout + retries + fingerprint)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReadPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        ReadPolicy {
            timeout: Duration::from_secs(600),
            retries: 0,
            retry_delay: Duration::from_millis(0),
        }
    }
}

/// Rows read from one input plus the provenance the manifest needs.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub path: PathBuf,
    pub format: SourceFormat,
    pub sha256: String,
    pub records: Vec<RawRecord>,
}

/// SHA-256 of the file contents, hex encoded.
pub fn fingerprint(path: &Path) -> Result<String> {
    let mut file = open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| PipelineError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read one source under the policy's timeout, retrying transient I/O failures.
pub fn read_source(path: &Path, schema: &ExpectedSchema, policy: &ReadPolicy) -> Result<SourceBatch> {
    let format = detect_format(path)?;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let owned_path = path.to_path_buf();
        let owned_schema = schema.clone();
        let operation = format!("read {}", path.display());

        let result = run_with_timeout(&operation, policy.timeout, move || {
            let reader = get_reader(format, &owned_path);
            let sha256 = fingerprint(&owned_path)?;
            let records = reader.read(&owned_path, &owned_schema)?;
            Ok(SourceBatch {
                path: owned_path,
                format,
                sha256,
                records,
            })
        });

        match result {
            Ok(batch) => {
                info!(
                    path = %path.display(),
                    format = format.name(),
                    rows = batch.records.len(),
                    "source loaded"
                );
                return Ok(batch);
            }
            Err(e) if e.is_retryable() && attempt <= policy.retries => {
                warn!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "source read failed, retrying"
                );
                std::thread::sleep(policy.retry_delay);
            }
            Err(e) => {
                debug!(path = %path.display(), attempt, "giving up on source");
                return Err(e);
            }
        }
    }
}
