// 🧱 Record Types
// One type per pipeline boundary: Raw → Clean → Enriched → Feature, plus Reject.
// Stages take records by value and hand new ones downstream.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// LOGICAL FIELD NAMES
// ============================================================================

pub mod fields {
    pub const TRANSACTION_ID: &str = "transaction_id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SOURCE_ACCOUNT: &str = "source_account";
    pub const DEST_ACCOUNT: &str = "dest_account";
    pub const AMOUNT: &str = "amount";
    pub const CURRENCY_CODE: &str = "currency_code";
    pub const RAW_FLAGS: &str = "raw_flags";

    pub const RATE: &str = "rate";

    pub const IS_FRAUD: &str = "is_fraud";
    pub const FRAUD_SCORE: &str = "fraud_score";
    pub const SIGNAL_SOURCE: &str = "signal_source";
}

// ============================================================================
// STAGES & REJECT REASONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Clean,
    Enrich,
    Features,
    Load,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Clean => "clean",
            Stage::Enrich => "enrich",
            Stage::Features => "features",
            Stage::Load => "load",
        }
    }

    pub fn parse(name: &str) -> Option<Stage> {
        match name {
            "extract" => Some(Stage::Extract),
            "clean" => Some(Stage::Clean),
            "enrich" => Some(Stage::Enrich),
            "features" => Some(Stage::Features),
            "load" => Some(Stage::Load),
            _ => None,
        }
    }
}

/// Why a row was quarantined. Cleaning rules are listed in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingRequiredField,
    InvalidTimestamp,
    InvalidAmount,
    InvalidCurrencyCode,
    DuplicateTransactionId,
    UnknownCurrency,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::MissingRequiredField => "missing_required_field",
            RejectReason::InvalidTimestamp => "invalid_timestamp",
            RejectReason::InvalidAmount => "invalid_amount",
            RejectReason::InvalidCurrencyCode => "invalid_currency_code",
            RejectReason::DuplicateTransactionId => "duplicate_transaction_id",
            RejectReason::UnknownCurrency => "unknown_currency",
        }
    }

    pub fn parse(code: &str) -> Option<RejectReason> {
        [
            RejectReason::MissingRequiredField,
            RejectReason::InvalidTimestamp,
            RejectReason::InvalidAmount,
            RejectReason::InvalidCurrencyCode,
            RejectReason::DuplicateTransactionId,
            RejectReason::UnknownCurrency,
        ]
        .into_iter()
        .find(|r| r.code() == code)
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// RAW RECORD
// ============================================================================

/// One source row, keyed by logical field name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    /// Zero-based row position in the source file
    pub position: usize,
    pub fields: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new(position: usize) -> Self {
        RawRecord {
            position,
            fields: BTreeMap::new(),
        }
    }

    /// Builder pattern: add a field
    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Field value with surrounding whitespace removed; blank counts as absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

// ============================================================================
// CLEAN RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub position: usize,
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_account: String,
    pub dest_account: String,
    pub amount: Decimal,
    pub currency_code: String,
    pub raw_flags: String,
}

impl CleanRecord {
    /// Rebuild a loosely-typed row from normalized values. Pipeline runs
    /// replace it with the row as read before quarantining.
    pub fn to_raw(&self) -> RawRecord {
        let mut raw = RawRecord::new(self.position)
            .with_field(fields::TRANSACTION_ID, self.transaction_id.clone())
            .with_field(fields::TIMESTAMP, format_timestamp(&self.timestamp))
            .with_field(fields::SOURCE_ACCOUNT, self.source_account.clone())
            .with_field(fields::DEST_ACCOUNT, self.dest_account.clone())
            .with_field(fields::AMOUNT, self.amount.to_string())
            .with_field(fields::CURRENCY_CODE, self.currency_code.clone());
        if !self.raw_flags.is_empty() {
            raw = raw.with_field(fields::RAW_FLAGS, self.raw_flags.clone());
        }
        raw
    }
}

// ============================================================================
// ENRICHED RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub clean: CleanRecord,
    pub exchange_rate_to_base: Decimal,
    /// amount * exchange_rate_to_base at the configured precision
    pub amount_in_base_currency: Decimal,
    pub is_fraud: bool,
    pub fraud_score: f64,
    pub signal_source: Option<String>,
}

// ============================================================================
// FEATURE RECORD
// ============================================================================

/// Aggregates over the trailing window `(timestamp - window, timestamp]`
/// for the record's source account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregates {
    pub txn_count: u64,
    pub amount_sum: Decimal,
    pub distinct_currencies: u32,
    pub cross_currency: bool,
    pub seconds_since_prev: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFlags {
    pub hour: u32,
    pub is_night_transaction: bool,
    pub high_amount_flag: bool,
    pub aml_alert_flag: bool,
    pub exceeds_fraud_threshold: bool,
}

impl RiskFlags {
    pub fn is_alert(&self) -> bool {
        self.aml_alert_flag || self.exceeds_fraud_threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub enriched: EnrichedRecord,
    pub window: WindowAggregates,
    pub flags: RiskFlags,
}

impl FeatureRecord {
    pub fn transaction_id(&self) -> &str {
        &self.enriched.clean.transaction_id
    }
}

// ============================================================================
// REJECT RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectRecord {
    pub raw: RawRecord,
    pub stage: Stage,
    pub reason: RejectReason,
    pub detail: String,
}

impl RejectRecord {
    pub fn new(raw: RawRecord, stage: Stage, reason: RejectReason, detail: impl Into<String>) -> Self {
        RejectRecord {
            raw,
            stage,
            reason,
            detail: detail.into(),
        }
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
