// 🧹 Cleaning Stage
// Rules run in order and stop at the first failure:
//   1. required fields present
//   2. timestamp parses
//   3. amount is a non-negative decimal
//   4. currency code is three letters
//   5. transaction_id not seen earlier in the batch
// A failing row is quarantined; the stage itself never fails.

use crate::records::{fields, CleanRecord, RawRecord, RejectReason, RejectRecord, Stage};
use crate::reference::parse_decimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rayon::prelude::*;
use std::collections::HashSet;
use tracing::debug;

const REQUIRED_FIELDS: [&str; 6] = [
    fields::TRANSACTION_ID,
    fields::TIMESTAMP,
    fields::SOURCE_ACCOUNT,
    fields::DEST_ACCOUNT,
    fields::AMOUNT,
    fields::CURRENCY_CODE,
];

const BUILTIN_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

type RuleFailure = (RejectReason, String);

#[derive(Debug, Clone, Default)]
pub struct CleaningRules {
    /// Tried after RFC 3339 and the built-in formats
    extra_formats: Vec<String>,
}

impl CleaningRules {
    pub fn new(extra_formats: Vec<String>) -> Self {
        CleaningRules { extra_formats }
    }

    /// Rules 1-4 for a single row.
    pub fn check(&self, raw: &RawRecord) -> Result<CleanRecord, RuleFailure> {
        // Rule 1: required-field presence
        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|f| raw.get(f).is_none())
            .collect();
        if !missing.is_empty() {
            return Err((
                RejectReason::MissingRequiredField,
                format!("missing: {}", missing.join(", ")),
            ));
        }
        let field = |name: &str| raw.get(name).unwrap_or_default();

        // Rule 2: timestamp
        let ts_text = field(fields::TIMESTAMP);
        let timestamp = self.parse_timestamp(ts_text).ok_or_else(|| {
            (
                RejectReason::InvalidTimestamp,
                format!("unparseable timestamp '{}'", ts_text),
            )
        })?;

        // Rule 3: amount
        let amount_text = field(fields::AMOUNT);
        let amount = parse_decimal(amount_text).ok_or_else(|| {
            (
                RejectReason::InvalidAmount,
                format!("not a decimal: '{}'", amount_text),
            )
        })?;
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err((
                RejectReason::InvalidAmount,
                format!("negative amount {}", amount),
            ));
        }

        // Rule 4: currency code shape
        let currency_code = field(fields::CURRENCY_CODE).to_ascii_uppercase();
        if currency_code.len() != 3 || !currency_code.chars().all(|c| c.is_ascii_uppercase()) {
            return Err((
                RejectReason::InvalidCurrencyCode,
                format!("not a 3-letter code: '{}'", currency_code),
            ));
        }

        Ok(CleanRecord {
            position: raw.position,
            transaction_id: field(fields::TRANSACTION_ID).to_string(),
            timestamp,
            source_account: field(fields::SOURCE_ACCOUNT).to_string(),
            dest_account: field(fields::DEST_ACCOUNT).to_string(),
            // abs() also clears the sign of "-0.00"
            amount: amount.abs(),
            currency_code,
            raw_flags: raw.get(fields::RAW_FLAGS).unwrap_or_default().to_string(),
        })
    }

    /// RFC 3339 first, then naive formats read as UTC, then a bare date at midnight.
    pub fn parse_timestamp(&self, text: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }

        let formats = BUILTIN_FORMATS
            .iter()
            .copied()
            .chain(self.extra_formats.iter().map(String::as_str));
        for fmt in formats {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
                return Some(naive.and_utc());
            }
            if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
                return Some(dt.with_timezone(&Utc));
            }
        }

        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }
}

/// Validate every row. `clean.len() + rejects.len() == raw_records.len()`,
/// and both outputs keep input order.
pub fn clean(
    raw_records: Vec<RawRecord>,
    rules: &CleaningRules,
) -> (Vec<CleanRecord>, Vec<RejectRecord>) {
    // Indexed parallel collect keeps input order
    let checked: Vec<Result<(CleanRecord, RawRecord), RejectRecord>> = raw_records
        .into_par_iter()
        .map(|raw| match rules.check(&raw) {
            Ok(record) => Ok((record, raw)),
            Err((reason, detail)) => Err(RejectRecord::new(raw, Stage::Clean, reason, detail)),
        })
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut records = Vec::with_capacity(checked.len());
    let mut rejects = Vec::new();

    for item in checked {
        match item {
            Ok((record, raw)) => {
                // Rule 5: first occurrence wins
                if seen.insert(record.transaction_id.clone()) {
                    records.push(record);
                } else {
                    let detail = format!("transaction_id {} already seen", record.transaction_id);
                    rejects.push(RejectRecord::new(
                        raw,
                        Stage::Clean,
                        RejectReason::DuplicateTransactionId,
                        detail,
                    ));
                }
            }
            Err(reject) => rejects.push(reject),
        }
    }

    // Duplicates are detected after the parallel pass; restore input order
    rejects.sort_by_key(|r| r.raw.position);

    debug!(clean = records.len(), rejects = rejects.len(), "cleaning finished");
    (records, rejects)
}
