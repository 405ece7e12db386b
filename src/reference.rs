// 📚 Reference Data
// Currency rates and fraud signals: loaded once per run, never mutated after.

use crate::error::{PipelineError, Result};
use crate::records::{fields, RawRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Parse a decimal written plainly ("1.08") or in scientific notation ("1e-3").
pub fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

// ============================================================================
// CURRENCY REFERENCE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyEntry {
    pub rate_to_base: Decimal,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CurrencyRef {
    entries: HashMap<String, CurrencyEntry>,
}

impl CurrencyRef {
    /// Build the table from reader output. A corrupt reference table fails the run:
    /// every derived amount depends on it.
    pub fn from_records(path: &Path, records: Vec<RawRecord>) -> Result<Self> {
        let mut entries: HashMap<String, CurrencyEntry> = HashMap::new();

        for raw in records {
            let code = raw
                .get(fields::CURRENCY_CODE)
                .map(|c| c.to_ascii_uppercase())
                .ok_or_else(|| {
                    PipelineError::malformed(path, format!("entry {} has no currency code", raw.position))
                })?;

            let rate_text = raw.get(fields::RATE).ok_or_else(|| {
                PipelineError::malformed(path, format!("{} has no rate", code))
            })?;
            let rate = parse_decimal(rate_text)
                .filter(|r| *r > Decimal::ZERO)
                .ok_or_else(|| {
                    PipelineError::malformed(path, format!("{} has invalid rate '{}'", code, rate_text))
                })?;

            let metadata: BTreeMap<String, String> = raw
                .fields
                .iter()
                .filter(|(k, _)| k.as_str() != fields::CURRENCY_CODE && k.as_str() != fields::RATE)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let entry = CurrencyEntry {
                rate_to_base: rate,
                metadata,
            };

            if let Some(existing) = entries.get(&code) {
                if existing.rate_to_base != entry.rate_to_base {
                    return Err(PipelineError::malformed(
                        path,
                        format!("{} listed twice with different rates", code),
                    ));
                }
                continue;
            }
            entries.insert(code, entry);
        }

        Ok(CurrencyRef { entries })
    }

    /// Build directly from (code, rate) pairs.
    pub fn from_rates<'a>(rates: impl IntoIterator<Item = (&'a str, Decimal)>) -> Self {
        let entries = rates
            .into_iter()
            .map(|(code, rate)| {
                (
                    code.to_ascii_uppercase(),
                    CurrencyEntry {
                        rate_to_base: rate,
                        metadata: BTreeMap::new(),
                    },
                )
            })
            .collect();
        CurrencyRef { entries }
    }

    pub fn get(&self, code: &str) -> Option<&CurrencyEntry> {
        self.entries.get(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// FRAUD SIGNALS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudSignal {
    pub is_fraud: bool,
    pub fraud_score: f64,
    pub signal_source: String,
    pub amount: Option<Decimal>,
}

#[derive(Debug, Clone, Default)]
pub struct FraudSignals {
    signals: HashMap<String, FraudSignal>,
    /// Rows dropped because they could not be interpreted
    pub skipped: usize,
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "t" => Some(true),
        "false" | "0" | "no" | "n" | "f" => Some(false),
        _ => None,
    }
}

impl FraudSignals {
    /// Build the lookup from reader output. Labels are incomplete ground truth,
    /// so unreadable rows are skipped and counted instead of failing the run.
    pub fn from_records(records: Vec<RawRecord>, default_source: &str) -> Self {
        let mut signals: HashMap<String, FraudSignal> = HashMap::new();
        let mut skipped = 0;

        for raw in records {
            let parsed = (|| {
                let id = raw.get(fields::TRANSACTION_ID)?.to_string();
                let is_fraud = parse_flag(raw.get(fields::IS_FRAUD)?)?;
                let fraud_score: f64 = raw.get(fields::FRAUD_SCORE)?.parse().ok()?;
                if !fraud_score.is_finite() {
                    return None;
                }
                let amount = raw.get(fields::AMOUNT).and_then(parse_decimal);
                let signal_source = raw
                    .get(fields::SIGNAL_SOURCE)
                    .unwrap_or(default_source)
                    .to_string();
                Some((
                    id,
                    FraudSignal {
                        is_fraud,
                        fraud_score,
                        signal_source,
                        amount,
                    },
                ))
            })();

            match parsed {
                Some((id, signal)) if !signals.contains_key(&id) => {
                    signals.insert(id, signal);
                }
                _ => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(skipped, "fraud signal rows skipped");
        }

        FraudSignals { signals, skipped }
    }

    pub fn get(&self, transaction_id: &str) -> Option<&FraudSignal> {
        self.signals.get(transaction_id)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Nearest-rank quantile of amounts among confirmed fraud rows.
    /// None when the table carries no amounts or no fraud.
    pub fn fraud_amount_threshold(&self, quantile: f64) -> Option<Decimal> {
        let mut amounts: Vec<Decimal> = self
            .signals
            .values()
            .filter(|s| s.is_fraud)
            .filter_map(|s| s.amount)
            .collect();
        if amounts.is_empty() {
            return None;
        }
        amounts.sort();

        let n = amounts.len();
        let rank = ((quantile * n as f64).ceil() as usize).clamp(1, n);
        Some(amounts[rank - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_currency_ref_from_records() {
        let records = vec![
            RawRecord::new(0)
                .with_field(fields::CURRENCY_CODE, "usd")
                .with_field(fields::RATE, "1")
                .with_field("name", "US Dollar"),
            RawRecord::new(1)
                .with_field(fields::CURRENCY_CODE, "EUR")
                .with_field(fields::RATE, "1.08"),
        ];

        let currency = CurrencyRef::from_records(Path::new("c.json"), records).unwrap();

        assert_eq!(currency.len(), 2);
        let usd = currency.get("USD").unwrap();
        assert_eq!(usd.rate_to_base, dec("1"));
        assert_eq!(usd.metadata.get("name").map(String::as_str), Some("US Dollar"));
        assert_eq!(currency.get("EUR").unwrap().rate_to_base, dec("1.08"));
        assert!(currency.get("ZZZ").is_none());
    }

    #[test]
    fn test_currency_ref_rejects_bad_rates() {
        let zero = vec![RawRecord::new(0)
            .with_field(fields::CURRENCY_CODE, "USD")
            .with_field(fields::RATE, "0")];
        assert!(CurrencyRef::from_records(Path::new("c.json"), zero).is_err());

        let text = vec![RawRecord::new(0)
            .with_field(fields::CURRENCY_CODE, "USD")
            .with_field(fields::RATE, "US Dollar")];
        let err = CurrencyRef::from_records(Path::new("c.json"), text).unwrap_err();
        assert_eq!(err.kind(), "MalformedInputError");

        let conflicting = vec![
            RawRecord::new(0)
                .with_field(fields::CURRENCY_CODE, "USD")
                .with_field(fields::RATE, "1"),
            RawRecord::new(1)
                .with_field(fields::CURRENCY_CODE, "usd")
                .with_field(fields::RATE, "2"),
        ];
        assert!(CurrencyRef::from_records(Path::new("c.json"), conflicting).is_err());
    }

    #[test]
    fn test_parse_decimal_scientific() {
        assert_eq!(parse_decimal("1e-3"), Some(dec("0.001")));
        assert_eq!(parse_decimal(" 2.50 "), Some(dec("2.50")));
        assert_eq!(parse_decimal("abc"), None);
    }

    #[test]
    fn test_fraud_signals_skip_unreadable_rows() {
        let records = vec![
            RawRecord::new(0)
                .with_field(fields::TRANSACTION_ID, "t1")
                .with_field(fields::IS_FRAUD, "1")
                .with_field(fields::FRAUD_SCORE, "0.9"),
            RawRecord::new(1)
                .with_field(fields::TRANSACTION_ID, "t2")
                .with_field(fields::IS_FRAUD, "maybe")
                .with_field(fields::FRAUD_SCORE, "0.5"),
            RawRecord::new(2)
                .with_field(fields::TRANSACTION_ID, "t1")
                .with_field(fields::IS_FRAUD, "false")
                .with_field(fields::FRAUD_SCORE, "0.1"),
        ];

        let signals = FraudSignals::from_records(records, "paysim");

        assert_eq!(signals.len(), 1);
        assert_eq!(signals.skipped, 2);
        let t1 = signals.get("t1").unwrap();
        assert!(t1.is_fraud);
        assert_eq!(t1.fraud_score, 0.9);
        assert_eq!(t1.signal_source, "paysim");
    }

    #[test]
    fn test_fraud_amount_threshold_nearest_rank() {
        let mut records = Vec::new();
        for i in 1..=20 {
            records.push(
                RawRecord::new(i)
                    .with_field(fields::TRANSACTION_ID, format!("f{}", i))
                    .with_field(fields::IS_FRAUD, "true")
                    .with_field(fields::FRAUD_SCORE, "1.0")
                    .with_field(fields::AMOUNT, format!("{}", i * 100)),
            );
        }
        // Legit rows never move the threshold
        records.push(
            RawRecord::new(99)
                .with_field(fields::TRANSACTION_ID, "legit")
                .with_field(fields::IS_FRAUD, "false")
                .with_field(fields::FRAUD_SCORE, "0.0")
                .with_field(fields::AMOUNT, "999999"),
        );

        let signals = FraudSignals::from_records(records, "paysim");

        // ceil(0.95 * 20) = 19th smallest
        assert_eq!(signals.fraud_amount_threshold(0.95), Some(dec("1900")));
        assert_eq!(signals.fraud_amount_threshold(1.0), Some(dec("2000")));
        assert_eq!(signals.fraud_amount_threshold(0.01), Some(dec("100")));
    }

    #[test]
    fn test_fraud_amount_threshold_absent_without_amounts() {
        let records = vec![RawRecord::new(0)
            .with_field(fields::TRANSACTION_ID, "t1")
            .with_field(fields::IS_FRAUD, "true")
            .with_field(fields::FRAUD_SCORE, "0.7")];
        let signals = FraudSignals::from_records(records, "paysim");
        assert_eq!(signals.fraud_amount_threshold(0.95), None);
    }
}
