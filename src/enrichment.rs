// 💱 Enrichment Stage
// Currency lookup is mandatory (unknown code → quarantine).
// Fraud-signal lookup is a left join: absent means not fraud, score 0.0.

use crate::records::{CleanRecord, EnrichedRecord, RejectReason, RejectRecord, Stage};
use crate::reference::{CurrencyRef, FraudSignals};
use rayon::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

/// amount * rate at a fixed number of decimal places (banker's rounding).
pub fn convert_to_base(amount: Decimal, rate: Decimal, precision: u32) -> Option<Decimal> {
    amount
        .checked_mul(rate)
        .map(|v| v.round_dp_with_strategy(precision, RoundingStrategy::MidpointNearestEven))
}

fn enrich_one(
    record: CleanRecord,
    currency_ref: &CurrencyRef,
    fraud_signals: &FraudSignals,
    precision: u32,
) -> Result<EnrichedRecord, RejectRecord> {
    let Some(currency) = currency_ref.get(&record.currency_code) else {
        let detail = format!("{} not in currency reference", record.currency_code);
        return Err(RejectRecord::new(
            record.to_raw(),
            Stage::Enrich,
            RejectReason::UnknownCurrency,
            detail,
        ));
    };

    let rate = currency.rate_to_base;
    let Some(amount_in_base_currency) = convert_to_base(record.amount, rate, precision) else {
        let detail = format!("{} x {} overflows", record.amount, rate);
        return Err(RejectRecord::new(
            record.to_raw(),
            Stage::Enrich,
            RejectReason::InvalidAmount,
            detail,
        ));
    };

    let (is_fraud, fraud_score, signal_source) = match fraud_signals.get(&record.transaction_id) {
        Some(signal) => (
            signal.is_fraud,
            signal.fraud_score,
            Some(signal.signal_source.clone()),
        ),
        None => (false, 0.0, None),
    };

    Ok(EnrichedRecord {
        clean: record,
        exchange_rate_to_base: rate,
        amount_in_base_currency,
        is_fraud,
        fraud_score,
        signal_source,
    })
}

/// Join every clean record against the run's reference data.
/// Output order follows input order.
pub fn enrich(
    clean_records: Vec<CleanRecord>,
    currency_ref: &CurrencyRef,
    fraud_signals: &FraudSignals,
    precision: u32,
) -> (Vec<EnrichedRecord>, Vec<RejectRecord>) {
    let results: Vec<Result<EnrichedRecord, RejectRecord>> = clean_records
        .into_par_iter()
        .map(|record| enrich_one(record, currency_ref, fraud_signals, precision))
        .collect();

    let mut enriched = Vec::with_capacity(results.len());
    let mut rejects = Vec::new();
    for result in results {
        match result {
            Ok(record) => enriched.push(record),
            Err(reject) => rejects.push(reject),
        }
    }

    debug!(enriched = enriched.len(), rejects = rejects.len(), "enrichment finished");
    (enriched, rejects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{fields, RawRecord};
    use chrono::{TimeZone, Utc};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn clean(position: usize, id: &str, amount: &str, currency: &str) -> CleanRecord {
        CleanRecord {
            position,
            transaction_id: id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            source_account: "A1".to_string(),
            dest_account: "B1".to_string(),
            amount: dec(amount),
            currency_code: currency.to_string(),
            raw_flags: String::new(),
        }
    }

    fn currency() -> CurrencyRef {
        CurrencyRef::from_rates([("USD", dec("1")), ("EUR", dec("1.0812")), ("JPY", dec("0.006731"))])
    }

    fn signals() -> FraudSignals {
        FraudSignals::from_records(
            vec![RawRecord::new(0)
                .with_field(fields::TRANSACTION_ID, "t2")
                .with_field(fields::IS_FRAUD, "true")
                .with_field(fields::FRAUD_SCORE, "0.87")],
            "paysim",
        )
    }

    #[test]
    fn test_amount_in_base_is_exact_product() {
        let (enriched, rejects) = enrich(
            vec![clean(0, "t1", "0.10", "EUR"), clean(1, "t2", "12345.67", "JPY")],
            &currency(),
            &signals(),
            6,
        );

        assert!(rejects.is_empty());
        for record in &enriched {
            let expected = (record.clean.amount * record.exchange_rate_to_base)
                .round_dp_with_strategy(6, RoundingStrategy::MidpointNearestEven);
            assert_eq!(record.amount_in_base_currency, expected);
        }
        assert_eq!(enriched[0].amount_in_base_currency, dec("0.10812"));
        assert_eq!(enriched[1].amount_in_base_currency, dec("83.098705"));
    }

    #[test]
    fn test_unknown_currency_is_rejected_not_fatal() {
        let (enriched, rejects) = enrich(
            vec![
                clean(0, "t1", "5", "USD"),
                clean(1, "t9", "5", "ZZZ"),
                clean(2, "t3", "5", "EUR"),
            ],
            &currency(),
            &signals(),
            6,
        );

        assert_eq!(enriched.len(), 2);
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].reason, RejectReason::UnknownCurrency);
        assert_eq!(rejects[0].reason.code(), "unknown_currency");
        assert_eq!(rejects[0].stage, Stage::Enrich);
        assert_eq!(rejects[0].raw.position, 1);
        assert_eq!(rejects[0].raw.get(fields::TRANSACTION_ID), Some("t9"));
        assert!(enriched.iter().all(|r| r.clean.transaction_id != "t9"));
    }

    #[test]
    fn test_missing_fraud_signal_defaults() {
        let (enriched, _) = enrich(
            vec![clean(0, "t1", "5", "USD"), clean(1, "t2", "5", "USD")],
            &currency(),
            &signals(),
            6,
        );

        assert!(!enriched[0].is_fraud);
        assert_eq!(enriched[0].fraud_score, 0.0);
        assert_eq!(enriched[0].signal_source, None);

        assert!(enriched[1].is_fraud);
        assert_eq!(enriched[1].fraud_score, 0.87);
        assert_eq!(enriched[1].signal_source.as_deref(), Some("paysim"));
    }

    #[test]
    fn test_banker_rounding() {
        assert_eq!(convert_to_base(dec("0.125"), dec("1"), 2), Some(dec("0.12")));
        assert_eq!(convert_to_base(dec("0.135"), dec("1"), 2), Some(dec("0.14")));
        assert_eq!(convert_to_base(Decimal::MAX, dec("2"), 2), None);
    }
}
