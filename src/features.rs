// 📈 Feature Stage
// Per-account trailing-window aggregates and AML risk flags.
//
// The window for a record at time t is (t - window, t]: same-instant records
// count, later ones never do. Records are ordered by (timestamp, transaction_id)
// inside an account, so results depend only on the data, not on arrival order.

use crate::config::{FlagConfig, WindowSpec};
use crate::records::{EnrichedRecord, FeatureRecord, RiskFlags, WindowAggregates};
use chrono::Timelike;
use rayon::prelude::*;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Thresholds for the risk flags, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct RiskSettings {
    pub flags: FlagConfig,
    /// Quantile of confirmed-fraud amounts; None disables the cross-reference flag
    pub fraud_amount_threshold: Option<Decimal>,
}

impl RiskSettings {
    pub fn flags_for(&self, record: &EnrichedRecord) -> RiskFlags {
        let hour = record.clean.timestamp.hour();
        let high_amount_flag = record.amount_in_base_currency > self.flags.high_amount_threshold;
        let exceeds_fraud_threshold = self
            .fraud_amount_threshold
            .map(|t| record.amount_in_base_currency > t)
            .unwrap_or(false);

        RiskFlags {
            hour,
            is_night_transaction: self.flags.is_night(hour),
            high_amount_flag,
            aml_alert_flag: high_amount_flag,
            exceeds_fraud_threshold,
        }
    }
}

/// Sliding-window aggregates for one account's records, already sorted.
fn window_aggregates(sorted: &[&EnrichedRecord], window: &WindowSpec) -> Vec<WindowAggregates> {
    let n = sorted.len();
    let mut out = Vec::with_capacity(n);

    let mut lo = 0;
    let mut end = 0;
    let mut sum = Decimal::ZERO;
    let mut currencies: HashMap<&str, usize> = HashMap::new();

    for i in 0..n {
        let ts = sorted[i].clean.timestamp;

        // Pull in everything up to and including this instant
        while end < n && sorted[end].clean.timestamp <= ts {
            sum += sorted[end].amount_in_base_currency;
            *currencies.entry(sorted[end].clean.currency_code.as_str()).or_insert(0) += 1;
            end += 1;
        }

        // Drop everything at or before the window's open lower bound.
        // A window reaching past the earliest representable instant has none.
        let floor = ts.checked_sub_signed(window.duration());
        while lo < end && floor.map_or(false, |f| sorted[lo].clean.timestamp <= f) {
            sum -= sorted[lo].amount_in_base_currency;
            let code = sorted[lo].clean.currency_code.as_str();
            if let Some(count) = currencies.get_mut(code) {
                *count -= 1;
                if *count == 0 {
                    currencies.remove(code);
                }
            }
            lo += 1;
        }

        let seconds_since_prev = if i > lo {
            Some((ts - sorted[i - 1].clean.timestamp).num_seconds())
        } else {
            None
        };

        out.push(WindowAggregates {
            txn_count: (end - lo) as u64,
            amount_sum: sum.normalize(),
            distinct_currencies: currencies.len() as u32,
            cross_currency: currencies.len() > 1,
            seconds_since_prev,
        });
    }

    out
}

/// Attach windowed aggregates and risk flags to every record, keeping input order.
pub fn compute_features(
    enriched_records: Vec<EnrichedRecord>,
    window_spec: &WindowSpec,
    risk: &RiskSettings,
) -> Vec<FeatureRecord> {
    let mut by_account: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, record) in enriched_records.iter().enumerate() {
        by_account
            .entry(record.clean.source_account.as_str())
            .or_default()
            .push(idx);
    }
    let accounts = by_account.len();

    let computed: Vec<Vec<(usize, WindowAggregates)>> = by_account
        .into_par_iter()
        .map(|(_, mut indices)| {
            indices.sort_by(|&a, &b| {
                let ra = &enriched_records[a].clean;
                let rb = &enriched_records[b].clean;
                ra.timestamp
                    .cmp(&rb.timestamp)
                    .then_with(|| ra.transaction_id.cmp(&rb.transaction_id))
            });
            let sorted: Vec<&EnrichedRecord> =
                indices.iter().map(|&i| &enriched_records[i]).collect();
            indices
                .into_iter()
                .zip(window_aggregates(&sorted, window_spec))
                .collect()
        })
        .collect();

    let mut slots: Vec<Option<WindowAggregates>> = vec![None; enriched_records.len()];
    for (idx, aggregates) in computed.into_iter().flatten() {
        slots[idx] = Some(aggregates);
    }

    let features: Vec<FeatureRecord> = enriched_records
        .into_iter()
        .zip(slots)
        .filter_map(|(enriched, window)| {
            let flags = risk.flags_for(&enriched);
            window.map(|window| FeatureRecord {
                enriched,
                window,
                flags,
            })
        })
        .collect();

    debug!(records = features.len(), accounts, "features computed");
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::CleanRecord;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn record(
        position: usize,
        id: &str,
        account: &str,
        ts: DateTime<Utc>,
        amount: &str,
        currency: &str,
    ) -> EnrichedRecord {
        EnrichedRecord {
            clean: CleanRecord {
                position,
                transaction_id: id.to_string(),
                timestamp: ts,
                source_account: account.to_string(),
                dest_account: "X".to_string(),
                amount: dec(amount),
                currency_code: currency.to_string(),
                raw_flags: String::new(),
            },
            exchange_rate_to_base: Decimal::ONE,
            amount_in_base_currency: dec(amount),
            is_fraud: false,
            fraud_score: 0.0,
            signal_source: None,
        }
    }

    fn risk() -> RiskSettings {
        RiskSettings {
            flags: FlagConfig::default(),
            fraud_amount_threshold: None,
        }
    }

    fn hour_window() -> WindowSpec {
        WindowSpec::try_new(Duration::hours(1)).unwrap()
    }

    fn by_id(features: &[FeatureRecord]) -> HashMap<String, FeatureRecord> {
        features
            .iter()
            .map(|f| (f.transaction_id().to_string(), f.clone()))
            .collect()
    }

    #[test]
    fn test_window_bounds_include_nearby_exclude_far() {
        let records = vec![
            record(0, "a", "A1", t0(), "10", "USD"),
            record(1, "b", "A1", t0() + Duration::minutes(30), "20", "USD"),
            record(2, "c", "A1", t0() + Duration::hours(2), "40", "USD"),
        ];

        let features = by_id(&compute_features(records, &hour_window(), &risk()));

        // First sees only itself: nothing from the future
        assert_eq!(features["a"].window.txn_count, 1);
        assert_eq!(features["a"].window.amount_sum, dec("10"));
        // Second sees the first, 30 minutes earlier
        assert_eq!(features["b"].window.txn_count, 2);
        assert_eq!(features["b"].window.amount_sum, dec("30"));
        assert_eq!(features["b"].window.seconds_since_prev, Some(1800));
        // Third is 90 minutes after the second: alone
        assert_eq!(features["c"].window.txn_count, 1);
        assert_eq!(features["c"].window.seconds_since_prev, None);
    }

    #[test]
    fn test_window_lower_bound_is_open() {
        let records = vec![
            record(0, "a", "A1", t0(), "1", "USD"),
            record(1, "b", "A1", t0() + Duration::hours(1), "1", "USD"),
        ];

        let features = by_id(&compute_features(records, &hour_window(), &risk()));

        // Exactly one window-length apart: excluded
        assert_eq!(features["b"].window.txn_count, 1);
    }

    #[test]
    fn test_same_instant_records_see_each_other() {
        let records = vec![
            record(0, "b", "A1", t0(), "5", "USD"),
            record(1, "a", "A1", t0(), "7", "EUR"),
        ];

        let features = by_id(&compute_features(records, &hour_window(), &risk()));

        assert_eq!(features["a"].window.txn_count, 2);
        assert_eq!(features["b"].window.txn_count, 2);
        assert!(features["a"].window.cross_currency);
        assert_eq!(features["a"].window.distinct_currencies, 2);
        // Tie broken by transaction_id: "a" comes before "b"
        assert_eq!(features["a"].window.seconds_since_prev, None);
        assert_eq!(features["b"].window.seconds_since_prev, Some(0));
    }

    #[test]
    fn test_accounts_are_independent() {
        let records = vec![
            record(0, "a", "A1", t0(), "5", "USD"),
            record(1, "b", "A2", t0() + Duration::minutes(1), "5", "USD"),
        ];

        let features = by_id(&compute_features(records, &hour_window(), &risk()));
        assert_eq!(features["b"].window.txn_count, 1);
    }

    #[test]
    fn test_output_keeps_input_order() {
        let records = vec![
            record(0, "late", "A1", t0() + Duration::minutes(50), "1", "USD"),
            record(1, "early", "A1", t0(), "1", "USD"),
            record(2, "other", "B1", t0(), "1", "USD"),
        ];

        let features = compute_features(records, &hour_window(), &risk());
        let ids: Vec<&str> = features.iter().map(|f| f.transaction_id()).collect();
        assert_eq!(ids, vec!["late", "early", "other"]);
    }

    #[test]
    fn test_order_independent_and_deterministic() {
        let mut records = Vec::new();
        for i in 0..60 {
            let account = ["A1", "A2", "A3"][i % 3];
            let currency = if i % 4 == 0 { "EUR" } else { "USD" };
            let ts = t0() + Duration::minutes((i as i64 * 17) % 180);
            records.push(record(
                i,
                &format!("t{:02}", i),
                account,
                ts,
                &format!("{}.{:02}", i, i),
                currency,
            ));
        }

        let forward = by_id(&compute_features(records.clone(), &hour_window(), &risk()));

        let mut reversed = records.clone();
        reversed.reverse();
        let backward = by_id(&compute_features(reversed, &hour_window(), &risk()));

        let mut rotated = records.clone();
        rotated.rotate_left(23);
        let rotated = by_id(&compute_features(rotated, &hour_window(), &risk()));

        let again = by_id(&compute_features(records, &hour_window(), &risk()));

        for (id, f) in &forward {
            assert_eq!(f.window, backward[id].window, "reverse order changed {}", id);
            assert_eq!(f.window, rotated[id].window, "rotation changed {}", id);
            assert_eq!(f.window, again[id].window, "rerun changed {}", id);
            assert_eq!(
                f.window.amount_sum.to_string(),
                backward[id].window.amount_sum.to_string()
            );
        }
    }

    #[test]
    fn test_window_longer_than_timestamp_range() {
        let records = vec![
            record(0, "a", "A1", t0(), "10", "USD"),
            record(1, "b", "A1", t0() + Duration::days(400), "20", "USD"),
        ];
        let window: WindowSpec = "200000000d".parse().unwrap();
        let features = by_id(&compute_features(records, &window, &risk()));

        assert_eq!(features["a"].window.txn_count, 1);
        assert_eq!(features["b"].window.txn_count, 2);
        assert_eq!(features["b"].window.amount_sum, dec("30"));
    }

    #[test]
    fn test_risk_flags() {
        let settings = RiskSettings {
            flags: FlagConfig {
                high_amount_threshold: dec("1000"),
                ..FlagConfig::default()
            },
            fraud_amount_threshold: Some(dec("500")),
        };

        let night = record(0, "n", "A1", Utc.with_ymd_and_hms(2024, 5, 1, 23, 30, 0).unwrap(), "600", "USD");
        let day = record(1, "d", "A1", Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap(), "1000.01", "USD");
        let small = record(2, "s", "A1", Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap(), "10", "USD");

        let n = settings.flags_for(&night);
        assert_eq!(n.hour, 23);
        assert!(n.is_night_transaction);
        assert!(!n.high_amount_flag);
        assert!(n.exceeds_fraud_threshold);
        assert!(n.is_alert());

        let d = settings.flags_for(&day);
        assert!(!d.is_night_transaction);
        assert!(d.high_amount_flag);
        assert!(d.aml_alert_flag);

        let s = settings.flags_for(&small);
        assert!(!s.is_night_transaction);
        assert!(!s.is_alert());

        let no_threshold = risk().flags_for(&night);
        assert!(!no_threshold.exceeds_fraud_threshold);
    }
}
