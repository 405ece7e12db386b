// End-to-end runs over CSV + JSON + Parquet fixtures written to a temp dir.

use chrono::{DateTime, Utc};
use fraud_etl::config::LoadMode;
use fraud_etl::db::{get_manifest, get_rejects, AnalyticalStore, SqliteStore, StoreResult};
use fraud_etl::deadline::Deadline;
use fraud_etl::{
    FeatureRecord, Pipeline, PipelineConfig, RejectRecord, RunManifest, RunStatus, Stage,
    StoreError,
};
use parquet::data_type::{BoolType, ByteArray, ByteArrayType, DoubleType};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TABLE: &str = "fraud_transactions";

const TRANSACTIONS: &str = "\
Transaction ID,Timestamp,Account,Account.1,Amount Paid,Payment Currency,Payment Format
T1,2022/09/01 00:20,A1,B1,1500000.00,USD,Reinvestment
T2,2022/09/01 00:45,A1,B2,250.00,eur,Cheque
T3,2022/09/01 02:30,A1,B3,10.00,ZZZ,Wire
T4,2022/09/01 14:00,A2,B1,-5.00,USD,ACH
T5,2022/09/01 15:00,A2,B1,300.00,USD,Credit Card
T6,,A3,B1,1.00,USD,ACH
T2,2022/09/01 16:00,A1,B2,99.00,USD,Cheque
";

const CURRENCY: &str = r#"{
  "USD": {"rate": "1", "name": "US Dollar"},
  "EUR": {"rate": "1.1", "name": "Euro"}
}"#;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn write_text(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    let mut f = File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

/// PaySim-style fraud labels with amounts, so the quantile threshold applies.
fn write_fraud_parquet(dir: &Path) -> PathBuf {
    let path = dir.join("fraud_signals.parquet");
    let schema = Arc::new(
        parse_message_type(
            "message fraud {
                REQUIRED BYTE_ARRAY transaction_id (UTF8);
                REQUIRED BOOLEAN isFraud;
                REQUIRED DOUBLE fraud_score;
                REQUIRED DOUBLE amount;
            }",
        )
        .unwrap(),
    );
    let props = Arc::new(WriterProperties::builder().build());
    let mut writer = SerializedFileWriter::new(File::create(&path).unwrap(), schema, props).unwrap();

    let ids: Vec<ByteArray> = ["T2", "T5", "X1", "X2"].iter().map(|s| ByteArray::from(*s)).collect();
    let flags = [false, true, true, true];
    let scores = [0.12, 0.97, 0.88, 0.91];
    let amounts = [250.0, 300.0, 100.0, 200.0];

    let mut rg = writer.next_row_group().unwrap();
    let mut col = rg.next_column().unwrap().unwrap();
    col.typed::<ByteArrayType>().write_batch(&ids, None, None).unwrap();
    col.close().unwrap();
    let mut col = rg.next_column().unwrap().unwrap();
    col.typed::<BoolType>().write_batch(&flags, None, None).unwrap();
    col.close().unwrap();
    let mut col = rg.next_column().unwrap().unwrap();
    col.typed::<DoubleType>().write_batch(&scores, None, None).unwrap();
    col.close().unwrap();
    let mut col = rg.next_column().unwrap().unwrap();
    col.typed::<DoubleType>().write_batch(&amounts, None, None).unwrap();
    col.close().unwrap();
    rg.close().unwrap();
    writer.close().unwrap();

    path
}

fn config_toml(dir: &Path, transactions: &Path, mode: &str) -> String {
    format!(
        r#"
reject_report = "{report}"

[sources]
transactions = "{tx}"
currency = "{cur}"
fraud_signals = "{fraud}"

[schema.transactions]
transaction_id = "Transaction ID"
timestamp = "Timestamp"
source_account = "Account"
dest_account = "Account.1"
amount = "Amount Paid"
currency_code = "Payment Currency"
raw_flags = "Payment Format"

[schema.fraud_signals]
is_fraud = "isFraud"
amount = "amount"

[window]
duration = "1h"

[target]
database = "{db}"
table = "{table}"
mode = "{mode}"

[limits]
io_timeout_secs = 30
source_retries = 1
retry_delay_ms = 0
workers = 2
"#,
        report = dir.join("rejects.csv").display(),
        tx = transactions.display(),
        cur = dir.join("currency.json").display(),
        fraud = dir.join("fraud_signals.parquet").display(),
        db = dir.join("analytics.db").display(),
        table = TABLE,
        mode = mode,
    )
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        write_text(dir.path(), "transactions.csv", TRANSACTIONS);
        write_text(dir.path(), "currency.json", CURRENCY);
        write_fraud_parquet(dir.path());
        Fixture { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self, mode: &str) -> PipelineConfig {
        self.config_for(&self.path().join("transactions.csv"), mode)
    }

    fn config_for(&self, transactions: &Path, mode: &str) -> PipelineConfig {
        PipelineConfig::from_toml(&config_toml(self.path(), transactions, mode)).unwrap()
    }

    fn store(&self) -> SqliteStore {
        SqliteStore::open(&self.path().join("analytics.db"), Duration::from_secs(5)).unwrap()
    }
}

fn by_id<'a>(rows: &'a [FeatureRecord], id: &str) -> &'a FeatureRecord {
    rows.iter().find(|f| f.transaction_id() == id).unwrap()
}

#[test]
fn test_full_run_completes_with_rejects() {
    let fx = Fixture::new();
    let manifest = Pipeline::new(fx.config("replace")).unwrap().run();

    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.exit_code(), 0);
    assert_eq!(manifest.counts.extracted, 7);
    assert_eq!(manifest.counts.cleaned, 4);
    assert_eq!(manifest.counts.enriched, 3);
    assert_eq!(manifest.counts.loaded, 3);
    // No silent drops
    assert_eq!(manifest.counts.loaded + manifest.reject_count, manifest.counts.extracted);
    assert_eq!(manifest.rejects_by_reason["invalid_amount"], 1);
    assert_eq!(manifest.rejects_by_reason["missing_required_field"], 1);
    assert_eq!(manifest.rejects_by_reason["duplicate_transaction_id"], 1);
    assert_eq!(manifest.rejects_by_reason["unknown_currency"], 1);
    assert_eq!(manifest.fraud_amount_threshold, Some(dec("300")));
    assert_eq!(manifest.alert_count, 1);

    let roles: Vec<&str> = manifest.inputs.iter().map(|i| i.role.as_str()).collect();
    assert_eq!(roles, vec!["transactions", "currency", "fraud_signals"]);
    assert_eq!(manifest.inputs[2].format, "parquet");
    assert_eq!(manifest.inputs[2].rows, 4);

    let store = fx.store();
    let rows = store.query_table(TABLE).unwrap();
    assert_eq!(rows.len(), 3);

    // ZZZ was quarantined and never loaded
    assert!(rows.iter().all(|f| f.transaction_id() != "T3"));

    // No fraud signal: explicit defaults
    let t1 = by_id(&rows, "T1");
    assert!(!t1.enriched.is_fraud);
    assert_eq!(t1.enriched.fraud_score, 0.0);
    assert_eq!(t1.enriched.signal_source, None);
    assert!(t1.flags.high_amount_flag);
    assert!(t1.flags.is_night_transaction);
    assert!(t1.flags.exceeds_fraud_threshold);
    assert_eq!(t1.enriched.clean.raw_flags, "Reinvestment");

    // Currency normalised, converted at the reference rate, windowed with T1
    let t2 = by_id(&rows, "T2");
    assert_eq!(t2.enriched.clean.currency_code, "EUR");
    assert_eq!(t2.enriched.amount_in_base_currency, dec("275.00"));
    assert_eq!(t2.enriched.fraud_score, 0.12);
    assert_eq!(t2.window.txn_count, 2);
    assert_eq!(t2.window.amount_sum, dec("1500275"));
    assert!(t2.window.cross_currency);
    assert_eq!(t2.window.seconds_since_prev, Some(1500));

    let t5 = by_id(&rows, "T5");
    assert!(t5.enriched.is_fraud);
    assert_eq!(t5.enriched.signal_source.as_deref(), Some("fraud_signals"));
    assert_eq!(t5.window.txn_count, 1);
    assert!(!t5.flags.exceeds_fraud_threshold);

    // Audit trail
    let persisted = get_manifest(store.connection(), &manifest.run_id).unwrap().unwrap();
    assert_eq!(persisted, manifest);
    let rejects = get_rejects(store.connection(), &manifest.run_id).unwrap();
    assert_eq!(rejects.len(), 4);
    let zzz = rejects.iter().find(|r| r.stage == Stage::Enrich).unwrap();
    assert_eq!(zzz.reason.code(), "unknown_currency");
    assert_eq!(zzz.raw.position, 2);

    let report = std::fs::read_to_string(fx.path().join("rejects.csv")).unwrap();
    assert_eq!(report.lines().count(), 5);
    assert!(report.contains("unknown_currency"));
}

#[test]
fn test_reruns_are_deterministic() {
    let fx = Fixture::new();
    let first = Pipeline::new(fx.config("replace")).unwrap().run();
    let rows_first = fx.store().query_table(TABLE).unwrap();

    let second = Pipeline::new(fx.config("replace")).unwrap().run();
    let rows_second = fx.store().query_table(TABLE).unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(rows_first, rows_second);
    assert_eq!(first.inputs, second.inputs);
}

#[test]
fn test_schema_mismatch_fails_and_leaves_table() {
    let fx = Fixture::new();
    Pipeline::new(fx.config("replace")).unwrap().run();
    let before = fx.store().query_table(TABLE).unwrap();

    let renamed = write_text(
        fx.path(),
        "renamed.csv",
        "Transaction ID,Timestamp,Account,Account.1,Amount,Payment Currency\n\
         N1,2022/09/02 10:00,A9,B9,1.00,USD\n",
    );
    let manifest = Pipeline::new(fx.config_for(&renamed, "replace")).unwrap().run();

    assert_eq!(manifest.status, RunStatus::Failed);
    assert_eq!(manifest.exit_code(), 1);
    assert_eq!(manifest.failed_stage, Some(Stage::Extract));
    assert_eq!(manifest.error_kind.as_deref(), Some("SchemaMismatchError"));
    assert!(manifest.error_message.as_deref().unwrap().contains("Amount Paid"));
    assert_eq!(fx.store().query_table(TABLE).unwrap(), before);
}

#[test]
fn test_append_mode_accumulates_and_refuses_duplicates() {
    let fx = Fixture::new();
    let first = Pipeline::new(fx.config("append")).unwrap().run();
    assert_eq!(first.status, RunStatus::Completed);

    let more = write_text(
        fx.path(),
        "more.csv",
        "Transaction ID,Timestamp,Account,Account.1,Amount Paid,Payment Currency,Payment Format\n\
         T7,2022/09/02 10:00,A1,B9,12.00,USD,ACH\n",
    );
    let second = Pipeline::new(fx.config_for(&more, "append")).unwrap().run();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.mode, LoadMode::Append);
    assert_eq!(fx.store().query_table(TABLE).unwrap().len(), 4);

    // Same ids again: the whole load is refused
    let again = Pipeline::new(fx.config("append")).unwrap().run();
    assert_eq!(again.status, RunStatus::Failed);
    assert_eq!(again.failed_stage, Some(Stage::Load));
    assert_eq!(again.error_kind.as_deref(), Some("LoadFailedError"));
    assert_eq!(fx.store().query_table(TABLE).unwrap().len(), 4);
}

/// Delegates to SQLite but loses the connection right before the swap.
struct OutageStore {
    inner: SqliteStore,
}

impl AnalyticalStore for OutageStore {
    fn begin(&mut self) -> StoreResult<()> {
        self.inner.begin()
    }
    fn commit(&mut self) -> StoreResult<()> {
        self.inner.commit()
    }
    fn rollback(&mut self) -> StoreResult<()> {
        self.inner.rollback()
    }
    fn set_deadline(&mut self, deadline: Option<Deadline>) {
        self.inner.set_deadline(deadline)
    }
    fn table_exists(&self, table: &str) -> StoreResult<bool> {
        self.inner.table_exists(table)
    }
    fn table_version(&self, table: &str) -> StoreResult<Option<i64>> {
        self.inner.table_version(table)
    }
    fn create_or_replace_table(&mut self, table: &str) -> StoreResult<()> {
        self.inner.create_or_replace_table(table)
    }
    fn append_rows(&mut self, table: &str, run_id: &str, rows: &[FeatureRecord]) -> StoreResult<usize> {
        self.inner.append_rows(table, run_id, rows)
    }
    fn swap_in(&mut self, _: &str, _: &str, _: LoadMode, _: &str) -> StoreResult<usize> {
        Err(StoreError::Unavailable("server closed the connection".to_string()))
    }
    fn query_table(&self, table: &str) -> StoreResult<Vec<FeatureRecord>> {
        self.inner.query_table(table)
    }
    fn query_account_range(
        &self,
        table: &str,
        account: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<FeatureRecord>> {
        self.inner.query_account_range(table, account, from, to)
    }
    fn count_alerts(&self, table: &str) -> StoreResult<usize> {
        self.inner.count_alerts(table)
    }
    fn record_run(&mut self, manifest: &RunManifest, rejects: &[RejectRecord]) -> StoreResult<()> {
        self.inner.record_run(manifest, rejects)
    }
}

#[test]
fn test_store_outage_keeps_pre_run_state() {
    let fx = Fixture::new();
    Pipeline::new(fx.config("replace")).unwrap().run();
    let before = fx.store().query_table(TABLE).unwrap();
    assert_eq!(before.len(), 3);

    let more = write_text(
        fx.path(),
        "more.csv",
        "Transaction ID,Timestamp,Account,Account.1,Amount Paid,Payment Currency,Payment Format\n\
         T8,2022/09/03 10:00,A4,B9,12.00,USD,ACH\n",
    );
    let mut store = OutageStore { inner: fx.store() };
    let manifest = Pipeline::new(fx.config_for(&more, "replace"))
        .unwrap()
        .run_with_store(&mut store);

    assert_eq!(manifest.status, RunStatus::Failed);
    assert_eq!(manifest.failed_stage, Some(Stage::Load));
    assert_eq!(manifest.error_kind.as_deref(), Some("LoadFailedError"));
    assert_eq!(manifest.counts.loaded, 0);

    // A separate connection sees exactly the previous load
    assert_eq!(fx.store().query_table(TABLE).unwrap(), before);
    assert!(get_manifest(fx.store().connection(), &manifest.run_id).unwrap().is_some());
}

#[test]
fn test_account_range_query_after_load() {
    let fx = Fixture::new();
    Pipeline::new(fx.config("replace")).unwrap().run();
    let store = fx.store();

    let from = DateTime::parse_from_rfc3339("2022-09-01T00:00:00Z").unwrap().with_timezone(&Utc);
    let to = DateTime::parse_from_rfc3339("2022-09-01T00:30:00Z").unwrap().with_timezone(&Utc);
    let rows = store.query_account_range(TABLE, "A1", from, to).unwrap();

    let ids: Vec<&str> = rows.iter().map(|f| f.transaction_id()).collect();
    assert_eq!(ids, vec!["T1"]);
    assert_eq!(store.count_alerts(TABLE).unwrap(), 1);
}
