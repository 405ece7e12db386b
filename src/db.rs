// 🗄️ Analytical Store
// Table-oriented write/query interface the Load stage depends on, plus the
// SQLite implementation, run manifest history and the quarantine table.

use crate::config::{is_valid_table_name, LoadMode};
use crate::deadline::Deadline;
use crate::error::StoreError;
use crate::manifest::RunManifest;
use crate::records::{
    format_timestamp, CleanRecord, EnrichedRecord, FeatureRecord, RawRecord, RejectRecord,
    RiskFlags, Stage, WindowAggregates, RejectReason,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Version of the feature table layout written by this crate.
pub const SCHEMA_VERSION: i64 = 1;

const STAGING_SUFFIX: &str = "__staging";
const ALERTS_SUFFIX: &str = "_high_risk_alerts";

pub fn staging_name(table: &str) -> String {
    format!("{}{}", table, STAGING_SUFFIX)
}

pub fn alerts_view_name(table: &str) -> String {
    format!("{}{}", table, ALERTS_SUFFIX)
}

/// Quote a table name for interpolation, refusing anything that is not a plain identifier.
fn ident(name: &str) -> StoreResult<String> {
    let base = name
        .strip_suffix(STAGING_SUFFIX)
        .or_else(|| name.strip_suffix(ALERTS_SUFFIX))
        .unwrap_or(name);
    if !is_valid_table_name(base) {
        return Err(StoreError::InvalidTable(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

// ============================================================================
// STORE INTERFACE
// ============================================================================

/// What the pipeline needs from an analytical store.
///
/// Writes happen between `begin` and `commit`; a reader on another connection
/// sees either the state before `begin` or the state after `commit`.
pub trait AnalyticalStore: Send {
    fn begin(&mut self) -> StoreResult<()>;
    fn commit(&mut self) -> StoreResult<()>;
    fn rollback(&mut self) -> StoreResult<()>;

    /// Statements still running when the deadline passes are interrupted.
    fn set_deadline(&mut self, deadline: Option<Deadline>);

    fn table_exists(&self, table: &str) -> StoreResult<bool>;
    fn table_version(&self, table: &str) -> StoreResult<Option<i64>>;

    /// Drop `table` if present and create it empty with the feature layout.
    fn create_or_replace_table(&mut self, table: &str) -> StoreResult<()>;
    fn append_rows(&mut self, table: &str, run_id: &str, rows: &[FeatureRecord]) -> StoreResult<usize>;
    /// Move staging rows into `table`, replacing or appending, and refresh
    /// indexes, the alerts view and the version entry. Returns rows moved.
    fn swap_in(&mut self, staging: &str, table: &str, mode: LoadMode, run_id: &str) -> StoreResult<usize>;

    fn query_table(&self, table: &str) -> StoreResult<Vec<FeatureRecord>>;
    fn query_account_range(
        &self,
        table: &str,
        account: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<FeatureRecord>>;
    fn count_alerts(&self, table: &str) -> StoreResult<usize>;

    /// Persist the finished manifest and its quarantine in one transaction.
    fn record_run(&mut self, manifest: &RunManifest, rejects: &[RejectRecord]) -> StoreResult<()>;
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // Enable WAL mode so readers keep the pre-load snapshot during a swap
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS etl_table_versions (
            table_name TEXT PRIMARY KEY,
            schema_version INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            last_run_id TEXT NOT NULL
        )",
        [],
    )?;

    // Append-only run history
    conn.execute(
        "CREATE TABLE IF NOT EXISTS run_manifests (
            run_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL,
            target_table TEXT NOT NULL,
            failed_stage TEXT,
            error_kind TEXT,
            reject_count INTEGER NOT NULL,
            manifest TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quarantine (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            stage TEXT NOT NULL,
            reason TEXT NOT NULL,
            detail TEXT NOT NULL,
            raw TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quarantine_run ON quarantine(run_id, position)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_run_manifests_started ON run_manifests(started_at)",
        [],
    )?;

    Ok(())
}

fn feature_table_ddl(quoted: &str) -> String {
    format!(
        "CREATE TABLE {} (
            transaction_id TEXT PRIMARY KEY,
            source_position INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            source_account TEXT NOT NULL,
            dest_account TEXT NOT NULL,
            amount TEXT NOT NULL,
            currency_code TEXT NOT NULL,
            raw_flags TEXT NOT NULL,
            exchange_rate_to_base TEXT NOT NULL,
            amount_in_base_currency TEXT NOT NULL,
            is_fraud INTEGER NOT NULL,
            fraud_score REAL NOT NULL,
            signal_source TEXT,
            window_txn_count INTEGER NOT NULL,
            window_amount_sum TEXT NOT NULL,
            window_distinct_currencies INTEGER NOT NULL,
            cross_currency_flag INTEGER NOT NULL,
            seconds_since_prev_txn INTEGER,
            hour INTEGER NOT NULL,
            is_night_transaction INTEGER NOT NULL,
            high_amount_flag INTEGER NOT NULL,
            aml_alert_flag INTEGER NOT NULL,
            exceeds_fraud_threshold INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            loaded_at TEXT NOT NULL
        )",
        quoted
    )
}

const FEATURE_COLUMNS: &str = "transaction_id, source_position, timestamp, source_account, \
    dest_account, amount, currency_code, raw_flags, exchange_rate_to_base, \
    amount_in_base_currency, is_fraud, fraud_score, signal_source, window_txn_count, \
    window_amount_sum, window_distinct_currencies, cross_currency_flag, \
    seconds_since_prev_txn, hour, is_night_transaction, high_amount_flag, aml_alert_flag, \
    exceeds_fraud_threshold, run_id, loaded_at";

// ============================================================================
// ROW MAPPING
// ============================================================================

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn decimal_at(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn feature_from_row(row: &Row) -> rusqlite::Result<FeatureRecord> {
    let position: i64 = row.get(1)?;
    let txn_count: i64 = row.get(13)?;
    let distinct: i64 = row.get(15)?;
    let hour: i64 = row.get(18)?;

    let clean = CleanRecord {
        position: position as usize,
        transaction_id: row.get(0)?,
        timestamp: timestamp_at(row, 2)?,
        source_account: row.get(3)?,
        dest_account: row.get(4)?,
        amount: decimal_at(row, 5)?,
        currency_code: row.get(6)?,
        raw_flags: row.get(7)?,
    };

    Ok(FeatureRecord {
        enriched: EnrichedRecord {
            clean,
            exchange_rate_to_base: decimal_at(row, 8)?,
            amount_in_base_currency: decimal_at(row, 9)?,
            is_fraud: row.get(10)?,
            fraud_score: row.get(11)?,
            signal_source: row.get(12)?,
        },
        window: WindowAggregates {
            txn_count: txn_count as u64,
            amount_sum: decimal_at(row, 14)?,
            distinct_currencies: distinct as u32,
            cross_currency: row.get(16)?,
            seconds_since_prev: row.get(17)?,
        },
        flags: RiskFlags {
            hour: hour as u32,
            is_night_transaction: row.get(19)?,
            high_amount_flag: row.get(20)?,
            aml_alert_flag: row.get(21)?,
            exceeds_fraud_threshold: row.get(22)?,
        },
    })
}

fn insert_features(
    conn: &Connection,
    quoted: &str,
    run_id: &str,
    rows: &[FeatureRecord],
) -> rusqlite::Result<usize> {
    let loaded_at = format_timestamp(&Utc::now());
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, \
         ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
        quoted, FEATURE_COLUMNS
    ))?;

    for f in rows {
        let e = &f.enriched;
        let c = &e.clean;
        stmt.execute(params![
            c.transaction_id,
            c.position as i64,
            format_timestamp(&c.timestamp),
            c.source_account,
            c.dest_account,
            c.amount.to_string(),
            c.currency_code,
            c.raw_flags,
            e.exchange_rate_to_base.to_string(),
            e.amount_in_base_currency.to_string(),
            e.is_fraud,
            e.fraud_score,
            e.signal_source,
            f.window.txn_count as i64,
            f.window.amount_sum.to_string(),
            f.window.distinct_currencies as i64,
            f.window.cross_currency,
            f.window.seconds_since_prev,
            f.flags.hour as i64,
            f.flags.is_night_transaction,
            f.flags.high_amount_flag,
            f.flags.aml_alert_flag,
            f.flags.exceeds_fraud_threshold,
            run_id,
            loaded_at,
        ])?;
    }

    Ok(rows.len())
}

// ============================================================================
// READ QUERIES (shared by the store, CLI and audit API)
// ============================================================================

pub fn query_table(conn: &Connection, table: &str) -> StoreResult<Vec<FeatureRecord>> {
    let quoted = ident(table)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} ORDER BY rowid",
        FEATURE_COLUMNS, quoted
    ))?;
    let rows = stmt
        .query_map([], feature_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Records for one account with `from <= timestamp <= to`, oldest first.
pub fn query_account_range(
    conn: &Connection,
    table: &str,
    account: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> StoreResult<Vec<FeatureRecord>> {
    let quoted = ident(table)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {}
         WHERE source_account = ?1 AND timestamp >= ?2 AND timestamp <= ?3
         ORDER BY timestamp, transaction_id",
        FEATURE_COLUMNS, quoted
    ))?;
    let rows = stmt
        .query_map(
            params![account, format_timestamp(&from), format_timestamp(&to)],
            feature_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Highest-value alerts first.
pub fn query_alerts(conn: &Connection, table: &str, limit: usize) -> StoreResult<Vec<FeatureRecord>> {
    let view = ident(&alerts_view_name(table))?;
    let mut stmt = conn.prepare(&format!("SELECT {} FROM {} LIMIT ?1", FEATURE_COLUMNS, view))?;
    let rows = stmt
        .query_map(params![limit as i64], feature_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_alerts(conn: &Connection, table: &str) -> StoreResult<usize> {
    let view = ident(&alerts_view_name(table))?;
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", view), [], |row| row.get(0))?;
    Ok(count as usize)
}

pub fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn table_version(conn: &Connection, table: &str) -> StoreResult<Option<i64>> {
    let version = conn
        .query_row(
            "SELECT schema_version FROM etl_table_versions WHERE table_name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

// ============================================================================
// RUN HISTORY & QUARANTINE
// ============================================================================

/// Insert a finished manifest. Run history is append-only: a run_id is written once.
pub fn insert_manifest(conn: &Connection, manifest: &RunManifest) -> StoreResult<()> {
    let json = serde_json::to_string(manifest)?;
    conn.execute(
        "INSERT INTO run_manifests (
            run_id, started_at, finished_at, status, target_table,
            failed_stage, error_kind, reject_count, manifest
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            manifest.run_id,
            format_timestamp(&manifest.started_at),
            manifest.finished_at.as_ref().map(format_timestamp),
            manifest.status.name(),
            manifest.target_table,
            manifest.failed_stage.map(|s| s.name()),
            manifest.error_kind,
            manifest.reject_count as i64,
            json,
        ],
    )?;
    Ok(())
}

pub fn insert_rejects(conn: &Connection, run_id: &str, rejects: &[RejectRecord]) -> StoreResult<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO quarantine (run_id, position, stage, reason, detail, raw)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for reject in rejects {
        let raw = serde_json::to_string(&reject.raw.fields)?;
        stmt.execute(params![
            run_id,
            reject.raw.position as i64,
            reject.stage.name(),
            reject.reason.code(),
            reject.detail,
            raw,
        ])?;
    }
    Ok(rejects.len())
}

pub fn get_manifest(conn: &Connection, run_id: &str) -> StoreResult<Option<RunManifest>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT manifest FROM run_manifests WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Most recent runs first.
pub fn list_manifests(conn: &Connection, limit: usize) -> StoreResult<Vec<RunManifest>> {
    let mut stmt = conn.prepare(
        "SELECT manifest FROM run_manifests ORDER BY started_at DESC, created_at DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut manifests = Vec::with_capacity(rows.len());
    for json in rows {
        manifests.push(serde_json::from_str(&json)?);
    }
    Ok(manifests)
}

pub fn get_rejects(conn: &Connection, run_id: &str) -> StoreResult<Vec<RejectRecord>> {
    let mut stmt = conn.prepare(
        "SELECT position, stage, reason, detail, raw FROM quarantine
         WHERE run_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![run_id], |row| {
            let position: i64 = row.get(0)?;
            let stage: String = row.get(1)?;
            let reason: String = row.get(2)?;
            let detail: String = row.get(3)?;
            let raw: String = row.get(4)?;
            Ok((position, stage, reason, detail, raw))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut rejects = Vec::with_capacity(rows.len());
    for (position, stage, reason, detail, raw) in rows {
        let stage = Stage::parse(&stage)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown stage '{}' in quarantine", stage)))?;
        let reason = RejectReason::parse(&reason)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown reason '{}' in quarantine", reason)))?;
        let raw = RawRecord {
            position: position as usize,
            fields: serde_json::from_str(&raw)?,
        };
        rejects.push(RejectRecord::new(raw, stage, reason, detail));
    }
    Ok(rejects)
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore {
    conn: Connection,
    busy_timeout: Duration,
    deadline: Option<Deadline>,
}

impl SqliteStore {
    /// Open (or create) the database file. Lock waits give up after `busy_timeout`.
    pub fn open(path: &Path, busy_timeout: Duration) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        Self::from_connection(conn, busy_timeout)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, Duration::from_secs(5))
    }

    pub fn from_connection(conn: Connection, busy_timeout: Duration) -> StoreResult<Self> {
        conn.busy_timeout(busy_timeout)?;
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn,
            busy_timeout,
            deadline: None,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Lock waits and interrupted statements surface as timeouts.
    fn classify(&self, e: StoreError) -> StoreError {
        match &e {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::OperationInterrupted | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                let budget = self
                    .deadline
                    .map(|d| d.budget())
                    .unwrap_or(self.busy_timeout);
                StoreError::Timeout(budget)
            }
            _ => e,
        }
    }

    fn run<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        f(&self.conn).map_err(|e| self.classify(e))
    }

    fn refresh_alerts_view(conn: &Connection, table: &str) -> StoreResult<()> {
        let quoted = ident(table)?;
        let view = ident(&alerts_view_name(table))?;
        conn.execute_batch(&format!(
            "DROP VIEW IF EXISTS {view};
             CREATE VIEW {view} AS
                SELECT * FROM {quoted}
                WHERE aml_alert_flag = 1 OR exceeds_fraud_threshold = 1
                ORDER BY CAST(amount_in_base_currency AS REAL) DESC, transaction_id;",
        ))?;
        Ok(())
    }
}

impl AnalyticalStore for SqliteStore {
    fn begin(&mut self) -> StoreResult<()> {
        self.run(|conn| Ok(conn.execute_batch("BEGIN IMMEDIATE")?))
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.run(|conn| Ok(conn.execute_batch("COMMIT")?))
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.run(|conn| Ok(conn.execute_batch("ROLLBACK")?))
    }

    fn set_deadline(&mut self, deadline: Option<Deadline>) {
        self.deadline = deadline;
        match deadline {
            Some(d) => self.conn.progress_handler(1_000, Some(move || d.expired())),
            None => self.conn.progress_handler(0, None::<fn() -> bool>),
        }
    }

    fn table_exists(&self, table: &str) -> StoreResult<bool> {
        self.run(|conn| table_exists(conn, table))
    }

    fn table_version(&self, table: &str) -> StoreResult<Option<i64>> {
        self.run(|conn| table_version(conn, table))
    }

    fn create_or_replace_table(&mut self, table: &str) -> StoreResult<()> {
        let quoted = ident(table)?;
        self.run(|conn| {
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {q}; {ddl};",
                q = quoted,
                ddl = feature_table_ddl(&quoted)
            ))?;
            Ok(())
        })
    }

    fn append_rows(&mut self, table: &str, run_id: &str, rows: &[FeatureRecord]) -> StoreResult<usize> {
        let quoted = ident(table)?;
        self.run(|conn| Ok(insert_features(conn, &quoted, run_id, rows)?))
    }

    fn swap_in(&mut self, staging: &str, table: &str, mode: LoadMode, run_id: &str) -> StoreResult<usize> {
        let staged = ident(staging)?;
        let target = ident(table)?;
        let view = ident(&alerts_view_name(table))?;

        self.run(|conn| {
            let moved: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", staged), [], |row| row.get(0))?;
            let exists = table_exists(conn, table)?;

            if mode == LoadMode::Append && exists {
                if let Some(found) = table_version(conn, table)? {
                    if found != SCHEMA_VERSION {
                        return Err(StoreError::SchemaVersion {
                            table: table.to_string(),
                            found,
                            expected: SCHEMA_VERSION,
                        });
                    }
                }
                conn.execute_batch(&format!(
                    "INSERT INTO {t} ({cols}) SELECT {cols} FROM {s}; DROP TABLE {s};",
                    t = target,
                    s = staged,
                    cols = FEATURE_COLUMNS
                ))?;
            } else {
                conn.execute_batch(&format!(
                    "DROP VIEW IF EXISTS {view};
                     DROP TABLE IF EXISTS {t};
                     ALTER TABLE {s} RENAME TO {t};",
                    view = view,
                    t = target,
                    s = staged
                ))?;
            }

            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{}_account_ts\" ON {} (source_account, timestamp)",
                    table, target
                ),
                [],
            )?;
            Self::refresh_alerts_view(conn, table)?;

            conn.execute(
                "INSERT INTO etl_table_versions (table_name, schema_version, updated_at, last_run_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(table_name) DO UPDATE SET
                    schema_version = excluded.schema_version,
                    updated_at = excluded.updated_at,
                    last_run_id = excluded.last_run_id",
                params![table, SCHEMA_VERSION, format_timestamp(&Utc::now()), run_id],
            )?;

            debug!(table, mode = mode.name(), rows = moved, "staging swapped in");
            Ok(moved as usize)
        })
    }

    fn query_table(&self, table: &str) -> StoreResult<Vec<FeatureRecord>> {
        self.run(|conn| query_table(conn, table))
    }

    fn query_account_range(
        &self,
        table: &str,
        account: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<FeatureRecord>> {
        self.run(|conn| query_account_range(conn, table, account, from, to))
    }

    fn count_alerts(&self, table: &str) -> StoreResult<usize> {
        self.run(|conn| count_alerts(conn, table))
    }

    fn record_run(&mut self, manifest: &RunManifest, rejects: &[RejectRecord]) -> StoreResult<()> {
        self.begin()?;
        let written = self.run(|conn| {
            insert_manifest(conn, manifest)?;
            insert_rejects(conn, &manifest.run_id, rejects)?;
            Ok(())
        });
        match written {
            Ok(()) => self.commit(),
            Err(e) => {
                let _ = self.rollback();
                Err(e)
            }
        }
    }
}
