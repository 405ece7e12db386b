// ⚙️ Pipeline Configuration
// Loaded from TOML. Only [sources] is required; every other section falls
// back to defaults matching the column names the pipeline uses internally.

use crate::error::{PipelineError, Result};
use crate::records::fields;
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Optional CSV export of the quarantine
    #[serde(default)]
    pub reject_report: Option<PathBuf>,
    /// Extra timestamp formats tried after the built-in ones
    #[serde(default)]
    pub timestamp_formats: Vec<String>,
    pub sources: SourcePaths,
    #[serde(default)]
    pub schema: SchemaMapping,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub flags: FlagConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePaths {
    pub transactions: PathBuf,
    pub currency: PathBuf,
    pub fraud_signals: PathBuf,
}

// ============================================================================
// SCHEMA MAPPING (logical field -> physical column)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaMapping {
    #[serde(default)]
    pub transactions: TransactionColumns,
    #[serde(default)]
    pub currency: CurrencyColumns,
    #[serde(default)]
    pub fraud_signals: FraudSignalColumns,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionColumns {
    pub transaction_id: String,
    pub timestamp: String,
    pub source_account: String,
    pub dest_account: String,
    pub amount: String,
    pub currency_code: String,
    pub raw_flags: Option<String>,
}

impl Default for TransactionColumns {
    fn default() -> Self {
        TransactionColumns {
            transaction_id: fields::TRANSACTION_ID.to_string(),
            timestamp: fields::TIMESTAMP.to_string(),
            source_account: fields::SOURCE_ACCOUNT.to_string(),
            dest_account: fields::DEST_ACCOUNT.to_string(),
            amount: fields::AMOUNT.to_string(),
            currency_code: fields::CURRENCY_CODE.to_string(),
            raw_flags: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencyColumns {
    /// Key holding the code when the reference is an array of objects
    pub code: String,
    pub rate: String,
}

impl Default for CurrencyColumns {
    fn default() -> Self {
        CurrencyColumns {
            code: fields::CURRENCY_CODE.to_string(),
            rate: fields::RATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudSignalColumns {
    pub transaction_id: String,
    pub is_fraud: String,
    pub fraud_score: String,
    pub amount: Option<String>,
    pub signal_source: Option<String>,
}

impl Default for FraudSignalColumns {
    fn default() -> Self {
        FraudSignalColumns {
            transaction_id: fields::TRANSACTION_ID.to_string(),
            is_fraud: fields::IS_FRAUD.to_string(),
            fraud_score: fields::FRAUD_SCORE.to_string(),
            amount: None,
            signal_source: None,
        }
    }
}

// ============================================================================
// WINDOW
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub duration: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            duration: "24h".to_string(),
        }
    }
}

/// Trailing window per source account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    duration: Duration,
}

impl WindowSpec {
    /// Only strictly positive windows are accepted.
    pub fn try_new(duration: Duration) -> Result<Self> {
        if duration <= Duration::zero() {
            return Err(PipelineError::Config("window must be positive".to_string()));
        }
        Ok(WindowSpec { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl FromStr for WindowSpec {
    type Err = PipelineError;

    /// Parses `<n><unit>` with unit one of `s`, `m`, `h`, `d`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| PipelineError::Config(format!("window '{}' has no unit", s)))?;
        let (num, unit) = s.split_at(split);
        let n: i64 = num
            .parse()
            .map_err(|_| PipelineError::Config(format!("window '{}' has no length", s)))?;
        let duration = match unit {
            "s" => Duration::try_seconds(n),
            "m" => Duration::try_minutes(n),
            "h" => Duration::try_hours(n),
            "d" => Duration::try_days(n),
            other => {
                return Err(PipelineError::Config(format!(
                    "unknown window unit '{}'",
                    other
                )))
            }
        }
        .ok_or_else(|| PipelineError::Config(format!("window '{}' is too long", s)))?;
        WindowSpec::try_new(duration)
    }
}

// ============================================================================
// TARGET
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Replace,
    Append,
}

impl LoadMode {
    pub fn name(&self) -> &'static str {
        match self {
            LoadMode::Replace => "replace",
            LoadMode::Append => "append",
        }
    }
}

impl FromStr for LoadMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(LoadMode::Replace),
            "append" => Ok(LoadMode::Append),
            other => Err(PipelineError::Config(format!("unknown load mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub database: PathBuf,
    pub table: String,
    pub mode: LoadMode,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            database: PathBuf::from("analytics.db"),
            table: "fraud_transactions".to_string(),
            mode: LoadMode::Replace,
        }
    }
}

// ============================================================================
// LIMITS & FLAGS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub io_timeout_secs: u64,
    pub source_retries: u32,
    pub retry_delay_ms: u64,
    /// 0 = rayon default
    pub workers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            io_timeout_secs: 600,
            source_retries: 3,
            retry_delay_ms: 1000,
            workers: 0,
        }
    }
}

impl Limits {
    pub fn io_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.io_timeout_secs)
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagConfig {
    pub high_amount_threshold: Decimal,
    pub fraud_amount_quantile: f64,
    pub night_start_hour: u32,
    pub night_end_hour: u32,
    pub base_precision: u32,
}

impl Default for FlagConfig {
    fn default() -> Self {
        FlagConfig {
            high_amount_threshold: Decimal::from(1_000_000),
            fraud_amount_quantile: 0.95,
            night_start_hour: 22,
            night_end_hour: 6,
            base_precision: 6,
        }
    }
}

impl FlagConfig {
    /// `[start, end)` in hours; wraps past midnight when start > end.
    pub fn is_night(&self, hour: u32) -> bool {
        let (start, end) = (self.night_start_hour, self.night_end_hour);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

// ============================================================================
// LOADING & VALIDATION
// ============================================================================

impl PipelineConfig {
    /// Config with default settings for the given input files.
    pub fn with_sources(
        transactions: impl Into<PathBuf>,
        currency: impl Into<PathBuf>,
        fraud_signals: impl Into<PathBuf>,
    ) -> Self {
        PipelineConfig {
            reject_report: None,
            timestamp_formats: Vec::new(),
            sources: SourcePaths {
                transactions: transactions.into(),
                currency: currency.into(),
                fraud_signals: fraud_signals.into(),
            },
            schema: SchemaMapping::default(),
            window: WindowConfig::default(),
            target: TargetConfig::default(),
            limits: Limits::default(),
            flags: FlagConfig::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn window_spec(&self) -> Result<WindowSpec> {
        self.window.duration.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.window_spec()?;

        if !is_valid_table_name(&self.target.table) {
            return Err(PipelineError::Config(format!(
                "invalid table name '{}'",
                self.target.table
            )));
        }

        let q = self.flags.fraud_amount_quantile;
        if !(q > 0.0 && q <= 1.0) {
            return Err(PipelineError::Config(format!(
                "fraud_amount_quantile must be in (0, 1], got {}",
                q
            )));
        }

        if self.flags.night_start_hour > 23 || self.flags.night_end_hour > 23 {
            return Err(PipelineError::Config("night hours must be 0-23".to_string()));
        }

        if self.flags.base_precision > 28 {
            return Err(PipelineError::Config(
                "base_precision must be at most 28".to_string(),
            ));
        }

        if self.limits.io_timeout_secs == 0 {
            return Err(PipelineError::Config("io_timeout_secs must be > 0".to_string()));
        }

        Ok(())
    }
}

/// SQL identifier check for table names interpolated into statements.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
