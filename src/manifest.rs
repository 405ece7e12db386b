// 🧾 Run Manifest
// Audit record of one pipeline execution: inputs, per-stage counts, rejects, outcome.

use crate::config::LoadMode;
use crate::error::{PipelineError, Result};
use crate::reader::SourceBatch;
use crate::records::{fields, RejectRecord, Stage};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Process exit status. Rejects never change it.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed => 0,
            _ => 1,
        }
    }
}

/// One input file as it was read for this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFingerprint {
    /// transactions, currency, or fraud_signals
    pub role: String,
    pub path: String,
    pub format: String,
    pub sha256: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub extracted: usize,
    pub cleaned: usize,
    pub enriched: usize,
    pub featured: usize,
    pub loaded: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: RunStatus,
    pub failed_stage: Option<Stage>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,

    pub target_table: String,
    pub mode: LoadMode,
    pub window: String,

    pub inputs: Vec<InputFingerprint>,
    pub counts: StageCounts,
    pub reject_count: usize,
    /// reason code -> count
    pub rejects_by_reason: BTreeMap<String, usize>,
    /// Fraud-signal rows that could not be interpreted
    pub skipped_fraud_signals: usize,
    pub fraud_amount_threshold: Option<Decimal>,
    pub alert_count: usize,
}

impl RunManifest {
    pub fn new(target_table: &str, mode: LoadMode, window: &str) -> Self {
        RunManifest {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            status: RunStatus::Running,
            failed_stage: None,
            error_kind: None,
            error_message: None,
            target_table: target_table.to_string(),
            mode,
            window: window.to_string(),
            inputs: Vec::new(),
            counts: StageCounts::default(),
            reject_count: 0,
            rejects_by_reason: BTreeMap::new(),
            skipped_fraud_signals: 0,
            fraud_amount_threshold: None,
            alert_count: 0,
        }
    }

    pub fn record_input(&mut self, role: &str, batch: &SourceBatch) {
        self.inputs.push(InputFingerprint {
            role: role.to_string(),
            path: batch.path.display().to_string(),
            format: batch.format.name().to_string(),
            sha256: batch.sha256.clone(),
            rows: batch.records.len(),
        });
    }

    pub fn record_rejects(&mut self, rejects: &[RejectRecord]) {
        for reject in rejects {
            *self
                .rejects_by_reason
                .entry(reject.reason.code().to_string())
                .or_insert(0) += 1;
        }
        self.reject_count += rejects.len();
    }

    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.stamp_finish();
    }

    pub fn fail(&mut self, stage: Stage, error: &PipelineError) {
        self.status = RunStatus::Failed;
        self.failed_stage = Some(stage);
        self.error_kind = Some(error.kind().to_string());
        self.error_message = Some(error.to_string());
        self.stamp_finish();
    }

    fn stamp_finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.finished_at = Some(now);
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

// ============================================================================
// REJECT REPORT
// ============================================================================

#[derive(Debug, Serialize)]
struct RejectReportRow<'a> {
    run_id: &'a str,
    position: usize,
    stage: &'static str,
    reason: &'static str,
    detail: &'a str,
    transaction_id: &'a str,
    raw: String,
}

/// Write the run's quarantine as CSV for manual review.
pub fn write_reject_report(path: &Path, run_id: &str, rejects: &[RejectRecord]) -> Result<usize> {
    let io_err = |e: std::io::Error| PipelineError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let csv_err = |e: csv::Error| io_err(std::io::Error::new(std::io::ErrorKind::Other, e));

    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    for reject in rejects {
        let raw = serde_json::to_string(&reject.raw.fields)
            .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        writer
            .serialize(RejectReportRow {
                run_id,
                position: reject.raw.position,
                stage: reject.stage.name(),
                reason: reject.reason.code(),
                detail: &reject.detail,
                transaction_id: reject.raw.get(fields::TRANSACTION_ID).unwrap_or(""),
                raw,
            })
            .map_err(csv_err)?;
    }
    writer.flush().map_err(io_err)?;

    Ok(rejects.len())
}
