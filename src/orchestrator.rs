// 🎛️ Pipeline Orchestrator
// Explicit state machine: Idle → Extracting → Cleaning → Enriching →
// FeatureComputing → Loading → Completed, with Failed reachable from any
// non-terminal state. The orchestrator is the only place a run is aborted.

use crate::cleaning::{clean, CleaningRules};
use crate::config::{PipelineConfig, WindowSpec};
use crate::db::{AnalyticalStore, SqliteStore, StoreResult};
use crate::enrichment::enrich;
use crate::error::{PipelineError, Result, StoreError};
use crate::features::{compute_features, RiskSettings};
use crate::load::{load, LoadRequest};
use crate::manifest::{write_reject_report, RunManifest};
use crate::reader::{read_source, ExpectedSchema, ReadPolicy};
use crate::records::{CleanRecord, EnrichedRecord, FeatureRecord, RawRecord, RejectRecord, Stage};
use crate::reference::{CurrencyRef, FraudSignals};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

// ============================================================================
// CANCELLATION
// ============================================================================

/// Shared flag checked at every state transition and before the load commits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    Extracting,
    Cleaning,
    Enriching,
    FeatureComputing,
    Loading,
    Completed,
    Failed,
}

/// Every legal (from, to) pair. Failed is added for each non-terminal state.
const TRANSITIONS: &[(RunState, RunState)] = &[
    (RunState::Idle, RunState::Extracting),
    (RunState::Extracting, RunState::Cleaning),
    (RunState::Cleaning, RunState::Enriching),
    (RunState::Enriching, RunState::FeatureComputing),
    (RunState::FeatureComputing, RunState::Loading),
    (RunState::Loading, RunState::Completed),
];

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Extracting => "extracting",
            RunState::Cleaning => "cleaning",
            RunState::Enriching => "enriching",
            RunState::FeatureComputing => "feature_computing",
            RunState::Loading => "loading",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        if next == RunState::Failed {
            return !self.is_terminal();
        }
        TRANSITIONS.contains(&(*self, next))
    }

    /// Pipeline stage executed while in this state.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunState::Extracting => Some(Stage::Extract),
            RunState::Cleaning => Some(Stage::Clean),
            RunState::Enriching => Some(Stage::Enrich),
            RunState::FeatureComputing => Some(Stage::Features),
            RunState::Loading => Some(Stage::Load),
            _ => None,
        }
    }
}

// ============================================================================
// STORE ACCESS
// ============================================================================

/// The store is opened on first use, so an unreachable database fails the
/// Loading state rather than the whole invocation.
enum StoreSlot<'a> {
    Borrowed(&'a mut dyn AnalyticalStore),
    Lazy {
        path: PathBuf,
        busy_timeout: Duration,
        opened: Option<SqliteStore>,
    },
}

impl<'a> StoreSlot<'a> {
    fn get(&mut self) -> StoreResult<&mut dyn AnalyticalStore> {
        match self {
            StoreSlot::Borrowed(store) => Ok(&mut **store),
            StoreSlot::Lazy {
                path,
                busy_timeout,
                opened,
            } => {
                if opened.is_none() {
                    *opened = Some(SqliteStore::open(path, *busy_timeout)?);
                }
                opened
                    .as_mut()
                    .map(|s| s as &mut dyn AnalyticalStore)
                    .ok_or_else(|| StoreError::Unavailable(path.display().to_string()))
            }
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    config: PipelineConfig,
    window: WindowSpec,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let window = config.window_spec()?;
        Ok(Pipeline {
            config,
            window,
            cancel: CancelToken::new(),
        })
    }

    /// Builder pattern: share a cancellation token with the caller
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run against the SQLite database named in the config.
    pub fn run(&self) -> RunManifest {
        let slot = StoreSlot::Lazy {
            path: self.config.target.database.clone(),
            busy_timeout: self.config.limits.io_timeout(),
            opened: None,
        };
        self.execute(slot)
    }

    pub fn run_with_store(&self, store: &mut dyn AnalyticalStore) -> RunManifest {
        self.execute(StoreSlot::Borrowed(store))
    }

    fn execute(&self, store: StoreSlot) -> RunManifest {
        let manifest = RunManifest::new(
            &self.config.target.table,
            self.config.target.mode,
            &self.config.window.duration,
        );
        let span = info_span!("run", run_id = %manifest.run_id);
        let _enter = span.enter();

        let mut run = Run {
            pipeline: self,
            state: RunState::Idle,
            manifest,
            store,
            rejects: Vec::new(),
            extracted: None,
            clean: Vec::new(),
            passed_raw: HashMap::new(),
            enriched: Vec::new(),
            features: Vec::new(),
        };
        run.drive();
        run.finalize()
    }
}

struct Extracted {
    transactions: Vec<RawRecord>,
    currency: CurrencyRef,
    fraud_signals: FraudSignals,
    risk: RiskSettings,
}

/// Mutable state of one in-flight run. Each stage takes the previous
/// stage's output by value.
struct Run<'p, 's> {
    pipeline: &'p Pipeline,
    state: RunState,
    manifest: RunManifest,
    store: StoreSlot<'s>,
    rejects: Vec<RejectRecord>,
    extracted: Option<Extracted>,
    clean: Vec<CleanRecord>,
    /// Rows as read, by position, for records that passed cleaning
    passed_raw: HashMap<usize, RawRecord>,
    enriched: Vec<EnrichedRecord>,
    features: Vec<FeatureRecord>,
}

impl<'p, 's> Run<'p, 's> {
    fn drive(&mut self) {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.pipeline.config.limits.workers)
            .thread_name(|i| format!("etl-worker-{}", i))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                self.fail(PipelineError::Config(format!("worker pool: {}", e)));
                return;
            }
        };

        while !self.state.is_terminal() {
            if self.pipeline.cancel.is_cancelled() {
                self.fail(PipelineError::Cancelled);
                break;
            }
            match pool.install(|| self.step()) {
                Ok(next) => self.transition(next),
                Err(e) => self.fail(e),
            }
        }
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(self.state.can_transition_to(next));
        debug!(from = self.state.name(), to = next.name(), "state transition");
        self.state = next;
    }

    fn fail(&mut self, e: PipelineError) {
        let stage = self.state.stage().unwrap_or(Stage::Extract);
        error!(
            state = self.state.name(),
            stage = stage.name(),
            kind = e.kind(),
            error = %e,
            "run failed"
        );
        self.manifest.fail(stage, &e);
        self.transition(RunState::Failed);
    }

    fn step(&mut self) -> Result<RunState> {
        match self.state {
            RunState::Idle => Ok(RunState::Extracting),
            RunState::Extracting => {
                self.extract()?;
                Ok(RunState::Cleaning)
            }
            RunState::Cleaning => {
                self.clean_stage();
                Ok(RunState::Enriching)
            }
            RunState::Enriching => {
                self.enrich_stage();
                Ok(RunState::FeatureComputing)
            }
            RunState::FeatureComputing => {
                self.feature_stage()?;
                Ok(RunState::Loading)
            }
            RunState::Loading => {
                self.load_stage()?;
                Ok(RunState::Completed)
            }
            terminal => Ok(terminal),
        }
    }

    // ------------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------------

    fn extract(&mut self) -> Result<()> {
        let config = &self.pipeline.config;
        let policy = ReadPolicy {
            timeout: config.limits.io_timeout(),
            retries: config.limits.source_retries,
            retry_delay: config.limits.retry_delay(),
        };

        let tx_batch = read_source(
            &config.sources.transactions,
            &ExpectedSchema::transactions(&config.schema.transactions),
            &policy,
        )?;
        self.manifest.record_input("transactions", &tx_batch);

        let currency_batch = read_source(
            &config.sources.currency,
            &ExpectedSchema::currency(&config.schema.currency),
            &policy,
        )?;
        self.manifest.record_input("currency", &currency_batch);
        let currency = CurrencyRef::from_records(&currency_batch.path, currency_batch.records)?;

        let fraud_batch = read_source(
            &config.sources.fraud_signals,
            &ExpectedSchema::fraud_signals(&config.schema.fraud_signals),
            &policy,
        )?;
        self.manifest.record_input("fraud_signals", &fraud_batch);
        let default_source = fraud_batch
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fraud_signals".to_string());
        let fraud_signals = FraudSignals::from_records(fraud_batch.records, &default_source);

        let threshold = fraud_signals.fraud_amount_threshold(config.flags.fraud_amount_quantile);
        self.manifest.skipped_fraud_signals = fraud_signals.skipped;
        self.manifest.fraud_amount_threshold = threshold;
        self.manifest.counts.extracted = tx_batch.records.len();

        info!(
            transactions = tx_batch.records.len(),
            currencies = currency.len(),
            fraud_signals = fraud_signals.len(),
            "extract finished"
        );

        self.extracted = Some(Extracted {
            transactions: tx_batch.records,
            currency,
            fraud_signals,
            risk: RiskSettings {
                flags: config.flags.clone(),
                fraud_amount_threshold: threshold,
            },
        });
        Ok(())
    }

    fn clean_stage(&mut self) {
        let rules = CleaningRules::new(self.pipeline.config.timestamp_formats.clone());
        let raw = self
            .extracted
            .as_mut()
            .map(|e| std::mem::take(&mut e.transactions))
            .unwrap_or_default();

        let mut as_read: HashMap<usize, RawRecord> =
            raw.iter().map(|r| (r.position, r.clone())).collect();
        let (clean_records, rejects) = clean(raw, &rules);
        info!(clean = clean_records.len(), rejects = rejects.len(), "cleaning finished");

        self.passed_raw = clean_records
            .iter()
            .filter_map(|c| as_read.remove(&c.position).map(|r| (c.position, r)))
            .collect();

        self.manifest.counts.cleaned = clean_records.len();
        self.manifest.record_rejects(&rejects);
        self.rejects.extend(rejects);
        self.clean = clean_records;
    }

    fn enrich_stage(&mut self) {
        let clean_records = std::mem::take(&mut self.clean);
        let precision = self.pipeline.config.flags.base_precision;

        let (enriched, rejects) = match &self.extracted {
            Some(e) => enrich(clean_records, &e.currency, &e.fraud_signals, precision),
            None => (Vec::new(), Vec::new()),
        };
        // Quarantine the row as read, not the normalized rebuild
        let mut passed_raw = std::mem::take(&mut self.passed_raw);
        let rejects: Vec<RejectRecord> = rejects
            .into_iter()
            .map(|mut reject| {
                if let Some(raw) = passed_raw.remove(&reject.raw.position) {
                    reject.raw = raw;
                }
                reject
            })
            .collect();
        info!(enriched = enriched.len(), rejects = rejects.len(), "enrichment finished");

        self.manifest.counts.enriched = enriched.len();
        self.manifest.record_rejects(&rejects);
        self.rejects.extend(rejects);
        self.enriched = enriched;
    }

    fn feature_stage(&mut self) -> Result<()> {
        let enriched = std::mem::take(&mut self.enriched);
        let risk = self
            .extracted
            .take()
            .map(|e| e.risk)
            .ok_or_else(|| PipelineError::Config("feature stage ran before extract".to_string()))?;

        let features = compute_features(enriched, &self.pipeline.window, &risk);
        let alerts = features.iter().filter(|f| f.flags.is_alert()).count();
        info!(records = features.len(), alerts, "features computed");

        self.manifest.counts.featured = features.len();
        self.manifest.alert_count = alerts;
        self.features = features;
        Ok(())
    }

    fn load_stage(&mut self) -> Result<()> {
        let target = &self.pipeline.config.target;
        let store = self.store.get().map_err(|e| PipelineError::LoadFailed {
            table: target.table.clone(),
            source: e,
        })?;

        let request = LoadRequest {
            table: &target.table,
            mode: target.mode,
            run_id: &self.manifest.run_id,
            timeout: self.pipeline.config.limits.io_timeout(),
            cancel: &self.pipeline.cancel,
        };
        let outcome = load(store, &self.features, &request)?;

        self.manifest.counts.loaded = outcome.rows_written;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Finalisation
    // ------------------------------------------------------------------------

    /// Close the manifest, then persist it with the quarantine. Persistence
    /// problems are logged; the returned manifest is the run's outcome.
    fn finalize(mut self) -> RunManifest {
        if self.state == RunState::Completed {
            self.manifest.complete();
        }

        match self.store.get() {
            Ok(store) => {
                if let Err(e) = store.record_run(&self.manifest, &self.rejects) {
                    warn!(error = %e, "could not persist run manifest");
                }
            }
            Err(e) => warn!(error = %e, "store unavailable, run manifest not persisted"),
        }

        if let Some(path) = &self.pipeline.config.reject_report {
            match write_reject_report(path, &self.manifest.run_id, &self.rejects) {
                Ok(n) => info!(path = %path.display(), rejects = n, "reject report written"),
                Err(e) => warn!(error = %e, "could not write reject report"),
            }
        }

        info!(
            status = self.manifest.status.name(),
            loaded = self.manifest.counts.loaded,
            rejects = self.manifest.reject_count,
            duration_ms = self.manifest.duration_ms.unwrap_or(0),
            "run finished"
        );
        self.manifest
    }
}
