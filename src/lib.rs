// Fraud ETL - Core Library
// Batch pipeline: extract → clean → enrich → features → load, plus run audit.

pub mod cleaning;
pub mod config;
pub mod db;
pub mod deadline;
pub mod enrichment;
pub mod error;
pub mod features;
pub mod load;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod reader;
pub mod records;
pub mod reference;

// Re-export commonly used types
pub use cleaning::{clean, CleaningRules};
pub use config::{LoadMode, PipelineConfig, WindowSpec};
pub use db::{
    get_manifest, get_rejects, list_manifests, query_account_range, query_alerts, query_table,
    setup_database, AnalyticalStore, SqliteStore, StoreResult, SCHEMA_VERSION,
};
pub use enrichment::enrich;
pub use error::{PipelineError, Result, StoreError};
pub use features::{compute_features, RiskSettings};
pub use load::{load, LoadOutcome, LoadRequest};
pub use manifest::{RunManifest, RunStatus};
pub use orchestrator::{CancelToken, Pipeline, RunState};
pub use reader::{get_reader, read_source, ExpectedSchema, SourceFormat, SourceReader};
pub use records::{
    CleanRecord, EnrichedRecord, FeatureRecord, RawRecord, RejectReason, RejectRecord, Stage,
};
pub use reference::{CurrencyRef, FraudSignals};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
