// Fraud ETL - Audit API
// Read-only REST API over run history, quarantine and loaded tables (Axum)

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use fraud_etl::logging::init_logging;
use fraud_etl::{
    get_manifest, get_rejects, list_manifests, query_account_range, query_alerts, setup_database,
    FeatureRecord, RejectRecord, RunManifest, StoreError, StoreResult,
};

#[derive(Parser)]
#[command(name = "fraud-etl-server")]
#[command(about = "Read-only audit API for fraud ETL runs")]
struct Args {
    #[arg(long, default_value = "analytics.db")]
    database: PathBuf,
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: String,
    #[arg(long)]
    log_json: bool,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Run summary for listings
#[derive(Serialize)]
struct RunResponse {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: String,
    failed_stage: Option<String>,
    error_kind: Option<String>,
    target_table: String,
    loaded: usize,
    reject_count: usize,
    alert_count: usize,
}

impl From<RunManifest> for RunResponse {
    fn from(m: RunManifest) -> Self {
        Self {
            run_id: m.run_id,
            started_at: m.started_at,
            finished_at: m.finished_at,
            status: m.status.name().to_string(),
            failed_stage: m.failed_stage.map(|s| s.name().to_string()),
            error_kind: m.error_kind,
            target_table: m.target_table,
            loaded: m.counts.loaded,
            reject_count: m.reject_count,
            alert_count: m.alert_count,
        }
    }
}

/// Loaded transaction (flattened for API consumers)
#[derive(Serialize)]
struct TransactionResponse {
    transaction_id: String,
    timestamp: DateTime<Utc>,
    source_account: String,
    dest_account: String,
    amount: String,
    currency_code: String,
    amount_in_base_currency: String,
    is_fraud: bool,
    fraud_score: f64,
    window_txn_count: u64,
    window_amount_sum: String,
    cross_currency_flag: bool,
    is_night_transaction: bool,
    aml_alert_flag: bool,
    exceeds_fraud_threshold: bool,
}

impl From<FeatureRecord> for TransactionResponse {
    fn from(f: FeatureRecord) -> Self {
        let e = f.enriched;
        Self {
            transaction_id: e.clean.transaction_id,
            timestamp: e.clean.timestamp,
            source_account: e.clean.source_account,
            dest_account: e.clean.dest_account,
            amount: e.clean.amount.to_string(),
            currency_code: e.clean.currency_code,
            amount_in_base_currency: e.amount_in_base_currency.to_string(),
            is_fraud: e.is_fraud,
            fraud_score: e.fraud_score,
            window_txn_count: f.window.txn_count,
            window_amount_sum: f.window.amount_sum.to_string(),
            cross_currency_flag: f.window.cross_currency,
            is_night_transaction: f.flags.is_night_transaction,
            aml_alert_flag: f.flags.aml_alert_flag,
            exceeds_fraud_threshold: f.flags.exceeds_fraud_threshold,
        }
    }
}

#[derive(Serialize)]
struct RejectResponse {
    position: usize,
    stage: String,
    reason: String,
    detail: String,
    fields: std::collections::BTreeMap<String, String>,
}

impl From<RejectRecord> for RejectResponse {
    fn from(r: RejectRecord) -> Self {
        Self {
            position: r.raw.position,
            stage: r.stage.name().to_string(),
            reason: r.reason.code().to_string(),
            detail: r.detail,
            fields: r.raw.fields,
        }
    }
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

/// Open range bounds stay within four-digit years so stored timestamps compare as text.
const EARLIEST_SECS: i64 = -30_610_224_000; // 1000-01-01T00:00:00Z
const LATEST_SECS: i64 = 253_402_300_799; // 9999-12-31T23:59:59Z

#[derive(Deserialize)]
struct RangeQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

// ============================================================================
// Helpers
// ============================================================================

fn status_for(e: &StoreError) -> StatusCode {
    match e {
        StoreError::InvalidTable(_) => StatusCode::BAD_REQUEST,
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("no such table") => {
            StatusCode::NOT_FOUND
        }
        StoreError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run a query against the shared connection and wrap the result.
fn with_db<T, R, F>(state: &AppState, what: &str, query: F) -> Response
where
    F: FnOnce(&Connection) -> StoreResult<T>,
    R: Serialize + From<T>,
{
    let conn = match state.db.lock() {
        Ok(conn) => conn,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<R>::err("database lock poisoned")),
            )
                .into_response()
        }
    };

    match query(&conn) {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(R::from(data)))).into_response(),
        Err(e) => {
            error!(error = %e, "error getting {}", what);
            (status_for(&e), Json(ApiResponse::<R>::err(e.to_string()))).into_response()
        }
    }
}

/// Newtype so collections convert element-wise through `with_db`.
#[derive(Serialize)]
#[serde(transparent)]
struct List<T>(Vec<T>);

impl<T, U: Into<T>> From<Vec<U>> for List<T> {
    fn from(items: Vec<U>) -> Self {
        List(items.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/runs?limit= - Most recent runs first
async fn get_runs(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Response {
    let limit = q.limit.unwrap_or(50);
    with_db::<_, List<RunResponse>, _>(&state, "runs", |conn| list_manifests(conn, limit))
}

/// GET /api/runs/:run_id - Full manifest
async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let conn = match state.db.lock() {
        Ok(conn) => conn,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    match get_manifest(&conn, &run_id) {
        Ok(Some(manifest)) => (StatusCode::OK, Json(ApiResponse::ok(manifest))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<RunManifest>::err(format!("no run {}", run_id))),
        )
            .into_response(),
        Err(e) => (status_for(&e), Json(ApiResponse::<RunManifest>::err(e.to_string()))).into_response(),
    }
}

/// GET /api/runs/:run_id/rejects - Quarantined rows of one run
async fn get_run_rejects(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    with_db::<_, List<RejectResponse>, _>(&state, "rejects", |conn| get_rejects(conn, &run_id))
}

/// GET /api/tables/:table/alerts?limit= - High-risk alerts, largest first
async fn get_alerts(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(100);
    with_db::<_, List<TransactionResponse>, _>(&state, "alerts", |conn| query_alerts(conn, &table, limit))
}

/// GET /api/tables/:table/accounts/:account?from=&to= - Account history in a time range
async fn get_account_history(
    State(state): State<AppState>,
    Path((table, account)): Path<(String, String)>,
    Query(q): Query<RangeQuery>,
) -> Response {
    let (from, to) = match (
        q.from.or_else(|| DateTime::from_timestamp(EARLIEST_SECS, 0)),
        q.to.or_else(|| DateTime::from_timestamp(LATEST_SECS, 0)),
    ) {
        (Some(from), Some(to)) => (from, to),
        _ => return (StatusCode::BAD_REQUEST, Json(ApiResponse::<()>::err("invalid range"))).into_response(),
    };
    with_db::<_, List<TransactionResponse>, _>(&state, "account history", |conn| {
        query_account_range(conn, &table, &account, from, to)
    })
}

// ============================================================================
// Main Server
// ============================================================================

fn app(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/runs", get(get_runs))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/rejects", get(get_run_rejects))
        .route("/tables/:table/alerts", get(get_alerts))
        .route("/tables/:table/accounts/:account", get(get_account_history))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    println!("🌐 Fraud ETL - Audit API");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let conn = Connection::open(&args.database)
        .with_context(|| format!("Failed to open database {}", args.database.display()))?;
    setup_database(&conn).context("Failed to prepare audit tables")?;
    println!("✓ Database opened: {}", args.database.display());

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", args.bind))?;

    info!(bind = %args.bind, "audit API listening");
    println!("\n🚀 Server running on http://{}", args.bind);
    println!("   Runs:   /api/runs");
    println!("   Alerts: /api/tables/<table>/alerts");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app(state))
        .await
        .context("Server error")?;

    Ok(())
}
