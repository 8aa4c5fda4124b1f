//! Poly-Combo - combinatorial signal search over resolved prediction markets
//!
//! Usage:
//!   poly-combo run --retire W2          - Run the three-stage search from CLI
//!   poly-combo top --n 10               - Print the stored leaderboard
//!   poly-combo predict --limit 15       - Best-combo picks for open markets
//!   poly-combo serve --port 3002        - Launch the read-only HTTP API

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use engine::{
    default_registry, execute, participants, predict_open, ComboResult, EngineConfig,
    HistoricalSource, Prediction, Replayer, ResultStore, RunSummary, SearchJob, SearchProgress,
    SearchStatus, SignalId, SignalRegistry, SqliteHistoricalSource,
};
use persistence::repository::{SearchRunRecord, SearchRunRepository};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "poly-combo")]
#[command(about = "Combinatorial search for the best prediction-market signal subsets", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON file with engine settings (fitness, backtest, search, holdout)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full search from CLI (no web server)
    Run {
        /// Signal ids to retire for this run (comma-separated)
        #[arg(long, value_delimiter = ',')]
        retire: Vec<String>,
        /// Search over every resolved market, skipping holdout validation
        #[arg(long)]
        no_holdout: bool,
        /// Number of top results to print
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Print the stored leaderboard
    Top {
        #[arg(short, long, default_value_t = 10)]
        n: usize,
    },
    /// Print the most recent search runs
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Keep the best K stored results, delete the rest
    Prune {
        #[arg(long)]
        keep: usize,
    },
    /// Apply the best stored combo to open markets
    Predict {
        /// Number of picks to print
        #[arg(long, default_value_t = 15)]
        limit: usize,
        /// Open markets to load
        #[arg(long, default_value_t = 200)]
        markets: usize,
        /// Skip markets with fewer trades than this
        #[arg(long, default_value_t = 5)]
        min_trades: usize,
    },
    /// Launch the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3002)]
        port: u16,
    },
}

#[derive(Clone)]
struct AppState {
    db: Arc<persistence::Database>,
    registry: Arc<SignalRegistry>,
    config: Arc<EngineConfig>,
    progress: Arc<SearchProgress>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,poly_combo=debug")
    } else {
        EnvFilter::new("info,engine=info,poly_combo=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn db_path() -> String {
    std::env::var("POLY_COMBO_DB_PATH").unwrap_or_else(|_| "data/combos.db".to_string())
}

async fn open_db() -> anyhow::Result<(persistence::Database, String)> {
    let path = db_path();
    let db = persistence::Database::new(&path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    Ok((db, path))
}

fn load_config(path: Option<&str>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read config {}: {}", path, e))?;
    let config =
        parse_config(&raw).map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path, e))?;
    info!(path, "Loaded engine config");
    Ok(config)
}

/// Partial JSON over the defaults, range-checked
fn parse_config(raw: &str) -> anyhow::Result<EngineConfig> {
    let config: EngineConfig = serde_json::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

/// Default registry with `retire` switched off
fn build_registry(retire: &[String]) -> anyhow::Result<SignalRegistry> {
    let registry = default_registry()?;
    if retire.is_empty() {
        return Ok(registry);
    }
    let ids = retire
        .iter()
        .map(|s| s.trim().parse::<SignalId>())
        .collect::<Result<Vec<_>, _>>()?;
    let registry = registry.with_retired(&ids)?;
    info!(
        retired = ?retire,
        active = registry.active_count(),
        "Retired signal functions"
    );
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            retire,
            no_holdout,
            top,
        } => {
            cmd_run(config, retire, no_holdout, top).await?;
        }
        Commands::Top { n } => {
            cmd_top(n).await?;
        }
        Commands::Runs { limit } => {
            cmd_runs(limit).await?;
        }
        Commands::Prune { keep } => {
            cmd_prune(keep).await?;
        }
        Commands::Predict {
            limit,
            markets,
            min_trades,
        } => {
            cmd_predict(config, limit, markets, min_trades).await?;
        }
        Commands::Serve { host, port } => {
            cmd_serve(config, &host, port).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Run command - CLI mode (no web server)
// ============================================================================

async fn cmd_run(
    config: EngineConfig,
    retire: Vec<String>,
    no_holdout: bool,
    top: usize,
) -> anyhow::Result<()> {
    println!("\n=== Poly-Combo v{} ===", APP_VERSION);

    let (db, path) = open_db().await?;
    let stored = ResultStore::new(db.pool_clone()).len().await?;
    println!("Database: {} ({} combos stored)", path, stored);

    let registry = build_registry(&retire)?;
    println!(
        "Signals: {} active / {} registered | Holdout: {}",
        registry.active_count(),
        registry.total_count(),
        if no_holdout { "off" } else { "on" }
    );
    println!("Press Ctrl+C to stop (results scored so far are kept)\n");

    let job = SearchJob {
        config,
        registry: Arc::new(registry),
        use_holdout: !no_holdout,
    };
    let progress = Arc::new(SearchProgress::new());
    progress.reset();

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    let pool = db.pool_clone();
    let progress_clone = progress.clone();
    let handle = tokio::spawn(async move {
        let source = SqliteHistoricalSource::new(pool.clone());
        execute(&job, &source, pool, &progress_clone).await
    });

    // Progress display loop
    while !handle.is_finished() {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        let snap = progress.snapshot();
        match snap.status {
            SearchStatus::LoadingData => {
                print!("\r  Loading markets and wallets...                               ");
            }
            SearchStatus::Stage1WithinCategory
            | SearchStatus::Stage2CrossCategory
            | SearchStatus::Stage3Refinement => {
                print!(
                    "\r  {:?} | attempted {} | scored {} | skipped {} | {:<20}",
                    snap.status, snap.attempted, snap.scored, snap.skipped, snap.current_combo
                );
            }
            _ => {}
        }
        use std::io::Write;
        std::io::stdout().flush().ok();
    }
    println!();

    let summary = handle.await??;
    print_summary(&summary, top);
    Ok(())
}

fn print_summary(summary: &RunSummary, top: usize) {
    println!("\nRun {} finished", summary.outcome.run_id);
    println!(
        "  Markets: {} train / {} holdout | Pruned: {}",
        summary.train_records, summary.holdout_records, summary.outcome.pruned
    );
    for stage in &summary.outcome.stages {
        println!(
            "  {:<28} attempted {:>5}  scored {:>5}  skipped {:>5}{}",
            stage.stage.to_string(),
            stage.attempted,
            stage.scored,
            stage.skipped,
            if stage.degraded { "  (degraded)" } else { "" }
        );
    }
    if let Some(best) = &summary.outcome.best {
        println!("\n  Best: {} (fitness {:.4})", best.id(), best.fitness);
    }
    if let Some(holdout) = &summary.holdout {
        println!(
            "  Holdout: fitness {:.4} on {} markets (gap {:+.4})",
            holdout.holdout_fitness,
            holdout.holdout_records,
            holdout.gap()
        );
    }
    if let Some(prev) = summary.previous_best_fitness {
        println!("  Previous run on the same data: {:.4}", prev);
    }
    print_results(&summary.outcome.top, top);
}

fn print_results(results: &[ComboResult], top_n: usize) {
    println!("\nTop {} Combos:", results.len().min(top_n));
    println!(
        "  {:>3}  {:<24} {:>8} {:>7} {:>7} {:>7} {:>6}",
        "#", "Combo", "Fitness", "Acc%", "Edge%", "FPR%", "Recs"
    );
    println!("  {}", "-".repeat(70));
    for (i, r) in results.iter().take(top_n).enumerate() {
        println!(
            "  {:>3}  {:<24} {:>8.4} {:>6.1}% {:>6.1}% {:>6.1}% {:>6}",
            i + 1,
            r.id(),
            r.fitness,
            r.accuracy * 100.0,
            r.edge * 100.0,
            r.false_positive_rate * 100.0,
            r.evaluated_records,
        );
    }
}

// ============================================================================
// Store commands
// ============================================================================

async fn cmd_top(n: usize) -> anyhow::Result<()> {
    let (db, path) = open_db().await?;
    let store = ResultStore::new(db.pool_clone());
    let results = store.top(n).await?;
    println!("Database: {} ({} combos stored)", path, store.len().await?);
    print_results(&results, n);
    Ok(())
}

async fn cmd_runs(limit: i64) -> anyhow::Result<()> {
    let (db, _) = open_db().await?;
    let runs = SearchRunRepository::new(db.pool()).recent(limit).await?;
    print_runs(&runs);
    Ok(())
}

fn print_runs(runs: &[SearchRunRecord]) {
    println!("\nRecent runs ({}):", runs.len());
    println!(
        "  {:<14} {:<12} {:>6} {:>6} {:<20} {:>8} {:>8}",
        "Run", "Dataset", "Train", "Hold", "Best", "Fitness", "Holdout"
    );
    println!("  {}", "-".repeat(82));
    for run in runs {
        let fmt_opt = |v: Option<f64>| v.map(|f| format!("{:.4}", f)).unwrap_or_else(|| "-".into());
        println!(
            "  {:<14} {:<12} {:>6} {:>6} {:<20} {:>8} {:>8}",
            run.run_id,
            &run.dataset_hash[..run.dataset_hash.len().min(12)],
            run.train_records,
            run.holdout_records,
            run.best_combo_id.as_deref().unwrap_or("-"),
            fmt_opt(run.best_fitness),
            fmt_opt(run.holdout_fitness),
        );
    }
}

async fn cmd_prune(keep: usize) -> anyhow::Result<()> {
    let (db, path) = open_db().await?;
    info!("Database opened: {}", path);
    let store = ResultStore::new(db.pool_clone());
    let deleted = store.prune(keep).await?;
    info!("Done! Deleted {} combos, {} remaining.", deleted, store.len().await?);
    Ok(())
}

// ============================================================================
// Predict command
// ============================================================================

async fn cmd_predict(
    config: EngineConfig,
    limit: usize,
    markets: usize,
    min_trades: usize,
) -> anyhow::Result<()> {
    let (db, _) = open_db().await?;
    let Some(best) = ResultStore::new(db.pool_clone()).top(1).await?.into_iter().next() else {
        println!("No stored combos yet. Run `poly-combo run` first.");
        return Ok(());
    };

    let registry = Arc::new(default_registry()?);
    let replayer = Replayer::new(registry, config.backtest)?;
    let source = SqliteHistoricalSource::new(db.pool_clone());
    let open = source.open_records(markets).await?;
    let profiles = source.profiles_for(&participants(&open)).await?;
    info!(
        combo = %best.combo,
        markets = open.len(),
        wallets = profiles.len(),
        "Predicting open markets"
    );

    let predictions = predict_open(&replayer, &best.combo, &open, &profiles, min_trades)?;
    print_predictions(&best, &predictions, limit);
    Ok(())
}

fn print_predictions(best: &ComboResult, predictions: &[Prediction], limit: usize) {
    println!(
        "\nPicks from {} (fitness {:.4}), top {} of {}:",
        best.id(),
        best.fitness,
        predictions.len().min(limit),
        predictions.len()
    );
    println!(
        "  {:>3}  {:<44} {:>4} {:>6} {:>6} {:>7} {:>6}",
        "#", "Market", "Side", "P(YES)", "Conf", "Emotion", "Trades"
    );
    println!("  {}", "-".repeat(86));
    for (i, p) in predictions.iter().take(limit).enumerate() {
        let title: String = p.title.chars().take(44).collect();
        println!(
            "  {:>3}  {:<44} {:>4} {:>6.3} {:>6.3} {:>6.0}% {:>6}",
            i + 1,
            title,
            p.side.map(|s| s.as_str()).unwrap_or("-"),
            p.probability,
            p.confidence,
            p.emotion_ratio * 100.0,
            p.actions_seen,
        );
    }
}

// ============================================================================
// Serve command - Axum web server
// ============================================================================

async fn cmd_serve(config: EngineConfig, host: &str, port: u16) -> anyhow::Result<()> {
    info!("Poly-Combo v{} starting...", APP_VERSION);

    let (db, path) = open_db().await?;
    info!("Database initialized: {}", path);

    let state = AppState {
        db: Arc::new(db),
        registry: Arc::new(default_registry()?),
        config: Arc::new(config),
        progress: Arc::new(SearchProgress::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/combos/top", get(api_top_combos))
        .route("/runs", get(api_runs))
        .route("/search", post(api_start_search))
        .route("/search/status", get(api_search_status))
        .route("/search/cancel", post(api_cancel_search))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Poly-Combo v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  GET  /api/combos/top?n=       - Stored leaderboard");
    println!("  GET  /api/runs?limit=         - Search run log");
    println!("  POST /api/search              - Start a search in the background");
    println!("  GET  /api/search/status       - Poll search progress");
    println!("  POST /api/search/cancel       - Cancel running search");
    println!("\n  Database: {}", path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn query_usize(params: &HashMap<String, String>, key: &str, default: usize, max: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
        .min(max)
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "poly-combo",
        "version": APP_VERSION,
    }))
}

/// GET /api/combos/top?n=10
async fn api_top_combos(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let n = query_usize(&params, "n", 10, 500);
    let store = ResultStore::new(state.db.pool_clone());
    match store.top(n).await {
        Ok(results) => Json(serde_json::json!({
            "success": true,
            "count": results.len(),
            "results": results,
        })),
        Err(e) => {
            error!("Top combos query failed: {}", e);
            Json(serde_json::json!({
                "success": false,
                "message": e.to_string(),
            }))
        }
    }
}

/// GET /api/runs?limit=10
async fn api_runs(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit = query_usize(&params, "limit", 10, 200) as i64;
    match SearchRunRepository::new(state.db.pool()).recent(limit).await {
        Ok(runs) => Json(serde_json::json!({
            "success": true,
            "count": runs.len(),
            "runs": runs,
        })),
        Err(e) => {
            error!("Run log query failed: {}", e);
            Json(serde_json::json!({
                "success": false,
                "message": e.to_string(),
            }))
        }
    }
}

/// Body of POST /api/search; everything optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchRequest {
    config: Option<EngineConfig>,
    retire: Vec<String>,
    no_holdout: bool,
}

/// POST /api/search - start a search in the background
async fn api_start_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let registry = if request.retire.is_empty() {
        state.registry.clone()
    } else {
        let ids = request
            .retire
            .iter()
            .map(|s| s.trim().parse::<SignalId>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        Arc::new(
            state
                .registry
                .with_retired(&ids)
                .map_err(|_| StatusCode::BAD_REQUEST)?,
        )
    };

    let job = SearchJob {
        config: request.config.unwrap_or_else(|| (*state.config).clone()),
        registry,
        use_holdout: !request.no_holdout,
    };
    if let Err(e) = job.config.validate() {
        return Ok(Json(serde_json::json!({
            "success": false,
            "message": format!("Invalid config: {}", e),
        })));
    }

    if !state.progress.try_start() {
        let snap = state.progress.snapshot();
        return Ok(Json(serde_json::json!({
            "success": false,
            "message": format!("Search already running ({:?}, {} scored)", snap.status, snap.scored),
        })));
    }

    info!(
        retired = ?request.retire,
        holdout = job.use_holdout,
        "Starting combo search"
    );

    let pool = state.db.pool_clone();
    let progress = state.progress.clone();
    tokio::spawn(async move {
        let source = SqliteHistoricalSource::new(pool.clone());
        match execute(&job, &source, pool, &progress).await {
            Ok(summary) => info!(
                run_id = %summary.outcome.run_id,
                best = ?summary.outcome.best.as_ref().map(ComboResult::id),
                "Background search finished"
            ),
            Err(e) => warn!(error = %e, "Background search ended early"),
        }
    });

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Search started",
    })))
}

/// GET /api/search/status - poll search progress
async fn api_search_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snap = state.progress.snapshot();
    Json(serde_json::json!({
        "running": state.progress.is_running(),
        "progress": snap,
    }))
}

/// POST /api/search/cancel - cancel running search
async fn api_cancel_search(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.progress.cancel();
    info!("Search cancel requested via API");
    Json(serde_json::json!({
        "success": true,
        "message": "Cancel requested"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_rejects_cutoff_outside_lifespan() {
        for cutoff in ["0", "1", "1.5"] {
            let raw = format!(r#"{{"backtest": {{"cutoff_fraction": {cutoff}}}}}"#);
            let err = parse_config(&raw).unwrap_err();
            assert!(err.to_string().contains("cutoff_fraction"), "{err}");
        }
        let ok = parse_config(r#"{"backtest": {"cutoff_fraction": 0.6}}"#).unwrap();
        assert_eq!(ok.backtest.cutoff_fraction, 0.6);
    }

    #[test]
    fn test_parse_config_rejects_threshold_above_one() {
        let err = parse_config(r#"{"backtest": {"high_confidence_threshold": 1.5}}"#).unwrap_err();
        assert!(err.to_string().contains("high_confidence_threshold"), "{err}");
    }
}
