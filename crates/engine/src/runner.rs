//! End-to-end search run: load → split → search → holdout check → run log

use std::sync::Arc;

use chrono::Utc;
use persistence::repository::{SearchRunRecord, SearchRunRepository};
use persistence::{DbError, SqlitePool};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::backtest::{ConfigError, Replayer};
use crate::combinator::{
    run_search, EngineConfig, SearchContext, SearchError, SearchOutcome, SearchProgress,
    SearchStatus,
};
use crate::holdout::{split_holdout, HoldoutConfig};
use crate::profiles::participants;
use crate::result_store::{ComboResult, ResultStore};
use crate::signal::SignalRegistry;
use crate::source::{HistoricalSource, SourceError};
use crate::types::HistoricalRecord;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to load historical data: {0}")]
    Source(#[from] SourceError),

    #[error("invalid engine config: {0}")]
    Config(#[from] ConfigError),

    #[error("no resolved markets to search over")]
    NoRecords,

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("failed to append run log: {0}")]
    Log(#[from] DbError),

    #[error("failed to encode run log: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What to run
#[derive(Clone)]
pub struct SearchJob {
    pub config: EngineConfig,
    pub registry: Arc<SignalRegistry>,
    /// Hold back the most recent markets to validate the winner
    pub use_holdout: bool,
}

/// Train vs holdout fitness of the winning combo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldoutReport {
    pub combo_id: String,
    pub train_fitness: f64,
    pub holdout_fitness: f64,
    pub holdout_records: usize,
}

impl HoldoutReport {
    /// Negative when the combo does worse on unseen markets
    pub fn gap(&self) -> f64 {
        self.holdout_fitness - self.train_fitness
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub outcome: SearchOutcome,
    pub dataset_hash: String,
    pub train_records: usize,
    pub holdout_records: usize,
    pub holdout: Option<HoldoutReport>,
    /// Best fitness of the previous run over the same data, if any
    pub previous_best_fitness: Option<f64>,
}

/// Run one complete search against `source`, persisting into `pool`.
///
/// Progress and errors are mirrored into `progress` so a status endpoint
/// can follow along.
pub async fn execute(
    job: &SearchJob,
    source: &dyn HistoricalSource,
    pool: SqlitePool,
    progress: &SearchProgress,
) -> Result<RunSummary, RunError> {
    let result = execute_inner(job, source, pool, progress).await;
    if let Err(e) = &result {
        if !matches!(e, RunError::Search(SearchError::Cancelled { .. })) {
            progress.fail(e.to_string());
        }
    }
    result
}

async fn execute_inner(
    job: &SearchJob,
    source: &dyn HistoricalSource,
    pool: SqlitePool,
    progress: &SearchProgress,
) -> Result<RunSummary, RunError> {
    let started_at = Utc::now().timestamp_millis();
    let run_id = started_at.to_string();
    job.config.validate()?;
    progress.set_status(SearchStatus::LoadingData);

    // ── Load ────────────────────────────────────────────────────────────
    let records = source.resolved_records().await?;
    if records.is_empty() {
        return Err(RunError::NoRecords);
    }
    let profiles = source.profiles_for(&participants(&records)).await?;
    info!(
        markets = records.len(),
        wallets = profiles.len(),
        "Loaded historical data"
    );

    let holdout_config = if job.use_holdout {
        job.config.holdout.clone()
    } else {
        HoldoutConfig {
            fraction: 0.0,
            ..job.config.holdout.clone()
        }
    };
    let split = split_holdout(records, &holdout_config);
    info!(
        train = split.train.len(),
        holdout = split.holdout.len(),
        "Temporal holdout split"
    );

    let dataset_hash = dataset_fingerprint(&split.train, &job.config);
    let previous = SearchRunRepository::new(&pool)
        .latest_for_dataset(&dataset_hash)
        .await?;

    // ── Search ──────────────────────────────────────────────────────────
    let replayer = Replayer::new(job.registry.clone(), job.config.backtest.clone())?;
    let mut store = ResultStore::new(pool.clone());
    let ctx = SearchContext {
        replayer: &replayer,
        weights: job.config.fitness,
        config: &job.config.search,
        records: &split.train,
        profiles: &profiles,
        run_id: &run_id,
    };
    let outcome = run_search(ctx, &mut store, progress).await?;

    // ── Holdout ─────────────────────────────────────────────────────────
    let holdout = match (&outcome.best, split.has_holdout()) {
        (Some(best), true) => validate_on_holdout(&replayer, job, best, &split.holdout, &profiles),
        _ => None,
    };
    if let Some(report) = &holdout {
        if report.gap() < 0.0 {
            warn!(
                combo = %report.combo_id,
                train = report.train_fitness,
                holdout = report.holdout_fitness,
                gap = report.gap(),
                "Winner degrades on holdout markets"
            );
        } else {
            info!(
                combo = %report.combo_id,
                train = report.train_fitness,
                holdout = report.holdout_fitness,
                gap = report.gap(),
                "Holdout validation"
            );
        }
    }

    // ── Run log ─────────────────────────────────────────────────────────
    let record = SearchRunRecord {
        id: None,
        run_id: run_id.clone(),
        started_at,
        finished_at: Utc::now().timestamp_millis(),
        dataset_hash: dataset_hash.clone(),
        train_records: split.train.len() as i64,
        holdout_records: split.holdout.len() as i64,
        best_combo_id: outcome.best.as_ref().map(ComboResult::id),
        best_fitness: outcome.best.as_ref().map(|b| b.fitness),
        holdout_fitness: holdout.as_ref().map(|h| h.holdout_fitness),
        top_json: serde_json::to_string(&outcome.top)?,
        stages_json: serde_json::to_string(&outcome.stages)?,
    };
    SearchRunRepository::new(&pool).append(&record).await?;

    let previous_best_fitness = previous.and_then(|p| p.best_fitness);
    if let (Some(prev), Some(best)) = (previous_best_fitness, &outcome.best) {
        info!(
            previous = prev,
            current = best.fitness,
            "Compared with last run on the same data"
        );
    }

    Ok(RunSummary {
        outcome,
        dataset_hash,
        train_records: split.train.len(),
        holdout_records: split.holdout.len(),
        holdout,
        previous_best_fitness,
    })
}

fn validate_on_holdout(
    replayer: &Replayer,
    job: &SearchJob,
    best: &ComboResult,
    holdout: &[HistoricalRecord],
    profiles: &crate::profiles::ProfileBook,
) -> Option<HoldoutReport> {
    match replayer.replay(&best.combo, holdout, profiles) {
        Ok(stats) => {
            let holdout_fitness = job.config.fitness.score(
                stats.accuracy,
                stats.edge,
                stats.false_positive_rate,
                stats.complexity,
                job.registry.total_count(),
            );
            Some(HoldoutReport {
                combo_id: best.id(),
                train_fitness: best.fitness,
                holdout_fitness,
                holdout_records: stats.evaluated_records,
            })
        }
        Err(e) => {
            warn!(combo = %best.combo, error = %e, "Holdout replay failed");
            None
        }
    }
}

/// Deterministic hash of what a run saw: market ids, outcomes, trade counts
/// and the engine config
pub fn dataset_fingerprint(records: &[HistoricalRecord], config: &EngineConfig) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        let outcome = record.outcome.map(|o| o.as_str()).unwrap_or("-");
        hasher.update(format!("{}:{}:{};", record.id, outcome, record.actions.len()).as_bytes());
    }
    hasher.update(serde_json::to_string(config).unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}
