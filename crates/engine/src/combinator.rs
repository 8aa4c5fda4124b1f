//! Staged combinator: bounded search over method combos
//!
//! Stage 1 (within category): every combo of up to `max_subset_size` members
//! drawn from one category at a time. The best `finalists_per_category` of
//! each category become finalists.
//!
//! Stage 2 (cross category): unions of 2..=`max_finalist_group` finalists.
//! Finalists are the building blocks, never the individual methods, so the
//! stage is polynomial in the finalist count.
//!
//! Stage 3 (refinement): best-improvement hill climbing from each of the
//! `stage2_top_n` best Stage 2 combos, one active method added or removed at
//! a time, until nothing improves or `max_refinement_iterations` is reached.
//!
//! The store is flushed after Stage 1, after Stage 2 and after every Stage 3
//! pass, then pruned to `store_capacity`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backtest::{BacktestConfig, ConfigError, Replayer};
use crate::combo::{combos_up_to, index_combinations, Combo};
use crate::fitness::FitnessWeights;
use crate::holdout::HoldoutConfig;
use crate::profiles::ProfileBook;
use crate::result_store::{ComboResult, ResultStore, StoreError};
use crate::types::HistoricalRecord;

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Largest combo Stage 1 builds inside a category
    pub max_subset_size: usize,
    /// Stage 1 survivors per category
    pub finalists_per_category: usize,
    /// Most finalists merged into one Stage 2 combo
    pub max_finalist_group: usize,
    /// Stage 2 combos refined in Stage 3
    pub stage2_top_n: usize,
    pub max_refinement_iterations: usize,
    /// Rows kept by the final prune
    pub store_capacity: usize,
    /// A stage skipping more than this share of its candidates is flagged
    pub skip_warning_fraction: f64,
    /// Yield to the runtime every N evaluations
    pub yield_every: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_subset_size: 3,
            finalists_per_category: 3,
            max_finalist_group: 3,
            stage2_top_n: 10,
            max_refinement_iterations: 20,
            store_capacity: 50,
            skip_warning_fraction: 0.25,
            yield_every: 50,
        }
    }
}

/// Everything tunable about a search, loadable from one JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fitness: FitnessWeights,
    pub backtest: BacktestConfig,
    pub search: SearchConfig,
    pub holdout: HoldoutConfig,
}

impl EngineConfig {
    /// Checked before any data is loaded
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backtest.validate()?;
        if !(0.0..1.0).contains(&self.holdout.fraction) {
            return Err(ConfigError::OutOfRange {
                field: "holdout.fraction",
                range: "[0, 1)",
                value: self.holdout.fraction,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Progress
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Idle,
    LoadingData,
    Stage1WithinCategory,
    Stage2CrossCategory,
    Stage3Refinement,
    Complete,
    Cancelled,
    Error,
}

impl SearchStatus {
    /// Loading data or inside one of the three stages
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::LoadingData
                | Self::Stage1WithinCategory
                | Self::Stage2CrossCategory
                | Self::Stage3Refinement
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    WithinCategory,
    CrossCategory,
    Refinement,
    Prune,
}

impl Stage {
    fn status(&self) -> SearchStatus {
        match self {
            Self::WithinCategory => SearchStatus::Stage1WithinCategory,
            Self::CrossCategory => SearchStatus::Stage2CrossCategory,
            Self::Refinement | Self::Prune => SearchStatus::Stage3Refinement,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WithinCategory => "stage 1 (within category)",
            Self::CrossCategory => "stage 2 (cross category)",
            Self::Refinement => "stage 3 (refinement)",
            Self::Prune => "final prune",
        };
        f.write_str(name)
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Shared progress tracker for a running search
pub struct SearchProgress {
    pub status: RwLock<SearchStatus>,
    pub current_combo: RwLock<String>,
    pub attempted: AtomicU32,
    pub skipped: AtomicU32,
    pub scored: AtomicU32,
    pub cancelled: AtomicBool,
    pub best_so_far: RwLock<Vec<ComboResult>>,
    pub error_message: RwLock<Option<String>>,
    pub started_at: RwLock<Option<String>>,
}

impl SearchProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(SearchStatus::Idle),
            current_combo: RwLock::new(String::new()),
            attempted: AtomicU32::new(0),
            skipped: AtomicU32::new(0),
            scored: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            best_so_far: RwLock::new(Vec::new()),
            error_message: RwLock::new(None),
            started_at: RwLock::new(None),
        }
    }

    pub fn reset(&self) {
        *write(&self.status) = SearchStatus::LoadingData;
        self.clear();
    }

    /// Claim the tracker for a new run. Returns false if a search is already
    /// active; the check and the move to `LoadingData` happen under one lock.
    pub fn try_start(&self) -> bool {
        {
            let mut status = write(&self.status);
            if status.is_active() {
                return false;
            }
            *status = SearchStatus::LoadingData;
        }
        self.clear();
        true
    }

    fn clear(&self) {
        write(&self.current_combo).clear();
        self.attempted.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.scored.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        write(&self.best_so_far).clear();
        *write(&self.error_message) = None;
        *write(&self.started_at) = Some(Utc::now().to_rfc3339());
    }

    pub fn status(&self) -> SearchStatus {
        *read(&self.status)
    }

    pub fn set_status(&self, status: SearchStatus) {
        *write(&self.status) = status;
    }

    pub fn fail(&self, message: impl Into<String>) {
        *write(&self.error_message) = Some(message.into());
        self.set_status(SearchStatus::Error);
    }

    /// Ask the search to stop at the next evaluation boundary
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.status().is_active()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            status: self.status(),
            current_combo: read(&self.current_combo).clone(),
            attempted: self.attempted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            scored: self.scored.load(Ordering::Relaxed),
            best_so_far: read(&self.best_so_far).clone(),
            error_message: read(&self.error_message).clone(),
            started_at: read(&self.started_at).clone(),
        }
    }
}

impl Default for SearchProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`SearchProgress`] for status endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: SearchStatus,
    pub current_combo: String,
    pub attempted: u32,
    pub skipped: u32,
    pub scored: u32,
    pub best_so_far: Vec<ComboResult>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
}

// ============================================================================
// Reports & errors
// ============================================================================

/// Per-stage accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Candidates considered, cache hits included
    pub attempted: usize,
    /// No data, unknown member or retired member
    pub skipped: usize,
    pub scored: usize,
    pub largest_combo: usize,
    /// Rows written by this stage's flushes
    pub rows_written: u64,
    /// Skipped share exceeded `skip_warning_fraction`
    pub degraded: bool,
}

impl StageReport {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            attempted: 0,
            skipped: 0,
            scored: 0,
            largest_combo: 0,
            rows_written: 0,
            degraded: false,
        }
    }

    fn skipped_fraction(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.skipped as f64 / self.attempted as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub run_id: String,
    pub stages: Vec<StageReport>,
    /// Best combo found by this run
    pub best: Option<ComboResult>,
    /// Store leaderboard after the final prune
    pub top: Vec<ComboResult>,
    pub pruned: u64,
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("search cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("registry has no active signals")]
    NoActiveSignals,
}

// ============================================================================
// Search
// ============================================================================

/// Inputs shared by every evaluation of one search
pub struct SearchContext<'a> {
    pub replayer: &'a Replayer,
    pub weights: FitnessWeights,
    pub config: &'a SearchConfig,
    pub records: &'a [HistoricalRecord],
    pub profiles: &'a ProfileBook,
    pub run_id: &'a str,
}

struct Search<'a, 'p> {
    ctx: SearchContext<'a>,
    store: &'a mut ResultStore,
    progress: &'p SearchProgress,
    /// Every combo evaluated this run; `None` = skipped
    cache: HashMap<Combo, Option<ComboResult>>,
    evaluations: u32,
}

/// Run all three stages, then prune the store.
///
/// Results are upserted into `store` as they are scored; each stage's
/// batch is flushed before the next stage starts, so a failure in a later
/// stage keeps everything flushed before it.
pub async fn run_search(
    ctx: SearchContext<'_>,
    store: &mut ResultStore,
    progress: &SearchProgress,
) -> Result<SearchOutcome, SearchError> {
    let registry = ctx.replayer.registry();
    if registry.active_count() == 0 {
        return Err(SearchError::NoActiveSignals);
    }

    info!(
        run_id = %ctx.run_id,
        active = registry.active_count(),
        total = registry.total_count(),
        records = ctx.records.len(),
        "Starting combo search"
    );

    let mut search = Search {
        ctx,
        store,
        progress,
        cache: HashMap::new(),
        evaluations: 0,
    };
    let mut stages = Vec::with_capacity(3);

    // ── Stage 1 ─────────────────────────────────────────────────────────
    let (finalists, report) = search.within_category().await?;
    stages.push(report);

    // ── Stage 2 ─────────────────────────────────────────────────────────
    let (mut seeds, report) = search.cross_category(&finalists).await?;
    stages.push(report);
    if seeds.is_empty() {
        // Nothing to merge (e.g. a single finalist): refine the finalists
        seeds = top_n(finalists, search.ctx.config.stage2_top_n);
    }

    // ── Stage 3 ─────────────────────────────────────────────────────────
    let (refined, report) = search.refine(&seeds).await?;
    stages.push(report);

    // ── Prune ───────────────────────────────────────────────────────────
    let capacity = search.ctx.config.store_capacity;
    let pruned = search
        .store
        .prune(capacity)
        .await
        .map_err(|source| SearchError::Stage {
            stage: Stage::Prune,
            source,
        })?;
    let top = search
        .store
        .top(capacity)
        .await
        .map_err(|source| SearchError::Stage {
            stage: Stage::Prune,
            source,
        })?;

    let best = refined
        .into_iter()
        .chain(seeds)
        .max_by(|a, b| {
            a.fitness
                .total_cmp(&b.fitness)
                .then_with(|| b.combo.cmp(&a.combo))
        });

    *write(&search.progress.best_so_far) = top.clone();
    search.progress.set_status(SearchStatus::Complete);

    info!(
        run_id = %search.ctx.run_id,
        evaluations = search.evaluations,
        best = %best.as_ref().map(|b| b.id()).unwrap_or_default(),
        best_fitness = best.as_ref().map(|b| b.fitness).unwrap_or(f64::NAN),
        pruned,
        "Combo search complete"
    );

    Ok(SearchOutcome {
        run_id: search.ctx.run_id.to_string(),
        stages,
        best,
        top,
        pruned,
    })
}

impl<'a, 'p> Search<'a, 'p> {
    async fn within_category(&mut self) -> Result<(Vec<ComboResult>, StageReport), SearchError> {
        let stage = Stage::WithinCategory;
        self.progress.set_status(stage.status());
        let mut report = StageReport::new(stage);
        let mut finalists = Vec::new();

        let groups = self.ctx.replayer.registry().active_by_category();
        for (category, ids) in &groups {
            let mut scored = Vec::new();
            for combo in combos_up_to(ids, self.ctx.config.max_subset_size) {
                self.checkpoint(stage).await?;
                if let Some(result) = self.evaluate(&combo, &mut report) {
                    scored.push(result);
                }
            }
            let picked = top_n(scored, self.ctx.config.finalists_per_category);
            debug!(
                category = %category,
                methods = ids.len(),
                finalists = ?picked.iter().map(ComboResult::id).collect::<Vec<_>>(),
                "Category finalists"
            );
            finalists.extend(picked);
        }

        self.finish_stage(&mut report).await?;
        info!(
            attempted = report.attempted,
            scored = report.scored,
            skipped = report.skipped,
            finalists = finalists.len(),
            "Stage 1 complete"
        );
        Ok((finalists, report))
    }

    async fn cross_category(
        &mut self,
        finalists: &[ComboResult],
    ) -> Result<(Vec<ComboResult>, StageReport), SearchError> {
        let stage = Stage::CrossCategory;
        self.progress.set_status(stage.status());
        let mut report = StageReport::new(stage);

        let mut seen: HashSet<Combo> = HashSet::new();
        let mut scored = Vec::new();
        let max_group = self.ctx.config.max_finalist_group.min(finalists.len());

        for k in 2..=max_group {
            for group in index_combinations(finalists.len(), k) {
                let Some(combo) = Combo::union(group.iter().map(|&i| &finalists[i].combo)) else {
                    continue;
                };
                if !seen.insert(combo.clone()) {
                    continue;
                }
                self.checkpoint(stage).await?;
                if let Some(result) = self.evaluate(&combo, &mut report) {
                    scored.push(result);
                }
            }
        }

        self.finish_stage(&mut report).await?;
        let top = top_n(scored, self.ctx.config.stage2_top_n);
        info!(
            finalists = finalists.len(),
            attempted = report.attempted,
            scored = report.scored,
            skipped = report.skipped,
            best = %top.first().map(ComboResult::id).unwrap_or_default(),
            "Stage 2 complete"
        );
        Ok((top, report))
    }

    async fn refine(
        &mut self,
        seeds: &[ComboResult],
    ) -> Result<(Vec<ComboResult>, StageReport), SearchError> {
        let stage = Stage::Refinement;
        self.progress.set_status(stage.status());
        let mut report = StageReport::new(stage);
        let active = self.ctx.replayer.registry().active_ids();
        let mut optima = Vec::with_capacity(seeds.len());

        for seed in seeds {
            let mut current = seed.clone();

            for iteration in 0..self.ctx.config.max_refinement_iterations {
                let mut best_move: Option<ComboResult> = None;

                let additions = active
                    .iter()
                    .filter(|id| !current.combo.contains(id))
                    .map(|id| current.combo.with(id));
                let removals = current
                    .combo
                    .members()
                    .filter_map(|id| current.combo.without(id))
                    .collect::<Vec<_>>();

                for neighbour in additions.chain(removals).collect::<Vec<_>>() {
                    self.checkpoint(stage).await?;
                    let Some(candidate) = self.evaluate(&neighbour, &mut report) else {
                        continue;
                    };
                    let beats_best = best_move
                        .as_ref()
                        .map_or(true, |b| candidate.fitness > b.fitness);
                    if candidate.fitness > current.fitness && beats_best {
                        best_move = Some(candidate);
                    }
                }

                self.flush(stage, &mut report).await?;

                match best_move {
                    Some(next) => {
                        debug!(
                            from = %current.combo,
                            to = %next.combo,
                            fitness = next.fitness,
                            iteration,
                            "Refinement step"
                        );
                        current = next;
                    }
                    None => break,
                }
            }
            optima.push(current);
        }

        self.finish_stage(&mut report).await?;
        info!(
            seeds = seeds.len(),
            attempted = report.attempted,
            scored = report.scored,
            skipped = report.skipped,
            "Stage 3 complete"
        );
        Ok((optima, report))
    }

    /// Score one combo, memoised for the run. Skips are logged, never fatal.
    fn evaluate(&mut self, combo: &Combo, report: &mut StageReport) -> Option<ComboResult> {
        report.attempted += 1;
        report.largest_combo = report.largest_combo.max(combo.len());

        if let Some(cached) = self.cache.get(combo) {
            match cached {
                Some(_) => report.scored += 1,
                None => report.skipped += 1,
            }
            return cached.clone();
        }

        self.progress.attempted.fetch_add(1, Ordering::Relaxed);
        self.evaluations += 1;
        if self.evaluations % self.ctx.config.yield_every.max(1) == 0 {
            *write(&self.progress.current_combo) = combo.id();
        }

        let registry = self.ctx.replayer.registry();
        let outcome = if let Some(retired) = combo.members().find(|id| !registry.is_active(id)) {
            debug!(combo = %combo, member = %retired, "Skipping combo with inactive member");
            None
        } else {
            match self
                .ctx
                .replayer
                .replay(combo, self.ctx.records, self.ctx.profiles)
            {
                Ok(stats) => {
                    let fitness = self.ctx.weights.score(
                        stats.accuracy,
                        stats.edge,
                        stats.false_positive_rate,
                        stats.complexity,
                        registry.total_count(),
                    );
                    let result =
                        ComboResult::from_stats(combo.clone(), &stats, fitness, Some(self.ctx.run_id));
                    self.store.upsert(result.clone());
                    Some(result)
                }
                Err(e) => {
                    debug!(combo = %combo, error = %e, "Skipping combo");
                    None
                }
            }
        };

        match outcome {
            Some(_) => {
                report.scored += 1;
                self.progress.scored.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                report.skipped += 1;
                self.progress.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.cache.insert(combo.clone(), outcome.clone());
        outcome
    }

    /// Cancellation point between evaluations; yields every `yield_every`
    async fn checkpoint(&mut self, stage: Stage) -> Result<(), SearchError> {
        if self.progress.is_cancelled() {
            info!(stage = %stage, "Search cancelled by user");
            // Keep what was already scored; losing it is an error, not a cancel
            self.store
                .flush()
                .await
                .map_err(|source| SearchError::Stage { stage, source })?;
            self.progress.set_status(SearchStatus::Cancelled);
            return Err(SearchError::Cancelled { stage });
        }
        if self.evaluations > 0 && self.evaluations % self.ctx.config.yield_every.max(1) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        Ok(())
    }

    async fn flush(&mut self, stage: Stage, report: &mut StageReport) -> Result<(), SearchError> {
        let written = self
            .store
            .flush()
            .await
            .map_err(|source| SearchError::Stage { stage, source })?;
        report.rows_written += written;
        Ok(())
    }

    async fn finish_stage(&mut self, report: &mut StageReport) -> Result<(), SearchError> {
        self.flush(report.stage, report).await?;

        if report.attempted > 0 && report.skipped_fraction() > self.ctx.config.skip_warning_fraction {
            report.degraded = true;
            warn!(
                stage = %report.stage,
                attempted = report.attempted,
                skipped = report.skipped,
                "Stage skipped a large share of its candidates; check the input data"
            );
        }

        let snapshot = self.cache.values().flatten().cloned().collect::<Vec<_>>();
        *write(&self.progress.best_so_far) = top_n(snapshot, self.ctx.config.stage2_top_n);
        Ok(())
    }
}

/// Highest fitness first, canonical id breaking ties
fn top_n(mut results: Vec<ComboResult>, n: usize) -> Vec<ComboResult> {
    results.sort_by(|a, b| {
        b.fitness
            .total_cmp(&a.fitness)
            .then_with(|| a.combo.cmp(&b.combo))
    });
    results.truncate(n);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combo::binomial;
    use crate::signal::{signal_fn, SignalFunction, SignalRegistry, SignalResult};
    use crate::types::Side;
    use persistence::Database;
    use std::sync::Arc;

    /// Knows the answer on markets whose index is below `hit_below`
    fn partial_oracle(hit_below: usize) -> impl SignalFunction {
        signal_fn(move |record, _, _| {
            let idx: usize = record.id.trim_start_matches('m').parse().unwrap_or(0);
            let Some(outcome) = record.outcome else {
                return Ok(SignalResult::neutral());
            };
            if idx < hit_below {
                Ok(SignalResult::new(outcome.sign(), 0.9))
            } else {
                Ok(SignalResult::neutral())
            }
        })
    }

    /// Knows the answer on markets `lo..hi` only
    fn range_oracle(lo: usize, hi: usize) -> impl SignalFunction {
        signal_fn(move |record, _, _| {
            let idx: usize = record.id.trim_start_matches('m').parse().unwrap_or(0);
            match record.outcome {
                Some(outcome) if (lo..hi).contains(&idx) => {
                    Ok(SignalResult::new(outcome.sign(), 0.9))
                }
                _ => Ok(SignalResult::neutral()),
            }
        })
    }

    fn constant(signal: f64, confidence: f64) -> impl SignalFunction {
        signal_fn(move |_, _, _| Ok(SignalResult::new(signal, confidence)))
    }

    fn records(n: usize) -> Vec<HistoricalRecord> {
        (0..n)
            .map(|i| HistoricalRecord {
                id: format!("m{i}"),
                title: String::new(),
                created_at: 0,
                end_at: 100,
                outcome: Some(if i % 3 == 0 { Side::No } else { Side::Yes }),
                actions: vec![],
            })
            .collect()
    }

    fn registry() -> SignalRegistry {
        SignalRegistry::builder()
            .register("A1", "A", "oracle on 10", partial_oracle(10))
            .register("A2", "A", "always yes", constant(1.0, 0.6))
            .register("A3", "A", "always no", constant(-1.0, 0.6))
            .register("A4", "A", "weak yes", constant(0.2, 0.3))
            .register("B1", "B", "oracle on 20", partial_oracle(20))
            .register("B2", "B", "always yes", constant(0.8, 0.9))
            .register("B3", "B", "silent", constant(0.0, 0.0))
            .register("C1", "C", "oracle on 25", partial_oracle(25))
            .register("C2", "C", "always no", constant(-0.5, 0.5))
            .build()
            .unwrap()
    }

    struct Harness {
        _db: Database,
        store: ResultStore,
        replayer: Replayer,
        config: SearchConfig,
        records: Vec<HistoricalRecord>,
        profiles: ProfileBook,
    }

    impl Harness {
        async fn new(registry: SignalRegistry, records: Vec<HistoricalRecord>) -> Self {
            let db = Database::in_memory().await.unwrap();
            let store = ResultStore::new(db.pool_clone());
            Self {
                _db: db,
                store,
                replayer: Replayer::new(Arc::new(registry), BacktestConfig::default()).unwrap(),
                config: SearchConfig::default(),
                records,
                profiles: ProfileBook::default(),
            }
        }

        /// Make every later flush of combos matching `pattern` fail
        async fn reject_writes(&self, pattern: &str) {
            let sql = format!(
                "CREATE TRIGGER reject_writes BEFORE INSERT ON combo_results
                 WHEN NEW.combo_id LIKE '{pattern}'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END"
            );
            sqlx::query(&sql).execute(self._db.pool()).await.unwrap();
        }

        async fn run(&mut self, progress: &SearchProgress) -> Result<SearchOutcome, SearchError> {
            let ctx = SearchContext {
                replayer: &self.replayer,
                weights: FitnessWeights::default(),
                config: &self.config,
                records: &self.records,
                profiles: &self.profiles,
                run_id: "test-run",
            };
            run_search(ctx, &mut self.store, progress).await
        }
    }

    #[tokio::test]
    async fn test_stage_cardinality_bounds() {
        let mut h = Harness::new(registry(), records(30)).await;
        let outcome = h.run(&SearchProgress::new()).await.unwrap();

        let stage1 = &outcome.stages[0];
        // A: 4+6+4, B: 3+3+1, C: 2+1
        assert_eq!(stage1.attempted, 24);
        assert!(stage1.largest_combo <= 3);

        // 3 categories × 3 finalists, except C which only has 3 combos
        let pool = 9;
        let stage2 = &outcome.stages[1];
        assert!(stage2.attempted as u128 <= binomial(pool, 2) + binomial(pool, 3));
        assert!(stage2.scored > 0);
    }

    #[tokio::test]
    async fn test_full_run_prunes_and_reports_best() {
        let mut h = Harness::new(registry(), records(30)).await;
        h.config.store_capacity = 5;
        let progress = SearchProgress::new();
        let outcome = h.run(&progress).await.unwrap();

        assert_eq!(progress.status(), SearchStatus::Complete);
        assert_eq!(outcome.stages.len(), 3);
        assert!(h.store.len().await.unwrap() <= 5);
        assert_eq!(outcome.top.len(), h.store.len().await.unwrap());

        let best = outcome.best.unwrap();
        // The broadest oracle must end up in the winner
        assert!(best.combo.contains(&"C1".parse().unwrap()));
        // Refinement never returns something worse than the best Stage 2 seed
        let stored_best = &outcome.top[0];
        assert!(best.fitness <= stored_best.fitness + 1e-12);
        assert_eq!(best.run_id.as_deref(), Some("test-run"));
    }

    #[tokio::test]
    async fn test_retired_methods_never_enter_search() {
        // A4 would be the best single method if it were active
        let registry = SignalRegistry::builder()
            .register("A1", "A", "weak", constant(0.3, 0.4))
            .register("A2", "A", "weak no", constant(-0.3, 0.4))
            .register("A4", "A", "oracle", partial_oracle(1_000))
            .register("B1", "B", "yes", constant(1.0, 0.6))
            .register("B2", "B", "no", constant(-1.0, 0.6))
            .retire("A4")
            .build()
            .unwrap();
        let mut h = Harness::new(registry, records(30)).await;

        // A stored result from before retirement
        let stale: Combo = "A4".parse().unwrap();
        h.store.upsert(ComboResult {
            combo: stale.clone(),
            accuracy: 1.0,
            edge: 0.0,
            false_positive_rate: 0.0,
            complexity: 1,
            fitness: 0.3,
            evaluated_records: 30,
            tested_at: 0,
            run_id: None,
        });
        h.store.flush().await.unwrap();

        let outcome = h.run(&SearchProgress::new()).await.unwrap();
        let a4 = "A4".parse().unwrap();
        let best = outcome.best.unwrap();
        assert!(!best.combo.contains(&a4));
        for result in h.store.top(100).await.unwrap() {
            if result.combo != stale {
                assert!(!result.combo.contains(&a4), "{} leaked", result.id());
            }
        }
    }

    #[tokio::test]
    async fn test_no_data_combos_are_never_stored() {
        // Only unresolved markets: every replay is NoData
        let open: Vec<HistoricalRecord> = records(10)
            .into_iter()
            .map(|mut r| {
                r.outcome = None;
                r
            })
            .collect();
        let mut h = Harness::new(registry(), open).await;
        let outcome = h.run(&SearchProgress::new()).await.unwrap();

        assert!(h.store.is_empty().await.unwrap());
        assert!(outcome.best.is_none());
        let stage1 = &outcome.stages[0];
        assert_eq!(stage1.scored, 0);
        assert_eq!(stage1.skipped, stage1.attempted);
        assert!(stage1.degraded);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_evaluation() {
        let mut h = Harness::new(registry(), records(30)).await;
        let progress = SearchProgress::new();
        progress.cancel();

        let err = h.run(&progress).await.unwrap_err();
        assert!(matches!(
            err,
            SearchError::Cancelled {
                stage: Stage::WithinCategory
            }
        ));
        assert_eq!(progress.status(), SearchStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failed_flush_on_cancel_is_reported() {
        let mut h = Harness::new(registry(), records(30)).await;
        h.store.upsert(ComboResult {
            combo: "A1".parse().unwrap(),
            accuracy: 0.5,
            edge: 0.0,
            false_positive_rate: 0.0,
            complexity: 1,
            fitness: 0.2,
            evaluated_records: 30,
            tested_at: 0,
            run_id: None,
        });
        h.reject_writes("%").await;
        let progress = SearchProgress::new();
        progress.cancel();

        let err = h.run(&progress).await.unwrap_err();
        assert!(
            matches!(
                err,
                SearchError::Stage {
                    stage: Stage::WithinCategory,
                    ..
                }
            ),
            "{err}"
        );
        assert_ne!(progress.status(), SearchStatus::Cancelled);
        // Still pending for a retry
        assert_eq!(h.store.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_later_stage_failure_keeps_stage1_rows() {
        let mut h = Harness::new(registry(), records(30)).await;
        h.config.max_subset_size = 1;
        // Stage 1 only writes single-method combos; Stage 2 writes merged ones
        h.reject_writes("%,%").await;

        let err = h.run(&SearchProgress::new()).await.unwrap_err();
        assert!(
            matches!(
                err,
                SearchError::Stage {
                    stage: Stage::CrossCategory,
                    ..
                }
            ),
            "{err}"
        );

        let stored = h.store.top(100).await.unwrap();
        assert_eq!(stored.len(), 9);
        assert!(stored.iter().all(|r| r.combo.len() == 1));
    }

    #[tokio::test]
    async fn test_refinement_stops_at_iteration_cap() {
        // Six disjoint oracles: every added member keeps improving fitness
        let mut builder = SignalRegistry::builder();
        for i in 0..6 {
            builder = builder.register(
                &format!("A{}", i + 1),
                "A",
                "oracle on five markets",
                range_oracle(i * 5, i * 5 + 5),
            );
        }
        let registry = builder.build().unwrap();

        let mut h = Harness::new(registry, records(30)).await;
        h.config.max_subset_size = 1;
        h.config.finalists_per_category = 1;
        h.config.max_refinement_iterations = 2;
        let outcome = h.run(&SearchProgress::new()).await.unwrap();

        // Seed A1; pass 1 tries 5 additions, pass 2 tries 4 additions and 2 removals
        assert_eq!(outcome.stages[2].attempted, 5 + 6);
        assert_eq!(outcome.best.unwrap().id(), "A1,A2,A3");

        h.config.max_refinement_iterations = 20;
        let outcome = h.run(&SearchProgress::new()).await.unwrap();
        assert_eq!(outcome.best.unwrap().combo.len(), 6);
    }

    #[test]
    fn test_try_start_admits_one_caller() {
        let progress = Arc::new(SearchProgress::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let progress = progress.clone();
                std::thread::spawn(move || progress.try_start())
            })
            .collect();
        let started = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(started, 1);
        assert_eq!(progress.status(), SearchStatus::LoadingData);

        progress.set_status(SearchStatus::Complete);
        assert!(progress.try_start());
    }

    #[tokio::test]
    async fn test_all_retired_is_an_error() {
        let registry = SignalRegistry::builder()
            .register("A1", "A", "x", constant(1.0, 1.0))
            .retire("A1")
            .build()
            .unwrap();
        let mut h = Harness::new(registry, records(5)).await;
        assert!(matches!(
            h.run(&SearchProgress::new()).await,
            Err(SearchError::NoActiveSignals)
        ));
    }

    #[tokio::test]
    async fn test_single_category_seeds_refinement_with_finalists() {
        let registry = SignalRegistry::builder()
            .register("A1", "A", "oracle", partial_oracle(15))
            .build()
            .unwrap();
        let mut h = Harness::new(registry, records(30)).await;
        let outcome = h.run(&SearchProgress::new()).await.unwrap();

        assert_eq!(outcome.stages[1].attempted, 0);
        assert_eq!(outcome.best.unwrap().id(), "A1");
    }

    #[tokio::test]
    async fn test_refinement_adds_missing_method() {
        // Stage 1 keeps only one finalist per category, and Stage 2 only ever
        // merges whole finalists; the winning triple needs Stage 3.
        let registry = SignalRegistry::builder()
            .register("A1", "A", "oracle 0-9", partial_oracle(10))
            .register("A2", "A", "wrong yes", constant(1.0, 0.05))
            .register("B1", "B", "silent", constant(0.0, 0.0))
            .register("B2", "B", "silent", constant(0.0, 0.0))
            .build()
            .unwrap();
        let mut h = Harness::new(registry, records(30)).await;
        h.config.finalists_per_category = 1;
        h.config.max_subset_size = 1;
        let outcome = h.run(&SearchProgress::new()).await.unwrap();

        // Stage 2 only sees A2 ∪ B1; climbing reaches A1 + A2
        assert_eq!(outcome.stages[1].attempted, 1);
        assert!(outcome.stages[2].attempted > 0);
        assert_eq!(outcome.best.unwrap().id(), "A1,A2");
    }

    #[tokio::test]
    async fn test_progress_snapshot_serializes() {
        let mut h = Harness::new(registry(), records(12)).await;
        let progress = SearchProgress::new();
        progress.reset();
        assert!(progress.is_running());
        h.run(&progress).await.unwrap();

        let snap = progress.snapshot();
        assert_eq!(snap.status, SearchStatus::Complete);
        assert!(snap.attempted > 0);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "complete");
    }

    #[test]
    fn test_engine_config_partial_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"search": {"store_capacity": 7}, "fitness": {"edge": 0.5}}"#)
                .unwrap();
        assert_eq!(config.search.store_capacity, 7);
        assert_eq!(config.search.max_subset_size, 3);
        assert_eq!(config.fitness.edge, 0.5);
        assert_eq!(config.backtest.cutoff_fraction, 0.70);
    }
}
