//! Result store: bounded, fitness-ranked leaderboard of combos
//!
//! Upserts are buffered in memory and only reach SQLite on [`ResultStore::flush`],
//! one transaction per batch.

use std::collections::HashMap;

use persistence::repository::{ComboRepository, ComboResultRecord};
use persistence::{DbError, SqlitePool};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::backtest::ReplayStats;
use crate::combo::Combo;

/// One scored combo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboResult {
    pub combo: Combo,
    pub accuracy: f64,
    pub edge: f64,
    pub false_positive_rate: f64,
    pub complexity: usize,
    pub fitness: f64,
    pub evaluated_records: usize,
    /// Unix millis
    pub tested_at: i64,
    pub run_id: Option<String>,
}

impl ComboResult {
    pub fn from_stats(combo: Combo, stats: &ReplayStats, fitness: f64, run_id: Option<&str>) -> Self {
        Self {
            combo,
            accuracy: stats.accuracy,
            edge: stats.edge,
            false_positive_rate: stats.false_positive_rate,
            complexity: stats.complexity,
            fitness,
            evaluated_records: stats.evaluated_records,
            tested_at: chrono::Utc::now().timestamp_millis(),
            run_id: run_id.map(str::to_string),
        }
    }

    /// Canonical combo id
    pub fn id(&self) -> String {
        self.combo.id()
    }

    fn to_record(&self) -> Result<ComboResultRecord, StoreError> {
        Ok(ComboResultRecord {
            id: None,
            combo_id: self.combo.id(),
            members: serde_json::to_string(&self.combo.member_strings())?,
            accuracy: self.accuracy,
            edge: self.edge,
            false_positive_rate: self.false_positive_rate,
            complexity: self.complexity as i64,
            fitness: self.fitness,
            evaluated_records: self.evaluated_records as i64,
            tested_at: self.tested_at,
            run_id: self.run_id.clone(),
        })
    }
}

impl TryFrom<ComboResultRecord> for ComboResult {
    type Error = StoreError;

    fn try_from(record: ComboResultRecord) -> Result<Self, Self::Error> {
        let combo: Combo = record.combo_id.parse().map_err(|e| StoreError::Corrupt {
            combo_id: record.combo_id.clone(),
            reason: format!("{e}"),
        })?;
        Ok(Self {
            combo,
            accuracy: record.accuracy,
            edge: record.edge,
            false_positive_rate: record.false_positive_rate,
            complexity: record.complexity.max(0) as usize,
            fitness: record.fitness,
            evaluated_records: record.evaluated_records.max(0) as usize,
            tested_at: record.tested_at,
            run_id: record.run_id,
        })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("result store write failed: {0}")]
    Db(#[from] DbError),

    #[error("stored combo '{combo_id}' is unreadable: {reason}")]
    Corrupt { combo_id: String, reason: String },

    #[error("failed to encode combo members: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Batching facade over `combo_results`
pub struct ResultStore {
    pool: SqlitePool,
    pending: HashMap<String, ComboResult>,
}

impl ResultStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            pending: HashMap::new(),
        }
    }

    /// Buffer `result`, keeping the better of it and any pending entry for
    /// the same combo. Nothing is written until [`flush`](Self::flush).
    ///
    /// Returns false if an equal or better result was already pending.
    pub fn upsert(&mut self, result: ComboResult) -> bool {
        let id = result.id();
        match self.pending.get(&id) {
            Some(existing) if existing.fitness >= result.fitness => false,
            _ => {
                self.pending.insert(id, result);
                true
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Write every pending result in one transaction.
    ///
    /// Rows already stored with a higher or equal fitness are left alone.
    /// On error the batch stays pending so a later flush can retry it.
    pub async fn flush(&mut self) -> Result<u64, StoreError> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let mut batch: Vec<&ComboResult> = self.pending.values().collect();
        batch.sort_by_key(|r| r.combo.clone());
        let records = batch
            .into_iter()
            .map(ComboResult::to_record)
            .collect::<Result<Vec<_>, _>>()?;

        let written = ComboRepository::new(&self.pool)
            .upsert_batch(&records)
            .await?;

        debug!(batch = records.len(), written, "Flushed combo results");
        self.pending.clear();
        Ok(written)
    }

    /// Delete everything but the best `keep` results (fitness, then recency)
    pub async fn prune(&self, keep: usize) -> Result<u64, StoreError> {
        let deleted = ComboRepository::new(&self.pool)
            .prune_keep_top(keep as i64)
            .await?;
        info!(keep, deleted, "Pruned result store");
        Ok(deleted)
    }

    /// Best `n` stored results, fitness descending, newer first on ties
    pub async fn top(&self, n: usize) -> Result<Vec<ComboResult>, StoreError> {
        ComboRepository::new(&self.pool)
            .top(n as i64)
            .await?
            .into_iter()
            .map(ComboResult::try_from)
            .collect()
    }

    pub async fn get(&self, combo: &Combo) -> Result<Option<ComboResult>, StoreError> {
        ComboRepository::new(&self.pool)
            .get(&combo.id())
            .await?
            .map(ComboResult::try_from)
            .transpose()
    }

    /// Stored (flushed) results
    pub async fn len(&self) -> Result<usize, StoreError> {
        let count = ComboRepository::new(&self.pool).count().await?;
        Ok(count.max(0) as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}
