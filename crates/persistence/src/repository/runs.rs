//! Search-run log: append-only history of completed searches

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One completed search run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SearchRunRecord {
    pub id: Option<i64>,
    pub run_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    /// Fingerprint of the training data + engine config the run saw
    pub dataset_hash: String,
    pub train_records: i64,
    pub holdout_records: i64,
    pub best_combo_id: Option<String>,
    pub best_fitness: Option<f64>,
    pub holdout_fitness: Option<f64>,
    /// JSON array of the run's top results
    pub top_json: String,
    /// JSON array of per-stage reports
    pub stages_json: String,
}

/// Repository for the search-run log. Rows are never updated or deleted.
pub struct SearchRunRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SearchRunRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, record: &SearchRunRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO search_runs
                (run_id, started_at, finished_at, dataset_hash, train_records,
                 holdout_records, best_combo_id, best_fitness, holdout_fitness,
                 top_json, stages_json)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&record.run_id)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.dataset_hash)
        .bind(record.train_records)
        .bind(record.holdout_records)
        .bind(&record.best_combo_id)
        .bind(record.best_fitness)
        .bind(record.holdout_fitness)
        .bind(&record.top_json)
        .bind(&record.stages_json)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent runs first
    pub async fn recent(&self, limit: i64) -> DbResult<Vec<SearchRunRecord>> {
        let records = sqlx::query_as::<_, SearchRunRecord>(
            r#"SELECT id, run_id, started_at, finished_at, dataset_hash, train_records,
                      holdout_records, best_combo_id, best_fitness, holdout_fitness,
                      top_json, stages_json
               FROM search_runs
               ORDER BY finished_at DESC, id DESC
               LIMIT ?"#,
        )
        .bind(limit.max(0))
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Previous run over the same dataset, for trend comparison
    pub async fn latest_for_dataset(&self, dataset_hash: &str) -> DbResult<Option<SearchRunRecord>> {
        let record = sqlx::query_as::<_, SearchRunRecord>(
            r#"SELECT id, run_id, started_at, finished_at, dataset_hash, train_records,
                      holdout_records, best_combo_id, best_fitness, holdout_fitness,
                      top_json, stages_json
               FROM search_runs
               WHERE dataset_hash = ?
               ORDER BY finished_at DESC, id DESC
               LIMIT 1"#,
        )
        .bind(dataset_hash)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }
}
