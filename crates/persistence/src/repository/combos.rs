//! Combo results repository: the bounded leaderboard of evaluated method combos

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A single evaluated combo as stored in `combo_results`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ComboResultRecord {
    pub id: Option<i64>,
    pub combo_id: String,
    /// JSON array of member ids
    pub members: String,
    pub accuracy: f64,
    pub edge: f64,
    pub false_positive_rate: f64,
    pub complexity: i64,
    pub fitness: f64,
    pub evaluated_records: i64,
    /// Unix millis
    pub tested_at: i64,
    pub run_id: Option<String>,
}

const SELECT_COLUMNS: &str = "id, combo_id, members, accuracy, edge, false_positive_rate, \
     complexity, fitness, evaluated_records, tested_at, run_id";

/// Repository for combo results
pub struct ComboRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ComboRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Write a batch of results in one transaction.
    ///
    /// Existing rows are only replaced by a strictly higher fitness, so a
    /// worse re-evaluation never overwrites a better one. Returns the number
    /// of rows inserted or updated. On error nothing from the batch is visible.
    pub async fn upsert_batch(&self, records: &[ComboResultRecord]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for record in records {
            let result = sqlx::query(
                r#"INSERT INTO combo_results
                    (combo_id, members, accuracy, edge, false_positive_rate,
                     complexity, fitness, evaluated_records, tested_at, run_id)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                   ON CONFLICT(combo_id) DO UPDATE SET
                     members = excluded.members,
                     accuracy = excluded.accuracy,
                     edge = excluded.edge,
                     false_positive_rate = excluded.false_positive_rate,
                     complexity = excluded.complexity,
                     fitness = excluded.fitness,
                     evaluated_records = excluded.evaluated_records,
                     tested_at = excluded.tested_at,
                     run_id = excluded.run_id
                   WHERE excluded.fitness > combo_results.fitness
                "#,
            )
            .bind(&record.combo_id)
            .bind(&record.members)
            .bind(record.accuracy)
            .bind(record.edge)
            .bind(record.false_positive_rate)
            .bind(record.complexity)
            .bind(record.fitness)
            .bind(record.evaluated_records)
            .bind(record.tested_at)
            .bind(&record.run_id)
            .execute(&mut *tx)
            .await?;

            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Delete everything except the top `keep` rows by fitness (newest first on ties).
    /// Returns the number of rows deleted.
    pub async fn prune_keep_top(&self, keep: i64) -> DbResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM combo_results WHERE id NOT IN (
                   SELECT id FROM combo_results
                   ORDER BY fitness DESC, tested_at DESC, id DESC
                   LIMIT ?1
               )"#,
        )
        .bind(keep.max(0))
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Top `limit` rows, fitness descending, newest first on ties
    pub async fn top(&self, limit: i64) -> DbResult<Vec<ComboResultRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM combo_results
             ORDER BY fitness DESC, tested_at DESC, id DESC
             LIMIT ?"
        );
        let records = sqlx::query_as::<_, ComboResultRecord>(&sql)
            .bind(limit.max(0))
            .fetch_all(self.pool)
            .await?;

        Ok(records)
    }

    /// Get a row by its canonical combo id
    pub async fn get(&self, combo_id: &str) -> DbResult<Option<ComboResultRecord>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM combo_results WHERE combo_id = ?");
        let record = sqlx::query_as::<_, ComboResultRecord>(&sql)
            .bind(combo_id)
            .fetch_optional(self.pool)
            .await?;

        Ok(record)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM combo_results")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }
}
