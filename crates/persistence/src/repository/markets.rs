//! Market data repository: resolved/open markets, their trades and wallet profiles
//!
//! The ingestion layer owns writing these tables; the search engine only reads.
//! The save helpers exist for backfills and tests.

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

/// SQLite caps bound parameters per statement; stay well below it.
const WALLET_CHUNK: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MarketRecord {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub end_at: i64,
    pub resolved: bool,
    /// "YES" / "NO" once resolved
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub market_id: String,
    pub wallet: String,
    pub side: String,
    pub amount: String,
    pub price: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WalletRecord {
    pub address: String,
    pub first_seen: i64,
    pub total_bets: i64,
    pub total_volume: f64,
    pub win_rate: f64,
    pub rationality_score: f64,
    pub flagged_suspicious: bool,
    pub flagged_sandpit: bool,
}

pub struct MarketRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MarketRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save_market(&self, market: &MarketRecord) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO markets (id, title, created_at, end_at, resolved, outcome)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 created_at = excluded.created_at,
                 end_at = excluded.end_at,
                 resolved = excluded.resolved,
                 outcome = excluded.outcome
            "#,
        )
        .bind(&market.id)
        .bind(&market.title)
        .bind(market.created_at)
        .bind(market.end_at)
        .bind(market.resolved)
        .bind(&market.outcome)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_trades(&self, trades: &[TradeRecord]) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;
        for trade in trades {
            sqlx::query(
                r#"INSERT INTO trades (market_id, wallet, side, amount, price, timestamp)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            )
            .bind(&trade.market_id)
            .bind(&trade.wallet)
            .bind(&trade.side)
            .bind(&trade.amount)
            .bind(&trade.price)
            .bind(trade.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(trades.len())
    }

    pub async fn save_wallet(&self, wallet: &WalletRecord) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO wallets
                (address, first_seen, total_bets, total_volume, win_rate,
                 rationality_score, flagged_suspicious, flagged_sandpit)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
               ON CONFLICT(address) DO UPDATE SET
                 first_seen = excluded.first_seen,
                 total_bets = excluded.total_bets,
                 total_volume = excluded.total_volume,
                 win_rate = excluded.win_rate,
                 rationality_score = excluded.rationality_score,
                 flagged_suspicious = excluded.flagged_suspicious,
                 flagged_sandpit = excluded.flagged_sandpit
            "#,
        )
        .bind(&wallet.address)
        .bind(wallet.first_seen)
        .bind(wallet.total_bets)
        .bind(wallet.total_volume)
        .bind(wallet.win_rate)
        .bind(wallet.rationality_score)
        .bind(wallet.flagged_suspicious)
        .bind(wallet.flagged_sandpit)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Resolved markets with a known outcome, oldest end first
    pub async fn resolved_markets(&self) -> DbResult<Vec<MarketRecord>> {
        let records = sqlx::query_as::<_, MarketRecord>(
            r#"SELECT id, title, created_at, end_at, resolved, outcome
               FROM markets
               WHERE resolved = 1 AND outcome IS NOT NULL
               ORDER BY end_at ASC, id ASC"#,
        )
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Unresolved markets, soonest end first
    pub async fn open_markets(&self, limit: i64) -> DbResult<Vec<MarketRecord>> {
        let records = sqlx::query_as::<_, MarketRecord>(
            r#"SELECT id, title, created_at, end_at, resolved, outcome
               FROM markets
               WHERE resolved = 0
               ORDER BY end_at ASC, id ASC
               LIMIT ?"#,
        )
        .bind(limit.max(0))
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Trades for one market in chronological order
    pub async fn trades_for_market(&self, market_id: &str) -> DbResult<Vec<TradeRecord>> {
        let records = sqlx::query_as::<_, TradeRecord>(
            r#"SELECT id, market_id, wallet, side, amount, price, timestamp
               FROM trades
               WHERE market_id = ?
               ORDER BY timestamp ASC, id ASC"#,
        )
        .bind(market_id)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Wallet profiles for exactly the given addresses.
    ///
    /// There is deliberately no "all wallets" query: callers must name the
    /// identities they need.
    pub async fn wallets_for<S: AsRef<str>>(&self, addresses: &[S]) -> DbResult<Vec<WalletRecord>> {
        let mut out = Vec::with_capacity(addresses.len());

        for chunk in addresses.chunks(WALLET_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT address, first_seen, total_bets, total_volume, win_rate, \
                 rationality_score, flagged_suspicious, flagged_sandpit \
                 FROM wallets WHERE address IN (",
            );
            let mut separated = builder.separated(", ");
            for address in chunk {
                separated.push_bind(address.as_ref().to_string());
            }
            separated.push_unseparated(")");

            let records = builder
                .build_query_as::<WalletRecord>()
                .fetch_all(self.pool)
                .await?;
            out.extend(records);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn market(id: &str, end_at: i64, outcome: Option<&str>) -> MarketRecord {
        MarketRecord {
            id: id.to_string(),
            title: format!("Market {id}"),
            created_at: 0,
            end_at,
            resolved: outcome.is_some(),
            outcome: outcome.map(str::to_string),
        }
    }

    fn wallet(address: &str) -> WalletRecord {
        WalletRecord {
            address: address.to_string(),
            first_seen: 0,
            total_bets: 12,
            total_volume: 5_000.0,
            win_rate: 0.7,
            rationality_score: 0.6,
            flagged_suspicious: false,
            flagged_sandpit: false,
        }
    }

    #[tokio::test]
    async fn test_resolved_and_open_markets_are_separated() {
        let db = Database::in_memory().await.unwrap();
        let repo = MarketRepository::new(db.pool());

        repo.save_market(&market("m2", 200, Some("NO"))).await.unwrap();
        repo.save_market(&market("m1", 100, Some("YES"))).await.unwrap();
        repo.save_market(&market("m3", 300, None)).await.unwrap();

        let resolved = repo.resolved_markets().await.unwrap();
        let ids: Vec<&str> = resolved.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        let open = repo.open_markets(10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "m3");
    }

    #[tokio::test]
    async fn test_trades_come_back_in_time_order() {
        let db = Database::in_memory().await.unwrap();
        let repo = MarketRepository::new(db.pool());

        let trade = |ts: i64| TradeRecord {
            id: None,
            market_id: "m1".to_string(),
            wallet: "0xa".to_string(),
            side: "YES".to_string(),
            amount: "10.5".to_string(),
            price: "0.42".to_string(),
            timestamp: ts,
        };
        repo.save_trades(&[trade(30), trade(10), trade(20)]).await.unwrap();

        let trades = repo.trades_for_market("m1").await.unwrap();
        let ts: Vec<i64> = trades.iter().map(|t| t.timestamp).collect();
        assert_eq!(ts, vec![10, 20, 30]);
        assert_eq!(trades[0].amount, "10.5");
    }

    #[tokio::test]
    async fn test_wallets_for_returns_only_requested() {
        let db = Database::in_memory().await.unwrap();
        let repo = MarketRepository::new(db.pool());

        for addr in ["0xa", "0xb", "0xc"] {
            repo.save_wallet(&wallet(addr)).await.unwrap();
        }

        let found = repo.wallets_for(&["0xa", "0xc", "0xmissing"]).await.unwrap();
        let mut addrs: Vec<&str> = found.iter().map(|w| w.address.as_str()).collect();
        addrs.sort();
        assert_eq!(addrs, vec!["0xa", "0xc"]);

        let none = repo.wallets_for::<&str>(&[]).await.unwrap();
        assert!(none.is_empty());
    }
}
