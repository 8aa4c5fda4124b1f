//! Historical data source: where resolved markets, their trades and wallet
//! profiles come from

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use persistence::repository::{MarketRecord, MarketRepository, TradeRecord, WalletRecord};
use persistence::{DbError, SqlitePool};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::profiles::ProfileBook;
use crate::types::{Action, HistoricalRecord, ParticipantProfile, Side};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Read side of the ingestion layer
#[async_trait::async_trait]
pub trait HistoricalSource: Send + Sync {
    /// Resolved markets with their trades, oldest end first
    async fn resolved_records(&self) -> Result<Vec<HistoricalRecord>, SourceError>;

    /// Open markets with their trades, soonest end first
    async fn open_records(&self, limit: usize) -> Result<Vec<HistoricalRecord>, SourceError>;

    /// Profiles for exactly these wallets
    async fn profiles_for(&self, wallets: &BTreeSet<String>) -> Result<ProfileBook, SourceError>;
}

// ============================================================================
// SQLite
// ============================================================================

/// Reads the `markets`, `trades` and `wallets` tables
pub struct SqliteHistoricalSource {
    pool: SqlitePool,
}

impl SqliteHistoricalSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn with_trades(&self, markets: Vec<MarketRecord>) -> Result<Vec<HistoricalRecord>, SourceError> {
        let repo = MarketRepository::new(&self.pool);
        let mut records = Vec::with_capacity(markets.len());
        for market in markets {
            let trades = repo.trades_for_market(&market.id).await?;
            records.push(to_historical(market, trades));
        }
        Ok(records)
    }
}

#[async_trait::async_trait]
impl HistoricalSource for SqliteHistoricalSource {
    async fn resolved_records(&self) -> Result<Vec<HistoricalRecord>, SourceError> {
        let markets = MarketRepository::new(&self.pool).resolved_markets().await?;
        let records = self.with_trades(markets).await?;
        debug!(markets = records.len(), "Loaded resolved markets");
        Ok(records)
    }

    async fn open_records(&self, limit: usize) -> Result<Vec<HistoricalRecord>, SourceError> {
        let markets = MarketRepository::new(&self.pool)
            .open_markets(limit as i64)
            .await?;
        self.with_trades(markets).await
    }

    async fn profiles_for(&self, wallets: &BTreeSet<String>) -> Result<ProfileBook, SourceError> {
        if wallets.is_empty() {
            return Ok(ProfileBook::default());
        }
        let addresses: Vec<&str> = wallets.iter().map(String::as_str).collect();
        let rows = MarketRepository::new(&self.pool)
            .wallets_for(&addresses)
            .await?;
        debug!(requested = addresses.len(), found = rows.len(), "Loaded wallet profiles");
        Ok(ProfileBook::new(rows.into_iter().map(to_profile)))
    }
}

/// Stored market + trades → engine record. Unreadable trades are dropped.
fn to_historical(market: MarketRecord, trades: Vec<TradeRecord>) -> HistoricalRecord {
    let outcome = if market.resolved {
        market.outcome.as_deref().and_then(Side::parse)
    } else {
        None
    };

    let actions = trades
        .into_iter()
        .filter_map(|t| match to_action(&t) {
            Some(action) => Some(action),
            None => {
                warn!(market = %market.id, wallet = %t.wallet, side = %t.side, "Skipping unreadable trade");
                None
            }
        })
        .collect();

    HistoricalRecord {
        id: market.id,
        title: market.title,
        created_at: market.created_at,
        end_at: market.end_at,
        outcome,
        actions,
    }
}

fn to_action(trade: &TradeRecord) -> Option<Action> {
    Some(Action {
        wallet: trade.wallet.clone(),
        side: Side::parse(&trade.side)?,
        amount: Decimal::from_str(trade.amount.trim()).ok()?,
        price: Decimal::from_str(trade.price.trim()).ok()?,
        timestamp: trade.timestamp,
    })
}

fn to_profile(row: WalletRecord) -> ParticipantProfile {
    ParticipantProfile {
        address: row.address,
        first_seen: row.first_seen,
        total_bets: u32::try_from(row.total_bets.max(0)).unwrap_or(u32::MAX),
        total_volume: row.total_volume,
        win_rate: row.win_rate,
        rationality_score: row.rationality_score,
        flagged_suspicious: row.flagged_suspicious,
        flagged_sandpit: row.flagged_sandpit,
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Fixed dataset held in memory (tests and embedding)
#[derive(Default)]
pub struct InMemorySource {
    records: RwLock<Vec<HistoricalRecord>>,
    profiles: RwLock<HashMap<String, ParticipantProfile>>,
}

impl InMemorySource {
    pub fn new(records: Vec<HistoricalRecord>, profiles: Vec<ParticipantProfile>) -> Self {
        Self {
            records: RwLock::new(records),
            profiles: RwLock::new(
                profiles
                    .into_iter()
                    .map(|p| (p.address.clone(), p))
                    .collect(),
            ),
        }
    }
}

#[async_trait::async_trait]
impl HistoricalSource for InMemorySource {
    async fn resolved_records(&self) -> Result<Vec<HistoricalRecord>, SourceError> {
        let records = self.records.read().await;
        let mut resolved: Vec<HistoricalRecord> =
            records.iter().filter(|r| r.is_resolved()).cloned().collect();
        resolved.sort_by(|a, b| a.end_at.cmp(&b.end_at).then_with(|| a.id.cmp(&b.id)));
        Ok(resolved)
    }

    async fn open_records(&self, limit: usize) -> Result<Vec<HistoricalRecord>, SourceError> {
        let records = self.records.read().await;
        let mut open: Vec<HistoricalRecord> =
            records.iter().filter(|r| !r.is_resolved()).cloned().collect();
        open.sort_by(|a, b| a.end_at.cmp(&b.end_at).then_with(|| a.id.cmp(&b.id)));
        open.truncate(limit);
        Ok(open)
    }

    async fn profiles_for(&self, wallets: &BTreeSet<String>) -> Result<ProfileBook, SourceError> {
        let profiles = self.profiles.read().await;
        Ok(ProfileBook::new(
            wallets.iter().filter_map(|w| profiles.get(w).cloned()),
        ))
    }
}
