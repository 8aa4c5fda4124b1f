//! Database schema definitions

/// SQL to create all tables
/// NOTE: trade prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Evaluated method combos (bounded leaderboard, one row per combo)
CREATE TABLE IF NOT EXISTS combo_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    combo_id TEXT NOT NULL UNIQUE,
    members TEXT NOT NULL,
    accuracy REAL NOT NULL DEFAULT 0,
    edge REAL NOT NULL DEFAULT 0,
    false_positive_rate REAL NOT NULL DEFAULT 0,
    complexity INTEGER NOT NULL DEFAULT 0,
    fitness REAL NOT NULL DEFAULT 0,
    evaluated_records INTEGER NOT NULL DEFAULT 0,
    tested_at INTEGER NOT NULL,
    run_id TEXT
);

-- Append-only log of search runs
CREATE TABLE IF NOT EXISTS search_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    dataset_hash TEXT NOT NULL,
    train_records INTEGER NOT NULL DEFAULT 0,
    holdout_records INTEGER NOT NULL DEFAULT 0,
    best_combo_id TEXT,
    best_fitness REAL,
    holdout_fitness REAL,
    top_json TEXT NOT NULL DEFAULT '[]',
    stages_json TEXT NOT NULL DEFAULT '[]'
);

-- Historical markets (written by the ingestion layer)
CREATE TABLE IF NOT EXISTS markets (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    end_at INTEGER NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    outcome TEXT
);

-- Trades on those markets
CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id TEXT NOT NULL,
    wallet TEXT NOT NULL,
    side TEXT NOT NULL,
    amount TEXT NOT NULL,
    price TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

-- Aggregate wallet profiles
CREATE TABLE IF NOT EXISTS wallets (
    address TEXT PRIMARY KEY,
    first_seen INTEGER NOT NULL DEFAULT 0,
    total_bets INTEGER NOT NULL DEFAULT 0,
    total_volume REAL NOT NULL DEFAULT 0,
    win_rate REAL NOT NULL DEFAULT 0,
    rationality_score REAL NOT NULL DEFAULT 0,
    flagged_suspicious INTEGER NOT NULL DEFAULT 0,
    flagged_sandpit INTEGER NOT NULL DEFAULT 0
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_combo_fitness ON combo_results(fitness DESC, tested_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_finished ON search_runs(finished_at DESC);
CREATE INDEX IF NOT EXISTS idx_trades_market ON trades(market_id);
CREATE INDEX IF NOT EXISTS idx_trades_wallet ON trades(wallet);
CREATE INDEX IF NOT EXISTS idx_markets_resolved ON markets(resolved, end_at)
"#;

/// Column additions for databases created before a column existed.
/// "duplicate column name" errors are expected and ignored.
pub const MIGRATIONS: &[&str] = &[];
