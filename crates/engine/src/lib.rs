//! Poly Combo Engine: combinatorial search over prediction-market signals
//!
//! Provides:
//! - Signal registry with category-tagged signal functions
//! - Backtest replayer with a no-lookahead cutoff per market
//! - Weighted fitness scoring and a bounded keep-best result store
//! - Three-stage combinator (within category, cross category, refinement)
//! - Temporal holdout validation and live predictions on open markets

pub mod backtest;
pub mod combinator;
pub mod combo;
pub mod fitness;
pub mod holdout;
pub mod market;
pub mod predict;
pub mod profiles;
pub mod result_store;
pub mod runner;
pub mod signal;
pub mod signals;
pub mod source;
pub mod types;

// Re-exports for convenience
pub use backtest::{BacktestConfig, ConfigError, ReplayError, ReplayStats, Replayer};
pub use combinator::{
    run_search, EngineConfig, ProgressSnapshot, SearchConfig, SearchContext, SearchError,
    SearchOutcome, SearchProgress, SearchStatus, Stage, StageReport,
};
pub use combo::{binomial, combos_up_to, index_combinations, Combo, ComboParseError};
pub use fitness::FitnessWeights;
pub use holdout::{split_holdout, HoldoutConfig, HoldoutSplit};
pub use market::{MarketBaseline, MarketProbability};
pub use predict::{predict, predict_open, Prediction};
pub use profiles::{participants, ProfileBook, ProfileView};
pub use result_store::{ComboResult, ResultStore, StoreError};
pub use runner::{execute, HoldoutReport, RunError, RunSummary, SearchJob};
pub use signal::{
    signal_fn, Category, RegistryError, SignalError, SignalFunction, SignalId, SignalRegistry,
    SignalResult,
};
pub use signals::default_registry;
pub use source::{HistoricalSource, InMemorySource, SourceError, SqliteHistoricalSource};
pub use types::*;
