//! Reference signal functions
//!
//! A small working set so the workspace runs end to end. Production method
//! sets are registered by the embedding application the same way.
//!
//! | id | category | idea |
//! |----|----------|------|
//! | W1 | W | follow wallets whose win rate is a statistical outlier |
//! | W2 | W | drop sandpit / bait wallets, read the rest |
//! | F1 | F | raw YES vs NO volume imbalance |
//! | F2 | F | EMA crossover on the implied YES price |
//! | F3 | F | RSI exhaustion on the implied YES price |
//! | P1 | P | longshot bias (prospect-theory probability weighting) |

mod flow;
mod pricing;
mod wallet;

pub use flow::{EmaMomentum, RsiExhaustion, VolumeImbalance};
pub use pricing::LongshotBias;
pub use wallet::{SandpitFilter, SmartMoneyFollow};

use crate::signal::{RegistryError, SignalRegistry};
use crate::types::{Action, Side};

/// Every reference method, all active
pub fn default_registry() -> Result<SignalRegistry, RegistryError> {
    SignalRegistry::builder()
        .register(
            "W1",
            "W",
            "Smart-money follow (win-rate outliers)",
            SmartMoneyFollow::default(),
        )
        .register(
            "W2",
            "W",
            "Sandpit / bait account filtering",
            SandpitFilter::default(),
        )
        .register("F1", "F", "Volume imbalance", VolumeImbalance::default())
        .register("F2", "F", "EMA price momentum", EmaMomentum::default())
        .register("F3", "F", "RSI exhaustion", RsiExhaustion::default())
        .register("P1", "P", "Longshot bias", LongshotBias::default())
        .build()
}

/// (YES volume, NO volume) over `actions`
pub(crate) fn volume_by_side<'a>(actions: impl IntoIterator<Item = &'a Action>) -> (f64, f64) {
    actions
        .into_iter()
        .fold((0.0, 0.0), |(yes, no), a| match a.side {
            Side::Yes => (yes + a.amount_f64(), no),
            Side::No => (yes, no + a.amount_f64()),
        })
}

/// (yes − no) / (yes + no), 0 with no volume
pub(crate) fn imbalance(yes: f64, no: f64) -> f64 {
    let total = yes + no;
    if total > 0.0 {
        ((yes - no) / total).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Median of the implied YES prices, ignoring degenerate 0 / 1 prices
pub(crate) fn median_implied_yes(actions: &[Action]) -> Option<f64> {
    let mut prices: Vec<f64> = actions
        .iter()
        .map(Action::implied_yes)
        .filter(|p| *p > 0.0 && *p < 1.0)
        .collect();
    if prices.is_empty() {
        return None;
    }
    prices.sort_by(f64::total_cmp);
    let mid = prices.len() / 2;
    Some(if prices.len() % 2 == 0 {
        (prices[mid - 1] + prices[mid]) / 2.0
    } else {
        prices[mid]
    })
}
