//! Temporal train / holdout split

use serde::{Deserialize, Serialize};

use crate::types::HistoricalRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldoutConfig {
    /// Share of the most recently ended markets held back, 0..1
    pub fraction: f64,
    /// Below this many holdout markets the split is not worth it
    pub min_holdout_records: usize,
}

impl Default for HoldoutConfig {
    fn default() -> Self {
        Self {
            fraction: 0.20,
            min_holdout_records: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HoldoutSplit {
    pub train: Vec<HistoricalRecord>,
    /// Empty when no holdout is used
    pub holdout: Vec<HistoricalRecord>,
}

impl HoldoutSplit {
    pub fn has_holdout(&self) -> bool {
        !self.holdout.is_empty()
    }
}

/// Sort by end time and hold back the latest `fraction` of markets.
///
/// Every train market ends no later than any holdout market. If the holdout
/// would be smaller than `min_holdout_records`, everything is train.
pub fn split_holdout(mut records: Vec<HistoricalRecord>, config: &HoldoutConfig) -> HoldoutSplit {
    records.sort_by(|a, b| a.end_at.cmp(&b.end_at).then_with(|| a.id.cmp(&b.id)));

    let fraction = config.fraction.clamp(0.0, 1.0);
    let holdout_len = (records.len() as f64 * fraction).round() as usize;
    if holdout_len == 0 || holdout_len < config.min_holdout_records {
        return HoldoutSplit {
            train: records,
            holdout: Vec::new(),
        };
    }

    let holdout = records.split_off(records.len() - holdout_len);
    HoldoutSplit {
        train: records,
        holdout,
    }
}
