//! Market-implied probability estimators (the baseline "edge" is measured against)

use serde::{Deserialize, Serialize};

use crate::types::{Action, HistoricalRecord};

/// Estimate P(YES) as priced by the market from the visible trades
pub trait MarketProbability: Send + Sync {
    /// `None` when there is not enough data to say
    fn implied_probability(&self, record: &HistoricalRecord, visible: &[Action]) -> Option<f64>;
}

/// Volume-weighted implied YES price over the most recent trades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeWeightedRecent {
    pub recent: usize,
    pub min_actions: usize,
}

impl Default for VolumeWeightedRecent {
    fn default() -> Self {
        Self {
            recent: 10,
            min_actions: 3,
        }
    }
}

impl MarketProbability for VolumeWeightedRecent {
    fn implied_probability(&self, _record: &HistoricalRecord, visible: &[Action]) -> Option<f64> {
        if visible.len() < self.min_actions.max(1) {
            return None;
        }
        let start = visible.len().saturating_sub(self.recent.max(1));
        let window = &visible[start..];

        let (weighted, volume) = window.iter().fold((0.0, 0.0), |(w, v), a| {
            let amount = a.amount_f64().max(0.0);
            (w + a.implied_yes() * amount, v + amount)
        });

        if volume > 0.0 {
            Some((weighted / volume).clamp(0.0, 1.0))
        } else {
            // All-zero notional: fall back to an unweighted mean
            let mean = window.iter().map(Action::implied_yes).sum::<f64>() / window.len() as f64;
            Some(mean.clamp(0.0, 1.0))
        }
    }
}

/// Median implied YES price over every visible trade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedianPrice {
    pub min_actions: usize,
}

impl MarketProbability for MedianPrice {
    fn implied_probability(&self, _record: &HistoricalRecord, visible: &[Action]) -> Option<f64> {
        if visible.is_empty() || visible.len() < self.min_actions {
            return None;
        }
        let mut prices: Vec<f64> = visible.iter().map(Action::implied_yes).collect();
        prices.sort_by(f64::total_cmp);
        let mid = prices.len() / 2;
        let median = if prices.len() % 2 == 0 {
            (prices[mid - 1] + prices[mid]) / 2.0
        } else {
            prices[mid]
        };
        Some(median)
    }
}

/// Serializable choice of estimator for config files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MarketBaseline {
    VolumeWeightedRecent { recent: usize, min_actions: usize },
    Median { min_actions: usize },
}

impl Default for MarketBaseline {
    fn default() -> Self {
        let d = VolumeWeightedRecent::default();
        Self::VolumeWeightedRecent {
            recent: d.recent,
            min_actions: d.min_actions,
        }
    }
}

impl MarketBaseline {
    pub fn build(&self) -> Box<dyn MarketProbability> {
        match *self {
            Self::VolumeWeightedRecent {
                recent,
                min_actions,
            } => Box::new(VolumeWeightedRecent {
                recent,
                min_actions,
            }),
            Self::Median { min_actions } => Box::new(MedianPrice { min_actions }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn trade(side: Side, amount: Decimal, price: Decimal) -> Action {
        Action {
            wallet: "0xa".into(),
            side,
            amount,
            price,
            timestamp: 0,
        }
    }

    fn record() -> HistoricalRecord {
        HistoricalRecord {
            id: "m".into(),
            title: String::new(),
            created_at: 0,
            end_at: 100,
            outcome: None,
            actions: vec![],
        }
    }

    #[test]
    fn test_volume_weighted_uses_recent_window() {
        let est = VolumeWeightedRecent {
            recent: 2,
            min_actions: 1,
        };
        let trades = vec![
            trade(Side::Yes, dec!(1000), dec!(0.9)), // outside window
            trade(Side::Yes, dec!(100), dec!(0.4)),
            trade(Side::No, dec!(300), dec!(0.6)), // implied YES 0.4
        ];
        let p = est.implied_probability(&record(), &trades).unwrap();
        assert!((p - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_volume_weighted_requires_min_actions() {
        let est = VolumeWeightedRecent::default();
        let trades = vec![trade(Side::Yes, dec!(10), dec!(0.5)); 2];
        assert!(est.implied_probability(&record(), &trades).is_none());
    }

    #[test]
    fn test_volume_weighted_zero_volume_falls_back_to_mean() {
        let est = VolumeWeightedRecent {
            recent: 10,
            min_actions: 1,
        };
        let trades = vec![
            trade(Side::Yes, Decimal::ZERO, dec!(0.2)),
            trade(Side::Yes, Decimal::ZERO, dec!(0.4)),
        ];
        let p = est.implied_probability(&record(), &trades).unwrap();
        assert!((p - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_median() {
        let est = MedianPrice::default();
        let trades = vec![
            trade(Side::Yes, dec!(1), dec!(0.2)),
            trade(Side::Yes, dec!(1), dec!(0.8)),
            trade(Side::Yes, dec!(1), dec!(0.5)),
        ];
        assert_eq!(est.implied_probability(&record(), &trades), Some(0.5));
        assert_eq!(est.implied_probability(&record(), &[]), None);
    }

    #[test]
    fn test_baseline_config_parses() {
        let b: MarketBaseline = serde_json::from_str(r#"{"method":"median","min_actions":2}"#).unwrap();
        assert_eq!(b, MarketBaseline::Median { min_actions: 2 });
        assert_eq!(
            MarketBaseline::default(),
            MarketBaseline::VolumeWeightedRecent {
                recent: 10,
                min_actions: 3
            }
        );
    }
}
