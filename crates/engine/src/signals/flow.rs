//! Trade-flow methods (category F)

use ta::indicators::{ExponentialMovingAverage, RelativeStrengthIndex};
use ta::Next;

use crate::profiles::ProfileView;
use crate::signal::{SignalError, SignalFunction, SignalResult};
use crate::types::{Action, HistoricalRecord};

use super::{imbalance, volume_by_side};

/// Net YES vs NO notional. Confidence grows with the number of trades.
#[derive(Debug, Clone)]
pub struct VolumeImbalance {
    /// Trades needed for full confidence
    pub saturation: usize,
}

impl Default for VolumeImbalance {
    fn default() -> Self {
        Self { saturation: 50 }
    }
}

impl SignalFunction for VolumeImbalance {
    fn evaluate(
        &self,
        _record: &HistoricalRecord,
        actions: &[Action],
        _profiles: &ProfileView<'_>,
    ) -> Result<SignalResult, SignalError> {
        if actions.is_empty() {
            return Ok(SignalResult::neutral());
        }
        let (yes, no) = volume_by_side(actions);
        let confidence = (actions.len() as f64 / self.saturation.max(1) as f64).min(1.0);
        Ok(SignalResult::new(imbalance(yes, no), confidence)
            .with_meta("yes_volume", yes)
            .with_meta("no_volume", no))
    }
}

/// Fast / slow EMA crossover on the implied YES price of successive trades
#[derive(Debug, Clone)]
pub struct EmaMomentum {
    pub fast_period: usize,
    pub slow_period: usize,
    /// Price gap (in probability points) mapped to a full signal
    pub full_scale_gap: f64,
}

impl Default for EmaMomentum {
    fn default() -> Self {
        Self {
            fast_period: 5,
            slow_period: 15,
            full_scale_gap: 0.10,
        }
    }
}

impl SignalFunction for EmaMomentum {
    fn evaluate(
        &self,
        _record: &HistoricalRecord,
        actions: &[Action],
        _profiles: &ProfileView<'_>,
    ) -> Result<SignalResult, SignalError> {
        if actions.len() < self.slow_period {
            return Ok(SignalResult::neutral().with_meta("reason", "not enough trades"));
        }

        let mut fast = ExponentialMovingAverage::new(self.fast_period)
            .map_err(|e| SignalError::Failed(format!("fast EMA: {e:?}")))?;
        let mut slow = ExponentialMovingAverage::new(self.slow_period)
            .map_err(|e| SignalError::Failed(format!("slow EMA: {e:?}")))?;

        let (mut fast_val, mut slow_val) = (0.5, 0.5);
        for action in actions {
            let p = action.implied_yes();
            fast_val = fast.next(p);
            slow_val = slow.next(p);
        }

        let gap = fast_val - slow_val;
        let scale = self.full_scale_gap.max(f64::EPSILON);
        let signal = (gap / scale).clamp(-1.0, 1.0);
        Ok(SignalResult::new(signal, signal.abs().min(1.0) * 0.8)
            .with_meta("ema_fast", fast_val)
            .with_meta("ema_slow", slow_val))
    }
}

/// Fade an overextended price: RSI above `overbought` leans NO, below
/// `oversold` leans YES.
#[derive(Debug, Clone)]
pub struct RsiExhaustion {
    pub period: usize,
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for RsiExhaustion {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: 30.0,
            overbought: 70.0,
        }
    }
}

impl SignalFunction for RsiExhaustion {
    fn evaluate(
        &self,
        _record: &HistoricalRecord,
        actions: &[Action],
        _profiles: &ProfileView<'_>,
    ) -> Result<SignalResult, SignalError> {
        if actions.len() <= self.period {
            return Ok(SignalResult::neutral().with_meta("reason", "not enough trades"));
        }

        let mut rsi = RelativeStrengthIndex::new(self.period)
            .map_err(|e| SignalError::Failed(format!("RSI: {e:?}")))?;
        let mut value = 50.0;
        for action in actions {
            value = rsi.next(action.implied_yes());
        }

        let (signal, confidence) = if value > self.overbought {
            let depth = (value - self.overbought) / (100.0 - self.overbought).max(1.0);
            (-depth, depth)
        } else if value < self.oversold {
            let depth = (self.oversold - value) / self.oversold.max(1.0);
            (depth, depth)
        } else {
            (0.0, 0.0)
        };

        Ok(
            SignalResult::new(signal.clamp(-1.0, 1.0), confidence.clamp(0.0, 1.0))
                .with_meta("rsi", value),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::fixtures::{action, record};
    use crate::types::Side;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn priced(prices: &[f64]) -> Vec<Action> {
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let price = Decimal::from_f64_retain(*p).unwrap().round_dp(4);
                action("0xa", Side::Yes, dec!(10), price, i as i64)
            })
            .collect()
    }

    #[test]
    fn test_volume_imbalance() {
        let actions = vec![
            action("0xa", Side::Yes, dec!(75), dec!(0.5), 0),
            action("0xb", Side::No, dec!(25), dec!(0.5), 1),
        ];
        let result = VolumeImbalance::default()
            .evaluate(&record(), &actions, &ProfileView::default())
            .unwrap();
        assert!((result.signal - 0.5).abs() < 1e-12);
        assert!((result.confidence - 2.0 / 50.0).abs() < 1e-12);

        let empty = VolumeImbalance::default()
            .evaluate(&record(), &[], &ProfileView::default())
            .unwrap();
        assert_eq!(empty.confidence, 0.0);
    }

    #[test]
    fn test_ema_momentum_follows_rising_price() {
        let prices: Vec<f64> = (0..30).map(|i| 0.30 + i as f64 * 0.01).collect();
        let result = EmaMomentum::default()
            .evaluate(&record(), &priced(&prices), &ProfileView::default())
            .unwrap();
        assert!(result.signal > 0.0);
        assert!(result.is_within_contract());

        let falling: Vec<f64> = prices.iter().rev().copied().collect();
        let result = EmaMomentum::default()
            .evaluate(&record(), &priced(&falling), &ProfileView::default())
            .unwrap();
        assert!(result.signal < 0.0);
    }

    #[test]
    fn test_ema_momentum_needs_history() {
        let result = EmaMomentum::default()
            .evaluate(&record(), &priced(&[0.5; 5]), &ProfileView::default())
            .unwrap();
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_rsi_fades_one_way_run() {
        let rising: Vec<f64> = (0..30).map(|i| 0.20 + i as f64 * 0.02).collect();
        let result = RsiExhaustion::default()
            .evaluate(&record(), &priced(&rising), &ProfileView::default())
            .unwrap();
        assert!(result.signal < 0.0);
        assert!(result.confidence > 0.0);
        assert!(result.is_within_contract());

        let falling: Vec<f64> = rising.iter().rev().copied().collect();
        let result = RsiExhaustion::default()
            .evaluate(&record(), &priced(&falling), &ProfileView::default())
            .unwrap();
        assert!(result.signal > 0.0);
    }

    #[test]
    fn test_invalid_period_is_a_failure_not_a_panic() {
        let rsi = RsiExhaustion {
            period: 0,
            ..Default::default()
        };
        let result = rsi.evaluate(&record(), &priced(&[0.5; 3]), &ProfileView::default());
        assert!(matches!(result, Err(SignalError::Failed(_))));
    }
}
