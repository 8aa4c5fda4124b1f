//! Pricing-psychology methods (category P)

use crate::profiles::ProfileView;
use crate::signal::{SignalError, SignalFunction, SignalResult};
use crate::types::{Action, HistoricalRecord};

use super::median_implied_yes;

/// Longshots are over-bet and favourites under-bet.
///
/// Compares the median implied YES price with the Tversky–Kahneman
/// probability weighting `w(p) = p^γ / (p^γ + (1−p)^γ)^(1/γ)`.
#[derive(Debug, Clone)]
pub struct LongshotBias {
    pub gamma: f64,
    /// Below this the market is a longshot (lean NO)
    pub low_prob: f64,
    /// Above this the market is a favourite (lean YES)
    pub high_prob: f64,
}

impl Default for LongshotBias {
    fn default() -> Self {
        Self {
            gamma: 0.61,
            low_prob: 0.15,
            high_prob: 0.85,
        }
    }
}

impl LongshotBias {
    fn weight(&self, p: f64) -> f64 {
        if p <= 0.0 || p >= 1.0 {
            return p;
        }
        let pg = p.powf(self.gamma);
        pg / (pg + (1.0 - p).powf(self.gamma)).powf(1.0 / self.gamma)
    }
}

impl SignalFunction for LongshotBias {
    fn evaluate(
        &self,
        _record: &HistoricalRecord,
        actions: &[Action],
        _profiles: &ProfileView<'_>,
    ) -> Result<SignalResult, SignalError> {
        let Some(implied) = median_implied_yes(actions) else {
            return Ok(SignalResult::neutral());
        };

        let weighted = self.weight(implied);
        let mispricing = implied - weighted;

        let (signal, confidence) = if implied < self.low_prob {
            (-mispricing.abs() * 5.0, mispricing.abs() * 10.0)
        } else if implied > self.high_prob {
            (mispricing.abs() * 5.0, mispricing.abs() * 10.0)
        } else {
            (-mispricing * 2.0, mispricing.abs() * 5.0)
        };

        Ok(
            SignalResult::new(signal.clamp(-1.0, 1.0), confidence.clamp(0.0, 1.0))
                .with_meta("implied_prob", implied)
                .with_meta("weighted_prob", weighted),
        )
    }
}
