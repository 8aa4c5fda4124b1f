//! Wallet-profile methods (category W)

use std::collections::HashSet;

use crate::profiles::ProfileView;
use crate::signal::{SignalError, SignalFunction, SignalResult};
use crate::types::{Action, HistoricalRecord};

use super::{imbalance, volume_by_side};

/// Follow the side backed by wallets whose win rate sits more than
/// `stddev_threshold` σ above the mean of wallets with enough history.
#[derive(Debug, Clone)]
pub struct SmartMoneyFollow {
    pub min_resolved_bets: u32,
    pub stddev_threshold: f64,
    /// Qualified wallets needed before σ means anything
    pub min_qualified: usize,
}

impl Default for SmartMoneyFollow {
    fn default() -> Self {
        Self {
            min_resolved_bets: 10,
            stddev_threshold: 2.0,
            min_qualified: 3,
        }
    }
}

impl SignalFunction for SmartMoneyFollow {
    fn evaluate(
        &self,
        _record: &HistoricalRecord,
        actions: &[Action],
        profiles: &ProfileView<'_>,
    ) -> Result<SignalResult, SignalError> {
        let qualified: Vec<_> = profiles
            .iter()
            .filter(|p| p.total_bets >= self.min_resolved_bets)
            .collect();
        if qualified.len() < self.min_qualified {
            return Ok(SignalResult::neutral().with_meta("reason", "insufficient qualified wallets"));
        }

        let n = qualified.len() as f64;
        let mean = qualified.iter().map(|p| p.win_rate).sum::<f64>() / n;
        let variance = qualified
            .iter()
            .map(|p| (p.win_rate - mean).powi(2))
            .sum::<f64>()
            / n;
        let std = variance.sqrt();
        if std == 0.0 {
            return Ok(SignalResult::neutral().with_meta("reason", "zero std dev"));
        }

        let threshold = mean + self.stddev_threshold * std;
        let sharp: HashSet<&str> = qualified
            .iter()
            .filter(|p| p.win_rate > threshold)
            .map(|p| p.address.as_str())
            .collect();
        if sharp.is_empty() {
            return Ok(SignalResult::new(0.0, 0.1).with_meta("sharp_wallets", 0));
        }

        let (yes, no) = volume_by_side(actions.iter().filter(|a| sharp.contains(a.wallet.as_str())));
        if yes + no == 0.0 {
            return Ok(SignalResult::new(0.0, 0.1).with_meta("sharp_wallets", sharp.len()));
        }

        Ok(
            SignalResult::new(imbalance(yes, no), (sharp.len() as f64 / 10.0).min(1.0))
                .with_meta("sharp_wallets", sharp.len())
                .with_meta("threshold", threshold),
        )
    }
}

/// Remove sandpit / bait wallets from the flow and read the remainder.
///
/// A wallet is a sandpit if it is flagged, if it is a high-volume habitual
/// loser, or if it is brand new and opens with an unusually large trade.
#[derive(Debug, Clone)]
pub struct SandpitFilter {
    pub loser_min_bets: u32,
    pub loser_max_win_rate: f64,
    pub loser_min_volume: f64,
    pub new_wallet_max_bets: u32,
    pub new_wallet_large_trade: f64,
}

impl Default for SandpitFilter {
    fn default() -> Self {
        Self {
            loser_min_bets: 10,
            loser_max_win_rate: 0.25,
            loser_min_volume: 5_000.0,
            new_wallet_max_bets: 3,
            new_wallet_large_trade: 2_000.0,
        }
    }
}

impl SignalFunction for SandpitFilter {
    fn evaluate(
        &self,
        _record: &HistoricalRecord,
        actions: &[Action],
        profiles: &ProfileView<'_>,
    ) -> Result<SignalResult, SignalError> {
        let mut sandpits: HashSet<&str> = HashSet::new();

        for profile in profiles.iter() {
            let habitual_loser = profile.total_bets >= self.loser_min_bets
                && profile.win_rate < self.loser_max_win_rate
                && profile.total_volume > self.loser_min_volume;

            let large_opener = profile.total_bets <= self.new_wallet_max_bets
                && actions
                    .iter()
                    .filter(|a| a.wallet == profile.address)
                    .any(|a| a.amount_f64() > self.new_wallet_large_trade);

            if profile.flagged_sandpit || habitual_loser || large_opener {
                sandpits.insert(profile.address.as_str());
            }
        }

        let clean: Vec<Action> = actions
            .iter()
            .filter(|a| !sandpits.contains(a.wallet.as_str()))
            .cloned()
            .collect();
        let (yes, no) = volume_by_side(&clean);
        let removed = actions.len() - clean.len();
        let confidence = if sandpits.is_empty() { 0.1 } else { 0.5 };

        Ok(SignalResult::new(imbalance(yes, no), confidence)
            .with_meta("sandpit_wallets", sandpits.len())
            .with_meta("actions_removed", removed)
            .with_filtered(clean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::ProfileBook;
    use crate::signals::fixtures::{action, record};
    use crate::types::{ParticipantProfile, Side};
    use rust_decimal_macros::dec;

    fn profile(address: &str, total_bets: u32, win_rate: f64) -> ParticipantProfile {
        ParticipantProfile {
            address: address.to_string(),
            total_bets,
            win_rate,
            ..Default::default()
        }
    }

    #[test]
    fn test_smart_money_follows_outlier_side() {
        let mut profiles: Vec<ParticipantProfile> =
            (0..10).map(|i| profile(&format!("0x{i}"), 20, 0.5)).collect();
        profiles.push(profile("0xsharp", 40, 0.95));
        let book = ProfileBook::new(profiles);

        let mut actions: Vec<Action> = (0..10)
            .map(|i| action(&format!("0x{i}"), Side::Yes, dec!(100), dec!(0.5), i))
            .collect();
        actions.push(action("0xsharp", Side::No, dec!(500), dec!(0.5), 20));

        let view = book.restrict(&actions);
        let result = SmartMoneyFollow::default()
            .evaluate(&record(), &actions, &view)
            .unwrap();
        assert_eq!(result.signal, -1.0);
        assert!((result.confidence - 0.1).abs() < 1e-12);
        assert!(result.filtered_actions.is_none());
    }

    #[test]
    fn test_smart_money_needs_qualified_wallets() {
        let book = ProfileBook::new([profile("0xa", 2, 0.9), profile("0xb", 50, 0.4)]);
        let actions = vec![
            action("0xa", Side::Yes, dec!(10), dec!(0.5), 0),
            action("0xb", Side::Yes, dec!(10), dec!(0.5), 1),
        ];
        let view = book.restrict(&actions);
        let result = SmartMoneyFollow::default()
            .evaluate(&record(), &actions, &view)
            .unwrap();
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_sandpit_filter_drops_bait_wallets() {
        let book = ProfileBook::new([
            ParticipantProfile {
                flagged_sandpit: true,
                ..profile("0xflagged", 50, 0.5)
            },
            ParticipantProfile {
                total_volume: 9_000.0,
                ..profile("0xloser", 30, 0.1)
            },
            profile("0xnew", 1, 0.0),
            profile("0xok", 30, 0.55),
        ]);
        let actions = vec![
            action("0xflagged", Side::Yes, dec!(100), dec!(0.5), 0),
            action("0xloser", Side::Yes, dec!(100), dec!(0.5), 1),
            action("0xnew", Side::Yes, dec!(2500), dec!(0.5), 2),
            action("0xok", Side::No, dec!(100), dec!(0.5), 3),
            action("0xunknown", Side::No, dec!(100), dec!(0.5), 4),
        ];
        let view = book.restrict(&actions);
        let result = SandpitFilter::default()
            .evaluate(&record(), &actions, &view)
            .unwrap();

        let kept: Vec<&str> = result
            .filtered_actions
            .as_ref()
            .unwrap()
            .iter()
            .map(|a| a.wallet.as_str())
            .collect();
        assert_eq!(kept, vec!["0xok", "0xunknown"]);
        assert_eq!(result.signal, -1.0);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_sandpit_filter_low_confidence_when_clean() {
        let book = ProfileBook::new([profile("0xok", 30, 0.55)]);
        let actions = vec![action("0xok", Side::Yes, dec!(100), dec!(0.5), 0)];
        let view = book.restrict(&actions);
        let result = SandpitFilter::default()
            .evaluate(&record(), &actions, &view)
            .unwrap();
        assert_eq!(result.confidence, 0.1);
        assert_eq!(result.filtered_actions.unwrap().len(), 1);
    }
}
