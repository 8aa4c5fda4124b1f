//! Live prediction: apply a stored combo to markets that are still open

use serde::{Deserialize, Serialize};

use crate::backtest::{cap_recent, ReplayError, Replayer};
use crate::combo::Combo;
use crate::profiles::ProfileBook;
use crate::types::{HistoricalRecord, Side};

/// Wallets scoring below this are counted as emotional traders
const EMOTIONAL_RATIONALITY: f64 = 0.4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub market_id: String,
    pub title: String,
    pub combo_id: String,
    pub signal: f64,
    pub confidence: f64,
    /// P(YES)
    pub probability: f64,
    /// `None` when the combo has no opinion
    pub side: Option<Side>,
    /// Share of trades placed by low-rationality wallets
    pub emotion_ratio: f64,
    pub actions_seen: usize,
}

/// Run `combo` over an open market using every trade so far (up to the action cap)
pub fn predict(
    replayer: &Replayer,
    combo: &Combo,
    record: &HistoricalRecord,
    profiles: &ProfileBook,
) -> Result<Prediction, ReplayError> {
    replayer.check_combo(combo)?;

    let actions = cap_recent(
        record.actions.clone(),
        replayer.config().max_actions_per_record,
    );
    let view = profiles.restrict(&actions);
    let output = replayer.run_pipeline(combo, record, &actions, &view);

    let emotional = actions
        .iter()
        .filter(|a| {
            view.get(&a.wallet)
                .map_or(true, |p| p.rationality_score < EMOTIONAL_RATIONALITY)
        })
        .count();
    let emotion_ratio = if actions.is_empty() {
        0.0
    } else {
        emotional as f64 / actions.len() as f64
    };

    let side = if output.signal > 0.0 {
        Some(Side::Yes)
    } else if output.signal < 0.0 {
        Some(Side::No)
    } else {
        None
    };

    Ok(Prediction {
        market_id: record.id.clone(),
        title: record.title.clone(),
        combo_id: combo.id(),
        signal: output.signal,
        confidence: output.confidence.min(1.0),
        probability: output.probability(),
        side,
        emotion_ratio,
        actions_seen: actions.len(),
    })
}

/// Predictions for every open market with at least `min_actions` trades,
/// most confident first
pub fn predict_open(
    replayer: &Replayer,
    combo: &Combo,
    records: &[HistoricalRecord],
    profiles: &ProfileBook,
    min_actions: usize,
) -> Result<Vec<Prediction>, ReplayError> {
    let mut predictions = Vec::new();
    for record in records.iter().filter(|r| !r.is_resolved()) {
        if record.actions.len() < min_actions {
            continue;
        }
        predictions.push(predict(replayer, combo, record, profiles)?);
    }
    predictions.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.market_id.cmp(&b.market_id))
    });
    Ok(predictions)
}
