//! Backtest replayer
//!
//! Replays one combo over resolved markets and reduces the per-market
//! predictions to the four statistics the fitness function needs.
//!
//! Per market:
//! 1. keep only trades strictly before `created_at + cutoff × lifespan`
//! 2. cap to the most recent `max_actions_per_record` of those
//! 3. restrict the wallet profiles to the wallets in what is left
//! 4. run the members in ascending id order, each one seeing the trades the
//!    previous one kept
//! 5. confidence-weighted aggregate → probability → correct / wrong

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::combo::Combo;
use crate::market::{MarketBaseline, MarketProbability};
use crate::profiles::{ProfileBook, ProfileView};
use crate::signal::{SignalError, SignalId, SignalRegistry, SignalResult};
use crate::types::{Action, HistoricalRecord, Side};

// ============================================================================
// Config & output
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Fraction of a market's lifespan whose trades are visible, in (0, 1)
    pub cutoff_fraction: f64,
    /// Most recent visible trades handed to the pipeline
    pub max_actions_per_record: usize,
    /// Confidence strictly above this counts as a high-confidence call
    pub high_confidence_threshold: f64,
    /// Minimum |p − p_market| for a correct call to count as edge
    pub edge_epsilon: f64,
    /// Markets with fewer visible trades are skipped
    pub min_visible_actions: usize,
    /// How the market-implied probability is estimated
    pub market: MarketBaseline,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            cutoff_fraction: 0.70,
            max_actions_per_record: 2000,
            high_confidence_threshold: 0.5,
            edge_epsilon: 0.05,
            min_visible_actions: 0,
            market: MarketBaseline::default(),
        }
    }
}

impl BacktestConfig {
    /// Reject settings that would break the replay's guarantees.
    ///
    /// A cutoff at or past the end of a market would leak trades placed
    /// after resolution into the prediction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cutoff_fraction > 0.0 && self.cutoff_fraction < 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "cutoff_fraction",
                range: "(0, 1)",
                value: self.cutoff_fraction,
            });
        }
        if !(0.0..=1.0).contains(&self.high_confidence_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "high_confidence_threshold",
                range: "[0, 1]",
                value: self.high_confidence_threshold,
            });
        }
        if !(self.edge_epsilon >= 0.0 && self.edge_epsilon.is_finite()) {
            return Err(ConfigError::OutOfRange {
                field: "edge_epsilon",
                range: "[0, inf)",
                value: self.edge_epsilon,
            });
        }
        if self.max_actions_per_record == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_actions_per_record",
                range: "[1, inf)",
                value: 0.0,
            });
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be in {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: f64,
    },
}

/// Summary statistics of one replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub accuracy: f64,
    pub edge: f64,
    pub false_positive_rate: f64,
    /// Combo size
    pub complexity: usize,
    pub evaluated_records: usize,
    pub high_confidence_records: usize,
    /// Signal invocations that failed, panicked or broke the output contract
    pub function_failures: usize,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    #[error("no eligible records for combo {combo}")]
    NoData { combo: String },

    #[error("combo references unregistered signal {0}")]
    UnknownSignal(SignalId),

    #[error("combo has no members")]
    EmptyCombo,
}

/// Aggregated pipeline output for a single market
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOutput {
    /// -1.0 .. 1.0
    pub signal: f64,
    pub confidence: f64,
    pub failures: usize,
}

impl PipelineOutput {
    /// `0.5 + 0.5 × signal`, clamped to [0, 1]
    pub fn probability(&self) -> f64 {
        (0.5 + self.signal * 0.5).clamp(0.0, 1.0)
    }
}

// ============================================================================
// Replayer
// ============================================================================

/// Replays combos against a read-only registry
pub struct Replayer {
    registry: Arc<SignalRegistry>,
    config: BacktestConfig,
    market: Box<dyn MarketProbability>,
}

impl Replayer {
    pub fn new(registry: Arc<SignalRegistry>, config: BacktestConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let market = config.market.build();
        Ok(Self {
            registry,
            config,
            market,
        })
    }

    /// Replace the market-probability estimator named in the config
    pub fn with_market(mut self, market: Box<dyn MarketProbability>) -> Self {
        self.market = market;
        self
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Evaluate `combo` over every eligible record.
    ///
    /// Pure apart from logging: same inputs, same stats.
    pub fn replay(
        &self,
        combo: &Combo,
        records: &[HistoricalRecord],
        profiles: &ProfileBook,
    ) -> Result<ReplayStats, ReplayError> {
        self.check_combo(combo)?;

        let mut evaluated = 0usize;
        let mut correct = 0usize;
        let mut beat_market = 0usize;
        let mut high_confidence = 0usize;
        let mut high_confidence_wrong = 0usize;
        let mut failures = 0usize;

        for record in records {
            let Some(outcome) = record.outcome else {
                continue;
            };
            if record.lifespan_ms() <= 0 {
                continue;
            }

            let visible = self.visible_actions(record);
            if visible.len() < self.config.min_visible_actions {
                continue;
            }

            let view = profiles.restrict(&visible);
            let output = self.run_pipeline(combo, record, &visible, &view);
            failures += output.failures;
            evaluated += 1;

            let p = output.probability();
            // p == 0.5 is never right
            let is_correct = p != 0.5 && (p > 0.5) == (outcome == Side::Yes);
            if is_correct {
                correct += 1;
                if let Some(p_market) = self.market.implied_probability(record, &visible) {
                    if (p - p_market).abs() > self.config.edge_epsilon {
                        beat_market += 1;
                    }
                }
            }

            if output.confidence > self.config.high_confidence_threshold {
                high_confidence += 1;
                if !is_correct {
                    high_confidence_wrong += 1;
                }
            }
        }

        if evaluated == 0 {
            debug!(combo = %combo, "No eligible records");
            return Err(ReplayError::NoData { combo: combo.id() });
        }

        let n = evaluated as f64;
        Ok(ReplayStats {
            accuracy: correct as f64 / n,
            edge: beat_market as f64 / n,
            false_positive_rate: if high_confidence == 0 {
                0.0
            } else {
                high_confidence_wrong as f64 / high_confidence as f64
            },
            complexity: combo.len(),
            evaluated_records: evaluated,
            high_confidence_records: high_confidence,
            function_failures: failures,
        })
    }

    pub(crate) fn check_combo(&self, combo: &Combo) -> Result<(), ReplayError> {
        if combo.is_empty() {
            return Err(ReplayError::EmptyCombo);
        }
        match combo.members().find(|id| !self.registry.contains(id)) {
            Some(unknown) => Err(ReplayError::UnknownSignal(unknown.clone())),
            None => Ok(()),
        }
    }

    /// Trades before the cutoff, capped to the most recent N, chronological
    pub fn visible_actions(&self, record: &HistoricalRecord) -> Vec<Action> {
        let cutoff = record.cutoff_time(self.config.cutoff_fraction);
        let visible: Vec<Action> = record
            .actions
            .iter()
            .filter(|a| a.timestamp < cutoff)
            .cloned()
            .collect();
        cap_recent(visible, self.config.max_actions_per_record)
    }

    /// Run the members of `combo` in ascending id order over `actions`.
    ///
    /// A member that fails keeps its input for the next member and
    /// contributes nothing to the aggregate.
    pub fn run_pipeline(
        &self,
        combo: &Combo,
        record: &HistoricalRecord,
        actions: &[Action],
        profiles: &ProfileView<'_>,
    ) -> PipelineOutput {
        let mut current: Vec<Action> = actions.to_vec();
        let mut weighted = 0.0;
        let mut weight = 0.0;
        let mut informative = 0usize;
        let mut failures = 0usize;

        for id in combo.members() {
            let Some(entry) = self.registry.get(id) else {
                failures += 1;
                continue;
            };

            match invoke(entry.function(), record, &current, profiles) {
                Ok(result) => {
                    if result.confidence > 0.0 {
                        weighted += result.signal * result.confidence;
                        weight += result.confidence;
                        informative += 1;
                    }
                    if let Some(filtered) = result.filtered_actions {
                        current = filtered;
                    }
                }
                Err(e) => {
                    warn!(signal = %id, record = %record.id, error = %e, "Signal function failed, treating as neutral");
                    failures += 1;
                }
            }
        }

        if weight <= 0.0 {
            return PipelineOutput {
                signal: 0.0,
                confidence: 0.0,
                failures,
            };
        }

        PipelineOutput {
            signal: (weighted / weight).clamp(-1.0, 1.0),
            confidence: weight / informative as f64,
            failures,
        }
    }
}

/// Call one signal function, turning panics and contract breaches into errors
fn invoke(
    function: &dyn crate::signal::SignalFunction,
    record: &HistoricalRecord,
    actions: &[Action],
    profiles: &ProfileView<'_>,
) -> Result<SignalResult, SignalError> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        function.evaluate(record, actions, profiles)
    }))
    .map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        SignalError::Panicked(message)
    })??;

    if !result.is_within_contract() {
        return Err(SignalError::OutOfContract {
            signal: result.signal,
            confidence: result.confidence,
        });
    }
    Ok(result)
}

/// Keep the last `max` actions, sorted by timestamp
pub(crate) fn cap_recent(mut actions: Vec<Action>, max: usize) -> Vec<Action> {
    actions.sort_by_key(|a| a.timestamp);
    if actions.len() > max {
        actions.drain(..actions.len() - max);
    }
    actions
}
