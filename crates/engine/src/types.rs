//! Core data model: markets, their trades, and wallet profiles

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of a binary market a trade backs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" | "BUY" | "UP" => Some(Self::Yes),
            "NO" | "SELL" | "DOWN" => Some(Self::No),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
        }
    }

    /// +1 for YES, -1 for NO
    pub fn sign(&self) -> f64 {
        match self {
            Self::Yes => 1.0,
            Self::No => -1.0,
        }
    }
}

/// Final outcome of a resolved market. YES is the positive class.
pub type Outcome = Side;

/// A single participant action (trade) on a market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub wallet: String,
    pub side: Side,
    /// USDC notional
    pub amount: Decimal,
    /// Price paid for the chosen side, 0..1
    pub price: Decimal,
    /// Unix millis
    pub timestamp: i64,
}

impl Action {
    pub fn amount_f64(&self) -> f64 {
        self.amount.to_f64().unwrap_or(0.0)
    }

    /// Probability of YES implied by this trade's price
    pub fn implied_yes(&self) -> f64 {
        let p = self.price.to_f64().unwrap_or(0.5).clamp(0.0, 1.0);
        match self.side {
            Side::Yes => p,
            Side::No => 1.0 - p,
        }
    }
}

/// A market with its trade history. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub id: String,
    pub title: String,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis
    pub end_at: i64,
    /// `None` while the market is open
    pub outcome: Option<Outcome>,
    /// Chronological
    pub actions: Vec<Action>,
}

impl HistoricalRecord {
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn lifespan_ms(&self) -> i64 {
        self.end_at - self.created_at
    }

    /// First timestamp that is no longer visible at `cutoff_fraction` of the
    /// lifespan. Rounded up, so a trade strictly before a fractional cutoff stays in.
    pub fn cutoff_time(&self, cutoff_fraction: f64) -> i64 {
        self.created_at + (self.lifespan_ms() as f64 * cutoff_fraction).ceil() as i64
    }
}

/// Aggregate profile of one wallet across all markets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub address: String,
    pub first_seen: i64,
    pub total_bets: u32,
    pub total_volume: f64,
    pub win_rate: f64,
    pub rationality_score: f64,
    pub flagged_suspicious: bool,
    pub flagged_sandpit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_parse() {
        assert_eq!(Side::parse("yes"), Some(Side::Yes));
        assert_eq!(Side::parse(" NO "), Some(Side::No));
        assert_eq!(Side::parse("maybe"), None);
    }

    #[test]
    fn test_implied_yes_flips_for_no_side() {
        let mut action = Action {
            wallet: "0xa".into(),
            side: Side::Yes,
            amount: dec!(100),
            price: dec!(0.3),
            timestamp: 0,
        };
        assert!((action.implied_yes() - 0.3).abs() < 1e-12);
        action.side = Side::No;
        assert!((action.implied_yes() - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_cutoff_time() {
        let record = HistoricalRecord {
            id: "m".into(),
            title: String::new(),
            created_at: 0,
            end_at: 100,
            outcome: Some(Side::Yes),
            actions: vec![],
        };
        assert_eq!(record.cutoff_time(0.5), 50);
        assert_eq!(record.cutoff_time(0.7), 70);
        // 100 × 0.333 = 33.3
        assert_eq!(record.cutoff_time(0.333), 34);
    }
}
