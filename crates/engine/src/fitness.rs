//! Fitness function for ranking method combos
//!
//! fitness = accuracy × W_acc + edge × W_edge − fpr × W_fp − (complexity / total) × W_cx
//!
//! Not clamped: a combo can score below zero.

use serde::{Deserialize, Serialize};

/// Weights of the four fitness components
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitnessWeights {
    pub accuracy: f64,
    pub edge: f64,
    pub false_positive: f64,
    pub complexity: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            accuracy: 0.35,
            edge: 0.35,
            false_positive: 0.20,
            complexity: 0.10,
        }
    }
}

impl FitnessWeights {
    /// Score one combo. `total_functions` normalises complexity; a zero
    /// total is treated as one.
    pub fn score(
        &self,
        accuracy: f64,
        edge: f64,
        false_positive_rate: f64,
        complexity: usize,
        total_functions: usize,
    ) -> f64 {
        let complexity_ratio = complexity as f64 / total_functions.max(1) as f64;
        accuracy * self.accuracy + edge * self.edge
            - false_positive_rate * self.false_positive
            - complexity_ratio * self.complexity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights() {
        let w = FitnessWeights::default();
        // 0.7*0.35 + 0.2*0.35 - 0.3*0.20 - (2/25)*0.10
        let f = w.score(0.7, 0.2, 0.3, 2, 25);
        assert!((f - (0.245 + 0.07 - 0.06 - 0.008)).abs() < 1e-12);
    }

    #[test]
    fn test_can_go_negative() {
        let w = FitnessWeights::default();
        assert!(w.score(0.0, 0.0, 1.0, 10, 10) < 0.0);
    }

    #[test]
    fn test_accuracy_strictly_increases_fitness() {
        let w = FitnessWeights::default();
        let mut prev = f64::NEG_INFINITY;
        for i in 0..=10 {
            let f = w.score(i as f64 / 10.0, 0.1, 0.2, 3, 25);
            assert!(f > prev);
            prev = f;
        }
    }

    #[test]
    fn test_false_positive_rate_strictly_decreases_fitness() {
        let w = FitnessWeights::default();
        let mut prev = f64::INFINITY;
        for i in 0..=10 {
            let f = w.score(0.6, 0.1, i as f64 / 10.0, 3, 25);
            assert!(f < prev);
            prev = f;
        }
    }

    #[test]
    fn test_complexity_strictly_decreases_fitness() {
        let w = FitnessWeights::default();
        let mut prev = f64::INFINITY;
        for size in 1..=25 {
            let f = w.score(0.6, 0.1, 0.2, size, 25);
            assert!(f < prev);
            prev = f;
        }
    }

    #[test]
    fn test_custom_weights_are_used() {
        let w = FitnessWeights {
            accuracy: 1.0,
            edge: 0.0,
            false_positive: 0.0,
            complexity: 0.0,
        };
        assert_eq!(w.score(0.42, 0.9, 0.9, 5, 5), 0.42);
    }

    #[test]
    fn test_zero_total_functions_does_not_divide_by_zero() {
        let w = FitnessWeights::default();
        assert!(w.score(0.5, 0.0, 0.0, 1, 0).is_finite());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let w: FitnessWeights = serde_json::from_str(r#"{"accuracy": 0.5}"#).unwrap();
        assert_eq!(w.accuracy, 0.5);
        assert_eq!(w.edge, 0.35);
    }
}
