//! Position Sizer (C6): regime-mixed Kelly fraction for an executing
//! hypothesis (spec §4.6).

use quantis_core::config::DecisionConfig;

use crate::hmm::RegimePosterior;
use crate::hypothesis::{Direction, Hypothesis};

/// Position-sizing output for one hypothesis at decision time.
#[derive(Debug, Clone)]
pub struct SizingOutput {
    pub expected_return: f64,
    pub variance: f64,
    pub kelly_fraction: f64,
    pub confidence: f64,
    pub should_trade: bool,
    pub reason: &'static str,
}

/// Clamped Kelly sizer over a regime-mixture expected return/variance.
pub struct PositionSizer {
    kelly_multiplier: f64,
    position_cap: f64,
    cost: f64,
}

impl PositionSizer {
    pub fn new(config: &DecisionConfig) -> Self {
        Self {
            kelly_multiplier: config.kelly_multiplier.clamp(0.0, 1.0),
            position_cap: config.position_cap.clamp(0.0, 1.0),
            cost: config.cost_bps / 10_000.0,
        }
    }

    /// Compute `ER = sum_h alpha(h) * direction * mu[h] - cost`,
    /// `V = sum_h alpha(h) * sigma2[h]`, and the clamped Kelly fraction
    /// `f* = clamp(ER / V * kappa, 0, f_cap)`. Suppressed (should_trade =
    /// false) whenever `ER <= 0`, matching the decision engine's ABANDON
    /// semantics for non-positive edge (spec §4.6).
    pub fn calculate(&self, hypothesis: &Hypothesis, posterior: &RegimePosterior) -> SizingOutput {
        let sign = hypothesis.direction.sign();

        let expected_return_raw: f64 = posterior
            .alpha
            .iter()
            .zip(&hypothesis.expected_return_per_regime)
            .map(|(&a, &mu)| a * sign * mu)
            .sum();
        let expected_return = expected_return_raw - self.cost;

        let variance: f64 = posterior
            .alpha
            .iter()
            .zip(&hypothesis.expected_variance_per_regime)
            .map(|(&a, &v)| a * v)
            .sum();

        let confidence = (1.0 - posterior.entropy() / (posterior.alpha.len() as f64).ln())
            .clamp(0.0, 1.0);

        if hypothesis.direction == Direction::Null {
            return SizingOutput {
                expected_return,
                variance,
                kelly_fraction: 0.0,
                confidence,
                should_trade: false,
                reason: "null hypothesis carries no position",
            };
        }

        if expected_return <= 0.0 {
            return SizingOutput {
                expected_return,
                variance,
                kelly_fraction: 0.0,
                confidence,
                should_trade: false,
                reason: "expected return net of cost is non-positive",
            };
        }

        if variance <= 0.0 {
            return SizingOutput {
                expected_return,
                variance,
                kelly_fraction: 0.0,
                confidence,
                should_trade: false,
                reason: "regime-mixed variance is non-positive",
            };
        }

        let raw_fraction = expected_return / variance * self.kelly_multiplier;
        let kelly_fraction = raw_fraction.clamp(0.0, self.position_cap);

        SizingOutput {
            expected_return,
            variance,
            kelly_fraction,
            confidence,
            should_trade: kelly_fraction > 0.0,
            reason: "positive edge within risk limits",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn decision_config() -> DecisionConfig {
        DecisionConfig {
            alpha: 0.05,
            beta: 0.20,
            cost_bps: 5.0,
            kelly_multiplier: 0.2,
            position_cap: 0.08,
            horizon_ticks_default: 200,
            forgetting_gamma: 0.99,
        }
    }

    fn hypothesis(direction: Direction, mu: f64, var: f64, k: usize) -> Hypothesis {
        Hypothesis {
            id: Uuid::new_v4(),
            direction,
            expected_return_per_regime: vec![mu; k],
            expected_variance_per_regime: vec![var; k],
            horizon_ticks: 200,
            created_at: chrono::Utc::now(),
            age_ticks: 0,
            status: crate::hypothesis::HypothesisStatus::Evaluating,
            last_touched_tick: 0,
        }
    }

    fn posterior(k: usize) -> RegimePosterior {
        RegimePosterior {
            alpha: vec![1.0 / k as f64; k],
            log_z: 0.0,
        }
    }

    #[test]
    fn positive_edge_produces_bounded_fraction() {
        let sizer = PositionSizer::new(&decision_config());
        let h = hypothesis(Direction::Long, 0.01, 0.0004, 3);
        let out = sizer.calculate(&h, &posterior(3));
        assert!(out.should_trade);
        assert!(out.kelly_fraction > 0.0 && out.kelly_fraction <= 0.08);
    }

    #[test]
    fn non_positive_edge_suppresses_trade() {
        let sizer = PositionSizer::new(&decision_config());
        let h = hypothesis(Direction::Long, 0.00001, 0.0004, 3);
        let out = sizer.calculate(&h, &posterior(3));
        assert!(!out.should_trade);
        assert_eq!(out.kelly_fraction, 0.0);
    }

    #[test]
    fn fraction_never_exceeds_position_cap() {
        let sizer = PositionSizer::new(&decision_config());
        let h = hypothesis(Direction::Long, 1.0, 0.0001, 2);
        let out = sizer.calculate(&h, &posterior(2));
        assert!(out.kelly_fraction <= 0.08);
    }

    #[test]
    fn null_direction_never_trades() {
        let sizer = PositionSizer::new(&decision_config());
        let h = hypothesis(Direction::Null, 0.02, 0.0004, 2);
        let out = sizer.calculate(&h, &posterior(2));
        assert!(!out.should_trade);
    }

    #[test]
    fn confidence_is_one_minus_normalized_entropy() {
        let sizer = PositionSizer::new(&decision_config());
        let h = hypothesis(Direction::Long, 0.01, 0.0004, 4);
        let mut p = posterior(4);
        p.alpha = vec![1.0, 0.0, 0.0, 0.0];
        let out = sizer.calculate(&h, &p);
        assert!(out.confidence > 0.99);
    }
}
