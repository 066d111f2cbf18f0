//! Decision Engine (C5): Sequential Probability Ratio Test over each active
//! hypothesis's log-likelihood ratio against the null (spec §4.5).

use std::collections::HashMap;

use quantis_core::config::DecisionConfig;
use uuid::Uuid;

use crate::hypothesis::{HypothesisLogLik, HypothesisStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionState {
    Continue,
    Execute,
    Abandon,
    Expired,
}

struct SprtTracker {
    log_odds: f64,
    state: DecisionState,
}

/// Per-instrument SPRT state over the active hypothesis set. Trackers
/// persist across ticks, keyed by hypothesis id, and are pruned once their
/// hypothesis leaves the active set.
pub struct DecisionEngine {
    gamma: f64,
    threshold_execute: f64,
    threshold_abandon: f64,
    trackers: HashMap<Uuid, SprtTracker>,
}

/// One hypothesis's decision-engine output for the current tick.
pub struct Decision {
    pub hypothesis_id: Uuid,
    pub log_odds: f64,
    pub state: DecisionState,
}

impl DecisionEngine {
    pub fn new(config: &DecisionConfig) -> Self {
        let alpha = config.alpha;
        let beta = config.beta;
        Self {
            gamma: config.forgetting_gamma,
            threshold_execute: ((1.0 - beta) / alpha).ln(),
            threshold_abandon: (beta / (1.0 - alpha)).ln(),
            trackers: HashMap::new(),
        }
    }

    /// Advance the SPRT for every hypothesis reported this tick. A `suspect`
    /// tick or an unstable HMM freezes all trackers in place (spec §4.5,
    /// §4.3) — no log-odds update, states held at their last value.
    pub fn on_tick(
        &mut self,
        hypotheses: &[HypothesisLogLik],
        ll_null: f64,
        freeze: bool,
    ) -> Vec<Decision> {
        let mut seen = std::collections::HashSet::new();

        let mut out = Vec::with_capacity(hypotheses.len());
        for h in hypotheses {
            seen.insert(h.id);

            if h.status != HypothesisStatus::Evaluating {
                self.trackers.remove(&h.id);
                out.push(Decision {
                    hypothesis_id: h.id,
                    log_odds: 0.0,
                    state: match h.status {
                        HypothesisStatus::Expired => DecisionState::Expired,
                        HypothesisStatus::Executed => DecisionState::Execute,
                        HypothesisStatus::Abandoned => DecisionState::Abandon,
                        HypothesisStatus::Evaluating => unreachable!(),
                    },
                });
                continue;
            }

            let tracker = self.trackers.entry(h.id).or_insert(SprtTracker {
                log_odds: 0.0,
                state: DecisionState::Continue,
            });

            if !freeze && tracker.state == DecisionState::Continue {
                let increment = h.log_lik - ll_null;
                tracker.log_odds = self.gamma * tracker.log_odds + increment;

                if tracker.log_odds >= self.threshold_execute {
                    tracker.state = DecisionState::Execute;
                } else if tracker.log_odds <= self.threshold_abandon {
                    tracker.state = DecisionState::Abandon;
                }
            }

            out.push(Decision {
                hypothesis_id: h.id,
                log_odds: tracker.log_odds,
                state: tracker.state,
            });
        }

        self.trackers.retain(|id, _| seen.contains(id));
        out
    }

    /// Among this tick's decisions, the single execute-state hypothesis with
    /// the highest log-odds wins the instrument's position (spec §4.5's
    /// tie-break rule); `None` if no hypothesis has reached EXECUTE.
    pub fn winning_execution<'a>(decisions: &'a [Decision]) -> Option<&'a Decision> {
        decisions
            .iter()
            .filter(|d| d.state == DecisionState::Execute)
            .max_by(|a, b| a.log_odds.total_cmp(&b.log_odds))
    }
}
