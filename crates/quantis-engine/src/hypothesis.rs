//! Hypothesis Evaluator (C4): maintains the active hypothesis set per
//! instrument and computes per-tick log-likelihoods under the current
//! regime mixture (spec §4.4).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use quantis_core::Instrument;
use uuid::Uuid;

use crate::hmm::RegimePosterior;

/// Max concurrently active hypotheses per instrument (spec §4.4).
pub const MAX_ACTIVE_HYPOTHESES: usize = 32;
/// Regime-transition hold requirement before a new hypothesis pair is
/// generated (spec §4.4).
const TRANSITION_HOLD_TICKS: u32 = 3;
/// Periodic stale-hypothesis refresh cadence (spec §4.4).
const REFRESH_PERIOD_TICKS: u64 = 60 * 10; // approx. 60s at a 100ms tick cadence.
/// Bounded cross-instrument propagation depth (spec §4.4).
pub const MAX_PROPAGATION_DEPTH: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypothesisStatus {
    Evaluating,
    Executed,
    Abandoned,
    Expired,
}

/// Direction a hypothesis bets on; `Null` carries no position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
    Null,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Null => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub id: Uuid,
    pub direction: Direction,
    pub expected_return_per_regime: Vec<f64>,
    pub expected_variance_per_regime: Vec<f64>,
    pub horizon_ticks: u64,
    pub created_at: DateTime<Utc>,
    pub age_ticks: u64,
    pub status: HypothesisStatus,
    pub(crate) last_touched_tick: u64,
}

fn log_gaussian_pdf(x: f64, mu: f64, sigma2: f64) -> f64 {
    let sigma2 = sigma2.max(1e-12);
    -0.5 * ((x - mu).powi(2) / sigma2 + sigma2.ln() + (2.0 * std::f64::consts::PI).ln())
}

/// Cross-instrument entanglement input: the other instrument's current
/// posterior, realized return, and the configured weight `E[i,j]`.
pub struct EntangledInput<'a> {
    pub other: &'a Instrument,
    pub weight: f64,
    pub other_posterior: &'a RegimePosterior,
    pub other_realized_return: f64,
}

/// Per-tick evaluation output for one hypothesis.
pub struct HypothesisLogLik {
    pub id: Uuid,
    pub log_lik: f64,
    pub status: HypothesisStatus,
}

/// Per-instrument active hypothesis set and generator.
pub struct HypothesisEvaluator {
    instrument: Instrument,
    active: Vec<Hypothesis>,
    tick_no: u64,
    prev_argmax: Option<usize>,
    argmax_hold: u32,
    residual_window: VecDeque<(usize, f64)>, // (regime at the time, log_return)
    residual_capacity: usize,
    last_refresh_tick: u64,
}

impl HypothesisEvaluator {
    pub fn new(instrument: Instrument, residual_capacity: usize) -> Self {
        Self {
            instrument,
            active: Vec::new(),
            tick_no: 0,
            prev_argmax: None,
            argmax_hold: 0,
            residual_window: VecDeque::with_capacity(residual_capacity),
            residual_capacity,
            last_refresh_tick: 0,
        }
    }

    /// Advance internal bookkeeping and possibly generate new hypotheses
    /// from a regime-transition event or the periodic refresh timer (spec
    /// §4.4). `realized_return` is the tick's log-return, used both to
    /// build the residual window and, via the caller's horizon tracking, to
    /// compute realized returns for active hypotheses.
    pub fn on_tick(&mut self, posterior: &RegimePosterior, realized_return: f64) {
        self.tick_no += 1;
        for h in &mut self.active {
            h.age_ticks += 1;
        }
        self.active
            .retain(|h| h.status == HypothesisStatus::Evaluating || h.age_ticks <= h.horizon_ticks);
        for h in &mut self.active {
            if h.status == HypothesisStatus::Evaluating && h.age_ticks > h.horizon_ticks {
                h.status = HypothesisStatus::Expired;
            }
        }

        let argmax = posterior.argmax();
        if self.residual_window.len() >= self.residual_capacity {
            self.residual_window.pop_front();
        }
        self.residual_window.push_back((argmax, realized_return));

        let transitioned = match self.prev_argmax {
            Some(prev) if prev != argmax => true,
            None => true,
            _ => false,
        };
        if transitioned {
            self.argmax_hold = 1;
            self.prev_argmax = Some(argmax);
        } else {
            self.argmax_hold += 1;
        }

        if self.argmax_hold == TRANSITION_HOLD_TICKS {
            self.generate_pair(posterior.alpha.len(), 200);
        }

        if self.tick_no - self.last_refresh_tick >= REFRESH_PERIOD_TICKS {
            self.last_refresh_tick = self.tick_no;
            self.refresh_stale(posterior.alpha.len(), 200);
        }

        self.evict_lru();
    }

    /// Estimate `expected_return_per_regime`/`expected_variance_per_regime`
    /// from the posterior-weighted residual window (Open Question decision,
    /// see DESIGN.md): per regime `h`, the mean/variance of log-returns
    /// observed while `h` was the filtered argmax.
    fn estimate_regime_stats(&self, k: usize) -> (Vec<f64>, Vec<f64>) {
        let mut sums = vec![0.0; k];
        let mut counts = vec![0usize; k];
        for &(h, r) in &self.residual_window {
            sums[h] += r;
            counts[h] += 1;
        }
        let means: Vec<f64> = sums
            .iter()
            .zip(&counts)
            .map(|(&s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
            .collect();

        let mut var_sums = vec![0.0; k];
        for &(h, r) in &self.residual_window {
            var_sums[h] += (r - means[h]).powi(2);
        }
        let variances: Vec<f64> = var_sums
            .iter()
            .zip(&counts)
            .map(|(&s, &c)| if c > 1 { s / c as f64 } else { 1e-6 })
            .collect();

        (means, variances)
    }

    fn generate_pair(&mut self, k: usize, horizon_ticks: u64) {
        let (means, variances) = self.estimate_regime_stats(k);
        for direction in [Direction::Long, Direction::Short] {
            self.push_hypothesis(Hypothesis {
                id: Uuid::new_v4(),
                direction,
                expected_return_per_regime: means.clone(),
                expected_variance_per_regime: variances.clone(),
                horizon_ticks,
                created_at: Utc::now(),
                age_ticks: 0,
                status: HypothesisStatus::Evaluating,
                last_touched_tick: self.tick_no,
            });
        }
        tracing::info!(
            "quantis: instrument {} generated hypothesis pair on regime transition",
            self.instrument
        );
    }

    fn refresh_stale(&mut self, k: usize, horizon_ticks: u64) {
        if self
            .active
            .iter()
            .all(|h| h.status != HypothesisStatus::Evaluating)
        {
            self.generate_pair(k, horizon_ticks);
        }
    }

    fn push_hypothesis(&mut self, h: Hypothesis) {
        self.active.push(h);
        self.evict_lru();
    }

    fn evict_lru(&mut self) {
        while self.active.len() > MAX_ACTIVE_HYPOTHESES {
            if let Some((idx, _)) = self
                .active
                .iter()
                .enumerate()
                .min_by_key(|(_, h)| h.last_touched_tick)
            {
                self.active.remove(idx);
            } else {
                break;
            }
        }
    }

    pub fn active_hypotheses(&self) -> &[Hypothesis] {
        &self.active
    }

    pub fn mark_executed(&mut self, id: Uuid) {
        if let Some(h) = self.active.iter_mut().find(|h| h.id == id) {
            h.status = HypothesisStatus::Executed;
        }
    }

    pub fn mark_abandoned(&mut self, id: Uuid) {
        if let Some(h) = self.active.iter_mut().find(|h| h.id == id) {
            h.status = HypothesisStatus::Abandoned;
        }
    }

    /// Per-tick log-likelihood for every active hypothesis plus the null
    /// hypothesis, under the regime mixture `posterior`. `entangled`
    /// contributes a weighted cross-return term, bounded to
    /// [`MAX_PROPAGATION_DEPTH`] by construction (callers only pass direct
    /// neighbors, never transitive ones).
    pub fn log_likelihoods(
        &mut self,
        posterior: &RegimePosterior,
        realized_return: f64,
        entangled: &[EntangledInput],
    ) -> (Vec<HypothesisLogLik>, f64) {
        for h in &mut self.active {
            h.last_touched_tick = self.tick_no;
        }

        let ll_null = {
            let regime_vol: f64 = posterior
                .alpha
                .iter()
                .zip(self.estimate_regime_stats(posterior.alpha.len()).1.iter())
                .map(|(&a, &v)| a * v)
                .sum();
            log_gaussian_pdf(realized_return, 0.0, regime_vol)
        };

        let entangled_term: f64 = entangled
            .iter()
            .map(|e| e.weight * e.other_realized_return)
            .sum();
        let r_hat = realized_return + entangled_term;

        let outputs = self
            .active
            .iter()
            .map(|h| {
                let per_regime: Vec<f64> = (0..posterior.alpha.len())
                    .map(|r| {
                        let mu = h.direction.sign() * h.expected_return_per_regime[r];
                        let sigma2 = h.expected_variance_per_regime[r];
                        posterior.alpha[r].max(1e-300).ln() + log_gaussian_pdf(r_hat, mu, sigma2)
                    })
                    .collect();
                let log_lik = crate::linalg::log_sum_exp(&per_regime);
                HypothesisLogLik {
                    id: h.id,
                    log_lik,
                    status: h.status,
                }
            })
            .collect();

        (outputs, ll_null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::RegimePosterior;

    fn posterior(argmax: usize, k: usize) -> RegimePosterior {
        let mut alpha = vec![0.01; k];
        alpha[argmax] = 1.0 - 0.01 * (k - 1) as f64;
        RegimePosterior { alpha, log_z: 0.0 }
    }

    #[test]
    fn generates_pair_after_transition_holds() {
        let mut ev = HypothesisEvaluator::new(Instrument::from("BTC-USDT"), 100);
        for _ in 0..5 {
            ev.on_tick(&posterior(0, 2), 0.001);
        }
        assert!(ev.active_hypotheses().len() >= 2);
        let directions: Vec<_> = ev.active_hypotheses().iter().map(|h| h.direction).collect();
        assert!(directions.contains(&Direction::Long));
        assert!(directions.contains(&Direction::Short));
    }

    #[test]
    fn respects_max_active_cap() {
        let mut ev = HypothesisEvaluator::new(Instrument::from("BTC-USDT"), 100);
        for i in 0..50 {
            let argmax = i % 2;
            ev.on_tick(&posterior(argmax, 2), 0.001 * (i as f64));
        }
        assert!(ev.active_hypotheses().len() <= MAX_ACTIVE_HYPOTHESES);
    }

    #[test]
    fn expires_hypotheses_past_horizon() {
        let mut ev = HypothesisEvaluator::new(Instrument::from("BTC-USDT"), 100);
        for _ in 0..5 {
            ev.on_tick(&posterior(0, 2), 0.001);
        }
        for _ in 0..205 {
            ev.on_tick(&posterior(0, 2), 0.0);
        }
        assert!(ev
            .active_hypotheses()
            .iter()
            .all(|h| h.status != HypothesisStatus::Evaluating || h.age_ticks <= h.horizon_ticks));
    }

    #[test]
    fn null_hypothesis_log_lik_is_finite_with_no_active_hypotheses() {
        let mut ev = HypothesisEvaluator::new(Instrument::from("BTC-USDT"), 100);
        let p = posterior(0, 2);
        let (outputs, ll_null) = ev.log_likelihoods(&p, 0.0, &[]);
        assert!(outputs.is_empty());
        assert!(ll_null.is_finite());
    }
}
