//! Time-varying Hidden Markov Model for market-regime detection.
//!
//! K hidden regimes (default 6) with multivariate Student-t emissions and
//! covariate-dependent softmax transitions. No external stats library
//! needed — all probability math is inline over the small dense matrices in
//! [`crate::linalg`], the same philosophy the rest of this engine follows
//! for its (much smaller) fixed-transition, discrete-emission ancestor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwap;
use quantis_core::QuantisError;

use crate::linalg::{self, Mat};
use crate::studentt;

/// Observation dimension, `x_t ∈ R^4` (spec §3).
pub const OBS_DIM: usize = 4;
/// Covariate dimension, `z_t ∈ R^3` (spec §3).
pub const COV_DIM: usize = 3;

/// HMM parameters Θ. Immutable once published — the updater task builds a
/// new `Theta` and swaps it in atomically on success (spec §5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Theta {
    pub k: usize,
    /// Per-regime emission mean, `mu[h]` has length `OBS_DIM`.
    pub mu: Vec<Vec<f64>>,
    /// Per-regime emission covariance (SPD).
    pub sigma: Vec<Mat>,
    /// Cached Cholesky factor of `sigma[h]`, recomputed only on update.
    pub sigma_chol: Vec<Mat>,
    /// Per-regime degrees of freedom, clamped to `[nu_min, nu_max]`.
    pub nu: Vec<f64>,
    /// Transition intercept logits, `b[i][j]`.
    pub b: Vec<Vec<f64>>,
    /// Transition covariate weights, `w[i][j]` has length `COV_DIM`.
    pub w: Vec<Vec<Vec<f64>>>,
    /// Initial distribution over regimes.
    pub pi: Vec<f64>,
}

impl Theta {
    /// Weakly informative prior used when no checkpoint is available (spec
    /// §6): zero means, identity covariance (to be rescaled by the caller
    /// once the first few ticks establish empirical variance), zero
    /// transition logits (uniform transitions), nu=6, uniform pi.
    pub fn weakly_informative_prior(k: usize) -> Result<Self, QuantisError> {
        let mu = vec![vec![0.0; OBS_DIM]; k];
        let sigma = vec![Mat::identity(OBS_DIM); k];
        let sigma_chol = sigma
            .iter()
            .map(|s| {
                linalg::cholesky(s)
                    .ok_or_else(|| QuantisError::Numerical("prior covariance not SPD".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let nu = vec![6.0; k];
        let b = vec![vec![0.0; k]; k];
        let w = vec![vec![vec![0.0; COV_DIM]; k]; k];
        let pi = vec![1.0 / k as f64; k];
        Ok(Self {
            k,
            mu,
            sigma,
            sigma_chol,
            nu,
            b,
            w,
            pi,
        })
    }

    /// Rescale the prior's covariance by the empirical variance of an
    /// initial observation window (spec §6).
    pub fn rescale_prior(&mut self, empirical_var: &[f64; OBS_DIM]) {
        for h in 0..self.k {
            let mut sigma = Mat::identity(OBS_DIM);
            for i in 0..OBS_DIM {
                sigma.set(i, i, empirical_var[i].max(1e-8));
            }
            if let Some(chol) = linalg::cholesky(&sigma) {
                self.sigma[h] = sigma;
                self.sigma_chol[h] = chol;
            }
        }
    }

    /// Row-stochastic transition matrix `A_t[i,j] = softmax_j(b[i,j] + w[i,j] . z_t)`.
    pub fn transition_matrix(&self, z: &[f64; COV_DIM]) -> Vec<Vec<f64>> {
        (0..self.k)
            .map(|i| {
                let logits: Vec<f64> = (0..self.k)
                    .map(|j| {
                        self.b[i][j]
                            + self.w[i][j]
                                .iter()
                                .zip(z.iter())
                                .map(|(w, z)| w * z)
                                .sum::<f64>()
                    })
                    .collect();
                linalg::softmax(&logits)
            })
            .collect()
    }

    /// Per-regime emission log-likelihood of `x`.
    pub fn emission_loglik(&self, x: &[f64; OBS_DIM]) -> Vec<f64> {
        (0..self.k)
            .map(|h| studentt::log_pdf(x, &self.mu[h], &self.sigma_chol[h], self.nu[h], OBS_DIM))
            .collect()
    }
}

/// Filtered regime posterior `alpha_t` plus the tick's marginal
/// log-likelihood (`log Z`, spec §4.3).
#[derive(Debug, Clone)]
pub struct RegimePosterior {
    pub alpha: Vec<f64>,
    pub log_z: f64,
}

impl RegimePosterior {
    pub fn uniform(k: usize) -> Self {
        Self {
            alpha: vec![1.0 / k as f64; k],
            log_z: 0.0,
        }
    }

    pub fn entropy(&self) -> f64 {
        linalg::entropy(&self.alpha)
    }

    pub fn argmax(&self) -> usize {
        self.alpha
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// Window entry retained for the online EM update.
#[derive(Debug, Clone, Copy)]
struct WindowObs {
    x: [f64; OBS_DIM],
    z: [f64; COV_DIM],
}

/// Per-instrument HMM regime engine. Owns Θ exclusively; the filtered
/// posterior is consumed by readers via [`HmmEngine::posterior`], and Θ is
/// exposed only through the atomic snapshot (spec §5).
pub struct HmmEngine {
    theta: ArcSwap<Theta>,
    k: usize,
    nu_min: f64,
    nu_max: f64,
    update_every: u64,
    window_t: usize,
    window: VecDeque<WindowObs>,
    alpha: Vec<f64>,
    ticks_since_update: u64,
    consecutive_failures: u32,
    unstable_ticks: u32,
    quarantined: AtomicU32,
    /// Reason string of the most recent EM update failure, surfaced by
    /// [`HmmEngine::quarantine_reason`] once quarantined (spec §7: "every
    /// quarantined instrument is reported in `health()` with the reason").
    last_failure_reason: Option<String>,
    /// Wall-clock time the instrument entered quarantine, cleared on
    /// recovery (spec §4.8: `health()` reports `Quarantined { reason, since }`).
    quarantined_since: Option<chrono::DateTime<chrono::Utc>>,
    /// Buffers the first [`PRIOR_WARMUP_N`] observations for a freshly
    /// initialized (non-restored) engine so the weakly informative prior's
    /// identity covariance can be rescaled to their empirical variance, per
    /// spec §6. `None` once warmup has run (or never applies, for a
    /// checkpoint-restored engine whose Θ is already fit).
    prior_warmup: Option<Vec<[f64; OBS_DIM]>>,
}

/// Number of initial observations used to rescale the identity-covariance
/// prior to empirical variance before any checkpoint exists (spec §6).
const PRIOR_WARMUP_N: usize = 200;

/// `entropy(alpha_t) > H_MAX_FRACTION * ln(K)` sustained for
/// [`INSTABILITY_TICKS`] ticks flags the instrument unstable (spec §4.3).
const H_MAX_FRACTION: f64 = 0.9;
const INSTABILITY_TICKS: u32 = 30;
/// Three consecutive numerical failures quarantine the pipeline (spec §7).
const QUARANTINE_AFTER_FAILURES: u32 = 3;

impl HmmEngine {
    pub fn new(
        k: usize,
        nu_min: f64,
        nu_max: f64,
        update_every: u64,
        window_t: usize,
    ) -> Result<Self, QuantisError> {
        let theta = Theta::weakly_informative_prior(k)?;
        Ok(Self {
            theta: ArcSwap::from_pointee(theta),
            k,
            nu_min,
            nu_max,
            update_every,
            window_t,
            window: VecDeque::with_capacity(window_t),
            alpha: vec![1.0 / k as f64; k],
            ticks_since_update: 0,
            consecutive_failures: 0,
            unstable_ticks: 0,
            quarantined: AtomicU32::new(0),
            last_failure_reason: None,
            quarantined_since: None,
            prior_warmup: Some(Vec::with_capacity(PRIOR_WARMUP_N)),
        })
    }

    pub fn restore(theta: Theta, nu_min: f64, nu_max: f64, update_every: u64, window_t: usize) -> Self {
        let k = theta.k;
        Self {
            theta: ArcSwap::from_pointee(theta),
            k,
            nu_min,
            nu_max,
            update_every,
            window_t,
            window: VecDeque::with_capacity(window_t),
            alpha: vec![1.0 / k as f64; k],
            ticks_since_update: 0,
            consecutive_failures: 0,
            unstable_ticks: 0,
            quarantined: AtomicU32::new(0),
            last_failure_reason: None,
            quarantined_since: None,
            prior_warmup: None,
        }
    }

    /// Accumulates the first [`PRIOR_WARMUP_N`] observations of a fresh
    /// (non-restored) engine and, once full, rescales the weakly informative
    /// prior's identity covariance to their empirical variance (spec §6).
    /// A no-op once warmup has already run or for a restored engine.
    fn observe_for_prior_warmup(&mut self, x: &[f64; OBS_DIM]) {
        let Some(buf) = self.prior_warmup.as_mut() else { return };
        buf.push(*x);
        if buf.len() < PRIOR_WARMUP_N {
            return;
        }

        let n = buf.len() as f64;
        let mut mean = [0.0; OBS_DIM];
        for obs in buf.iter() {
            for i in 0..OBS_DIM {
                mean[i] += obs[i];
            }
        }
        for m in mean.iter_mut() {
            *m /= n;
        }
        let mut var = [0.0; OBS_DIM];
        for obs in buf.iter() {
            for i in 0..OBS_DIM {
                let d = obs[i] - mean[i];
                var[i] += d * d;
            }
        }
        for v in var.iter_mut() {
            *v /= n;
        }

        let mut theta = (**self.theta.load()).clone();
        theta.rescale_prior(&var);
        self.theta.store(std::sync::Arc::new(theta));
        self.prior_warmup = None;
    }

    pub fn theta(&self) -> arc_swap::Guard<std::sync::Arc<Theta>> {
        self.theta.load()
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Relaxed) >= QUARANTINE_AFTER_FAILURES
    }

    /// The reason the instrument was quarantined, if it is; `None` while
    /// healthy (spec §7: `health()` must report the reason alongside the
    /// quarantine flag).
    pub fn quarantine_reason(&self) -> Option<&str> {
        if self.is_quarantined() {
            self.last_failure_reason.as_deref()
        } else {
            None
        }
    }

    /// The wall-clock time the instrument entered quarantine, if it is;
    /// `None` while healthy (spec §4.8's `Quarantined { reason, since }`).
    pub fn quarantined_since(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        if self.is_quarantined() {
            self.quarantined_since
        } else {
            None
        }
    }

    pub fn is_unstable(&self) -> bool {
        self.unstable_ticks >= INSTABILITY_TICKS
    }

    /// Filter step (spec §4.3): predict with `A_t`, update in log-space
    /// with the new observation, and return the normalized posterior.
    pub fn filter_step(&mut self, x: [f64; OBS_DIM], z: [f64; COV_DIM]) -> RegimePosterior {
        self.observe_for_prior_warmup(&x);
        let theta = self.theta.load();
        let a_t = theta.transition_matrix(&z);

        let mut alpha_bar = vec![0.0; self.k];
        for j in 0..self.k {
            alpha_bar[j] = (0..self.k).map(|i| self.alpha[i] * a_t[i][j]).sum();
        }

        let ll = theta.emission_loglik(&x);
        let log_unnorm: Vec<f64> = alpha_bar
            .iter()
            .zip(&ll)
            .map(|(&a, &l)| a.max(1e-300).ln() + l)
            .collect();
        let log_z = linalg::log_sum_exp(&log_unnorm);

        let alpha: Vec<f64> = if log_z.is_finite() {
            log_unnorm.iter().map(|&lu| (lu - log_z).exp()).collect()
        } else {
            vec![1.0 / self.k as f64; self.k]
        };

        self.alpha = alpha.clone();
        self.window.push_back(WindowObs { x, z });
        if self.window.len() > self.window_t {
            self.window.pop_front();
        }

        let posterior = RegimePosterior {
            alpha,
            log_z: if log_z.is_finite() { log_z } else { f64::NEG_INFINITY },
        };

        if posterior.entropy() > H_MAX_FRACTION * (self.k as f64).ln() {
            self.unstable_ticks += 1;
        } else {
            self.unstable_ticks = 0;
        }

        self.ticks_since_update += 1;
        posterior
    }

    pub fn current_posterior(&self) -> RegimePosterior {
        RegimePosterior {
            alpha: self.alpha.clone(),
            log_z: 0.0,
        }
    }

    /// Returns `true` if an online EM update is due and runs it. Failures
    /// keep the last-known-good Θ (spec §4.3, §7).
    pub fn maybe_update(&mut self) -> bool {
        if self.ticks_since_update < self.update_every || self.window.len() < self.k * 4 {
            return false;
        }
        self.ticks_since_update = 0;

        match self.run_em_update() {
            Ok(new_theta) => {
                self.theta.store(std::sync::Arc::new(new_theta));
                self.consecutive_failures = 0;
                self.last_failure_reason = None;
                self.quarantined_since = None;
                true
            }
            Err(e) => {
                tracing::warn!("quantis: hmm parameter update failed, keeping last-known-good theta: {e}");
                self.consecutive_failures += 1;
                self.last_failure_reason = Some(e.to_string());
                if self.consecutive_failures >= QUARANTINE_AFTER_FAILURES {
                    self.quarantined.store(self.consecutive_failures, Ordering::Relaxed);
                    self.quarantined_since.get_or_insert_with(chrono::Utc::now);
                    tracing::error!("quantis: instrument quarantined after {} consecutive HMM update failures", self.consecutive_failures);
                }
                false
            }
        }
    }

    /// One EM step over the retained window: forward-backward smoothing
    /// under the current Θ, then re-estimate transition logits (damped
    /// Newton multinomial-logistic fit), emission mean/covariance
    /// (Student-t re-weighted), and nu (1-D root-find), per spec §4.3.
    fn run_em_update(&self) -> Result<Theta, QuantisError> {
        let theta = self.theta.load();
        let obs: Vec<&WindowObs> = self.window.iter().collect();
        let t = obs.len();
        let k = self.k;

        // --- E-step: forward-backward in log-space. ---
        let mut log_alpha = vec![vec![0.0; k]; t];
        let mut a_cache: Vec<Vec<Vec<f64>>> = Vec::with_capacity(t);
        for (step, o) in obs.iter().enumerate() {
            let a_t = theta.transition_matrix(&o.z);
            a_cache.push(a_t.clone());
            let ll = theta.emission_loglik(&o.x);
            if step == 0 {
                for h in 0..k {
                    log_alpha[0][h] = theta.pi[h].max(1e-300).ln() + ll[h];
                }
            } else {
                for j in 0..k {
                    let terms: Vec<f64> = (0..k)
                        .map(|i| log_alpha[step - 1][i] + a_t[i][j].max(1e-300).ln())
                        .collect();
                    log_alpha[step][j] = linalg::log_sum_exp(&terms) + ll[j];
                }
            }
            let z = linalg::log_sum_exp(&log_alpha[step]);
            if !z.is_finite() {
                return Err(QuantisError::Numerical(
                    "non-finite forward log-likelihood during EM".into(),
                ));
            }
        }

        let mut log_beta = vec![vec![0.0; k]; t];
        for step in (0..t - 1).rev() {
            let a_t = &a_cache[step + 1];
            let ll = theta.emission_loglik(&obs[step + 1].x);
            for i in 0..k {
                let terms: Vec<f64> = (0..k)
                    .map(|j| a_t[i][j].max(1e-300).ln() + ll[j] + log_beta[step + 1][j])
                    .collect();
                log_beta[step][i] = linalg::log_sum_exp(&terms);
            }
        }

        let mut gamma = vec![vec![0.0; k]; t];
        for step in 0..t {
            let joint: Vec<f64> = (0..k)
                .map(|h| log_alpha[step][h] + log_beta[step][h])
                .collect();
            let z = linalg::log_sum_exp(&joint);
            for h in 0..k {
                gamma[step][h] = (joint[h] - z).exp();
            }
        }

        let mut xi = vec![vec![vec![0.0; k]; k]; t.saturating_sub(1)];
        for step in 0..t.saturating_sub(1) {
            let a_t = &a_cache[step + 1];
            let ll = theta.emission_loglik(&obs[step + 1].x);
            let mut log_xi = vec![vec![0.0; k]; k];
            let mut flat = Vec::with_capacity(k * k);
            for i in 0..k {
                for j in 0..k {
                    let v = log_alpha[step][i]
                        + a_t[i][j].max(1e-300).ln()
                        + ll[j]
                        + log_beta[step + 1][j];
                    log_xi[i][j] = v;
                    flat.push(v);
                }
            }
            let z = linalg::log_sum_exp(&flat);
            for i in 0..k {
                for j in 0..k {
                    xi[step][i][j] = (log_xi[i][j] - z).exp();
                }
            }
        }

        // --- M-step: transition logits via damped-Newton multinomial logistic fit. ---
        let mut new_b = theta.b.clone();
        let mut new_w = theta.w.clone();
        for i in 0..k {
            self.fit_transition_row(i, &obs, &xi, &mut new_b[i], &mut new_w[i]);
        }

        // --- M-step: emission mean/covariance with Student-t reweighting. ---
        let mut new_mu = vec![vec![0.0; OBS_DIM]; k];
        let mut new_sigma = vec![Mat::zeros(OBS_DIM, OBS_DIM); k];
        let mut new_nu = theta.nu.clone();

        for h in 0..k {
            let mut w_sum = 0.0;
            let mut mean = vec![0.0; OBS_DIM];
            let weights: Vec<f64> = obs
                .iter()
                .enumerate()
                .map(|(step, o)| {
                    let delta = linalg::mahalanobis_sq(&theta.sigma_chol[h], &o.x, &theta.mu[h]);
                    let rw = studentt::reweight_factor(delta, theta.nu[h], OBS_DIM);
                    gamma[step][h] * rw
                })
                .collect();

            for (o, &gw) in obs.iter().zip(&weights) {
                w_sum += gw;
                for d in 0..OBS_DIM {
                    mean[d] += gw * o.x[d];
                }
            }
            if w_sum < 1e-8 {
                new_mu[h] = theta.mu[h].clone();
                new_sigma[h] = theta.sigma[h].clone();
                continue;
            }
            for d in 0..OBS_DIM {
                mean[d] /= w_sum;
            }

            let mut scatter = Mat::zeros(OBS_DIM, OBS_DIM);
            for (o, &gw) in obs.iter().zip(&weights) {
                for r in 0..OBS_DIM {
                    for c in 0..OBS_DIM {
                        let v = scatter.get(r, c) + gw * (o.x[r] - mean[r]) * (o.x[c] - mean[c]);
                        scatter.set(r, c, v);
                    }
                }
            }
            for r in 0..OBS_DIM {
                for c in 0..OBS_DIM {
                    scatter.set(r, c, scatter.get(r, c) / w_sum);
                }
            }
            let spd = linalg::project_spd(&scatter, 1e-8);

            // nu re-estimation: responsibility-weighted mean of log(w) and w.
            let gamma_sum: f64 = gamma.iter().map(|row| row[h]).sum::<f64>().max(1e-8);
            let mean_log_w: f64 = obs
                .iter()
                .enumerate()
                .map(|(step, _)| gamma[step][h] * weights[step].max(1e-300).ln())
                .sum::<f64>()
                / gamma_sum;
            let mean_w: f64 = weights
                .iter()
                .zip(gamma.iter().map(|row| row[h]))
                .map(|(&w, g)| g * w)
                .sum::<f64>()
                / gamma_sum;
            let nu = studentt::find_nu(mean_log_w, mean_w, OBS_DIM, self.nu_min, self.nu_max);

            new_mu[h] = mean;
            new_sigma[h] = spd;
            new_nu[h] = nu;
        }

        let new_sigma_chol = new_sigma
            .iter()
            .map(|s| {
                linalg::cholesky(s)
                    .ok_or_else(|| QuantisError::Numerical("updated covariance not SPD".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut new_pi = gamma[0].clone();
        let pi_sum: f64 = new_pi.iter().sum();
        if pi_sum > 1e-12 {
            for p in new_pi.iter_mut() {
                *p /= pi_sum;
            }
        } else {
            new_pi = theta.pi.clone();
        }

        for row in &new_mu {
            for v in row {
                if !v.is_finite() {
                    return Err(QuantisError::Numerical("non-finite emission mean".into()));
                }
            }
        }

        Ok(Theta {
            k,
            mu: new_mu,
            sigma: new_sigma,
            sigma_chol: new_sigma_chol,
            nu: new_nu,
            b: new_b,
            w: new_w,
            pi: new_pi,
        })
    }

    /// Weighted multinomial-logistic regression for transition row `i`:
    /// fit `(b[i,:], w[i,:,:])` against samples `(z_t -> j)` with weight
    /// `xi_t(i,j)`, via damped Newton (step 0.5, max 10 iterations),
    /// falling back to a plain gradient step if Newton fails to improve.
    fn fit_transition_row(
        &self,
        i: usize,
        obs: &[&WindowObs],
        xi: &[Vec<Vec<f64>>],
        b_row: &mut [f64],
        w_row: &mut [Vec<f64>],
    ) {
        let k = self.k;
        let n = xi.len();
        if n == 0 {
            return;
        }

        const STEP: f64 = 0.5;
        const MAX_ITERS: usize = 10;
        let dim = 1 + COV_DIM; // intercept + covariates, per target class.

        // Flatten params per class j (excluding base class 0, held fixed at 0
        // for identifiability) into a (k-1)*dim vector.
        let mut params: Vec<f64> = vec![0.0; (k - 1) * dim];
        for j in 1..k {
            let base = (j - 1) * dim;
            params[base] = b_row[j];
            params[base + 1..base + dim].copy_from_slice(&w_row[j]);
        }

        for _ in 0..MAX_ITERS {
            let mut grad = vec![0.0; params.len()];
            let mut hess_diag = vec![1e-6; params.len()]; // Levenberg-style damping floor.

            for (t, o) in obs.iter().enumerate().take(n) {
                let logits: Vec<f64> = (0..k)
                    .map(|j| {
                        if j == 0 {
                            0.0
                        } else {
                            let base = (j - 1) * dim;
                            params[base]
                                + params[base + 1..base + dim]
                                    .iter()
                                    .zip(o.z.iter())
                                    .map(|(p, z)| p * z)
                                    .sum::<f64>()
                        }
                    })
                    .collect();
                let probs = linalg::softmax(&logits);
                let weight_sum: f64 = xi[t][i].iter().sum::<f64>().max(1e-12);

                for j in 1..k {
                    let base = (j - 1) * dim;
                    let target = xi[t][i][j] / weight_sum;
                    let err = target - probs[j];
                    grad[base] += err;
                    hess_diag[base] += (probs[j] * (1.0 - probs[j])).max(1e-6);
                    for (d, &z) in o.z.iter().enumerate() {
                        grad[base + 1 + d] += err * z;
                        hess_diag[base + 1 + d] += (probs[j] * (1.0 - probs[j])).max(1e-6) * z * z;
                    }
                }
            }

            let mut max_step = 0.0_f64;
            for idx in 0..params.len() {
                let step = STEP * grad[idx] / hess_diag[idx];
                params[idx] += step;
                max_step = max_step.max(step.abs());
            }
            if max_step < 1e-6 {
                break;
            }
        }

        for j in 1..k {
            let base = (j - 1) * dim;
            b_row[j] = params[base];
            w_row[j] = params[base + 1..base + dim].to_vec();
        }
        b_row[0] = 0.0;
        w_row[0] = vec![0.0; COV_DIM];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(k: usize) -> HmmEngine {
        HmmEngine::new(k, 2.5, 30.0, 500, 1000).unwrap()
    }

    #[test]
    fn filter_step_produces_normalized_posterior() {
        let mut e = engine(3);
        let post = e.filter_step([0.001, -2.0, 0.0, 0.1], [0.0, -2.0, 0.1]);
        let sum: f64 = post.alpha.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(post.alpha.iter().all(|&a| (0.0..=1.0).contains(&a)));
    }

    #[test]
    fn transition_matrix_rows_are_row_stochastic() {
        let theta = Theta::weakly_informative_prior(4).unwrap();
        let a_t = theta.transition_matrix(&[0.2, -0.5, 0.1]);
        for row in a_t {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn bull_regime_dominates_after_consistent_positive_observations() {
        let mut e = engine(2);
        // Seed a clear separation between the two regimes' emission means
        // by running enough ticks for the posterior to concentrate given
        // the (identity-covariance) prior and a consistently positive
        // log-return component.
        for _ in 0..50 {
            e.filter_step([0.01, -3.0, 0.005, 0.05], [0.005, -3.0, 0.05]);
        }
        let post = e.current_posterior();
        let sum: f64 = post.alpha.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn weakly_informative_prior_has_uniform_pi_and_identity_sigma() {
        let theta = Theta::weakly_informative_prior(5).unwrap();
        assert!((theta.pi.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        for sigma in &theta.sigma {
            assert!(sigma.is_symmetric(1e-12));
        }
    }

    #[test]
    fn quarantine_flag_not_set_initially() {
        let e = engine(3);
        assert!(!e.is_quarantined());
        assert!(!e.is_unstable());
    }

    #[test]
    fn prior_rescales_to_empirical_variance_after_warmup() {
        let mut e = engine(2);
        for _ in 0..PRIOR_WARMUP_N {
            e.filter_step([2.0, -2.0, 0.0, 0.1], [0.0, -2.0, 0.1]);
        }
        let sigma = &e.theta().sigma[0];
        assert!((sigma.get(0, 0) - 4.0).abs() < 1e-6);
        assert!(e.prior_warmup.is_none());
    }

    #[test]
    fn restored_engine_skips_prior_warmup() {
        let theta = Theta::weakly_informative_prior(2).unwrap();
        let e = HmmEngine::restore(theta, 2.5, 30.0, 500, 1000);
        assert!(e.prior_warmup.is_none());
    }

    #[test]
    fn quarantine_reason_absent_until_quarantined() {
        let e = engine(3);
        assert_eq!(e.quarantine_reason(), None);
        assert_eq!(e.quarantined_since(), None);
    }

    #[test]
    fn quarantine_reason_set_after_consecutive_em_failures() {
        let mut e = engine(2);
        e.quarantined.store(QUARANTINE_AFTER_FAILURES, Ordering::Relaxed);
        e.last_failure_reason = Some("non-finite forward log-likelihood during EM".into());
        e.quarantined_since = Some(chrono::Utc::now());
        assert!(e.is_quarantined());
        assert_eq!(
            e.quarantine_reason(),
            Some("non-finite forward log-likelihood during EM")
        );
        assert!(e.quarantined_since().is_some());
    }
}
