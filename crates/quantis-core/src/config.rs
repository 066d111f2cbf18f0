use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::QuantisError;
use crate::ids::Instrument;

/// Top-level Quantis configuration (spec §6).
///
/// Unknown keys are a hard error — this is deliberately stricter than a
/// typed-by-convention config: a typo in a field name must fail loudly at
/// startup, not be silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub instruments: Vec<Instrument>,
    pub venues: Vec<VenueConfig>,
    #[serde(default)]
    pub hmm: HmmConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub entanglement_matrix: EntanglementConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// A single venue (exchange) to subscribe ticks from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VenueConfig {
    pub name: String,
    pub endpoint: String,
    /// Lower is higher priority; used as the cross-venue tie-break (§4.1).
    #[serde(default = "default_priority")]
    pub priority: u8,
}

/// HMM regime engine parameters (spec §3, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HmmConfig {
    /// Number of hidden regimes, K.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Length of the rolling observation window used for online EM, T_window.
    #[serde(default = "default_window_t")]
    pub window_t: usize,
    /// Cadence (in ticks) of the online parameter update, S.
    #[serde(default = "default_update_every_s")]
    pub update_every_s: u64,
    #[serde(default = "default_nu_min")]
    pub nu_min: f64,
    #[serde(default = "default_nu_max")]
    pub nu_max: f64,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            window_t: default_window_t(),
            update_every_s: default_update_every_s(),
            nu_min: default_nu_min(),
            nu_max: default_nu_max(),
        }
    }
}

/// Decision engine and position sizer parameters (spec §4.5, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionConfig {
    /// SPRT type-I error rate.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// SPRT type-II error rate.
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Round-trip trading cost, in basis points.
    #[serde(default = "default_cost_bps")]
    pub cost_bps: f64,
    /// Kelly multiplier κ ∈ (0, 1].
    #[serde(default = "default_kelly_multiplier")]
    pub kelly_multiplier: f64,
    /// Hard per-instrument position cap, f_cap.
    #[serde(default = "default_position_cap")]
    pub position_cap: f64,
    /// Default hypothesis horizon, in ticks.
    #[serde(default = "default_horizon_ticks")]
    pub horizon_ticks_default: u64,
    /// Forgetting factor γ applied to the SPRT log-odds accumulator.
    #[serde(default = "default_forgetting_gamma")]
    pub forgetting_gamma: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            beta: default_beta(),
            cost_bps: default_cost_bps(),
            kelly_multiplier: default_kelly_multiplier(),
            position_cap: default_position_cap(),
            horizon_ticks_default: default_horizon_ticks(),
            forgetting_gamma: default_forgetting_gamma(),
        }
    }
}

/// Cross-instrument entanglement matrix, `E[i,j]` weighting instrument
/// `j`'s realized return into instrument `i`'s hypothesis likelihoods.
///
/// Symmetric, zero diagonal, entries in `[-1, 1]` (enforced by `validate`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EntanglementConfig {
    /// Sparse representation: only non-zero pairs need to be listed.
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

impl EntanglementConfig {
    fn pair_key(a: &Instrument, b: &Instrument) -> String {
        if a.as_str() <= b.as_str() {
            format!("{a}:{b}")
        } else {
            format!("{b}:{a}")
        }
    }

    /// Entanglement weight between two distinct instruments; 0 if unlisted
    /// or if `a == b` (diagonal is always zero).
    pub fn weight(&self, a: &Instrument, b: &Instrument) -> f64 {
        if a == b {
            return 0.0;
        }
        self.weights
            .get(&Self::pair_key(a, b))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Per-channel bounded-queue caps and timeouts (spec §4.8, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "default_ingestor_cap")]
    pub ingestor_to_feature_cap: usize,
    #[serde(default = "default_feature_cap")]
    pub feature_to_hmm_cap: usize,
    #[serde(default = "default_hmm_cap")]
    pub hmm_to_evaluator_cap: usize,
    #[serde(default = "default_evaluator_cap")]
    pub evaluator_to_decision_cap: usize,
    #[serde(default = "default_decision_cap")]
    pub decision_to_sizer_cap: usize,
    #[serde(default = "default_sizer_cap")]
    pub sizer_to_dispatcher_cap: usize,
    #[serde(default = "default_sink_queue_cap")]
    pub sink_queue_cap: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ingestor_to_feature_cap: default_ingestor_cap(),
            feature_to_hmm_cap: default_feature_cap(),
            hmm_to_evaluator_cap: default_hmm_cap(),
            evaluator_to_decision_cap: default_evaluator_cap(),
            decision_to_sizer_cap: default_decision_cap(),
            sizer_to_dispatcher_cap: default_sizer_cap(),
            sink_queue_cap: default_sink_queue_cap(),
            connect_timeout_secs: default_connect_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

// --- Default value functions ---

fn default_priority() -> u8 {
    0
}
fn default_k() -> usize {
    6
}
fn default_window_t() -> usize {
    1000
}
fn default_update_every_s() -> u64 {
    500
}
fn default_forgetting_gamma() -> f64 {
    0.99
}
fn default_nu_min() -> f64 {
    2.5
}
fn default_nu_max() -> f64 {
    30.0
}
fn default_alpha() -> f64 {
    0.05
}
fn default_beta() -> f64 {
    0.20
}
fn default_cost_bps() -> f64 {
    5.0
}
fn default_kelly_multiplier() -> f64 {
    0.2
}
fn default_position_cap() -> f64 {
    0.08
}
fn default_horizon_ticks() -> u64 {
    200
}
fn default_ingestor_cap() -> usize {
    512
}
fn default_feature_cap() -> usize {
    256
}
fn default_hmm_cap() -> usize {
    256
}
fn default_evaluator_cap() -> usize {
    256
}
fn default_decision_cap() -> usize {
    64
}
fn default_sizer_cap() -> usize {
    128
}
fn default_sink_queue_cap() -> usize {
    10_000
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

/// Expand a leading `~` to the user's home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// Unlike a weakly-typed config layer, a missing or invalid config file
    /// is always fatal here (spec §7: "Configuration... Fatal at startup").
    pub fn load(path: &str) -> Result<Config, QuantisError> {
        let expanded = shellexpand(path);
        let path = Path::new(&expanded);
        let content = std::fs::read_to_string(path).map_err(|e| {
            QuantisError::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Type-check and range-check the configuration (the `validate` CLI
    /// subcommand and every `run`/`reload_config` call this).
    pub fn validate(&self) -> Result<(), QuantisError> {
        if self.instruments.is_empty() {
            return Err(QuantisError::Config(
                "instruments list must not be empty".into(),
            ));
        }
        if self.venues.is_empty() {
            return Err(QuantisError::Config("venues list must not be empty".into()));
        }
        if self.hmm.k < 2 {
            return Err(QuantisError::Config("hmm.k must be >= 2".into()));
        }
        if self.hmm.nu_min >= self.hmm.nu_max {
            return Err(QuantisError::Config(
                "hmm.nu_min must be < hmm.nu_max".into(),
            ));
        }
        if self.hmm.nu_min < 2.0 {
            return Err(QuantisError::Config(
                "hmm.nu_min must be >= 2.0 for finite variance".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.decision.alpha) || !(0.0..1.0).contains(&self.decision.beta)
        {
            return Err(QuantisError::Config(
                "decision.alpha and decision.beta must be in (0, 1)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.decision.forgetting_gamma) {
            return Err(QuantisError::Config(
                "decision.forgetting_gamma must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.decision.kelly_multiplier)
            || self.decision.kelly_multiplier <= 0.0
        {
            return Err(QuantisError::Config(
                "decision.kelly_multiplier must be in (0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.decision.position_cap) || self.decision.position_cap <= 0.0
        {
            return Err(QuantisError::Config(
                "decision.position_cap must be in (0, 1]".into(),
            ));
        }
        for w in self.entanglement_matrix.weights.values() {
            if !(-1.0..=1.0).contains(w) {
                return Err(QuantisError::Config(
                    "entanglement_matrix weights must be in [-1, 1]".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config {
            instruments: vec![Instrument::from("BTC-USDT")],
            venues: vec![VenueConfig {
                name: "binance".into(),
                endpoint: "wss://stream.binance.com/ws".into(),
                priority: 0,
            }],
            hmm: HmmConfig::default(),
            decision: DecisionConfig::default(),
            entanglement_matrix: EntanglementConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn rejects_empty_instruments() {
        let mut c = minimal_config();
        c.instruments.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_bad_nu_range() {
        let mut c = minimal_config();
        c.hmm.nu_min = 10.0;
        c.hmm.nu_max = 5.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_unknown_fields_on_parse() {
        let toml_str = r#"
            instruments = ["BTC-USDT"]
            venues = [{ name = "binance", endpoint = "wss://x" }]
            bogus_top_level_field = 1
        "#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn entanglement_weight_is_symmetric_and_zero_on_diagonal() {
        let a = Instrument::from("BTC-USDT");
        let b = Instrument::from("ETH-USDT");
        let mut weights = HashMap::new();
        weights.insert(EntanglementConfig::pair_key(&a, &b), 0.3);
        let e = EntanglementConfig { weights };
        assert_eq!(e.weight(&a, &b), 0.3);
        assert_eq!(e.weight(&b, &a), 0.3);
        assert_eq!(e.weight(&a, &a), 0.0);
    }
}
