//! Orchestrator (C8): wires the per-instrument pipeline — ingestion,
//! features, HMM, hypothesis evaluation, decision, sizing, and dispatch —
//! and owns its lifecycle. Grounded on the teacher's `Gateway::run`/
//! `shutdown` shape: spawn one task per stage, forward between them over
//! bounded channels, and abort everything on shutdown (spec §5).

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use quantis_core::config::Config;
use quantis_core::{Instrument, QuantisError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::decision::DecisionEngine;
use crate::dispatch::{Dispatcher, Sink};
use crate::features::FeatureBuilder;
use crate::hmm::{HmmEngine, RegimePosterior};
use crate::hypothesis::{EntangledInput, HypothesisEvaluator};
use crate::sizing::PositionSizer;
use crate::tick::{GapEvent, Ingestor, ShutdownHandle, ShutdownSignal, Tick, VenueFeed};

/// Process-wide cross-instrument posterior registry (spec §4.4): each
/// instrument publishes its latest filtered posterior and realized return
/// here so others can read it for entanglement, without taking a lock on
/// the owning instrument's hot path.
#[derive(Default)]
pub struct PosteriorRegistry {
    entries: parking_lot::RwLock<HashMap<Instrument, Arc<ArcSwap<(RegimePosterior, f64)>>>>,
}

impl PosteriorRegistry {
    pub fn publish(&self, instrument: &Instrument, posterior: RegimePosterior, realized_return: f64) {
        let mut entries = self.entries.write();
        let slot = entries
            .entry(instrument.clone())
            .or_insert_with(|| Arc::new(ArcSwap::from_pointee((RegimePosterior::uniform(1), 0.0))));
        slot.store(Arc::new((posterior, realized_return)));
    }

    pub fn snapshot_others(&self, exclude: &Instrument) -> Vec<(Instrument, RegimePosterior, f64)> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(i, _)| *i != exclude)
            .map(|(i, slot)| {
                let guard = slot.load();
                (i.clone(), guard.0.clone(), guard.1)
            })
            .collect()
    }
}

/// Health snapshot for one instrument's pipeline (exposed for the CLI / an
/// eventual status endpoint). Spec §7: every quarantined instrument must be
/// reported with the reason and the recovery condition.
pub struct InstrumentHealth {
    pub instrument: Instrument,
    pub quarantined: bool,
    pub unstable: bool,
    pub quarantine_reason: Option<String>,
    pub quarantined_since: Option<chrono::DateTime<chrono::Utc>>,
    pub recovery_condition: Option<&'static str>,
}

/// Static recovery-condition text surfaced alongside a quarantine reason
/// (spec §7's "health() with the reason and the recovery condition").
const QUARANTINE_RECOVERY_CONDITION: &str =
    "clears automatically on the next successful HMM parameter update";

struct InstrumentPipeline {
    handles: Vec<JoinHandle<()>>,
    shutdown: ShutdownHandle,
    hmm: Arc<tokio::sync::Mutex<HmmEngine>>,
}

/// Owns every instrument's pipeline and the shared entanglement registry.
pub struct Orchestrator {
    config: Arc<ArcSwap<Config>>,
    registry: Arc<PosteriorRegistry>,
    dispatcher: Arc<Dispatcher>,
    checkpoints: Arc<CheckpointStore>,
    pipelines: HashMap<Instrument, InstrumentPipeline>,
}

impl Orchestrator {
    pub fn new(config: Config, sinks: Vec<Arc<dyn Sink>>, checkpoint_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            registry: Arc::new(PosteriorRegistry::default()),
            dispatcher: Arc::new(Dispatcher::new(sinks)),
            checkpoints: Arc::new(CheckpointStore::new(checkpoint_dir)),
            pipelines: HashMap::new(),
        }
    }

    /// Start every configured instrument's pipeline, wiring the given venue
    /// feeds (one `VenueFeed` per instrument per venue).
    pub fn start(&mut self, feeds_by_instrument: HashMap<Instrument, Vec<Arc<dyn VenueFeed>>>) -> Result<(), QuantisError> {
        let config = self.config.load();
        for instrument in &config.instruments {
            let feeds = feeds_by_instrument.get(instrument).cloned().unwrap_or_default();
            let pipeline = self.spawn_pipeline(instrument.clone(), feeds, &config)?;
            self.pipelines.insert(instrument.clone(), pipeline);
        }
        Ok(())
    }

    fn spawn_pipeline(
        &self,
        instrument: Instrument,
        feeds: Vec<Arc<dyn VenueFeed>>,
        config: &Config,
    ) -> Result<InstrumentPipeline, QuantisError> {
        let limits = &config.limits;
        let (shutdown_handle, shutdown_signal) = ShutdownSignal::new();

        let engine = match self.checkpoints.load(&instrument)? {
            Some(theta) => HmmEngine::restore(
                theta,
                config.hmm.nu_min,
                config.hmm.nu_max,
                config.hmm.update_every_s,
                config.hmm.window_t,
            ),
            None => HmmEngine::new(
                config.hmm.k,
                config.hmm.nu_min,
                config.hmm.nu_max,
                config.hmm.update_every_s,
                config.hmm.window_t,
            )?,
        };
        let hmm = Arc::new(tokio::sync::Mutex::new(engine));

        let venue_priority: Vec<(String, u8)> = config
            .venues
            .iter()
            .map(|v| (v.name.clone(), v.priority))
            .collect();

        let (raw_tx, raw_rx) = mpsc::channel::<Tick>(limits.ingestor_to_feature_cap);
        let (validated_tx, mut validated_rx) = mpsc::channel::<Tick>(limits.ingestor_to_feature_cap);
        let (gap_tx, mut gap_rx) = mpsc::channel::<GapEvent>(8);

        let mut handles = Vec::new();

        for feed in feeds {
            let tx = raw_tx.clone();
            let sig = shutdown_signal.clone();
            let inst = instrument.clone();
            handles.push(tokio::spawn(async move {
                feed.run(inst, tx, sig).await;
            }));
        }
        drop(raw_tx);

        let ingestor = Ingestor::new(instrument.clone(), venue_priority, limits.feature_to_hmm_cap);
        let ingestor_shutdown = shutdown_signal.clone();
        handles.push(tokio::spawn(async move {
            ingestor.run(raw_rx, validated_tx, gap_tx, ingestor_shutdown).await;
        }));

        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let checkpoints = self.checkpoints.clone();
        let decision_config = config.decision.clone();
        let entanglement = config.entanglement_matrix.clone();
        let pipeline_hmm = hmm.clone();
        let pipeline_instrument = instrument.clone();
        let mut pipeline_shutdown = shutdown_signal.clone();

        handles.push(tokio::spawn(async move {
            let mut features = FeatureBuilder::new();
            let mut hypotheses = HypothesisEvaluator::new(pipeline_instrument.clone(), 256);
            let mut decision = DecisionEngine::new(&decision_config);
            let sizer = PositionSizer::new(&decision_config);

            loop {
                tokio::select! {
                    _ = pipeline_shutdown.cancelled() => {
                        info!("quantis: pipeline for {} shutting down", pipeline_instrument);
                        break;
                    }
                    Some(_) = gap_rx.recv() => {
                        features.on_gap_event();
                        warn!("quantis: gap event for {}, feature state reset", pipeline_instrument);
                    }
                    maybe_tick = validated_rx.recv() => {
                        let Some(tick) = maybe_tick else { break };
                        let Some(obs) = features.on_tick(&tick) else { continue };

                        let mut engine = pipeline_hmm.lock().await;
                        let posterior = engine.filter_step(obs.x, obs.z);
                        engine.maybe_update();
                        if engine.is_quarantined() {
                            continue;
                        }
                        let unstable = engine.is_unstable();
                        drop(engine);

                        registry.publish(&pipeline_instrument, posterior.clone(), obs.x[0]);
                        let others = registry.snapshot_others(&pipeline_instrument);
                        let entangled: Vec<EntangledInput> = others
                            .iter()
                            .map(|(other, other_posterior, other_return)| EntangledInput {
                                other,
                                weight: entanglement.weight(&pipeline_instrument, other),
                                other_posterior,
                                other_realized_return: *other_return,
                            })
                            .collect();

                        hypotheses.on_tick(&posterior, obs.x[0]);
                        let (lls, ll_null) = hypotheses.log_likelihoods(&posterior, obs.x[0], &entangled);
                        let decisions = decision.on_tick(&lls, ll_null, unstable || obs.suspect);

                        for d in &decisions {
                            if d.state == crate::decision::DecisionState::Abandon {
                                hypotheses.mark_abandoned(d.hypothesis_id);
                            }
                        }

                        if let Some(winner) = DecisionEngine::winning_execution(&decisions) {
                            if let Some(h) = hypotheses
                                .active_hypotheses()
                                .iter()
                                .find(|h| h.id == winner.hypothesis_id)
                            {
                                let sizing = sizer.calculate(h, &posterior);
                                if sizing.should_trade {
                                    dispatcher
                                        .dispatch(
                                            &pipeline_instrument,
                                            h.id,
                                            h.direction,
                                            sizing.kelly_fraction,
                                            sizing.confidence,
                                            sizing.expected_return,
                                            sizing.variance,
                                            posterior.alpha.clone(),
                                            winner.state,
                                            obs.suspect,
                                        )
                                        .await;
                                    hypotheses.mark_executed(h.id);
                                } else {
                                    // ER <= 0 net of cost: spec §4.6 treats this as ABANDONED.
                                    hypotheses.mark_abandoned(h.id);
                                }
                            }
                        }
                    }
                }
            }

            let engine = pipeline_hmm.lock().await;
            if let Err(e) = checkpoints.save(&pipeline_instrument, &engine.theta()) {
                warn!("quantis: failed to checkpoint {}: {e}", pipeline_instrument);
            }
        }));

        Ok(InstrumentPipeline {
            handles,
            shutdown: shutdown_handle,
            hmm,
        })
    }

    /// Cooperative shutdown: signal every pipeline, wait up to
    /// `shutdown_grace_secs` before aborting stragglers, then flush the
    /// Dispatcher's queue before returning (spec §4.8, §5).
    pub async fn stop(&mut self, grace: std::time::Duration) {
        for pipeline in self.pipelines.values() {
            pipeline.shutdown.shutdown();
        }
        for (instrument, pipeline) in self.pipelines.drain() {
            for handle in pipeline.handles {
                if tokio::time::timeout(grace, handle).await.is_err() {
                    warn!("quantis: pipeline for {instrument} did not shut down within grace period, aborting");
                }
            }
        }
        self.dispatcher.drain().await;
    }

    /// Wait for every pipeline to finish on its own, without signaling
    /// shutdown. Used by the `replay` CLI path: replay feeds are finite, so
    /// each pipeline's tasks exit naturally once their feed drains (spec §6
    /// `replay` subcommand), rather than via an explicit shutdown token.
    pub async fn join_all(&mut self) {
        for (_, pipeline) in self.pipelines.drain() {
            for handle in pipeline.handles {
                let _ = handle.await;
            }
        }
        self.dispatcher.drain().await;
    }

    pub fn reload_config(&self, config: Config) -> Result<(), QuantisError> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    pub async fn health(&self) -> Vec<InstrumentHealth> {
        let mut out = Vec::with_capacity(self.pipelines.len());
        for (instrument, pipeline) in &self.pipelines {
            let engine = pipeline.hmm.lock().await;
            let quarantined = engine.is_quarantined();
            out.push(InstrumentHealth {
                instrument: instrument.clone(),
                quarantined,
                unstable: engine.is_unstable(),
                quarantine_reason: engine.quarantine_reason().map(str::to_string),
                quarantined_since: engine.quarantined_since(),
                recovery_condition: quarantined.then_some(QUARANTINE_RECOVERY_CONDITION),
            });
        }
        out
    }
}
