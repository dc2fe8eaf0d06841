//! Pipeline assembly.
//!
//! [`Pipeline::start`] wires the three stages together with explicit
//! channels: the binding feeds each stage intake, unpacking feeds itself
//! (extracted files) and analysis (through the `unpacked` hand-off), analysis
//! feeds comparison (through the `analyzed` hand-off, which re-runs gated
//! comparisons), and every stage reports to one outcome channel drained by
//! the binding. The wiring is exposed by [`Pipeline::topology`].

use crate::binding::BackendBinding;
use crate::config::PipelineConfig;
use crate::core::Uid;
use crate::error::{PipelineError, Result};
use crate::locks::{LockManager, LockStats};
use crate::plugins::PluginRegistry;
use crate::scheduler::{
    handoff, AnalysisJob, AnalysisRequest, AnalysisScheduler, ComparisonScheduler, OutcomeSink,
    Stage, StageContext, StageStats, UnpackingScheduler,
};
use crate::storage::{ContentStore, HealthMonitor, ObjectStore};
use crate::unpack::UnpackerRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const UNPACKED_HANDOFF: &str = "unpacked";
const ANALYZED_HANDOFF: &str = "analyzed";

/// A node of the pipeline graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Binding,
    Stage(Stage),
    Outcomes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub from: Endpoint,
    pub to: Endpoint,
    pub channel: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageInfo {
    pub stage: Stage,
    pub workers: usize,
}

/// Static description of how the stages are wired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub stages: Vec<StageInfo>,
    pub links: Vec<Link>,
}

impl Topology {
    pub fn feeds(&self, from: Endpoint, to: Endpoint) -> bool {
        self.links.iter().any(|l| l.from == from && l.to == to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub unpacking: StageStats,
    pub analysis: StageStats,
    pub comparison: StageStats,
    pub locks: LockStats,
}

pub struct Pipeline {
    config: PipelineConfig,
    locks: Arc<LockManager>,
    unpacking: UnpackingScheduler,
    analysis: AnalysisScheduler,
    comparison: ComparisonScheduler,
    binding: Arc<BackendBinding>,
    unpacked_forwarder: JoinHandle<()>,
    analyzed_forwarder: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    unpacked_pending: Arc<AtomicUsize>,
    analyzed_pending: Arc<AtomicUsize>,
    outcomes_pending: Arc<AtomicUsize>,
}

impl Pipeline {
    /// Validate the configuration, start every stage, and wire them up.
    /// A stage that cannot start its workers aborts the whole start.
    pub fn start(
        config: PipelineConfig,
        registry: PluginRegistry,
        unpackers: UnpackerRegistry,
        objects: Arc<dyn ObjectStore>,
        contents: Arc<dyn ContentStore>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(registry);
        let locks = Arc::new(LockManager::new());
        let health = Arc::new(HealthMonitor::new(config.health.storage_failure_threshold));
        let (sink, outcomes) = OutcomeSink::channel();
        let outcomes_pending = outcomes.pending_counter();
        let ctx = StageContext::new(objects, contents, Arc::clone(&health), sink);

        let comparison = ComparisonScheduler::start(&config, ctx.clone(), Arc::clone(&registry))?;

        let (to_comparison, analyzed) = handoff::<Uid>(ANALYZED_HANDOFF);
        let analyzed_pending = analyzed.pending_counter();
        let gated = comparison.gated();
        let analyzed_forwarder = analyzed
            .forward_into(comparison.intake(), move |uid: Uid| {
                gated
                    .refresh(&uid)
                    .into_iter()
                    .map(|request| {
                        let priority = request.priority;
                        (request, priority)
                    })
                    .collect::<Vec<_>>()
            })
            .map_err(|source| PipelineError::WorkerSpawn {
                stage: ANALYZED_HANDOFF.to_string(),
                source,
            })?;

        let analysis = AnalysisScheduler::start(
            &config,
            ctx.clone(),
            Arc::clone(&registry),
            to_comparison,
        )?;

        let (to_analysis, unpacked) = handoff::<AnalysisRequest>(UNPACKED_HANDOFF);
        let unpacked_pending = unpacked.pending_counter();
        let unpacked_forwarder = unpacked
            .forward_into(analysis.intake(), |request: AnalysisRequest| {
                let priority = request.priority;
                Some((AnalysisJob::Start(request), priority))
            })
            .map_err(|source| PipelineError::WorkerSpawn {
                stage: UNPACKED_HANDOFF.to_string(),
                source,
            })?;

        let unpacking =
            UnpackingScheduler::start(&config, ctx, Arc::clone(&locks), unpackers, to_analysis)?;

        let binding = Arc::new(BackendBinding::new(
            Arc::clone(&registry),
            unpacking.intake(),
            analysis.intake(),
            comparison.intake(),
            health,
        ));
        let dispatcher = binding
            .spawn_dispatcher(outcomes)
            .map_err(|source| PipelineError::WorkerSpawn {
                stage: "binding".to_string(),
                source,
            })?;

        info!(
            unpacking = unpacking.workers(),
            analysis = analysis.workers(),
            comparison = comparison.workers(),
            "pipeline started"
        );
        Ok(Self {
            config,
            locks,
            unpacking,
            analysis,
            comparison,
            binding,
            unpacked_forwarder,
            analyzed_forwarder,
            dispatcher,
            unpacked_pending,
            analyzed_pending,
            outcomes_pending,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn binding(&self) -> Arc<BackendBinding> {
        Arc::clone(&self.binding)
    }

    pub fn lock_manager(&self) -> Arc<LockManager> {
        Arc::clone(&self.locks)
    }

    pub fn topology(&self) -> Topology {
        let unpacking = Endpoint::Stage(Stage::Unpacking);
        let analysis = Endpoint::Stage(Stage::Analysis);
        let comparison = Endpoint::Stage(Stage::Comparison);
        let link = |from, to, channel| Link { from, to, channel };
        Topology {
            stages: vec![
                StageInfo {
                    stage: Stage::Unpacking,
                    workers: self.unpacking.workers(),
                },
                StageInfo {
                    stage: Stage::Analysis,
                    workers: self.analysis.workers(),
                },
                StageInfo {
                    stage: Stage::Comparison,
                    workers: self.comparison.workers(),
                },
            ],
            links: vec![
                link(Endpoint::Binding, unpacking, "intake"),
                link(Endpoint::Binding, analysis, "intake"),
                link(Endpoint::Binding, comparison, "intake"),
                link(unpacking, unpacking, "extracted"),
                link(unpacking, analysis, UNPACKED_HANDOFF),
                link(analysis, analysis, "plugin_runs"),
                link(analysis, comparison, ANALYZED_HANDOFF),
                link(unpacking, Endpoint::Outcomes, "outcomes"),
                link(analysis, Endpoint::Outcomes, "outcomes"),
                link(comparison, Endpoint::Outcomes, "outcomes"),
                link(Endpoint::Outcomes, Endpoint::Binding, "dispatch"),
            ],
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            unpacking: self.unpacking.stats(),
            analysis: self.analysis.stats(),
            comparison: self.comparison.stats(),
            locks: self.locks.stats(),
        }
    }

    /// Nothing queued, running, in transit between stages, or undelivered.
    pub fn is_idle(&self) -> bool {
        // upstream first: a stage can only gain work from the ones before it
        self.unpacking.intake().is_idle()
            && self.unpacked_pending.load(Ordering::SeqCst) == 0
            && self.analysis.intake().is_idle()
            && self.analyzed_pending.load(Ordering::SeqCst) == 0
            && self.comparison.intake().is_idle()
            && self.outcomes_pending.load(Ordering::SeqCst) == 0
    }

    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Ordered drain: close the binding, then drain each stage after the
    /// hand-off feeding it has emptied, then deliver the remaining outcomes.
    pub fn shutdown(self) -> PipelineStats {
        info!("pipeline shutting down");
        self.binding.close();
        let unpacking = self.unpacking.shutdown();
        if self.unpacked_forwarder.join().is_err() {
            warn!(handoff = UNPACKED_HANDOFF, "hand-off forwarder terminated abnormally");
        }
        let analysis = self.analysis.shutdown();
        if self.analyzed_forwarder.join().is_err() {
            warn!(handoff = ANALYZED_HANDOFF, "hand-off forwarder terminated abnormally");
        }
        let comparison = self.comparison.shutdown();
        self.locks.shutdown();
        if self.dispatcher.join().is_err() {
            warn!("outcome dispatcher terminated abnormally");
        }
        let stats = PipelineStats {
            unpacking,
            analysis,
            comparison,
            locks: self.locks.stats(),
        };
        info!(?stats, "pipeline stopped");
        stats
    }

    /// Abrupt stop: queued work is abandoned, lock waiters fail, running
    /// items finish on detached threads without rollback.
    pub fn cancel(self) -> PipelineStats {
        warn!("pipeline cancelled");
        self.binding.close();
        self.locks.shutdown();
        let stats = PipelineStats {
            unpacking: self.unpacking.cancel(),
            analysis: self.analysis.cancel(),
            comparison: self.comparison.cancel(),
            locks: self.locks.stats(),
        };
        drop(self.unpacked_forwarder);
        drop(self.analyzed_forwarder);
        drop(self.dispatcher);
        stats
    }
}
