//! Analysis stage.
//!
//! A `Start` item expands an object's plugin selection and schedules one `Run`
//! item per plugin whose dependencies all have a recorded entry, whatever its
//! status. Each finished run re-evaluates the plugins still waiting on that
//! object. A waiting plugin with a dependency that is neither recorded,
//! waiting nor running is recorded Skipped without running. Plugins on one object otherwise run in any order and in parallel.
//!
//! A result is stored before it is recorded on the live object and before any
//! outcome is emitted, so dependents and downstream handlers always observe
//! it. A finished object is reported on the `analyzed` hand-off.

use super::handoff::Handoff;
use super::outcome::Outcome;
use super::pool::{Intake, StageWorker, WorkerPool};
use super::work::{panic_message, Stage, StageStats, WorkState};
use super::StageContext;
use crate::config::PipelineConfig;
use crate::core::{AnalysisEntry, AnalysisStatus, FileObject, Uid};
use crate::error::Result;
use crate::plugins::{DependencyGate, GateDecision, PluginRegistry};
use crate::storage::StorageResult;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Object an analysis request is about.
#[derive(Debug, Clone)]
pub enum AnalysisTarget {
    /// A live object handed over by unpacking.
    Object(Arc<FileObject>),
    /// An object loaded from storage, for re-analysis.
    Stored(Uid),
}

impl AnalysisTarget {
    pub fn uid(&self) -> &Uid {
        match self {
            AnalysisTarget::Object(object) => object.uid(),
            AnalysisTarget::Stored(uid) => uid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub target: AnalysisTarget,
    /// Explicit selection; falls back to the object's scheduled analysis,
    /// then to the configured default.
    pub plugins: Option<Vec<String>>,
    /// Discard existing entries of the selected plugins and run them again.
    pub force: bool,
    pub priority: i32,
}

impl AnalysisRequest {
    pub fn new(target: AnalysisTarget) -> Self {
        Self {
            target,
            plugins: None,
            force: false,
            priority: 0,
        }
    }
}

/// One plugin on one object.
#[derive(Debug, Clone)]
pub struct PluginRun {
    pub object: Arc<FileObject>,
    pub plugin: String,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub enum AnalysisJob {
    Start(AnalysisRequest),
    Run(PluginRun),
}

struct Progress {
    object: Arc<FileObject>,
    waiting: BTreeSet<String>,
    running: BTreeSet<String>,
    priority: i32,
}

/// Decisions taken under the tracker lock, applied after it is released.
struct Step {
    object: Arc<FileObject>,
    priority: i32,
    ready: Vec<String>,
    skipped: Vec<(String, BTreeSet<String>)>,
    finished: bool,
}

pub struct AnalysisWorker {
    ctx: StageContext,
    registry: Arc<PluginRegistry>,
    default_plugins: Option<Vec<String>>,
    tracker: Mutex<HashMap<Uid, Progress>>,
    to_comparison: Handoff<Uid>,
}

impl AnalysisWorker {
    pub fn new(
        config: &PipelineConfig,
        ctx: StageContext,
        registry: Arc<PluginRegistry>,
        to_comparison: Handoff<Uid>,
    ) -> Self {
        Self {
            ctx,
            registry,
            default_plugins: config.analysis.default_plugins.clone(),
            tracker: Mutex::new(HashMap::new()),
            to_comparison,
        }
    }

    /// Objects with plugins still waiting or running.
    pub fn in_progress(&self) -> usize {
        self.tracker.lock().len()
    }

    fn store<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        self.ctx.storage(Stage::Analysis, result)
    }

    fn load(&self, target: AnalysisTarget) -> StorageResult<Arc<FileObject>> {
        match target {
            AnalysisTarget::Object(object) => Ok(object),
            AnalysisTarget::Stored(uid) => {
                let object = self.store(self.ctx.objects.get_object(&uid))?;
                match self.store(self.ctx.contents.get_content(&uid)) {
                    Ok(content) => Ok(Arc::new(object.with_content(content))),
                    Err(e) if e.is_not_found() => Ok(Arc::new(object)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn plugin_version(&self, name: &str) -> String {
        self.registry
            .analysis(name)
            .map(|p| p.version().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn start(&self, request: AnalysisRequest, intake: &Intake<AnalysisJob>) -> WorkState {
        let uid = request.target.uid().clone();
        let object = match self.load(request.target) {
            Ok(object) => object,
            Err(e) => {
                warn!(uid = %uid, error = %e, "cannot load object for analysis");
                self.ctx.emit(Outcome::AnalysisFailed {
                    uid,
                    error: e.to_string(),
                });
                return WorkState::Failed;
            }
        };
        let requested = request
            .plugins
            .or_else(|| object.scheduled_analysis().map(<[String]>::to_vec))
            .or_else(|| self.default_plugins.clone());
        let selection = match self.registry.resolve(requested.as_deref()) {
            Ok(selection) => selection,
            Err(e) => {
                warn!(uid = %uid, error = %e, "invalid plugin selection");
                self.ctx.emit(Outcome::AnalysisFailed {
                    uid,
                    error: e.to_string(),
                });
                return WorkState::Failed;
            }
        };

        let step = {
            let mut tracker = self.tracker.lock();
            let progress = tracker.entry(uid.clone()).or_insert_with(|| Progress {
                object: Arc::clone(&object),
                waiting: BTreeSet::new(),
                running: BTreeSet::new(),
                priority: request.priority,
            });
            if request.force {
                let clearable: Vec<String> = selection
                    .iter()
                    .filter(|name| !progress.running.contains(*name) && !progress.waiting.contains(*name))
                    .cloned()
                    .collect();
                progress.object.clear_analyses(&clearable);
            }
            for name in selection {
                if !progress.running.contains(&name) && !progress.object.has_analysis(&name) {
                    progress.waiting.insert(name);
                }
            }
            debug!(uid = %uid, waiting = ?progress.waiting, force = request.force, "analysis scheduled");
            self.advance(&mut tracker, &uid)
        };
        if let Some(step) = step {
            self.apply(step, intake);
        }
        WorkState::Completed
    }

    /// Move ready plugins to running and settle plugins that can never run.
    fn advance(&self, tracker: &mut HashMap<Uid, Progress>, uid: &Uid) -> Option<Step> {
        let progress = tracker.get_mut(uid)?;
        let mut step = Step {
            object: Arc::clone(&progress.object),
            priority: progress.priority,
            ready: Vec::new(),
            skipped: Vec::new(),
            finished: false,
        };
        loop {
            let mut settled = false;
            for name in progress.waiting.clone() {
                let dependencies = self
                    .registry
                    .analysis(&name)
                    .map(|p| p.dependencies().to_vec())
                    .unwrap_or_default();
                match DependencyGate::evaluate_one(&progress.object, &dependencies) {
                    GateDecision::Ready => {
                        progress.waiting.remove(&name);
                        progress.running.insert(name.clone());
                        step.ready.push(name);
                    }
                    GateDecision::Missing(missing) => {
                        let unreachable = missing
                            .iter()
                            .all(|dep| !progress.waiting.contains(dep) && !progress.running.contains(dep));
                        if unreachable {
                            progress.waiting.remove(&name);
                            step.skipped.push((name, missing));
                            settled = true;
                        }
                    }
                }
            }
            if !settled {
                break;
            }
        }
        // dependency cycle among the remaining plugins
        if progress.running.is_empty() && step.ready.is_empty() && !progress.waiting.is_empty() {
            for name in std::mem::take(&mut progress.waiting) {
                let dependencies = self
                    .registry
                    .analysis(&name)
                    .map(|p| p.dependencies().to_vec())
                    .unwrap_or_default();
                if let GateDecision::Missing(missing) =
                    DependencyGate::evaluate_one(&progress.object, &dependencies)
                {
                    step.skipped.push((name, missing));
                }
            }
        }
        if progress.waiting.is_empty() && progress.running.is_empty() {
            tracker.remove(uid);
            step.finished = true;
        }
        Some(step)
    }

    fn apply(&self, step: Step, intake: &Intake<AnalysisJob>) {
        let uid = step.object.uid().clone();
        for (name, missing) in step.skipped {
            let entry = AnalysisEntry::skipped(&name, &self.plugin_version(&name), &missing);
            let entry = self.record(&step.object, entry);
            self.report(&uid, entry, &missing);
        }
        for name in step.ready {
            let run = PluginRun {
                object: Arc::clone(&step.object),
                plugin: name,
                priority: step.priority,
            };
            if let Err(e) = intake.submit_internal(AnalysisJob::Run(run), step.priority) {
                warn!(uid = %uid, error = %e, "plugin run not queued");
            }
        }
        if step.finished {
            let analyses: Vec<String> = step.object.analysis_names().into_iter().collect();
            debug!(uid = %uid, ?analyses, "analysis finished");
            self.ctx.emit(Outcome::Analyzed {
                uid: uid.clone(),
                analyses,
            });
            self.to_comparison.send(uid);
        }
    }

    /// Store first, then record on the live object. A storage failure turns
    /// the entry into a Failed one.
    fn record(&self, object: &FileObject, entry: AnalysisEntry) -> AnalysisEntry {
        let stored = self.store(
            self.ctx
                .objects
                .record_result(object.uid(), &entry.plugin, &entry),
        );
        let entry = match stored {
            Ok(()) => entry,
            Err(e) => AnalysisEntry::failed(&entry.plugin, &entry.plugin_version, format!("storage: {e}")),
        };
        if let Err(e) = object.record_analysis(entry.clone()) {
            warn!(uid = %object.uid(), error = %e, "result slot already written");
        }
        entry
    }

    fn report(&self, uid: &Uid, entry: AnalysisEntry, missing: &BTreeSet<String>) -> WorkState {
        let detail = entry.detail().unwrap_or_default().to_string();
        let (outcome, state) = match entry.status {
            AnalysisStatus::Completed => (
                Outcome::PluginCompleted {
                    uid: uid.clone(),
                    plugin: entry.plugin,
                },
                WorkState::Completed,
            ),
            AnalysisStatus::Failed => {
                warn!(uid = %uid, plugin = %entry.plugin, error = %detail, "plugin failed");
                (
                    Outcome::PluginFailed {
                        uid: uid.clone(),
                        plugin: entry.plugin,
                        error: detail,
                    },
                    WorkState::Failed,
                )
            }
            AnalysisStatus::Skipped => {
                debug!(uid = %uid, plugin = %entry.plugin, ?missing, "plugin skipped");
                (
                    Outcome::PluginSkipped {
                        uid: uid.clone(),
                        plugin: entry.plugin,
                        missing: missing.iter().cloned().collect(),
                    },
                    WorkState::Skipped,
                )
            }
        };
        self.ctx.emit(outcome);
        state
    }

    fn run(&self, run: PluginRun, intake: &Intake<AnalysisJob>) -> WorkState {
        let PluginRun {
            object,
            plugin: name,
            ..
        } = run;
        let uid = object.uid().clone();
        let mut missing = BTreeSet::new();
        let entry = match self.registry.analysis(&name) {
            None => AnalysisEntry::failed(&name, "unknown", "plugin not registered"),
            Some(plugin) => match DependencyGate::evaluate_one(&object, plugin.dependencies()) {
                GateDecision::Missing(unmet) => {
                    let entry = AnalysisEntry::skipped(&name, plugin.version(), &unmet);
                    missing = unmet;
                    entry
                }
                GateDecision::Ready => {
                    let analyzed = panic::catch_unwind(AssertUnwindSafe(|| plugin.analyze(&object)))
                        .unwrap_or_else(|payload| {
                            Err(anyhow::anyhow!(panic_message(payload.as_ref())))
                        });
                    match analyzed {
                        Ok(result) => AnalysisEntry::completed(&name, plugin.version(), result),
                        Err(e) => AnalysisEntry::failed(&name, plugin.version(), format!("{:#}", e)),
                    }
                }
            },
        };
        let entry = self.record(&object, entry);
        let state = self.report(&uid, entry, &missing);

        let step = {
            let mut tracker = self.tracker.lock();
            if let Some(progress) = tracker.get_mut(&uid) {
                progress.running.remove(&name);
            }
            self.advance(&mut tracker, &uid)
        };
        if let Some(step) = step {
            self.apply(step, intake);
        }
        state
    }
}

impl StageWorker for AnalysisWorker {
    type Job = AnalysisJob;

    fn stage(&self) -> Stage {
        Stage::Analysis
    }

    fn subject(&self, job: &AnalysisJob) -> String {
        match job {
            AnalysisJob::Start(request) => request.target.uid().to_string(),
            AnalysisJob::Run(run) => format!("{}:{}", run.object.uid(), run.plugin),
        }
    }

    fn process(&self, job: AnalysisJob, intake: &Intake<AnalysisJob>) -> WorkState {
        match job {
            AnalysisJob::Start(request) => self.start(request, intake),
            AnalysisJob::Run(run) => self.run(run, intake),
        }
    }
}

/// The analysis stage: a worker pool around [`AnalysisWorker`].
pub struct AnalysisScheduler {
    pool: WorkerPool<AnalysisWorker>,
}

impl AnalysisScheduler {
    pub fn start(
        config: &PipelineConfig,
        ctx: StageContext,
        registry: Arc<PluginRegistry>,
        to_comparison: Handoff<Uid>,
    ) -> Result<Self> {
        info!(plugins = ?registry.analysis_names(), "starting analysis stage");
        let worker = AnalysisWorker::new(config, ctx, registry, to_comparison);
        Ok(Self {
            pool: WorkerPool::start(worker, config.analysis.workers)?,
        })
    }

    pub fn intake(&self) -> Arc<Intake<AnalysisJob>> {
        self.pool.intake()
    }

    pub fn submit(&self, request: AnalysisRequest) -> Result<u64> {
        let priority = request.priority;
        self.pool
            .intake()
            .submit(AnalysisJob::Start(request), priority)
    }

    pub fn in_progress(&self) -> usize {
        self.pool.worker().in_progress()
    }

    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    pub fn stats(&self) -> StageStats {
        self.pool.stats()
    }

    pub fn shutdown(self) -> StageStats {
        self.pool.shutdown()
    }

    pub fn cancel(self) -> StageStats {
        self.pool.cancel()
    }
}
