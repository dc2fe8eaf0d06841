//! Comparison stage.
//!
//! One item compares one ordered list of stored objects with every registered
//! compare plugin. Each plugin is gated against the whole list; a plugin
//! whose prerequisites are missing on any member gets the standard skipped
//! shape instead of running. A stored comparison for the same set of uids is
//! reused unless the request asks for a redo.
//!
//! A comparison is tracked in [`GatedComparisons`] while it runs and, once
//! stored, for as long as a plugin in it is gated out. The `analyzed` hand-off turns each object that
//! finishes analysis into redo requests for the comparisons covering it.

use super::outcome::Outcome;
use super::pool::{Intake, StageWorker, WorkerPool};
use super::work::{panic_message, Stage, StageStats, WorkState};
use super::StageContext;
use crate::config::PipelineConfig;
use crate::core::comparison::compare_failed;
use crate::core::{AnalysisStatus, ComparisonId, ComparisonResult, FileObject, Uid};
use crate::error::Result;
use crate::plugins::gate::{run_compare, CompareRun};
use crate::plugins::PluginRegistry;
use crate::storage::StorageResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareRequest {
    /// Objects in the order the plugins receive them.
    pub uids: Vec<Uid>,
    #[serde(default)]
    pub redo: bool,
    #[serde(default)]
    pub priority: i32,
}

impl CompareRequest {
    pub fn new(uids: Vec<Uid>) -> Self {
        Self {
            uids,
            redo: false,
            priority: 0,
        }
    }

    pub fn compare_id(&self) -> ComparisonId {
        ComparisonId::from_uids(&self.uids)
    }
}

#[derive(Debug, Default)]
struct GatedIndex {
    uids: HashMap<ComparisonId, Vec<Uid>>,
    by_object: HashMap<Uid, BTreeSet<ComparisonId>>,
}

/// Running comparisons and stored ones with at least one plugin gated out,
/// indexed by the objects they cover.
#[derive(Debug, Default)]
pub struct GatedComparisons {
    index: Mutex<GatedIndex>,
}

impl GatedComparisons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.lock().uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn forget(&self, id: &ComparisonId) {
        self.update(id, &[], false);
    }

    /// Record the latest state of `id`. Only a running or gated comparison
    /// stays indexed.
    pub fn update(&self, id: &ComparisonId, uids: &[Uid], gated: bool) {
        let mut index = self.index.lock();
        if let Some(previous) = index.uids.remove(id) {
            for uid in previous {
                if let Some(ids) = index.by_object.get_mut(&uid) {
                    ids.remove(id);
                    if ids.is_empty() {
                        index.by_object.remove(&uid);
                    }
                }
            }
        }
        if gated {
            for uid in uids {
                index
                    .by_object
                    .entry(uid.clone())
                    .or_default()
                    .insert(id.clone());
            }
            index.uids.insert(id.clone(), uids.to_vec());
        }
    }

    /// Redo requests for every gated comparison covering `uid`.
    pub fn refresh(&self, uid: &Uid) -> Vec<CompareRequest> {
        let index = self.index.lock();
        index
            .by_object
            .get(uid)
            .into_iter()
            .flatten()
            .filter_map(|id| index.uids.get(id))
            .map(|uids| CompareRequest {
                uids: uids.clone(),
                redo: true,
                priority: 0,
            })
            .collect()
    }
}

pub struct ComparisonWorker {
    ctx: StageContext,
    registry: Arc<PluginRegistry>,
    gated: Arc<GatedComparisons>,
}

impl ComparisonWorker {
    pub fn new(
        ctx: StageContext,
        registry: Arc<PluginRegistry>,
        gated: Arc<GatedComparisons>,
    ) -> Self {
        Self {
            ctx,
            registry,
            gated,
        }
    }

    fn store<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        self.ctx.storage(Stage::Comparison, result)
    }

    fn load_objects(&self, uids: &[Uid]) -> StorageResult<Vec<Arc<FileObject>>> {
        uids.iter()
            .map(|uid| self.store(self.ctx.objects.get_object(uid)).map(Arc::new))
            .collect()
    }

    fn compare(&self, uids: Vec<Uid>) -> StorageResult<(ComparisonResult, WorkState)> {
        let compare_id = ComparisonId::from_uids(&uids);
        // tracked before the objects are read: an object that finishes
        // analysis mid-run still queues a redo
        self.gated.update(&compare_id, &uids, true);
        let compared = self.run_plugins(uids);
        if compared.is_err() {
            self.gated.forget(&compare_id);
        }
        compared
    }

    fn run_plugins(&self, uids: Vec<Uid>) -> StorageResult<(ComparisonResult, WorkState)> {
        let objects = self.load_objects(&uids)?;
        let mut result = ComparisonResult::new(uids);
        let mut ran = 0usize;
        let mut skipped = 0usize;
        for plugin in self.registry.compare_plugins() {
            let name = plugin.name().to_string();
            let run = panic::catch_unwind(AssertUnwindSafe(|| run_compare(plugin.as_ref(), &objects)))
                .unwrap_or_else(|payload| CompareRun {
                    status: AnalysisStatus::Failed,
                    result: compare_failed(panic_message(payload.as_ref())),
                });
            match run.status {
                AnalysisStatus::Completed => ran += 1,
                AnalysisStatus::Failed => {
                    ran += 1;
                    warn!(compare_id = %result.compare_id, plugin = %name, "compare plugin failed");
                }
                AnalysisStatus::Skipped => {
                    skipped += 1;
                    debug!(compare_id = %result.compare_id, plugin = %name, "compare plugin skipped")
                }
            }
            result.plugins.insert(name, run.result);
        }
        self.store(self.ctx.objects.put_comparison(&result))?;
        self.gated
            .update(&result.compare_id, &result.uids, skipped > 0);
        // every plugin gated out: nothing was compared
        let state = if ran == 0 && !result.plugins.is_empty() {
            WorkState::Skipped
        } else {
            WorkState::Completed
        };
        Ok((result, state))
    }
}

impl StageWorker for ComparisonWorker {
    type Job = CompareRequest;

    fn stage(&self) -> Stage {
        Stage::Comparison
    }

    fn subject(&self, job: &CompareRequest) -> String {
        job.compare_id().to_string()
    }

    fn process(&self, job: CompareRequest, _intake: &Intake<CompareRequest>) -> WorkState {
        let compare_id = job.compare_id();
        if !job.redo {
            match self.store(self.ctx.objects.get_comparison(&compare_id)) {
                Ok(Some(result)) => {
                    debug!(compare_id = %compare_id, "reusing stored comparison");
                    self.ctx.emit(Outcome::Compared {
                        result,
                        reused: true,
                    });
                    return WorkState::Completed;
                }
                Ok(None) => {}
                Err(e) => {
                    self.ctx.emit(Outcome::CompareFailed {
                        compare_id,
                        error: e.to_string(),
                    });
                    return WorkState::Failed;
                }
            }
        }
        match self.compare(job.uids) {
            Ok((result, state)) => {
                self.ctx.emit(Outcome::Compared {
                    result,
                    reused: false,
                });
                state
            }
            Err(e) => {
                warn!(compare_id = %compare_id, error = %e, "comparison failed");
                self.ctx.emit(Outcome::CompareFailed {
                    compare_id,
                    error: e.to_string(),
                });
                WorkState::Failed
            }
        }
    }
}

/// The comparison stage: a worker pool around [`ComparisonWorker`].
pub struct ComparisonScheduler {
    pool: WorkerPool<ComparisonWorker>,
    gated: Arc<GatedComparisons>,
}

impl ComparisonScheduler {
    pub fn start(
        config: &PipelineConfig,
        ctx: StageContext,
        registry: Arc<PluginRegistry>,
    ) -> Result<Self> {
        info!(plugins = ?registry.compare_names(), "starting comparison stage");
        let gated = Arc::new(GatedComparisons::new());
        let worker = ComparisonWorker::new(ctx, registry, Arc::clone(&gated));
        Ok(Self {
            pool: WorkerPool::start(worker, config.comparison.workers)?,
            gated,
        })
    }

    pub fn intake(&self) -> Arc<Intake<CompareRequest>> {
        self.pool.intake()
    }

    pub fn submit(&self, request: CompareRequest) -> Result<u64> {
        let priority = request.priority;
        self.pool.intake().submit(request, priority)
    }

    /// Shared with the `analyzed` hand-off, which turns finished objects
    /// into redo requests.
    pub fn gated(&self) -> Arc<GatedComparisons> {
        Arc::clone(&self.gated)
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
