//! Unpacking stage.
//!
//! Each item unpacks one object while holding that object's lock. The lock is
//! released only after the extracted children and the parent's `unpacker`
//! entry are stored, so a racing submission of the same content either waits
//! for the lock or finds the finished result. Extracted children go back onto
//! this stage's intake; the unpacked object is handed to analysis.

use super::analysis::{AnalysisRequest, AnalysisTarget};
use super::handoff::Handoff;
use super::outcome::Outcome;
use super::pool::{Intake, StageWorker, WorkerPool};
use super::work::{panic_message, Stage, StageStats, WorkState};
use super::StageContext;
use crate::config::PipelineConfig;
use crate::core::{AnalysisEntry, AnalysisStatus, FileObject, Uid, UNPACKER_PLUGIN};
use crate::error::Result;
use crate::locks::{LockGuard, LockManager};
use crate::storage::StorageResult;
use crate::unpack::{ExtractedFile, UnpackerRegistry};
use serde_json::json;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const UNPACKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One object to unpack.
#[derive(Debug, Clone)]
pub struct UnpackJob {
    pub object: Arc<FileObject>,
    /// Inherited by extracted children and by the analysis hand-off.
    pub priority: i32,
}

#[derive(Debug, Clone, Copy)]
struct UnpackSettings {
    max_depth: usize,
    lock_timeout: Duration,
    lock_retries: u32,
}

enum Unpacked {
    /// Results already stored by an earlier attempt, including its failure.
    Reused {
        children: Vec<Uid>,
        error: Option<String>,
    },
    Fresh {
        children: Vec<Arc<FileObject>>,
        error: Option<String>,
    },
}

pub struct UnpackingWorker {
    ctx: StageContext,
    locks: Arc<LockManager>,
    unpackers: UnpackerRegistry,
    to_analysis: Handoff<AnalysisRequest>,
    settings: UnpackSettings,
}

impl UnpackingWorker {
    pub fn new(
        config: &PipelineConfig,
        ctx: StageContext,
        locks: Arc<LockManager>,
        unpackers: UnpackerRegistry,
        to_analysis: Handoff<AnalysisRequest>,
    ) -> Self {
        Self {
            ctx,
            locks,
            unpackers,
            to_analysis,
            settings: UnpackSettings {
                max_depth: config.unpacking.max_depth,
                lock_timeout: config.locks.acquire_timeout(),
                lock_retries: config.unpacking.lock_retries,
            },
        }
    }

    fn store<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        self.ctx.storage(Stage::Unpacking, result)
    }

    /// Bounded lock wait, repeated `lock_retries` more times on expiry.
    fn lock(&self, uid: &Uid) -> Result<LockGuard> {
        let mut attempt = 0;
        loop {
            match self.locks.acquire_guard(uid, self.settings.lock_timeout) {
                Err(e) if e.is_retryable() && attempt < self.settings.lock_retries => {
                    attempt += 1;
                    debug!(uid = %uid, attempt, "object busy, waiting again");
                }
                other => return other,
            }
        }
    }

    fn unpack_locked(&self, object: &Arc<FileObject>) -> StorageResult<Unpacked> {
        let uid = object.uid();
        if self.store(self.ctx.objects.has_result(uid, UNPACKER_PLUGIN))? {
            // merges the parent link of this extraction path
            self.store(self.ctx.objects.put_object(object))?;
            let stored = self.store(self.ctx.objects.get_object(uid))?;
            let error = stored
                .analysis(UNPACKER_PLUGIN)
                .filter(|entry| entry.status == AnalysisStatus::Failed)
                .map(|entry| entry.detail().unwrap_or_default().to_string());
            debug!(uid = %uid, failed = error.is_some(), "already unpacked, reusing stored result");
            return Ok(Unpacked::Reused {
                children: stored.children().into_iter().collect(),
                error,
            });
        }

        let content = match object.content() {
            Some(content) => content.clone(),
            None => self.store(self.ctx.contents.get_content(uid))?,
        };
        self.store(self.ctx.contents.put_content(uid, &content))?;

        let (entry, children, error) = if object.depth() >= self.settings.max_depth {
            debug!(uid = %uid, depth = object.depth(), "depth limit reached");
            let entry = AnalysisEntry::completed(
                UNPACKER_PLUGIN,
                UNPACKER_VERSION,
                json!({
                    "plugin_used": null,
                    "number_of_unpacked_files": 0,
                    "file_names": [],
                    "depth_limit_reached": true,
                }),
            );
            (entry, Vec::new(), None)
        } else {
            let unpacker = self.unpackers.select(&content);
            let extracted = panic::catch_unwind(AssertUnwindSafe(|| unpacker.extract(&content)))
                .unwrap_or_else(|payload| Err(anyhow::anyhow!(panic_message(payload.as_ref()))));
            match extracted {
                Ok(files) => {
                    let file_names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
                    let children = self.register_children(object, files)?;
                    let entry = AnalysisEntry::completed(
                        UNPACKER_PLUGIN,
                        UNPACKER_VERSION,
                        json!({
                            "plugin_used": unpacker.name(),
                            "number_of_unpacked_files": children.len(),
                            "file_names": file_names,
                        }),
                    );
                    (entry, children, None)
                }
                Err(e) => {
                    let detail = format!("{}: {:#}", unpacker.name(), e);
                    warn!(uid = %uid, error = %detail, "extraction failed");
                    let entry = AnalysisEntry::failed(UNPACKER_PLUGIN, UNPACKER_VERSION, &detail);
                    (entry, Vec::new(), Some(detail))
                }
            }
        };

        if let Err(e) = object.record_analysis(entry) {
            debug!(uid = %uid, error = %e, "unpacker entry already present");
        }
        self.store(self.ctx.objects.put_object(object))?;
        Ok(Unpacked::Fresh { children, error })
    }

    /// Store every child before the parent entry that makes the parent
    /// count as unpacked.
    fn register_children(
        &self,
        parent: &Arc<FileObject>,
        files: Vec<ExtractedFile>,
    ) -> StorageResult<Vec<Arc<FileObject>>> {
        let mut seen = BTreeSet::new();
        let mut children = Vec::with_capacity(files.len());
        for file in files {
            let child = FileObject::extracted(file.name, file.content, parent);
            if child.uid() == parent.uid() || !seen.insert(child.uid().clone()) {
                continue;
            }
            if let Some(content) = child.content() {
                self.store(self.ctx.contents.put_content(child.uid(), content))?;
            }
            self.store(self.ctx.objects.put_object(&child))?;
            parent.add_child(child.uid().clone());
            children.push(Arc::new(child));
        }
        Ok(children)
    }
}

impl StageWorker for UnpackingWorker {
    type Job = UnpackJob;

    fn stage(&self) -> Stage {
        Stage::Unpacking
    }

    fn subject(&self, job: &UnpackJob) -> String {
        job.object.uid().to_string()
    }

    fn process(&self, job: UnpackJob, intake: &Intake<UnpackJob>) -> WorkState {
        let UnpackJob { object, priority } = job;
        let uid = object.uid().clone();

        let guard = match self.lock(&uid) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(uid = %uid, error = %e, "could not lock object");
                self.ctx.emit(Outcome::UnpackFailed {
                    uid,
                    error: format!("busy: {e}"),
                });
                return WorkState::Failed;
            }
        };
        let unpacked = self.unpack_locked(&object);
        drop(guard);

        match unpacked {
            Ok(Unpacked::Reused {
                children,
                error: None,
            }) => {
                self.ctx.emit(Outcome::Unpacked {
                    uid,
                    children,
                    reused: true,
                });
                WorkState::Completed
            }
            // the earlier extraction failed; report it again rather than retry
            Ok(Unpacked::Reused {
                error: Some(error), ..
            }) => {
                self.ctx.emit(Outcome::UnpackFailed { uid, error });
                WorkState::Failed
            }
            Ok(Unpacked::Fresh { children, error }) => {
                let state = match error {
                    Some(error) => {
                        self.ctx.emit(Outcome::UnpackFailed {
                            uid: uid.clone(),
                            error,
                        });
                        WorkState::Failed
                    }
                    None => {
                        debug!(uid = %uid, children = children.len(), "unpacked");
                        self.ctx.emit(Outcome::Unpacked {
                            uid: uid.clone(),
                            children: children.iter().map(|c| c.uid().clone()).collect(),
                            reused: false,
                        });
                        WorkState::Completed
                    }
                };
                self.to_analysis.send(AnalysisRequest {
                    target: AnalysisTarget::Object(Arc::clone(&object)),
                    plugins: None,
                    force: false,
                    priority,
                });
                for child in children {
                    if let Err(e) = intake.submit_internal(UnpackJob { object: child, priority }, priority)
                    {
                        warn!(parent = %uid, error = %e, "extracted file not queued");
                    }
                }
                state
            }
            Err(e) => {
                self.ctx.emit(Outcome::UnpackFailed {
                    uid,
                    error: e.to_string(),
                });
                WorkState::Failed
            }
        }
    }
}

/// The unpacking stage: a worker pool around [`UnpackingWorker`].
pub struct UnpackingScheduler {
    pool: WorkerPool<UnpackingWorker>,
}

impl UnpackingScheduler {
    pub fn start(
        config: &PipelineConfig,
        ctx: StageContext,
        locks: Arc<LockManager>,
        unpackers: UnpackerRegistry,
        to_analysis: Handoff<AnalysisRequest>,
    ) -> Result<Self> {
        info!(unpackers = ?unpackers.names(), max_depth = config.unpacking.max_depth, "starting unpacking stage");
        let worker = UnpackingWorker::new(config, ctx, locks, unpackers, to_analysis);
        Ok(Self {
            pool: WorkerPool::start(worker, config.unpacking.workers)?,
        })
    }

    pub fn intake(&self) -> Arc<Intake<UnpackJob>> {
        self.pool.intake()
    }

    pub fn submit(&self, object: FileObject, priority: i32) -> Result<u64> {
        self.pool.intake().submit(
            UnpackJob {
                object: Arc::new(object),
                priority,
            },
            priority,
        )
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
