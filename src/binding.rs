//! Boundary between the pipeline and whatever sits in front of it.
//!
//! [`BackendBinding::submit`] validates a request, enqueues it on the right
//! stage intake, and returns an acknowledgement at once. Outcomes flow back
//! on a dispatcher thread that pushes each one to every registered handler.
//! Requests are plain serde values, so any transport can carry them.

use crate::core::{FileObject, Uid};
use crate::error::{PipelineError, Result};
use crate::plugins::PluginRegistry;
use crate::scheduler::{
    AnalysisJob, AnalysisRequest, AnalysisTarget, CompareRequest, Intake, Outcome,
    OutcomeReceiver, UnpackJob,
};
use crate::storage::{HealthMonitor, HealthStatus};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Push-based result consumer.
pub type ResultHandler = Arc<dyn Fn(&Outcome) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Unpack,
    Analyze,
    Compare,
}

/// `{"kind": "unpack" | "analyze" | "compare", "payload": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum Request {
    /// New firmware: unpack, then analyze everything extracted.
    Unpack {
        file_name: String,
        content: Bytes,
        #[serde(default)]
        plugins: Option<Vec<String>>,
        #[serde(default)]
        priority: i32,
    },
    /// Re-analysis of a stored object.
    Analyze {
        uid: Uid,
        #[serde(default)]
        plugins: Option<Vec<String>>,
        #[serde(default)]
        force: bool,
        #[serde(default)]
        priority: i32,
    },
    Compare {
        uids: Vec<Uid>,
        #[serde(default)]
        redo: bool,
        #[serde(default)]
        priority: i32,
    },
}

impl Request {
    pub fn unpack(file_name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Request::Unpack {
            file_name: file_name.into(),
            content: content.into(),
            plugins: None,
            priority: 0,
        }
    }

    pub fn analyze(uid: Uid) -> Self {
        Request::Analyze {
            uid,
            plugins: None,
            force: false,
            priority: 0,
        }
    }

    pub fn compare(uids: Vec<Uid>) -> Self {
        Request::Compare {
            uids,
            redo: false,
            priority: 0,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Unpack { .. } => RequestKind::Unpack,
            Request::Analyze { .. } => RequestKind::Analyze,
            Request::Compare { .. } => RequestKind::Compare,
        }
    }
}

/// Immediate receipt for an accepted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub request_id: Uuid,
    pub kind: RequestKind,
    /// Uid of the object, or the comparison id.
    pub target: String,
    pub accepted_at: DateTime<Utc>,
}

pub struct BackendBinding {
    registry: Arc<PluginRegistry>,
    unpacking: Arc<Intake<UnpackJob>>,
    analysis: Arc<Intake<AnalysisJob>>,
    comparison: Arc<Intake<CompareRequest>>,
    handlers: Arc<RwLock<Vec<ResultHandler>>>,
    health: Arc<HealthMonitor>,
    closed: AtomicBool,
}

impl BackendBinding {
    pub fn new(
        registry: Arc<PluginRegistry>,
        unpacking: Arc<Intake<UnpackJob>>,
        analysis: Arc<Intake<AnalysisJob>>,
        comparison: Arc<Intake<CompareRequest>>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            registry,
            unpacking,
            analysis,
            comparison,
            handlers: Arc::new(RwLock::new(Vec::new())),
            health,
            closed: AtomicBool::new(false),
        }
    }

    /// Route a request to its stage. Never waits for the work itself.
    pub fn submit(&self, request: Request) -> Result<Acknowledgement> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::ShuttingDown {
                stage: "binding".to_string(),
            });
        }
        let kind = request.kind();
        let target = match request {
            Request::Unpack {
                file_name,
                content,
                plugins,
                priority,
            } => {
                self.check_plugins(plugins.as_deref())?;
                let object = FileObject::from_bytes(file_name, content).with_scheduled_analysis(plugins);
                let target = object.uid().to_string();
                let job = UnpackJob {
                    object: Arc::new(object),
                    priority,
                };
                self.unpacking.submit(job, priority)?;
                target
            }
            Request::Analyze {
                uid,
                plugins,
                force,
                priority,
            } => {
                self.check_plugins(plugins.as_deref())?;
                let target = uid.to_string();
                let request = AnalysisRequest {
                    target: AnalysisTarget::Stored(uid),
                    plugins,
                    force,
                    priority,
                };
                self.analysis.submit(AnalysisJob::Start(request), priority)?;
                target
            }
            Request::Compare {
                uids,
                redo,
                priority,
            } => {
                if uids.is_empty() {
                    return Err(PipelineError::InvalidRequest(
                        "compare needs at least one uid".to_string(),
                    ));
                }
                let request = CompareRequest {
                    uids,
                    redo,
                    priority,
                };
                let target = request.compare_id().to_string();
                self.comparison.submit(request, priority)?;
                target
            }
        };
        let ack = Acknowledgement {
            request_id: Uuid::new_v4(),
            kind,
            target,
            accepted_at: Utc::now(),
        };
        debug!(request_id = %ack.request_id, kind = ?ack.kind, target = %ack.target, "request accepted");
        Ok(ack)
    }

    /// Submit a JSON-encoded request.
    pub fn submit_json(&self, json: &str) -> Result<Acknowledgement> {
        let request: Request = serde_json::from_str(json)?;
        self.submit(request)
    }

    fn check_plugins(&self, plugins: Option<&[String]>) -> Result<()> {
        if plugins.is_some() {
            self.registry.resolve(plugins)?;
        }
        Ok(())
    }

    /// Register a handler for every outcome delivered from now on.
    pub fn on_result<F>(&self, handler: F)
    where
        F: Fn(&Outcome) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn health(&self) -> HealthStatus {
        self.health.status()
    }

    /// Refuse further submissions.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("binding closed to new requests");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver outcomes to the handlers until every stage has dropped its sink.
    pub fn spawn_dispatcher(&self, outcomes: OutcomeReceiver) -> io::Result<JoinHandle<()>> {
        let handlers = Arc::clone(&self.handlers);
        thread::Builder::new()
            .name("binding-dispatch".to_string())
            .spawn(move || {
                outcomes.for_each(|outcome| deliver(&handlers, outcome));
                debug!("outcome dispatcher finished");
            })
    }
}

fn deliver(handlers: &RwLock<Vec<ResultHandler>>, outcome: &Outcome) {
    let handlers = handlers.read().clone();
    for handler in handlers.iter() {
        if panic::catch_unwind(AssertUnwindSafe(|| handler(outcome))).is_err() {
            error!(stage = %outcome.stage(), "result handler panicked");
        }
    }
}
