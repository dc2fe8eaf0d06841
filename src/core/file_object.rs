//! File objects: one firmware image or one file extracted from it.
//!
//! A [`FileObject`] is shared between stages behind an `Arc`. Its analysis map
//! is guarded by a reader/writer lock: many dependency checks may read it while
//! a single plugin writer records a result. Every analysis slot is written at
//! most once per run; a second write is rejected.
//!
//! [`FileObjectRecord`] is the plain, serializable shape handed to storage.

use crate::core::analysis::{AnalysisEntry, AnalysisStatus};
use crate::core::uid::Uid;
use crate::error::{PipelineError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Live, shareable file object.
pub struct FileObject {
    uid: Uid,
    file_name: String,
    size: u64,
    depth: usize,
    root_uid: Uid,
    content: Option<Bytes>,
    scheduled_analysis: Option<Vec<String>>,
    parents: RwLock<BTreeSet<Uid>>,
    children: RwLock<BTreeSet<Uid>>,
    processed_analysis: RwLock<BTreeMap<String, AnalysisEntry>>,
}

impl FileObject {
    /// A top-level firmware image.
    pub fn from_bytes(file_name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        let uid = Uid::from_content(&content);
        Self {
            root_uid: uid.clone(),
            uid,
            file_name: file_name.into(),
            size: content.len() as u64,
            depth: 0,
            content: Some(content),
            scheduled_analysis: None,
            parents: RwLock::new(BTreeSet::new()),
            children: RwLock::new(BTreeSet::new()),
            processed_analysis: RwLock::new(BTreeMap::new()),
        }
    }

    /// A file extracted from `parent`. Inherits the root and the analysis selection.
    pub fn extracted(
        file_name: impl Into<String>,
        content: impl Into<Bytes>,
        parent: &FileObject,
    ) -> Self {
        let mut child = Self::from_bytes(file_name, content);
        child.depth = parent.depth + 1;
        child.root_uid = parent.root_uid.clone();
        child.scheduled_analysis = parent.scheduled_analysis.clone();
        child.parents.get_mut().insert(parent.uid.clone());
        child
    }

    pub fn with_scheduled_analysis(mut self, plugins: Option<Vec<String>>) -> Self {
        self.scheduled_analysis = plugins;
        self
    }

    pub fn with_content(mut self, content: Bytes) -> Self {
        self.content = Some(content);
        self
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Extraction depth; 0 for a submitted firmware image.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn root_uid(&self) -> &Uid {
        &self.root_uid
    }

    pub fn content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    pub fn scheduled_analysis(&self) -> Option<&[String]> {
        self.scheduled_analysis.as_deref()
    }

    pub fn parents(&self) -> BTreeSet<Uid> {
        self.parents.read().clone()
    }

    pub fn children(&self) -> BTreeSet<Uid> {
        self.children.read().clone()
    }

    pub fn add_parent(&self, parent: Uid) {
        self.parents.write().insert(parent);
    }

    pub fn add_child(&self, child: Uid) {
        self.children.write().insert(child);
    }

    /// Record a plugin result. Fails if the slot was already written in this run.
    pub fn record_analysis(&self, entry: AnalysisEntry) -> Result<()> {
        let mut analyses = self.processed_analysis.write();
        if analyses.contains_key(&entry.plugin) {
            return Err(PipelineError::DuplicateResult {
                uid: self.uid.clone(),
                plugin: entry.plugin,
            });
        }
        analyses.insert(entry.plugin.clone(), entry);
        Ok(())
    }

    pub fn analysis(&self, plugin: &str) -> Option<AnalysisEntry> {
        self.processed_analysis.read().get(plugin).cloned()
    }

    /// Whether any entry, whatever its status, exists for `plugin`.
    pub fn has_analysis(&self, plugin: &str) -> bool {
        self.processed_analysis.read().contains_key(plugin)
    }

    /// Whether `plugin` completed successfully on this object.
    pub fn has_completed(&self, plugin: &str) -> bool {
        self.processed_analysis
            .read()
            .get(plugin)
            .is_some_and(|e| e.status == AnalysisStatus::Completed)
    }

    pub fn analysis_names(&self) -> BTreeSet<String> {
        self.processed_analysis.read().keys().cloned().collect()
    }

    pub fn processed_analysis(&self) -> BTreeMap<String, AnalysisEntry> {
        self.processed_analysis.read().clone()
    }

    /// Drop entries so the named slots can be written again by a new run.
    pub fn clear_analyses<'a>(&self, plugins: impl IntoIterator<Item = &'a String>) {
        let mut analyses = self.processed_analysis.write();
        for plugin in plugins {
            analyses.remove(plugin);
        }
    }

    pub fn to_record(&self) -> FileObjectRecord {
        FileObjectRecord {
            uid: self.uid.clone(),
            file_name: self.file_name.clone(),
            size: self.size,
            depth: self.depth,
            root_uid: self.root_uid.clone(),
            scheduled_analysis: self.scheduled_analysis.clone(),
            parents: self.parents(),
            children: self.children(),
            processed_analysis: self.processed_analysis(),
        }
    }

    /// Rebuild a live object from storage. Content is not part of the record.
    pub fn from_record(record: FileObjectRecord) -> Self {
        Self {
            uid: record.uid,
            file_name: record.file_name,
            size: record.size,
            depth: record.depth,
            root_uid: record.root_uid,
            content: None,
            scheduled_analysis: record.scheduled_analysis,
            parents: RwLock::new(record.parents),
            children: RwLock::new(record.children),
            processed_analysis: RwLock::new(record.processed_analysis),
        }
    }
}

impl fmt::Debug for FileObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileObject")
            .field("uid", &self.uid)
            .field("file_name", &self.file_name)
            .field("depth", &self.depth)
            .field("analyses", &self.analysis_names())
            .finish()
    }
}

/// Persisted shape of a file object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileObjectRecord {
    pub uid: Uid,
    pub file_name: String,
    pub size: u64,
    pub depth: usize,
    pub root_uid: Uid,
    #[serde(default)]
    pub scheduled_analysis: Option<Vec<String>>,
    #[serde(default)]
    pub parents: BTreeSet<Uid>,
    #[serde(default)]
    pub children: BTreeSet<Uid>,
    #[serde(default)]
    pub processed_analysis: BTreeMap<String, AnalysisEntry>,
}

impl FileObjectRecord {
    /// Upsert merge: relations are unioned, incoming analyses replace same-named ones.
    pub fn merge(&mut self, incoming: FileObjectRecord) {
        self.parents.extend(incoming.parents);
        self.children.extend(incoming.children);
        self.processed_analysis.extend(incoming.processed_analysis);
        if self.scheduled_analysis.is_none() {
            self.scheduled_analysis = incoming.scheduled_analysis;
        }
    }
}
