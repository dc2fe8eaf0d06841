//! In-process storage backend.

use super::{ContentStore, ObjectStore, StorageError, StorageResult};
use crate::core::{AnalysisEntry, ComparisonId, ComparisonResult, FileObject, FileObjectRecord, Uid};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Object, result, comparison, and content storage held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<Uid, FileObjectRecord>>,
    comparisons: RwLock<HashMap<ComparisonId, ComparisonResult>>,
    contents: RwLock<HashMap<Uid, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Snapshot of a stored record, analyses included.
    pub fn record(&self, uid: &Uid) -> Option<FileObjectRecord> {
        self.objects.read().get(uid).cloned()
    }
}

impl ObjectStore for MemoryStore {
    fn get_object(&self, uid: &Uid) -> StorageResult<FileObject> {
        self.objects
            .read()
            .get(uid)
            .cloned()
            .map(FileObject::from_record)
            .ok_or_else(|| StorageError::NotFound(uid.clone()))
    }

    fn put_object(&self, object: &FileObject) -> StorageResult<()> {
        let incoming = object.to_record();
        let mut objects = self.objects.write();
        match objects.get_mut(object.uid()) {
            Some(existing) => existing.merge(incoming),
            None => {
                objects.insert(object.uid().clone(), incoming);
            }
        }
        Ok(())
    }

    fn record_result(&self, uid: &Uid, plugin: &str, entry: &AnalysisEntry) -> StorageResult<()> {
        let mut objects = self.objects.write();
        let record = objects
            .get_mut(uid)
            .ok_or_else(|| StorageError::NotFound(uid.clone()))?;
        record
            .processed_analysis
            .insert(plugin.to_string(), entry.clone());
        Ok(())
    }

    fn has_result(&self, uid: &Uid, plugin: &str) -> StorageResult<bool> {
        Ok(self
            .objects
            .read()
            .get(uid)
            .is_some_and(|r| r.processed_analysis.contains_key(plugin)))
    }

    fn get_comparison(&self, id: &ComparisonId) -> StorageResult<Option<ComparisonResult>> {
        Ok(self.comparisons.read().get(id).cloned())
    }

    fn put_comparison(&self, result: &ComparisonResult) -> StorageResult<()> {
        self.comparisons
            .write()
            .insert(result.compare_id.clone(), result.clone());
        Ok(())
    }
}

impl ContentStore for MemoryStore {
    fn put_content(&self, uid: &Uid, content: &[u8]) -> StorageResult<()> {
        self.contents
            .write()
            .entry(uid.clone())
            .or_insert_with(|| Bytes::copy_from_slice(content));
        Ok(())
    }

    fn get_content(&self, uid: &Uid) -> StorageResult<Bytes> {
        self.contents
            .read()
            .get(uid)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(uid.clone()))
    }

    fn has_content(&self, uid: &Uid) -> StorageResult<bool> {
        Ok(self.contents.read().contains_key(uid))
    }
}
