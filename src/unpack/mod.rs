//! Extraction of embedded files.
//!
//! Unpackers are opaque units: given the bytes of one object they return the
//! files found inside. The registry picks the first unpacker whose signature
//! check accepts the content, falling back to a pass-through that extracts
//! nothing.

pub mod tar;

use bytes::Bytes;
use std::sync::Arc;

/// One file produced by an unpacker.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFile {
    /// Path inside the container.
    pub name: String,
    pub content: Bytes,
}

impl ExtractedFile {
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

pub trait Unpacker: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap signature check on the content.
    fn accepts(&self, data: &[u8]) -> bool;

    fn extract(&self, data: &[u8]) -> anyhow::Result<Vec<ExtractedFile>>;
}

/// Leaves the object as is.
#[derive(Debug, Default)]
pub struct PassThroughUnpacker;

impl Unpacker for PassThroughUnpacker {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn accepts(&self, _data: &[u8]) -> bool {
        true
    }

    fn extract(&self, _data: &[u8]) -> anyhow::Result<Vec<ExtractedFile>> {
        Ok(Vec::new())
    }
}

/// Ordered list of unpackers consulted by the unpacking stage.
#[derive(Clone)]
pub struct UnpackerRegistry {
    unpackers: Vec<Arc<dyn Unpacker>>,
    fallback: Arc<dyn Unpacker>,
}

impl Default for UnpackerRegistry {
    fn default() -> Self {
        Self {
            unpackers: Vec::new(),
            fallback: Arc::new(PassThroughUnpacker),
        }
    }
}

impl UnpackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(tar::TarUnpacker::new()));
        registry
    }

    /// Later registrations are consulted after earlier ones.
    pub fn register(&mut self, unpacker: Arc<dyn Unpacker>) {
        self.unpackers.push(unpacker);
    }

    pub fn select(&self, data: &[u8]) -> Arc<dyn Unpacker> {
        self.unpackers
            .iter()
            .find(|u| u.accepts(data))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.unpackers.iter().map(|u| u.name().to_string()).collect()
    }
}
