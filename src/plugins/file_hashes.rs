//! Content digests for lookup against external hash databases.

use crate::core::FileObject;
use crate::hashing::{blake3_digest, md5_digest, sha256_digest, sha512_digest};
use crate::plugins::{AnalysisPlugin, Plugin};
use anyhow::Context;
use serde_json::{json, Value};

pub const NAME: &str = "file_hashes";

#[derive(Debug, Default)]
pub struct FileHashesPlugin;

impl FileHashesPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for FileHashesPlugin {
    fn name(&self) -> &str {
        NAME
    }
}

impl AnalysisPlugin for FileHashesPlugin {
    fn analyze(&self, object: &FileObject) -> anyhow::Result<Value> {
        let content = object
            .content()
            .with_context(|| format!("no content loaded for {}", object.uid()))?;
        Ok(json!({
            "md5": md5_digest(content),
            "sha256": sha256_digest(content),
            "sha512": sha512_digest(content),
            "blake3": blake3_digest(content),
        }))
    }
}
