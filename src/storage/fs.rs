//! Filesystem content store.
//!
//! Bytes live at `<root>/<first two hash chars>/<uid>`. Writes go to a
//! temporary sibling and are renamed into place, so a reader never sees a
//! partially written file.

use super::{ContentStore, StorageError, StorageResult};
use crate::config::StorageConfig;
use crate::core::Uid;
use bytes::Bytes;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store rooted at `content_dir`, if one is configured.
    pub fn from_config(config: &StorageConfig) -> StorageResult<Option<Self>> {
        config.content_dir.as_ref().map(Self::new).transpose()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, uid: &Uid) -> PathBuf {
        self.root.join(&uid.hash()[..2]).join(uid.as_str())
    }
}

impl ContentStore for FsContentStore {
    fn put_content(&self, uid: &Uid, content: &[u8]) -> StorageResult<()> {
        let path = self.path_for(uid);
        if path.exists() {
            return Ok(());
        }
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::Backend(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(".{}.{}.tmp", uid, uuid::Uuid::new_v4()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(uid = %uid, bytes = content.len(), "stored content");
        Ok(())
    }

    fn get_content(&self, uid: &Uid) -> StorageResult<Bytes> {
        match fs::read(self.path_for(uid)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound(uid.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn has_content(&self, uid: &Uid) -> StorageResult<bool> {
        Ok(self.path_for(uid).is_file())
    }
}
