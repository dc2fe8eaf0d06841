//! MIME type identification from magic bytes, falling back to the file name.

use crate::core::FileObject;
use crate::plugins::{AnalysisPlugin, Plugin};
use anyhow::Context;
use serde_json::{json, Value};

pub const NAME: &str = "file_type";

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Default)]
pub struct FileTypePlugin;

impl FileTypePlugin {
    pub fn new() -> Self {
        Self
    }
}

fn looks_like_text(data: &[u8]) -> bool {
    !data.is_empty()
        && std::str::from_utf8(data).is_ok_and(|s| {
            s.chars()
                .all(|c| !c.is_control() || c.is_ascii_whitespace())
        })
}

/// Identify `data`, consulting `file_name` only when magic detection fails.
pub fn identify(data: &[u8], file_name: &str) -> Value {
    if let Some(kind) = infer::get(data) {
        return json!({
            "mime": kind.mime_type(),
            "extension": kind.extension(),
            "source": "magic",
        });
    }
    if looks_like_text(data) {
        return json!({ "mime": "text/plain", "extension": null, "source": "content" });
    }
    if let Some(guess) = mime_guess::from_path(file_name).first() {
        return json!({ "mime": guess.essence_str(), "extension": null, "source": "file_name" });
    }
    json!({ "mime": OCTET_STREAM, "extension": null, "source": "fallback" })
}

impl Plugin for FileTypePlugin {
    fn name(&self) -> &str {
        NAME
    }
}

impl AnalysisPlugin for FileTypePlugin {
    fn analyze(&self, object: &FileObject) -> anyhow::Result<Value> {
        let content = object
            .content()
            .with_context(|| format!("no content loaded for {}", object.uid()))?;
        Ok(identify(content, object.file_name()))
    }
}
