//! Shannon entropy of a file, overall and per block.
//!
//! High entropy in a file that is not a known compressed format is a hint of
//! encryption or an unknown packer.

use crate::core::FileObject;
use crate::plugins::{file_type, AnalysisPlugin, Plugin};
use anyhow::Context;
use serde_json::{json, Value};

pub const NAME: &str = "entropy";

const BLOCK_SIZE: usize = 4096;
const MAX_BLOCKS: usize = 256;

/// Calculates the Shannon entropy of a byte slice, between 0.0 and 8.0.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut histogram = [0usize; 256];
    for &byte in data {
        histogram[byte as usize] += 1;
    }
    let len = data.len() as f64;
    histogram
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn classify(entropy: f64) -> &'static str {
    match entropy {
        e if e < 3.0 => "text",
        e if e < 5.0 => "code",
        e if e < 7.0 => "mixed",
        e if e < 7.8 => "compressed",
        _ => "random",
    }
}

fn is_compressed_mime(mime: &str) -> bool {
    ["zip", "gzip", "x-xz", "x-bzip2", "zstd", "x-7z-compressed", "x-lzip", "x-rar"]
        .iter()
        .any(|suffix| mime.ends_with(suffix))
}

#[derive(Debug)]
pub struct EntropyPlugin {
    dependencies: Vec<String>,
}

impl EntropyPlugin {
    pub fn new() -> Self {
        Self {
            dependencies: vec![file_type::NAME.to_string()],
        }
    }
}

impl Default for EntropyPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for EntropyPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

impl AnalysisPlugin for EntropyPlugin {
    fn analyze(&self, object: &FileObject) -> anyhow::Result<Value> {
        let content = object
            .content()
            .with_context(|| format!("no content loaded for {}", object.uid()))?;
        let mime = object
            .analysis(file_type::NAME)
            .and_then(|entry| entry.result["mime"].as_str().map(str::to_string))
            .unwrap_or_default();

        let overall = shannon_entropy(content);
        let blocks: Vec<f64> = content
            .chunks(BLOCK_SIZE)
            .take(MAX_BLOCKS)
            .map(shannon_entropy)
            .collect();
        let max_block = blocks.iter().cloned().fold(0.0, f64::max);
        let class = classify(overall);
        let suspicious = matches!(class, "compressed" | "random") && !is_compressed_mime(&mime);

        Ok(json!({
            "entropy": overall,
            "class": class,
            "block_size": BLOCK_SIZE,
            "blocks": blocks,
            "max_block_entropy": max_block,
            "suspicious": suspicious,
        }))
    }
}
