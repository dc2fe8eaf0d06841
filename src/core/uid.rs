//! Content-addressed identifiers for firmware images and extracted files.
//!
//! A uid is `<sha256 hex>_<size in bytes>`. It is derived from content only,
//! so the same bytes reached through two extraction paths share one uid and
//! the value is stable across runs.

use crate::error::{PipelineError, Result};
use crate::hashing::sha256_digest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SHA256_HEX_LEN: usize = 64;

/// A stable, content-derived object identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uid(String);

impl Uid {
    /// Derive the uid of a byte buffer.
    pub fn from_content(content: &[u8]) -> Self {
        Uid(format!("{}_{}", sha256_digest(content), content.len()))
    }

    /// Parse and validate a uid string.
    pub fn parse(value: &str) -> Result<Self> {
        let (hash, size) = value
            .split_once('_')
            .ok_or_else(|| PipelineError::InvalidUid(value.to_string()))?;
        let hash_ok = hash.len() == SHA256_HEX_LEN
            && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !hash_ok || size.is_empty() || size.parse::<u64>().is_err() {
            return Err(PipelineError::InvalidUid(value.to_string()));
        }
        Ok(Uid(value.to_string()))
    }

    /// The sha256 part of the uid.
    pub fn hash(&self) -> &str {
        &self.0[..SHA256_HEX_LEN]
    }

    /// Content size encoded in the uid.
    pub fn size(&self) -> u64 {
        self.0[SHA256_HEX_LEN + 1..].parse().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Uid {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Uid::parse(s)
    }
}

impl TryFrom<String> for Uid {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        Uid::parse(&value)
    }
}

impl From<Uid> for String {
    fn from(uid: Uid) -> Self {
        uid.0
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
