use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of one version of the remote file.
///
/// Derived from the descriptor hash when one is published, otherwise from
/// whatever validator the source exposes (ETag, modification time, size).
/// Every page and cached result is tagged with the version it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileVersion(String);

impl FileVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl fmt::Display for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl From<&str> for FileVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Sidecar JSON published next to the database file.
///
/// ```json
/// { "size": 12582912, "hash": "af1349b9...", "page_size": 65536, "concurrency": 6 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub size: u64,
    /// Hex-encoded BLAKE3 hash of the complete file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

/// What a source reported about the file when probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub size: u64,
    pub version: FileVersion,
    pub accepts_ranges: bool,
    pub descriptor: Option<Descriptor>,
}

impl SourceInfo {
    /// Hash that a full download must match, if the publisher provided one.
    pub fn expected_hash(&self) -> Option<&str> {
        self.descriptor.as_ref().and_then(|descriptor| descriptor.hash.as_deref())
    }
}
