use std::fmt::Display;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Snapshot description of one item in a source, as returned by a detector's
/// full enumeration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Logical path within the source.
    pub path: String,
    /// Source-native opaque identifier, when the source has stable ids.
    pub source_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified_timestamp: Option<OffsetDateTime>,
    pub size: Option<u64>,
}

impl FileMetadata {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), source_id: None, modified_timestamp: None, size: None }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_modified(mut self, modified: OffsetDateTime) -> Self {
        self.modified_timestamp = Some(modified);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// One observed change. In-memory only, never persisted verbatim; delivery
/// is at-least-once and the engine deduplicates through the state store.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub change_type: ChangeType,
    pub metadata: FileMetadata,
    /// Detector-local wall clock, for diagnostics only.
    pub received_at: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(change_type: ChangeType, metadata: FileMetadata) -> Self {
        Self { change_type, metadata, received_at: OffsetDateTime::now_utc() }
    }
}
