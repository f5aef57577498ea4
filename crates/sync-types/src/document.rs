use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::datasource::ConfigId;
use crate::Ordinal;

/// Globally unique, stable document identifier: `{config_id}:{source_path}`.
///
/// The same key is used against all three index writers, which is what makes
/// the at-least-once + idempotent-write model work.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    pub fn new(config_id: ConfigId, source_path: &str) -> Self {
        Self(format!("{config_id}:{source_path}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn config_id(&self) -> Option<ConfigId> {
        let (config, _) = self.0.split_once(':')?;
        Uuid::parse_str(config).ok()
    }

    pub fn source_path(&self) -> &str {
        self.0.split_once(':').map(|(_, path)| path).unwrap_or("")
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for DocId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which writer targets a config applies to. Vector and search are always
/// written; the graph writer is bypassed for `skip_graph` configs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetSet {
    pub graph: bool,
}

impl TargetSet {
    pub const ALL: TargetSet = TargetSet { graph: true };
}

/// One row per `(datasource, document)` pair the core has observed.
///
/// Inserted on the first successful apply of a CREATE, updated on UPDATE,
/// deleted on successful DELETE. A row with any per-target timestamp still
/// null is partially synced and eligible for resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub doc_id: DocId,
    pub config_id: ConfigId,
    pub source_path: String,
    /// Source-native opaque identifier (cloud file id), used for rename and
    /// move tracking and for DELETE reconciliation when the path is no
    /// longer observable. Null for sources without stable ids.
    pub source_id: Option<String>,
    pub ordinal: Ordinal,
    /// Hex SHA-256 of the raw source bytes.
    pub content_hash: String,
    /// Source-reported last-modified; advisory only.
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified_timestamp: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub vector_synced_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub search_synced_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub graph_synced_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl DocumentState {
    /// True when every required target has a success timestamp.
    pub fn is_fully_synced(&self, targets: TargetSet) -> bool {
        self.vector_synced_at.is_some()
            && self.search_synced_at.is_some()
            && (!targets.graph || self.graph_synced_at.is_some())
    }

    /// The required targets still owed a successful write.
    pub fn missing_targets(&self, targets: TargetSet) -> MissingTargets {
        MissingTargets {
            vector: self.vector_synced_at.is_none(),
            search: self.search_synced_at.is_none(),
            graph: targets.graph && self.graph_synced_at.is_none(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MissingTargets {
    pub vector: bool,
    pub search: bool,
    pub graph: bool,
}

impl MissingTargets {
    pub fn any(&self) -> bool {
        self.vector || self.search || self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_splits_on_the_first_colon_only() {
        let config_id = Uuid::nil();
        let doc_id = DocId::new(config_id, "/data/a:b.txt");
        assert_eq!(doc_id.config_id(), Some(config_id));
        assert_eq!(doc_id.source_path(), "/data/a:b.txt");
        insta::assert_snapshot!(doc_id, @"00000000-0000-0000-0000-000000000000:/data/a:b.txt");
    }

    #[test]
    fn fully_synced_respects_skip_graph() {
        let now = OffsetDateTime::now_utc();
        let state = DocumentState {
            doc_id: DocId::new(Uuid::nil(), "/a"),
            config_id: Uuid::nil(),
            source_path: "/a".into(),
            source_id: None,
            ordinal: 1,
            content_hash: "00".into(),
            modified_timestamp: None,
            vector_synced_at: Some(now),
            search_synced_at: Some(now),
            graph_synced_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!state.is_fully_synced(TargetSet::ALL));
        assert!(state.is_fully_synced(TargetSet { graph: false }));
        assert!(state.missing_targets(TargetSet::ALL).any());
        assert!(!state.missing_targets(TargetSet { graph: false }).any());
    }
}
