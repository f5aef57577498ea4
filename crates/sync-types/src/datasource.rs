use core::fmt;
use std::fmt::Display;
use std::str::FromStr;

use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::Ordinal;

pub type ConfigId = Uuid;

/// One row per monitored source. Created by the ingestion flow or the admin
/// facade, mutated by the engine (status, ordinal, error) and by admin
/// updates, deleted explicitly. Deleting a config stops monitoring but does
/// not remove already-indexed documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceConfig {
    pub config_id: ConfigId,
    /// Tenant/namespace tag.
    pub project_id: String,
    pub source_type: SourceType,
    /// Human label.
    pub source_name: String,
    /// Opaque structured bag, interpreted only by the matching detector.
    pub connection_params: serde_json::Value,
    /// Periodic reconciliation cadence, at least one second.
    pub refresh_interval_seconds: u64,
    /// Whether to attempt event-driven mode at all.
    pub enable_change_stream: bool,
    /// When true the graph writer is bypassed on apply.
    pub skip_graph: bool,
    /// True means the supervisor must be running an engine for this config.
    pub is_active: bool,
    pub sync_status: SyncStatus,
    /// High-water mark of processed ordinals; never decreases.
    pub last_sync_ordinal: Option<Ordinal>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync_completed_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl DatasourceConfig {
    pub fn new(
        project_id: String,
        source_type: SourceType,
        source_name: String,
        connection_params: serde_json::Value,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            config_id: Uuid::new_v4(),
            project_id,
            source_type,
            source_name,
            connection_params,
            refresh_interval_seconds: 300,
            enable_change_stream: true,
            skip_graph: false,
            is_active: true,
            sync_status: SyncStatus::Idle,
            last_sync_ordinal: None,
            last_sync_completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The writer targets this config applies to.
    pub fn targets(&self) -> crate::TargetSet {
        crate::TargetSet { graph: !self.skip_graph }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Sequence)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Filesystem,
    S3,
    AzureBlob,
    Gcs,
    GoogleDrive,
    Alfresco,
    Box,
    Msgraph,
}

impl Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filesystem => write!(f, "filesystem"),
            Self::S3 => write!(f, "s3"),
            Self::AzureBlob => write!(f, "azure_blob"),
            Self::Gcs => write!(f, "gcs"),
            Self::GoogleDrive => write!(f, "google_drive"),
            Self::Alfresco => write!(f, "alfresco"),
            Self::Box => write!(f, "box"),
            Self::Msgraph => write!(f, "msgraph"),
        }
    }
}

impl FromStr for SourceType {
    type Err = ParseSourceTypeError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        if source.eq_ignore_ascii_case("filesystem") {
            Ok(Self::Filesystem)
        } else if source.eq_ignore_ascii_case("s3") {
            Ok(Self::S3)
        } else if source.eq_ignore_ascii_case("azure_blob") {
            Ok(Self::AzureBlob)
        } else if source.eq_ignore_ascii_case("gcs") {
            Ok(Self::Gcs)
        } else if source.eq_ignore_ascii_case("google_drive") {
            Ok(Self::GoogleDrive)
        } else if source.eq_ignore_ascii_case("alfresco") {
            Ok(Self::Alfresco)
        } else if source.eq_ignore_ascii_case("box") {
            Ok(Self::Box)
        } else if source.eq_ignore_ascii_case("msgraph") {
            Ok(Self::Msgraph)
        } else {
            Err(ParseSourceTypeError(source.to_owned()))
        }
    }
}

#[derive(Debug)]
pub struct ParseSourceTypeError(pub String);
impl fmt::Display for ParseSourceTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` is not a valid source type. Available source types are {}.",
            self.0,
            enum_iterator::all::<SourceType>()
                .map(|s| format!("`{s}`"))
                .collect::<Vec<String>>()
                .join(", ")
        )
    }
}
impl std::error::Error for ParseSourceTypeError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Sequence)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl FromStr for SyncStatus {
    type Err = ParseSyncStatusError;

    fn from_str(status: &str) -> Result<Self, Self::Err> {
        if status.eq_ignore_ascii_case("idle") {
            Ok(Self::Idle)
        } else if status.eq_ignore_ascii_case("syncing") {
            Ok(Self::Syncing)
        } else if status.eq_ignore_ascii_case("error") {
            Ok(Self::Error)
        } else {
            Err(ParseSyncStatusError(status.to_owned()))
        }
    }
}

#[derive(Debug)]
pub struct ParseSyncStatusError(pub String);
impl fmt::Display for ParseSyncStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` is not a valid sync status. Available statuses are {}.",
            self.0,
            enum_iterator::all::<SyncStatus>()
                .map(|s| format!("`{s}`"))
                .collect::<Vec<String>>()
                .join(", ")
        )
    }
}
impl std::error::Error for ParseSyncStatusError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_round_trips_through_display() {
        for source in enum_iterator::all::<SourceType>() {
            let parsed: SourceType = source.to_string().parse().unwrap();
            assert_eq!(parsed, source);
        }
    }

    #[test]
    fn unknown_source_type_names_the_candidates() {
        let err = "dropbox".parse::<SourceType>().unwrap_err();
        insta::assert_snapshot!(err, @"`dropbox` is not a valid source type. Available source types are `filesystem`, `s3`, `azure_blob`, `gcs`, `google_drive`, `alfresco`, `box`, `msgraph`.");
    }

    #[test]
    fn sync_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SyncStatus::Syncing).unwrap(), r#""syncing""#);
        assert_eq!(serde_json::from_str::<SyncStatus>(r#""idle""#).unwrap(), SyncStatus::Idle);
    }
}
