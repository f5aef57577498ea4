use std::sync::Arc;

use sync_types::{DatasourceConfig, SourceType};

use crate::alfresco::{AlfrescoDetector, AlfrescoParams};
use crate::azure_blob::{AzureBlobDetector, AzureBlobParams};
use crate::box_source::{BoxDetector, BoxParams};
use crate::filesystem::{FilesystemDetector, FilesystemParams};
use crate::gcs::{GcsDetector, GcsParams};
use crate::google_drive::{GoogleDriveDetector, GoogleDriveParams};
use crate::msgraph::{MsgraphDetector, MsgraphParams};
use crate::s3::{S3Detector, S3Params};
use crate::{ChangeDetector, DetectorError, Result};

/// Maps `(source_type, connection_params)` onto a live detector. The only
/// component that touches the per-source SDKs; the engine and supervisor
/// stay source-agnostic behind [`ChangeDetector`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DetectorFactory;

impl DetectorFactory {
    pub fn new() -> Self {
        Self
    }

    pub async fn build(
        &self,
        config: &DatasourceConfig,
    ) -> Result<Arc<dyn ChangeDetector>> {
        let events_enabled = config.enable_change_stream;
        let detector: Arc<dyn ChangeDetector> = match config.source_type {
            SourceType::Filesystem => {
                let params: FilesystemParams = parse_params(config)?;
                Arc::new(FilesystemDetector::new(params, events_enabled)?)
            }
            SourceType::S3 => {
                let params: S3Params = parse_params(config)?;
                Arc::new(S3Detector::new(params, events_enabled)?)
            }
            SourceType::AzureBlob => {
                let params: AzureBlobParams = parse_params(config)?;
                Arc::new(AzureBlobDetector::new(params, events_enabled)?)
            }
            SourceType::Gcs => {
                let params: GcsParams = parse_params(config)?;
                Arc::new(GcsDetector::new(params, events_enabled).await?)
            }
            SourceType::GoogleDrive => {
                let params: GoogleDriveParams = parse_params(config)?;
                Arc::new(GoogleDriveDetector::new(params, events_enabled).await?)
            }
            SourceType::Alfresco => {
                let params: AlfrescoParams = parse_params(config)?;
                Arc::new(AlfrescoDetector::new(params, events_enabled)?)
            }
            SourceType::Box => {
                let params: BoxParams = parse_params(config)?;
                Arc::new(BoxDetector::new(params, events_enabled)?)
            }
            SourceType::Msgraph => {
                let params: MsgraphParams = parse_params(config)?;
                Arc::new(MsgraphDetector::new(params, events_enabled)?)
            }
        };
        Ok(detector)
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(config: &DatasourceConfig) -> Result<T> {
    serde_json::from_value(config.connection_params.clone()).map_err(|err| {
        DetectorError::Misconfigured(format!(
            "invalid {} connection params: {err}",
            config.source_type
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(source_type: SourceType, params: serde_json::Value) -> DatasourceConfig {
        DatasourceConfig::new("default".into(), source_type, "test".into(), params)
    }

    #[tokio::test]
    async fn filesystem_configs_build() {
        let factory = DetectorFactory::new();
        let config = config(
            SourceType::Filesystem,
            serde_json::json!({ "paths": ["/tmp/watched"], "quietPeriodSeconds": 5 }),
        );
        assert!(factory.build(&config).await.is_ok());
    }

    #[tokio::test]
    async fn missing_required_fields_are_misconfigurations() {
        let factory = DetectorFactory::new();
        let config = config(SourceType::S3, serde_json::json!({ "prefix": "inbox/" }));
        let err = match factory.build(&config).await {
            Ok(_) => panic!("expected build to fail"),
            Err(err) => err,
        };
        match err {
            DetectorError::Misconfigured(message) => {
                assert!(message.contains("invalid s3 connection params"), "{message}");
            }
            other => panic!("expected a misconfiguration, got {other}"),
        }
    }

    #[tokio::test]
    async fn empty_filesystem_paths_are_rejected() {
        let factory = DetectorFactory::new();
        let config = config(SourceType::Filesystem, serde_json::json!({ "paths": [] }));
        assert!(matches!(
            factory.build(&config).await,
            Err(DetectorError::Misconfigured(_))
        ));
    }
}
