//! Supervisor scenarios: per-source lifecycle, cross-source isolation, and
//! the admin facade.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use change_detection::{ChangeDetector, DetectorError};
use sync_store::{SyncStore, SyncStoreOptions};
use sync_types::{DatasourceConfig, SyncStatus};
use tempfile::TempDir;

use crate::test_utils::{
    filesystem_config, wait_until, FailingProvider, FixedProvider, ScriptedDetector,
    ScriptedProcessor, SpyWriter,
};
use crate::{AutoSync, DetectorProvider, EngineOptions, Error, IndexWriters};

struct SupervisorHarness {
    store: SyncStore,
    supervisor: AutoSync,
    detector: Arc<ScriptedDetector>,
    vector: Arc<SpyWriter>,
    _tempdir: TempDir,
}

fn open_store(tempdir: &TempDir) -> SyncStore {
    SyncStore::open(SyncStoreOptions { path: tempdir.path(), map_size: 20 * 1024 * 1024 })
        .unwrap()
}

fn supervisor_with(
    store: SyncStore,
    provider: Arc<dyn DetectorProvider>,
    vector: Arc<SpyWriter>,
) -> AutoSync {
    let writers = IndexWriters {
        vector: vector.clone(),
        search: SpyWriter::new(),
        graph: SpyWriter::new(),
    };
    AutoSync::new(
        store,
        provider,
        Arc::new(ScriptedProcessor),
        writers,
        EngineOptions {
            in_pass_retry_budget: Duration::ZERO,
            ..EngineOptions::default()
        },
    )
}

impl SupervisorHarness {
    fn new(config: &DatasourceConfig) -> Self {
        let tempdir = TempDir::new().unwrap();
        let store = open_store(&tempdir);
        store.upsert_config(config).unwrap();
        let detector = ScriptedDetector::new();
        let vector = SpyWriter::new();
        let supervisor = supervisor_with(
            store.clone(),
            Arc::new(FixedProvider(detector.clone())),
            vector.clone(),
        );
        Self { store, supervisor, detector, vector, _tempdir: tempdir }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_launches_active_configs_and_sync_now_applies() {
    let config = filesystem_config();
    let harness = SupervisorHarness::new(&config);
    harness.detector.put_file("/data/a.txt", b"hello");

    harness.supervisor.start().await.unwrap();
    assert!(harness.supervisor.is_running(config.config_id).await);

    harness.supervisor.sync_now(config.config_id).await.unwrap();
    let doc_id = sync_types::DocId::new(config.config_id, "/data/a.txt");
    assert_eq!(harness.vector.upsert_count(doc_id.as_str()), 1);

    harness.supervisor.shutdown().await;
    assert!(!harness.supervisor.is_running(config.config_id).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn inactive_configs_are_not_launched() {
    let mut config = filesystem_config();
    config.is_active = false;
    let harness = SupervisorHarness::new(&config);

    harness.supervisor.start().await.unwrap();
    assert!(!harness.supervisor.is_running(config.config_id).await);
    assert!(matches!(
        harness.supervisor.sync_now(config.config_id).await,
        Err(Error::NotRunning(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn disable_stops_the_engine_and_enable_restarts_it() {
    let config = filesystem_config();
    let harness = SupervisorHarness::new(&config);
    harness.supervisor.start().await.unwrap();

    harness.supervisor.disable(config.config_id).await.unwrap();
    assert!(!harness.supervisor.is_running(config.config_id).await);
    assert!(!harness.store.get_config(config.config_id).unwrap().is_active);

    harness.supervisor.enable(config.config_id).await.unwrap();
    assert!(harness.supervisor.is_running(config.config_id).await);
    assert!(harness.store.get_config(config.config_id).unwrap().is_active);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_fatal_source_is_marked_error_without_touching_its_neighbors() {
    let tempdir = TempDir::new().unwrap();
    let store = open_store(&tempdir);

    let healthy = filesystem_config();
    let mut broken = filesystem_config();
    broken.source_name = "broken".into();
    store.upsert_config(&healthy).unwrap();
    store.upsert_config(&broken).unwrap();

    // the provider fails only the broken config
    struct SplitProvider {
        healthy: Arc<ScriptedDetector>,
        broken_name: String,
    }
    #[async_trait]
    impl DetectorProvider for SplitProvider {
        async fn build(
            &self,
            config: &DatasourceConfig,
        ) -> Result<Arc<dyn ChangeDetector>, DetectorError> {
            if config.source_name == self.broken_name {
                Err(DetectorError::Auth("credentials rejected".into()))
            } else {
                Ok(self.healthy.clone())
            }
        }
    }

    let detector = ScriptedDetector::new();
    detector.put_file("/data/a.txt", b"hello");
    let vector = SpyWriter::new();
    let supervisor = supervisor_with(
        store.clone(),
        Arc::new(SplitProvider { healthy: detector.clone(), broken_name: "broken".into() }),
        vector.clone(),
    );

    supervisor.start().await.unwrap();

    assert!(supervisor.is_running(healthy.config_id).await);
    assert!(!supervisor.is_running(broken.config_id).await);
    let broken_row = store.get_config(broken.config_id).unwrap();
    assert_eq!(broken_row.sync_status, SyncStatus::Error);
    assert!(broken_row.last_error.is_some());

    // the healthy source still progresses
    supervisor.sync_now(healthy.config_id).await.unwrap();
    let doc_id = sync_types::DocId::new(healthy.config_id, "/data/a.txt");
    assert_eq!(vector.upsert_count(doc_id.as_str()), 1);

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_startup_marks_every_config_but_start_succeeds() {
    let config = filesystem_config();
    let tempdir = TempDir::new().unwrap();
    let store = open_store(&tempdir);
    store.upsert_config(&config).unwrap();
    let supervisor =
        supervisor_with(store.clone(), Arc::new(FailingProvider), SpyWriter::new());

    supervisor.start().await.unwrap();

    assert!(!supervisor.is_running(config.config_id).await);
    assert_eq!(store.get_config(config.config_id).unwrap().sync_status, SyncStatus::Error);
}

#[tokio::test(flavor = "multi_thread")]
async fn upsert_config_hot_reloads_and_delete_config_stops() {
    let config = filesystem_config();
    let harness = SupervisorHarness::new(&config);
    harness.supervisor.start().await.unwrap();

    let mut updated = harness.store.get_config(config.config_id).unwrap();
    updated.refresh_interval_seconds = 7200;
    harness.supervisor.upsert_config(&updated).await.unwrap();
    assert!(harness.supervisor.is_running(config.config_id).await);
    assert_eq!(
        harness.store.get_config(config.config_id).unwrap().refresh_interval_seconds,
        7200
    );

    harness.supervisor.delete_config(config.config_id).await.unwrap();
    assert!(!harness.supervisor.is_running(config.config_id).await);
    assert!(matches!(
        harness.supervisor.get_config(config.config_id),
        Err(Error::Store(sync_store::Error::ConfigNotFound(_)))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn a_fatal_pass_tears_the_engine_down_and_marks_the_config() {
    let config = filesystem_config();
    let harness = SupervisorHarness::new(&config);
    harness.supervisor.start().await.unwrap();

    harness.detector.fail_listings();
    assert!(matches!(
        harness.supervisor.sync_now(config.config_id).await,
        Err(Error::Pass(_))
    ));

    assert!(
        wait_until(
            || {
                harness.store.get_config(config.config_id).unwrap().sync_status
                    == SyncStatus::Error
            },
            Duration::from_secs(15),
        )
        .await,
        "the supervisor never recorded the fatal failure"
    );
    assert!(!harness.supervisor.is_running(config.config_id).await);
    let row = harness.store.get_config(config.config_id).unwrap();
    assert!(row.last_error.as_deref().unwrap_or_default().contains("credentials revoked"));
}

#[tokio::test(flavor = "multi_thread")]
async fn periodic_reconciliation_fires_without_events() {
    let mut config = filesystem_config();
    config.refresh_interval_seconds = 1;
    let harness = SupervisorHarness::new(&config);
    harness.supervisor.start().await.unwrap();

    harness.detector.put_file("/data/late.txt", b"late");
    let doc_id = sync_types::DocId::new(config.config_id, "/data/late.txt");
    assert!(
        wait_until(
            || harness.vector.upsert_count(doc_id.as_str()) == 1,
            Duration::from_secs(15),
        )
        .await,
        "the periodic reconciler never picked the file up"
    );
    harness.supervisor.shutdown().await;
}
