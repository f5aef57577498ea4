/*!
This crate owns the run loops of the incremental update core:

1. One [`SyncEngine`] per active datasource converts the detector's event
   stream and the periodic reconciliation into ordered, idempotent applies
   against the vector, search, and graph writers, committing every outcome
   to the state store.
2. The [`AutoSync`] supervisor launches, monitors, and reconfigures one
   engine + detector pair per active configuration, and is the process-wide
   control surface (sync-now, reload, enable/disable, shutdown).

Engines never talk to each other; the state store is the only shared
mutable resource, and failures never cross a datasource boundary.
*/

pub mod error;

mod engine;

#[cfg(test)]
mod test;
#[cfg(test)]
mod test_utils;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use change_detection::{ChangeDetector, DetectorError, DetectorFactory};
use sync_store::{StatusUpdate, SyncStore};
use sync_types::{
    ConfigId, DatasourceConfig, DocumentProcessor, GraphWriter, SearchWriter, SyncStatus,
    VectorWriter,
};
use tokio::task::JoinHandle;

pub use crate::engine::{EngineOptions, SyncEngine};
pub use crate::error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The three index writer clients, keyed by `doc_id` and idempotent. The
/// engine treats payload parts as opaque and never two-phase commits across
/// them.
#[derive(Clone)]
pub struct IndexWriters {
    pub vector: Arc<dyn VectorWriter>,
    pub search: Arc<dyn SearchWriter>,
    pub graph: Arc<dyn GraphWriter>,
}

/// Where detectors come from. Production wires [`DetectorFactory`]; tests
/// substitute scripted detectors.
#[async_trait]
pub trait DetectorProvider: Send + Sync {
    async fn build(
        &self,
        config: &DatasourceConfig,
    ) -> Result<Arc<dyn ChangeDetector>, DetectorError>;
}

#[async_trait]
impl DetectorProvider for DetectorFactory {
    async fn build(
        &self,
        config: &DatasourceConfig,
    ) -> Result<Arc<dyn ChangeDetector>, DetectorError> {
        DetectorFactory::build(self, config).await
    }
}

struct SourceHandle {
    detector: Arc<dyn ChangeDetector>,
    engine: SyncEngine,
    /// Tears the source down when the engine raises its fatal signal.
    monitor: JoinHandle<()>,
}

/// Process-wide supervisor: owns the `config_id -> (detector, engine)` map
/// and is the sole writer of `sync_status = error`.
pub struct AutoSync {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    store: SyncStore,
    provider: Arc<dyn DetectorProvider>,
    processor: Arc<dyn DocumentProcessor>,
    writers: IndexWriters,
    options: EngineOptions,
    sources: tokio::sync::Mutex<HashMap<ConfigId, SourceHandle>>,
}

impl AutoSync {
    pub fn new(
        store: SyncStore,
        provider: Arc<dyn DetectorProvider>,
        processor: Arc<dyn DocumentProcessor>,
        writers: IndexWriters,
        options: EngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                store,
                provider,
                processor,
                writers,
                options,
                sources: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Launch an engine + detector pair for every active configuration. A
    /// source that fails to launch is marked `error` and skipped; the
    /// others keep going.
    pub async fn start(&self) -> Result<()> {
        for config in self.inner.store.list_active_configs()? {
            let config_id = config.config_id;
            if let Err(err) = self.inner.launch(config).await {
                self.inner.mark_source_error(config_id, &err.to_string());
            }
        }
        Ok(())
    }

    /// Run one immediate reconciliation pass; returns when it completes.
    pub async fn sync_now(&self, config_id: ConfigId) -> Result<()> {
        let engine = {
            let sources = self.inner.sources.lock().await;
            sources
                .get(&config_id)
                .map(|handle| handle.engine.clone_handle())
                .ok_or(Error::NotRunning(config_id))?
        };
        engine.sync_now().await
    }

    pub async fn sync_now_all(&self) -> Vec<(ConfigId, Result<()>)> {
        let engines: Vec<(ConfigId, SyncEngine)> = {
            let sources = self.inner.sources.lock().await;
            sources
                .iter()
                .map(|(config_id, handle)| (*config_id, handle.engine.clone_handle()))
                .collect()
        };
        let mut outcomes = Vec::with_capacity(engines.len());
        for (config_id, engine) in engines {
            outcomes.push((config_id, engine.sync_now().await));
        }
        outcomes
    }

    /// Rebuild the detector + engine of a config with fresh parameters.
    pub async fn reload(&self, config_id: ConfigId) -> Result<()> {
        self.inner.halt(config_id).await;
        let config = self.inner.store.get_config(config_id)?;
        if !config.is_active {
            return Ok(());
        }
        match self.inner.launch(config).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.mark_source_error(config_id, &err.to_string());
                Err(err)
            }
        }
    }

    /// Mark a config active and launch it.
    pub async fn enable(&self, config_id: ConfigId) -> Result<()> {
        let mut config = self.inner.store.get_config(config_id)?;
        if !config.is_active {
            config.is_active = true;
            self.inner.store.upsert_config(&config)?;
        }
        match self.inner.launch(config).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.mark_source_error(config_id, &err.to_string());
                Err(err)
            }
        }
    }

    /// Stop a config's engine and mark it inactive.
    pub async fn disable(&self, config_id: ConfigId) -> Result<()> {
        self.inner.halt(config_id).await;
        let mut config = self.inner.store.get_config(config_id)?;
        if config.is_active {
            config.is_active = false;
            self.inner.store.upsert_config(&config)?;
        }
        Ok(())
    }

    /// Engines drain and stop first, then their detectors.
    pub async fn shutdown(&self) {
        let handles: Vec<SourceHandle> = {
            let mut sources = self.inner.sources.lock().await;
            sources.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.monitor.abort();
            handle.engine.stop().await;
        }
        for handle in &handles {
            handle.detector.stop().await;
        }
    }

    pub async fn is_running(&self, config_id: ConfigId) -> bool {
        self.inner.sources.lock().await.contains_key(&config_id)
    }

    // ------- admin facade: mirrors the state store one-to-one -------

    pub fn list_configs(&self) -> Result<Vec<DatasourceConfig>> {
        Ok(self.inner.store.list_configs()?)
    }

    pub fn get_config(&self, config_id: ConfigId) -> Result<DatasourceConfig> {
        Ok(self.inner.store.get_config(config_id)?)
    }

    /// Create or update a configuration and converge the running state with
    /// its `is_active` flag.
    pub async fn upsert_config(&self, config: &DatasourceConfig) -> Result<ConfigId> {
        let config_id = self.inner.store.upsert_config(config)?;
        if config.is_active {
            self.reload(config_id).await?;
        } else {
            self.inner.halt(config_id).await;
        }
        Ok(config_id)
    }

    /// Delete the configuration row. Monitoring stops; indexed documents
    /// are left in place.
    pub async fn delete_config(&self, config_id: ConfigId) -> Result<()> {
        self.inner.halt(config_id).await;
        self.inner.store.delete_config(config_id)?;
        Ok(())
    }
}

impl SupervisorInner {
    async fn launch(self: &Arc<Self>, config: DatasourceConfig) -> Result<()> {
        let mut sources = self.sources.lock().await;
        if sources.contains_key(&config.config_id) {
            // one engine per config, never two
            return Ok(());
        }
        let detector = self.provider.build(&config).await?;
        detector.start().await?;
        let engine = SyncEngine::new(
            &config,
            self.store.clone(),
            detector.clone(),
            self.processor.clone(),
            self.writers.clone(),
            self.options.clone(),
        );
        engine.start();

        let monitor = {
            let supervisor = self.clone();
            let config_id = config.config_id;
            let mut fatal_rx = engine.fatal_signal();
            tokio::spawn(async move {
                if fatal_rx.changed().await.is_ok() {
                    let reason = fatal_rx.borrow().clone();
                    if let Some(reason) = reason {
                        supervisor.teardown_failed(config_id, reason).await;
                    }
                }
            })
        };

        sources.insert(config.config_id, SourceHandle { detector, engine, monitor });
        tracing::info!(config_id = %config.config_id, source = %config.source_type,
            name = %config.source_name, "datasource engine started");
        Ok(())
    }

    /// Stop and forget one source. The config row keeps its state; the
    /// engine drains to a safe point first.
    async fn halt(&self, config_id: ConfigId) -> Option<()> {
        let handle = self.sources.lock().await.remove(&config_id)?;
        handle.monitor.abort();
        handle.engine.stop().await;
        handle.detector.stop().await;
        tracing::info!(config_id = %config_id, "datasource engine stopped");
        Some(())
    }

    /// Reaction to an engine's fatal signal: stop the pair, record the
    /// failure, do not restart.
    async fn teardown_failed(&self, config_id: ConfigId, reason: String) {
        if let Some(handle) = self.sources.lock().await.remove(&config_id) {
            handle.engine.stop().await;
            handle.detector.stop().await;
        }
        self.mark_source_error(config_id, &reason);
    }

    fn mark_source_error(&self, config_id: ConfigId, reason: &str) {
        tracing::error!(config_id = %config_id, reason, "datasource failed fatally");
        if let Err(store_err) = self.store.update_config_status(
            config_id,
            StatusUpdate {
                status: Some(SyncStatus::Error),
                error: Some(Some(reason.to_owned())),
                ..Default::default()
            },
        ) {
            tracing::error!(%store_err, "could not record the source failure");
        }
    }
}
