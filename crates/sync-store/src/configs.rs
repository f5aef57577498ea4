use sync_types::{ConfigId, DatasourceConfig, Ordinal, SyncStatus};
use time::OffsetDateTime;

use crate::{Error, Result, SyncStore};

/// Partial status update written by the engine at the start and end of each
/// sync pass. `None` fields are left untouched; `error: Some(None)` clears a
/// previously recorded error.
#[derive(Debug, Default)]
pub struct StatusUpdate {
    pub status: Option<SyncStatus>,
    pub ordinal: Option<Ordinal>,
    pub completed_at: Option<OffsetDateTime>,
    pub error: Option<Option<String>>,
}

impl SyncStore {
    /// Every configuration the supervisor must be running an engine for.
    pub fn list_active_configs(&self) -> Result<Vec<DatasourceConfig>> {
        let rtxn = self.env.read_txn()?;
        let mut configs = Vec::new();
        for entry in self.active_configs.iter(&rtxn)? {
            let (config_id, ()) = entry?;
            let config = self.configs.get(&rtxn, config_id)?.ok_or(Error::CorruptedStore)?;
            configs.push(config);
        }
        Ok(configs)
    }

    pub fn list_configs(&self) -> Result<Vec<DatasourceConfig>> {
        let rtxn = self.env.read_txn()?;
        let mut configs = Vec::new();
        for entry in self.configs.iter(&rtxn)? {
            let (_, config) = entry?;
            configs.push(config);
        }
        Ok(configs)
    }

    pub fn get_config(&self, config_id: ConfigId) -> Result<DatasourceConfig> {
        let rtxn = self.env.read_txn()?;
        self.configs
            .get(&rtxn, &config_id.to_string())?
            .ok_or(Error::ConfigNotFound(config_id))
    }

    /// Insert or replace a configuration, refreshing `updated_at` and the
    /// active-membership index.
    pub fn upsert_config(&self, config: &DatasourceConfig) -> Result<ConfigId> {
        if config.refresh_interval_seconds < 1 {
            return Err(Error::InvalidRefreshInterval(config.refresh_interval_seconds));
        }

        let mut wtxn = self.env.write_txn()?;
        let key = config.config_id.to_string();
        let mut config = config.clone();
        config.updated_at = OffsetDateTime::now_utc();
        self.configs.put(&mut wtxn, &key, &config)?;
        if config.is_active {
            self.active_configs.put(&mut wtxn, &key, &())?;
        } else {
            self.active_configs.delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;
        Ok(config.config_id)
    }

    /// Atomic partial update of the mutable status fields. The high-water
    /// ordinal never decreases, whatever the caller passes.
    pub fn update_config_status(
        &self,
        config_id: ConfigId,
        update: StatusUpdate,
    ) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let key = config_id.to_string();
        let mut config =
            self.configs.get(&wtxn, &key)?.ok_or(Error::ConfigNotFound(config_id))?;

        if let Some(status) = update.status {
            config.sync_status = status;
        }
        if let Some(ordinal) = update.ordinal {
            config.last_sync_ordinal =
                Some(config.last_sync_ordinal.map_or(ordinal, |prev| prev.max(ordinal)));
        }
        if let Some(completed_at) = update.completed_at {
            config.last_sync_completed_at = Some(completed_at);
        }
        if let Some(error) = update.error {
            config.last_error = error;
        }
        config.updated_at = OffsetDateTime::now_utc();

        self.configs.put(&mut wtxn, &key, &config)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Remove the configuration row. Monitoring stops but already-indexed
    /// documents are retained; see [`SyncStore::purge_document_states`] for
    /// explicit cleanup.
    pub fn delete_config(&self, config_id: ConfigId) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let key = config_id.to_string();
        if !self.configs.delete(&mut wtxn, &key)? {
            return Err(Error::ConfigNotFound(config_id));
        }
        self.active_configs.delete(&mut wtxn, &key)?;
        wtxn.commit()?;
        Ok(())
    }
}
