//! Durable, transactional home of datasource configurations and per-document
//! sync state, on LMDB.
//!
//! Every mutation of a single document goes through [`SyncStore::commit_apply`]
//! or [`SyncStore::commit_delete`], which are serialized by the environment's
//! single write transaction. Engine read-check-write decisions therefore see a
//! consistent row or none at all.

pub mod error;
mod ordinal;

mod configs;
mod documents;

#[cfg(test)]
mod test;

use std::path::Path;

use heed::types::{SerdeJson, Str, Unit, U64};
use heed::byteorder::BE;
use heed::{Database, Env, EnvOpenOptions, RoTxn, WithoutTls};
use sync_types::{DatasourceConfig, DocumentState};

pub use crate::configs::StatusUpdate;
pub use crate::documents::{CommitApply, TargetOutcomes};
pub use crate::error::Error;
pub use crate::ordinal::OrdinalKeyCodec;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The number of databases in the store environment.
const NUMBER_OF_DATABASES: u32 = 7;

mod db_name {
    pub const VERSION: &str = "version";
    pub const CONFIGS: &str = "datasource-configs";
    pub const ACTIVE_CONFIGS: &str = "active-configs";
    pub const DOCUMENTS: &str = "document-states";
    pub const SOURCE_IDS: &str = "source-id-index";
    pub const ORDINALS: &str = "ordinal-index";
    pub const LAST_ORDINALS: &str = "last-ordinals";
}

mod entry_name {
    pub const MAIN: &str = "main";
}

#[derive(Debug)]
pub struct SyncStoreOptions<'a> {
    /// Directory holding the LMDB environment.
    pub path: &'a Path,
    /// Map size in bytes.
    pub map_size: usize,
}

/// The state store. Cheap to clone; all clones share the same environment.
#[derive(Clone)]
pub struct SyncStore {
    pub(crate) env: Env<WithoutTls>,

    /// Schema version of the store, checked on open.
    version: Database<Str, SerdeJson<(u32, u32, u32)>>,
    /// All datasource configurations, keyed by config id.
    pub(crate) configs: Database<Str, SerdeJson<DatasourceConfig>>,
    /// Membership database of the active config ids.
    pub(crate) active_configs: Database<Str, Unit>,
    /// All document states, keyed by doc id. Doc ids start with
    /// `{config_id}:`, so a prefix scan is the per-config enumeration.
    pub(crate) documents: Database<Str, SerdeJson<DocumentState>>,
    /// `{config_id}:{source_id}` -> doc id.
    pub(crate) source_ids: Database<Str, Str>,
    /// `(config_id, ordinal)` -> doc id, in ordinal order per config.
    pub(crate) ordinals: Database<OrdinalKeyCodec, Str>,
    /// Last ordinal allocated per config id.
    pub(crate) last_ordinals: Database<Str, U64<BE>>,
}

impl SyncStore {
    pub fn open(options: SyncStoreOptions) -> Result<Self> {
        std::fs::create_dir_all(options.path)?;

        let env = unsafe {
            let env_options = EnvOpenOptions::new();
            let mut env_options = env_options.read_txn_without_tls();
            env_options.max_dbs(NUMBER_OF_DATABASES).map_size(options.map_size).open(options.path)
        }?;

        let mut wtxn = env.write_txn()?;
        let version = env.create_database(&mut wtxn, Some(db_name::VERSION))?;
        let configs = env.create_database(&mut wtxn, Some(db_name::CONFIGS))?;
        let active_configs = env.create_database(&mut wtxn, Some(db_name::ACTIVE_CONFIGS))?;
        let documents = env.create_database(&mut wtxn, Some(db_name::DOCUMENTS))?;
        let source_ids = env.create_database(&mut wtxn, Some(db_name::SOURCE_IDS))?;
        let ordinals = env.create_database(&mut wtxn, Some(db_name::ORDINALS))?;
        let last_ordinals = env.create_database(&mut wtxn, Some(db_name::LAST_ORDINALS))?;

        let this = Self {
            env: env.clone(),
            version,
            configs,
            active_configs,
            documents,
            source_ids,
            ordinals,
            last_ordinals,
        };
        this.check_version(&mut wtxn)?;
        wtxn.commit()?;

        Ok(this)
    }

    fn check_version(&self, wtxn: &mut heed::RwTxn) -> Result<()> {
        let binary = binary_version();
        match self.version.get(wtxn, entry_name::MAIN)? {
            Some(store) if store.0 != binary.0 => {
                Err(Error::VersionMismatch { store, binary })
            }
            Some(_) => Ok(()),
            None => {
                tracing::info!(
                    version = format!("{}.{}.{}", binary.0, binary.1, binary.2),
                    "initializing a fresh sync store"
                );
                self.version.put(wtxn, entry_name::MAIN, &binary)?;
                Ok(())
            }
        }
    }

    /// Return `Ok(())` if the store is able to read one of its databases.
    pub fn health(&self) -> Result<()> {
        let rtxn = self.env.read_txn()?;
        self.configs.first(&rtxn)?;
        Ok(())
    }

    /// A read transaction, for the lazy enumeration entry points.
    pub fn read_txn(&self) -> Result<RoTxn<'_, WithoutTls>> {
        self.env.read_txn().map_err(Error::from)
    }
}

fn binary_version() -> (u32, u32, u32) {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap();
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap();
    let patch = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap();
    (major, minor, patch)
}
