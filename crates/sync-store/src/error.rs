use sync_types::ConfigId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Datasource configuration `{0}` not found.")]
    ConfigNotFound(ConfigId),
    #[error("Invalid refresh interval `{0}`: must be at least one second.")]
    InvalidRefreshInterval(u64),
    #[error("The store was written by version {}.{}.{} but this is version {}.{}.{}.",
        .store.0, .store.1, .store.2, .binary.0, .binary.1, .binary.2)]
    VersionMismatch { store: (u32, u32, u32), binary: (u32, u32, u32) },
    #[error("Corrupted sync store: index entry without a matching row.")]
    CorruptedStore,

    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Callers retry transient failures with backoff; everything else is
    /// surfaced to the supervisor, which disables the config.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Heed(heed::Error::Io(_)) => true,
            Error::ConfigNotFound(_)
            | Error::InvalidRefreshInterval(_)
            | Error::VersionMismatch { .. }
            | Error::CorruptedStore
            | Error::Heed(_) => false,
        }
    }
}
