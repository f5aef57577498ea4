use change_detection::{DetectorError, LoadError};
use sync_types::ConfigId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] sync_store::Error),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error("reconciliation pass failed: {0}")]
    Pass(String),
    #[error("no running engine for configuration `{0}`")]
    NotRunning(ConfigId),
    #[error("the engine is shutting down")]
    ShuttingDown,
}

impl Error {
    /// A fatal error stops the engine and flips the config to
    /// `sync_status = error`; anything else is retried on a later pass.
    pub fn is_fatal_for_source(&self) -> bool {
        match self {
            Error::Store(err) => !err.is_transient(),
            Error::Detector(err) => !err.is_transient(),
            Error::Pass(_) | Error::NotRunning(_) | Error::ShuttingDown => false,
        }
    }
}

/// Failure of one document's apply. Never stops the engine; recorded on the
/// config row and resolved by a later pass (or, for rejected documents, by a
/// content change).
#[derive(Error, Debug)]
pub(crate) enum ApplyError {
    #[error("load failed: {0}")]
    Load(String),
    #[error("document rejected by the processor: {0}")]
    Rejected(String),
    #[error("processing failed: {0}")]
    Process(String),
    #[error("{0}")]
    Writers(String),
    #[error(transparent)]
    Store(#[from] sync_store::Error),
}

impl From<LoadError> for ApplyError {
    fn from(err: LoadError) -> Self {
        ApplyError::Load(err.to_string())
    }
}
