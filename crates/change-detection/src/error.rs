use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectorError {
    /// The connection parameters cannot describe a working source; surfaced
    /// by the factory or at `start`, never retried.
    #[error("misconfigured source: {0}")]
    Misconfigured(String),
    /// Authentication or permission was refused; fatal for the source.
    #[error("source authentication failed: {0}")]
    Auth(String),
    /// Network blip, rate limit, server hiccup: retried internally with
    /// bounded backoff, surfaced only if the retry budget is exhausted.
    #[error("transient source failure: {0}")]
    Transient(String),
    /// The source answered with something the detector cannot interpret.
    #[error("unexpected response from the source: {0}")]
    BadResponse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DetectorError {
    pub fn is_transient(&self) -> bool {
        match self {
            DetectorError::Transient(_) | DetectorError::Io(_) => true,
            DetectorError::Misconfigured(_)
            | DetectorError::Auth(_)
            | DetectorError::BadResponse(_) => false,
        }
    }

    /// Classify an HTTP transport error: anything that may heal (timeouts,
    /// connect failures, 5xx bodies read halfway) is transient.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode() {
            DetectorError::Transient(err.to_string())
        } else {
            DetectorError::BadResponse(err.to_string())
        }
    }

    /// Classify a response status the way retryable REST clients do:
    /// 408/429/5xx retry, 401/403 are fatal auth, the rest are protocol
    /// surprises.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        match status.as_u16() {
            401 | 403 => DetectorError::Auth(format!("{context}: HTTP {status}")),
            408 | 429 | 500 | 502 | 503 | 504 => {
                DetectorError::Transient(format!("{context}: HTTP {status}"))
            }
            _ => DetectorError::BadResponse(format!("{context}: HTTP {status}")),
        }
    }
}

/// Failure modes of [`crate::ChangeDetector::load`]. `NotFound` reroutes the
/// apply to the DELETE path; `Transient` requeues with backoff.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("the document no longer exists in the source")]
    NotFound,
    #[error("transient load failure: {0}")]
    Transient(String),
    #[error("load failed: {0}")]
    Fatal(String),
}

impl From<DetectorError> for LoadError {
    fn from(err: DetectorError) -> Self {
        if err.is_transient() {
            LoadError::Transient(err.to_string())
        } else {
            LoadError::Fatal(err.to_string())
        }
    }
}
