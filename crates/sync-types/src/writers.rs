use async_trait::async_trait;

use crate::document::DocId;

/// Writer failures follow the shared taxonomy: transient errors leave the
/// per-target timestamp null so the next reconciliation pass retries; fatal
/// errors do the same but are also worth an operator's attention.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("transient writer failure: {0}")]
    Transient(String),
    #[error("fatal writer failure: {0}")]
    Fatal(String),
}

impl WriterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WriterError::Transient(_))
    }
}

/// Vector store client. `upsert` and `delete` must be idempotent keyed by
/// `doc_id`; a delete of an unknown document is a success.
#[async_trait]
pub trait VectorWriter: Send + Sync {
    async fn upsert(&self, doc_id: &DocId, part: &serde_json::Value) -> Result<(), WriterError>;
    async fn delete(&self, doc_id: &DocId) -> Result<(), WriterError>;
}

/// Full-text index client, same contract as [`VectorWriter`].
#[async_trait]
pub trait SearchWriter: Send + Sync {
    async fn upsert(&self, doc_id: &DocId, part: &serde_json::Value) -> Result<(), WriterError>;
    async fn delete(&self, doc_id: &DocId) -> Result<(), WriterError>;
}

/// Knowledge-graph client. `replace` swaps the whole subgraph tagged by
/// `doc_id` (delete-then-insert as one logical operation).
#[async_trait]
pub trait GraphWriter: Send + Sync {
    async fn replace(&self, doc_id: &DocId, part: &serde_json::Value) -> Result<(), WriterError>;
    async fn delete(&self, doc_id: &DocId) -> Result<(), WriterError>;
}
