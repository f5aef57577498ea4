use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::document::DocId;

/// Identity of the document handed to the processor alongside its bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDescriptor {
    pub doc_id: DocId,
    pub source_path: String,
    pub source_id: Option<String>,
}

/// Opaque result of processing one document: chunks + embeddings for the
/// vector store, searchable fields for the full-text index, extracted
/// entities and relations for the graph. The engine never looks inside the
/// parts; they are passed verbatim to the writers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexPayload {
    pub vector_part: serde_json::Value,
    pub search_part: serde_json::Value,
    pub graph_part: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The bytes are unsupported or unparsable; retrying without a content
    /// change cannot succeed.
    #[error("document rejected: {0}")]
    Rejected(String),
    #[error("transient processing failure: {0}")]
    Transient(String),
}

/// Converts raw bytes into an [`IndexPayload`]. External to the core; the
/// engine only relies on this signature.
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    async fn process(
        &self,
        bytes: Bytes,
        descriptor: &DocumentDescriptor,
    ) -> Result<IndexPayload, ProcessError>;
}
