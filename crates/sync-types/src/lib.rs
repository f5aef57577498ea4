//! Shared data model of the syncline core: datasource configurations,
//! per-document sync state, change events, and the interfaces of the
//! external collaborators (document processor and index writers).

pub mod datasource;
pub mod document;
pub mod events;
pub mod processor;
pub mod writers;

pub use datasource::{ConfigId, DatasourceConfig, SourceType, SyncStatus};
pub use document::{DocId, DocumentState, TargetSet};
pub use events::{ChangeEvent, ChangeType, FileMetadata};
pub use processor::{DocumentDescriptor, DocumentProcessor, IndexPayload, ProcessError};
pub use writers::{GraphWriter, SearchWriter, VectorWriter, WriterError};

/// Monotonic per-config apply counter, a microsecond wall-clock timestamp
/// made strictly increasing by the state store.
pub type Ordinal = u64;
