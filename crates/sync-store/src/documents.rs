use heed::{RoTxn, WithoutTls};
use sync_types::{ConfigId, DocId, DocumentState, Ordinal};
use time::OffsetDateTime;

use crate::{Error, Result, SyncStore};

/// What happened to each writer target during one apply. `None` means the
/// target was not attempted and its previous timestamp is preserved;
/// `Some(true)` records a success now; `Some(false)` voids the timestamp so
/// the next reconciliation pass retries the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetOutcomes {
    pub vector: Option<bool>,
    pub search: Option<bool>,
    pub graph: Option<bool>,
}

impl TargetOutcomes {
    pub fn all_succeeded(&self) -> bool {
        self.vector == Some(true) && self.search == Some(true) && self.graph != Some(false)
    }
}

/// The record committed after an apply of a CREATE or UPDATE.
#[derive(Clone, Debug)]
pub struct CommitApply {
    pub doc_id: DocId,
    pub config_id: ConfigId,
    pub source_path: String,
    pub source_id: Option<String>,
    pub ordinal: Ordinal,
    pub content_hash: String,
    pub modified_timestamp: Option<OffsetDateTime>,
    pub targets: TargetOutcomes,
}

impl SyncStore {
    pub fn get_document_state(
        &self,
        config_id: ConfigId,
        doc_id: &DocId,
    ) -> Result<Option<DocumentState>> {
        debug_assert_eq!(doc_id.config_id(), Some(config_id));
        let rtxn = self.env.read_txn()?;
        Ok(self.documents.get(&rtxn, doc_id.as_str())?)
    }

    /// Resolve a source-native id back to the doc id it was last seen under.
    pub fn get_doc_id_by_source_id(
        &self,
        config_id: ConfigId,
        source_id: &str,
    ) -> Result<Option<DocId>> {
        let rtxn = self.env.read_txn()?;
        let key = source_id_key(config_id, source_id);
        Ok(self.source_ids.get(&rtxn, &key)?.map(|raw| DocId::from(raw.to_owned())))
    }

    /// Lazy enumeration of every document state of a config, in doc-id order.
    /// The iterator borrows the read transaction; a million-object source is
    /// scanned without materializing it.
    pub fn document_states<'txn>(
        &self,
        rtxn: &'txn RoTxn<'txn, WithoutTls>,
        config_id: ConfigId,
    ) -> Result<impl Iterator<Item = Result<DocumentState>> + 'txn> {
        let prefix = format!("{config_id}:");
        let iter = self.documents.prefix_iter(rtxn, &prefix)?;
        Ok(iter.map(|entry| entry.map(|(_, state)| state).map_err(Error::from)))
    }

    pub fn count_document_states(&self, config_id: ConfigId) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        let prefix = format!("{config_id}:");
        let mut count = 0;
        for entry in self.documents.prefix_iter(&rtxn, &prefix)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Insert-or-update one document row and its indexes, atomically.
    pub fn commit_apply(&self, commit: CommitApply) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let now = OffsetDateTime::now_utc();
        let key = commit.doc_id.as_str().to_owned();
        let prev = self.documents.get(&wtxn, &key)?;

        let state = match prev {
            Some(prev) => {
                // Ordinals are allocated strictly increasing per config; a
                // stale commit would break replay order.
                debug_assert!(commit.ordinal > prev.ordinal);
                self.ordinals.delete(&mut wtxn, &(commit.config_id, prev.ordinal))?;
                if let Some(old_source_id) = prev.source_id.as_deref() {
                    if commit.source_id.as_deref() != Some(old_source_id) {
                        let old_key = source_id_key(commit.config_id, old_source_id);
                        self.source_ids.delete(&mut wtxn, &old_key)?;
                    }
                }
                DocumentState {
                    doc_id: commit.doc_id.clone(),
                    config_id: commit.config_id,
                    source_path: commit.source_path.clone(),
                    source_id: commit.source_id.clone().or(prev.source_id.clone()),
                    ordinal: commit.ordinal,
                    content_hash: commit.content_hash.clone(),
                    modified_timestamp: commit.modified_timestamp.or(prev.modified_timestamp),
                    vector_synced_at: apply_outcome(commit.targets.vector, prev.vector_synced_at, now),
                    search_synced_at: apply_outcome(commit.targets.search, prev.search_synced_at, now),
                    graph_synced_at: apply_outcome(commit.targets.graph, prev.graph_synced_at, now),
                    created_at: prev.created_at,
                    updated_at: now,
                }
            }
            None => DocumentState {
                doc_id: commit.doc_id.clone(),
                config_id: commit.config_id,
                source_path: commit.source_path.clone(),
                source_id: commit.source_id.clone(),
                ordinal: commit.ordinal,
                content_hash: commit.content_hash.clone(),
                modified_timestamp: commit.modified_timestamp,
                vector_synced_at: apply_outcome(commit.targets.vector, None, now),
                search_synced_at: apply_outcome(commit.targets.search, None, now),
                graph_synced_at: apply_outcome(commit.targets.graph, None, now),
                created_at: now,
                updated_at: now,
            },
        };

        self.documents.put(&mut wtxn, &key, &state)?;
        self.ordinals.put(&mut wtxn, &(commit.config_id, commit.ordinal), &key)?;
        if let Some(source_id) = state.source_id.as_deref() {
            let source_key = source_id_key(commit.config_id, source_id);
            self.source_ids.put(&mut wtxn, &source_key, &key)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Atomic removal of a document row and its index entries. Removing an
    /// unknown doc id is a no-op; history is not retained.
    pub fn commit_delete(&self, doc_id: &DocId) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let key = doc_id.as_str();
        if let Some(prev) = self.documents.get(&wtxn, key)? {
            self.ordinals.delete(&mut wtxn, &(prev.config_id, prev.ordinal))?;
            if let Some(source_id) = prev.source_id.as_deref() {
                // after a move the index entry already points at the new doc
                // id; leave it alone in that case
                let source_key = source_id_key(prev.config_id, source_id);
                let still_ours =
                    self.source_ids.get(&wtxn, &source_key)?.is_some_and(|mapped| mapped == key);
                if still_ours {
                    self.source_ids.delete(&mut wtxn, &source_key)?;
                }
            }
            self.documents.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Drop every document row of a config. Used by explicit admin cleanup,
    /// never by the engine.
    pub fn purge_document_states(&self, config_id: ConfigId) -> Result<u64> {
        let mut wtxn = self.env.write_txn()?;
        let prefix = format!("{config_id}:");
        let mut doomed = Vec::new();
        for entry in self.documents.prefix_iter(&wtxn, &prefix)? {
            let (key, state) = entry?;
            doomed.push((key.to_owned(), state.ordinal, state.source_id));
        }
        let purged = doomed.len() as u64;
        for (key, ordinal, source_id) in doomed {
            self.documents.delete(&mut wtxn, &key)?;
            self.ordinals.delete(&mut wtxn, &(config_id, ordinal))?;
            if let Some(source_id) = source_id.as_deref() {
                self.source_ids.delete(&mut wtxn, &source_id_key(config_id, source_id))?;
            }
        }
        // last_ordinals is intentionally kept: ordinals stay strictly
        // increasing per config even across a purge-and-reingest.
        wtxn.commit()?;
        Ok(purged)
    }
}

fn apply_outcome(
    outcome: Option<bool>,
    previous: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    match outcome {
        Some(true) => Some(now),
        Some(false) => None,
        None => previous,
    }
}

fn source_id_key(config_id: ConfigId, source_id: &str) -> String {
    format!("{config_id}:{source_id}")
}
