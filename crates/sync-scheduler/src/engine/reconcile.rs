//! The periodic reconciliation pass: one streamed `list_all()` joined
//! against the lazily scanned document states, synthesizing the CREATE,
//! UPDATE, and DELETE events the event stream may have missed, and
//! re-emitting partial-sync rows for resume.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use sync_store::StatusUpdate;
use sync_types::{ChangeEvent, ChangeType, DocId, FileMetadata, SyncStatus};
use time::OffsetDateTime;

use crate::engine::lanes::QueuedEvent;
use crate::engine::EngineInner;
use crate::{Error, Result};

/// 128-bit truncated SHA-256: the presence digest keeps the join bounded
/// (16 bytes per observed object) on million-object sources.
fn digest(value: &str) -> u128 {
    let hash = Sha256::digest(value.as_bytes());
    u128::from_be_bytes(hash[..16].try_into().unwrap())
}

impl EngineInner {
    pub(crate) async fn reconcile_pass(&self) -> Result<()> {
        self.pass_active.store(true, Ordering::SeqCst);
        let outcome = self.reconcile_pass_inner().await;
        self.pass_active.store(false, Ordering::SeqCst);
        let errors = std::mem::take(&mut *self.pass_errors.lock().unwrap());

        let status_update = StatusUpdate {
            status: Some(SyncStatus::Idle),
            completed_at: outcome.is_ok().then(OffsetDateTime::now_utc),
            error: Some(match (&outcome, errors.is_empty()) {
                (Err(err), _) => Some(err.to_string()),
                (Ok(()), false) => Some(errors.join("; ")),
                (Ok(()), true) => None,
            }),
            ..Default::default()
        };
        self.syncing.store(false, Ordering::SeqCst);
        self.store.update_config_status(self.config_id, status_update)?;
        outcome
    }

    async fn reconcile_pass_inner(&self) -> Result<()> {
        self.mark_syncing()?;
        tracing::debug!(config_id = %self.config_id, "reconciliation pass starting");

        // phase 1: stream the source snapshot; decide CREATE/UPDATE/resume
        // per item and remember a compact presence digest for phase 2
        let mut seen_paths: HashSet<u128> = HashSet::new();
        let mut seen_ids: HashMap<u128, u128> = HashMap::new();
        let mut listing = self.detector.list_all();
        while let Some(item) = listing.next().await {
            if self.cancel.is_cancelled() {
                return Err(Error::ShuttingDown);
            }
            let metadata = item.map_err(Error::Detector)?;
            seen_paths.insert(digest(&metadata.path));
            if let Some(source_id) = metadata.source_id.as_deref() {
                seen_ids.insert(digest(source_id), digest(&metadata.path));
            }
            self.consider_listed(metadata)?;
        }
        drop(listing);

        // phase 2: lazily scan our rows; anything the source no longer
        // shows becomes a DELETE (by source id when the row has one, else
        // by path; a same-id-different-path hit is a move and deletes the
        // stale doc id)
        let rtxn = self.store.read_txn()?;
        for state in self.store.document_states(&rtxn, self.config_id)? {
            if self.cancel.is_cancelled() {
                return Err(Error::ShuttingDown);
            }
            let state = state?;
            let present = match state.source_id.as_deref() {
                Some(source_id) => seen_ids
                    .get(&digest(source_id))
                    .is_some_and(|path| *path == digest(&state.source_path)),
                None => seen_paths.contains(&digest(&state.source_path)),
            };
            if !present {
                let mut metadata = FileMetadata::new(state.source_path.clone());
                metadata.source_id = state.source_id.clone();
                self.lanes.push(
                    state.doc_id.clone(),
                    QueuedEvent {
                        event: ChangeEvent::new(ChangeType::Delete, metadata),
                        ack: None,
                    },
                );
            }
        }
        drop(rtxn);

        // a pass reports completion only once its applies have drained
        self.lanes.wait_idle(&self.cancel).await;
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        tracing::debug!(config_id = %self.config_id, "reconciliation pass finished");
        Ok(())
    }

    /// Decide whether one listed item needs an apply: unseen documents,
    /// documents whose source metadata suggests change, and partial-sync
    /// rows owed a resume.
    fn consider_listed(&self, metadata: FileMetadata) -> Result<()> {
        let doc_id = DocId::new(self.config_id, &metadata.path);
        let state = self.store.get_document_state(self.config_id, &doc_id)?;
        let (change_type, needed) = match &state {
            None => (ChangeType::Create, true),
            Some(state) => {
                let resumed = !state.is_fully_synced(self.targets);
                let touched = metadata.modified_timestamp != state.modified_timestamp;
                let moved = metadata.source_id.is_some()
                    && metadata.source_id != state.source_id;
                (ChangeType::Update, resumed || touched || moved)
            }
        };
        if needed {
            self.lanes.push(
                doc_id,
                QueuedEvent { event: ChangeEvent::new(change_type, metadata), ack: None },
            );
        }
        Ok(())
    }
}
