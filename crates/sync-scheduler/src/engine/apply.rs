//! The apply path: one CREATE/UPDATE/DELETE against the three writers,
//! exactly as ordered by the per-doc lane.

use std::time::Duration;

use backoff::ExponentialBackoff;
use change_detection::{DocLocator, LoadError};
use sha2::{Digest, Sha256};
use sync_store::{CommitApply, StatusUpdate, TargetOutcomes};
use sync_types::{
    ChangeEvent, ChangeType, DocId, DocumentDescriptor, ProcessError, WriterError,
};

use crate::engine::lanes::QueuedEvent;
use crate::engine::EngineInner;
use crate::error::ApplyError;

impl EngineInner {
    /// Apply one queued event, record the outcome on the config row, and
    /// settle the broker ack. A single document's failure never escapes.
    pub(crate) async fn apply_queued(&self, doc_id: &DocId, queued: QueuedEvent) {
        let QueuedEvent { event, ack } = queued;
        let result = match event.change_type {
            ChangeType::Delete => self.apply_delete(doc_id).await,
            ChangeType::Create | ChangeType::Update => self.apply_upsert(doc_id, &event).await,
        };
        match result {
            Ok(()) => {
                if let Some(ack) = ack {
                    ack.settle(true);
                }
            }
            Err(err) => {
                let message = format!("{doc_id}: {err}");
                tracing::warn!(config_id = %self.config_id, %doc_id, %err, "apply failed");
                self.record_pass_error(message.clone());
                if let Err(err) = self.store.update_config_status(
                    self.config_id,
                    StatusUpdate { error: Some(Some(message)), ..Default::default() },
                ) {
                    tracing::warn!(%err, "could not record apply failure");
                }
                if let Some(ack) = ack {
                    ack.settle(false);
                }
            }
        }
    }

    async fn apply_upsert(&self, doc_id: &DocId, event: &ChangeEvent) -> Result<(), ApplyError> {
        let ordinal = self.store.allocate_ordinal(self.config_id)?;
        self.mark_syncing()?;

        let locator = DocLocator::from(&event.metadata);
        let bytes = match self.load_with_retry(&locator).await {
            Ok(bytes) => bytes,
            // the document vanished between event and load
            Err(LoadError::NotFound) => return self.apply_delete(doc_id).await,
            Err(err) => return Err(err.into()),
        };

        let content_hash = hex::encode(Sha256::digest(&bytes));
        {
            let poisoned = self.poisoned.lock().unwrap();
            if poisoned.get(doc_id).is_some_and(|failed| *failed == content_hash) {
                tracing::debug!(%doc_id, "skipping document whose bytes were already rejected");
                return Ok(());
            }
        }

        let prev = self.store.get_document_state(self.config_id, doc_id)?;
        if let Some(prev) = &prev {
            if prev.content_hash == content_hash && prev.is_fully_synced(self.targets) {
                // timestamp-only change: no processing, no writers
                self.store.commit_apply(CommitApply {
                    doc_id: doc_id.clone(),
                    config_id: self.config_id,
                    source_path: event.metadata.path.clone(),
                    source_id: event.metadata.source_id.clone(),
                    ordinal,
                    content_hash,
                    modified_timestamp: event.metadata.modified_timestamp,
                    targets: TargetOutcomes::default(),
                })?;
                self.advance_high_water_mark(ordinal)?;
                return Ok(());
            }
        }

        let descriptor = DocumentDescriptor {
            doc_id: doc_id.clone(),
            source_path: event.metadata.path.clone(),
            source_id: event.metadata.source_id.clone(),
        };
        let payload = match self.processor.process(bytes, &descriptor).await {
            Ok(payload) => payload,
            Err(ProcessError::Rejected(reason)) => {
                self.poisoned.lock().unwrap().insert(doc_id.clone(), content_hash);
                return Err(ApplyError::Rejected(reason));
            }
            Err(ProcessError::Transient(reason)) => return Err(ApplyError::Process(reason)),
        };
        self.poisoned.lock().unwrap().remove(doc_id);

        // a partial row with unchanged bytes only owes its missing targets;
        // anything else rewrites all required targets
        let owed = match &prev {
            Some(prev) if prev.content_hash == content_hash => {
                prev.missing_targets(self.targets)
            }
            _ => sync_types::document::MissingTargets {
                vector: true,
                search: true,
                graph: self.targets.graph,
            },
        };

        let mut failures = Vec::new();
        let vector = if owed.vector {
            let outcome = self
                .writer_call("vector", || {
                    self.writers.vector.upsert(doc_id, &payload.vector_part)
                })
                .await;
            Some(note_failure(outcome, "vector", &mut failures))
        } else {
            None
        };
        let search = if owed.search {
            let outcome = self
                .writer_call("search", || {
                    self.writers.search.upsert(doc_id, &payload.search_part)
                })
                .await;
            Some(note_failure(outcome, "search", &mut failures))
        } else {
            None
        };
        let graph = if owed.graph {
            let outcome = self
                .writer_call("graph", || {
                    self.writers.graph.replace(doc_id, &payload.graph_part)
                })
                .await;
            Some(note_failure(outcome, "graph", &mut failures))
        } else {
            None
        };

        self.store.commit_apply(CommitApply {
            doc_id: doc_id.clone(),
            config_id: self.config_id,
            source_path: event.metadata.path.clone(),
            source_id: event.metadata.source_id.clone(),
            ordinal,
            content_hash,
            modified_timestamp: event.metadata.modified_timestamp,
            targets: TargetOutcomes { vector, search, graph },
        })?;
        self.advance_high_water_mark(ordinal)?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ApplyError::Writers(failures.join("; ")))
        }
    }

    pub(crate) async fn apply_delete(&self, doc_id: &DocId) -> Result<(), ApplyError> {
        let _ordinal = self.store.allocate_ordinal(self.config_id)?;
        self.mark_syncing()?;

        // writers first, row second: a failed writer keeps the row so the
        // next pass re-derives the delete. A writer's not-found is success.
        let mut failures = Vec::new();
        for (target, deletion) in [
            ("vector", self.writer_call("vector", || self.writers.vector.delete(doc_id)).await),
            ("search", self.writer_call("search", || self.writers.search.delete(doc_id)).await),
        ] {
            if let Err(err) = deletion {
                failures.push(format!("{target}: {err}"));
            }
        }
        if self.targets.graph {
            if let Err(err) =
                self.writer_call("graph", || self.writers.graph.delete(doc_id)).await
            {
                failures.push(format!("graph: {err}"));
            }
        }
        if !failures.is_empty() {
            return Err(ApplyError::Writers(failures.join("; ")));
        }

        self.store.commit_delete(doc_id)?;
        self.poisoned.lock().unwrap().remove(doc_id);
        Ok(())
    }

    /// Bounded retry around a deadline-wrapped writer call. Deadline expiry
    /// counts as transient: the per-target timestamp stays null and the next
    /// pass retries.
    async fn writer_call<'a, F, Fut>(
        &'a self,
        target: &'static str,
        call: F,
    ) -> Result<(), WriterError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), WriterError>> + Send + 'a,
    {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(self.options.in_pass_retry_budget),
            ..ExponentialBackoff::default()
        };
        backoff::future::retry(policy, || {
            let attempt = call();
            async {
                match tokio::time::timeout(self.options.writer_deadline, attempt).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) if err.is_transient() => Err(backoff::Error::transient(err)),
                    Ok(Err(err)) => Err(backoff::Error::permanent(err)),
                    Err(_elapsed) => Err(backoff::Error::transient(WriterError::Transient(
                        format!("{target} writer deadline expired"),
                    ))),
                }
            }
        })
        .await
    }

    async fn load_with_retry(
        &self,
        locator: &DocLocator,
    ) -> Result<bytes::Bytes, LoadError> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(4),
            max_elapsed_time: Some(self.options.in_pass_retry_budget),
            ..ExponentialBackoff::default()
        };
        backoff::future::retry(policy, || {
            let attempt = self.detector.load(locator);
            async {
                match attempt.await {
                    Ok(bytes) => Ok(bytes),
                    Err(LoadError::Transient(message)) => {
                        Err(backoff::Error::transient(LoadError::Transient(message)))
                    }
                    Err(err) => Err(backoff::Error::permanent(err)),
                }
            }
        })
        .await
    }

    /// Only the ordinal advances here; `last_sync_completed_at` is written
    /// by the reconciliation pass alone, on successful completion.
    fn advance_high_water_mark(&self, ordinal: u64) -> Result<(), sync_store::Error> {
        self.store.update_config_status(
            self.config_id,
            StatusUpdate { ordinal: Some(ordinal), ..Default::default() },
        )
    }
}

fn note_failure(
    outcome: Result<(), WriterError>,
    target: &str,
    failures: &mut Vec<String>,
) -> bool {
    match outcome {
        Ok(()) => true,
        Err(err) => {
            failures.push(format!("{target}: {err}"));
            false
        }
    }
}
