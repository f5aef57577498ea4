pub(crate) mod apply;
pub(crate) mod lanes;
pub(crate) mod reconcile;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use change_detection::{ChangeDetector, DetectorEvent};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use sync_store::{StatusUpdate, SyncStore};
use sync_types::{
    ChangeType, ConfigId, DocId, DocumentProcessor, SyncStatus, TargetSet,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::lanes::{Lanes, QueuedEvent};
use crate::{Error, IndexWriters, Result};

/// Tunables of one engine instance; the defaults match production use.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Bounded parallelism across distinct documents.
    pub apply_workers: usize,
    /// Per-call deadline on every writer invocation.
    pub writer_deadline: Duration,
    /// Retry budget for one transient writer or load failure within a pass;
    /// anything unresolved by then waits for the next pass.
    pub in_pass_retry_budget: Duration,
    /// How long `stop` waits for in-flight applies before abandoning them.
    pub stop_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            apply_workers: 4,
            writer_deadline: Duration::from_secs(30),
            in_pass_retry_budget: Duration::from_secs(10),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Outcome of a failed pass, kept cloneable for the collapsed followers.
#[derive(Clone, Debug)]
pub(crate) struct PassFailure {
    message: String,
    fatal: bool,
}

type SharedPass = Shared<BoxFuture<'static, Result<(), PassFailure>>>;

/// One instance per active config: consumes the detector's event stream,
/// runs the periodic reconciliation, and applies ordered, idempotent changes
/// to the three index writers through the state store.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config_id: ConfigId,
    pub(crate) store: SyncStore,
    pub(crate) detector: Arc<dyn ChangeDetector>,
    pub(crate) processor: Arc<dyn DocumentProcessor>,
    pub(crate) writers: IndexWriters,
    pub(crate) options: EngineOptions,
    pub(crate) targets: TargetSet,
    pub(crate) refresh_interval: Duration,
    pub(crate) lanes: Lanes,
    pub(crate) cancel: CancellationToken,
    /// Documents rejected by the processor, keyed to the content hash that
    /// was rejected; skipped until their bytes change or the engine restarts.
    pub(crate) poisoned: Mutex<HashMap<DocId, String>>,
    /// Whether the config row currently says `syncing`.
    pub(crate) syncing: AtomicBool,
    /// True while a reconciliation pass is enumerating; keeps the status
    /// from flapping back to idle between applies.
    pub(crate) pass_active: AtomicBool,
    /// Errors of the pass in flight, aggregated into `last_error`.
    pub(crate) pass_errors: Mutex<Vec<String>>,
    /// The collapsing slot for `sync_now`: concurrent callers await the pass
    /// already in flight instead of starting another.
    pass_slot: tokio::sync::Mutex<Option<SharedPass>>,
    /// Raised once on the first source-fatal failure; the supervisor reacts
    /// by stopping this engine and flipping the config to `error`.
    fatal: tokio::sync::watch::Sender<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        config: &sync_types::DatasourceConfig,
        store: SyncStore,
        detector: Arc<dyn ChangeDetector>,
        processor: Arc<dyn DocumentProcessor>,
        writers: IndexWriters,
        options: EngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config_id: config.config_id,
                store,
                detector,
                processor,
                writers,
                options,
                targets: config.targets(),
                refresh_interval: Duration::from_secs(config.refresh_interval_seconds.max(1)),
                lanes: Lanes::new(),
                cancel: CancellationToken::new(),
                poisoned: Mutex::new(HashMap::new()),
                syncing: AtomicBool::new(false),
                pass_active: AtomicBool::new(false),
                pass_errors: Mutex::new(Vec::new()),
                pass_slot: tokio::sync::Mutex::new(None),
                fatal: tokio::sync::watch::channel(None).0,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the event consumer, the periodic reconciler, and the apply
    /// worker pool. Call once.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.push(tokio::spawn(event_consumer(self.inner.clone())));
        tasks.push(tokio::spawn(periodic_reconciler(self.inner.clone())));
        for _ in 0..self.inner.options.apply_workers.max(1) {
            tasks.push(tokio::spawn(apply_worker(self.inner.clone())));
        }
    }

    /// Run exactly one reconciliation pass now, independent of the periodic
    /// timer. Concurrent invocations collapse onto the in-flight pass and
    /// await its outcome.
    pub async fn sync_now(&self) -> Result<()> {
        self.inner.clone().run_pass().await
    }

    /// Drain to a safe point and stop. In-flight applies that do not finish
    /// within the grace period are abandoned; their partial-sync rows resume
    /// on the next start.
    pub async fn stop(&self) {
        let grace = self.inner.options.stop_grace;
        let drained = tokio::time::timeout(grace, async {
            self.inner.lanes.wait_idle(&CancellationToken::new()).await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!(config_id = %self.inner.config_id,
                "stop grace period expired with applies in flight");
        }
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.set_idle_if_syncing();
    }

    pub fn config_id(&self) -> ConfigId {
        self.inner.config_id
    }

    /// True when no event is queued or in flight.
    pub fn is_quiescent(&self) -> bool {
        self.inner.lanes.is_idle()
    }

    /// A cheap handle onto the same engine, usable outside the supervisor
    /// lock. Not public: ownership stays with the supervisor.
    pub(crate) fn clone_handle(&self) -> SyncEngine {
        SyncEngine { inner: self.inner.clone() }
    }

    /// Becomes `Some(reason)` on the first source-fatal failure.
    pub(crate) fn fatal_signal(&self) -> tokio::sync::watch::Receiver<Option<String>> {
        self.inner.fatal.subscribe()
    }
}

impl EngineInner {
    /// Start (or join) the single in-flight reconciliation pass.
    pub(crate) async fn run_pass(self: Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let shared = {
            let mut slot = self.pass_slot.lock().await;
            match slot.as_ref() {
                Some(existing) if existing.peek().is_none() => existing.clone(),
                _ => {
                    let engine = self.clone();
                    let fresh: SharedPass = async move {
                        engine.reconcile_pass().await.map_err(|err| PassFailure {
                            fatal: err.is_fatal_for_source(),
                            message: err.to_string(),
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };
        shared.await.map_err(|failure| {
            if failure.fatal {
                // first failure wins; the supervisor tears this engine down
                self.fatal.send_if_modified(|slot| {
                    if slot.is_none() {
                        *slot = Some(failure.message.clone());
                        true
                    } else {
                        false
                    }
                });
            }
            Error::Pass(failure.message)
        })
    }

    /// Mark the config `syncing` the first time a pass or apply touches it.
    pub(crate) fn mark_syncing(&self) -> Result<(), sync_store::Error> {
        if !self.syncing.swap(true, Ordering::SeqCst) {
            self.store.update_config_status(
                self.config_id,
                StatusUpdate { status: Some(SyncStatus::Syncing), ..Default::default() },
            )?;
        }
        Ok(())
    }

    pub(crate) fn set_idle_if_syncing(&self) {
        if self.syncing.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.store.update_config_status(
                self.config_id,
                StatusUpdate { status: Some(SyncStatus::Idle), ..Default::default() },
            ) {
                tracing::warn!(%err, config_id = %self.config_id, "could not reset sync status");
            }
        }
    }

    pub(crate) fn record_pass_error(&self, message: String) {
        self.pass_errors.lock().unwrap().push(message);
    }
}

/// Consume the detector's subscription: changes go into the per-doc lanes,
/// the `Resync` sentinel drains the lanes and forces a full pass.
async fn event_consumer(inner: Arc<EngineInner>) {
    let mut events = inner.detector.subscribe();
    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            event = events.next() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            DetectorEvent::Change { event, ack } => {
                let Some(doc_id) = resolve_doc_id(&inner, &event) else {
                    // an unknown tombstone: nothing to clean up, settle it
                    if let Some(ack) = ack {
                        ack.settle(true);
                    }
                    continue;
                };
                inner.lanes.push(doc_id, QueuedEvent { event, ack });
            }
            DetectorEvent::Resync => {
                tracing::info!(config_id = %inner.config_id,
                    "detector lost continuity, running a full reconciliation");
                inner.lanes.wait_idle(&inner.cancel).await;
                if let Err(err) = inner.clone().run_pass().await {
                    tracing::warn!(%err, config_id = %inner.config_id,
                        "post-resync reconciliation failed");
                }
            }
        }
    }
}

/// Map an incoming event to its lane key. Deletes that only carry a
/// source-native id (the path is gone) resolve through the store's
/// source-id index.
fn resolve_doc_id(inner: &EngineInner, event: &sync_types::ChangeEvent) -> Option<DocId> {
    if !event.metadata.path.is_empty() {
        return Some(DocId::new(inner.config_id, &event.metadata.path));
    }
    let source_id = event.metadata.source_id.as_deref()?;
    match inner.store.get_doc_id_by_source_id(inner.config_id, source_id) {
        Ok(Some(doc_id)) => Some(doc_id),
        Ok(None) => {
            if event.change_type != ChangeType::Delete {
                tracing::debug!(config_id = %inner.config_id, source_id,
                    "dropping pathless event for an untracked document");
            }
            None
        }
        Err(err) => {
            tracing::warn!(%err, config_id = %inner.config_id,
                "source-id lookup failed, dropping event");
            None
        }
    }
}

async fn periodic_reconciler(inner: Arc<EngineInner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.refresh_interval) => {}
        }
        if let Err(err) = inner.clone().run_pass().await {
            tracing::warn!(%err, config_id = %inner.config_id, "periodic reconciliation failed");
        }
    }
}

async fn apply_worker(inner: Arc<EngineInner>) {
    while let Some((doc_id, queued)) = inner.lanes.next(&inner.cancel).await {
        inner.apply_queued(&doc_id, queued).await;
        inner.lanes.done(&doc_id);
        if inner.lanes.is_idle() && !inner.pass_active.load(Ordering::SeqCst) {
            inner.set_idle_if_syncing();
        }
    }
}
