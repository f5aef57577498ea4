//! Scripted collaborators for the engine and supervisor scenario tests: an
//! in-memory detector whose snapshot the test mutates, spy writers that
//! record every call and can be told to fail, and a processor that rejects
//! marked payloads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use change_detection::{
    ChangeDetector, DetectorError, DetectorEvent, DocLocator, LoadError,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use sync_store::{SyncStore, SyncStoreOptions};
use sync_types::{
    ChangeEvent, DatasourceConfig, DocumentDescriptor, DocumentProcessor, FileMetadata,
    GraphWriter, IndexPayload, ProcessError, SearchWriter, SourceType, VectorWriter,
    WriterError,
};
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{DetectorProvider, EngineOptions, IndexWriters, SyncEngine};

#[derive(Clone)]
pub(crate) struct ScriptedFile {
    pub(crate) bytes: Bytes,
    pub(crate) modified: OffsetDateTime,
    pub(crate) source_id: Option<String>,
}

/// In-memory detector: `list_all` serves the scripted snapshot, `load`
/// serves the scripted bytes, and tests push events (or `Resync`) straight
/// into the subscription.
pub(crate) struct ScriptedDetector {
    files: Mutex<BTreeMap<String, ScriptedFile>>,
    events_tx: mpsc::Sender<DetectorEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
    listing_fails_fatally: std::sync::atomic::AtomicBool,
}

impl ScriptedDetector {
    pub(crate) fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(64);
        Arc::new(Self {
            files: Mutex::new(BTreeMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            listing_fails_fatally: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Make every enumeration fail like a revoked credential.
    pub(crate) fn fail_listings(&self) {
        self.listing_fails_fatally.store(true, Ordering::SeqCst);
    }

    pub(crate) fn put_file(&self, path: &str, bytes: &[u8]) {
        self.put_file_with(path, bytes, None);
    }

    pub(crate) fn put_file_with(&self, path: &str, bytes: &[u8], source_id: Option<&str>) {
        self.files.lock().unwrap().insert(
            path.to_owned(),
            ScriptedFile {
                bytes: Bytes::copy_from_slice(bytes),
                modified: OffsetDateTime::now_utc(),
                source_id: source_id.map(str::to_owned),
            },
        );
    }

    /// Advance the modification time without touching the contents.
    pub(crate) fn touch(&self, path: &str) {
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(path).expect("touching an unknown file");
        file.modified += Duration::from_secs(1);
    }

    pub(crate) fn remove_file(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    pub(crate) async fn push(&self, event: DetectorEvent) {
        self.events_tx.send(event).await.expect("subscription gone");
    }

    pub(crate) async fn push_change(&self, event: ChangeEvent) {
        self.push(DetectorEvent::change(event)).await;
    }
}

#[async_trait]
impl ChangeDetector for ScriptedDetector {
    async fn start(&self) -> Result<(), DetectorError> {
        Ok(())
    }

    async fn stop(&self) {}

    fn list_all(&self) -> BoxStream<'static, Result<FileMetadata, DetectorError>> {
        if self.listing_fails_fatally.load(Ordering::SeqCst) {
            return futures::stream::iter(vec![Err(DetectorError::Auth(
                "credentials revoked".into(),
            ))])
            .boxed();
        }
        let snapshot: Vec<FileMetadata> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(path, file)| {
                let mut metadata = FileMetadata::new(path.clone())
                    .with_modified(file.modified)
                    .with_size(file.bytes.len() as u64);
                metadata.source_id = file.source_id.clone();
                metadata
            })
            .collect();
        futures::stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }

    fn subscribe(&self) -> BoxStream<'static, DetectorEvent> {
        match self.events_rx.lock().unwrap().take() {
            Some(rx) => ReceiverStream::new(rx).boxed(),
            None => futures::stream::pending().boxed(),
        }
    }

    async fn load(&self, locator: &DocLocator) -> Result<Bytes, LoadError> {
        let files = self.files.lock().unwrap();
        match files.get(&locator.path) {
            Some(file) => Ok(file.bytes.clone()),
            None => Err(LoadError::NotFound),
        }
    }
}

/// A detector provider that always hands out the same scripted detector.
pub(crate) struct FixedProvider(pub(crate) Arc<ScriptedDetector>);

#[async_trait]
impl DetectorProvider for FixedProvider {
    async fn build(
        &self,
        _config: &DatasourceConfig,
    ) -> Result<Arc<dyn ChangeDetector>, DetectorError> {
        Ok(self.0.clone())
    }
}

/// A provider that refuses every build, for fatal-startup scenarios.
pub(crate) struct FailingProvider;

#[async_trait]
impl DetectorProvider for FailingProvider {
    async fn build(
        &self,
        _config: &DatasourceConfig,
    ) -> Result<Arc<dyn ChangeDetector>, DetectorError> {
        Err(DetectorError::Auth("credentials rejected".into()))
    }
}

/// Records every upsert/replace/delete and can be scripted to fail the next
/// N write calls transiently.
#[derive(Default)]
pub(crate) struct SpyWriter {
    pub(crate) upserts: Mutex<Vec<String>>,
    pub(crate) deletes: Mutex<Vec<String>>,
    fail_next: AtomicU32,
}

impl SpyWriter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_next(&self, calls: u32) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    pub(crate) fn upsert_count(&self, doc_id: &str) -> usize {
        self.upserts.lock().unwrap().iter().filter(|id| *id == doc_id).count()
    }

    pub(crate) fn delete_count(&self, doc_id: &str) -> usize {
        self.deletes.lock().unwrap().iter().filter(|id| *id == doc_id).count()
    }

    fn write(&self, calls: &Mutex<Vec<String>>, doc_id: &sync_types::DocId) -> Result<(), WriterError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(WriterError::Transient("scripted failure".into()));
        }
        calls.lock().unwrap().push(doc_id.as_str().to_owned());
        Ok(())
    }
}

#[async_trait]
impl VectorWriter for SpyWriter {
    async fn upsert(&self, doc_id: &sync_types::DocId, _part: &serde_json::Value) -> Result<(), WriterError> {
        self.write(&self.upserts, doc_id)
    }

    async fn delete(&self, doc_id: &sync_types::DocId) -> Result<(), WriterError> {
        self.write(&self.deletes, doc_id)
    }
}

#[async_trait]
impl SearchWriter for SpyWriter {
    async fn upsert(&self, doc_id: &sync_types::DocId, _part: &serde_json::Value) -> Result<(), WriterError> {
        self.write(&self.upserts, doc_id)
    }

    async fn delete(&self, doc_id: &sync_types::DocId) -> Result<(), WriterError> {
        self.write(&self.deletes, doc_id)
    }
}

#[async_trait]
impl GraphWriter for SpyWriter {
    async fn replace(&self, doc_id: &sync_types::DocId, _part: &serde_json::Value) -> Result<(), WriterError> {
        self.write(&self.upserts, doc_id)
    }

    async fn delete(&self, doc_id: &sync_types::DocId) -> Result<(), WriterError> {
        self.write(&self.deletes, doc_id)
    }
}

/// Splits bytes into a trivial payload; bytes starting with `REJECT` are a
/// permanent per-document failure.
pub(crate) struct ScriptedProcessor;

#[async_trait]
impl DocumentProcessor for ScriptedProcessor {
    async fn process(
        &self,
        bytes: Bytes,
        descriptor: &DocumentDescriptor,
    ) -> Result<IndexPayload, ProcessError> {
        if bytes.starts_with(b"REJECT") {
            return Err(ProcessError::Rejected(format!(
                "unsupported format in {}",
                descriptor.source_path
            )));
        }
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(IndexPayload {
            vector_part: serde_json::json!({ "chunks": [text] }),
            search_part: serde_json::json!({ "body": text }),
            graph_part: serde_json::json!({ "entities": [] }),
        })
    }
}

pub(crate) struct Harness {
    pub(crate) store: SyncStore,
    pub(crate) detector: Arc<ScriptedDetector>,
    pub(crate) vector: Arc<SpyWriter>,
    pub(crate) search: Arc<SpyWriter>,
    pub(crate) graph: Arc<SpyWriter>,
    pub(crate) engine: SyncEngine,
    pub(crate) config: DatasourceConfig,
    _tempdir: TempDir,
}

pub(crate) fn filesystem_config() -> DatasourceConfig {
    let mut config = DatasourceConfig::new(
        "default".into(),
        SourceType::Filesystem,
        "scripted".into(),
        serde_json::json!({ "paths": ["/scripted"] }),
    );
    // keep the periodic timer out of the tests' way; passes run explicitly
    config.refresh_interval_seconds = 3600;
    config
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(filesystem_config())
    }

    pub(crate) fn with_config(config: DatasourceConfig) -> Self {
        let tempdir = TempDir::new().unwrap();
        let store = SyncStore::open(SyncStoreOptions {
            path: tempdir.path(),
            map_size: 20 * 1024 * 1024,
        })
        .unwrap();
        store.upsert_config(&config).unwrap();

        let detector = ScriptedDetector::new();
        let vector = SpyWriter::new();
        let search = SpyWriter::new();
        let graph = SpyWriter::new();
        let writers = IndexWriters {
            vector: vector.clone(),
            search: search.clone(),
            graph: graph.clone(),
        };
        let engine = SyncEngine::new(
            &config,
            store.clone(),
            detector.clone(),
            Arc::new(ScriptedProcessor),
            writers,
            EngineOptions {
                writer_deadline: Duration::from_secs(2),
                // scripted failures must survive a pass instead of being
                // retried away inside it
                in_pass_retry_budget: Duration::ZERO,
                ..EngineOptions::default()
            },
        );
        engine.start();

        Self { store, detector, vector, search, graph, engine, config, _tempdir: tempdir }
    }

    pub(crate) fn doc_id(&self, path: &str) -> sync_types::DocId {
        sync_types::DocId::new(self.config.config_id, path)
    }
}

/// Poll until `condition` holds or the timeout expires.
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
