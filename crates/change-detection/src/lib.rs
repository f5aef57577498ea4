//! Uniform change-detection layer over the external document repositories.
//!
//! Every source hides behind [`ChangeDetector`]: an event subscription, a
//! snapshot enumeration for reconciliation, and a byte loader. Detectors
//! translate their native notification mechanism (inotify, SQS, Pub/Sub,
//! change feeds, delta queries, events APIs) into [`DetectorEvent`]s with
//! at-least-once delivery; deduplication across restarts is the engine's job,
//! through the state store.

pub mod error;
pub mod factory;
pub mod filters;
pub(crate) mod retry;

pub mod alfresco;
pub mod azure_blob;
pub mod box_source;
pub mod filesystem;
pub mod gcs;
pub mod google_drive;
pub mod msgraph;
pub mod s3;

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use sync_types::{ChangeEvent, FileMetadata};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub use crate::error::{DetectorError, LoadError};
pub use crate::factory::DetectorFactory;
pub use crate::filters::PathFilters;

pub type Result<T, E = DetectorError> = std::result::Result<T, E>;

/// What a subscription yields: either an observed change, or the sentinel
/// telling the engine the detector lost continuity with its provider (page
/// token invalidated, delta link expired, change-feed gap) and a full
/// reconciliation pass is required.
#[derive(Debug)]
pub enum DetectorEvent {
    Change {
        event: ChangeEvent,
        /// Present when the event came off a broker that wants an explicit
        /// settle (SQS delete, Pub/Sub ack). The engine settles after the
        /// state-store commit; an unsettled or failed message redelivers.
        ack: Option<EventAck>,
    },
    Resync,
}

impl DetectorEvent {
    pub fn change(event: ChangeEvent) -> Self {
        DetectorEvent::Change { event, ack: None }
    }
}

/// Outcome of one broker message, reported back to the detector's poll loop.
#[derive(Debug)]
pub struct AckOutcome {
    pub token: String,
    pub success: bool,
}

#[derive(Debug)]
pub struct EventAck {
    tx: mpsc::UnboundedSender<AckOutcome>,
    token: String,
}

impl EventAck {
    pub fn new(tx: mpsc::UnboundedSender<AckOutcome>, token: String) -> Self {
        Self { tx, token }
    }

    /// Report the commit outcome. Dropping the ack without settling leaves
    /// the message to redeliver after its visibility/ack deadline, which is
    /// the correct at-least-once behavior for an abandoned apply.
    pub fn settle(self, success: bool) {
        let _ = self.tx.send(AckOutcome { token: self.token, success });
    }
}

/// Where to find a document's bytes: the logical path, and the source-native
/// id when the source has one (some sources can only load by id).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocLocator {
    pub path: String,
    pub source_id: Option<String>,
}

impl From<&FileMetadata> for DocLocator {
    fn from(metadata: &FileMetadata) -> Self {
        Self { path: metadata.path.clone(), source_id: metadata.source_id.clone() }
    }
}

/// The uniform capability set every source implements. The engine and the
/// supervisor depend only on this trait; source SDKs stay behind the factory.
#[async_trait]
pub trait ChangeDetector: Send + Sync {
    /// Allocate resources: watchers, queue consumers, broker connections.
    /// When the event mechanism is unavailable the detector downgrades to
    /// periodic-only mode, logs the downgrade once at info, and still serves
    /// `list_all`. Only permanent auth/permission failures are errors.
    async fn start(&self) -> Result<()>;

    /// Release all resources. After return no further events are emitted.
    async fn stop(&self);

    /// Lazy snapshot of the items matching the configured filter. Streamed;
    /// a million-object source must not be buffered in memory.
    fn list_all(&self) -> BoxStream<'static, Result<FileMetadata>>;

    /// Infinite stream of change events, terminated only by `stop`.
    /// At-least-once; rapid CREATE+UPDATE pairs may coalesce but DELETE is
    /// never swallowed. Single consumer.
    fn subscribe(&self) -> BoxStream<'static, DetectorEvent>;

    /// Current bytes of a document. `NotFound` when it disappeared between
    /// event and load.
    async fn load(&self, locator: &DocLocator) -> Result<Bytes, LoadError>;
}

/// One-consumer event channel shared by all detectors: the sender side lives
/// in the detector (and its pump tasks), the receiver is handed out once by
/// `subscribe`. Closing the channel ends the stream.
pub(crate) struct EventChannel {
    tx: Mutex<Option<mpsc::Sender<DetectorEvent>>>,
    rx: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
}

impl EventChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx: Mutex::new(Some(tx)), rx: Mutex::new(Some(rx)) }
    }

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<DetectorEvent>> {
        self.tx.lock().unwrap().clone()
    }

    pub(crate) fn subscribe(&self) -> BoxStream<'static, DetectorEvent> {
        match self.rx.lock().unwrap().take() {
            Some(rx) => ReceiverStream::new(rx).boxed(),
            // a second subscriber gets a stream that never yields
            None => futures::stream::pending().boxed(),
        }
    }

    /// Drop the detector-held sender; once every pump task exits, the
    /// subscriber's stream terminates.
    pub(crate) fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// Spawn a walker task feeding a bounded channel and expose the receiving
/// half as a stream: enumeration stays lazy (the walker blocks once the
/// consumer stops pulling) without detectors hand-writing unfold state
/// machines.
pub(crate) fn spawn_listing<F, Fut>(
    produce: F,
) -> BoxStream<'static, Result<FileMetadata>>
where
    F: FnOnce(mpsc::Sender<Result<FileMetadata>>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let errors = tx.clone();
        if let Err(err) = produce(tx).await {
            // the consumer may already be gone; nothing to do then
            let _ = errors.send(Err(err)).await;
        }
    });
    ReceiverStream::new(rx).boxed()
}
