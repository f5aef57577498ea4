//! Local filesystem detector: OS watch with a quiet-period debounce to
//! collapse editor save storms, recursive walk for reconciliation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use sync_types::{ChangeEvent, ChangeType, FileMetadata};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    spawn_listing, ChangeDetector, DetectorError, DetectorEvent, DocLocator, EventChannel,
    LoadError, PathFilters, Result,
};

/// Windows sharing-violation reads retry with exponential backoff up to this
/// budget before the failure is reported as transient.
const SHARING_VIOLATION_BUDGET: Duration = Duration::from_secs(5);
const ERROR_SHARING_VIOLATION: i32 = 32;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemParams {
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_quiet_period")]
    pub quiet_period_seconds: u64,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default)]
    pub filters: PathFilters,
}

fn default_quiet_period() -> u64 {
    60
}

fn default_recursive() -> bool {
    true
}

pub struct FilesystemDetector {
    inner: Arc<Inner>,
}

struct Inner {
    params: FilesystemParams,
    events_enabled: bool,
    channel: EventChannel,
    cancel: CancellationToken,
    watcher: Mutex<Option<RecommendedWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FilesystemDetector {
    pub fn new(params: FilesystemParams, events_enabled: bool) -> Result<Self> {
        if params.paths.is_empty() {
            return Err(DetectorError::Misconfigured(
                "filesystem source needs at least one path".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                params,
                events_enabled,
                channel: EventChannel::new(256),
                cancel: CancellationToken::new(),
                watcher: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

#[async_trait]
impl ChangeDetector for FilesystemDetector {
    async fn start(&self) -> Result<()> {
        if !self.inner.events_enabled {
            return Ok(());
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = match notify::recommended_watcher(move |result| {
            if let Ok(event) = result {
                let _ = raw_tx.send(event);
            }
        }) {
            Ok(watcher) => watcher,
            Err(err) => {
                tracing::info!(%err, "filesystem watch unavailable, running in periodic-only mode");
                return Ok(());
            }
        };

        let mode = if self.inner.params.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        for path in &self.inner.params.paths {
            if let Err(err) = watcher.watch(path, mode) {
                tracing::info!(path = %path.display(), %err,
                    "filesystem watch unavailable, running in periodic-only mode");
                return Ok(());
            }
        }
        *self.inner.watcher.lock().unwrap() = Some(watcher);

        let inner = self.inner.clone();
        let handle = tokio::spawn(debounce_loop(inner, raw_rx));
        self.inner.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.watcher.lock().unwrap().take();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.channel.close();
    }

    fn list_all(&self) -> BoxStream<'static, Result<FileMetadata>> {
        let inner = self.inner.clone();
        spawn_listing(move |tx| async move {
            let mut stack: Vec<PathBuf> = inner.params.paths.clone();
            while let Some(dir) = stack.pop() {
                let mut entries = tokio::fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        if inner.params.recursive {
                            stack.push(path);
                        }
                        continue;
                    }
                    if !file_type.is_file() {
                        continue;
                    }
                    let display = path.to_string_lossy().into_owned();
                    if !inner.params.filters.matches(&display) {
                        continue;
                    }
                    let metadata = entry.metadata().await?;
                    let mut file = FileMetadata::new(display).with_size(metadata.len());
                    if let Ok(modified) = metadata.modified() {
                        file = file.with_modified(OffsetDateTime::from(modified));
                    }
                    if tx.send(Ok(file)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(())
        })
    }

    fn subscribe(&self) -> BoxStream<'static, DetectorEvent> {
        self.inner.channel.subscribe()
    }

    async fn load(&self, locator: &DocLocator) -> Result<Bytes, LoadError> {
        let path = PathBuf::from(&locator.path);
        let mut delay = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        loop {
            match tokio::fs::read(&path).await {
                Ok(bytes) => return Ok(Bytes::from(bytes)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(LoadError::NotFound)
                }
                Err(err)
                    if err.raw_os_error() == Some(ERROR_SHARING_VIOLATION)
                        && waited < SHARING_VIOLATION_BUDGET =>
                {
                    tokio::time::sleep(delay).await;
                    waited += delay;
                    delay = (delay * 2).min(Duration::from_secs(1));
                }
                Err(err) => return Err(LoadError::Transient(err.to_string())),
            }
        }
    }
}

struct Pending {
    change_type: ChangeType,
    deadline: tokio::time::Instant,
}

/// Collapse raw watcher events: creates and writes for the same path are
/// merged and released only after the path has been quiet for the configured
/// period; removals flush immediately and are never swallowed.
async fn debounce_loop(inner: Arc<Inner>, mut raw_rx: mpsc::UnboundedReceiver<notify::Event>) {
    let Some(events_tx) = inner.channel.sender() else { return };
    let quiet = Duration::from_secs(inner.params.quiet_period_seconds.max(1));
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();
    let tick = Duration::from_millis(250).min(quiet);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            raw = raw_rx.recv() => {
                let Some(raw) = raw else { break };
                let change_type = match raw.kind {
                    notify::EventKind::Create(_) => Some(ChangeType::Create),
                    notify::EventKind::Modify(_) => Some(ChangeType::Update),
                    notify::EventKind::Remove(_) => Some(ChangeType::Delete),
                    _ => None,
                };
                let Some(change_type) = change_type else { continue };
                for path in raw.paths {
                    let display = path.to_string_lossy().into_owned();
                    if !inner.params.filters.matches(&display) {
                        continue;
                    }
                    if change_type == ChangeType::Delete {
                        pending.remove(&path);
                        let event = ChangeEvent::new(
                            ChangeType::Delete,
                            FileMetadata::new(display),
                        );
                        if events_tx.send(DetectorEvent::change(event)).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    let deadline = tokio::time::Instant::now() + quiet;
                    pending
                        .entry(path)
                        .and_modify(|entry| entry.deadline = deadline)
                        .or_insert(Pending { change_type, deadline });
                }
            }
            _ = tokio::time::sleep(tick) => {}
        }

        let now = tokio::time::Instant::now();
        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in due {
            let Some(entry) = pending.remove(&path) else { continue };
            let display = path.to_string_lossy().into_owned();
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                // gone before the quiet period elapsed: emit the delete
                Err(_) => {
                    let event =
                        ChangeEvent::new(ChangeType::Delete, FileMetadata::new(display));
                    if events_tx.send(DetectorEvent::change(event)).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let mut file = FileMetadata::new(display).with_size(metadata.len());
            if let Ok(modified) = metadata.modified() {
                file = file.with_modified(OffsetDateTime::from(modified));
            }
            let event = ChangeEvent::new(entry.change_type, file);
            if events_tx.send(DetectorEvent::change(event)).await.is_err() {
                return;
            }
        }
    }
}
