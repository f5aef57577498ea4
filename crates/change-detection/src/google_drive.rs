//! Google Drive detector: Changes API with a persisted page token for event
//! mode, folder enumeration for reconciliation. Google-native documents are
//! exported; regular files are downloaded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use google_cloud_auth::credentials::CredentialsFile;
use google_cloud_auth::project::Config;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use serde::Deserialize;
use sync_types::{ChangeEvent, ChangeType, FileMetadata};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::retry::{network_backoff, retry_transient};
use crate::{
    spawn_listing, ChangeDetector, DetectorError, DetectorEvent, DocLocator, EventChannel,
    LoadError, PathFilters, Result,
};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,size,parents,trashed";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleDriveParams {
    /// Service-account JSON, verbatim.
    pub credentials: serde_json::Value,
    /// Root folder to monitor; the drive root when absent.
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: u64,
    #[serde(default)]
    pub filters: PathFilters,
}

fn default_recursive() -> bool {
    true
}

fn default_polling_interval() -> u64 {
    60
}

pub struct GoogleDriveDetector {
    inner: Arc<Inner>,
}

struct Inner {
    params: GoogleDriveParams,
    http: reqwest::Client,
    token_source: Arc<dyn TokenSource>,
    events_enabled: bool,
    channel: EventChannel,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GoogleDriveDetector {
    pub async fn new(params: GoogleDriveParams, events_enabled: bool) -> Result<Self> {
        let credentials: CredentialsFile = serde_json::from_value(params.credentials.clone())
            .map_err(|err| {
                DetectorError::Misconfigured(format!(
                    "invalid google drive service-account json: {err}"
                ))
            })?;
        let config = Config::default().with_scopes(&[DRIVE_SCOPE]);
        let provider = DefaultTokenSourceProvider::new_with_credentials(
            config,
            Box::new(credentials),
        )
        .await
        .map_err(|err| DetectorError::Auth(format!("google drive credentials rejected: {err}")))?;
        let token_source = provider.token_source();

        Ok(Self {
            inner: Arc::new(Inner {
                params,
                http: reqwest::Client::new(),
                token_source,
                events_enabled,
                channel: EventChannel::new(256),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

#[async_trait]
impl ChangeDetector for GoogleDriveDetector {
    async fn start(&self) -> Result<()> {
        if !self.inner.events_enabled {
            return Ok(());
        }
        // a failing start-page-token fetch distinguishes bad credentials
        // from a transient outage; the latter downgrades
        match start_page_token(&self.inner).await {
            Ok(token) => {
                let inner = self.inner.clone();
                let handle = tokio::spawn(changes_loop(inner, token));
                self.inner.tasks.lock().unwrap().push(handle);
                Ok(())
            }
            Err(err) if err.is_transient() => {
                tracing::info!(%err,
                    "drive changes api unreachable, running in periodic-only mode");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn stop(&self) {
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.channel.close();
    }

    fn list_all(&self) -> BoxStream<'static, Result<FileMetadata>> {
        let inner = self.inner.clone();
        spawn_listing(move |tx| async move {
            // breadth-first over (folder id, path prefix)
            let root = inner.params.folder_id.clone().unwrap_or_else(|| "root".into());
            let mut folders: Vec<(String, String)> = vec![(root, String::new())];
            while let Some((folder_id, base)) = folders.pop() {
                let mut page_token: Option<String> = None;
                loop {
                    let page = retry_transient(network_backoff(), || {
                        let inner = inner.clone();
                        let folder_id = folder_id.clone();
                        let page_token = page_token.clone();
                        async move { list_children(&inner, &folder_id, page_token.as_deref()).await }
                    })
                    .await?;
                    for file in page.files {
                        let path = join_path(&base, &file.name);
                        if file.mime_type.as_deref() == Some(FOLDER_MIME) {
                            if inner.params.recursive {
                                folders.push((file.id.clone(), path));
                            }
                            continue;
                        }
                        if !inner.params.filters.matches(&path) {
                            continue;
                        }
                        if tx.send(Ok(drive_file_metadata(&file, path))).await.is_err() {
                            return Ok(());
                        }
                    }
                    match page.next_page_token {
                        Some(token) => page_token = Some(token),
                        None => break,
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
        let Some(file_id) = locator.source_id.as_deref() else {
            return Err(LoadError::Fatal(
                "google drive documents can only be loaded by file id".into(),
            ));
        };
        // the mime type decides between download and export
        let url = format!("{DRIVE_API}/files/{file_id}?fields=id,name,mimeType");
        let response = authorized_get(&self.inner, &url).await.map_err(LoadError::from)?;
        let metadata: DriveFile = match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|err| LoadError::Fatal(format!("bad drive file metadata: {err}")))?,
            reqwest::StatusCode::NOT_FOUND => return Err(LoadError::NotFound),
            status => {
                return Err(LoadError::from(DetectorError::from_status(status, "drive get file")))
            }
        };

        let url = match metadata.mime_type.as_deref() {
            Some(mime) if mime.starts_with("application/vnd.google-apps") => format!(
                "{DRIVE_API}/files/{file_id}/export?mimeType={}",
                urlencoding::encode("application/pdf")
            ),
            _ => format!("{DRIVE_API}/files/{file_id}?alt=media"),
        };
        let response = authorized_get(&self.inner, &url).await.map_err(LoadError::from)?;
        match response.status() {
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(|err| LoadError::from(DetectorError::from_http(err)))?),
            reqwest::StatusCode::NOT_FOUND => Err(LoadError::NotFound),
            status => {
                Err(LoadError::from(DetectorError::from_status(status, "drive download")))
            }
        }
    }
}

async fn authorized_get(inner: &Inner, url: &str) -> Result<reqwest::Response> {
    let token = inner
        .token_source
        .token()
        .await
        .map_err(|err| DetectorError::Auth(format!("google drive token refresh failed: {err}")))?;
    inner
        .http
        .get(url)
        .header(reqwest::header::AUTHORIZATION, token)
        .send()
        .await
        .map_err(DetectorError::from_http)
}

async fn get_json<T: serde::de::DeserializeOwned>(inner: &Inner, url: &str) -> Result<T> {
    let response = authorized_get(inner, url).await?;
    let status = response.status();
    if status == reqwest::StatusCode::GONE {
        return Err(DetectorError::Transient("drive page token expired".into()));
    }
    if !status.is_success() {
        return Err(DetectorError::from_status(status, "drive api"));
    }
    response
        .json()
        .await
        .map_err(|err| DetectorError::BadResponse(format!("bad drive response: {err}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    parents: Option<Vec<String>>,
    #[serde(default)]
    trashed: Option<bool>,
}

impl DriveFile {
    fn first_parent(&self) -> Option<String> {
        self.parents.as_ref()?.first().cloned()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListPage {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangesPage {
    #[serde(default)]
    changes: Vec<DriveChange>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveChange {
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    removed: bool,
    #[serde(default)]
    file: Option<DriveFile>,
}

fn drive_file_metadata(file: &DriveFile, path: String) -> FileMetadata {
    let mut metadata = FileMetadata::new(path).with_source_id(file.id.clone());
    metadata.size = file.size.as_deref().and_then(|size| size.parse().ok());
    metadata.modified_timestamp = file
        .modified_time
        .as_deref()
        .and_then(|time| OffsetDateTime::parse(time, &Rfc3339).ok());
    metadata
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_owned()
    } else {
        format!("{base}/{name}")
    }
}

async fn list_children(
    inner: &Inner,
    folder_id: &str,
    page_token: Option<&str>,
) -> Result<FileListPage> {
    let query = urlencoding::encode_binary(
        format!("'{folder_id}' in parents and trashed=false").as_bytes(),
    )
    .into_owned();
    let mut url = format!(
        "{DRIVE_API}/files?q={query}&pageSize=1000&fields=nextPageToken,files({FILE_FIELDS})"
    );
    if let Some(token) = page_token {
        url.push_str(&format!("&pageToken={token}"));
    }
    get_json(inner, &url).await
}

async fn start_page_token(inner: &Inner) -> Result<String> {
    let token: StartPageToken =
        get_json(inner, &format!("{DRIVE_API}/changes/startPageToken")).await?;
    Ok(token.start_page_token)
}

/// Poll the Changes API. The page token survives across polls; when the
/// server reports it expired (410), the engine gets a `Resync` sentinel and
/// the loop starts over from a fresh token.
async fn changes_loop(inner: Arc<Inner>, initial_token: String) {
    let Some(events_tx) = inner.channel.sender() else { return };
    let interval = Duration::from_secs(inner.params.polling_interval_seconds.max(1));
    let mut page_token = initial_token;
    // file id -> path of everything we have resolved so far
    let mut path_cache: HashMap<String, String> = HashMap::new();

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        loop {
            let url = format!(
                "{DRIVE_API}/changes?pageToken={page_token}&pageSize=100&fields=nextPageToken,newStartPageToken,changes(fileId,removed,file({FILE_FIELDS}))"
            );
            let page: ChangesPage = match get_json(&inner, &url).await {
                Ok(page) => page,
                Err(DetectorError::Transient(message))
                    if message.contains("page token expired") =>
                {
                    tracing::warn!("drive page token expired, resyncing");
                    if events_tx.send(DetectorEvent::Resync).await.is_err() {
                        return;
                    }
                    match start_page_token(&inner).await {
                        Ok(fresh) => page_token = fresh,
                        Err(err) => tracing::warn!(%err, "could not refresh drive page token"),
                    }
                    break;
                }
                Err(err) => {
                    tracing::warn!(%err, "drive changes poll failed");
                    break;
                }
            };

            for change in page.changes {
                let Some(file_id) = change.file_id else { continue };
                let removed =
                    change.removed || change.file.as_ref().is_some_and(|f| f.trashed == Some(true));
                if removed {
                    // the path may be unknown by now; the engine resolves
                    // deletes through its source-id index
                    let path = path_cache.remove(&file_id).unwrap_or_default();
                    let metadata = FileMetadata::new(path).with_source_id(file_id);
                    let event = ChangeEvent::new(ChangeType::Delete, metadata);
                    if events_tx.send(DetectorEvent::change(event)).await.is_err() {
                        return;
                    }
                    continue;
                }
                let Some(file) = change.file else { continue };
                if file.mime_type.as_deref() == Some(FOLDER_MIME) {
                    continue;
                }
                let Some(path) = resolve_path(&inner, &file, &mut path_cache).await else {
                    continue;
                };
                if !inner.params.filters.matches(&path) {
                    continue;
                }
                let event =
                    ChangeEvent::new(ChangeType::Update, drive_file_metadata(&file, path));
                if events_tx.send(DetectorEvent::change(event)).await.is_err() {
                    return;
                }
            }

            if let Some(token) = page.next_page_token {
                page_token = token;
                continue;
            }
            if let Some(token) = page.new_start_page_token {
                page_token = token;
            }
            break;
        }
    }
}

/// Build the file's path relative to the monitored root by walking parents.
/// The cache maps node id to root-relative path (folders and files alike)
/// and is back-filled for every folder crossed, so sibling changes resolve
/// without further lookups. Files outside the root resolve to `None`.
async fn resolve_path(
    inner: &Inner,
    file: &DriveFile,
    cache: &mut HashMap<String, String>,
) -> Option<String> {
    let root = inner.params.folder_id.clone().unwrap_or_else(|| "root".into());
    // unknown folders crossed on the way up, leaf-most first
    let mut chain: Vec<(String, String)> = Vec::new();
    let mut current = file.first_parent()?;
    let mut prefix: Option<String> = None;
    for _ in 0..64 {
        if current == root {
            prefix = Some(String::new());
            break;
        }
        if let Some(known) = cache.get(&current) {
            prefix = Some(known.clone());
            break;
        }
        let url = format!("{DRIVE_API}/files/{current}?fields=id,name,parents");
        let parent: DriveFile = match get_json(inner, &url).await {
            Ok(parent) => parent,
            Err(err) => {
                tracing::debug!(%err, "drive parent resolution failed");
                return None;
            }
        };
        match parent.first_parent() {
            Some(next) => {
                chain.push((parent.id.clone(), parent.name.clone()));
                current = next;
            }
            // a parentless node is the drive root itself; it contributes no
            // path segment, and crossing it means the file is outside any
            // configured folder
            None => {
                if inner.params.folder_id.is_some() {
                    return None;
                }
                cache.insert(parent.id.clone(), String::new());
                prefix = Some(String::new());
                break;
            }
        }
    }

    let mut path = prefix?;
    for (folder_id, name) in chain.iter().rev() {
        path = join_path(&path, name);
        cache.insert(folder_id.clone(), path.clone());
    }
    let full = join_path(&path, &file.name);
    cache.insert(file.id.clone(), full.clone());
    Some(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_file_metadata_parses_size_and_time() {
        let file = DriveFile {
            id: "f1".into(),
            name: "a.txt".into(),
            mime_type: Some("text/plain".into()),
            modified_time: Some("2026-03-01T10:00:00.000Z".into()),
            size: Some("42".into()),
            parents: None,
            trashed: Some(false),
        };
        let metadata = drive_file_metadata(&file, "reports/a.txt".into());
        assert_eq!(metadata.path, "reports/a.txt");
        assert_eq!(metadata.source_id.as_deref(), Some("f1"));
        assert_eq!(metadata.size, Some(42));
        assert!(metadata.modified_timestamp.is_some());
    }

    #[test]
    fn join_path_handles_the_root() {
        assert_eq!(join_path("", "a.txt"), "a.txt");
        assert_eq!(join_path("reports/2026", "a.txt"), "reports/2026/a.txt");
    }
}
