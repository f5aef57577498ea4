//! Box detector: events API with a persisted stream position, folder
//! listing for reconciliation. Auth is a developer token or the
//! client-credentials grant scoped to a user or enterprise.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
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

const API: &str = "https://api.box.com/2.0";
const TOKEN_URL: &str = "https://api.box.com/oauth2/token";
const ITEM_FIELDS: &str = "id,type,name,modified_at,size,path_collection";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxParams {
    #[serde(default)]
    pub developer_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub enterprise_id: Option<String>,
    #[serde(default = "default_folder_id")]
    pub folder_id: String,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: u64,
    #[serde(default)]
    pub filters: PathFilters,
}

fn default_folder_id() -> String {
    "0".into()
}

fn default_recursive() -> bool {
    true
}

fn default_polling_interval() -> u64 {
    60
}

enum AuthMode {
    DeveloperToken(String),
    ClientCredentials {
        client_id: String,
        client_secret: String,
        subject_type: &'static str,
        subject_id: String,
    },
}

struct TokenCache {
    token: String,
    expires_at: tokio::time::Instant,
}

pub struct BoxDetector {
    inner: Arc<Inner>,
}

struct Inner {
    params: BoxParams,
    auth: AuthMode,
    token: tokio::sync::Mutex<Option<TokenCache>>,
    http: reqwest::Client,
    events_enabled: bool,
    channel: EventChannel,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BoxDetector {
    pub fn new(params: BoxParams, events_enabled: bool) -> Result<Self> {
        let auth = match (&params.developer_token, &params.client_id, &params.client_secret) {
            (Some(token), _, _) => AuthMode::DeveloperToken(token.clone()),
            (None, Some(client_id), Some(client_secret)) => {
                let (subject_type, subject_id) = match (&params.user_id, &params.enterprise_id) {
                    (Some(user_id), _) => ("user", user_id.clone()),
                    (None, Some(enterprise_id)) => ("enterprise", enterprise_id.clone()),
                    (None, None) => {
                        return Err(DetectorError::Misconfigured(
                            "box client credentials need a user_id or enterprise_id".into(),
                        ))
                    }
                };
                AuthMode::ClientCredentials {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    subject_type,
                    subject_id,
                }
            }
            _ => {
                return Err(DetectorError::Misconfigured(
                    "box needs a developer_token or client_id + client_secret".into(),
                ))
            }
        };
        Ok(Self {
            inner: Arc::new(Inner {
                params,
                auth,
                token: tokio::sync::Mutex::new(None),
                http: reqwest::Client::new(),
                events_enabled,
                channel: EventChannel::new(256),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

#[async_trait]
impl ChangeDetector for BoxDetector {
    async fn start(&self) -> Result<()> {
        // token acquisition doubles as the auth probe
        match access_token(&self.inner).await {
            Ok(_) => {}
            Err(err) if err.is_transient() => {
                tracing::info!(%err,
                    "box token endpoint unreachable, running in periodic-only mode");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        if !self.inner.events_enabled {
            return Ok(());
        }
        match current_stream_position(&self.inner).await {
            Ok(position) => {
                let inner = self.inner.clone();
                let handle = tokio::spawn(events_loop(inner, position));
                self.inner.tasks.lock().unwrap().push(handle);
                Ok(())
            }
            Err(err) if err.is_transient() => {
                tracing::info!(%err, "box events api unreachable, running in periodic-only mode");
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
            let mut folders = vec![inner.params.folder_id.clone()];
            while let Some(folder_id) = folders.pop() {
                let mut offset = 0usize;
                loop {
                    let page = retry_transient(network_backoff(), || {
                        let inner = inner.clone();
                        let folder_id = folder_id.clone();
                        async move { list_folder_items(&inner, &folder_id, offset).await }
                    })
                    .await?;
                    let fetched = page.entries.len();
                    for item in page.entries {
                        match item.kind.as_str() {
                            "folder" => {
                                if inner.params.recursive {
                                    folders.push(item.id);
                                }
                            }
                            "file" => {
                                let path = item.display_path();
                                if !inner.params.filters.matches(&path) {
                                    continue;
                                }
                                if tx.send(Ok(item.into_metadata(path))).await.is_err() {
                                    return Ok(());
                                }
                            }
                            _ => {}
                        }
                    }
                    offset += fetched;
                    if offset >= page.total_count || fetched == 0 {
                        break;
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
            return Err(LoadError::Fatal("box documents can only be loaded by file id".into()));
        };
        let token = access_token(&self.inner).await.map_err(LoadError::from)?;
        let response = self
            .inner
            .http
            .get(format!("{API}/files/{file_id}/content"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| LoadError::from(DetectorError::from_http(err)))?;
        match response.status() {
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(|err| LoadError::from(DetectorError::from_http(err)))?),
            reqwest::StatusCode::NOT_FOUND => Err(LoadError::NotFound),
            status => Err(LoadError::from(DetectorError::from_status(status, "box download"))),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

async fn access_token(inner: &Inner) -> Result<String> {
    match &inner.auth {
        AuthMode::DeveloperToken(token) => Ok(token.clone()),
        AuthMode::ClientCredentials { client_id, client_secret, subject_type, subject_id } => {
            let mut cache = inner.token.lock().await;
            if let Some(cached) = cache.as_ref() {
                if cached.expires_at > tokio::time::Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
            let response = inner
                .http
                .post(TOKEN_URL)
                .form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("box_subject_type", subject_type),
                    ("box_subject_id", subject_id.as_str()),
                ])
                .send()
                .await
                .map_err(DetectorError::from_http)?;
            let status = response.status();
            if !status.is_success() {
                return Err(DetectorError::Auth(format!("box token request failed: {status}")));
            }
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|err| DetectorError::BadResponse(err.to_string()))?;
            let expires_at = tokio::time::Instant::now()
                + Duration::from_secs(token.expires_in.saturating_sub(60));
            *cache = Some(TokenCache { token: token.access_token.clone(), expires_at });
            Ok(token.access_token)
        }
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(inner: &Inner, url: &str) -> Result<T> {
    let token = access_token(inner).await?;
    let response = inner
        .http
        .get(url)
        .bearer_auth(token)
        .send()
        .await
        .map_err(DetectorError::from_http)?;
    let status = response.status();
    if !status.is_success() {
        return Err(DetectorError::from_status(status, "box api"));
    }
    response.json().await.map_err(|err| DetectorError::BadResponse(err.to_string()))
}

#[derive(Debug, Deserialize)]
struct FolderItemsPage {
    #[serde(default)]
    entries: Vec<BoxItem>,
    #[serde(default)]
    total_count: usize,
}

#[derive(Debug, Deserialize)]
struct BoxItem {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    modified_at: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    path_collection: Option<PathCollection>,
}

#[derive(Debug, Deserialize)]
struct PathCollection {
    #[serde(default)]
    entries: Vec<PathSegment>,
}

#[derive(Debug, Deserialize)]
struct PathSegment {
    #[serde(default)]
    name: String,
}

impl BoxItem {
    fn display_path(&self) -> String {
        match self.path_collection.as_ref() {
            Some(collection) if !collection.entries.is_empty() => {
                let mut segments: Vec<&str> =
                    collection.entries.iter().map(|segment| segment.name.as_str()).collect();
                segments.push(self.name.as_str());
                segments.join("/")
            }
            _ => self.name.clone(),
        }
    }

    fn into_metadata(self, path: String) -> FileMetadata {
        let mut metadata = FileMetadata::new(path).with_source_id(self.id);
        metadata.size = self.size;
        metadata.modified_timestamp = self
            .modified_at
            .as_deref()
            .and_then(|time| OffsetDateTime::parse(time, &Rfc3339).ok());
        metadata
    }
}

async fn list_folder_items(inner: &Inner, folder_id: &str, offset: usize) -> Result<FolderItemsPage> {
    let url = format!(
        "{API}/folders/{folder_id}/items?fields={ITEM_FIELDS}&limit=1000&offset={offset}&usemarker=false"
    );
    get_json(inner, &url).await
}

#[derive(Debug, Deserialize)]
struct EventsPage {
    #[serde(default)]
    entries: Vec<BoxEvent>,
    #[serde(default)]
    next_stream_position: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BoxEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    source: Option<BoxItem>,
}

async fn current_stream_position(inner: &Inner) -> Result<String> {
    let page: EventsPage = get_json(inner, &format!("{API}/events?stream_position=now")).await?;
    Ok(stream_position_to_string(&page.next_stream_position))
}

/// Box returns the stream position as a number or a string depending on the
/// endpoint; normalize to a string.
fn stream_position_to_string(raw: &serde_json::Value) -> String {
    match raw {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Translate one events-API entry; uninteresting event types and folder
/// sources yield `None`.
pub(crate) fn event_to_change(event: &BoxEvent, filters: &PathFilters) -> Option<ChangeEvent> {
    let change_type = match event.event_type.as_str() {
        "ITEM_CREATE" | "ITEM_UPLOAD" | "ITEM_MODIFY" | "ITEM_MOVE" | "ITEM_RENAME"
        | "ITEM_UNDELETE_VIA_TRASH" => ChangeType::Update,
        "ITEM_TRASH" => ChangeType::Delete,
        _ => return None,
    };
    let source = event.source.as_ref()?;
    if source.kind != "file" {
        return None;
    }
    let path = source.display_path();
    if change_type != ChangeType::Delete && !filters.matches(&path) {
        return None;
    }
    let mut metadata = FileMetadata::new(path).with_source_id(source.id.clone());
    metadata.size = source.size;
    metadata.modified_timestamp = source
        .modified_at
        .as_deref()
        .and_then(|time| OffsetDateTime::parse(time, &Rfc3339).ok());
    Some(ChangeEvent::new(change_type, metadata))
}

async fn events_loop(inner: Arc<Inner>, initial_position: String) {
    let Some(events_tx) = inner.channel.sender() else { return };
    let interval = Duration::from_secs(inner.params.polling_interval_seconds.max(1));
    let mut position = initial_position;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        loop {
            let url = format!("{API}/events?stream_position={position}&limit=100");
            let page: EventsPage = match get_json(&inner, &url).await {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(%err, "box events poll failed");
                    break;
                }
            };
            let drained = page.entries.is_empty();
            for event in &page.entries {
                let Some(change) = event_to_change(event, &inner.params.filters) else {
                    continue;
                };
                if events_tx.send(DetectorEvent::change(change)).await.is_err() {
                    return;
                }
            }
            let next = stream_position_to_string(&page.next_stream_position);
            if !next.is_empty() && next != "null" {
                position = next;
            }
            if drained {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_item(name: &str) -> BoxItem {
        BoxItem {
            kind: "file".into(),
            id: "f-1".into(),
            name: name.into(),
            modified_at: Some("2026-03-01T10:00:00-00:00".into()),
            size: Some(9),
            path_collection: Some(PathCollection {
                entries: vec![
                    PathSegment { name: "All Files".into() },
                    PathSegment { name: "docs".into() },
                ],
            }),
        }
    }

    #[test]
    fn uploads_map_to_update_and_trash_to_delete() {
        let event =
            BoxEvent { event_type: "ITEM_UPLOAD".into(), source: Some(file_item("a.txt")) };
        let change = event_to_change(&event, &PathFilters::default()).unwrap();
        assert_eq!(change.change_type, ChangeType::Update);
        assert_eq!(change.metadata.path, "All Files/docs/a.txt");
        assert_eq!(change.metadata.source_id.as_deref(), Some("f-1"));

        let event =
            BoxEvent { event_type: "ITEM_TRASH".into(), source: Some(file_item("a.txt")) };
        let change = event_to_change(&event, &PathFilters::default()).unwrap();
        assert_eq!(change.change_type, ChangeType::Delete);
    }

    #[test]
    fn deletes_bypass_filters_but_uploads_do_not() {
        let filters = PathFilters { prefix: None, suffixes: vec![".pdf".into()] };
        let upload =
            BoxEvent { event_type: "ITEM_UPLOAD".into(), source: Some(file_item("a.txt")) };
        assert!(event_to_change(&upload, &filters).is_none());
        let trash =
            BoxEvent { event_type: "ITEM_TRASH".into(), source: Some(file_item("a.txt")) };
        assert!(event_to_change(&trash, &filters).is_some());
    }

    #[test]
    fn stream_positions_normalize_numbers_and_strings() {
        assert_eq!(stream_position_to_string(&serde_json::json!(12345)), "12345");
        assert_eq!(stream_position_to_string(&serde_json::json!("now")), "now");
    }

    #[test]
    fn misconfigured_auth_is_rejected() {
        let params = BoxParams {
            developer_token: None,
            client_id: Some("id".into()),
            client_secret: Some("secret".into()),
            user_id: None,
            enterprise_id: None,
            folder_id: "0".into(),
            recursive: true,
            polling_interval_seconds: 60,
            filters: PathFilters::default(),
        };
        assert!(matches!(
            BoxDetector::new(params, true),
            Err(DetectorError::Misconfigured(_))
        ));
    }
}
