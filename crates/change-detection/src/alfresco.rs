//! Alfresco detector: REST v1 listing and content download with basic auth;
//! event mode subscribes to the repository event topic through the message
//! broker's MQTT transport when one is configured and reachable.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
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

/// ActiveMQ exposes the repo event topic over its MQTT transport with dots
/// mapped to slashes.
const EVENT_TOPIC: &str = "alfresco/repo/event2";
const PAGE_SIZE: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventMode {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlfrescoParams {
    /// Base url of the repository, e.g. `https://alfresco.example.com`.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Folder path below the company home, e.g. `/Sites/docs/documentLibrary`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default)]
    pub event_mode: EventMode,
    /// Host of the ActiveMQ broker; `mqtt://host:1883` or plain `host:port`.
    #[serde(default)]
    pub broker_url: Option<String>,
    #[serde(default)]
    pub filters: PathFilters,
}

fn default_recursive() -> bool {
    true
}

pub struct AlfrescoDetector {
    inner: Arc<Inner>,
}

struct Inner {
    params: AlfrescoParams,
    http: reqwest::Client,
    events_enabled: bool,
    channel: EventChannel,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AlfrescoDetector {
    pub fn new(params: AlfrescoParams, events_enabled: bool) -> Result<Self> {
        if params.url.is_empty() {
            return Err(DetectorError::Misconfigured("alfresco url must not be empty".into()));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                params,
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
impl ChangeDetector for AlfrescoDetector {
    async fn start(&self) -> Result<()> {
        if !self.inner.events_enabled || self.inner.params.event_mode == EventMode::Off {
            return Ok(());
        }
        let Some((host, port)) = broker_address(&self.inner.params) else {
            if self.inner.params.event_mode == EventMode::On {
                return Err(DetectorError::Misconfigured(
                    "alfresco event_mode=on needs a broker_url".into(),
                ));
            }
            return Ok(());
        };

        let mut options = MqttOptions::new(
            format!("syncline-{}", uuid_fragment()),
            host,
            port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut event_loop) = AsyncClient::new(options, 64);

        // the first poll tells us whether the broker is reachable at all
        match event_loop.poll().await {
            Ok(_) => {}
            Err(err) => {
                tracing::info!(%err,
                    "alfresco event broker unreachable, running in periodic-only mode");
                return Ok(());
            }
        }
        if let Err(err) = client.subscribe(EVENT_TOPIC, QoS::AtLeastOnce).await {
            tracing::info!(%err,
                "alfresco event topic unavailable, running in periodic-only mode");
            return Ok(());
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let Some(events_tx) = inner.channel.sender() else { return };
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        let _ = client.disconnect().await;
                        return;
                    }
                    polled = event_loop.poll() => {
                        match polled {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                let Ok(body) = std::str::from_utf8(&publish.payload) else {
                                    continue;
                                };
                                let Some(event) = parse_repo_event(body, &inner.params.filters)
                                else {
                                    continue;
                                };
                                if events_tx.send(DetectorEvent::change(event)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(%err, "alfresco broker connection lost, retrying");
                                tokio::time::sleep(Duration::from_secs(5)).await;
                            }
                        }
                    }
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
        Ok(())
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
            let mut roots: Vec<String> = if inner.params.node_ids.is_empty() {
                vec!["-root-".to_owned()]
            } else {
                inner.params.node_ids.clone()
            };
            // `path` narrows the single root; node_ids are used verbatim
            if let (Some(path), true) =
                (inner.params.path.as_deref(), inner.params.node_ids.is_empty())
            {
                let node = retry_transient(network_backoff(), || {
                    let inner = inner.clone();
                    let path = path.to_owned();
                    async move { resolve_relative_path(&inner, &path).await }
                })
                .await?;
                roots = vec![node];
            }

            while let Some(node_id) = roots.pop() {
                let mut skip_count = 0;
                loop {
                    let page = retry_transient(network_backoff(), || {
                        let inner = inner.clone();
                        let node_id = node_id.clone();
                        async move { list_children(&inner, &node_id, skip_count).await }
                    })
                    .await?;
                    let fetched = page.entries.len();
                    let has_more = page.pagination.has_more_items;
                    for wrapper in page.entries {
                        let node = wrapper.entry;
                        if node.is_folder {
                            if inner.params.recursive {
                                roots.push(node.id);
                            }
                            continue;
                        }
                        if !node.is_file {
                            continue;
                        }
                        let path = node.display_path();
                        if !inner.params.filters.matches(&path) {
                            continue;
                        }
                        if tx.send(Ok(node.into_metadata(path))).await.is_err() {
                            return Ok(());
                        }
                    }
                    if !has_more || fetched == 0 {
                        break;
                    }
                    skip_count += fetched;
                }
            }
            Ok(())
        })
    }

    fn subscribe(&self) -> BoxStream<'static, DetectorEvent> {
        self.inner.channel.subscribe()
    }

    async fn load(&self, locator: &DocLocator) -> Result<Bytes, LoadError> {
        let node_id = match locator.source_id.as_deref() {
            Some(node_id) => node_id.to_owned(),
            None => resolve_relative_path(&self.inner, &locator.path)
                .await
                .map_err(LoadError::from)?,
        };
        let url = format!("{}/{}/nodes/{node_id}/content", self.inner.params.url, API_BASE);
        let response = self
            .inner
            .http
            .get(url)
            .basic_auth(&self.inner.params.username, Some(&self.inner.params.password))
            .send()
            .await
            .map_err(|err| LoadError::from(DetectorError::from_http(err)))?;
        match response.status() {
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(|err| LoadError::from(DetectorError::from_http(err)))?),
            reqwest::StatusCode::NOT_FOUND => Err(LoadError::NotFound),
            status => {
                Err(LoadError::from(DetectorError::from_status(status, "alfresco content")))
            }
        }
    }
}

const API_BASE: &str = "alfresco/api/-default-/public/alfresco/versions/1";

fn broker_address(params: &AlfrescoParams) -> Option<(String, u16)> {
    let raw = params.broker_url.as_deref()?;
    let raw = raw.strip_prefix("mqtt://").or_else(|| raw.strip_prefix("tcp://")).unwrap_or(raw);
    match raw.rsplit_once(':') {
        Some((host, port)) => Some((host.to_owned(), port.parse().ok()?)),
        None => Some((raw.to_owned(), 1883)),
    }
}

fn uuid_fragment() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeChildrenPage {
    #[serde(default)]
    entries: Vec<NodeEntryWrapper>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    #[serde(default)]
    has_more_items: bool,
}

#[derive(Debug, Deserialize)]
struct NodeEntryWrapper {
    entry: NodeEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeEntry {
    id: String,
    name: String,
    #[serde(default)]
    is_file: bool,
    #[serde(default)]
    is_folder: bool,
    #[serde(default)]
    modified_at: Option<String>,
    #[serde(default)]
    content: Option<NodeContent>,
    #[serde(default)]
    path: Option<NodePath>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeContent {
    #[serde(default)]
    size_in_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NodePath {
    #[serde(default)]
    name: Option<String>,
}

impl NodeEntry {
    fn display_path(&self) -> String {
        match self.path.as_ref().and_then(|path| path.name.as_deref()) {
            Some(parent) => format!("{parent}/{}", self.name),
            None => self.name.clone(),
        }
    }

    fn into_metadata(self, path: String) -> FileMetadata {
        let mut metadata = FileMetadata::new(path).with_source_id(self.id);
        metadata.size = self.content.and_then(|content| content.size_in_bytes);
        metadata.modified_timestamp = self
            .modified_at
            .as_deref()
            .and_then(|time| OffsetDateTime::parse(time, &Rfc3339).ok());
        metadata
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(inner: &Inner, url: &str) -> Result<T> {
    let response = inner
        .http
        .get(url)
        .basic_auth(&inner.params.username, Some(&inner.params.password))
        .send()
        .await
        .map_err(DetectorError::from_http)?;
    let status = response.status();
    if !status.is_success() {
        return Err(DetectorError::from_status(status, "alfresco api"));
    }
    response
        .json()
        .await
        .map_err(|err| DetectorError::BadResponse(format!("bad alfresco response: {err}")))
}

async fn list_children(inner: &Inner, node_id: &str, skip_count: usize) -> Result<NodeChildrenPage> {
    let url = format!(
        "{}/{API_BASE}/nodes/{node_id}/children?include=path&skipCount={skip_count}&maxItems={PAGE_SIZE}",
        inner.params.url
    );
    let page: ListWrapper = get_json(inner, &url).await?;
    Ok(page.list)
}

#[derive(Debug, Deserialize)]
struct ListWrapper {
    list: NodeChildrenPage,
}

async fn resolve_relative_path(inner: &Inner, path: &str) -> Result<String> {
    let relative = path.trim_start_matches('/');
    let url = format!(
        "{}/{API_BASE}/nodes/-root-?relativePath={}",
        inner.params.url,
        urlencoding::encode(relative)
    );
    let node: NodeEntryWrapper = get_json(inner, &url).await?;
    Ok(node.entry.id)
}

#[derive(Debug, Deserialize)]
struct RepoEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: Option<RepoEventData>,
}

#[derive(Debug, Deserialize)]
struct RepoEventData {
    #[serde(default)]
    resource: Option<RepoResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoResource {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    is_file: Option<bool>,
    #[serde(default)]
    modified_at: Option<String>,
}

/// Map a repo `event2` JSON payload onto a change event. Only file
/// resources are interesting; folders and association events are dropped.
/// The path of a deleted node is no longer resolvable, so deletes ride on
/// the node id and the engine's source-id index.
pub(crate) fn parse_repo_event(body: &str, filters: &PathFilters) -> Option<ChangeEvent> {
    let event: RepoEvent = serde_json::from_str(body).ok()?;
    let change_type = if event.kind.ends_with("node.Created") {
        ChangeType::Create
    } else if event.kind.ends_with("node.Updated") {
        ChangeType::Update
    } else if event.kind.ends_with("node.Deleted") {
        ChangeType::Delete
    } else {
        return None;
    };
    let resource = event.data?.resource?;
    if resource.is_file == Some(false) {
        return None;
    }
    let id = resource.id?;
    let name = resource.name.unwrap_or_default();
    if change_type != ChangeType::Delete && !name.is_empty() && !filters.matches(&name) {
        return None;
    }
    let mut metadata = FileMetadata::new(name).with_source_id(id);
    metadata.modified_timestamp = resource
        .modified_at
        .as_deref()
        .and_then(|time| OffsetDateTime::parse(time, &Rfc3339).ok());
    Some(ChangeEvent::new(change_type, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_created_and_deleted_events_are_mapped() {
        let created = serde_json::json!({
            "type": "org.alfresco.event.node.Created",
            "data": { "resource": {
                "id": "node-1",
                "name": "report.pdf",
                "isFile": true,
                "modifiedAt": "2026-03-01T10:00:00.000Z"
            }}
        })
        .to_string();
        let event = parse_repo_event(&created, &PathFilters::default()).unwrap();
        assert_eq!(event.change_type, ChangeType::Create);
        assert_eq!(event.metadata.source_id.as_deref(), Some("node-1"));
        assert!(event.metadata.modified_timestamp.is_some());

        let deleted = serde_json::json!({
            "type": "org.alfresco.event.node.Deleted",
            "data": { "resource": { "id": "node-1", "name": "report.pdf", "isFile": true } }
        })
        .to_string();
        let event = parse_repo_event(&deleted, &PathFilters::default()).unwrap();
        assert_eq!(event.change_type, ChangeType::Delete);
    }

    #[test]
    fn folder_and_permission_events_are_dropped() {
        let folder = serde_json::json!({
            "type": "org.alfresco.event.node.Created",
            "data": { "resource": { "id": "node-2", "name": "stuff", "isFile": false } }
        })
        .to_string();
        assert!(parse_repo_event(&folder, &PathFilters::default()).is_none());

        let assoc = serde_json::json!({
            "type": "org.alfresco.event.assoc.peer.Created",
            "data": { "resource": { "id": "x" } }
        })
        .to_string();
        assert!(parse_repo_event(&assoc, &PathFilters::default()).is_none());
    }

    #[test]
    fn broker_addresses_accept_schemes_and_bare_hosts() {
        let mut params = AlfrescoParams {
            url: "https://alfresco.example.com".into(),
            username: "admin".into(),
            password: "admin".into(),
            path: None,
            node_ids: Vec::new(),
            recursive: true,
            event_mode: EventMode::Auto,
            broker_url: Some("mqtt://activemq:1884".into()),
            filters: PathFilters::default(),
        };
        assert_eq!(broker_address(&params), Some(("activemq".into(), 1884)));
        params.broker_url = Some("activemq".into());
        assert_eq!(broker_address(&params), Some(("activemq".into(), 1883)));
        params.broker_url = None;
        assert_eq!(broker_address(&params), None);
    }

    #[tokio::test]
    async fn listing_walks_children_pages() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let page = serde_json::json!({
            "list": {
                "pagination": { "hasMoreItems": false },
                "entries": [
                    { "entry": {
                        "id": "doc-1", "name": "a.txt", "isFile": true, "isFolder": false,
                        "modifiedAt": "2026-03-01T10:00:00.000Z",
                        "content": { "sizeInBytes": 5 },
                        "path": { "name": "/Company Home/docs" }
                    }},
                    { "entry": {
                        "id": "folder-1", "name": "sub", "isFile": false, "isFolder": true
                    }}
                ]
            }
        });
        Mock::given(method("GET"))
            .and(path(format!("/{API_BASE}/nodes/-root-/children")))
            .and(query_param("skipCount", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page))
            .mount(&server)
            .await;
        let empty = serde_json::json!({
            "list": { "pagination": { "hasMoreItems": false }, "entries": [] }
        });
        Mock::given(method("GET"))
            .and(path(format!("/{API_BASE}/nodes/folder-1/children")))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty))
            .mount(&server)
            .await;

        let params = AlfrescoParams {
            url: server.uri(),
            username: "admin".into(),
            password: "admin".into(),
            path: None,
            node_ids: Vec::new(),
            recursive: true,
            event_mode: EventMode::Off,
            broker_url: None,
            filters: PathFilters::default(),
        };
        let detector = AlfrescoDetector::new(params, true).unwrap();
        use futures::StreamExt;
        let files: Vec<_> = detector.list_all().map(|entry| entry.unwrap()).collect().await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "/Company Home/docs/a.txt");
        assert_eq!(files[0].source_id.as_deref(), Some("doc-1"));
        assert_eq!(files[0].size, Some(5));
    }
}
