//! Google Cloud Storage detector: bucket enumeration through the JSON API
//! client, event mode through a Pub/Sub subscription receiving the bucket's
//! notifications, acked only once the engine has committed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use google_cloud_auth::credentials::CredentialsFile;
use google_cloud_pubsub::client::{Client as PubsubClient, ClientConfig as PubsubClientConfig};
use google_cloud_pubsub::subscription::Subscription;
use google_cloud_storage::client::{Client as StorageClient, ClientConfig as StorageClientConfig};
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::Error as StorageError;
use serde::Deserialize;
use sync_types::{ChangeEvent, ChangeType, FileMetadata};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::retry::{network_backoff, retry_transient};
use crate::{
    spawn_listing, AckOutcome, ChangeDetector, DetectorError, DetectorEvent, DocLocator,
    EventAck, EventChannel, LoadError, PathFilters, Result,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsParams {
    pub bucket: String,
    /// Service-account JSON, verbatim.
    pub credentials: serde_json::Value,
    #[serde(default)]
    pub prefix: String,
    /// Enables event mode when set: `projects/{p}/subscriptions/{s}` or the
    /// bare subscription id.
    #[serde(default)]
    pub pubsub_subscription: Option<String>,
    #[serde(default)]
    pub filters: PathFilters,
}

pub struct GcsDetector {
    inner: Arc<Inner>,
}

struct Inner {
    params: GcsParams,
    storage: StorageClient,
    events_enabled: bool,
    channel: EventChannel,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GcsDetector {
    pub async fn new(params: GcsParams, events_enabled: bool) -> Result<Self> {
        let credentials = credentials_file(&params.credentials)?;
        let config = StorageClientConfig::default()
            .with_credentials(credentials)
            .await
            .map_err(|err| DetectorError::Auth(format!("gcs credentials rejected: {err}")))?;
        let storage = StorageClient::new(config);
        Ok(Self {
            inner: Arc::new(Inner {
                params,
                storage,
                events_enabled,
                channel: EventChannel::new(256),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

fn credentials_file(raw: &serde_json::Value) -> Result<CredentialsFile> {
    serde_json::from_value(raw.clone()).map_err(|err| {
        DetectorError::Misconfigured(format!("invalid gcs service-account json: {err}"))
    })
}

#[async_trait]
impl ChangeDetector for GcsDetector {
    async fn start(&self) -> Result<()> {
        let Some(subscription) = self.inner.params.pubsub_subscription.clone() else {
            return Ok(());
        };
        if !self.inner.events_enabled {
            return Ok(());
        }

        let credentials = credentials_file(&self.inner.params.credentials)?;
        let config = match PubsubClientConfig::default().with_credentials(credentials).await {
            Ok(config) => config,
            Err(err) => {
                return Err(DetectorError::Auth(format!("pub/sub credentials rejected: {err}")))
            }
        };
        let client = match PubsubClient::new(config).await {
            Ok(client) => client,
            Err(err) => {
                tracing::info!(%err,
                    "pub/sub unreachable, gcs source running in periodic-only mode");
                return Ok(());
            }
        };
        let subscription = client.subscription(&subscription);

        let inner = self.inner.clone();
        let handle = tokio::spawn(pubsub_pull_loop(inner, subscription));
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
            let mut page_token: Option<String> = None;
            loop {
                let response = retry_transient(network_backoff(), || {
                    let inner = inner.clone();
                    let page_token = page_token.clone();
                    async move {
                        inner
                            .storage
                            .list_objects(&ListObjectsRequest {
                                bucket: inner.params.bucket.clone(),
                                prefix: (!inner.params.prefix.is_empty())
                                    .then(|| inner.params.prefix.clone()),
                                page_token,
                                ..Default::default()
                            })
                            .await
                            .map_err(classify_storage_error)
                    }
                })
                .await?;

                for object in response.items.unwrap_or_default() {
                    if !inner.params.filters.matches(&object.name) {
                        continue;
                    }
                    // the object name is the stable identity in GCS; the
                    // generation is a version, not an id
                    let mut file =
                        FileMetadata::new(object.name.clone()).with_size(object.size.max(0) as u64);
                    if let Some(updated) = object.updated {
                        file = file.with_modified(updated);
                    }
                    if tx.send(Ok(file)).await.is_err() {
                        return Ok(());
                    }
                }
                match response.next_page_token {
                    Some(token) if !token.is_empty() => page_token = Some(token),
                    _ => return Ok(()),
                }
            }
        })
    }

    fn subscribe(&self) -> BoxStream<'static, DetectorEvent> {
        self.inner.channel.subscribe()
    }

    async fn load(&self, locator: &DocLocator) -> Result<Bytes, LoadError> {
        let bytes = self
            .inner
            .storage
            .download_object(
                &GetObjectRequest {
                    bucket: self.inner.params.bucket.clone(),
                    object: locator.path.clone(),
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|err| match err {
                StorageError::Response(response) if response.code == 404 => LoadError::NotFound,
                other => LoadError::from(classify_storage_error(other)),
            })?;
        Ok(Bytes::from(bytes))
    }
}

fn classify_storage_error(err: StorageError) -> DetectorError {
    match err {
        StorageError::Response(response) => match response.code {
            401 | 403 => DetectorError::Auth(format!("gcs: {}", response.message)),
            408 | 429 | 500..=599 => {
                DetectorError::Transient(format!("gcs: {}", response.message))
            }
            code => DetectorError::BadResponse(format!("gcs: {code} {}", response.message)),
        },
        StorageError::HttpClient(err) => DetectorError::from_http(err),
        other => DetectorError::BadResponse(other.to_string()),
    }
}

/// Pull loop with ack-on-commit: messages stay leased until the engine
/// settles them; a failed settle nacks for prompt redelivery.
async fn pubsub_pull_loop(inner: Arc<Inner>, subscription: Subscription) {
    let Some(events_tx) = inner.channel.sender() else { return };
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<AckOutcome>();
    let mut pending: HashMap<String, google_cloud_pubsub::subscriber::ReceivedMessage> =
        HashMap::new();

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            outcome = ack_rx.recv() => {
                let Some(outcome) = outcome else { return };
                if let Some(message) = pending.remove(&outcome.token) {
                    let result = if outcome.success {
                        message.ack().await
                    } else {
                        message.nack().await
                    };
                    if let Err(err) = result {
                        tracing::warn!(%err, "pub/sub settle failed");
                    }
                }
            }
            pulled = subscription.pull(64, None) => {
                let messages = match pulled {
                    Ok(messages) => messages,
                    Err(err) => {
                        tracing::warn!(%err, "pub/sub pull failed, backing off");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                for message in messages {
                    let Some(event) =
                        notification_to_event(&message.message.attributes, &inner.params.filters)
                    else {
                        let _ = message.ack().await;
                        continue;
                    };
                    let token = message.ack_id().to_owned();
                    let ack = EventAck::new(ack_tx.clone(), token.clone());
                    pending.insert(token, message);
                    if events_tx
                        .send(DetectorEvent::Change { event, ack: Some(ack) })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
}

/// GCS notifications carry everything we need in the message attributes.
pub(crate) fn notification_to_event(
    attributes: &std::collections::HashMap<String, String>,
    filters: &PathFilters,
) -> Option<ChangeEvent> {
    let object_id = attributes.get("objectId")?;
    if !filters.matches(object_id) {
        return None;
    }
    let change_type = match attributes.get("eventType").map(String::as_str) {
        Some("OBJECT_FINALIZE") => ChangeType::Update,
        Some("OBJECT_DELETE") | Some("OBJECT_ARCHIVE") => {
            // a delete notification for a superseded generation follows every
            // overwrite; the overwrite itself already produced a FINALIZE
            if attributes.contains_key("overwrittenByGeneration") {
                return None;
            }
            ChangeType::Delete
        }
        _ => return None,
    };
    Some(ChangeEvent::new(change_type, FileMetadata::new(object_id.clone())))
}
