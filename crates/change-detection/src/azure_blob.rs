//! Azure Blob Storage detector. Requests are signed with the account's
//! Shared Key; listings come from the container enumeration API and event
//! mode follows the account's change feed at segment granularity, keeping
//! the `lastConsumable` timestamp as its continuation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::stream::BoxStream;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sync_types::{ChangeEvent, ChangeType, FileMetadata};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::retry::{network_backoff, retry_transient};
use crate::{
    spawn_listing, ChangeDetector, DetectorError, DetectorEvent, DocLocator, EventChannel,
    LoadError, PathFilters, Result,
};

const API_VERSION: &str = "2023-11-03";
const CHANGE_FEED_CONTAINER: &str = "$blobchangefeed";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureBlobParams {
    pub container: String,
    /// `https://{account}.blob.core.windows.net`; derived from
    /// `connection_string` when absent.
    #[serde(default)]
    pub account_url: Option<String>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub account_key: Option<String>,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_enable_change_feed")]
    pub enable_change_feed: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub filters: PathFilters,
}

fn default_enable_change_feed() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    60
}

pub struct AzureBlobDetector {
    inner: Arc<Inner>,
}

struct Inner {
    params: AzureBlobParams,
    account: AccountCredentials,
    http: reqwest::Client,
    events_enabled: bool,
    channel: EventChannel,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub(crate) struct AccountCredentials {
    pub(crate) account_name: String,
    pub(crate) account_url: String,
    key: Vec<u8>,
}

impl AccountCredentials {
    fn from_params(params: &AzureBlobParams) -> Result<Self> {
        if let Some(connection_string) = params.connection_string.as_deref() {
            return Self::from_connection_string(connection_string);
        }
        let account_name = params.account_name.clone().or_else(|| {
            params.account_url.as_deref().and_then(|url| {
                url.strip_prefix("https://")
                    .and_then(|rest| rest.split('.').next())
                    .map(str::to_owned)
            })
        });
        match (account_name, params.account_key.as_deref()) {
            (Some(account_name), Some(key)) => {
                let account_url = params
                    .account_url
                    .clone()
                    .unwrap_or_else(|| format!("https://{account_name}.blob.core.windows.net"));
                let key = BASE64.decode(key).map_err(|err| {
                    DetectorError::Misconfigured(format!("invalid azure account key: {err}"))
                })?;
                Ok(Self { account_name, account_url, key })
            }
            _ => Err(DetectorError::Misconfigured(
                "azure_blob needs (account_url or account_name) + account_key, or a connection_string"
                    .into(),
            )),
        }
    }

    fn from_connection_string(connection_string: &str) -> Result<Self> {
        let mut account_name = None;
        let mut account_key = None;
        let mut endpoint_suffix = "core.windows.net".to_owned();
        for pair in connection_string.split(';') {
            let Some((name, value)) = pair.split_once('=') else { continue };
            match name {
                "AccountName" => account_name = Some(value.to_owned()),
                // the key is base64 and may itself contain `=` padding
                "AccountKey" => {
                    account_key = Some(pair["AccountKey=".len()..].to_owned());
                }
                "EndpointSuffix" => endpoint_suffix = value.to_owned(),
                _ => {}
            }
        }
        match (account_name, account_key) {
            (Some(account_name), Some(key)) => {
                let key = BASE64.decode(key.as_bytes()).map_err(|err| {
                    DetectorError::Misconfigured(format!("invalid azure account key: {err}"))
                })?;
                let account_url = format!("https://{account_name}.blob.{endpoint_suffix}");
                Ok(Self { account_name, account_url, key })
            }
            _ => Err(DetectorError::Misconfigured(
                "azure_blob connection_string is missing AccountName or AccountKey".into(),
            )),
        }
    }

    /// Shared Key authorization for a GET without body or extra headers; the
    /// only canonical headers we ever send are `x-ms-date` and
    /// `x-ms-version`.
    pub(crate) fn authorization(
        &self,
        date: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> String {
        let mut canonical_resource = format!("/{}{}", self.account_name, path);
        let mut sorted: Vec<_> = query.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in sorted {
            canonical_resource.push_str(&format!("\n{name}:{value}"));
        }
        let string_to_sign = format!(
            "GET\n\n\n\n\n\n\n\n\n\n\n\nx-ms-date:{date}\nx-ms-version:{API_VERSION}\n{canonical_resource}"
        );
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        format!("SharedKey {}:{}", self.account_name, signature)
    }
}

impl AzureBlobDetector {
    pub fn new(params: AzureBlobParams, events_enabled: bool) -> Result<Self> {
        let account = AccountCredentials::from_params(&params)?;
        Ok(Self {
            inner: Arc::new(Inner {
                params,
                account,
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
impl ChangeDetector for AzureBlobDetector {
    async fn start(&self) -> Result<()> {
        if !self.inner.events_enabled || !self.inner.params.enable_change_feed {
            return Ok(());
        }
        // one cheap read tells us whether the feed exists at all
        match read_segments_manifest(&self.inner).await {
            Ok(Some(_)) => {
                let inner = self.inner.clone();
                let handle = tokio::spawn(change_feed_loop(inner));
                self.inner.tasks.lock().unwrap().push(handle);
                Ok(())
            }
            Ok(None) => {
                tracing::info!(
                    container = %self.inner.params.container,
                    "azure change feed not enabled on the account, running in periodic-only mode"
                );
                Ok(())
            }
            Err(err) if err.is_transient() => {
                tracing::info!(%err,
                    "azure change feed unreachable, running in periodic-only mode");
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
            let mut marker: Option<String> = None;
            loop {
                let page = retry_transient(network_backoff(), || {
                    let inner = inner.clone();
                    let marker = marker.clone();
                    async move {
                        list_blobs_page(
                            &inner,
                            &inner.params.container,
                            &inner.params.prefix,
                            marker.as_deref(),
                        )
                        .await
                    }
                })
                .await?;
                for blob in page.blobs {
                    if !inner.params.filters.matches(&blob.path) {
                        continue;
                    }
                    let mut file = FileMetadata::new(blob.path);
                    file.size = blob.size;
                    file.modified_timestamp = blob.modified;
                    if tx.send(Ok(file)).await.is_err() {
                        return Ok(());
                    }
                }
                match page.next_marker {
                    Some(next) => marker = Some(next),
                    None => return Ok(()),
                }
            }
        })
    }

    fn subscribe(&self) -> BoxStream<'static, DetectorEvent> {
        self.inner.channel.subscribe()
    }

    async fn load(&self, locator: &DocLocator) -> Result<Bytes, LoadError> {
        let path = format!(
            "/{}/{}",
            self.inner.params.container,
            urlencoding::encode(&locator.path).replace("%2F", "/")
        );
        let response = signed_get(&self.inner, &path, &[])
            .await
            .map_err(LoadError::from)?;
        match response.status() {
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(|err| LoadError::from(DetectorError::from_http(err)))?),
            reqwest::StatusCode::NOT_FOUND => Err(LoadError::NotFound),
            status => {
                Err(LoadError::from(DetectorError::from_status(status, "azure get blob")))
            }
        }
    }
}

fn rfc1123_now() -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    OffsetDateTime::now_utc().format(&format).expect("static format")
}

async fn signed_get(
    inner: &Inner,
    path: &str,
    query: &[(&str, &str)],
) -> Result<reqwest::Response> {
    let date = rfc1123_now();
    let authorization = inner.account.authorization(&date, path, query);
    let mut url = format!("{}{}", inner.account.account_url, path);
    if !query.is_empty() {
        let encoded: Vec<String> = query
            .iter()
            .map(|(name, value)| format!("{name}={}", urlencoding::encode(value)))
            .collect();
        url = format!("{url}?{}", encoded.join("&"));
    }
    inner
        .http
        .get(url)
        .header("x-ms-date", date)
        .header("x-ms-version", API_VERSION)
        .header("Authorization", authorization)
        .send()
        .await
        .map_err(DetectorError::from_http)
}

pub(crate) struct BlobPage {
    pub(crate) blobs: Vec<BlobEntry>,
    pub(crate) next_marker: Option<String>,
}

pub(crate) struct BlobEntry {
    pub(crate) path: String,
    pub(crate) size: Option<u64>,
    pub(crate) modified: Option<OffsetDateTime>,
}

async fn list_blobs_page(
    inner: &Inner,
    container: &str,
    prefix: &str,
    marker: Option<&str>,
) -> Result<BlobPage> {
    let path = format!("/{container}");
    let mut query: Vec<(&str, &str)> = vec![("comp", "list"), ("restype", "container")];
    if !prefix.is_empty() {
        query.push(("prefix", prefix));
    }
    if let Some(marker) = marker {
        query.push(("marker", marker));
    }
    let response = signed_get(inner, &path, &query).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DetectorError::from_status(status, "azure list blobs"));
    }
    let body = response.text().await.map_err(DetectorError::from_http)?;
    parse_blob_listing(&body)
}

/// Parse the `EnumerationResults` XML of a container listing.
pub(crate) fn parse_blob_listing(body: &str) -> Result<BlobPage> {
    let document = roxmltree::Document::parse(body)
        .map_err(|err| DetectorError::BadResponse(format!("unparsable blob listing: {err}")))?;
    let root = document.root_element();
    let mut blobs = Vec::new();
    let rfc1123 = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );

    for blob in root.descendants().filter(|node| node.has_tag_name("Blob")) {
        let Some(name) = blob
            .children()
            .find(|node| node.has_tag_name("Name"))
            .and_then(|node| node.text())
        else {
            continue;
        };
        let mut entry = BlobEntry { path: name.to_owned(), size: None, modified: None };
        if let Some(properties) =
            blob.children().find(|node| node.has_tag_name("Properties"))
        {
            for property in properties.children() {
                match property.tag_name().name() {
                    "Content-Length" => {
                        entry.size = property.text().and_then(|text| text.parse().ok());
                    }
                    "Last-Modified" => {
                        entry.modified = property.text().and_then(|text| {
                            PrimitiveDateTime::parse(text, &rfc1123)
                                .ok()
                                .map(PrimitiveDateTime::assume_utc)
                        });
                    }
                    _ => {}
                }
            }
        }
        blobs.push(entry);
    }

    let next_marker = root
        .descendants()
        .find(|node| node.has_tag_name("NextMarker"))
        .and_then(|node| node.text())
        .filter(|text| !text.is_empty())
        .map(str::to_owned);
    Ok(BlobPage { blobs, next_marker })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentsManifest {
    last_consumable: String,
}

/// `meta/segments.json` of the change-feed container, or `None` when the
/// account has no change feed.
async fn read_segments_manifest(inner: &Inner) -> Result<Option<OffsetDateTime>> {
    let path = format!("/{CHANGE_FEED_CONTAINER}/meta/segments.json");
    let response = signed_get(inner, &path, &[]).await?;
    match response.status() {
        status if status.is_success() => {
            let manifest: SegmentsManifest = response
                .json()
                .await
                .map_err(|err| DetectorError::BadResponse(err.to_string()))?;
            let last_consumable = OffsetDateTime::parse(&manifest.last_consumable, &Rfc3339)
                .map_err(|err| {
                    DetectorError::BadResponse(format!("bad lastConsumable: {err}"))
                })?;
            Ok(Some(last_consumable))
        }
        reqwest::StatusCode::NOT_FOUND => Ok(None),
        status => Err(DetectorError::from_status(status, "azure change feed manifest")),
    }
}

/// The earliest hour the feed still retains, read from the segment index.
async fn earliest_retained_segment(inner: &Inner) -> Result<Option<OffsetDateTime>> {
    let page = list_blobs_page(inner, CHANGE_FEED_CONTAINER, "idx/segments/", None).await?;
    let earliest = page.blobs.iter().find_map(|blob| parse_segment_start(&blob.path));
    Ok(earliest)
}

/// Segment manifests are laid out as `idx/segments/{year}/{month}/{day}/{hhmm}/meta.json`.
pub(crate) fn parse_segment_start(path: &str) -> Option<OffsetDateTime> {
    let mut parts = path.strip_prefix("idx/segments/")?.split('/');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let day: u8 = parts.next()?.parse().ok()?;
    let hhmm = parts.next()?;
    if hhmm.len() != 4 {
        return None;
    }
    let hour: u8 = hhmm[..2].parse().ok()?;
    let minute: u8 = hhmm[2..].parse().ok()?;
    let date = time::Date::from_calendar_date(year, time::Month::try_from(month).ok()?, day).ok()?;
    let time = time::Time::from_hms(hour, minute, 0).ok()?;
    Some(date.with_time(time).assume_utc())
}

/// Poll the feed manifest; when `lastConsumable` advances, narrow the new
/// window to concrete blobs with a filtered listing and synthesize events.
/// A cursor that predates the retained segments means the feed moved on
/// without us: emit `Resync`.
async fn change_feed_loop(inner: Arc<Inner>) {
    let Some(events_tx) = inner.channel.sender() else { return };
    let interval = Duration::from_secs(inner.params.poll_interval_seconds.max(1));
    let mut cursor: Option<OffsetDateTime> = None;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let last_consumable = match read_segments_manifest(&inner).await {
            Ok(Some(last_consumable)) => last_consumable,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(%err, "azure change feed manifest read failed");
                continue;
            }
        };
        let Some(previous) = cursor else {
            // first poll: everything up to here belongs to the initial
            // reconciliation, not to the feed
            cursor = Some(last_consumable);
            continue;
        };
        if last_consumable <= previous {
            continue;
        }

        match earliest_retained_segment(&inner).await {
            Ok(Some(earliest)) if earliest > previous => {
                tracing::warn!("azure change feed no longer retains our cursor, resyncing");
                if events_tx.send(DetectorEvent::Resync).await.is_err() {
                    return;
                }
                cursor = Some(last_consumable);
                continue;
            }
            Err(err) => {
                tracing::warn!(%err, "azure change feed segment index read failed");
                continue;
            }
            _ => {}
        }

        // narrow the changed window to blobs, by modification time
        let mut marker: Option<String> = None;
        let mut advanced = true;
        loop {
            let page = match list_blobs_page(
                &inner,
                &inner.params.container,
                &inner.params.prefix,
                marker.as_deref(),
            )
            .await
            {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(%err, "azure change window listing failed");
                    advanced = false;
                    break;
                }
            };
            for blob in page.blobs {
                let Some(modified) = blob.modified else { continue };
                if modified <= previous || modified > last_consumable {
                    continue;
                }
                if !inner.params.filters.matches(&blob.path) {
                    continue;
                }
                let mut metadata = FileMetadata::new(blob.path);
                metadata.size = blob.size;
                metadata.modified_timestamp = Some(modified);
                let event = ChangeEvent::new(ChangeType::Update, metadata);
                if events_tx.send(DetectorEvent::change(event)).await.is_err() {
                    return;
                }
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        if advanced {
            cursor = Some(last_consumable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_strings_are_parsed() {
        let account = AccountCredentials::from_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=docs;AccountKey=a2V5a2V5a2V5;EndpointSuffix=core.windows.net",
        )
        .unwrap();
        assert_eq!(account.account_name, "docs");
        assert_eq!(account.account_url, "https://docs.blob.core.windows.net");
    }

    #[test]
    fn shared_key_signature_is_deterministic_and_order_insensitive() {
        let account = AccountCredentials {
            account_name: "docs".into(),
            account_url: "https://docs.blob.core.windows.net".into(),
            key: b"0123456789abcdef".to_vec(),
        };
        let date = "Mon, 02 Mar 2026 10:00:00 GMT";
        let one = account.authorization(
            date,
            "/container",
            &[("comp", "list"), ("restype", "container")],
        );
        // query order must not change the canonical resource
        let two = account.authorization(
            date,
            "/container",
            &[("restype", "container"), ("comp", "list")],
        );
        assert_eq!(one, two);
        assert!(one.starts_with("SharedKey docs:"));
        // base64 of a 32-byte mac
        assert_eq!(one.len(), "SharedKey docs:".len() + 44);

        let other_date = account.authorization(
            "Mon, 02 Mar 2026 10:00:01 GMT",
            "/container",
            &[("comp", "list"), ("restype", "container")],
        );
        assert_ne!(one, other_date);
    }

    #[test]
    fn blob_listings_surface_names_sizes_and_markers() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ContainerName="docs">
  <Blobs>
    <Blob>
      <Name>inbox/a.txt</Name>
      <Properties>
        <Last-Modified>Mon, 02 Mar 2026 10:00:00 GMT</Last-Modified>
        <Content-Length>11</Content-Length>
      </Properties>
    </Blob>
  </Blobs>
  <NextMarker>marker-2</NextMarker>
</EnumerationResults>"#;
        let page = parse_blob_listing(body).unwrap();
        assert_eq!(page.blobs.len(), 1);
        assert_eq!(page.blobs[0].path, "inbox/a.txt");
        assert_eq!(page.blobs[0].size, Some(11));
        assert!(page.blobs[0].modified.is_some());
        assert_eq!(page.next_marker.as_deref(), Some("marker-2"));
    }

    #[test]
    fn segment_paths_decode_to_their_start_hour() {
        let start = parse_segment_start("idx/segments/2026/03/02/1000/meta.json").unwrap();
        assert_eq!(start.to_string(), "2026-03-02 10:00:00.0 +00:00:00");
        assert!(parse_segment_start("idx/segments/garbage").is_none());
    }
}
