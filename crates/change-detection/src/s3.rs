//! S3 detector: presigned `ListObjectsV2`/`GetObject` requests executed over
//! plain HTTP, and an optional SQS consumer reading the bucket's event
//! notifications (directly or SNS-wrapped).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::config::{BehaviorVersion, Credentials as SqsCredentials, Region};
use bytes::Bytes;
use futures::stream::BoxStream;
use rusty_s3::actions::ListObjectsV2;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use serde::Deserialize;
use sync_types::{ChangeEvent, ChangeType, FileMetadata};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::retry::{network_backoff, retry_transient};
use crate::{
    spawn_listing, AckOutcome, ChangeDetector, DetectorError, DetectorEvent, DocLocator,
    EventAck, EventChannel, LoadError, PathFilters, Result,
};

const SIGN_DURATION: Duration = Duration::from_secs(300);
const SQS_WAIT_TIME_SECONDS: i32 = 20;
const SQS_VISIBILITY_TIMEOUT_SECONDS: i32 = 300;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Params {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores; the AWS endpoint of the
    /// region otherwise.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    /// Enables event mode when set.
    #[serde(default)]
    pub sqs_queue_url: Option<String>,
    #[serde(default)]
    pub filters: PathFilters,
}

fn default_region() -> String {
    "us-east-1".into()
}

pub struct S3Detector {
    inner: Arc<Inner>,
}

struct Inner {
    params: S3Params,
    bucket: Bucket,
    credentials: Credentials,
    http: reqwest::Client,
    events_enabled: bool,
    channel: EventChannel,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl S3Detector {
    pub fn new(params: S3Params, events_enabled: bool) -> Result<Self> {
        let endpoint = params
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", params.region));
        let endpoint = endpoint
            .parse()
            .map_err(|err| DetectorError::Misconfigured(format!("invalid s3 endpoint: {err}")))?;
        let bucket =
            Bucket::new(endpoint, UrlStyle::Path, params.bucket.clone(), params.region.clone())
                .map_err(|err| {
                    DetectorError::Misconfigured(format!("invalid s3 bucket: {err}"))
                })?;
        let credentials = match params.session_token.clone() {
            Some(token) => Credentials::new_with_token(
                params.access_key_id.clone(),
                params.secret_access_key.clone(),
                token,
            ),
            None => Credentials::new(
                params.access_key_id.clone(),
                params.secret_access_key.clone(),
            ),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                params,
                bucket,
                credentials,
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
impl ChangeDetector for S3Detector {
    async fn start(&self) -> Result<()> {
        let Some(queue_url) = self.inner.params.sqs_queue_url.clone() else {
            return Ok(());
        };
        if !self.inner.events_enabled {
            return Ok(());
        }

        let credentials = SqsCredentials::new(
            self.inner.params.access_key_id.clone(),
            self.inner.params.secret_access_key.clone(),
            self.inner.params.session_token.clone(),
            None,
            "syncline",
        );
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.inner.params.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;
        let sqs = aws_sdk_sqs::Client::new(&sdk_config);

        // probe the queue so a bad URL or forbidden access fails the start;
        // plain network trouble gets the bounded retry budget and then a
        // downgrade instead
        let probe = retry_transient(crate::retry::bounded_backoff(Duration::from_secs(30)), || {
            let sqs = sqs.clone();
            let queue_url = queue_url.clone();
            async move {
                sqs.get_queue_attributes().queue_url(&queue_url).send().await.map_err(|err| {
                    match &err {
                        aws_sdk_sqs::error::SdkError::ServiceError(_) => DetectorError::Auth(
                            format!("cannot read sqs queue `{queue_url}`: {err}"),
                        ),
                        _ => DetectorError::Transient(err.to_string()),
                    }
                })
            }
        })
        .await;
        match probe {
            Ok(_) => {}
            Err(err) if err.is_transient() => {
                tracing::info!(%err, "sqs unreachable, running in periodic-only mode");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(sqs_poll_loop(inner, sqs, queue_url));
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
            let mut continuation: Option<String> = None;
            loop {
                let text = retry_transient(network_backoff(), || {
                    let inner = inner.clone();
                    let continuation = continuation.clone();
                    async move { list_page(&inner, continuation.as_deref()).await }
                })
                .await?;
                let parsed = ListObjectsV2::parse_response(&text).map_err(|err| {
                    DetectorError::BadResponse(format!("unparsable ListObjectsV2 body: {err}"))
                })?;
                for object in parsed.contents {
                    if !inner.params.filters.matches(&object.key) {
                        continue;
                    }
                    let mut file =
                        FileMetadata::new(object.key.clone()).with_size(object.size);
                    if let Ok(modified) =
                        OffsetDateTime::parse(&object.last_modified, &Rfc3339)
                    {
                        file = file.with_modified(modified);
                    }
                    if tx.send(Ok(file)).await.is_err() {
                        return Ok(());
                    }
                }
                match parsed.next_continuation_token {
                    Some(token) => continuation = Some(token),
                    None => return Ok(()),
                }
            }
        })
    }

    fn subscribe(&self) -> BoxStream<'static, DetectorEvent> {
        self.inner.channel.subscribe()
    }

    async fn load(&self, locator: &DocLocator) -> Result<Bytes, LoadError> {
        let url = self
            .inner
            .bucket
            .get_object(Some(&self.inner.credentials), &locator.path)
            .sign(SIGN_DURATION);
        let response = self
            .inner
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| LoadError::from(DetectorError::from_http(err)))?;
        match response.status() {
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(|err| LoadError::from(DetectorError::from_http(err)))?),
            reqwest::StatusCode::NOT_FOUND => Err(LoadError::NotFound),
            status => Err(LoadError::from(DetectorError::from_status(status, "s3 get object"))),
        }
    }
}

async fn list_page(inner: &Inner, continuation: Option<&str>) -> Result<String> {
    let mut action = inner.bucket.list_objects_v2(Some(&inner.credentials));
    if !inner.params.prefix.is_empty() {
        action.with_prefix(inner.params.prefix.as_str());
    }
    if let Some(token) = continuation {
        action.with_continuation_token(token);
    }
    let url = action.sign(SIGN_DURATION);
    let response = inner.http.get(url).send().await.map_err(DetectorError::from_http)?;
    let status = response.status();
    if !status.is_success() {
        return Err(DetectorError::from_status(status, "s3 list objects"));
    }
    response.text().await.map_err(DetectorError::from_http)
}

async fn sqs_poll_loop(inner: Arc<Inner>, sqs: aws_sdk_sqs::Client, queue_url: String) {
    let Some(events_tx) = inner.channel.sender() else { return };
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<AckOutcome>();
    // token -> receipt handle of the not-yet-settled messages
    let mut pending: HashMap<String, String> = HashMap::new();
    let mut token_counter: u64 = 0;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            outcome = ack_rx.recv() => {
                let Some(outcome) = outcome else { return };
                if let Some(receipt) = pending.remove(&outcome.token) {
                    // delete on success only; failures redeliver after the
                    // visibility timeout
                    if outcome.success {
                        if let Err(err) = sqs
                            .delete_message()
                            .queue_url(&queue_url)
                            .receipt_handle(receipt)
                            .send()
                            .await
                        {
                            tracing::warn!(%err, "could not delete settled sqs message");
                        }
                    }
                }
            }
            received = sqs
                .receive_message()
                .queue_url(&queue_url)
                .wait_time_seconds(SQS_WAIT_TIME_SECONDS)
                .visibility_timeout(SQS_VISIBILITY_TIMEOUT_SECONDS)
                .max_number_of_messages(10)
                .send() => {
                let messages = match received {
                    Ok(output) => output.messages.unwrap_or_default(),
                    Err(err) => {
                        tracing::warn!(%err, "sqs receive failed, backing off");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                for message in messages {
                    let (Some(body), Some(receipt)) = (message.body, message.receipt_handle)
                    else {
                        continue;
                    };
                    let events = parse_s3_notification(&body, &inner.params.filters);
                    if events.is_empty() {
                        // nothing to apply (test event or filtered out):
                        // settle immediately
                        let _ = sqs
                            .delete_message()
                            .queue_url(&queue_url)
                            .receipt_handle(receipt)
                            .send()
                            .await;
                        continue;
                    }
                    // one receipt may carry several records; settle on the
                    // last one so the whole message redelivers if any apply
                    // is abandoned
                    let last = events.len() - 1;
                    for (position, event) in events.into_iter().enumerate() {
                        let ack = (position == last).then(|| {
                            token_counter += 1;
                            let token = token_counter.to_string();
                            pending.insert(token.clone(), receipt.clone());
                            EventAck::new(ack_tx.clone(), token)
                        });
                        if events_tx.send(DetectorEvent::Change { event, ack }).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct SnsEnvelope {
    #[serde(rename = "Type")]
    kind: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Deserialize)]
struct S3Notification {
    #[serde(rename = "Records", default)]
    records: Vec<S3Record>,
    #[serde(rename = "Event", default)]
    event: Option<String>,
}

#[derive(Deserialize)]
struct S3Record {
    #[serde(rename = "eventName")]
    event_name: String,
    #[serde(rename = "eventTime")]
    event_time: Option<String>,
    s3: S3RecordBody,
}

#[derive(Deserialize)]
struct S3RecordBody {
    object: S3ObjectRef,
}

#[derive(Deserialize)]
struct S3ObjectRef {
    key: String,
    size: Option<u64>,
}

/// Decode one SQS message body into change events. Handles raw S3
/// notifications, SNS-wrapped envelopes, and the `s3:TestEvent` emitted when
/// notifications are first configured (which yields nothing).
pub(crate) fn parse_s3_notification(body: &str, filters: &PathFilters) -> Vec<ChangeEvent> {
    let body = match serde_json::from_str::<SnsEnvelope>(body) {
        Ok(SnsEnvelope { kind: Some(kind), message: Some(message) })
            if kind == "Notification" =>
        {
            message
        }
        _ => body.to_owned(),
    };
    let notification: S3Notification = match serde_json::from_str(&body) {
        Ok(notification) => notification,
        Err(err) => {
            tracing::warn!(%err, "discarding unparsable s3 notification");
            return Vec::new();
        }
    };
    if notification.event.as_deref() == Some("s3:TestEvent") {
        return Vec::new();
    }

    notification
        .records
        .into_iter()
        .filter_map(|record| {
            let change_type = if record.event_name.contains("ObjectCreated") {
                ChangeType::Update
            } else if record.event_name.contains("ObjectRemoved") {
                ChangeType::Delete
            } else {
                return None;
            };
            // keys arrive url-encoded with `+` for spaces
            let key = urlencoding::decode(&record.s3.object.key.replace('+', " "))
                .map(|key| key.into_owned())
                .unwrap_or(record.s3.object.key);
            if !filters.matches(&key) {
                return None;
            }
            let mut metadata = FileMetadata::new(key);
            metadata.size = record.s3.object.size;
            if let Some(time) = record.event_time.as_deref() {
                if let Ok(parsed) = OffsetDateTime::parse(time, &Rfc3339) {
                    metadata = metadata.with_modified(parsed);
                }
            }
            Some(ChangeEvent::new(change_type, metadata))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_notifications_map_creates_and_removes() {
        let body = serde_json::json!({
            "Records": [
                {
                    "eventName": "ObjectCreated:Put",
                    "eventTime": "2026-03-01T10:00:00.000Z",
                    "s3": { "object": { "key": "inbox/new+report.pdf", "size": 123 } }
                },
                {
                    "eventName": "ObjectRemoved:Delete",
                    "s3": { "object": { "key": "inbox/old.pdf" } }
                }
            ]
        })
        .to_string();
        let events = parse_s3_notification(&body, &PathFilters::default());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].change_type, ChangeType::Update);
        assert_eq!(events[0].metadata.path, "inbox/new report.pdf");
        assert_eq!(events[0].metadata.size, Some(123));
        assert_eq!(events[1].change_type, ChangeType::Delete);
    }

    #[test]
    fn sns_envelopes_are_unwrapped() {
        let inner = serde_json::json!({
            "Records": [{
                "eventName": "ObjectCreated:Put",
                "s3": { "object": { "key": "a.txt" } }
            }]
        })
        .to_string();
        let body = serde_json::json!({ "Type": "Notification", "Message": inner }).to_string();
        let events = parse_s3_notification(&body, &PathFilters::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata.path, "a.txt");
    }

    #[test]
    fn test_events_and_filtered_keys_yield_nothing() {
        let test_event = serde_json::json!({
            "Event": "s3:TestEvent", "Bucket": "b"
        })
        .to_string();
        assert!(parse_s3_notification(&test_event, &PathFilters::default()).is_empty());

        let body = serde_json::json!({
            "Records": [{
                "eventName": "ObjectCreated:Put",
                "s3": { "object": { "key": "a.png" } }
            }]
        })
        .to_string();
        let filters = PathFilters { prefix: None, suffixes: vec![".txt".into()] };
        assert!(parse_s3_notification(&body, &filters).is_empty());
    }

    #[tokio::test]
    async fn listing_pages_through_continuation_tokens() {
        use wiremock::matchers::{method, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let page_one = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>docs</Name>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok-2</NextContinuationToken>
  <Contents>
    <Key>inbox/a.txt</Key>
    <LastModified>2026-03-01T10:00:00.000Z</LastModified>
    <ETag>&quot;aaa&quot;</ETag>
    <Size>5</Size>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
</ListBucketResult>"#;
        let page_two = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>docs</Name>
  <IsTruncated>false</IsTruncated>
  <Contents>
    <Key>inbox/b.txt</Key>
    <LastModified>2026-03-01T11:00:00.000Z</LastModified>
    <ETag>&quot;bbb&quot;</ETag>
    <Size>7</Size>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
</ListBucketResult>"#;
        Mock::given(method("GET"))
            .and(query_param("continuation-token", "tok-2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page_two))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("list-type", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page_one))
            .mount(&server)
            .await;

        let params = S3Params {
            bucket: "docs".into(),
            prefix: String::new(),
            region: "us-east-1".into(),
            endpoint: Some(server.uri()),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
            session_token: None,
            sqs_queue_url: None,
            filters: PathFilters::default(),
        };
        let detector = S3Detector::new(params, true).unwrap();
        use futures::StreamExt;
        let files: Vec<_> =
            detector.list_all().map(|entry| entry.unwrap()).collect().await;
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "inbox/a.txt");
        assert_eq!(files[1].path, "inbox/b.txt");
        assert_eq!(files[1].size, Some(7));
    }
}
