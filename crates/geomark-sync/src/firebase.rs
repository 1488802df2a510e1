//! Firebase REST ports (feature `firebase`).
//!
//! - [`FirestoreWriter`]: creates documents through the Firestore REST API
//! - [`FirestorePoller`]: polls a collection and emits a snapshot whenever its contents change
//! - [`FirebaseStorage`]: uploads blobs and resolves token download URLs

use crate::errors::{ConfigError, ReferenceError, RemoteError, UploadError, WriteError};
use crate::ports::{
    BlobStore, DocumentWriter, NewDocument, RemoteChangeStream, SnapshotSubscription,
    Subscription, SubscriptionGuard,
};
use async_trait::async_trait;
use bytes::Bytes;
use geomark_store::{CorrelationId, RemoteDocument};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

const FIRESTORE_BASE: &str = "https://firestore.googleapis.com/v1";
const STORAGE_BASE: &str = "https://firebasestorage.googleapis.com/v0";

// ============================================================================
// Configuration
// ============================================================================

/// Firebase project settings loaded from the environment
#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    pub project_id: String,
    pub api_key: String,
    pub storage_bucket: String,
    pub poll_interval: Duration,
    pub timeout_secs: u64,
}

/// Milliseconds between collection listings; zero would make the poller spin.
fn parse_poll_interval(raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(millis) if millis > 0 => Ok(Duration::from_millis(millis)),
        _ => Err(ConfigError::InvalidOverride {
            key: "FIREBASE_POLL_INTERVAL_MS".to_string(),
            value: raw.to_string(),
        }),
    }
}

impl FirebaseConfig {
    /// Load from `FIREBASE_PROJECT_ID`, `FIREBASE_API_KEY`,
    /// `FIREBASE_STORAGE_BUCKET` and optional `FIREBASE_POLL_INTERVAL_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |key: &str| {
            std::env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
        };

        let poll_interval = match std::env::var("FIREBASE_POLL_INTERVAL_MS") {
            Ok(raw) => parse_poll_interval(&raw)?,
            Err(_) => Duration::from_secs(2),
        };

        Ok(Self {
            project_id: var("FIREBASE_PROJECT_ID")?,
            api_key: var("FIREBASE_API_KEY")?,
            storage_bucket: var("FIREBASE_STORAGE_BUCKET")?,
            poll_interval,
            timeout_secs: 30,
        })
    }

    fn client(&self) -> Result<Client, ConfigError> {
        Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|err| ConfigError::Invalid(format!("HTTP client: {err}")))
    }

    fn collection_url(&self, collection: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!(
            "{FIRESTORE_BASE}/projects/{}/databases/(default)/documents/",
            self.project_id
        ))?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(collection);
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    fn object_url(&self, key: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("{STORAGE_BASE}/b/{}/o", self.storage_bucket))?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .push(key);
        Ok(url)
    }
}

// ============================================================================
// Firestore Encoding
// ============================================================================

fn encode_document(document: &NewDocument) -> Value {
    json!({
        "fields": {
            "latitude": { "doubleValue": document.latitude },
            "longitude": { "doubleValue": document.longitude },
            "imageURL": { "stringValue": document.image_url },
            "correlationId": { "stringValue": document.correlation_id.as_str() },
        }
    })
}

#[derive(Debug, Deserialize)]
struct FirestoreDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    documents: Vec<FirestoreDocument>,
    next_page_token: Option<String>,
}

fn document_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn number_field(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = fields.get(key)?;
    value
        .get("doubleValue")
        .and_then(Value::as_f64)
        .or_else(|| {
            value
                .get("integerValue")
                .and_then(Value::as_str)
                .and_then(|raw| raw.parse().ok())
        })
}

fn string_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)?
        .get("stringValue")
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl FirestoreDocument {
    fn decode(self) -> Result<RemoteDocument, RemoteError> {
        let id = document_id(&self.name).to_string();
        let latitude = number_field(&self.fields, "latitude")
            .ok_or_else(|| RemoteError::Decode(format!("{id}: missing latitude")))?;
        let longitude = number_field(&self.fields, "longitude")
            .ok_or_else(|| RemoteError::Decode(format!("{id}: missing longitude")))?;

        Ok(RemoteDocument {
            latitude,
            longitude,
            image_url: string_field(&self.fields, "imageURL").unwrap_or_default(),
            correlation_id: string_field(&self.fields, "correlationId").map(CorrelationId::from),
            id,
        })
    }
}

async fn error_body(response: reqwest::Response) -> (u16, String) {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    (status, message)
}

// ============================================================================
// Firestore Writer
// ============================================================================

pub struct FirestoreWriter {
    client: Client,
    config: FirebaseConfig,
}

impl FirestoreWriter {
    pub fn new(config: FirebaseConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: config.client()?,
            config,
        })
    }
}

#[async_trait]
impl DocumentWriter for FirestoreWriter {
    async fn create(&self, collection: &str, document: &NewDocument) -> Result<String, WriteError> {
        let url = self
            .config
            .collection_url(collection)
            .map_err(|err| WriteError::Network(err.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(&encode_document(document))
            .send()
            .await
            .map_err(|err| WriteError::Network(err.to_string()))?;

        if !response.status().is_success() {
            let (status, message) = error_body(response).await;
            return Err(WriteError::Rejected { status, message });
        }

        let created: FirestoreDocument = response
            .json()
            .await
            .map_err(|err| WriteError::Network(err.to_string()))?;
        Ok(document_id(&created.name).to_string())
    }
}

// ============================================================================
// Firestore Poller
// ============================================================================

/// Change stream built on periodic collection listings.
pub struct FirestorePoller {
    client: Client,
    config: FirebaseConfig,
}

impl FirestorePoller {
    pub fn new(config: FirebaseConfig) -> Result<Self, ConfigError> {
        if config.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll interval must be positive".to_string(),
            ));
        }
        Ok(Self {
            client: config.client()?,
            config,
        })
    }
}

async fn fetch_collection(
    client: &Client,
    config: &FirebaseConfig,
    collection: &str,
) -> Result<Vec<RemoteDocument>, RemoteError> {
    let mut documents = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let mut url = config
            .collection_url(collection)
            .map_err(|err| RemoteError::Fetch(err.to_string()))?;
        url.query_pairs_mut().append_pair("pageSize", "300");
        if let Some(token) = &page_token {
            url.query_pairs_mut().append_pair("pageToken", token);
        }

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|err| RemoteError::Fetch(err.to_string()))?;
        if !response.status().is_success() {
            let (status, message) = error_body(response).await;
            return Err(RemoteError::Fetch(format!("{status}: {message}")));
        }

        let page: ListResponse = response
            .json()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))?;
        for document in page.documents {
            match document.decode() {
                Ok(document) => documents.push(document),
                Err(err) => tracing::warn!(error = %err, "skipping malformed document"),
            }
        }

        match page.next_page_token {
            Some(token) if !token.is_empty() => page_token = Some(token),
            _ => break,
        }
    }

    documents.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(documents)
}

#[async_trait]
impl RemoteChangeStream for FirestorePoller {
    async fn subscribe(&self, collection: &str) -> Result<SnapshotSubscription, RemoteError> {
        // The first listing doubles as a reachability check
        let initial = fetch_collection(&self.client, &self.config, collection)
            .await
            .map_err(|err| RemoteError::SubscriptionFailed {
                collection: collection.to_string(),
                message: err.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(initial.clone()));

        let cancellation = CancellationToken::new();
        let token = cancellation.clone();
        let client = self.client.clone();
        let config = self.config.clone();
        let collection = collection.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_interval);
            ticker.tick().await;
            let mut last = initial;
            let mut last_error: Option<String> = None;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let delivery = match fetch_collection(&client, &config, &collection).await {
                    Ok(documents) if documents == last => {
                        last_error = None;
                        continue;
                    }
                    Ok(documents) => {
                        last_error = None;
                        last = documents.clone();
                        Ok(documents)
                    }
                    Err(err) => {
                        let message = err.to_string();
                        if last_error.as_deref() == Some(message.as_str()) {
                            continue;
                        }
                        last_error = Some(message);
                        Err(err)
                    }
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
            tracing::debug!(%collection, "firestore poller stopped");
        });

        Ok(Subscription::new(
            rx,
            SubscriptionGuard::new(move || cancellation.cancel()),
        ))
    }
}

// ============================================================================
// Firebase Storage
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    download_tokens: Option<String>,
}

pub struct FirebaseStorage {
    client: Client,
    config: FirebaseConfig,
}

impl FirebaseStorage {
    pub fn new(config: FirebaseConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: config.client()?,
            config,
        })
    }

    fn content_type(key: &str) -> &'static str {
        match key.rsplit('.').next() {
            Some("png") => "image/png",
            Some("heic") => "image/heic",
            _ => "image/jpeg",
        }
    }
}

#[async_trait]
impl BlobStore for FirebaseStorage {
    async fn upload(&self, key: &str, bytes: Bytes) -> Result<(), UploadError> {
        let mut url = Url::parse(&format!("{STORAGE_BASE}/b/{}/o", self.config.storage_bucket))
            .map_err(|err| UploadError::Network(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("name", key)
            .append_pair("uploadType", "media");

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, Self::content_type(key))
            .body(bytes)
            .send()
            .await
            .map_err(|err| UploadError::Network(err.to_string()))?;

        if !response.status().is_success() {
            let (status, message) = error_body(response).await;
            return Err(UploadError::Rejected { status, message });
        }
        Ok(())
    }

    async fn reference(&self, key: &str) -> Result<String, ReferenceError> {
        let url = self
            .config
            .object_url(key)
            .map_err(|err| ReferenceError::Network(err.to_string()))?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| ReferenceError::Network(err.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ReferenceError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            let (status, message) = error_body(response).await;
            return Err(ReferenceError::Network(format!("{status}: {message}")));
        }

        let metadata: ObjectMetadata = response
            .json()
            .await
            .map_err(|err| ReferenceError::Network(err.to_string()))?;
        let token = metadata
            .download_tokens
            .as_deref()
            .and_then(|tokens| tokens.split(',').next())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ReferenceError::Network(format!("no download token for {key}")))?;

        let mut download = url;
        download
            .query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("token", token);
        Ok(download.to_string())
    }
}
