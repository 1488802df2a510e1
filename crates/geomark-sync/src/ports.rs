//! Ports: every external collaborator the engine talks to.
//!
//! Each port is an `async_trait` object so that the engine can be driven by
//! in-memory fakes ([`crate::memory`]), the Firebase REST clients, or a host
//! application's own bindings.
//!
//! Long-lived registrations (location watch, snapshot listener) are returned
//! together with a [`SubscriptionGuard`]. Dropping the subscription runs the
//! guard, so the external registration is released on every exit path,
//! including task abort and panic unwinding.

use crate::errors::{
    ImageReadError, LocationError, PickerError, ReferenceError, RemoteError, UploadError,
    WriteError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use geomark_store::{Coordinate, CorrelationId, RemoteDocument};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// Subscriptions
// ============================================================================

/// Runs a cancel action exactly once, when dropped or cancelled explicitly.
pub struct SubscriptionGuard {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Guard for registrations that need no release.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// A stream of items tied to an external registration.
#[derive(Debug)]
pub struct Subscription<T> {
    items: mpsc::UnboundedReceiver<T>,
    guard: SubscriptionGuard,
}

impl<T> Subscription<T> {
    pub fn new(items: mpsc::UnboundedReceiver<T>, guard: SubscriptionGuard) -> Self {
        Self { items, guard }
    }

    /// Next item; `None` once the producer has gone away.
    pub async fn next(&mut self) -> Option<T> {
        self.items.recv().await
    }

    /// Release the registration now instead of on drop.
    pub fn cancel(self) {
        let Subscription { items, guard } = self;
        drop(items);
        guard.cancel();
    }
}

pub type LocationSubscription = Subscription<LocationSample>;
pub type SnapshotSubscription = Subscription<Result<Vec<RemoteDocument>, RemoteError>>;

// ============================================================================
// Device Location
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    #[default]
    High,
    Balanced,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WatchOptions {
    /// Samples closer than this to the previous one are not delivered.
    pub min_distance_m: f64,
    pub accuracy: Accuracy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub coordinate: Coordinate,
    /// Horizontal accuracy radius, when the platform reports one.
    pub accuracy_m: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn at(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            accuracy_m: None,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait LocationService: Send + Sync {
    async fn request_permission(&self) -> PermissionStatus;

    async fn watch(&self, options: WatchOptions) -> Result<LocationSubscription, LocationError>;
}

// ============================================================================
// Remote Collection
// ============================================================================

/// Full-collection snapshots, one per remote mutation.
#[async_trait]
pub trait RemoteChangeStream: Send + Sync {
    async fn subscribe(&self, collection: &str) -> Result<SnapshotSubscription, RemoteError>;
}

/// Body of a document created by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "imageURL")]
    pub image_url: String,
    #[serde(rename = "correlationId")]
    pub correlation_id: CorrelationId,
}

impl NewDocument {
    /// The document as it appears in snapshots once stored under `id`.
    pub fn into_remote(self, id: impl Into<String>) -> RemoteDocument {
        RemoteDocument {
            id: id.into(),
            latitude: self.latitude,
            longitude: self.longitude,
            image_url: self.image_url,
            correlation_id: Some(self.correlation_id),
        }
    }
}

#[async_trait]
pub trait DocumentWriter: Send + Sync {
    /// Create a document and return its server-assigned id.
    async fn create(&self, collection: &str, document: &NewDocument) -> Result<String, WriteError>;
}

// ============================================================================
// Blobs & Images
// ============================================================================

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, key: &str, bytes: Bytes) -> Result<(), UploadError>;

    /// Durable download URL of a stored blob.
    async fn reference(&self, key: &str) -> Result<String, ReferenceError>;
}

/// Reads the bytes behind a picker URI.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn read(&self, uri: &str) -> Result<Bytes, ImageReadError>;
}

/// Image source backed by the local filesystem.
///
/// Accepts plain paths and `file://` URIs; relative paths resolve against
/// `root` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FsImageSource {
    root: Option<PathBuf>,
}

impl FsImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, uri: &str) -> PathBuf {
        let path = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl ImageSource for FsImageSource {
    async fn read(&self, uri: &str) -> Result<Bytes, ImageReadError> {
        let path = self.resolve(uri);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ImageReadError::NotFound(uri.to_string()))
            }
            Err(err) => Err(ImageReadError::Io {
                uri: uri.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSelection {
    Selected { uri: String },
    Cancelled,
}

/// Presentation-layer image picker.
#[async_trait]
pub trait ImagePicker: Send + Sync {
    async fn select(&self, coordinate: Coordinate) -> Result<ImageSelection, PickerError>;
}

// ============================================================================
// Port Bundle
// ============================================================================

/// Every collaborator an [`crate::AnnotationEngine`] needs.
#[derive(Clone)]
pub struct Ports {
    pub location: Arc<dyn LocationService>,
    pub changes: Arc<dyn RemoteChangeStream>,
    pub writer: Arc<dyn DocumentWriter>,
    pub blobs: Arc<dyn BlobStore>,
    pub images: Arc<dyn ImageSource>,
    pub picker: Arc<dyn ImagePicker>,
}
