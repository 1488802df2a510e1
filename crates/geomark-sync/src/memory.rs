//! In-memory ports with fault injection.
//!
//! These back the tests and the `geomark simulate` runner. Every fake keeps
//! just enough bookkeeping (counters, recorded uploads, open watches) for a
//! test to assert on what the engine did.

use crate::errors::{
    ImageReadError, LocationError, PickerError, ReferenceError, RemoteError, UploadError,
    WriteError,
};
use crate::ports::{
    BlobStore, DocumentWriter, ImagePicker, ImageSelection, ImageSource, LocationSample,
    LocationService, LocationSubscription, NewDocument, PermissionStatus, Ports,
    RemoteChangeStream, SnapshotSubscription, Subscription, SubscriptionGuard, WatchOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use geomark_store::{Coordinate, RemoteDocument};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

// ============================================================================
// Location
// ============================================================================

#[derive(Default)]
struct WatchCounters {
    active: AtomicUsize,
    cancelled: AtomicUsize,
}

struct LocationState {
    permission: PermissionStatus,
    watch_failure: Option<LocationError>,
    sender: Option<mpsc::UnboundedSender<LocationSample>>,
    options: Option<WatchOptions>,
    permission_requests: usize,
}

/// Location service driven by [`MemoryLocationService::push`].
pub struct MemoryLocationService {
    state: Mutex<LocationState>,
    counters: Arc<WatchCounters>,
}

impl MemoryLocationService {
    pub fn new() -> Self {
        Self::with_permission(PermissionStatus::Granted)
    }

    pub fn denying() -> Self {
        Self::with_permission(PermissionStatus::Denied)
    }

    fn with_permission(permission: PermissionStatus) -> Self {
        Self {
            state: Mutex::new(LocationState {
                permission,
                watch_failure: None,
                sender: None,
                options: None,
                permission_requests: 0,
            }),
            counters: Arc::new(WatchCounters::default()),
        }
    }

    pub fn set_permission(&self, permission: PermissionStatus) {
        self.state.lock().permission = permission;
    }

    /// Make every following `watch` call fail.
    pub fn fail_watch(&self, err: LocationError) {
        self.state.lock().watch_failure = Some(err);
    }

    /// Deliver a sample to the open watch. Returns `false` when nobody listens.
    pub fn push(&self, coordinate: Coordinate) -> bool {
        self.push_sample(LocationSample::at(coordinate))
    }

    pub fn push_sample(&self, sample: LocationSample) -> bool {
        match &self.state.lock().sender {
            Some(sender) => sender.send(sample).is_ok(),
            None => false,
        }
    }

    /// Close the sample stream as if the platform stopped delivering.
    pub fn end_stream(&self) {
        self.state.lock().sender = None;
    }

    /// Options passed to the most recent watch.
    pub fn watch_options(&self) -> Option<WatchOptions> {
        self.state.lock().options
    }

    pub fn permission_requests(&self) -> usize {
        self.state.lock().permission_requests
    }

    pub fn active_watches(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    pub fn cancelled_watches(&self) -> usize {
        self.counters.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for MemoryLocationService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationService for MemoryLocationService {
    async fn request_permission(&self) -> PermissionStatus {
        let mut state = self.state.lock();
        state.permission_requests += 1;
        state.permission
    }

    async fn watch(&self, options: WatchOptions) -> Result<LocationSubscription, LocationError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.watch_failure {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.sender = Some(tx);
        state.options = Some(options);
        self.counters.active.fetch_add(1, Ordering::SeqCst);

        let counters = Arc::clone(&self.counters);
        let guard = SubscriptionGuard::new(move || {
            counters.active.fetch_sub(1, Ordering::SeqCst);
            counters.cancelled.fetch_add(1, Ordering::SeqCst);
        });
        Ok(Subscription::new(rx, guard))
    }
}

// ============================================================================
// Remote Collection
// ============================================================================

type SnapshotSender = mpsc::UnboundedSender<Result<Vec<RemoteDocument>, RemoteError>>;

struct CollectionState {
    documents: BTreeMap<String, RemoteDocument>,
    next_id: u64,
    subscribers: Vec<SnapshotSender>,
    fail_writes: u32,
    write_delay: Option<Duration>,
    writes: usize,
    fail_subscriptions: bool,
    auto_publish: bool,
}

/// A single remote collection acting as both document writer and change stream.
///
/// Created documents get ids `doc1`, `doc2`, … Every mutation publishes a full
/// snapshot to all subscribers unless auto-publishing is switched off.
pub struct MemoryRemoteCollection {
    name: String,
    state: Mutex<CollectionState>,
    cancelled_subscriptions: Arc<AtomicUsize>,
}

impl MemoryRemoteCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CollectionState {
                documents: BTreeMap::new(),
                next_id: 0,
                subscribers: Vec::new(),
                fail_writes: 0,
                write_delay: None,
                writes: 0,
                fail_subscriptions: false,
                auto_publish: true,
            }),
            cancelled_subscriptions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace a document, as another client would.
    pub fn insert(&self, document: RemoteDocument) {
        let mut state = self.state.lock();
        state.documents.insert(document.id.clone(), document);
        if state.auto_publish {
            broadcast(&mut state);
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.documents.remove(id).is_some();
        if removed && state.auto_publish {
            broadcast(&mut state);
        }
        removed
    }

    pub fn documents(&self) -> Vec<RemoteDocument> {
        self.state.lock().documents.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<RemoteDocument> {
        self.state.lock().documents.get(id).cloned()
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().fail_writes = count;
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state.lock().write_delay = delay;
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        self.state.lock().fail_subscriptions = fail;
    }

    /// When off, snapshots go out only on [`Self::publish`].
    pub fn set_auto_publish(&self, enabled: bool) {
        self.state.lock().auto_publish = enabled;
    }

    /// Send the current snapshot to every subscriber.
    pub fn publish(&self) {
        broadcast(&mut self.state.lock());
    }

    /// Deliver a stream error instead of a snapshot.
    pub fn inject_error(&self, err: RemoteError) {
        self.state
            .lock()
            .subscribers
            .retain(|tx| tx.send(Err(err.clone())).is_ok());
    }

    /// Successful document writes.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    pub fn cancelled_subscriptions(&self) -> usize {
        self.cancelled_subscriptions.load(Ordering::SeqCst)
    }
}

fn broadcast(state: &mut CollectionState) {
    let snapshot: Vec<RemoteDocument> = state.documents.values().cloned().collect();
    state
        .subscribers
        .retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
}

#[async_trait]
impl DocumentWriter for MemoryRemoteCollection {
    async fn create(&self, collection: &str, document: &NewDocument) -> Result<String, WriteError> {
        let delay = self.state.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(WriteError::Network("injected write failure".to_string()));
        }
        if collection != self.name {
            return Err(WriteError::Rejected {
                status: 404,
                message: format!("unknown collection {collection}"),
            });
        }

        state.next_id += 1;
        let id = format!("doc{}", state.next_id);
        state
            .documents
            .insert(id.clone(), document.clone().into_remote(id.clone()));
        state.writes += 1;
        if state.auto_publish {
            broadcast(&mut state);
        }
        Ok(id)
    }
}

#[async_trait]
impl RemoteChangeStream for MemoryRemoteCollection {
    async fn subscribe(&self, collection: &str) -> Result<SnapshotSubscription, RemoteError> {
        let mut state = self.state.lock();
        if state.fail_subscriptions || collection != self.name {
            return Err(RemoteError::SubscriptionFailed {
                collection: collection.to_string(),
                message: "listener rejected".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // Listeners get the current contents first
        let snapshot: Vec<RemoteDocument> = state.documents.values().cloned().collect();
        let _ = tx.send(Ok(snapshot));
        state.subscribers.push(tx);

        let cancelled = Arc::clone(&self.cancelled_subscriptions);
        let guard = SubscriptionGuard::new(move || {
            cancelled.fetch_add(1, Ordering::SeqCst);
        });
        Ok(Subscription::new(rx, guard))
    }
}

// ============================================================================
// Blobs
// ============================================================================

struct BlobState {
    blobs: BTreeMap<String, Bytes>,
    uploads: Vec<(String, Bytes)>,
    fail_uploads: u32,
    fail_references: u32,
    upload_delay: Option<Duration>,
    reference_delay: Option<Duration>,
}

/// Blob store resolving keys to `<base_url>/<key>`.
pub struct MemoryBlobStore {
    base_url: String,
    state: Mutex<BlobState>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_base_url("memory://blobs")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            state: Mutex::new(BlobState {
                blobs: BTreeMap::new(),
                uploads: Vec::new(),
                fail_uploads: 0,
                fail_references: 0,
                upload_delay: None,
                reference_delay: None,
            }),
        }
    }

    pub fn fail_next_uploads(&self, count: u32) {
        self.state.lock().fail_uploads = count;
    }

    pub fn fail_next_references(&self, count: u32) {
        self.state.lock().fail_references = count;
    }

    pub fn set_upload_delay(&self, delay: Option<Duration>) {
        self.state.lock().upload_delay = delay;
    }

    pub fn set_reference_delay(&self, delay: Option<Duration>) {
        self.state.lock().reference_delay = delay;
    }

    /// Every upload attempt that reached the store, including failed ones.
    pub fn uploads(&self) -> Vec<(String, Bytes)> {
        self.state.lock().uploads.clone()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.lock().blobs.get(key).cloned()
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, key: &str, bytes: Bytes) -> Result<(), UploadError> {
        let delay = self.state.lock().upload_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.uploads.push((key.to_string(), bytes.clone()));
        if state.fail_uploads > 0 {
            state.fail_uploads -= 1;
            return Err(UploadError::Network("injected upload failure".to_string()));
        }
        state.blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn reference(&self, key: &str) -> Result<String, ReferenceError> {
        let delay = self.state.lock().reference_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_references > 0 {
            state.fail_references -= 1;
            return Err(ReferenceError::Network(
                "injected reference failure".to_string(),
            ));
        }
        if !state.blobs.contains_key(key) {
            return Err(ReferenceError::NotFound(key.to_string()));
        }
        Ok(self.url_for(key))
    }
}

// ============================================================================
// Images
// ============================================================================

/// Image source serving registered byte strings.
#[derive(Default)]
pub struct MemoryImageSource {
    images: Mutex<HashMap<String, Bytes>>,
    reads: AtomicUsize,
}

impl MemoryImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: impl Into<String>, bytes: impl Into<Bytes>) {
        self.images.lock().insert(uri.into(), bytes.into());
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for MemoryImageSource {
    async fn read(&self, uri: &str) -> Result<Bytes, ImageReadError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.images
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| ImageReadError::NotFound(uri.to_string()))
    }
}

// ============================================================================
// Picker
// ============================================================================

type PickResult = Result<ImageSelection, PickerError>;

/// An image selection the engine is waiting on.
#[derive(Debug)]
pub struct PendingPick {
    pub coordinate: Coordinate,
    responder: oneshot::Sender<PickResult>,
}

impl PendingPick {
    pub fn select(self, uri: impl Into<String>) {
        self.respond(Ok(ImageSelection::Selected { uri: uri.into() }));
    }

    pub fn cancel(self) {
        self.respond(Ok(ImageSelection::Cancelled));
    }

    pub fn fail(self, err: PickerError) {
        self.respond(Err(err));
    }

    fn respond(self, result: PickResult) {
        let _ = self.responder.send(result);
    }
}

#[derive(Default)]
struct PickerState {
    queued: VecDeque<PickResult>,
    waiting: VecDeque<PendingPick>,
    requests: usize,
}

/// Picker answering from a queue of scripted responses, or holding the
/// request open until a test answers it through [`ScriptedPicker::next_request`].
#[derive(Default)]
pub struct ScriptedPicker {
    state: Mutex<PickerState>,
    arrived: Notify,
}

impl ScriptedPicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_selection(&self, uri: impl Into<String>) {
        self.queue(Ok(ImageSelection::Selected { uri: uri.into() }));
    }

    pub fn queue_cancel(&self) {
        self.queue(Ok(ImageSelection::Cancelled));
    }

    pub fn queue_error(&self, err: PickerError) {
        self.queue(Err(err));
    }

    fn queue(&self, result: PickResult) {
        self.state.lock().queued.push_back(result);
    }

    /// Wait for the engine to open a selection.
    pub async fn next_request(&self) -> PendingPick {
        loop {
            let pending = self.state.lock().waiting.pop_front();
            if let Some(pending) = pending {
                return pending;
            }
            self.arrived.notified().await;
        }
    }

    /// Selections currently held open.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }
}

#[async_trait]
impl ImagePicker for ScriptedPicker {
    async fn select(&self, coordinate: Coordinate) -> Result<ImageSelection, PickerError> {
        let rx = {
            let mut state = self.state.lock();
            state.requests += 1;
            if let Some(result) = state.queued.pop_front() {
                return result;
            }
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(PendingPick {
                coordinate,
                responder: tx,
            });
            rx
        };
        self.arrived.notify_one();

        // A dropped request counts as a cancelled dialog
        rx.await.unwrap_or(Ok(ImageSelection::Cancelled))
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// One of each in-memory port, sharing a single collection.
#[derive(Clone)]
pub struct MemoryPorts {
    pub location: Arc<MemoryLocationService>,
    pub collection: Arc<MemoryRemoteCollection>,
    pub blobs: Arc<MemoryBlobStore>,
    pub images: Arc<MemoryImageSource>,
    pub picker: Arc<ScriptedPicker>,
}

impl MemoryPorts {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            location: Arc::new(MemoryLocationService::new()),
            collection: Arc::new(MemoryRemoteCollection::new(collection)),
            blobs: Arc::new(MemoryBlobStore::new()),
            images: Arc::new(MemoryImageSource::new()),
            picker: Arc::new(ScriptedPicker::new()),
        }
    }

    pub fn ports(&self) -> Ports {
        Ports {
            location: self.location.clone(),
            changes: self.collection.clone(),
            writer: self.collection.clone(),
            blobs: self.blobs.clone(),
            images: self.images.clone(),
            picker: self.picker.clone(),
        }
    }
}
