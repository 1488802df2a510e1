//! Annotation Engine: the single entry point for the presentation layer.
//!
//! Owns the store, the attachment pipeline, the viewport controller and every
//! task they run. Gestures return immediately; the work they start runs on
//! spawned tasks tracked by the engine and cancelled on shutdown.

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EngineEventHandler, EventBus, NoticeLevel};
use crate::pipeline::{AttachmentOutcome, AttachmentPipeline};
use crate::ports::{Ports, RemoteChangeStream, SnapshotSubscription};
use crate::viewport::{ViewportController, ViewportState};
use geomark_store::{
    AnnotationStatus, AnnotationStore, AnnotationWatch, Coordinate, CorrelationId, Region,
    StoreError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Details shown when the user taps a marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    pub correlation_id: CorrelationId,
    pub coordinate: Coordinate,
    pub latitude_label: String,
    pub longitude_label: String,
    pub image_ref: Option<String>,
    pub status: AnnotationStatus,
    pub retryable: bool,
    pub last_error: Option<String>,
}

/// Count of running attachment tasks; `idle` fires when it drops to zero.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Held by one attachment task for its whole lifetime, including cancellation.
struct InFlightSlot(Arc<InFlight>);

impl InFlightSlot {
    fn acquire(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct AnnotationEngine {
    config: EngineConfig,
    store: Arc<AnnotationStore>,
    pipeline: Arc<AttachmentPipeline>,
    viewport: Arc<ViewportController>,
    changes: Arc<dyn RemoteChangeStream>,
    events: EventBus,
    cancellation: CancellationToken,
    /// Viewport and snapshot listener.
    background: TaskTracker,
    /// Pipeline runs started by gestures.
    attachments: TaskTracker,
    in_flight: Arc<InFlight>,
    started: AtomicBool,
}

impl AnnotationEngine {
    pub fn new(ports: Ports, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let store = Arc::new(AnnotationStore::new());
        let pipeline = Arc::new(AttachmentPipeline::new(
            Arc::clone(&store),
            ports.picker,
            ports.images,
            ports.blobs,
            ports.writer,
            events.clone(),
            config.attachment.clone(),
            config.collection.clone(),
        ));
        let viewport = Arc::new(ViewportController::new(
            ports.location,
            config.viewport.clone(),
            events.clone(),
        ));

        Self {
            config,
            store,
            pipeline,
            viewport,
            changes: ports.changes,
            events,
            cancellation: CancellationToken::new(),
            background: TaskTracker::new(),
            attachments: TaskTracker::new(),
            in_flight: Arc::new(InFlight::default()),
            started: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start location tracking and the remote snapshot listener.
    ///
    /// A failed subscription is reported as a notice; local annotation work
    /// keeps running without remote updates.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("engine already started");
            return;
        }

        let viewport = Arc::clone(&self.viewport);
        let cancellation = self.cancellation.child_token();
        self.background
            .spawn(async move { viewport.run(cancellation).await });

        let collection = self.config.collection.clone();
        match self.changes.subscribe(&collection).await {
            Ok(subscription) => {
                tracing::info!(%collection, "listening for remote snapshots");
                self.background.spawn(listen(
                    subscription,
                    Arc::clone(&self.store),
                    Arc::clone(&self.pipeline),
                    self.events.clone(),
                    self.cancellation.child_token(),
                ));
            }
            Err(err) => {
                tracing::warn!(%collection, error = %err, "remote subscription failed");
                self.events.notice(
                    NoticeLevel::Error,
                    format!("Live updates unavailable: {err}"),
                );
            }
        }
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancellation.cancel();
        self.background.close();
        self.attachments.close();
        self.background.wait().await;
        self.attachments.wait().await;
        tracing::info!("engine stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Wait until no attachment is running, up to `within`. Returns `false`
    /// on timeout, e.g. while a selection is still open in the picker.
    ///
    /// Meant for the CLI and tests. After the last attachment finishes it
    /// waits a short grace period so the listener can apply the snapshot
    /// caused by the final write; a slower remote is not waited for.
    pub async fn settle(&self, within: Duration) -> bool {
        let grace = Duration::from_millis(5);
        tokio::time::timeout(within, async {
            loop {
                let idle = self.in_flight.idle.notified();
                if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                    tokio::time::sleep(grace).await;
                    if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    continue;
                }
                idle.await;
            }
        })
        .await
        .is_ok()
    }

    // ========================================================================
    // Gestures
    // ========================================================================

    /// Drop an annotation at `coordinate` and start attaching an image to it.
    ///
    /// After shutdown the gesture is ignored: the returned id names no
    /// annotation and nothing is stored.
    pub fn on_long_press(&self, coordinate: Coordinate) -> CorrelationId {
        if self.is_shut_down() {
            let id = CorrelationId::generate();
            tracing::warn!(correlation_id = %id, "long press ignored after shutdown");
            return id;
        }

        let id = self.store.create_local(coordinate);
        tracing::info!(correlation_id = %id, "annotation created");

        let pipeline = Arc::clone(&self.pipeline);
        let cancellation = self.cancellation.clone();
        let task_id = id.clone();
        let slot = InFlightSlot::acquire(&self.in_flight);
        self.attachments.spawn(async move {
            let _slot = slot;
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    tracing::debug!(correlation_id = %task_id, "attachment cancelled by shutdown");
                }
                outcome = pipeline.attach(&task_id) => log_outcome(&task_id, outcome),
            }
        });
        id
    }

    pub fn on_annotation_tap(&self, id: &CorrelationId) -> Option<Inspection> {
        let annotation = self.store.get(id)?;
        let (latitude_label, longitude_label) = annotation.coordinate.display_labels();
        Some(Inspection {
            correlation_id: annotation.correlation_id.clone(),
            coordinate: annotation.coordinate,
            latitude_label,
            longitude_label,
            retryable: annotation.is_retryable(),
            image_ref: annotation.image_ref,
            status: annotation.status,
            last_error: annotation.last_error,
        })
    }

    /// Retry a `Failed` annotation from the step it stopped at.
    pub fn retry(&self, id: &CorrelationId) -> Result<(), StoreError> {
        let annotation = self
            .store
            .get(id)
            .ok_or_else(|| StoreError::UnknownAnnotation(id.clone()))?;
        if !annotation.is_retryable() {
            return Err(StoreError::IllegalTransition {
                id: id.clone(),
                from: annotation.status,
                to: AnnotationStatus::Uploading,
            });
        }

        let pipeline = Arc::clone(&self.pipeline);
        let cancellation = self.cancellation.clone();
        let task_id = id.clone();
        let slot = InFlightSlot::acquire(&self.in_flight);
        self.attachments.spawn(async move {
            let _slot = slot;
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {}
                outcome = pipeline.retry(&task_id) => log_outcome(&task_id, outcome),
            }
        });
        Ok(())
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn observe(&self) -> AnnotationWatch {
        self.store.observe()
    }

    pub fn regions(&self) -> watch::Receiver<Region> {
        self.viewport.regions()
    }

    pub fn region(&self) -> Region {
        self.viewport.region()
    }

    pub fn viewport_state(&self) -> ViewportState {
        self.viewport.state()
    }

    pub fn viewport_states(&self) -> watch::Receiver<ViewportState> {
        self.viewport.states()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Register a handler that sees every event in order.
    pub fn on_event(&self, handler: EngineEventHandler) {
        self.events.on_event(handler);
    }

    pub fn store(&self) -> &Arc<AnnotationStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for AnnotationEngine {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

/// Apply snapshots until cancelled or the stream ends.
async fn listen(
    mut subscription: SnapshotSubscription,
    store: Arc<AnnotationStore>,
    pipeline: Arc<AttachmentPipeline>,
    events: EventBus,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            delivery = subscription.next() => match delivery {
                Some(Ok(documents)) => {
                    let report = store.apply_remote_snapshot(&documents);
                    if !report.newly_synced.is_empty() || !report.removed.is_empty() {
                        pipeline.prune();
                    }
                    events.emit(EngineEvent::SnapshotApplied {
                        documents: documents.len(),
                        report,
                    });
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "remote snapshot failed");
                    events.notice(NoticeLevel::Warning, format!("Live update failed: {err}"));
                }
                None => {
                    tracing::warn!("remote change stream closed");
                    events.notice(NoticeLevel::Error, "Live updates stopped");
                    return;
                }
            },
        }
    }
    subscription.cancel();
}

fn log_outcome(id: &CorrelationId, outcome: Result<AttachmentOutcome, StoreError>) {
    match outcome {
        Ok(AttachmentOutcome::Persisted { remote_id }) => {
            tracing::debug!(correlation_id = %id, %remote_id, "attachment persisted")
        }
        Ok(outcome) => tracing::debug!(correlation_id = %id, ?outcome, "attachment finished"),
        Err(err) => tracing::warn!(correlation_id = %id, error = %err, "attachment rejected"),
    }
}
