//! Attachment Pipeline: image selection → upload → reference → persist
//!
//! ```text
//! Pending ──select──► AwaitingImage ──picked──► Uploading ──upload+reference──► Persisted ──write──► (remote_id)
//!                          │                        │                               │
//!                       cancelled               upload/reference                 write
//!                          │                      failure                        failure
//!                          ▼                        ▼                               ▼
//!                      Discarded           Failed(Upload|Reference)          Failed(Persist)
//!                                                   │                               │
//!                                                   └─────── retry ────────┬────────┘
//!                                                                          ▼
//!                                                           re-enter the failed step
//! ```
//!
//! Every store transition is validated; when reconciliation has already
//! marked the annotation `Synced` (or a remote deletion removed it) the
//! pipeline stops quietly with [`AttachmentOutcome::Superseded`].
//!
//! Step failures never escape: they become a `Failed` status, a `last_error`
//! message and an [`EngineEvent::AttachmentFailed`].

use crate::config::AttachmentConfig;
use crate::errors::{AttachmentError, ImageReadError};
use crate::events::{EngineEvent, EventBus, NoticeLevel};
use crate::ports::{BlobStore, DocumentWriter, ImagePicker, ImageSelection, ImageSource, NewDocument};
use chrono::Utc;
use geomark_store::{AnnotationStatus, AnnotationStore, CorrelationId, ResumePoint, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Outcomes
// ============================================================================

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttachmentOutcome {
    /// Document written; reconciliation will mark the annotation `Synced`.
    Persisted { remote_id: String },
    /// Image selection cancelled or failed; the annotation was removed.
    Discarded,
    /// A step failed; retry re-enters `step`.
    Failed { step: ResumePoint },
    /// Reconciliation overtook the run.
    Superseded,
}

// ============================================================================
// Blob Keys
// ============================================================================

/// Time-based blob keys (`<prefix><unix-millis>.<ext>`), strictly increasing
/// within the process.
#[derive(Debug)]
pub struct BlobKeyGenerator {
    prefix: String,
    extension: String,
    last_millis: AtomicU64,
}

impl BlobKeyGenerator {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
            last_millis: AtomicU64::new(0),
        }
    }

    pub fn next_key(&self) -> String {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        self.key_at(now)
    }

    fn key_at(&self, now_millis: u64) -> String {
        let previous = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_millis.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let millis = now_millis.max(previous + 1);
        format!("{}{}.{}", self.prefix, millis, self.extension)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// What a retry needs to re-enter a step without a new selection.
#[derive(Debug, Clone, Default)]
struct AttachmentContext {
    uri: String,
    blob_key: Option<String>,
}

/// Drives annotations from `Pending` to `Persisted`.
pub struct AttachmentPipeline {
    store: Arc<AnnotationStore>,
    picker: Arc<dyn ImagePicker>,
    images: Arc<dyn ImageSource>,
    blobs: Arc<dyn BlobStore>,
    writer: Arc<dyn DocumentWriter>,
    events: EventBus,
    config: AttachmentConfig,
    collection: String,
    keys: BlobKeyGenerator,
    contexts: Mutex<HashMap<CorrelationId, AttachmentContext>>,
}

impl AttachmentPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<AnnotationStore>,
        picker: Arc<dyn ImagePicker>,
        images: Arc<dyn ImageSource>,
        blobs: Arc<dyn BlobStore>,
        writer: Arc<dyn DocumentWriter>,
        events: EventBus,
        config: AttachmentConfig,
        collection: impl Into<String>,
    ) -> Self {
        let keys = BlobKeyGenerator::new(&config.blob_prefix, &config.blob_extension);
        Self {
            store,
            picker,
            images,
            blobs,
            writer,
            events,
            config,
            collection: collection.into(),
            keys,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Run the pipeline for a freshly created `Pending` annotation.
    ///
    /// Returns `Err` only for misuse (unknown id, annotation not `Pending`).
    pub async fn attach(&self, id: &CorrelationId) -> Result<AttachmentOutcome, StoreError> {
        self.prune();
        let coordinate = self.store.begin_image_selection(id)?;

        let selection = self.picker.select(coordinate).await;
        let uri = match selection {
            Ok(ImageSelection::Selected { uri }) => uri,
            Ok(ImageSelection::Cancelled) => {
                tracing::info!(correlation_id = %id, "image selection cancelled");
                return self.discard(id);
            }
            Err(err) => {
                tracing::warn!(correlation_id = %id, error = %err, "image picker failed");
                let outcome = self.discard(id)?;
                if outcome == AttachmentOutcome::Discarded {
                    self.events
                        .notice(NoticeLevel::Error, format!("Could not pick an image: {err}"));
                }
                return Ok(outcome);
            }
        };

        if supersede(id, self.store.begin_upload(id))?.is_none() {
            return Ok(AttachmentOutcome::Superseded);
        }
        self.contexts.lock().insert(
            id.clone(),
            AttachmentContext {
                uri,
                blob_key: None,
            },
        );

        self.run(id, ResumePoint::Upload).await
    }

    /// Re-enter the step a `Failed` annotation stopped at.
    pub async fn retry(&self, id: &CorrelationId) -> Result<AttachmentOutcome, StoreError> {
        self.prune();
        let step = match supersede(id, self.store.resume(id))? {
            Some(step) => step,
            None => return Ok(AttachmentOutcome::Superseded),
        };
        tracing::info!(correlation_id = %id, %step, "retrying attachment");
        self.run(id, step).await
    }

    /// Annotations with pipeline state kept for a retry.
    pub fn pending_contexts(&self) -> usize {
        self.prune();
        self.contexts.lock().len()
    }

    /// Drop retry state for annotations that reconciliation synced or removed.
    /// Returns how many entries were dropped.
    pub fn prune(&self) -> usize {
        let mut contexts = self.contexts.lock();
        // Read the store after locking so every context inserted so far is visible in it
        let current = self.store.current();
        let before = contexts.len();
        contexts.retain(|id, _| {
            current
                .get(id)
                .is_some_and(|annotation| annotation.status.is_in_flight())
        });
        let dropped = before - contexts.len();
        if dropped > 0 {
            tracing::debug!(dropped, "released settled attachment state");
        }
        dropped
    }

    // ========================================================================
    // Steps
    // ========================================================================

    async fn run(
        &self,
        id: &CorrelationId,
        from: ResumePoint,
    ) -> Result<AttachmentOutcome, StoreError> {
        let outcome = self.run_steps(id, from).await;
        if !matches!(outcome, Ok(AttachmentOutcome::Failed { .. })) {
            self.contexts.lock().remove(id);
        }
        outcome
    }

    async fn run_steps(
        &self,
        id: &CorrelationId,
        from: ResumePoint,
    ) -> Result<AttachmentOutcome, StoreError> {
        if from == ResumePoint::Upload {
            if let Err(err) = self.upload(id).await {
                return self.fail(id, err);
            }
        }

        if matches!(from, ResumePoint::Upload | ResumePoint::Reference) {
            let image_ref = match self.resolve_reference(id).await {
                Ok(image_ref) => image_ref,
                Err(err) => return self.fail(id, err),
            };
            if supersede(id, self.store.mark_persisted(id, &image_ref))?.is_none() {
                return Ok(AttachmentOutcome::Superseded);
            }
        }

        self.persist(id).await
    }

    /// Read the selected image and upload it under this annotation's blob key.
    async fn upload(&self, id: &CorrelationId) -> Result<(), AttachmentError> {
        let context = self.contexts.lock().get(id).cloned().ok_or_else(|| {
            ImageReadError::NotFound(format!("no image selected for {id}"))
        })?;

        let key = match context.blob_key {
            Some(key) => key,
            None => {
                let key = self.keys.next_key();
                if let Some(context) = self.contexts.lock().get_mut(id) {
                    context.blob_key = Some(key.clone());
                }
                key
            }
        };

        let bytes = self.images.read(&context.uri).await?;
        tracing::debug!(correlation_id = %id, %key, size = bytes.len(), "uploading image");
        bounded(
            ResumePoint::Upload,
            self.config.upload_timeout(),
            self.blobs.upload(&key, bytes),
        )
        .await
    }

    async fn resolve_reference(&self, id: &CorrelationId) -> Result<String, AttachmentError> {
        let key = self
            .contexts
            .lock()
            .get(id)
            .and_then(|c| c.blob_key.clone())
            .ok_or_else(|| ImageReadError::NotFound(format!("no uploaded blob for {id}")))?;

        bounded(
            ResumePoint::Reference,
            self.config.reference_timeout(),
            self.blobs.reference(&key),
        )
        .await
    }

    async fn persist(&self, id: &CorrelationId) -> Result<AttachmentOutcome, StoreError> {
        let annotation = match self.store.get(id) {
            Some(annotation) if annotation.status == AnnotationStatus::Persisted => annotation,
            _ => {
                tracing::debug!(correlation_id = %id, "annotation synced before write");
                return Ok(AttachmentOutcome::Superseded);
            }
        };
        let Some(image_ref) = annotation.image_ref else {
            return Err(StoreError::IllegalTransition {
                id: id.clone(),
                from: annotation.status,
                to: AnnotationStatus::Persisted,
            });
        };

        let document = NewDocument {
            latitude: annotation.coordinate.latitude,
            longitude: annotation.coordinate.longitude,
            image_url: image_ref,
            correlation_id: id.clone(),
        };

        let written = bounded(
            ResumePoint::Persist,
            self.config.write_timeout(),
            self.writer.create(&self.collection, &document),
        )
        .await;

        let remote_id = match written {
            Ok(remote_id) => remote_id,
            Err(err) => return self.fail(id, err),
        };
        if supersede(id, self.store.record_remote_id(id, &remote_id))?.is_none() {
            return Ok(AttachmentOutcome::Superseded);
        }

        tracing::info!(correlation_id = %id, %remote_id, "annotation persisted");
        Ok(AttachmentOutcome::Persisted { remote_id })
    }

    // ========================================================================
    // Terminal Paths
    // ========================================================================

    fn discard(&self, id: &CorrelationId) -> Result<AttachmentOutcome, StoreError> {
        if supersede(id, self.store.discard(id))?.is_none() {
            return Ok(AttachmentOutcome::Superseded);
        }
        self.contexts.lock().remove(id);
        self.events.emit(EngineEvent::AnnotationDiscarded {
            correlation_id: id.clone(),
        });
        Ok(AttachmentOutcome::Discarded)
    }

    fn fail(
        &self,
        id: &CorrelationId,
        err: AttachmentError,
    ) -> Result<AttachmentOutcome, StoreError> {
        let step = err.resume_point();
        let message = err.to_string();

        if supersede(id, self.store.mark_failed(id, step, &message))?.is_none() {
            return Ok(AttachmentOutcome::Superseded);
        }

        tracing::warn!(correlation_id = %id, %step, error = %message, "attachment step failed");
        self.events.emit(EngineEvent::AttachmentFailed {
            correlation_id: id.clone(),
            step,
            message,
            retryable: true,
        });
        Ok(AttachmentOutcome::Failed { step })
    }
}

/// `Ok(None)` when reconciliation already owns the annotation.
fn supersede<T>(id: &CorrelationId, result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_superseded() => {
            tracing::debug!(correlation_id = %id, reason = %err, "attachment superseded");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

async fn bounded<T, E>(
    step: ResumePoint,
    after: Duration,
    operation: impl Future<Output = Result<T, E>>,
) -> Result<T, AttachmentError>
where
    AttachmentError: From<E>,
{
    match tokio::time::timeout(after, operation).await {
        Ok(result) => result.map_err(AttachmentError::from),
        Err(_) => Err(AttachmentError::Timeout { step, after }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_keys_strictly_increase() {
        let keys = BlobKeyGenerator::new("images/", "jpg");

        assert_eq!(keys.key_at(169_900), "images/169900.jpg");
        // Same millisecond, and a clock that went backwards
        assert_eq!(keys.key_at(169_900), "images/169901.jpg");
        assert_eq!(keys.key_at(100), "images/169902.jpg");
        assert_eq!(keys.key_at(200_000), "images/200000.jpg");
    }

    #[test]
    fn test_blob_key_shape() {
        let key = BlobKeyGenerator::new("images/", "jpg").next_key();
        let millis = key
            .strip_prefix("images/")
            .and_then(|rest| rest.strip_suffix(".jpg"))
            .unwrap();
        assert!(millis.parse::<u64>().is_ok(), "unexpected key {key}");
    }

    #[test]
    fn test_supersede_classification() {
        let id = CorrelationId::from("a");

        assert_eq!(supersede(&id, Ok::<_, StoreError>(1)), Ok(Some(1)));
        assert_eq!(
            supersede::<()>(&id, Err(StoreError::UnknownAnnotation(id.clone()))),
            Ok(None)
        );
        let misuse = StoreError::IllegalTransition {
            id: id.clone(),
            from: AnnotationStatus::Pending,
            to: AnnotationStatus::Uploading,
        };
        assert_eq!(supersede::<()>(&id, Err(misuse.clone())), Err(misuse));
    }
}
