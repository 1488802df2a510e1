//! The owned annotation store.
//!
//! All mutations run synchronously under one lock and publish a complete new
//! [`AnnotationSet`] through a watch channel. Nothing awaits while the lock is
//! held, so two interleaved callbacks can never lose each other's updates.

use crate::reconcile::{reconcile, ReconciliationReport};
use crate::{
    Annotation, AnnotationStatus, Coordinate, CorrelationId, RemoteDocument, ResumePoint,
    StoreError,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// Published State
// ============================================================================

/// Immutable copy of the store contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnnotationSet {
    /// Incremented on every published change.
    pub version: u64,
    pub annotations: Vec<Annotation>,
}

impl AnnotationSet {
    pub fn get(&self, id: &CorrelationId) -> Option<&Annotation> {
        self.annotations.iter().find(|a| &a.correlation_id == id)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations.iter()
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// Number of annotations in the given status.
    pub fn count(&self, status: AnnotationStatus) -> usize {
        self.annotations.iter().filter(|a| a.status == status).count()
    }
}

/// Read handle for the presentation layer.
#[derive(Debug, Clone)]
pub struct AnnotationWatch {
    rx: watch::Receiver<Arc<AnnotationSet>>,
}

impl AnnotationWatch {
    /// Latest published set, marking it as seen.
    pub fn current(&mut self) -> Arc<AnnotationSet> {
        Arc::clone(&self.rx.borrow_and_update())
    }

    /// Waits for the next emission. Returns `None` once the store is gone.
    ///
    /// Emissions are coalesced: a slow reader only sees the newest set.
    pub async fn next(&mut self) -> Option<Arc<AnnotationSet>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }

    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}

// ============================================================================
// Store
// ============================================================================

/// In-memory authoritative set of annotations.
pub struct AnnotationStore {
    state: Mutex<Arc<AnnotationSet>>,
    tx: watch::Sender<Arc<AnnotationSet>>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        let initial = Arc::new(AnnotationSet::default());
        let (tx, _rx) = watch::channel(Arc::clone(&initial));
        Self {
            state: Mutex::new(initial),
            tx,
        }
    }

    /// Replace the published state. Caller holds the state lock.
    fn publish(&self, state: &mut Arc<AnnotationSet>, annotations: Vec<Annotation>) {
        let next = Arc::new(AnnotationSet {
            version: state.version + 1,
            annotations,
        });
        *state = Arc::clone(&next);
        self.tx.send_replace(next);
    }

    // ========================================================================
    // Creation & Reconciliation
    // ========================================================================

    /// Insert a `Pending` annotation and return its fresh correlation id.
    pub fn create_local(&self, coordinate: Coordinate) -> CorrelationId {
        let mut state = self.state.lock();

        let mut id = CorrelationId::generate();
        while state.contains(&id) {
            id = CorrelationId::generate();
        }

        let mut annotations = state.annotations.clone();
        annotations.push(Annotation::pending(id.clone(), coordinate, Utc::now()));
        self.publish(&mut state, annotations);

        tracing::debug!(
            correlation_id = %id,
            latitude = coordinate.latitude,
            longitude = coordinate.longitude,
            "created local annotation"
        );
        id
    }

    /// Merge a full remote snapshot into the store.
    pub fn apply_remote_snapshot(&self, documents: &[RemoteDocument]) -> ReconciliationReport {
        let mut state = self.state.lock();

        let merged = reconcile(&state.annotations, documents, Utc::now());
        if merged.annotations != state.annotations {
            self.publish(&mut state, merged.annotations);
        }

        let report = merged.report;
        tracing::debug!(
            documents = documents.len(),
            matched = report.matched,
            newly_synced = report.newly_synced.len(),
            retained = report.retained,
            removed = report.removed.len(),
            adopted = report.adopted,
            incomplete = report.incomplete,
            conflicts = report.conflicts.len(),
            version = state.version,
            "applied remote snapshot"
        );
        for conflict in &report.conflicts {
            tracing::debug!(?conflict, "reconciliation conflict resolved by remote");
        }
        report
    }

    // ========================================================================
    // Pipeline Transitions
    // ========================================================================

    /// Validate and apply a status transition, with an edit applied to the
    /// updated annotation.
    fn transition(
        &self,
        id: &CorrelationId,
        to: AnnotationStatus,
        edit: impl FnOnce(&mut Annotation),
    ) -> Result<Annotation, StoreError> {
        let mut state = self.state.lock();

        let index = state
            .annotations
            .iter()
            .position(|a| &a.correlation_id == id)
            .ok_or_else(|| StoreError::UnknownAnnotation(id.clone()))?;

        let from = state.annotations[index].status;
        if !from.can_transition_to(&to) {
            return Err(StoreError::IllegalTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        let mut annotations = state.annotations.clone();
        let annotation = &mut annotations[index];
        annotation.status = to;
        edit(annotation);
        let updated = annotation.clone();
        self.publish(&mut state, annotations);

        tracing::debug!(correlation_id = %id, %from, %to, "annotation transition");
        Ok(updated)
    }

    /// `Pending → AwaitingImage`; returns the coordinate handed to the picker.
    pub fn begin_image_selection(&self, id: &CorrelationId) -> Result<Coordinate, StoreError> {
        self.transition(id, AnnotationStatus::AwaitingImage, |_| {})
            .map(|a| a.coordinate)
    }

    /// `AwaitingImage → Uploading`.
    pub fn begin_upload(&self, id: &CorrelationId) -> Result<(), StoreError> {
        self.transition(id, AnnotationStatus::Uploading, |_| {})
            .map(|_| ())
    }

    /// `Uploading → Persisted` with the resolved blob reference.
    pub fn mark_persisted(&self, id: &CorrelationId, image_ref: &str) -> Result<(), StoreError> {
        self.transition(id, AnnotationStatus::Persisted, |a| {
            a.image_ref = Some(image_ref.to_string());
        })
        .map(|_| ())
    }

    /// Move to `Failed`, remembering which step to resume.
    pub fn mark_failed(
        &self,
        id: &CorrelationId,
        resume: ResumePoint,
        message: &str,
    ) -> Result<(), StoreError> {
        self.transition(id, AnnotationStatus::Failed(resume), |a| {
            a.last_error = Some(message.to_string());
        })
        .map(|_| ())
    }

    /// `Failed → Uploading | Persisted`; returns the step to re-run.
    pub fn resume(&self, id: &CorrelationId) -> Result<ResumePoint, StoreError> {
        let status = self
            .get(id)
            .map(|a| a.status)
            .ok_or_else(|| StoreError::UnknownAnnotation(id.clone()))?;

        let (resume, to) = match status {
            AnnotationStatus::Failed(point @ (ResumePoint::Upload | ResumePoint::Reference)) => {
                (point, AnnotationStatus::Uploading)
            }
            AnnotationStatus::Failed(ResumePoint::Persist) => {
                (ResumePoint::Persist, AnnotationStatus::Persisted)
            }
            from => {
                return Err(StoreError::IllegalTransition {
                    id: id.clone(),
                    from,
                    to: AnnotationStatus::Uploading,
                })
            }
        };

        self.transition(id, to, |a| a.last_error = None)?;
        Ok(resume)
    }

    /// Attach the id of the freshly written document. Status stays as it is:
    /// only reconciliation marks an annotation `Synced`.
    pub fn record_remote_id(&self, id: &CorrelationId, remote_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();

        let index = state
            .annotations
            .iter()
            .position(|a| &a.correlation_id == id)
            .ok_or_else(|| StoreError::UnknownAnnotation(id.clone()))?;

        let current = &state.annotations[index];
        match current.status {
            AnnotationStatus::Persisted if current.remote_id.is_none() => {
                let mut annotations = state.annotations.clone();
                annotations[index].remote_id = Some(remote_id.to_string());
                self.publish(&mut state, annotations);
                Ok(())
            }
            AnnotationStatus::Persisted | AnnotationStatus::Synced => Ok(()),
            from => Err(StoreError::IllegalTransition {
                id: id.clone(),
                from,
                to: AnnotationStatus::Persisted,
            }),
        }
    }

    /// Remove an annotation whose image selection was abandoned.
    pub fn discard(&self, id: &CorrelationId) -> Result<Annotation, StoreError> {
        let mut state = self.state.lock();

        let index = state
            .annotations
            .iter()
            .position(|a| &a.correlation_id == id)
            .ok_or_else(|| StoreError::UnknownAnnotation(id.clone()))?;

        let from = state.annotations[index].status;
        if !from.can_transition_to(&AnnotationStatus::Discarded) {
            return Err(StoreError::IllegalTransition {
                id: id.clone(),
                from,
                to: AnnotationStatus::Discarded,
            });
        }

        let mut annotations = state.annotations.clone();
        let mut removed = annotations.remove(index);
        removed.status = AnnotationStatus::Discarded;
        self.publish(&mut state, annotations);

        tracing::debug!(correlation_id = %id, %from, "discarded annotation");
        Ok(removed)
    }

    // ========================================================================
    // Read Operations
    // ========================================================================

    pub fn get(&self, id: &CorrelationId) -> Option<Annotation> {
        self.state.lock().get(id).cloned()
    }

    /// Latest published set.
    pub fn current(&self) -> Arc<AnnotationSet> {
        Arc::clone(&self.state.lock())
    }

    /// Subscribe to whole-list emissions.
    pub fn observe(&self) -> AnnotationWatch {
        AnnotationWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for AnnotationStore {
    fn default() -> Self {
        Self::new()
    }
}
