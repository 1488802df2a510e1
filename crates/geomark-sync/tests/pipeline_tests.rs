//! Attachment pipeline tests against the in-memory ports
//!
//! 1. Happy path: select → upload → reference → write
//! 2. Cancellation and picker failures discard without remote writes
//! 3. Each failing step resumes where it stopped on retry
//! 4. Timeouts become `Failed`
//! 5. Reconciliation overtaking a run stops it quietly

use bytes::Bytes;
use geomark_sync::memory::MemoryPorts;
use geomark_sync::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const PHOTO: &str = "file:///DCIM/photo.jpg";

struct Harness {
    store: Arc<AnnotationStore>,
    ports: MemoryPorts,
    pipeline: Arc<AttachmentPipeline>,
    events: broadcast::Receiver<EngineEvent>,
}

fn harness() -> Harness {
    harness_with(AttachmentConfig::default())
}

fn harness_with(config: AttachmentConfig) -> Harness {
    let store = Arc::new(AnnotationStore::new());
    let ports = MemoryPorts::new("markers");
    ports.images.insert(PHOTO, Bytes::from_static(b"jpeg-bytes"));
    // Snapshots only when a test publishes explicitly
    ports.collection.set_auto_publish(false);

    let bus = EventBus::new(32);
    let events = bus.subscribe();
    let pipeline = Arc::new(AttachmentPipeline::new(
        Arc::clone(&store),
        ports.picker.clone(),
        ports.images.clone(),
        ports.blobs.clone(),
        ports.collection.clone(),
        bus,
        config,
        "markers",
    ));

    Harness {
        store,
        ports,
        pipeline,
        events,
    }
}

fn copenhagen() -> Coordinate {
    Coordinate::new(55.0, 12.0).unwrap()
}

fn drain(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn test_attach_persists_and_reconciles() {
    let h = harness();
    h.ports.picker.queue_selection(PHOTO);
    let id = h.store.create_local(copenhagen());

    let outcome = h.pipeline.attach(&id).await.unwrap();
    assert_eq!(
        outcome,
        AttachmentOutcome::Persisted {
            remote_id: "doc1".to_string()
        }
    );

    let uploads = h.ports.blobs.uploads();
    assert_eq!(uploads.len(), 1);
    let (key, bytes) = &uploads[0];
    assert!(key.starts_with("images/") && key.ends_with(".jpg"), "key {key}");
    assert_eq!(&bytes[..], b"jpeg-bytes");

    let annotation = h.store.get(&id).unwrap();
    assert_eq!(annotation.status, AnnotationStatus::Persisted);
    assert_eq!(annotation.remote_id.as_deref(), Some("doc1"));
    assert_eq!(annotation.image_ref, Some(h.ports.blobs.url_for(key)));

    let document = h.ports.collection.get("doc1").unwrap();
    assert_eq!(document.correlation_id, Some(id.clone()));
    assert_eq!(document.latitude, 55.0);

    // Only a snapshot marks it synced
    h.store.apply_remote_snapshot(&h.ports.collection.documents());
    let synced = h.store.get(&id).unwrap();
    assert_eq!(synced.status, AnnotationStatus::Synced);
    assert_eq!(synced.image_ref.as_deref(), Some(document.image_url.as_str()));
    assert_eq!(h.pipeline.pending_contexts(), 0);
}

#[tokio::test]
async fn test_picker_receives_annotation_coordinate() {
    let h = harness();
    let id = h.store.create_local(copenhagen());

    let pipeline = Arc::clone(&h.pipeline);
    let task_id = id.clone();
    let run = tokio::spawn(async move { pipeline.attach(&task_id).await });

    let pending = h.ports.picker.next_request().await;
    assert_eq!(pending.coordinate, copenhagen());
    assert_eq!(h.store.get(&id).unwrap().status, AnnotationStatus::AwaitingImage);
    pending.select(PHOTO);

    assert!(matches!(
        run.await.unwrap(),
        Ok(AttachmentOutcome::Persisted { .. })
    ));
}

// ============================================================================
// Discarding
// ============================================================================

#[tokio::test]
async fn test_cancelled_selection_discards() {
    let mut h = harness();
    h.ports.picker.queue_cancel();
    let id = h.store.create_local(copenhagen());

    let outcome = h.pipeline.attach(&id).await.unwrap();

    assert_eq!(outcome, AttachmentOutcome::Discarded);
    assert!(h.store.get(&id).is_none());
    assert_eq!(h.ports.collection.write_count(), 0);
    assert!(h.ports.blobs.uploads().is_empty());
    assert_eq!(
        drain(&mut h.events),
        vec![EngineEvent::AnnotationDiscarded { correlation_id: id }]
    );
}

#[tokio::test]
async fn test_picker_failure_discards_with_notice() {
    let mut h = harness();
    h.ports
        .picker
        .queue_error(PickerError::Unavailable("gallery locked".into()));
    let id = h.store.create_local(copenhagen());

    let outcome = h.pipeline.attach(&id).await.unwrap();

    assert_eq!(outcome, AttachmentOutcome::Discarded);
    assert!(h.store.current().is_empty());
    let events = drain(&mut h.events);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        EngineEvent::Notice { level: NoticeLevel::Error, .. }
    ));
}

// ============================================================================
// Failures & Retry
// ============================================================================

#[tokio::test]
async fn test_upload_failure_retries_same_image() {
    let mut h = harness();
    h.ports.picker.queue_selection(PHOTO);
    h.ports.blobs.fail_next_uploads(1);
    let id = h.store.create_local(copenhagen());

    let outcome = h.pipeline.attach(&id).await.unwrap();
    assert_eq!(
        outcome,
        AttachmentOutcome::Failed {
            step: ResumePoint::Upload
        }
    );

    let failed = h.store.get(&id).unwrap();
    assert_eq!(failed.status, AnnotationStatus::Failed(ResumePoint::Upload));
    assert!(failed.last_error.is_some());
    match drain(&mut h.events).as_slice() {
        [EngineEvent::AttachmentFailed {
            correlation_id,
            step: ResumePoint::Upload,
            retryable: true,
            ..
        }] => assert_eq!(correlation_id, &id),
        other => panic!("unexpected events {other:?}"),
    }

    // Failed annotations survive snapshots that don't mention them
    h.store.apply_remote_snapshot(&[]);
    assert!(h.store.get(&id).is_some());

    let outcome = h.pipeline.retry(&id).await.unwrap();
    assert!(matches!(outcome, AttachmentOutcome::Persisted { .. }));

    let uploads = h.ports.blobs.uploads();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0], uploads[1]);
    assert_eq!(h.ports.picker.requests(), 1);
    assert_eq!(h.ports.images.reads(), 2);
    assert!(h.store.get(&id).unwrap().last_error.is_none());
}

#[tokio::test]
async fn test_reference_failure_skips_upload_on_retry() {
    let h = harness();
    h.ports.picker.queue_selection(PHOTO);
    h.ports.blobs.fail_next_references(1);
    let id = h.store.create_local(copenhagen());

    assert_eq!(
        h.pipeline.attach(&id).await.unwrap(),
        AttachmentOutcome::Failed {
            step: ResumePoint::Reference
        }
    );

    let outcome = h.pipeline.retry(&id).await.unwrap();
    assert!(matches!(outcome, AttachmentOutcome::Persisted { .. }));
    assert_eq!(h.ports.blobs.uploads().len(), 1);
    assert_eq!(h.ports.images.reads(), 1);
}

#[tokio::test]
async fn test_write_failure_reuses_reference() {
    let h = harness();
    h.ports.picker.queue_selection(PHOTO);
    h.ports.collection.fail_next_writes(1);
    let id = h.store.create_local(copenhagen());

    assert_eq!(
        h.pipeline.attach(&id).await.unwrap(),
        AttachmentOutcome::Failed {
            step: ResumePoint::Persist
        }
    );
    let failed = h.store.get(&id).unwrap();
    assert_eq!(failed.status, AnnotationStatus::Failed(ResumePoint::Persist));
    let image_ref = failed.image_ref.clone().unwrap();

    let outcome = h.pipeline.retry(&id).await.unwrap();

    assert_eq!(
        outcome,
        AttachmentOutcome::Persisted {
            remote_id: "doc1".to_string()
        }
    );
    assert_eq!(h.ports.blobs.uploads().len(), 1);
    assert_eq!(h.ports.collection.get("doc1").unwrap().image_url, image_ref);
}

#[tokio::test]
async fn test_failed_write_that_landed_releases_retry_state() {
    let h = harness();
    h.ports.picker.queue_selection(PHOTO);
    h.ports.collection.fail_next_writes(1);
    let id = h.store.create_local(copenhagen());

    h.pipeline.attach(&id).await.unwrap();
    assert_eq!(h.pipeline.pending_contexts(), 1);
    let image_ref = h.store.get(&id).unwrap().image_ref.unwrap();

    // The document shows up anyway, e.g. a write reported as failed that was stored
    h.store.apply_remote_snapshot(&[RemoteDocument {
        id: "doc7".to_string(),
        latitude: 55.0,
        longitude: 12.0,
        image_url: image_ref,
        correlation_id: Some(id.clone()),
    }]);

    assert_eq!(h.store.get(&id).unwrap().status, AnnotationStatus::Synced);
    assert_eq!(h.pipeline.prune(), 1);
    assert_eq!(h.pipeline.pending_contexts(), 0);
}

#[tokio::test]
async fn test_missing_image_fails_upload_step() {
    let h = harness();
    h.ports.picker.queue_selection("file:///DCIM/deleted.jpg");
    let id = h.store.create_local(copenhagen());

    assert_eq!(
        h.pipeline.attach(&id).await.unwrap(),
        AttachmentOutcome::Failed {
            step: ResumePoint::Upload
        }
    );
    assert!(h
        .store
        .get(&id)
        .unwrap()
        .last_error
        .unwrap()
        .contains("deleted.jpg"));
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_upload_timeout() {
    let h = harness();
    h.ports.picker.queue_selection(PHOTO);
    h.ports.blobs.set_upload_delay(Some(Duration::from_secs(120)));
    let id = h.store.create_local(copenhagen());

    let outcome = h.pipeline.attach(&id).await.unwrap();

    assert_eq!(
        outcome,
        AttachmentOutcome::Failed {
            step: ResumePoint::Upload
        }
    );
    assert_eq!(
        h.store.get(&id).unwrap().last_error.as_deref(),
        Some("upload step timed out after 30s")
    );
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_uses_configured_bound() {
    let config = AttachmentConfig {
        write_timeout_secs: 2,
        ..AttachmentConfig::default()
    };
    let h = harness_with(config);
    h.ports.picker.queue_selection(PHOTO);
    h.ports.collection.set_write_delay(Some(Duration::from_secs(5)));
    let id = h.store.create_local(copenhagen());

    let outcome = h.pipeline.attach(&id).await.unwrap();

    assert_eq!(
        outcome,
        AttachmentOutcome::Failed {
            step: ResumePoint::Persist
        }
    );
    assert_eq!(h.ports.collection.write_count(), 0);

    h.ports.collection.set_write_delay(None);
    let outcome = h.pipeline.retry(&id).await.unwrap();
    assert!(matches!(outcome, AttachmentOutcome::Persisted { .. }));
}

// ============================================================================
// Superseded Runs & Misuse
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_snapshot_during_upload_supersedes() {
    let h = harness();
    h.ports.picker.queue_selection(PHOTO);
    h.ports.blobs.set_upload_delay(Some(Duration::from_secs(10)));
    let id = h.store.create_local(copenhagen());
    let mut watch = h.store.observe();

    let pipeline = Arc::clone(&h.pipeline);
    let task_id = id.clone();
    let run = tokio::spawn(async move { pipeline.attach(&task_id).await });

    while watch.current().get(&id).map(|a| a.status) != Some(AnnotationStatus::Uploading) {
        watch.next().await.unwrap();
    }

    // Another device finished this annotation first
    h.store.apply_remote_snapshot(&[RemoteDocument {
        id: "doc-remote".to_string(),
        latitude: 55.0,
        longitude: 12.0,
        image_url: "https://cdn.example/other.jpg".to_string(),
        correlation_id: Some(id.clone()),
    }]);

    assert_eq!(run.await.unwrap(), Ok(AttachmentOutcome::Superseded));
    let annotation = h.store.get(&id).unwrap();
    assert_eq!(annotation.status, AnnotationStatus::Synced);
    assert_eq!(
        annotation.image_ref.as_deref(),
        Some("https://cdn.example/other.jpg")
    );
    assert_eq!(h.ports.collection.write_count(), 0);
    assert_eq!(h.pipeline.pending_contexts(), 0);
}

#[tokio::test]
async fn test_misuse_is_reported() {
    let h = harness();
    h.ports.picker.queue_selection(PHOTO);
    let id = h.store.create_local(copenhagen());
    h.pipeline.attach(&id).await.unwrap();

    // Not Pending any more
    assert!(matches!(
        h.pipeline.attach(&id).await,
        Err(StoreError::IllegalTransition { .. })
    ));
    // Not Failed
    assert!(matches!(
        h.pipeline.retry(&id).await,
        Err(StoreError::IllegalTransition { .. })
    ));
}
