//! End-to-end tests for the annotation engine
//!
//! These drive `AnnotationEngine` through its public surface only:
//! gestures in, whole-list emissions, regions and events out.
//!
//! 1. Create → select → upload → write → snapshot → Synced
//! 2. Cancelled selection never reaches the remote collection
//! 3. Failed steps retry from where they stopped
//! 4. Remote inserts and deletions reconcile
//! 5. Location failures stay out of the annotation pipeline
//! 6. Shutdown releases every subscription

use bytes::Bytes;
use geomark_store::{AnnotationSet, AnnotationStatus, Coordinate, RemoteDocument, ResumePoint};
use geomark_sync::memory::MemoryPorts;
use geomark_sync::{
    AnnotationEngine, EngineConfig, EngineEvent, NoticeLevel, PermissionStatus, Region,
    StoreError, ViewportState,
};
use std::sync::Arc;
use std::time::Duration;

const PHOTO: &str = "file:///DCIM/IMG_0001.jpg";

/// Helper to create a test environment
fn test_env() -> (AnnotationEngine, MemoryPorts) {
    let ports = MemoryPorts::new("markers");
    ports.images.insert(PHOTO, Bytes::from_static(b"\xff\xd8jpeg"));
    let engine = AnnotationEngine::new(ports.ports(), EngineConfig::default());
    (engine, ports)
}

fn copenhagen() -> Coordinate {
    Coordinate::new(55.0, 12.0).unwrap()
}

/// Wait for the first emitted set satisfying `done`.
async fn wait_until(
    engine: &AnnotationEngine,
    done: impl Fn(&AnnotationSet) -> bool,
) -> Arc<AnnotationSet> {
    let mut watch = engine.observe();
    let current = watch.current();
    if done(&current) {
        return current;
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let set = watch.next().await.expect("store dropped");
            if done(&set) {
                return set;
            }
        }
    })
    .await
    .expect("condition not reached")
}

async fn wait_for_viewport(engine: &AnnotationEngine, expected: impl Fn(&ViewportState) -> bool) {
    let mut states = engine.viewport_states();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| expected(s)))
        .await
        .expect("viewport state not reached")
        .expect("viewport dropped");
}

// ============================================================================
// Attachment Scenarios
// ============================================================================

#[tokio::test]
async fn test_long_press_to_synced() {
    let (engine, ports) = test_env();
    ports.picker.queue_selection(PHOTO);
    engine.start().await;

    let id = engine.on_long_press(copenhagen());

    // Visible immediately, before any I/O
    assert!(engine.store().current().contains(&id));

    let set = wait_until(&engine, |set| {
        set.get(&id).map(|a| a.status) == Some(AnnotationStatus::Synced)
    })
    .await;

    let annotation = set.get(&id).unwrap();
    let document = ports.collection.get("doc1").unwrap();
    assert_eq!(annotation.remote_id.as_deref(), Some("doc1"));
    assert_eq!(annotation.image_ref.as_deref(), Some(document.image_url.as_str()));
    assert_eq!(annotation.coordinate, copenhagen());

    let (key, _) = &ports.blobs.uploads()[0];
    let millis = key
        .strip_prefix("images/")
        .and_then(|k| k.strip_suffix(".jpg"))
        .unwrap();
    assert!(millis.parse::<u64>().is_ok());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_selection_leaves_no_trace() {
    let (engine, ports) = test_env();
    ports.picker.queue_cancel();
    let mut events = engine.subscribe_events();
    engine.start().await;

    let id = engine.on_long_press(copenhagen());

    loop {
        match events.recv().await.unwrap() {
            EngineEvent::AnnotationDiscarded { correlation_id } => {
                assert_eq!(correlation_id, id);
                break;
            }
            _ => continue,
        }
    }
    assert!(!engine.store().current().contains(&id));
    assert!(engine.on_annotation_tap(&id).is_none());
    assert_eq!(ports.collection.write_count(), 0);
    assert!(ports.collection.documents().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_upload_failure_then_retry() {
    let (engine, ports) = test_env();
    ports.picker.queue_selection(PHOTO);
    ports.blobs.fail_next_uploads(1);
    engine.start().await;

    let id = engine.on_long_press(copenhagen());
    wait_until(&engine, |set| {
        set.get(&id).map(|a| a.status) == Some(AnnotationStatus::Failed(ResumePoint::Upload))
    })
    .await;

    let inspection = engine.on_annotation_tap(&id).unwrap();
    assert!(inspection.retryable);
    assert!(inspection.last_error.is_some());

    engine.retry(&id).unwrap();
    wait_until(&engine, |set| {
        set.get(&id).map(|a| a.status) == Some(AnnotationStatus::Synced)
    })
    .await;

    let uploads = ports.blobs.uploads();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].1, uploads[1].1);
    assert_eq!(ports.picker.requests(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_write_failure_then_retry_reuses_upload() {
    let (engine, ports) = test_env();
    ports.picker.queue_selection(PHOTO);
    ports.collection.fail_next_writes(1);
    engine.start().await;

    let id = engine.on_long_press(copenhagen());
    let set = wait_until(&engine, |set| {
        set.get(&id).map(|a| a.status) == Some(AnnotationStatus::Failed(ResumePoint::Persist))
    })
    .await;
    let image_ref = set.get(&id).unwrap().image_ref.clone().unwrap();

    engine.retry(&id).unwrap();
    let set = wait_until(&engine, |set| {
        set.get(&id).map(|a| a.status) == Some(AnnotationStatus::Synced)
    })
    .await;

    assert_eq!(ports.blobs.uploads().len(), 1);
    assert_eq!(set.get(&id).unwrap().image_ref, Some(image_ref));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_retry_rejects_healthy_annotations() {
    let (engine, ports) = test_env();
    ports.picker.queue_selection(PHOTO);
    engine.start().await;

    let id = engine.on_long_press(copenhagen());
    wait_until(&engine, |set| {
        set.get(&id).map(|a| a.status) == Some(AnnotationStatus::Synced)
    })
    .await;

    assert!(matches!(
        engine.retry(&id),
        Err(StoreError::IllegalTransition {
            from: AnnotationStatus::Synced,
            ..
        })
    ));
    assert!(matches!(
        engine.retry(&"missing".into()),
        Err(StoreError::UnknownAnnotation(_))
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_marker_inspection_labels() {
    let (engine, _ports) = test_env();

    let id = engine.on_long_press(Coordinate::new(55.676098, 12.568337).unwrap());
    let inspection = engine.on_annotation_tap(&id).unwrap();

    assert_eq!(inspection.latitude_label, "Latitude: 55.676098");
    assert_eq!(inspection.longitude_label, "Longitude: 12.568337");
    assert!(!inspection.retryable);

    engine.shutdown().await;
}

// ============================================================================
// Remote Changes
// ============================================================================

#[tokio::test]
async fn test_remote_insert_and_delete() {
    let (engine, ports) = test_env();
    engine.start().await;

    ports.collection.insert(RemoteDocument {
        id: "other-device".to_string(),
        latitude: 48.85,
        longitude: 2.35,
        image_url: "https://cdn.example/paris.jpg".to_string(),
        correlation_id: Some("c-paris".into()),
    });
    let set = wait_until(&engine, |set| set.len() == 1).await;
    let adopted = &set.annotations[0];
    assert_eq!(adopted.status, AnnotationStatus::Synced);
    assert_eq!(adopted.remote_id.as_deref(), Some("other-device"));

    ports.collection.remove("other-device");
    wait_until(&engine, |set| set.is_empty()).await;

    engine.shutdown().await;
}

#[tokio::test]
async fn test_pending_annotation_survives_snapshots() {
    let (engine, ports) = test_env();
    engine.start().await;

    // Picker held open: the annotation stays AwaitingImage
    let id = engine.on_long_press(copenhagen());
    let pending = ports.picker.next_request().await;

    ports.collection.insert(RemoteDocument {
        id: "unrelated".to_string(),
        latitude: 1.0,
        longitude: 1.0,
        image_url: "https://cdn.example/1.jpg".to_string(),
        correlation_id: None,
    });
    let set = wait_until(&engine, |set| set.len() == 2).await;
    assert_eq!(set.get(&id).unwrap().status, AnnotationStatus::AwaitingImage);

    pending.select(PHOTO);
    wait_until(&engine, |set| {
        set.get(&id).map(|a| a.status) == Some(AnnotationStatus::Synced)
    })
    .await;

    engine.shutdown().await;
}

#[tokio::test]
async fn test_subscription_failure_keeps_local_work() {
    let (engine, ports) = test_env();
    ports.collection.fail_subscriptions(true);
    ports.picker.queue_selection(PHOTO);
    let mut events = engine.subscribe_events();
    engine.start().await;

    let notice = events.recv().await.unwrap();
    assert!(matches!(
        notice,
        EngineEvent::Notice {
            level: NoticeLevel::Error,
            ..
        }
    ));

    let id = engine.on_long_press(copenhagen());
    let set = wait_until(&engine, |set| {
        set.get(&id).map(|a| a.status) == Some(AnnotationStatus::Persisted)
    })
    .await;
    assert_eq!(set.get(&id).unwrap().remote_id.as_deref(), Some("doc1"));

    engine.shutdown().await;
}

// ============================================================================
// Viewport
// ============================================================================

#[tokio::test]
async fn test_location_samples_move_region() {
    let (engine, ports) = test_env();
    assert_eq!(engine.region(), Region::new(55.0, 12.0, 20.0, 20.0));
    engine.start().await;
    wait_for_viewport(&engine, |s| *s == ViewportState::Tracking).await;

    let mut regions = engine.regions();
    ports.location.push(Coordinate::new(37.77, -122.42).unwrap());
    regions.changed().await.unwrap();

    assert_eq!(*regions.borrow(), Region::new(37.77, -122.42, 20.0, 20.0));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_permission_denied_is_isolated() {
    let (engine, ports) = test_env();
    ports.location.set_permission(PermissionStatus::Denied);
    ports.picker.queue_selection(PHOTO);
    let mut events = engine.subscribe_events();
    engine.start().await;

    wait_for_viewport(&engine, |s| matches!(s, ViewportState::Unavailable { .. })).await;

    let id = engine.on_long_press(copenhagen());
    wait_until(&engine, |set| {
        set.get(&id).map(|a| a.status) == Some(AnnotationStatus::Synced)
    })
    .await;

    let mut notices = 0;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Notice { message, .. } = event {
            assert_eq!(message, "Location permission denied");
            notices += 1;
        }
    }
    assert_eq!(notices, 1);
    assert_eq!(ports.location.active_watches(), 0);
    assert_eq!(engine.region(), Region::new(55.0, 12.0, 20.0, 20.0));

    engine.shutdown().await;
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_shutdown_releases_subscriptions() {
    let (engine, ports) = test_env();
    engine.start().await;
    wait_for_viewport(&engine, |s| *s == ViewportState::Tracking).await;
    assert_eq!(ports.location.active_watches(), 1);

    engine.shutdown().await;

    assert_eq!(engine.viewport_state(), ViewportState::Stopped);
    assert_eq!(ports.location.active_watches(), 0);
    assert_eq!(ports.location.cancelled_watches(), 1);
    assert_eq!(ports.collection.cancelled_subscriptions(), 1);
    assert!(!ports.location.push(copenhagen()));
}

#[tokio::test]
async fn test_drop_cancels_tasks() {
    let (engine, ports) = test_env();
    engine.start().await;
    wait_for_viewport(&engine, |s| *s == ViewportState::Tracking).await;

    drop(engine);

    tokio::time::timeout(Duration::from_secs(5), async {
        while ports.location.active_watches() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("location watch still open after drop");
}

#[tokio::test]
async fn test_shutdown_interrupts_open_selection() {
    let (engine, ports) = test_env();
    engine.start().await;

    let id = engine.on_long_press(copenhagen());
    let _pending = ports.picker.next_request().await;

    tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .expect("shutdown waited on the picker");

    assert_eq!(
        engine.store().get(&id).unwrap().status,
        AnnotationStatus::AwaitingImage
    );
    assert_eq!(ports.collection.write_count(), 0);
}

#[tokio::test]
async fn test_long_press_after_shutdown_is_ignored() {
    let (engine, ports) = test_env();
    ports.picker.queue_selection(PHOTO);
    engine.start().await;
    engine.shutdown().await;

    let id = engine.on_long_press(copenhagen());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(engine.store().current().is_empty());
    assert!(engine.on_annotation_tap(&id).is_none());
    assert_eq!(ports.picker.requests(), 0);
    assert_eq!(ports.collection.write_count(), 0);
}

#[tokio::test]
async fn test_settle_waits_for_open_selection() {
    let (engine, ports) = test_env();
    engine.start().await;

    let id = engine.on_long_press(copenhagen());
    let pending = ports.picker.next_request().await;

    assert!(!engine.settle(Duration::from_millis(50)).await);

    pending.select(PHOTO);
    assert!(engine.settle(Duration::from_secs(5)).await);
    assert_eq!(
        engine.store().get(&id).unwrap().status,
        AnnotationStatus::Synced
    );
}
