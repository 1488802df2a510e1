//! Scripted scenarios against the in-memory ports.
//!
//! A scenario is a JSON document listing gestures, remote changes and
//! injected faults:
//!
//! ```json
//! {
//!   "name": "retry after upload failure",
//!   "steps": [
//!     { "step": "fail_uploads", "count": 1 },
//!     { "step": "long_press", "latitude": 55.0, "longitude": 12.0 },
//!     { "step": "pick_image", "uri": "demo://photo.jpg" },
//!     { "step": "settle" },
//!     { "step": "retry", "index": 0 }
//!   ]
//! }
//! ```
//!
//! `index` refers to annotations in creation order.

use anyhow::{anyhow, Context, Result};
use geomark_sync::memory::MemoryPorts;
use geomark_sync::{
    Annotation, AnnotationEngine, Coordinate, CorrelationId, EngineConfig, EngineEvent,
    FsImageSource, Inspection, PermissionStatus, Region, RemoteDocument, ViewportState,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How long a step may wait on the engine.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Scenario Format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    /// Serve picked images from this directory instead of synthetic bytes.
    #[serde(default)]
    pub image_dir: Option<PathBuf>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    LongPress { latitude: f64, longitude: f64 },
    PickImage { uri: String },
    CancelPick,
    FailUploads { count: u32 },
    FailReferences { count: u32 },
    FailWrites { count: u32 },
    Retry { index: usize },
    Location { latitude: f64, longitude: f64 },
    DenyLocation,
    RemoteInsert { document: RemoteDocument },
    RemoteDelete { id: String },
    Settle,
    Tap { index: usize },
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse scenario {}", path.display()))
    }

    /// Built-in walkthrough used by `geomark demo`.
    pub fn demo() -> Self {
        let friend = RemoteDocument {
            id: "friend-1".to_string(),
            latitude: 48.8566,
            longitude: 2.3522,
            image_url: "https://cdn.example/paris.jpg".to_string(),
            correlation_id: Some("friend-paris".into()),
        };

        Self {
            name: Some("demo".to_string()),
            image_dir: None,
            steps: vec![
                Step::Location {
                    latitude: 55.6761,
                    longitude: 12.5683,
                },
                Step::LongPress {
                    latitude: 55.0,
                    longitude: 12.0,
                },
                Step::PickImage {
                    uri: "demo://copenhagen.jpg".to_string(),
                },
                Step::Settle,
                Step::FailUploads { count: 1 },
                Step::LongPress {
                    latitude: 40.4168,
                    longitude: -3.7038,
                },
                Step::PickImage {
                    uri: "demo://madrid.jpg".to_string(),
                },
                Step::Settle,
                Step::Retry { index: 1 },
                Step::Settle,
                Step::RemoteInsert { document: friend },
                Step::LongPress {
                    latitude: 51.5072,
                    longitude: -0.1276,
                },
                Step::CancelPick,
                Step::Settle,
                Step::Tap { index: 0 },
            ],
        }
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: Option<String>,
    pub annotations: Vec<Annotation>,
    pub region: Region,
    pub viewport: ViewportState,
    pub remote_documents: Vec<RemoteDocument>,
    pub uploads: usize,
    pub writes: usize,
    pub inspections: Vec<Inspection>,
    pub events: Vec<EngineEvent>,
    /// Steps that could not be applied as written.
    pub warnings: Vec<String>,
}

// ============================================================================
// Runner
// ============================================================================

struct Runner {
    engine: AnnotationEngine,
    ports: MemoryPorts,
    synthetic_images: bool,
    started: bool,
    created: Vec<CorrelationId>,
    inspections: Vec<Inspection>,
    warnings: Vec<String>,
}

/// Run `scenario` to completion and report the final state.
pub async fn run(scenario: &Scenario, config: EngineConfig) -> Result<ScenarioReport> {
    let ports = MemoryPorts::new(config.collection.clone());
    let mut engine_ports = ports.ports();
    if let Some(dir) = &scenario.image_dir {
        engine_ports.images = Arc::new(FsImageSource::with_root(dir));
    }

    let engine = AnnotationEngine::new(engine_ports, config);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.on_event(Box::new(move |event| sink.lock().push(event.clone())));

    let mut runner = Runner {
        engine,
        ports,
        synthetic_images: scenario.image_dir.is_none(),
        started: false,
        created: Vec::new(),
        inspections: Vec::new(),
        warnings: Vec::new(),
    };

    for (number, step) in scenario.steps.iter().enumerate() {
        tracing::debug!(step = number, ?step, "applying scenario step");
        runner
            .apply(step)
            .await
            .with_context(|| format!("step {number} ({step:?}) failed"))?;
    }

    runner.ensure_started().await;
    if !runner.engine.settle(STEP_TIMEOUT).await {
        runner.warn("attachments still running at the end of the scenario");
    }

    let annotations = runner.engine.store().current().annotations.clone();
    let report = ScenarioReport {
        name: scenario.name.clone(),
        annotations,
        region: runner.engine.region(),
        viewport: runner.engine.viewport_state(),
        remote_documents: runner.ports.collection.documents(),
        uploads: runner.ports.blobs.uploads().len(),
        writes: runner.ports.collection.write_count(),
        inspections: std::mem::take(&mut runner.inspections),
        events: Vec::new(),
        warnings: std::mem::take(&mut runner.warnings),
    };

    runner.engine.shutdown().await;
    let events = events.lock().clone();
    Ok(ScenarioReport { events, ..report })
}

impl Runner {
    async fn ensure_started(&mut self) {
        if !self.started {
            self.started = true;
            self.engine.start().await;
        }
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(%message, "scenario warning");
        self.warnings.push(message);
    }

    fn annotation(&self, index: usize) -> Result<&CorrelationId> {
        self.created.get(index).ok_or_else(|| {
            anyhow!(
                "no annotation #{index} (only {} created)",
                self.created.len()
            )
        })
    }

    async fn apply(&mut self, step: &Step) -> Result<()> {
        if *step == Step::DenyLocation {
            if self.started {
                self.warn("deny_location after start has no effect");
            } else {
                self.ports.location.set_permission(PermissionStatus::Denied);
            }
            return Ok(());
        }
        self.ensure_started().await;

        match step {
            Step::LongPress {
                latitude,
                longitude,
            } => {
                let coordinate = Coordinate::new(*latitude, *longitude)?;
                let id = self.engine.on_long_press(coordinate);
                self.created.push(id);
            }
            Step::PickImage { uri } => {
                if self.synthetic_images {
                    self.ports
                        .images
                        .insert(uri.clone(), format!("synthetic image {uri}").into_bytes());
                }
                let pending = tokio::time::timeout(STEP_TIMEOUT, self.ports.picker.next_request())
                    .await
                    .map_err(|_| anyhow!("no image selection is open"))?;
                pending.select(uri.clone());
            }
            Step::CancelPick => {
                let pending = tokio::time::timeout(STEP_TIMEOUT, self.ports.picker.next_request())
                    .await
                    .map_err(|_| anyhow!("no image selection is open"))?;
                pending.cancel();
            }
            Step::FailUploads { count } => self.ports.blobs.fail_next_uploads(*count),
            Step::FailReferences { count } => self.ports.blobs.fail_next_references(*count),
            Step::FailWrites { count } => self.ports.collection.fail_next_writes(*count),
            Step::Retry { index } => {
                let id = self.annotation(*index)?.clone();
                if let Err(err) = self.engine.retry(&id) {
                    self.warn(format!("retry #{index} rejected: {err}"));
                }
            }
            Step::Location {
                latitude,
                longitude,
            } => {
                let coordinate = Coordinate::new(*latitude, *longitude)?;
                let mut states = self.engine.viewport_states();
                let ready = matches!(
                    tokio::time::timeout(
                        STEP_TIMEOUT,
                        states.wait_for(|s| *s == ViewportState::Tracking || s.is_terminal()),
                    )
                    .await,
                    Ok(Ok(_))
                );
                if !ready {
                    self.warn("location tracking did not start");
                }
                if !self.ports.location.push(coordinate) {
                    self.warn(format!(
                        "location sample ({latitude}, {longitude}) dropped: no active watch"
                    ));
                }
            }
            Step::RemoteInsert { document } => self.ports.collection.insert(document.clone()),
            Step::RemoteDelete { id } => {
                if !self.ports.collection.remove(id) {
                    self.warn(format!("remote document {id} does not exist"));
                }
            }
            Step::Settle => {
                if !self.engine.settle(STEP_TIMEOUT).await {
                    self.warn("settle timed out with attachments still running");
                }
            }
            Step::Tap { index } => {
                let id = self.annotation(*index)?.clone();
                match self.engine.on_annotation_tap(&id) {
                    Some(inspection) => self.inspections.push(inspection),
                    None => self.warn(format!("annotation #{index} is no longer on the map")),
                }
            }
            Step::DenyLocation => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geomark_sync::{AnnotationStatus, ResumePoint};

    #[test]
    fn test_parse_steps() {
        let json = r#"{
            "steps": [
                { "step": "long_press", "latitude": 55.0, "longitude": 12.0 },
                { "step": "cancel_pick" },
                { "step": "remote_insert", "document": {
                    "id": "doc9", "latitude": 1.0, "longitude": 2.0, "imageURL": "u"
                } },
                { "step": "fail_writes", "count": 2 }
            ]
        }"#;

        let scenario: Scenario = serde_json::from_str(json).unwrap();

        assert_eq!(scenario.steps.len(), 4);
        assert_eq!(scenario.steps[1], Step::CancelPick);
        assert!(matches!(&scenario.steps[2], Step::RemoteInsert { document } if document.id == "doc9"));
        assert_eq!(scenario.steps[3], Step::FailWrites { count: 2 });
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        let json = r#"{ "steps": [ { "step": "shake_device" } ] }"#;
        assert!(serde_json::from_str::<Scenario>(json).is_err());
    }

    #[tokio::test]
    async fn test_demo_scenario() {
        let report = run(&Scenario::demo(), EngineConfig::default()).await.unwrap();

        // Copenhagen and Madrid synced, Paris adopted, London discarded
        assert_eq!(report.annotations.len(), 3);
        assert!(report
            .annotations
            .iter()
            .all(|a| a.status == AnnotationStatus::Synced));
        assert_eq!(report.uploads, 3);
        assert_eq!(report.writes, 2);
        assert_eq!(report.region, Region::new(55.6761, 12.5683, 20.0, 20.0));
        assert_eq!(report.inspections.len(), 1);
        assert_eq!(report.inspections[0].latitude_label, "Latitude: 55.000000");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::AnnotationDiscarded { .. })));
    }

    #[tokio::test]
    async fn test_failed_write_without_retry() {
        let scenario = Scenario {
            name: None,
            image_dir: None,
            steps: vec![
                Step::FailWrites { count: 1 },
                Step::LongPress {
                    latitude: 10.0,
                    longitude: 10.0,
                },
                Step::PickImage {
                    uri: "demo://a.jpg".to_string(),
                },
                Step::Settle,
            ],
        };

        let report = run(&scenario, EngineConfig::default()).await.unwrap();

        assert_eq!(
            report.annotations[0].status,
            AnnotationStatus::Failed(ResumePoint::Persist)
        );
        assert_eq!(report.writes, 0);
        assert!(report.remote_documents.is_empty());
    }

    #[tokio::test]
    async fn test_denied_location() {
        let scenario = Scenario {
            name: None,
            image_dir: None,
            steps: vec![
                Step::DenyLocation,
                Step::Location {
                    latitude: 1.0,
                    longitude: 1.0,
                },
            ],
        };

        let report = run(&scenario, EngineConfig::default()).await.unwrap();

        assert!(matches!(report.viewport, ViewportState::Unavailable { .. }));
        assert_eq!(report.region, Region::new(55.0, 12.0, 20.0, 20.0));
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_images_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("beach.jpg"), b"jpeg").unwrap();
        let scenario = Scenario {
            name: None,
            image_dir: Some(dir.path().to_path_buf()),
            steps: vec![
                Step::LongPress {
                    latitude: 36.0,
                    longitude: -5.0,
                },
                Step::PickImage {
                    uri: "beach.jpg".to_string(),
                },
                Step::LongPress {
                    latitude: 37.0,
                    longitude: -5.0,
                },
                Step::PickImage {
                    uri: "missing.jpg".to_string(),
                },
            ],
        };

        let report = run(&scenario, EngineConfig::default()).await.unwrap();

        assert_eq!(report.annotations[0].status, AnnotationStatus::Synced);
        assert_eq!(
            report.annotations[1].status,
            AnnotationStatus::Failed(ResumePoint::Upload)
        );
    }

    #[tokio::test]
    async fn test_bad_index_fails_step() {
        let scenario = Scenario {
            name: None,
            image_dir: None,
            steps: vec![Step::Tap { index: 3 }],
        };

        let err = run(&scenario, EngineConfig::default()).await.unwrap_err();
        assert!(format!("{err:#}").contains("no annotation #3"));
    }
}
