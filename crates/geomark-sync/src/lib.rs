//! Geomark Sync: keeping optimistic map annotations consistent with a remote collection
//!
//! This crate drives the asynchronous side of Geomark: the attachment
//! pipeline that gives each annotation its image, the viewport controller
//! that follows the device, and the listener that merges remote snapshots
//! into the [`geomark_store::AnnotationStore`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          ANNOTATION ENGINE                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  long press ──► create_local ──► ┌───────────────────────┐               │
//! │                                  │  Attachment Pipeline  │               │
//! │  ┌──────────┐   select           │                       │   upload      │
//! │  │  Picker  │◄──────────────────│ AwaitingImage         │──────────┐    │
//! │  └──────────┘                    │ Uploading             │          ▼    │
//! │                                  │ Persisted             │   ┌──────────┐│
//! │                                  └──────────┬────────────┘   │BlobStore ││
//! │                                             │ write          └──────────┘│
//! │                                             ▼                            │
//! │  ┌─────────────┐  snapshots  ┌──────────────────────┐                    │
//! │  │   Remote    │────────────►│  Annotation Store    │──► observe()       │
//! │  │ Collection  │◄────────────│  (reconcile by       │                    │
//! │  └─────────────┘   documents │   correlation id)    │                    │
//! │                              └──────────────────────┘                    │
//! │                                                                          │
//! │  ┌─────────────┐  samples    ┌──────────────────────┐                    │
//! │  │  Location   │────────────►│ Viewport Controller  │──► regions()       │
//! │  └─────────────┘             └──────────────────────┘                    │
//! │                                                                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Domains
//! - Pipeline failures become a `Failed` annotation with a retry affordance
//! - Location failures end the viewport in `Unavailable` and never touch annotations
//! - A lost snapshot listener is reported once; local work continues
//!
//! ## Ports
//! Every collaborator is an `async_trait` object in [`ports`]. In-memory
//! implementations live in [`memory`]; Firebase REST implementations are
//! behind the `firebase` feature.

pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
#[cfg(feature = "firebase")]
pub mod firebase;
pub mod memory;
pub mod pipeline;
pub mod ports;
pub mod viewport;

pub use config::{AttachmentConfig, EngineConfig, ViewportConfig, DEFAULT_COLLECTION};
pub use engine::{AnnotationEngine, Inspection};
pub use errors::{
    AttachmentError, ConfigError, ImageReadError, LocationError, PickerError, ReferenceError,
    RemoteError, UploadError, WriteError,
};
pub use events::{EngineEvent, EngineEventHandler, EventBus, NoticeLevel};
pub use pipeline::{AttachmentOutcome, AttachmentPipeline, BlobKeyGenerator};
pub use ports::{
    Accuracy, BlobStore, DocumentWriter, FsImageSource, ImagePicker, ImageSelection, ImageSource,
    LocationSample, LocationService, LocationSubscription, NewDocument, PermissionStatus, Ports,
    RemoteChangeStream, SnapshotSubscription, Subscription, SubscriptionGuard, WatchOptions,
};
pub use viewport::{ViewportController, ViewportState};

// Re-export the store for convenience
pub use geomark_store::{
    Annotation, AnnotationSet, AnnotationStatus, AnnotationStore, AnnotationWatch, Coordinate,
    CorrelationId, ReconciliationReport, Region, RemoteDocument, ResumePoint, StoreError,
};
