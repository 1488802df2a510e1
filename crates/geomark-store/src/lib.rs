//! Geomark Annotation Store
//!
//! Holds the reconciled set of map annotations shared between the attachment
//! pipeline, the remote change stream and the presentation layer:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      ANNOTATION STORE                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  ┌─────────┐     ┌───────────────┐     ┌─────────────────┐          │
//! │  │  User   │────►│               │────►│   observe()     │          │
//! │  │ Gesture │     │  Annotation   │     │ (whole-list     │          │
//! │  └─────────┘     │    Store      │     │  emissions)     │          │
//! │                  │               │     └─────────────────┘          │
//! │  ┌─────────┐     │  (atomic      │                                  │
//! │  │Pipeline │────►│   replace)    │                                  │
//! │  └─────────┘     │               │                                  │
//! │                  └───────────────┘                                  │
//! │                         ▲                                           │
//! │                         │ reconcile(current, snapshot)              │
//! │                  ┌──────┴──────┐                                    │
//! │                  │   Remote    │                                    │
//! │                  │  Snapshot   │                                    │
//! │                  └─────────────┘                                    │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Properties
//!
//! - **Optimistic**: `create_local` inserts a `Pending` annotation immediately
//! - **Id-keyed merge**: snapshots are merged by correlation id, never copied over the local list
//! - **In-flight protection**: annotations still uploading survive snapshots that don't mention them
//! - **Atomic**: every mutation publishes a complete new list; readers never see partial state

pub mod reconcile;
pub mod store;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use reconcile::{reconcile, Reconciliation, ReconciliationConflict, ReconciliationReport};
pub use store::{AnnotationSet, AnnotationStore, AnnotationWatch};

/// Mean Earth radius (IUGG) in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

// ============================================================================
// Identifiers
// ============================================================================

/// Client-generated identifier linking an optimistic annotation to its remote document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Stable id for documents written without a correlation id.
    pub fn for_legacy_document(document_id: &str) -> Self {
        Self(format!("remote:{document_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Validated constructor.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, StoreError> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !valid {
            return Err(StoreError::InvalidCoordinate {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle (haversine) distance in metres.
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
    }

    /// Six-decimal labels as shown in the marker details view.
    pub fn display_labels(&self) -> (String, String) {
        (
            format!("Latitude: {:.6}", self.latitude),
            format!("Longitude: {:.6}", self.longitude),
        )
    }
}

/// Visible map viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub latitude: f64,
    pub longitude: f64,
    pub latitude_span: f64,
    pub longitude_span: f64,
}

impl Region {
    pub fn new(latitude: f64, longitude: f64, latitude_span: f64, longitude_span: f64) -> Self {
        Self {
            latitude,
            longitude,
            latitude_span,
            longitude_span,
        }
    }

    /// Region centered on `center` with the same span on both axes.
    pub fn centered(center: Coordinate, span: f64) -> Self {
        Self::new(center.latitude, center.longitude, span, span)
    }

    pub fn center(&self) -> Coordinate {
        Coordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

// ============================================================================
// Annotation Lifecycle
// ============================================================================

/// Pipeline step a failed annotation re-enters on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePoint {
    /// Read the local image and upload it again.
    Upload,
    /// Blob is stored; only the download reference is missing.
    Reference,
    /// Blob and reference exist; the document write failed.
    Persist,
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResumePoint::Upload => "upload",
            ResumePoint::Reference => "reference",
            ResumePoint::Persist => "persist",
        };
        f.write_str(label)
    }
}

/// Lifecycle status of an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationStatus {
    Pending,
    AwaitingImage,
    Uploading,
    Persisted,
    Synced,
    Failed(ResumePoint),
    Discarded,
}

impl AnnotationStatus {
    /// Local work not yet confirmed by a snapshot. Reconciliation never evicts these.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            AnnotationStatus::Pending
                | AnnotationStatus::AwaitingImage
                | AnnotationStatus::Uploading
                | AnnotationStatus::Persisted
                | AnnotationStatus::Failed(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnnotationStatus::Synced | AnnotationStatus::Discarded)
    }

    /// Pipeline transition table. Reconciliation bypasses it: a matching
    /// remote document moves any status to `Synced`.
    pub fn can_transition_to(&self, next: &AnnotationStatus) -> bool {
        use AnnotationStatus::*;
        match (self, next) {
            (Pending, AwaitingImage) | (Pending, Discarded) => true,
            (AwaitingImage, Uploading) | (AwaitingImage, Discarded) => true,
            (Uploading, Persisted) => true,
            (Uploading, Failed(ResumePoint::Upload | ResumePoint::Reference)) => true,
            (Persisted, Failed(ResumePoint::Persist)) => true,
            (Failed(ResumePoint::Upload | ResumePoint::Reference), Uploading) => true,
            (Failed(ResumePoint::Persist), Persisted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AnnotationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationStatus::Pending => f.write_str("pending"),
            AnnotationStatus::AwaitingImage => f.write_str("awaiting_image"),
            AnnotationStatus::Uploading => f.write_str("uploading"),
            AnnotationStatus::Persisted => f.write_str("persisted"),
            AnnotationStatus::Synced => f.write_str("synced"),
            AnnotationStatus::Failed(step) => write!(f, "failed({step})"),
            AnnotationStatus::Discarded => f.write_str("discarded"),
        }
    }
}

/// A geo-located marker, optionally carrying an attached image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub correlation_id: CorrelationId,
    pub remote_id: Option<String>,
    pub coordinate: Coordinate,
    pub image_ref: Option<String>,
    pub status: AnnotationStatus,
    pub created_at: DateTime<Utc>,
    /// User-facing message of the most recent failure, if any.
    pub last_error: Option<String>,
}

impl Annotation {
    /// Optimistic local annotation awaiting its image.
    pub fn pending(correlation_id: CorrelationId, coordinate: Coordinate, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            remote_id: None,
            coordinate,
            image_ref: None,
            status: AnnotationStatus::Pending,
            created_at: now,
            last_error: None,
        }
    }

    /// Annotation created by someone else, first seen in a snapshot.
    pub fn from_remote(document: &RemoteDocument, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id: document.effective_correlation_id(),
            remote_id: Some(document.id.clone()),
            coordinate: document.coordinate(),
            image_ref: Some(document.image_url.clone()),
            status: AnnotationStatus::Synced,
            created_at: now,
            last_error: None,
        }
    }

    /// Projection of this annotation onto its remote document. The
    /// coordinate is fixed at creation and never taken from the document.
    pub fn synced_with(&self, document: &RemoteDocument) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            remote_id: Some(document.id.clone()),
            coordinate: self.coordinate,
            image_ref: Some(document.image_url.clone()),
            status: AnnotationStatus::Synced,
            created_at: self.created_at,
            last_error: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.status, AnnotationStatus::Failed(_))
    }
}

// ============================================================================
// Remote Representation
// ============================================================================

/// Document as stored in the remote collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "imageURL", default)]
    pub image_url: String,
    /// Absent on documents written by clients that predate correlation ids.
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<CorrelationId>,
}

impl RemoteDocument {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    /// Correlation id used for matching; legacy documents fall back to their document id.
    pub fn effective_correlation_id(&self) -> CorrelationId {
        match &self.correlation_id {
            Some(id) if !id.as_str().is_empty() => id.clone(),
            _ => CorrelationId::for_legacy_document(&self.id),
        }
    }

    /// Only documents with an image reference count as present.
    pub fn has_image(&self) -> bool {
        !self.image_url.trim().is_empty()
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown annotation: {0}")]
    UnknownAnnotation(CorrelationId),
    #[error("Illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: CorrelationId,
        from: AnnotationStatus,
        to: AnnotationStatus,
    },
    #[error("Invalid coordinate ({latitude}, {longitude})")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
}

impl StoreError {
    /// The annotation was synced (or synced and then deleted remotely) while
    /// local work on it was still running.
    pub fn is_superseded(&self) -> bool {
        matches!(
            self,
            StoreError::UnknownAnnotation(_)
                | StoreError::IllegalTransition {
                    from: AnnotationStatus::Synced,
                    ..
                }
        )
    }
}
