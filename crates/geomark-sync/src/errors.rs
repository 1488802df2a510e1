//! Error taxonomy for the ports and the attachment pipeline.

use geomark_store::ResumePoint;
use std::time::Duration;

// ============================================================================
// Location
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LocationError {
    /// Terminal: the user is notified once and the controller never retries.
    #[error("Location permission denied")]
    PermissionDenied,
    #[error("Location watch failed: {0}")]
    WatchFailed(String),
}

// ============================================================================
// Attachment Steps
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PickerError {
    #[error("Image picker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ImageReadError {
    #[error("Image not found: {0}")]
    NotFound(String),
    #[error("Failed to read image {uri}: {message}")]
    Io { uri: String, message: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UploadError {
    #[error("Upload failed: {0}")]
    Network(String),
    #[error("Upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReferenceError {
    #[error("No blob stored under {0}")]
    NotFound(String),
    #[error("Failed to resolve download URL: {0}")]
    Network(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WriteError {
    #[error("Document write failed: {0}")]
    Network(String),
    #[error("Document write rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// A failed pipeline step, mapped onto the step a retry re-enters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttachmentError {
    #[error(transparent)]
    ImageRead(#[from] ImageReadError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("{step} step timed out after {after:?}")]
    Timeout { step: ResumePoint, after: Duration },
}

impl AttachmentError {
    pub fn resume_point(&self) -> ResumePoint {
        match self {
            AttachmentError::ImageRead(_) | AttachmentError::Upload(_) => ResumePoint::Upload,
            AttachmentError::Reference(_) => ResumePoint::Reference,
            AttachmentError::Write(_) => ResumePoint::Persist,
            AttachmentError::Timeout { step, .. } => *step,
        }
    }
}

// ============================================================================
// Remote Stream & Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Failed to subscribe to {collection}: {message}")]
    SubscriptionFailed { collection: String, message: String },
    #[error("Snapshot fetch failed: {0}")]
    Fetch(String),
    #[error("Malformed snapshot: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
    #[error("Missing environment variable {0}")]
    MissingVariable(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
