//! Engine configuration.
//!
//! Loaded from a JSON file (every field optional, defaults below), then
//! environment overrides, then validation.

use crate::errors::ConfigError;
use crate::ports::Accuracy;
use geomark_store::Region;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default remote collection.
pub const DEFAULT_COLLECTION: &str = "markers";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Remote collection holding the annotation documents.
    pub collection: String,
    pub viewport: ViewportConfig,
    pub attachment: AttachmentConfig,
    /// Capacity of the engine event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            viewport: ViewportConfig::default(),
            attachment: AttachmentConfig::default(),
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Minimum movement before a new region is published.
    pub min_distance_m: f64,
    /// Span of published regions, in degrees, on both axes.
    pub span_degrees: f64,
    /// Region shown before the first location sample.
    pub initial_region: Region,
    pub accuracy: Accuracy,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            min_distance_m: 100.0,
            span_degrees: 20.0,
            initial_region: Region::new(55.0, 12.0, 20.0, 20.0),
            accuracy: Accuracy::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    /// Blob key prefix, e.g. `images/`.
    pub blob_prefix: String,
    /// Blob key extension without the dot.
    pub blob_extension: String,
    pub upload_timeout_secs: u64,
    pub reference_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            blob_prefix: "images/".to_string(),
            blob_extension: "jpg".to_string(),
            upload_timeout_secs: 30,
            reference_timeout_secs: 15,
            write_timeout_secs: 15,
        }
    }
}

impl AttachmentConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn reference_timeout(&self) -> Duration {
        Duration::from_secs(self.reference_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl EngineConfig {
    /// Load from a JSON file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `GEOMARK_*` overrides from an arbitrary lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(collection) = lookup("GEOMARK_COLLECTION") {
            self.collection = collection;
        }
        if let Some(secs) = parse_override(&lookup, "GEOMARK_UPLOAD_TIMEOUT_SECS")? {
            self.attachment.upload_timeout_secs = secs;
        }
        if let Some(secs) = parse_override(&lookup, "GEOMARK_WRITE_TIMEOUT_SECS")? {
            self.attachment.write_timeout_secs = secs;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.trim().is_empty() {
            return Err(ConfigError::Invalid("collection must not be empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }

        let viewport = &self.viewport;
        if !viewport.min_distance_m.is_finite() || viewport.min_distance_m < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "viewport.min_distance_m must be a non-negative distance, got {}",
                viewport.min_distance_m
            )));
        }
        if !(viewport.span_degrees > 0.0 && viewport.span_degrees <= 180.0) {
            return Err(ConfigError::Invalid(format!(
                "viewport.span_degrees must be in (0, 180], got {}",
                viewport.span_degrees
            )));
        }

        let attachment = &self.attachment;
        if attachment.blob_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(
                "attachment.blob_prefix must be relative".into(),
            ));
        }
        if attachment.blob_extension.is_empty()
            || !attachment
                .blob_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ConfigError::Invalid(format!(
                "attachment.blob_extension must be alphanumeric, got {:?}",
                attachment.blob_extension
            )));
        }
        for (name, secs) in [
            ("upload_timeout_secs", attachment.upload_timeout_secs),
            ("reference_timeout_secs", attachment.reference_timeout_secs),
            ("write_timeout_secs", attachment.write_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "attachment.{name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

fn parse_override(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidOverride {
                key: key.to_string(),
                value,
            }),
    }
}
