//! Viewport Controller: location samples → map regions
//!
//! ```text
//! Idle ──► RequestingPermission ──granted──► Tracking ──shutdown──► Stopped
//!                  │                            │
//!               denied                  watch ended / failed
//!                  ▼                            ▼
//!             Unavailable ◄─────────────────────┘
//! ```
//!
//! The controller is the only writer of region state. Its failures are
//! reported once (a notice plus the `Unavailable` state) and never touch the
//! annotation pipeline.

use crate::config::ViewportConfig;
use crate::errors::LocationError;
use crate::events::{EngineEvent, EventBus, NoticeLevel};
use crate::ports::{LocationSample, LocationService, PermissionStatus, WatchOptions};
use geomark_store::{Coordinate, Region};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ViewportState {
    Idle,
    RequestingPermission,
    Tracking,
    Stopped,
    Unavailable { reason: String },
}

impl ViewportState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ViewportState::Stopped | ViewportState::Unavailable { .. }
        )
    }
}

pub struct ViewportController {
    location: Arc<dyn LocationService>,
    config: ViewportConfig,
    events: EventBus,
    region_tx: watch::Sender<Region>,
    state_tx: watch::Sender<ViewportState>,
}

impl ViewportController {
    pub fn new(location: Arc<dyn LocationService>, config: ViewportConfig, events: EventBus) -> Self {
        let (region_tx, _) = watch::channel(config.initial_region);
        let (state_tx, _) = watch::channel(ViewportState::Idle);
        Self {
            location,
            config,
            events,
            region_tx,
            state_tx,
        }
    }

    pub fn regions(&self) -> watch::Receiver<Region> {
        self.region_tx.subscribe()
    }

    pub fn region(&self) -> Region {
        *self.region_tx.borrow()
    }

    pub fn states(&self) -> watch::Receiver<ViewportState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ViewportState {
        self.state_tx.borrow().clone()
    }

    /// Spawn [`Self::run`] on the current runtime.
    pub fn spawn(self: Arc<Self>, cancellation: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancellation).await })
    }

    /// Track the device until cancelled or the location service gives out.
    ///
    /// Runs at most once; later calls return immediately.
    pub async fn run(&self, cancellation: CancellationToken) {
        let started = self.state_tx.send_if_modified(|state| {
            if *state == ViewportState::Idle {
                *state = ViewportState::RequestingPermission;
                true
            } else {
                false
            }
        });
        if !started {
            tracing::debug!(state = ?self.state(), "viewport controller already started");
            return;
        }

        let permission = tokio::select! {
            permission = self.location.request_permission() => permission,
            _ = cancellation.cancelled() => return self.stop(),
        };
        if permission == PermissionStatus::Denied {
            return self.unavailable(LocationError::PermissionDenied);
        }

        let options = WatchOptions {
            min_distance_m: self.config.min_distance_m,
            accuracy: self.config.accuracy,
        };
        let watched = tokio::select! {
            watched = self.location.watch(options) => watched,
            _ = cancellation.cancelled() => return self.stop(),
        };
        let mut subscription = match watched {
            Ok(subscription) => subscription,
            Err(err) => return self.unavailable(err),
        };

        self.state_tx.send_replace(ViewportState::Tracking);
        tracing::info!(
            min_distance_m = self.config.min_distance_m,
            accuracy = ?self.config.accuracy,
            "tracking device location"
        );

        let mut last_center: Option<Coordinate> = None;
        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                sample = subscription.next() => match sample {
                    Some(sample) => self.on_sample(&mut last_center, sample),
                    None => {
                        return self.unavailable(LocationError::WatchFailed(
                            "location updates ended".to_string(),
                        ));
                    }
                },
            }
        }

        subscription.cancel();
        self.stop();
    }

    fn on_sample(&self, last_center: &mut Option<Coordinate>, sample: LocationSample) {
        let coordinate = sample.coordinate;
        if let Some(previous) = last_center {
            let moved = previous.distance_m(&coordinate);
            if moved < self.config.min_distance_m {
                tracing::trace!(moved_m = moved, "location sample below distance filter");
                return;
            }
        }

        let region = Region::centered(coordinate, self.config.span_degrees);
        *last_center = Some(coordinate);
        self.region_tx.send_replace(region);
        tracing::debug!(
            lat = format!("{:.5}", coordinate.latitude),
            lon = format!("{:.5}", coordinate.longitude),
            accuracy_m = ?sample.accuracy_m,
            "region updated"
        );
        self.events.emit(EngineEvent::RegionChanged { region });
    }

    fn stop(&self) {
        self.state_tx.send_replace(ViewportState::Stopped);
        tracing::debug!("viewport controller stopped");
    }

    fn unavailable(&self, err: LocationError) {
        let reason = err.to_string();
        tracing::warn!(error = %reason, "location unavailable");
        self.state_tx
            .send_replace(ViewportState::Unavailable { reason: reason.clone() });
        let level = match err {
            LocationError::PermissionDenied => NoticeLevel::Warning,
            LocationError::WatchFailed(_) => NoticeLevel::Error,
        };
        self.events.notice(level, reason);
    }
}
