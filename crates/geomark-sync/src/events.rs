//! Engine events for the presentation layer.

use geomark_store::{CorrelationId, ReconciliationReport, Region, ResumePoint};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Events emitted while the engine runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Camera should re-center on this region
    RegionChanged { region: Region },
    /// A remote snapshot was merged into the store
    SnapshotApplied {
        documents: usize,
        report: ReconciliationReport,
    },
    /// A pipeline step failed; the annotation stays visible as `Failed`
    AttachmentFailed {
        correlation_id: CorrelationId,
        step: ResumePoint,
        message: String,
        retryable: bool,
    },
    /// Image selection was abandoned and the annotation removed
    AnnotationDiscarded { correlation_id: CorrelationId },
    /// User-visible message
    Notice { level: NoticeLevel, message: String },
}

/// Callback for engine events
pub type EngineEventHandler = Box<dyn Fn(&EngineEvent) + Send + Sync>;

// ============================================================================
// Event Bus
// ============================================================================

/// Fans events out to synchronous handlers and broadcast subscribers.
///
/// Handlers run inline on the emitting task and see every event in order;
/// broadcast subscribers may lag and lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    handlers: Arc<RwLock<Vec<EngineEventHandler>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn on_event(&self, handler: EngineEventHandler) {
        self.handlers.write().push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        for handler in self.handlers.read().iter() {
            handler(&event);
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(EngineEvent::Notice {
            level,
            message: message.into(),
        });
    }
}
