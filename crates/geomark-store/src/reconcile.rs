//! Snapshot Reconciliation: merging whole-collection snapshots into local state
//!
//! The remote stream only ever delivers full snapshots, so the merge is a
//! stateless function of (current annotations, latest snapshot) keyed by
//! correlation id:
//!
//! ```text
//! local annotation ──┬──► matching document ──► Synced (remote fields win)
//!                    │
//!                    └──► no document
//!                              │
//!                              ├──► in flight (Pending … Failed) ──► retained
//!                              │
//!                              └──► Synced ──► removed (remote deletion)
//!
//! unmatched document ──────────────────────────► adopted as Synced
//! ```

use crate::{Annotation, Coordinate, CorrelationId, RemoteDocument};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Disagreement between local and remote state, settled by the merge rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationConflict {
    /// Several documents carry the same correlation id; the smallest document id wins.
    DuplicateCorrelationId {
        correlation_id: CorrelationId,
        kept: String,
        dropped: String,
    },
    /// The remote document moved the annotation; the remote position wins.
    CoordinateMismatch {
        correlation_id: CorrelationId,
        local: Coordinate,
        remote: Coordinate,
    },
}

/// Counters describing one merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Local annotations matched by a document.
    pub matched: usize,
    /// Matched annotations that were not `Synced` before this merge.
    pub newly_synced: Vec<CorrelationId>,
    /// In-flight annotations kept although the snapshot doesn't mention them.
    pub retained: usize,
    /// Synced annotations whose document disappeared.
    pub removed: Vec<CorrelationId>,
    /// Documents seen for the first time.
    pub adopted: usize,
    /// Documents skipped because they carry no image reference.
    pub incomplete: usize,
    pub conflicts: Vec<ReconciliationConflict>,
}

/// Result of merging a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub annotations: Vec<Annotation>,
    pub report: ReconciliationReport,
}

/// Merge `snapshot` into `current`.
///
/// Local order is preserved; adopted documents are appended ordered by
/// document id so that the result doesn't depend on snapshot order.
pub fn reconcile(
    current: &[Annotation],
    snapshot: &[RemoteDocument],
    now: DateTime<Utc>,
) -> Reconciliation {
    let mut report = ReconciliationReport::default();

    let mut documents: Vec<&RemoteDocument> = Vec::with_capacity(snapshot.len());
    for document in snapshot {
        if document.has_image() {
            documents.push(document);
        } else {
            report.incomplete += 1;
        }
    }
    documents.sort_by(|a, b| a.id.cmp(&b.id));

    let mut by_correlation: BTreeMap<CorrelationId, &RemoteDocument> = BTreeMap::new();
    for document in documents {
        match by_correlation.entry(document.effective_correlation_id()) {
            Entry::Vacant(slot) => {
                slot.insert(document);
            }
            Entry::Occupied(slot) => {
                report
                    .conflicts
                    .push(ReconciliationConflict::DuplicateCorrelationId {
                        correlation_id: slot.key().clone(),
                        kept: slot.get().id.clone(),
                        dropped: document.id.clone(),
                    });
            }
        }
    }

    let mut annotations = Vec::with_capacity(current.len() + by_correlation.len());

    for local in current {
        match by_correlation.remove(&local.correlation_id) {
            Some(document) => {
                let remote = document.coordinate();
                if remote != local.coordinate {
                    report
                        .conflicts
                        .push(ReconciliationConflict::CoordinateMismatch {
                            correlation_id: local.correlation_id.clone(),
                            local: local.coordinate,
                            remote,
                        });
                }
                if local.status != crate::AnnotationStatus::Synced {
                    report.newly_synced.push(local.correlation_id.clone());
                }
                report.matched += 1;
                annotations.push(local.synced_with(document));
            }
            None if local.status.is_in_flight() => {
                report.retained += 1;
                annotations.push(local.clone());
            }
            None => {
                report.removed.push(local.correlation_id.clone());
            }
        }
    }

    let mut adopted: Vec<&RemoteDocument> = by_correlation.into_values().collect();
    adopted.sort_by(|a, b| a.id.cmp(&b.id));
    report.adopted = adopted.len();
    annotations.extend(adopted.into_iter().map(|doc| Annotation::from_remote(doc, now)));

    Reconciliation {
        annotations,
        report,
    }
}
