use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Position in the custody pipeline.
pub type Checkpoint = u32;

/// Courier and vehicle attached to a shipment at the transport stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub courier: String,
    pub vehicle: String,
}

/// The workflow-local state of one shipment that has entered the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub tracking_id: String,
    /// Foreign key into the external shipment master. Never mutated.
    pub external_ref: String,
    pub current_checkpoint: Checkpoint,
    pub cancel_requested: bool,
    pub assignment: Option<Assignment>,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub updated_at: String,
    pub updated_by: String,
    /// Incremented on every mutation.
    pub version: i64,
}

/// Input for [`crate::CustodyStorage::insert_tracking`]. The backend allocates
/// the tracking id and starts the row at version 0.
#[derive(Debug, Clone)]
pub struct NewTracking {
    pub external_ref: String,
    pub checkpoint: Checkpoint,
    pub assignment: Option<Assignment>,
    pub created_at: String,
    pub created_by: String,
}

/// A conditional mutation of a tracking row.
#[derive(Debug, Clone)]
pub struct TrackingUpdate {
    pub checkpoint: Checkpoint,
    pub cancel_requested: bool,
    /// `None` keeps the current assignment.
    pub assignment: Option<Assignment>,
    pub updated_at: String,
    pub updated_by: String,
}

/// A group of shipments handed over together at one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub bundle_id: String,
    /// Human-readable sequence number, e.g. `HG000001`.
    pub document_number: String,
    pub created_at_checkpoint: Checkpoint,
    pub created_at: String,
    pub created_by: String,
    pub received_at: Option<String>,
    pub received_by: Option<String>,
    pub attachment_ref: Option<String>,
}

impl BundleRecord {
    pub fn is_received(&self) -> bool {
        self.received_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewBundle {
    pub created_at_checkpoint: Checkpoint,
    pub created_at: String,
    pub created_by: String,
}

/// Immutable link between a bundle and one of its shipments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub bundle_id: String,
    pub tracking_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Handover,
    Acceptance,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Handover => write!(f, "HANDOVER"),
            EventType::Acceptance => write!(f, "ACCEPTANCE"),
        }
    }
}

/// One entry of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic sequence; defines the total order of the log.
    pub event_id: u64,
    pub tracking_id: String,
    pub event_type: EventType,
    pub from_actor: String,
    pub to_actor: String,
    pub checkpoint: Checkpoint,
    pub actor_user: String,
    pub occurred_at: String,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub tracking_id: String,
    pub event_type: EventType,
    pub from_actor: String,
    pub to_actor: String,
    pub checkpoint: Checkpoint,
    pub actor_user: String,
    pub occurred_at: String,
}

/// Filter for [`crate::CustodyStorage::list_tracking`].
///
/// A row matches if its checkpoint falls in any of the half-open ranges.
/// An empty range list matches every row.
#[derive(Debug, Clone, Default)]
pub struct TrackingFilter {
    pub checkpoint_ranges: Vec<Range<Checkpoint>>,
}

impl TrackingFilter {
    pub fn ranges(ranges: Vec<Range<Checkpoint>>) -> Self {
        Self {
            checkpoint_ranges: ranges,
        }
    }

    pub fn matches(&self, record: &TrackingRecord) -> bool {
        self.checkpoint_ranges.is_empty()
            || self
                .checkpoint_ranges
                .iter()
                .any(|r| r.contains(&record.current_checkpoint))
    }
}

/// Format a bundle sequence value as a document number.
pub fn document_number(sequence: u64) -> String {
    format!("HG{:06}", sequence)
}
