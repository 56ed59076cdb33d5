use custody_storage::{Checkpoint, StorageError};

use crate::actor::Actor;
use crate::master::MasterError;

/// Errors returned by workflow operations.
///
/// Validation failures are raised before anything is written. Storage
/// failures abort the open snapshot, so a caller can always retry the whole
/// batch.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The checkpoint is not a stage, or not a stage of the required kind.
    #[error("invalid checkpoint {checkpoint}: {reason}")]
    InvalidCheckpoint { checkpoint: Checkpoint, reason: String },

    /// A shipment in the batch does not satisfy the stage precondition.
    /// Nothing from the batch was applied.
    #[error("inconsistent batch: shipment '{shipment}' {reason}")]
    InconsistentBatch { shipment: String, reason: String },

    /// Another writer kept moving the row; the transaction gave up.
    #[error("stale state for tracking row {tracking_id}; retry the batch")]
    StaleState { tracking_id: String },

    #[error("bundle not found: {bundle_id}")]
    BundleNotFound { bundle_id: String },

    #[error("invalid cancel state for tracking row {tracking_id}: {reason}")]
    InvalidCancelState { tracking_id: String, reason: String },

    /// Soft failure: the transition is committed, the bundle stays
    /// unattached until a retry succeeds.
    #[error("document generation failed for bundle {bundle_id}: {message}")]
    DocumentGenerationFailed { bundle_id: String, message: String },

    #[error("tracking row not found: {tracking_id}")]
    TrackingNotFound { tracking_id: String },

    #[error("{role} may not {operation} at checkpoint {checkpoint}")]
    ActorNotPermitted {
        role: Actor,
        operation: &'static str,
        checkpoint: Checkpoint,
    },

    #[error("handover to checkpoint {checkpoint} requires a courier and vehicle assignment")]
    AssignmentRequired { checkpoint: Checkpoint },

    #[error("batch is empty")]
    EmptyBatch,

    #[error(transparent)]
    Master(#[from] MasterError),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for WorkflowError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::ConcurrentConflict { tracking_id, .. } => {
                WorkflowError::StaleState { tracking_id }
            }
            StorageError::TrackingNotFound { tracking_id } => {
                WorkflowError::TrackingNotFound { tracking_id }
            }
            StorageError::BundleNotFound { bundle_id } => WorkflowError::BundleNotFound { bundle_id },
            StorageError::AlreadyTracked { external_ref } => WorkflowError::InconsistentBatch {
                shipment: external_ref,
                reason: "is already tracked".to_string(),
            },
            other => WorkflowError::Storage(other),
        }
    }
}
