/// All errors that can be returned by a CustodyStorage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: the row was not at the
    /// expected checkpoint, or another snapshot committed a change to it first.
    #[error("concurrent conflict on tracking row {tracking_id}: expected checkpoint {expected_checkpoint}")]
    ConcurrentConflict {
        tracking_id: String,
        expected_checkpoint: u32,
    },

    /// No tracking row with the given tracking id.
    #[error("tracking row not found: {tracking_id}")]
    TrackingNotFound { tracking_id: String },

    /// A live tracking row already exists for this external reference.
    #[error("shipment already tracked: {external_ref}")]
    AlreadyTracked { external_ref: String },

    /// No bundle with the given bundle id.
    #[error("bundle not found: {bundle_id}")]
    BundleNotFound { bundle_id: String },

    /// Membership links are immutable; the same link cannot be inserted twice.
    #[error("tracking row {tracking_id} is already a member of bundle {bundle_id}")]
    DuplicateMembership {
        bundle_id: String,
        tracking_id: String,
    },

    /// A backend-specific storage error (DB connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
