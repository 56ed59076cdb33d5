use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{
    BundleRecord, Checkpoint, EventRecord, EventType, NewBundle, NewEvent, NewTracking,
    TrackingFilter, TrackingRecord, TrackingUpdate,
};

/// The storage trait for custody workflow backends.
///
/// A `CustodyStorage` implementation provides durable, transactional storage
/// for the four co-located workflow tables: tracking rows, bundles, bundle
/// memberships and the transition event log.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()` : start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)` : commit and consume the transaction
///    OR `abort_snapshot(snapshot)` : roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the underlying transaction
/// MUST be rolled back. Reads taken through a snapshot observe the snapshot's
/// own uncommitted writes; the query methods only ever observe committed data.
///
/// ## OCC Conflict Detection
///
/// `update_tracking` is conditional on the row's current checkpoint
/// (`UPDATE ... WHERE current_checkpoint = expected`). A mismatch returns
/// `Err(StorageError::ConcurrentConflict { .. })`. Every mutation bumps the
/// row's `version`; a backend that defers validation to commit time must
/// reject the commit with `ConcurrentConflict` when any written row changed
/// version since the snapshot began.
///
/// ## Non-transactional writes
///
/// Sequence allocation (tracking ids, bundle numbers, event ids) is not
/// rolled back on abort, so gaps are expected. `attach_document` runs outside
/// any snapshot: it records a side effect that happens after commit.
#[async_trait]
pub trait CustodyStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Tracking rows (within snapshot) ───────────────────────────────────────

    /// Insert a tracking row for a shipment entering the pipeline.
    ///
    /// Returns `Err(StorageError::AlreadyTracked)` if a live row exists for
    /// the same external reference.
    async fn insert_tracking(
        &self,
        snapshot: &mut Self::Snapshot,
        record: NewTracking,
    ) -> Result<TrackingRecord, StorageError>;

    /// Read a tracking row by tracking id, for update.
    ///
    /// The row joins the snapshot's read set: if another snapshot changes it
    /// before this one commits, `commit_snapshot` returns
    /// `Err(StorageError::ConcurrentConflict)`.
    ///
    /// Returns `Err(StorageError::TrackingNotFound)` if the row does not exist.
    async fn get_tracking_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        tracking_id: &str,
    ) -> Result<TrackingRecord, StorageError>;

    /// Look up the live tracking row for an external reference, for update.
    /// A row found joins the read set as in `get_tracking_for_update`.
    async fn find_tracking_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        external_ref: &str,
    ) -> Result<Option<TrackingRecord>, StorageError>;

    /// Conditionally update a tracking row (compare-and-swap on checkpoint).
    ///
    /// Returns the updated record with its version incremented.
    async fn update_tracking(
        &self,
        snapshot: &mut Self::Snapshot,
        tracking_id: &str,
        expected_checkpoint: Checkpoint,
        update: TrackingUpdate,
    ) -> Result<TrackingRecord, StorageError>;

    /// Delete a tracking row. Only the entry-stage compensation calls this.
    async fn delete_tracking(
        &self,
        snapshot: &mut Self::Snapshot,
        tracking_id: &str,
    ) -> Result<(), StorageError>;

    // ── Bundles (within snapshot) ─────────────────────────────────────────────

    /// Insert a bundle, allocating its id and document number from a sequence.
    async fn insert_bundle(
        &self,
        snapshot: &mut Self::Snapshot,
        bundle: NewBundle,
    ) -> Result<BundleRecord, StorageError>;

    /// Insert one immutable membership link.
    ///
    /// FK: both the bundle and the tracking row must exist in the snapshot.
    async fn insert_membership(
        &self,
        snapshot: &mut Self::Snapshot,
        bundle_id: &str,
        tracking_id: &str,
    ) -> Result<(), StorageError>;

    async fn get_bundle_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        bundle_id: &str,
    ) -> Result<BundleRecord, StorageError>;

    /// Tracking ids linked to a bundle, in insertion order.
    async fn bundle_member_ids(
        &self,
        snapshot: &mut Self::Snapshot,
        bundle_id: &str,
    ) -> Result<Vec<String>, StorageError>;

    /// Every bundle a tracking row has ever been a member of.
    async fn bundles_containing(
        &self,
        snapshot: &mut Self::Snapshot,
        tracking_id: &str,
    ) -> Result<Vec<BundleRecord>, StorageError>;

    /// Set `received_at`/`received_by` if still unset.
    ///
    /// Returns `false` (and changes nothing) when the bundle is already received.
    async fn mark_bundle_received(
        &self,
        snapshot: &mut Self::Snapshot,
        bundle_id: &str,
        received_by: &str,
        received_at: &str,
    ) -> Result<bool, StorageError>;

    // ── Event log (within snapshot) ───────────────────────────────────────────

    /// Append an event, allocating its sequence id.
    async fn append_event(
        &self,
        snapshot: &mut Self::Snapshot,
        event: NewEvent,
    ) -> Result<EventRecord, StorageError>;

    /// Delete every event for a tracking row. Returns the deleted events.
    async fn delete_events(
        &self,
        snapshot: &mut Self::Snapshot,
        tracking_id: &str,
    ) -> Result<Vec<EventRecord>, StorageError>;

    /// Delete the most recent event of the given type for a tracking row.
    async fn delete_latest_event(
        &self,
        snapshot: &mut Self::Snapshot,
        tracking_id: &str,
        event_type: EventType,
    ) -> Result<Option<EventRecord>, StorageError>;

    // ── Query operations (outside snapshot, committed data only) ─────────────

    /// Returns `Err(StorageError::TrackingNotFound)` if the row does not exist.
    async fn get_tracking(&self, tracking_id: &str) -> Result<TrackingRecord, StorageError>;

    async fn find_tracking(&self, external_ref: &str)
        -> Result<Option<TrackingRecord>, StorageError>;

    /// List tracking rows matching the filter, ordered by tracking id.
    async fn list_tracking(
        &self,
        filter: &TrackingFilter,
    ) -> Result<Vec<TrackingRecord>, StorageError>;

    /// Returns `Err(StorageError::BundleNotFound)` if the bundle does not exist.
    async fn get_bundle(&self, bundle_id: &str) -> Result<BundleRecord, StorageError>;

    /// List bundles created at any of the given checkpoints (all bundles if
    /// the slice is empty), ordered by document number.
    async fn list_bundles(
        &self,
        checkpoints: &[Checkpoint],
    ) -> Result<Vec<BundleRecord>, StorageError>;

    /// Tracking ids linked to a bundle, in insertion order.
    async fn list_bundle_members(&self, bundle_id: &str) -> Result<Vec<String>, StorageError>;

    /// Received bundles whose document attachment is still missing.
    async fn list_unattached_bundles(&self) -> Result<Vec<BundleRecord>, StorageError>;

    /// Events for a tracking row in log order.
    async fn list_events(&self, tracking_id: &str) -> Result<Vec<EventRecord>, StorageError>;

    // ── Side-effect bookkeeping (outside snapshot) ────────────────────────────

    /// Record the document reference for a bundle.
    ///
    /// Returns `false` when an attachment is already present; the existing
    /// reference is kept.
    async fn attach_document(
        &self,
        bundle_id: &str,
        attachment_ref: &str,
    ) -> Result<bool, StorageError>;
}
