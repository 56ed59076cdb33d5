//! Bundle aggregation.
//!
//! A bundle groups the shipments of one handover. Membership links are
//! written once and never changed; a shipment transiting several stages
//! belongs to one bundle per stage.
//!
//! A bundle is complete once none of its live members still sits at the
//! checkpoint it was created at and at least one member has moved past it.
//! Members that were reverted or removed by cancellation no longer hold the
//! bundle open.

use std::collections::HashSet;

use custody_storage::{
    BundleRecord, Checkpoint, CustodyStorage, NewBundle, StorageError, TrackingRecord,
};
use serde::Serialize;

use crate::actor::ActorUser;
use crate::error::WorkflowError;
use crate::master::{MasterShipment, MasterSource};

/// Insert a bundle with one membership link per member.
pub(crate) async fn create_bundle<S: CustodyStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    members: &[String],
    checkpoint: Checkpoint,
    actor: &ActorUser,
    at: &str,
) -> Result<BundleRecord, StorageError> {
    let bundle = storage
        .insert_bundle(
            snapshot,
            NewBundle {
                created_at_checkpoint: checkpoint,
                created_at: at.to_string(),
                created_by: actor.user_id.clone(),
            },
        )
        .await?;
    for tracking_id in members {
        storage
            .insert_membership(snapshot, &bundle.bundle_id, tracking_id)
            .await?;
    }
    Ok(bundle)
}

pub(crate) async fn is_complete<S: CustodyStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    bundle: &BundleRecord,
) -> Result<bool, StorageError> {
    let mut advanced = false;
    for tracking_id in storage.bundle_member_ids(snapshot, &bundle.bundle_id).await? {
        let row = match storage.get_tracking_for_update(snapshot, &tracking_id).await {
            Ok(row) => row,
            Err(StorageError::TrackingNotFound { .. }) => continue,
            Err(e) => return Err(e),
        };
        if row.current_checkpoint == bundle.created_at_checkpoint {
            return Ok(false);
        }
        if row.current_checkpoint > bundle.created_at_checkpoint {
            advanced = true;
        }
    }
    Ok(advanced)
}

/// Unreceived bundles created at `checkpoint` that contain any of the rows.
pub(crate) async fn open_bundles_at<S: CustodyStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    tracking_ids: &[String],
    checkpoint: Checkpoint,
) -> Result<Vec<BundleRecord>, StorageError> {
    let mut seen = HashSet::new();
    let mut bundles = Vec::new();
    for tracking_id in tracking_ids {
        for bundle in storage.bundles_containing(snapshot, tracking_id).await? {
            if bundle.created_at_checkpoint == checkpoint
                && !bundle.is_received()
                && seen.insert(bundle.bundle_id.clone())
            {
                bundles.push(bundle);
            }
        }
    }
    Ok(bundles)
}

/// Mark every complete candidate received. Returns the bundles this call
/// marked.
pub(crate) async fn settle_bundles<S: CustodyStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    candidates: Vec<BundleRecord>,
    actor: &ActorUser,
    at: &str,
) -> Result<Vec<BundleRecord>, StorageError> {
    let mut received = Vec::new();
    for bundle in candidates {
        if !is_complete(storage, snapshot, &bundle).await? {
            continue;
        }
        if storage
            .mark_bundle_received(snapshot, &bundle.bundle_id, &actor.user_id, at)
            .await?
        {
            received.push(storage.get_bundle_for_update(snapshot, &bundle.bundle_id).await?);
        }
    }
    Ok(received)
}

/// Mark a bundle received in its own transaction.
///
/// Idempotent: returns `false` and leaves `received_at` untouched when the
/// bundle was already received.
pub async fn mark_received<S: CustodyStorage>(
    storage: &S,
    bundle_id: &str,
    actor: &ActorUser,
    at: &str,
) -> Result<bool, WorkflowError> {
    let mut snapshot = storage.begin_snapshot().await?;
    match storage
        .mark_bundle_received(&mut snapshot, bundle_id, &actor.user_id, at)
        .await
    {
        Ok(marked) => {
            storage.commit_snapshot(snapshot).await?;
            Ok(marked)
        }
        Err(e) => {
            let _ = storage.abort_snapshot(snapshot).await;
            Err(e.into())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleMember {
    pub tracking_id: String,
    /// `None` when the row has since been removed by cancellation.
    pub tracking: Option<TrackingRecord>,
    pub master: Option<MasterShipment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleView {
    pub bundle: BundleRecord,
    pub members: Vec<BundleMember>,
}

/// Join a bundle's membership with current tracking rows and master data.
pub async fn expand<S: CustodyStorage>(
    storage: &S,
    master: &dyn MasterSource,
    bundle_id: &str,
) -> Result<BundleView, WorkflowError> {
    let bundle = storage.get_bundle(bundle_id).await?;
    let mut members = Vec::new();
    for tracking_id in storage.list_bundle_members(bundle_id).await? {
        let tracking = match storage.get_tracking(&tracking_id).await {
            Ok(row) => Some(row),
            Err(StorageError::TrackingNotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };
        members.push(BundleMember {
            tracking_id,
            tracking,
            master: None,
        });
    }

    let refs: Vec<String> = members
        .iter()
        .filter_map(|m| m.tracking.as_ref().map(|t| t.external_ref.clone()))
        .collect();
    if !refs.is_empty() {
        let shipments = master.get_shipments(&refs).await?;
        for member in &mut members {
            if let Some(row) = &member.tracking {
                member.master = shipments
                    .iter()
                    .find(|s| s.external_ref == row.external_ref)
                    .cloned();
            }
        }
    }

    Ok(BundleView { bundle, members })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Actor;
    use crate::master::static_master::StaticMaster;
    use custody_storage::{MemoryStorage, NewTracking, TrackingUpdate};

    const AT: &str = "2025-01-01T00:00:00Z";

    async fn seed(storage: &MemoryStorage, refs: &[&str], checkpoint: Checkpoint) -> (BundleRecord, Vec<String>) {
        let hub = ActorUser::new("hub-1", Actor::Hub);
        let mut snap = storage.begin_snapshot().await.unwrap();
        let mut ids = Vec::new();
        for r in refs {
            let row = storage
                .insert_tracking(
                    &mut snap,
                    NewTracking {
                        external_ref: r.to_string(),
                        checkpoint,
                        assignment: None,
                        created_at: AT.into(),
                        created_by: "d-1".into(),
                    },
                )
                .await
                .unwrap();
            ids.push(row.tracking_id);
        }
        let bundle = create_bundle(storage, &mut snap, &ids, checkpoint, &hub, AT)
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();
        (bundle, ids)
    }

    async fn advance(storage: &MemoryStorage, id: &str, from: Checkpoint, to: Checkpoint) {
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .update_tracking(
                &mut snap,
                id,
                from,
                TrackingUpdate {
                    checkpoint: to,
                    cancel_requested: false,
                    assignment: None,
                    updated_at: AT.into(),
                    updated_by: "hub-1".into(),
                },
            )
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();
    }

    async fn complete(storage: &MemoryStorage, bundle: &BundleRecord) -> bool {
        let mut snap = storage.begin_snapshot().await.unwrap();
        let done = is_complete(storage, &mut snap, bundle).await.unwrap();
        storage.abort_snapshot(snap).await.unwrap();
        done
    }

    #[tokio::test]
    async fn complete_only_when_all_members_advanced() {
        let storage = MemoryStorage::new();
        let (bundle, ids) = seed(&storage, &["A", "B", "C"], 2).await;
        assert_eq!(bundle.document_number, "HG000001");

        advance(&storage, &ids[0], 2, 3).await;
        advance(&storage, &ids[1], 2, 3).await;
        assert!(!complete(&storage, &bundle).await);

        advance(&storage, &ids[2], 2, 3).await;
        assert!(complete(&storage, &bundle).await);
    }

    #[tokio::test]
    async fn reverted_member_does_not_block() {
        let storage = MemoryStorage::new();
        let (bundle, ids) = seed(&storage, &["A", "B"], 4).await;
        advance(&storage, &ids[0], 4, 5).await;
        advance(&storage, &ids[1], 4, 3).await;
        assert!(complete(&storage, &bundle).await);
    }

    #[tokio::test]
    async fn bundle_with_no_advanced_member_is_open() {
        let storage = MemoryStorage::new();
        let (bundle, ids) = seed(&storage, &["A"], 4).await;
        advance(&storage, &ids[0], 4, 3).await;
        assert!(!complete(&storage, &bundle).await);
    }

    #[tokio::test]
    async fn mark_received_twice_keeps_first_receipt() {
        let storage = MemoryStorage::new();
        let (bundle, _) = seed(&storage, &["A"], 2).await;
        let hub = ActorUser::new("hub-1", Actor::Hub);
        let other = ActorUser::new("hub-2", Actor::Hub);

        assert!(mark_received(&storage, &bundle.bundle_id, &hub, AT).await.unwrap());
        assert!(!mark_received(&storage, &bundle.bundle_id, &other, "2025-02-01T00:00:00Z")
            .await
            .unwrap());

        let rec = storage.get_bundle(&bundle.bundle_id).await.unwrap();
        assert_eq!(rec.received_at.as_deref(), Some(AT));
        assert_eq!(rec.received_by.as_deref(), Some("hub-1"));
    }

    #[tokio::test]
    async fn mark_received_unknown_bundle() {
        let storage = MemoryStorage::new();
        let hub = ActorUser::new("hub-1", Actor::Hub);
        assert!(matches!(
            mark_received(&storage, "bundle-404", &hub, AT).await,
            Err(WorkflowError::BundleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn expand_joins_master_data() {
        let storage = MemoryStorage::new();
        let (bundle, ids) = seed(&storage, &["A", "B"], 2).await;
        let master = StaticMaster::new(vec![MasterShipment {
            external_ref: "A".into(),
            status: "approved".into(),
            document_date: "2025-01-01".into(),
            category: "retail".into(),
            customer: None,
        }]);

        let view = expand(&storage, &master, &bundle.bundle_id).await.unwrap();
        assert_eq!(view.members.len(), 2);
        assert_eq!(view.members[0].tracking_id, ids[0]);
        assert!(view.members[0].master.is_some());
        assert!(view.members[1].master.is_none());
        assert!(view.members[1].tracking.is_some());
    }
}
