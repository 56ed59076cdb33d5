//! Cancellation compensator.
//!
//! A handed-over but not yet accepted shipment can be pulled back in two
//! steps: the party that handed it over requests the cancellation, and the
//! party that would have accepted it confirms. Confirmation at the entry
//! stage removes the shipment from the workflow entirely; anywhere else it
//! reverts the row to the previous checkpoint and drops the handover event
//! that moved it.
//!
//! ```text
//! Normal --request--> CancelPending --confirm--> Deleted            (entry stage)
//!                                   --confirm--> Normal@previous    (interior stage)
//! ```

use custody_storage::{
    BundleRecord, Checkpoint, CustodyStorage, EventType, TrackingRecord, TrackingUpdate,
};
use serde::Serialize;

use crate::actor::ActorUser;
use crate::bundle;
use crate::clock::now_rfc3339;
use crate::document::DocumentFailure;
use crate::engine::Workflow;
use crate::error::WorkflowError;
use crate::event_log;
use crate::stage::StageKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelResolution {
    /// The row and all its events were deleted.
    Removed { events_deleted: usize },
    /// The row went back to `checkpoint`.
    Reverted {
        checkpoint: Checkpoint,
        removed_event: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub tracking_id: String,
    pub external_ref: String,
    pub resolution: CancelResolution,
    /// Bundles that became complete once this row stopped holding them open.
    pub received_bundles: Vec<BundleRecord>,
    pub document_failures: Vec<DocumentFailure>,
}

fn invalid(tracking_id: &str, reason: impl Into<String>) -> WorkflowError {
    WorkflowError::InvalidCancelState {
        tracking_id: tracking_id.to_string(),
        reason: reason.into(),
    }
}

impl<S: CustodyStorage> Workflow<S> {
    /// Flag a handed-over shipment for cancellation.
    ///
    /// Only the actor who handed the shipment over may request, and only
    /// while it is still waiting for acceptance.
    pub async fn request_cancel(
        &self,
        tracking_id: &str,
        actor: &ActorUser,
    ) -> Result<TrackingRecord, WorkflowError> {
        let mut snapshot = self.storage.begin_snapshot().await?;
        let result = self.apply_request(&mut snapshot, tracking_id, actor).await;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e);
            }
        };
        self.storage.commit_snapshot(snapshot).await?;

        tracing::info!(
            tracking_id,
            checkpoint = row.current_checkpoint,
            user = %actor.user_id,
            "cancellation requested"
        );
        Ok(row)
    }

    async fn apply_request(
        &self,
        snapshot: &mut S::Snapshot,
        tracking_id: &str,
        actor: &ActorUser,
    ) -> Result<TrackingRecord, WorkflowError> {
        let storage = self.storage.as_ref();
        let row = storage.get_tracking_for_update(snapshot, tracking_id).await?;
        if row.cancel_requested {
            return Err(invalid(tracking_id, "cancellation already requested"));
        }
        let stage = self.stages.stage_for(row.current_checkpoint)?;
        if stage.kind != StageKind::Pending {
            return Err(invalid(
                tracking_id,
                format!(
                    "checkpoint {} has already been accepted",
                    row.current_checkpoint
                ),
            ));
        }
        if actor.role != stage.from_actor {
            return Err(WorkflowError::ActorNotPermitted {
                role: actor.role,
                operation: "request cancellation",
                checkpoint: row.current_checkpoint,
            });
        }

        let at = now_rfc3339();
        Ok(storage
            .update_tracking(
                snapshot,
                tracking_id,
                row.current_checkpoint,
                TrackingUpdate {
                    checkpoint: row.current_checkpoint,
                    cancel_requested: true,
                    assignment: None,
                    updated_at: at,
                    updated_by: actor.user_id.clone(),
                },
            )
            .await?)
    }

    /// Confirm a requested cancellation.
    ///
    /// Only the acting actor of the current stage may confirm. Bundles
    /// created at the cancelled checkpoint are re-evaluated afterwards.
    pub async fn confirm_cancel(
        &self,
        tracking_id: &str,
        actor: &ActorUser,
    ) -> Result<CancelOutcome, WorkflowError> {
        let mut snapshot = self.storage.begin_snapshot().await?;
        let result = self.apply_confirm(&mut snapshot, tracking_id, actor).await;
        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e);
            }
        };
        self.storage.commit_snapshot(snapshot).await?;

        tracing::info!(
            tracking_id,
            external_ref = %outcome.external_ref,
            user = %actor.user_id,
            resolution = ?outcome.resolution,
            "cancellation confirmed"
        );
        outcome.document_failures = self.dispatch_documents(&outcome.received_bundles).await;
        Ok(outcome)
    }

    async fn apply_confirm(
        &self,
        snapshot: &mut S::Snapshot,
        tracking_id: &str,
        actor: &ActorUser,
    ) -> Result<CancelOutcome, WorkflowError> {
        let storage = self.storage.as_ref();
        let row = storage.get_tracking_for_update(snapshot, tracking_id).await?;
        if !row.cancel_requested {
            return Err(invalid(tracking_id, "no cancellation was requested"));
        }
        let checkpoint = row.current_checkpoint;
        let stage = self.stages.stage_for(checkpoint)?;
        if actor.role != stage.acting_actor {
            return Err(WorkflowError::ActorNotPermitted {
                role: actor.role,
                operation: "confirm cancellation",
                checkpoint,
            });
        }

        let ids = [row.tracking_id.clone()];
        let open = bundle::open_bundles_at(storage, snapshot, &ids, checkpoint).await?;
        let at = now_rfc3339();

        let resolution = match self.stages.previous_checkpoint_of(checkpoint) {
            None => {
                let deleted = storage.delete_events(snapshot, tracking_id).await?;
                storage.delete_tracking(snapshot, tracking_id).await?;
                event_log::log_deleted(&deleted, "entry-stage cancellation");
                CancelResolution::Removed {
                    events_deleted: deleted.len(),
                }
            }
            Some(previous) => {
                storage
                    .update_tracking(
                        snapshot,
                        tracking_id,
                        checkpoint,
                        TrackingUpdate {
                            checkpoint: previous,
                            cancel_requested: false,
                            assignment: None,
                            updated_at: at.clone(),
                            updated_by: actor.user_id.clone(),
                        },
                    )
                    .await?;
                let removed = storage
                    .delete_latest_event(snapshot, tracking_id, EventType::Handover)
                    .await?;
                if let Some(ref event) = removed {
                    event_log::log_deleted(std::slice::from_ref(event), "interior cancellation");
                }
                CancelResolution::Reverted {
                    checkpoint: previous,
                    removed_event: removed.map(|e| e.event_id),
                }
            }
        };

        let received_bundles = bundle::settle_bundles(storage, snapshot, open, actor, &at).await?;

        Ok(CancelOutcome {
            tracking_id: row.tracking_id,
            external_ref: row.external_ref,
            resolution,
            received_bundles,
            document_failures: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use custody_storage::{Assignment, MemoryStorage};

    use crate::actor::Actor;
    use crate::stage::StageTable;
    use crate::transition::AcceptTarget;

    fn workflow() -> Workflow<MemoryStorage> {
        Workflow::new(Arc::new(MemoryStorage::new()), StageTable::default_pipeline())
    }

    fn delivery() -> ActorUser {
        ActorUser::new("d-1", Actor::Delivery)
    }

    fn hub() -> ActorUser {
        ActorUser::new("hub-1", Actor::Hub)
    }

    async fn at_entry(wf: &Workflow<MemoryStorage>, r: &str) -> String {
        let out = wf
            .handover(&[r.to_string()], &delivery(), 2, None)
            .await
            .unwrap();
        out.tracking_ids[0].clone()
    }

    #[tokio::test]
    async fn request_twice_is_invalid() {
        let wf = workflow();
        let id = at_entry(&wf, "A").await;
        let row = wf.request_cancel(&id, &delivery()).await.unwrap();
        assert!(row.cancel_requested);
        assert!(matches!(
            wf.request_cancel(&id, &delivery()).await,
            Err(WorkflowError::InvalidCancelState { .. })
        ));
    }

    #[tokio::test]
    async fn confirm_without_request_is_invalid() {
        let wf = workflow();
        let id = at_entry(&wf, "A").await;
        assert!(matches!(
            wf.confirm_cancel(&id, &hub()).await,
            Err(WorkflowError::InvalidCancelState { .. })
        ));
    }

    #[tokio::test]
    async fn only_the_right_parties_may_request_and_confirm() {
        let wf = workflow();
        let id = at_entry(&wf, "A").await;
        assert!(matches!(
            wf.request_cancel(&id, &hub()).await,
            Err(WorkflowError::ActorNotPermitted { .. })
        ));
        wf.request_cancel(&id, &delivery()).await.unwrap();
        assert!(matches!(
            wf.confirm_cancel(&id, &delivery()).await,
            Err(WorkflowError::ActorNotPermitted { .. })
        ));
    }

    #[tokio::test]
    async fn accepted_row_cannot_be_cancelled() {
        let wf = workflow();
        let id = at_entry(&wf, "A").await;
        wf.accept(&AcceptTarget::Shipments(vec!["A".into()]), &hub(), 2)
            .await
            .unwrap();
        assert!(matches!(
            wf.request_cancel(&id, &delivery()).await,
            Err(WorkflowError::InvalidCancelState { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_pending_row_is_not_accepted() {
        let wf = workflow();
        let id = at_entry(&wf, "A").await;
        wf.request_cancel(&id, &delivery()).await.unwrap();
        let out = wf
            .accept(&AcceptTarget::Shipments(vec!["A".into()]), &hub(), 2)
            .await
            .unwrap();
        assert_eq!(out.accepted_count, 0);
        assert_eq!(out.stale_count, 1);
    }

    #[tokio::test]
    async fn missing_row_is_not_found() {
        let wf = workflow();
        assert!(matches!(
            wf.request_cancel("TRK999999", &delivery()).await,
            Err(WorkflowError::TrackingNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reverting_last_open_member_completes_bundle() {
        let wf = workflow();
        wf.handover(&["A".to_string(), "B".to_string()], &delivery(), 2, None)
            .await
            .unwrap();
        wf.accept(
            &AcceptTarget::Shipments(vec!["A".into(), "B".into()]),
            &hub(),
            2,
        )
        .await
        .unwrap();
        let assignment = Assignment {
            courier: "Budi".into(),
            vehicle: "B 1234 XY".into(),
        };
        let out = wf
            .handover(
                &["A".to_string(), "B".to_string()],
                &hub(),
                4,
                Some(assignment),
            )
            .await
            .unwrap();
        let driver = ActorUser::new("drv-1", Actor::Driver);
        wf.accept(&AcceptTarget::Shipments(vec!["A".into()]), &driver, 4)
            .await
            .unwrap();
        assert!(!wf
            .storage()
            .get_bundle(&out.bundle.bundle_id)
            .await
            .unwrap()
            .is_received());

        let b = out.tracking_ids[1].clone();
        wf.request_cancel(&b, &hub()).await.unwrap();
        let cancelled = wf.confirm_cancel(&b, &driver).await.unwrap();
        assert!(matches!(
            cancelled.resolution,
            CancelResolution::Reverted { checkpoint: 3, .. }
        ));
        assert_eq!(cancelled.received_bundles.len(), 1);
        assert_eq!(cancelled.received_bundles[0].bundle_id, out.bundle.bundle_id);
    }
}
