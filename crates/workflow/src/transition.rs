//! Handover and acceptance.
//!
//! Both operations run as one snapshot: tracking rows are written first,
//! then bundles, then events. Validation happens before the first write.
//! A commit rejected for a concurrent change is retried from scratch with
//! fresh reads, up to [`MAX_COMMIT_ATTEMPTS`].

use std::collections::HashSet;

use custody_storage::{
    Assignment, BundleRecord, Checkpoint, CustodyStorage, EventType, NewTracking, StorageError,
    TrackingRecord, TrackingUpdate,
};
use serde::{Deserialize, Serialize};

use crate::actor::ActorUser;
use crate::bundle;
use crate::clock::now_rfc3339;
use crate::document::DocumentFailure;
use crate::engine::{Workflow, MAX_COMMIT_ATTEMPTS};
use crate::error::WorkflowError;
use crate::event_log;
use crate::hook::{HandoverContext, StagePatch};
use crate::stage::{Stage, StageKind};

#[derive(Debug, Clone, Serialize)]
pub struct HandoverOutcome {
    /// Shipments that entered the pipeline with this handover.
    pub inserted_count: usize,
    /// Shipments that were already tracked and moved forward.
    pub advanced_count: usize,
    pub bundle: BundleRecord,
    pub tracking_ids: Vec<String>,
}

/// What an acceptance applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptTarget {
    /// External shipment references.
    Shipments(Vec<String>),
    /// Bundle ids, expanded to their members.
    Bundles(Vec<String>),
}

impl AcceptTarget {
    pub fn is_empty(&self) -> bool {
        match self {
            AcceptTarget::Shipments(refs) => refs.is_empty(),
            AcceptTarget::Bundles(ids) => ids.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AcceptOutcome {
    pub accepted_count: usize,
    /// Items that had already moved, vanished or are being cancelled.
    pub stale_count: usize,
    pub accepted: Vec<String>,
    pub received_bundles: Vec<BundleRecord>,
    pub document_failures: Vec<DocumentFailure>,
}

enum Planned<'a> {
    Insert(&'a str),
    Advance(TrackingRecord),
}

struct Candidate {
    label: String,
    row: Option<TrackingRecord>,
    via_bundle: bool,
}

fn retryable(e: &StorageError) -> bool {
    matches!(
        e,
        StorageError::ConcurrentConflict { .. } | StorageError::AlreadyTracked { .. }
    )
}

impl<S: CustodyStorage> Workflow<S> {
    /// Hand a batch of shipments over into the pending stage `target`.
    ///
    /// Untracked shipments enter the pipeline when `target` is the entry
    /// stage; tracked ones must sit at the stage preceding `target`. Any
    /// shipment failing that precondition rejects the whole batch. One new
    /// bundle holds exactly the shipments of the batch.
    pub async fn handover(
        &self,
        refs: &[String],
        actor: &ActorUser,
        target: Checkpoint,
        assignment: Option<Assignment>,
    ) -> Result<HandoverOutcome, WorkflowError> {
        if refs.is_empty() {
            return Err(WorkflowError::EmptyBatch);
        }
        let mut seen = HashSet::new();
        if let Some(dup) = refs.iter().find(|r| !seen.insert(r.as_str())) {
            return Err(WorkflowError::InconsistentBatch {
                shipment: dup.clone(),
                reason: "is listed twice".to_string(),
            });
        }

        let stage = self.stages.stage_for(target)?;
        if stage.kind != StageKind::Pending {
            return Err(WorkflowError::InvalidCheckpoint {
                checkpoint: target,
                reason: "is not a handover stage".to_string(),
            });
        }
        if actor.role != stage.from_actor {
            return Err(WorkflowError::ActorNotPermitted {
                role: actor.role,
                operation: "hand over",
                checkpoint: target,
            });
        }
        let patch = self.hooks.prepare(&HandoverContext {
            stage,
            actor,
            external_refs: refs,
            assignment: assignment.as_ref(),
        })?;

        let mut attempt = 1;
        loop {
            let at = now_rfc3339();
            let mut snapshot = self.storage.begin_snapshot().await?;
            let outcome = match self
                .apply_handover(&mut snapshot, refs, stage, actor, &patch, &at)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _ = self.storage.abort_snapshot(snapshot).await;
                    return Err(e);
                }
            };

            match self.storage.commit_snapshot(snapshot).await {
                Ok(()) => {
                    tracing::info!(
                        checkpoint = target,
                        user = %actor.user_id,
                        bundle = %outcome.bundle.document_number,
                        inserted = outcome.inserted_count,
                        advanced = outcome.advanced_count,
                        "handover committed"
                    );
                    return Ok(outcome);
                }
                Err(e) if retryable(&e) && attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "handover commit conflict; retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn apply_handover(
        &self,
        snapshot: &mut S::Snapshot,
        refs: &[String],
        stage: &Stage,
        actor: &ActorUser,
        patch: &StagePatch,
        at: &str,
    ) -> Result<HandoverOutcome, WorkflowError> {
        let storage = self.storage.as_ref();
        let target = stage.checkpoint;
        let expected = self.stages.previous_checkpoint_of(target);
        let reentry = match expected {
            None => self.stages.reentry_checkpoint(),
            Some(_) => None,
        };
        let wanted = match (expected, reentry) {
            (Some(prev), _) => format!("checkpoint {}", prev),
            (None, Some(r)) => format!("untracked or at checkpoint {}", r),
            (None, None) => "untracked".to_string(),
        };

        let mut plan = Vec::with_capacity(refs.len());
        for external_ref in refs {
            match storage.find_tracking_for_update(snapshot, external_ref).await? {
                None if expected.is_none() => plan.push(Planned::Insert(external_ref)),
                None => {
                    return Err(WorkflowError::InconsistentBatch {
                        shipment: external_ref.clone(),
                        reason: format!(
                            "is not tracked; only checkpoint {} admits new shipments",
                            self.stages.entry_checkpoint()
                        ),
                    });
                }
                Some(row) if row.cancel_requested => {
                    return Err(WorkflowError::InconsistentBatch {
                        shipment: external_ref.clone(),
                        reason: "has a cancellation pending".to_string(),
                    });
                }
                Some(row)
                    if Some(row.current_checkpoint) == expected
                        || Some(row.current_checkpoint) == reentry =>
                {
                    plan.push(Planned::Advance(row))
                }
                Some(row) => {
                    return Err(WorkflowError::InconsistentBatch {
                        shipment: external_ref.clone(),
                        reason: format!(
                            "is at checkpoint {}, expected {}",
                            row.current_checkpoint, wanted
                        ),
                    });
                }
            }
        }

        let mut tracking_ids = Vec::with_capacity(plan.len());
        let mut inserted_count = 0;
        let mut advanced_count = 0;
        for planned in plan {
            match planned {
                Planned::Insert(external_ref) => {
                    let row = storage
                        .insert_tracking(
                            snapshot,
                            NewTracking {
                                external_ref: external_ref.to_string(),
                                checkpoint: target,
                                assignment: patch.assignment.clone(),
                                created_at: at.to_string(),
                                created_by: actor.user_id.clone(),
                            },
                        )
                        .await?;
                    tracking_ids.push(row.tracking_id);
                    inserted_count += 1;
                }
                Planned::Advance(row) => {
                    storage
                        .update_tracking(
                            snapshot,
                            &row.tracking_id,
                            row.current_checkpoint,
                            TrackingUpdate {
                                checkpoint: target,
                                cancel_requested: false,
                                assignment: patch.assignment.clone(),
                                updated_at: at.to_string(),
                                updated_by: actor.user_id.clone(),
                            },
                        )
                        .await?;
                    tracking_ids.push(row.tracking_id);
                    advanced_count += 1;
                }
            }
        }

        let bundle =
            bundle::create_bundle(storage, snapshot, &tracking_ids, target, actor, at).await?;
        for tracking_id in &tracking_ids {
            event_log::record(
                storage,
                snapshot,
                tracking_id,
                EventType::Handover,
                stage,
                target,
                actor,
                at,
            )
            .await?;
        }

        Ok(HandoverOutcome {
            inserted_count,
            advanced_count,
            bundle,
            tracking_ids,
        })
    }

    /// Accept shipments waiting at the pending stage `checkpoint`.
    ///
    /// Every applicable row moves to the stage's next checkpoint and gets
    /// one ACCEPTANCE event. Rows already past the checkpoint, gone, or
    /// awaiting cancellation are stale: they are counted and skipped. A
    /// listed shipment still behind the checkpoint rejects the batch.
    /// Bundles created at the checkpoint whose members have all moved on are
    /// marked received, and their documents are triggered after commit.
    pub async fn accept(
        &self,
        target: &AcceptTarget,
        actor: &ActorUser,
        checkpoint: Checkpoint,
    ) -> Result<AcceptOutcome, WorkflowError> {
        if target.is_empty() {
            return Err(WorkflowError::EmptyBatch);
        }
        let stage = self.stages.stage_for(checkpoint)?;
        if stage.kind != StageKind::Pending {
            return Err(WorkflowError::InvalidCheckpoint {
                checkpoint,
                reason: "is not awaiting acceptance".to_string(),
            });
        }
        if actor.role != stage.acting_actor {
            return Err(WorkflowError::ActorNotPermitted {
                role: actor.role,
                operation: "accept",
                checkpoint,
            });
        }
        let next = stage.next.ok_or_else(|| WorkflowError::InvalidCheckpoint {
            checkpoint,
            reason: "has no next stage".to_string(),
        })?;

        let mut attempt = 1;
        let mut outcome = loop {
            let at = now_rfc3339();
            let mut snapshot = self.storage.begin_snapshot().await?;
            let outcome = match self
                .apply_acceptance(&mut snapshot, target, stage, next, actor, &at)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _ = self.storage.abort_snapshot(snapshot).await;
                    return Err(e);
                }
            };
            if outcome.accepted_count == 0 {
                self.storage.abort_snapshot(snapshot).await?;
                break outcome;
            }

            match self.storage.commit_snapshot(snapshot).await {
                Ok(()) => break outcome,
                Err(e) if retryable(&e) && attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "acceptance commit conflict; retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(
            checkpoint,
            user = %actor.user_id,
            accepted = outcome.accepted_count,
            stale = outcome.stale_count,
            received_bundles = outcome.received_bundles.len(),
            "acceptance committed"
        );
        outcome.document_failures = self.dispatch_documents(&outcome.received_bundles).await;
        Ok(outcome)
    }

    async fn resolve_candidates(
        &self,
        snapshot: &mut S::Snapshot,
        target: &AcceptTarget,
    ) -> Result<Vec<Candidate>, WorkflowError> {
        let storage = self.storage.as_ref();
        let mut candidates = Vec::new();
        match target {
            AcceptTarget::Shipments(refs) => {
                for external_ref in refs {
                    let row = storage.find_tracking_for_update(snapshot, external_ref).await?;
                    candidates.push(Candidate {
                        label: external_ref.clone(),
                        row,
                        via_bundle: false,
                    });
                }
            }
            AcceptTarget::Bundles(ids) => {
                for bundle_id in ids {
                    storage.get_bundle_for_update(snapshot, bundle_id).await?;
                    for tracking_id in storage.bundle_member_ids(snapshot, bundle_id).await? {
                        let row = match storage.get_tracking_for_update(snapshot, &tracking_id).await
                        {
                            Ok(row) => Some(row),
                            Err(StorageError::TrackingNotFound { .. }) => None,
                            Err(e) => return Err(e.into()),
                        };
                        candidates.push(Candidate {
                            label: tracking_id,
                            row,
                            via_bundle: true,
                        });
                    }
                }
            }
        }
        Ok(candidates)
    }

    async fn apply_acceptance(
        &self,
        snapshot: &mut S::Snapshot,
        target: &AcceptTarget,
        stage: &Stage,
        next: Checkpoint,
        actor: &ActorUser,
        at: &str,
    ) -> Result<AcceptOutcome, WorkflowError> {
        let storage = self.storage.as_ref();
        let checkpoint = stage.checkpoint;

        let mut seen = HashSet::new();
        let mut due = Vec::new();
        let mut stale_count = 0;
        for candidate in self.resolve_candidates(snapshot, target).await? {
            let Some(row) = candidate.row else {
                tracing::debug!(shipment = %candidate.label, "not tracked; skipped as stale");
                stale_count += 1;
                continue;
            };
            if !seen.insert(row.tracking_id.clone()) {
                continue;
            }
            // Bundle members behind the checkpoint were reverted by a
            // cancellation and simply no longer belong to this step.
            if row.current_checkpoint < checkpoint && !candidate.via_bundle {
                return Err(WorkflowError::InconsistentBatch {
                    shipment: candidate.label,
                    reason: format!(
                        "is at checkpoint {}, behind {}",
                        row.current_checkpoint, checkpoint
                    ),
                });
            }
            if row.current_checkpoint != checkpoint || row.cancel_requested {
                tracing::debug!(
                    tracking_id = %row.tracking_id,
                    current = row.current_checkpoint,
                    cancel_requested = row.cancel_requested,
                    "skipped as stale"
                );
                stale_count += 1;
                continue;
            }
            due.push(row);
        }

        let mut accepted = Vec::with_capacity(due.len());
        for row in due {
            let update = TrackingUpdate {
                checkpoint: next,
                cancel_requested: false,
                assignment: None,
                updated_at: at.to_string(),
                updated_by: actor.user_id.clone(),
            };
            match storage
                .update_tracking(snapshot, &row.tracking_id, checkpoint, update)
                .await
            {
                Ok(_) => accepted.push(row.tracking_id),
                Err(StorageError::ConcurrentConflict { .. }) => stale_count += 1,
                Err(e) => return Err(e.into()),
            }
        }

        for tracking_id in &accepted {
            event_log::record(
                storage,
                snapshot,
                tracking_id,
                EventType::Acceptance,
                stage,
                next,
                actor,
                at,
            )
            .await?;
        }

        let open = bundle::open_bundles_at(storage, snapshot, &accepted, checkpoint).await?;
        let received_bundles = bundle::settle_bundles(storage, snapshot, open, actor, at).await?;

        Ok(AcceptOutcome {
            accepted_count: accepted.len(),
            stale_count,
            accepted,
            received_bundles,
            document_failures: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use custody_storage::MemoryStorage;

    use crate::actor::Actor;
    use crate::stage::StageTable;

    fn workflow() -> Workflow<MemoryStorage> {
        Workflow::new(Arc::new(MemoryStorage::new()), StageTable::default_pipeline())
    }

    fn refs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn delivery() -> ActorUser {
        ActorUser::new("d-1", Actor::Delivery)
    }

    fn hub() -> ActorUser {
        ActorUser::new("hub-1", Actor::Hub)
    }

    #[tokio::test]
    async fn entry_handover_inserts_and_bundles() {
        let wf = workflow();
        let out = wf.handover(&refs(&["A", "B"]), &delivery(), 2, None).await.unwrap();
        assert_eq!(out.inserted_count, 2);
        assert_eq!(out.advanced_count, 0);
        assert_eq!(out.bundle.document_number, "HG000001");
        assert_eq!(out.bundle.created_at_checkpoint, 2);

        let members = wf.storage().list_bundle_members(&out.bundle.bundle_id).await.unwrap();
        assert_eq!(members, out.tracking_ids);
        for id in &out.tracking_ids {
            let events = wf.history(id).await.unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].event_type, EventType::Handover);
            assert_eq!(events[0].from_actor, "delivery");
            assert_eq!(events[0].to_actor, "hub");
        }
    }

    #[tokio::test]
    async fn handover_rejects_wrong_actor_and_held_stage() {
        let wf = workflow();
        assert!(matches!(
            wf.handover(&refs(&["A"]), &hub(), 2, None).await,
            Err(WorkflowError::ActorNotPermitted { .. })
        ));
        assert!(matches!(
            wf.handover(&refs(&["A"]), &delivery(), 3, None).await,
            Err(WorkflowError::InvalidCheckpoint { checkpoint: 3, .. })
        ));
        assert!(matches!(
            wf.handover(&refs(&["A"]), &delivery(), 99, None).await,
            Err(WorkflowError::InvalidCheckpoint { checkpoint: 99, .. })
        ));
        assert!(matches!(
            wf.handover(&[], &delivery(), 2, None).await,
            Err(WorkflowError::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn handover_is_all_or_nothing() {
        let wf = workflow();
        wf.handover(&refs(&["A"]), &delivery(), 2, None).await.unwrap();

        let err = wf
            .handover(&refs(&["B", "A"]), &delivery(), 2, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InconsistentBatch { ref shipment, .. } if shipment == "A"));
        assert!(wf.storage().find_tracking("B").await.unwrap().is_none());
        assert_eq!(wf.list_bundles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn later_handover_requires_assignment() {
        let wf = workflow();
        wf.handover(&refs(&["A"]), &delivery(), 2, None).await.unwrap();
        wf.accept(&AcceptTarget::Shipments(refs(&["A"])), &hub(), 2)
            .await
            .unwrap();

        assert!(matches!(
            wf.handover(&refs(&["A"]), &hub(), 4, None).await,
            Err(WorkflowError::AssignmentRequired { checkpoint: 4 })
        ));

        let assignment = Assignment {
            courier: "Budi".into(),
            vehicle: "B 1234 XY".into(),
        };
        let out = wf
            .handover(&refs(&["A"]), &hub(), 4, Some(assignment.clone()))
            .await
            .unwrap();
        assert_eq!(out.advanced_count, 1);
        assert_eq!(out.bundle.document_number, "HG000002");
        let row = wf.storage().find_tracking("A").await.unwrap().unwrap();
        assert_eq!(row.current_checkpoint, 4);
        assert_eq!(row.assignment, Some(assignment));
    }

    #[tokio::test]
    async fn untracked_shipment_cannot_skip_entry() {
        let wf = workflow();
        let assignment = Assignment {
            courier: "Budi".into(),
            vehicle: "B 1234 XY".into(),
        };
        assert!(matches!(
            wf.handover(&refs(&["Z"]), &hub(), 4, Some(assignment)).await,
            Err(WorkflowError::InconsistentBatch { .. })
        ));
    }

    #[tokio::test]
    async fn reentry_checkpoint_can_hand_over_to_entry() {
        let table = StageTable::default_pipeline().with_reentry(9).unwrap();
        let wf = Workflow::new(Arc::new(MemoryStorage::new()), table);
        let out = wf.handover(&refs(&["A"]), &delivery(), 2, None).await.unwrap();

        // Park the row at the re-entry checkpoint directly.
        let storage = wf.storage();
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage
            .update_tracking(
                &mut snap,
                &out.tracking_ids[0],
                2,
                TrackingUpdate {
                    checkpoint: 9,
                    cancel_requested: false,
                    assignment: None,
                    updated_at: "2025-01-01T00:00:00Z".into(),
                    updated_by: "d-1".into(),
                },
            )
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        let again = wf.handover(&refs(&["A"]), &delivery(), 2, None).await.unwrap();
        assert_eq!(again.inserted_count, 0);
        assert_eq!(again.advanced_count, 1);
        assert_eq!(again.tracking_ids, out.tracking_ids);
    }

    #[tokio::test]
    async fn accept_rejects_wrong_actor_and_behind_rows() {
        let wf = workflow();
        wf.handover(&refs(&["A"]), &delivery(), 2, None).await.unwrap();

        assert!(matches!(
            wf.accept(&AcceptTarget::Shipments(refs(&["A"])), &delivery(), 2).await,
            Err(WorkflowError::ActorNotPermitted { .. })
        ));
        let driver = ActorUser::new("drv-1", Actor::Driver);
        assert!(matches!(
            wf.accept(&AcceptTarget::Shipments(refs(&["A"])), &driver, 4).await,
            Err(WorkflowError::InconsistentBatch { .. })
        ));
        assert!(matches!(
            wf.accept(&AcceptTarget::Shipments(refs(&["A"])), &hub(), 3).await,
            Err(WorkflowError::InvalidCheckpoint { checkpoint: 3, .. })
        ));
    }

    #[tokio::test]
    async fn accept_by_bundle_expands_members() {
        let wf = workflow();
        let out = wf.handover(&refs(&["A", "B"]), &delivery(), 2, None).await.unwrap();

        let accepted = wf
            .accept(
                &AcceptTarget::Bundles(vec![out.bundle.bundle_id.clone()]),
                &hub(),
                2,
            )
            .await
            .unwrap();
        assert_eq!(accepted.accepted_count, 2);
        assert_eq!(accepted.received_bundles.len(), 1);
        assert!(accepted.received_bundles[0].is_received());

        assert!(matches!(
            wf.accept(&AcceptTarget::Bundles(vec!["bundle-404".into()]), &hub(), 2).await,
            Err(WorkflowError::BundleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn accepting_twice_is_stale_not_an_error() {
        let wf = workflow();
        wf.handover(&refs(&["A"]), &delivery(), 2, None).await.unwrap();
        let target = AcceptTarget::Shipments(refs(&["A"]));
        assert_eq!(wf.accept(&target, &hub(), 2).await.unwrap().accepted_count, 1);

        let again = wf.accept(&target, &hub(), 2).await.unwrap();
        assert_eq!(again.accepted_count, 0);
        assert_eq!(again.stale_count, 1);

        let row = wf.storage().find_tracking("A").await.unwrap().unwrap();
        assert_eq!(wf.history(&row.tracking_id).await.unwrap().len(), 2);
    }

    #[test]
    fn accept_target_json_shape() {
        let target: AcceptTarget = serde_json::from_str(r#"{"bundles": ["bundle-1"]}"#).unwrap();
        assert_eq!(target, AcceptTarget::Bundles(vec!["bundle-1".into()]));
    }
}
