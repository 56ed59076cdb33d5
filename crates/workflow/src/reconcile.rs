//! Source reconciliation.
//!
//! The master and the tracking store are never written together, so the
//! "what can enter the workflow" list is computed at read time: eligible
//! master shipments minus the ones already tracked, except those parked at
//! the re-entry checkpoint, which stay listed as re-enterable.

use std::collections::HashMap;

use custody_storage::{Checkpoint, CustodyStorage, TrackingFilter, TrackingRecord};
use serde::Serialize;

use crate::engine::Workflow;
use crate::error::WorkflowError;
use crate::master::{EligibilityFilter, MasterShipment};
use crate::stage::UNTRACKED_CHECKPOINT;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EligibleShipment {
    pub external_ref: String,
    /// `1` when untracked, otherwise the tracked checkpoint.
    pub effective_checkpoint: Checkpoint,
    pub tracking_id: Option<String>,
    pub shipment: MasterShipment,
}

/// Merge master shipments with tracked rows.
pub fn reconcile(
    master: Vec<MasterShipment>,
    tracked: &[TrackingRecord],
    reentry_checkpoint: Option<Checkpoint>,
) -> Vec<EligibleShipment> {
    let by_ref: HashMap<&str, &TrackingRecord> = tracked
        .iter()
        .map(|r| (r.external_ref.as_str(), r))
        .collect();

    master
        .into_iter()
        .filter_map(|shipment| match by_ref.get(shipment.external_ref.as_str()) {
            None => Some(EligibleShipment {
                external_ref: shipment.external_ref.clone(),
                effective_checkpoint: UNTRACKED_CHECKPOINT,
                tracking_id: None,
                shipment,
            }),
            Some(row) if Some(row.current_checkpoint) == reentry_checkpoint => {
                Some(EligibleShipment {
                    external_ref: shipment.external_ref.clone(),
                    effective_checkpoint: row.current_checkpoint,
                    tracking_id: Some(row.tracking_id.clone()),
                    shipment,
                })
            }
            Some(_) => None,
        })
        .collect()
}

impl<S: CustodyStorage> Workflow<S> {
    /// Eligible master shipments that can be handed over into the entry
    /// stage.
    pub async fn list_eligible_for_entry(
        &self,
        filter: &EligibilityFilter,
    ) -> Result<Vec<EligibleShipment>, WorkflowError> {
        let master = self.master.list_shipments(filter).await?;
        let tracked = self
            .storage
            .list_tracking(&TrackingFilter::default())
            .await?;
        let eligible = reconcile(master, &tracked, self.stages.reentry_checkpoint());
        tracing::debug!(
            source = self.master.source_id(),
            tracked = tracked.len(),
            eligible = eligible.len(),
            "reconciled master against tracking store"
        );
        Ok(eligible)
    }
}
