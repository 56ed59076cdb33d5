//! The workflow facade.
//!
//! [`Workflow`] wires the stage table, hooks, storage, master source and
//! document dispatch together. Transition operations live in
//! `transition.rs`, cancellation in `cancel.rs` and reconciliation in
//! `reconcile.rs`; this module holds construction and the read paths.

use std::sync::Arc;

use custody_storage::{
    BundleRecord, Checkpoint, CustodyStorage, EventRecord, TrackingFilter, TrackingRecord,
};

use crate::actor::Actor;
use crate::bundle::{self, BundleView};
use crate::document::{
    AttachOutcome, AttachmentQueue, AttachmentService, DocumentFailure, DocumentGenerator,
    SweepReport,
};
use crate::error::WorkflowError;
use crate::event_log;
use crate::hook::{HookRegistry, StageHook};
use crate::master::static_master::StaticMaster;
use crate::master::MasterSource;
use crate::stage::StageTable;

/// Attempts per transaction before a commit conflict is given up on. The last
/// conflict surfaces through the usual storage mapping: a moved row as
/// [`WorkflowError::StaleState`], a reference tracked by a concurrent
/// handover as [`WorkflowError::InconsistentBatch`].
pub const MAX_COMMIT_ATTEMPTS: usize = 3;

/// How received bundles get their documents.
pub enum DocumentDispatch<S> {
    /// No generator configured; bundles stay unattached.
    Disabled,
    /// Generate right after commit, in the caller's task.
    Inline(AttachmentService<S>),
    /// Hand the bundle id to the background worker.
    Queued(AttachmentQueue),
}

pub struct Workflow<S: CustodyStorage> {
    pub(crate) storage: Arc<S>,
    pub(crate) stages: StageTable,
    pub(crate) hooks: HookRegistry,
    pub(crate) master: Arc<dyn MasterSource>,
    pub(crate) documents: DocumentDispatch<S>,
}

impl<S: CustodyStorage> Workflow<S> {
    /// A workflow with the table's built-in hooks, an empty master and no
    /// document generation.
    pub fn new(storage: Arc<S>, stages: StageTable) -> Self {
        let hooks = HookRegistry::for_table(&stages);
        Workflow {
            storage,
            stages,
            hooks,
            master: Arc::new(StaticMaster::empty()),
            documents: DocumentDispatch::Disabled,
        }
    }

    pub fn with_master(mut self, master: Arc<dyn MasterSource>) -> Self {
        self.master = master;
        self
    }

    pub fn with_hook(mut self, checkpoint: Checkpoint, hook: Arc<dyn StageHook>) -> Self {
        self.hooks.register(checkpoint, hook);
        self
    }

    /// Generate documents inline after each committed receipt.
    pub fn with_document_generator(mut self, generator: Arc<dyn DocumentGenerator>) -> Self {
        self.documents =
            DocumentDispatch::Inline(AttachmentService::new(self.storage.clone(), generator));
        self
    }

    /// Hand received bundles to a running attachment worker.
    pub fn with_attachment_queue(mut self, queue: AttachmentQueue) -> Self {
        self.documents = DocumentDispatch::Queued(queue);
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn stages(&self) -> &StageTable {
        &self.stages
    }

    pub fn master(&self) -> &Arc<dyn MasterSource> {
        &self.master
    }

    /// Shipments waiting on `role`: every row whose checkpoint lies in one
    /// of the role's outstanding ranges.
    pub async fn list_by_checkpoint_range(
        &self,
        role: Actor,
    ) -> Result<Vec<TrackingRecord>, WorkflowError> {
        let ranges = self.stages.outstanding_ranges(role);
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .storage
            .list_tracking(&TrackingFilter::ranges(ranges))
            .await?)
    }

    /// Bundles created at `checkpoint` (and at `alt_checkpoint`, if given).
    pub async fn list_bundles_by_checkpoint(
        &self,
        checkpoint: Checkpoint,
        alt_checkpoint: Option<Checkpoint>,
    ) -> Result<Vec<BundleRecord>, WorkflowError> {
        self.stages.stage_for(checkpoint)?;
        let mut checkpoints = vec![checkpoint];
        if let Some(alt) = alt_checkpoint {
            self.stages.stage_for(alt)?;
            checkpoints.push(alt);
        }
        Ok(self.storage.list_bundles(&checkpoints).await?)
    }

    pub async fn list_bundles(&self) -> Result<Vec<BundleRecord>, WorkflowError> {
        Ok(self.storage.list_bundles(&[]).await?)
    }

    pub async fn expand_bundle(&self, bundle_id: &str) -> Result<BundleView, WorkflowError> {
        bundle::expand(self.storage.as_ref(), self.master.as_ref(), bundle_id).await
    }

    /// Full event history of a tracking row, in log order.
    pub async fn history(&self, tracking_id: &str) -> Result<Vec<EventRecord>, WorkflowError> {
        self.storage.get_tracking(tracking_id).await?;
        Ok(self.storage.list_events(tracking_id).await?)
    }

    /// Latest event per `(event_type, from_actor, to_actor)`.
    pub async fn progress(&self, tracking_id: &str) -> Result<Vec<EventRecord>, WorkflowError> {
        let events = self.history(tracking_id).await?;
        Ok(event_log::progress(&events))
    }

    /// Callback from the document collaborator. Returns `false` when the
    /// bundle already had an attachment, which is kept.
    pub async fn on_document_generated(
        &self,
        bundle_id: &str,
        attachment_ref: &str,
    ) -> Result<bool, WorkflowError> {
        let attached = self
            .storage
            .attach_document(bundle_id, attachment_ref)
            .await?;
        if attached {
            tracing::info!(bundle_id, attachment_ref, "document attached by callback");
        } else {
            tracing::debug!(bundle_id, "document callback ignored; already attached");
        }
        Ok(attached)
    }

    /// Retry generation for every received bundle without an attachment.
    pub async fn retry_attachments(&self) -> Result<SweepReport, WorkflowError> {
        match &self.documents {
            DocumentDispatch::Disabled => Ok(SweepReport::default()),
            DocumentDispatch::Inline(service) => service.sweep().await,
            DocumentDispatch::Queued(queue) => {
                let mut report = SweepReport::default();
                for bundle in self.storage.list_unattached_bundles().await? {
                    if let Err(e) = queue.enqueue(&bundle.bundle_id).await {
                        report.failed.push(DocumentFailure {
                            bundle_id: bundle.bundle_id,
                            message: e.to_string(),
                        });
                    }
                }
                Ok(report)
            }
        }
    }

    /// Trigger documents for bundles received by a committed transaction.
    /// Failures are reported, never propagated.
    pub(crate) async fn dispatch_documents(
        &self,
        bundles: &[BundleRecord],
    ) -> Vec<DocumentFailure> {
        let mut failures = Vec::new();
        for bundle in bundles {
            let result = match &self.documents {
                DocumentDispatch::Disabled => continue,
                DocumentDispatch::Inline(service) => match service.attach(&bundle.bundle_id).await {
                    Ok(AttachOutcome::NotReceived) => {
                        tracing::debug!(bundle_id = %bundle.bundle_id, "bundle not received; no document");
                        Ok(())
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                },
                DocumentDispatch::Queued(queue) => {
                    queue.enqueue(&bundle.bundle_id).await.map(|_| ())
                }
            };
            if let Err(e) = result {
                tracing::warn!(
                    bundle_id = %bundle.bundle_id,
                    document_number = %bundle.document_number,
                    error = %e,
                    "document generation failed; bundle left unattached"
                );
                failures.push(DocumentFailure {
                    bundle_id: bundle.bundle_id.clone(),
                    message: e.to_string(),
                });
            }
        }
        failures
    }
}
