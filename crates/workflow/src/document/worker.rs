//! Background attachment worker.
//!
//! A single tokio task drains a bounded queue of bundle ids and runs
//! [`AttachmentService::attach`] for each. An id already queued or being
//! processed is not queued again. Failures are logged and left for
//! [`AttachmentService::sweep`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use custody_storage::CustodyStorage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{AttachOutcome, AttachmentService};
use crate::error::WorkflowError;

/// Handle for queueing bundles on the attachment worker.
#[derive(Clone)]
pub struct AttachmentQueue {
    tx: mpsc::Sender<String>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AttachmentQueue {
    /// Queue a bundle. Returns `false` when it is already queued.
    pub async fn enqueue(&self, bundle_id: &str) -> Result<bool, WorkflowError> {
        if !lock(&self.in_flight).insert(bundle_id.to_string()) {
            return Ok(false);
        }
        if self.tx.send(bundle_id.to_string()).await.is_err() {
            lock(&self.in_flight).remove(bundle_id);
            return Err(WorkflowError::DocumentGenerationFailed {
                bundle_id: bundle_id.to_string(),
                message: "attachment worker has stopped".to_string(),
            });
        }
        Ok(true)
    }

    /// Number of bundles queued or being processed.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

impl std::fmt::Debug for AttachmentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentQueue")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Spawn the worker on the current runtime. The task ends once every
/// [`AttachmentQueue`] clone has been dropped and the queue is drained.
pub fn spawn_attachment_worker<S: CustodyStorage>(
    service: AttachmentService<S>,
    capacity: usize,
) -> (AttachmentQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let queue = AttachmentQueue {
        tx,
        in_flight: in_flight.clone(),
    };

    let handle = tokio::spawn(async move {
        while let Some(bundle_id) = rx.recv().await {
            match service.attach(&bundle_id).await {
                Ok(AttachOutcome::Attached { .. }) => {}
                Ok(outcome) => {
                    tracing::debug!(%bundle_id, ?outcome, "attachment skipped");
                }
                Err(e) => {
                    tracing::warn!(%bundle_id, error = %e, "attachment failed; left for retry");
                }
            }
            lock(&in_flight).remove(&bundle_id);
        }
        tracing::debug!("attachment worker stopped");
    });

    (queue, handle)
}
