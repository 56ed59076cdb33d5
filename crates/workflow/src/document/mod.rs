//! Post-commit document generation.
//!
//! When a bundle is received the workflow asks an external generator for a
//! handover document and stores the returned reference on the bundle. This
//! runs after the transition has committed and never touches tracking rows,
//! so a failure only leaves the bundle received but unattached. Attachment
//! is idempotent per bundle: an attached bundle is never regenerated.

#[cfg(feature = "http")]
pub mod http;
pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use custody_storage::{BundleRecord, CustodyStorage, StorageError, TrackingRecord};
use serde::Serialize;

use crate::error::WorkflowError;

pub use worker::{spawn_attachment_worker, AttachmentQueue};

/// Everything a generator needs to render one bundle.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRequest {
    pub bundle: BundleRecord,
    pub members: Vec<TrackingRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("generator rejected {document_number}: {message}")]
    Rejected {
        document_number: String,
        message: String,
    },
    #[error("generator unreachable: {0}")]
    Transport(String),
}

/// Renders a bundle document and returns a reference to the stored file.
#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    async fn generate(&self, request: &DocumentRequest) -> Result<String, DocumentError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttachOutcome {
    Attached { attachment_ref: String },
    AlreadyAttached { attachment_ref: String },
    /// The bundle has not been received yet; nothing to generate.
    NotReceived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentFailure {
    pub bundle_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub attached: Vec<String>,
    pub failed: Vec<DocumentFailure>,
}

pub struct AttachmentService<S> {
    storage: Arc<S>,
    generator: Arc<dyn DocumentGenerator>,
}

impl<S> Clone for AttachmentService<S> {
    fn clone(&self) -> Self {
        AttachmentService {
            storage: self.storage.clone(),
            generator: self.generator.clone(),
        }
    }
}

impl<S: CustodyStorage> AttachmentService<S> {
    pub fn new(storage: Arc<S>, generator: Arc<dyn DocumentGenerator>) -> Self {
        AttachmentService { storage, generator }
    }

    /// Generate and attach the document for one bundle.
    pub async fn attach(&self, bundle_id: &str) -> Result<AttachOutcome, WorkflowError> {
        let bundle = self.storage.get_bundle(bundle_id).await?;
        if let Some(attachment_ref) = bundle.attachment_ref {
            return Ok(AttachOutcome::AlreadyAttached { attachment_ref });
        }
        if !bundle.is_received() {
            return Ok(AttachOutcome::NotReceived);
        }

        let mut members = Vec::new();
        for tracking_id in self.storage.list_bundle_members(bundle_id).await? {
            match self.storage.get_tracking(&tracking_id).await {
                Ok(row) => members.push(row),
                Err(StorageError::TrackingNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let request = DocumentRequest { bundle, members };
        let attachment_ref = self.generator.generate(&request).await.map_err(|e| {
            WorkflowError::DocumentGenerationFailed {
                bundle_id: bundle_id.to_string(),
                message: e.to_string(),
            }
        })?;

        if self.storage.attach_document(bundle_id, &attachment_ref).await? {
            tracing::info!(
                bundle_id,
                document_number = %request.bundle.document_number,
                %attachment_ref,
                "attached bundle document"
            );
            Ok(AttachOutcome::Attached { attachment_ref })
        } else {
            // Another attempt won the race; its reference stands.
            let current = self.storage.get_bundle(bundle_id).await?;
            Ok(AttachOutcome::AlreadyAttached {
                attachment_ref: current.attachment_ref.unwrap_or(attachment_ref),
            })
        }
    }

    /// Retry every received bundle that is still missing its document.
    pub async fn sweep(&self) -> Result<SweepReport, WorkflowError> {
        let mut report = SweepReport::default();
        for bundle in self.storage.list_unattached_bundles().await? {
            match self.attach(&bundle.bundle_id).await {
                Ok(AttachOutcome::Attached { .. }) => report.attached.push(bundle.bundle_id),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(bundle_id = %bundle.bundle_id, error = %e, "document retry failed");
                    report.failed.push(DocumentFailure {
                        bundle_id: bundle.bundle_id,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use custody_storage::{MemoryStorage, NewBundle};

    /// Generator that returns `docs/{document_number}.pdf`, or fails while
    /// `failing` is set.
    #[derive(Default)]
    pub(crate) struct FakeGenerator {
        pub failing: AtomicBool,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentGenerator for FakeGenerator {
        async fn generate(&self, request: &DocumentRequest) -> Result<String, DocumentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(DocumentError::Transport("connection refused".into()));
            }
            Ok(format!("docs/{}.pdf", request.bundle.document_number))
        }
    }

    async fn bundle(storage: &MemoryStorage, received: bool) -> String {
        let mut snap = storage.begin_snapshot().await.unwrap();
        let b = storage
            .insert_bundle(
                &mut snap,
                NewBundle {
                    created_at_checkpoint: 2,
                    created_at: "2025-01-01T00:00:00Z".into(),
                    created_by: "d-1".into(),
                },
            )
            .await
            .unwrap();
        if received {
            storage
                .mark_bundle_received(&mut snap, &b.bundle_id, "hub-1", "2025-01-01T01:00:00Z")
                .await
                .unwrap();
        }
        storage.commit_snapshot(snap).await.unwrap();
        b.bundle_id
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let generator = Arc::new(FakeGenerator::default());
        let service = AttachmentService::new(storage.clone(), generator.clone());
        let id = bundle(&storage, true).await;

        let first = service.attach(&id).await.unwrap();
        assert_eq!(
            first,
            AttachOutcome::Attached {
                attachment_ref: "docs/HG000001.pdf".into()
            }
        );
        let second = service.attach(&id).await.unwrap();
        assert!(matches!(second, AttachOutcome::AlreadyAttached { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreceived_bundle_is_skipped() {
        let storage = Arc::new(MemoryStorage::new());
        let generator = Arc::new(FakeGenerator::default());
        let service = AttachmentService::new(storage.clone(), generator.clone());
        let id = bundle(&storage, false).await;

        assert_eq!(service.attach(&id).await.unwrap(), AttachOutcome::NotReceived);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sweep_retries_failed_attachments() {
        let storage = Arc::new(MemoryStorage::new());
        let generator = Arc::new(FakeGenerator::default());
        generator.failing.store(true, Ordering::SeqCst);
        let service = AttachmentService::new(storage.clone(), generator.clone());
        let id = bundle(&storage, true).await;

        let err = service.attach(&id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::DocumentGenerationFailed { .. }));
        let report = service.sweep().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(storage.get_bundle(&id).await.unwrap().attachment_ref.is_none());

        generator.failing.store(false, Ordering::SeqCst);
        let report = service.sweep().await.unwrap();
        assert_eq!(report.attached, vec![id.clone()]);
        assert!(storage.list_unattached_bundles().await.unwrap().is_empty());
    }
}
