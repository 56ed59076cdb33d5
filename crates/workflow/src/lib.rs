//! Checkpoint workflow engine for shipment custody handovers.
//!
//! Shipments move through a linear pipeline of stages; each move is a
//! HANDOVER by the current custodian followed by an ACCEPTANCE by the
//! receiver. [`Workflow`] applies those transitions against a
//! [`custody_storage::CustodyStorage`] backend, groups shipments into
//! bundles, keeps the event log and runs the cancellation protocol.

pub mod actor;
pub mod bundle;
mod cancel;
pub mod clock;
pub mod document;
mod engine;
pub mod error;
pub mod event_log;
pub mod hook;
pub mod master;
mod reconcile;
pub mod stage;
mod transition;

pub use actor::{Actor, ActorUser};
pub use bundle::{BundleMember, BundleView};
pub use cancel::{CancelOutcome, CancelResolution};
pub use document::{
    spawn_attachment_worker, AttachOutcome, AttachmentQueue, AttachmentService, DocumentError,
    DocumentFailure, DocumentGenerator, DocumentRequest, SweepReport,
};
pub use engine::{DocumentDispatch, Workflow, MAX_COMMIT_ATTEMPTS};
pub use error::WorkflowError;
pub use hook::{AssignmentHook, HandoverContext, HookRegistry, StageHook, StagePatch};
pub use master::static_master::StaticMaster;
pub use master::{EligibilityFilter, MasterError, MasterShipment, MasterSource};
pub use reconcile::{reconcile, EligibleShipment};
pub use stage::{Stage, StageKind, StageTable, StageTableError, UNTRACKED_CHECKPOINT};
pub use transition::{AcceptOutcome, AcceptTarget, HandoverOutcome};
