mod error;
mod memory;
mod record;
mod traits;

pub mod conformance;

pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStorage};
pub use record::{
    document_number, Assignment, BundleRecord, Checkpoint, EventRecord, EventType,
    MembershipRecord, NewBundle, NewEvent, NewTracking, TrackingFilter, TrackingRecord,
    TrackingUpdate,
};
pub use traits::CustodyStorage;
