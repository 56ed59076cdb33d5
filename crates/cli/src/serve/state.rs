//! Application state shared across request handlers.

use custody_storage::MemoryStorage;
use custody_workflow::{EligibilityFilter, Workflow};

pub(crate) struct AppState {
    pub(crate) workflow: Workflow<MemoryStorage>,
    /// Applied by `GET /shipments/eligible` when the query gives no filter.
    pub(crate) default_filter: EligibilityFilter,
}
