//! Runs the backend conformance suite against the in-memory backend.

use custody_storage::conformance::run_conformance_suite;
use custody_storage::MemoryStorage;

#[tokio::test]
async fn memory_backend_passes_conformance_suite() {
    let report = run_conformance_suite(|| async { MemoryStorage::new() }).await;
    assert!(report.total > 0);
    assert_eq!(report.failed, 0, "{report}");
}
