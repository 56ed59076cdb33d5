//! Conformance test suite for `CustodyStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any
//! `CustodyStorage` implementation can run to verify correctness. The suite
//! covers:
//!
//! - **Tracking rows**: insertion, external-reference uniqueness, lookups
//! - **Snapshot isolation**: uncommitted writes invisible, aborted writes discarded
//! - **Conditional updates**: checkpoint compare-and-swap, version bumps
//! - **Bundles**: sequence numbering, immutable memberships, idempotent receipt
//! - **Event log**: append order, latest-event deletion, bulk deletion
//! - **Concurrency**: racing snapshots on one row produce exactly one winner
//!
//! # Usage
//!
//! ```ignore
//! use custody_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_storage().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod bundle;
mod concurrent;
mod event;
mod occ;
mod snapshot;
mod tracking;

use std::fmt;
use std::future::Future;

use crate::record::{Checkpoint, EventType, NewBundle, NewEvent, NewTracking, TrackingUpdate};
use crate::CustodyStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "tracking", "snapshot", "bundle").
    pub category: String,
    /// Test name (e.g. "insert_assigns_version_0").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(tracking::run_tracking_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(occ::run_occ_tests(&factory).await);
    results.extend(bundle::run_bundle_tests(&factory).await);
    results.extend(event::run_event_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

const TS: &str = "2025-01-01T00:00:00Z";

fn new_tracking(external_ref: &str, checkpoint: Checkpoint) -> NewTracking {
    NewTracking {
        external_ref: external_ref.to_string(),
        checkpoint,
        assignment: None,
        created_at: TS.to_string(),
        created_by: "test-user".to_string(),
    }
}

fn move_to(checkpoint: Checkpoint) -> TrackingUpdate {
    TrackingUpdate {
        checkpoint,
        cancel_requested: false,
        assignment: None,
        updated_at: "2025-01-01T00:01:00Z".to_string(),
        updated_by: "test-user".to_string(),
    }
}

fn new_bundle(checkpoint: Checkpoint) -> NewBundle {
    NewBundle {
        created_at_checkpoint: checkpoint,
        created_at: TS.to_string(),
        created_by: "test-user".to_string(),
    }
}

fn new_event(tracking_id: &str, event_type: EventType, checkpoint: Checkpoint) -> NewEvent {
    NewEvent {
        tracking_id: tracking_id.to_string(),
        event_type,
        from_actor: "delivery".to_string(),
        to_actor: "hub".to_string(),
        checkpoint,
        actor_user: "test-user".to_string(),
        occurred_at: TS.to_string(),
    }
}

/// Insert and commit a tracking row, returning its tracking id.
async fn seed_tracking<S: CustodyStorage>(
    s: &S,
    external_ref: &str,
    checkpoint: Checkpoint,
) -> Result<String, String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let row = s
        .insert_tracking(&mut snap, new_tracking(external_ref, checkpoint))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    Ok(row.tracking_id)
}
