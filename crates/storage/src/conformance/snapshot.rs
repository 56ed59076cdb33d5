//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! visible inside it, and discarded on abort.

use std::future::Future;

use super::{move_to, new_bundle, new_event, new_tracking, seed_tracking, TestResult};
use crate::record::{EventType, TrackingFilter};
use crate::CustodyStorage;

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "uncommitted_insert_invisible",
            uncommitted_insert_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "snapshot_reads_own_writes",
            snapshot_reads_own_writes(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_update_invisible",
            uncommitted_update_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "abort_discards_all_tables",
            abort_discards_all_tables(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "commit_publishes_all_tables",
            commit_publishes_all_tables(factory).await,
        ),
    ]
}

async fn uncommitted_insert_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.insert_tracking(&mut snap, new_tracking("SJ-1", 2))
        .await
        .map_err(|e| e.to_string())?;

    let visible = s.find_tracking("SJ-1").await.map_err(|e| e.to_string())?;
    let listed = s
        .list_tracking(&TrackingFilter::default())
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if visible.is_some() {
        return Err("uncommitted row visible to find_tracking".to_string());
    }
    if !listed.is_empty() {
        return Err(format!("uncommitted row visible to list_tracking: {listed:?}"));
    }
    Ok(())
}

async fn snapshot_reads_own_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let row = s
        .insert_tracking(&mut snap, new_tracking("SJ-1", 2))
        .await
        .map_err(|e| e.to_string())?;
    let by_ref = s
        .find_tracking_for_update(&mut snap, "SJ-1")
        .await
        .map_err(|e| e.to_string())?;
    let by_id = s
        .get_tracking_for_update(&mut snap, &row.tracking_id)
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if by_ref.as_ref() != Some(&row) {
        return Err(format!("find_tracking_for_update returned {by_ref:?}"));
    }
    if by_id != row {
        return Err(format!("get_tracking_for_update returned {by_id:?}"));
    }
    Ok(())
}

async fn uncommitted_update_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_tracking(&mut snap, &id, 2, move_to(3))
        .await
        .map_err(|e| e.to_string())?;
    let committed = s.get_tracking(&id).await.map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if committed.current_checkpoint != 2 {
        return Err(format!(
            "uncommitted update visible: checkpoint {}",
            committed.current_checkpoint
        ));
    }
    Ok(())
}

/// Tracking, bundle, membership and event writes are all dropped by abort.
async fn abort_discards_all_tables<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let row = s
        .insert_tracking(&mut snap, new_tracking("SJ-1", 2))
        .await
        .map_err(|e| e.to_string())?;
    let bundle = s
        .insert_bundle(&mut snap, new_bundle(2))
        .await
        .map_err(|e| e.to_string())?;
    s.insert_membership(&mut snap, &bundle.bundle_id, &row.tracking_id)
        .await
        .map_err(|e| e.to_string())?;
    s.append_event(&mut snap, new_event(&row.tracking_id, EventType::Handover, 2))
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if s.find_tracking("SJ-1").await.map_err(|e| e.to_string())?.is_some() {
        return Err("tracking row survived abort".to_string());
    }
    if s.get_bundle(&bundle.bundle_id).await.is_ok() {
        return Err("bundle survived abort".to_string());
    }
    let events = s
        .list_events(&row.tracking_id)
        .await
        .map_err(|e| e.to_string())?;
    if !events.is_empty() {
        return Err(format!("events survived abort: {events:?}"));
    }
    Ok(())
}

async fn commit_publishes_all_tables<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let row = s
        .insert_tracking(&mut snap, new_tracking("SJ-1", 2))
        .await
        .map_err(|e| e.to_string())?;
    let bundle = s
        .insert_bundle(&mut snap, new_bundle(2))
        .await
        .map_err(|e| e.to_string())?;
    s.insert_membership(&mut snap, &bundle.bundle_id, &row.tracking_id)
        .await
        .map_err(|e| e.to_string())?;
    s.append_event(&mut snap, new_event(&row.tracking_id, EventType::Handover, 2))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let members = s
        .list_bundle_members(&bundle.bundle_id)
        .await
        .map_err(|e| e.to_string())?;
    if members != vec![row.tracking_id.clone()] {
        return Err(format!("unexpected members {members:?}"));
    }
    let events = s
        .list_events(&row.tracking_id)
        .await
        .map_err(|e| e.to_string())?;
    if events.len() != 1 || events[0].event_type != EventType::Handover {
        return Err(format!("expected one HANDOVER event, got {events:?}"));
    }
    Ok(())
}
