//! Conditional-update conformance tests.
//!
//! `update_tracking` is a compare-and-swap on the row's checkpoint; every
//! successful update bumps the version, and a snapshot whose written rows,
//! or rows it read for update, were changed underneath it cannot commit.

use std::future::Future;

use super::{move_to, seed_tracking, TestResult};
use crate::record::{Assignment, TrackingUpdate};
use crate::{CustodyStorage, StorageError};

pub(super) async fn run_occ_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "occ",
            "update_at_expected_checkpoint_succeeds",
            update_at_expected_checkpoint_succeeds(factory).await,
        ),
        TestResult::from_result(
            "occ",
            "update_at_wrong_checkpoint_conflicts",
            update_at_wrong_checkpoint_conflicts(factory).await,
        ),
        TestResult::from_result(
            "occ",
            "update_missing_row_not_found",
            update_missing_row_not_found(factory).await,
        ),
        TestResult::from_result(
            "occ",
            "assignment_kept_unless_replaced",
            assignment_kept_unless_replaced(factory).await,
        ),
        TestResult::from_result(
            "occ",
            "stale_snapshot_cannot_commit",
            stale_snapshot_cannot_commit(factory).await,
        ),
        TestResult::from_result(
            "occ",
            "moved_read_row_blocks_commit",
            moved_read_row_blocks_commit(factory).await,
        ),
    ]
}

async fn update_at_expected_checkpoint_succeeds<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let updated = s
        .update_tracking(&mut snap, &id, 2, move_to(3))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if updated.version != 1 {
        return Err(format!("expected returned version 1, got {}", updated.version));
    }
    let rec = s.get_tracking(&id).await.map_err(|e| e.to_string())?;
    if rec.current_checkpoint != 3 || rec.version != 1 {
        return Err(format!(
            "expected checkpoint 3 at version 1, got {} at {}",
            rec.current_checkpoint, rec.version
        ));
    }
    if rec.updated_at != "2025-01-01T00:01:00Z" {
        return Err(format!("updated_at not written: {}", rec.updated_at));
    }
    Ok(())
}

async fn update_at_wrong_checkpoint_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 3).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.update_tracking(&mut snap, &id, 2, move_to(3)).await;
    let _ = s.abort_snapshot(snap).await;

    match result {
        Err(StorageError::ConcurrentConflict {
            expected_checkpoint: 2,
            ..
        }) => Ok(()),
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
        Ok(_) => Err("expected ConcurrentConflict, update succeeded".to_string()),
    }
}

async fn update_missing_row_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.update_tracking(&mut snap, "missing", 2, move_to(3)).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::TrackingNotFound { .. }) => Ok(()),
        Err(e) => Err(format!("expected TrackingNotFound, got {e}")),
        Ok(_) => Err("expected TrackingNotFound, update succeeded".to_string()),
    }
}

async fn assignment_kept_unless_replaced<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 3).await?;
    let assignment = Assignment {
        courier: "drv-9".to_string(),
        vehicle: "B 1234 XY".to_string(),
    };

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_tracking(
        &mut snap,
        &id,
        3,
        TrackingUpdate {
            assignment: Some(assignment.clone()),
            ..move_to(4)
        },
    )
    .await
    .map_err(|e| e.to_string())?;
    s.update_tracking(&mut snap, &id, 4, move_to(5))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let rec = s.get_tracking(&id).await.map_err(|e| e.to_string())?;
    if rec.assignment != Some(assignment) {
        return Err(format!("assignment lost: {:?}", rec.assignment));
    }
    if rec.version != 2 {
        return Err(format!("expected version 2, got {}", rec.version));
    }
    Ok(())
}

/// Two snapshots read the same row; the first commits an update, the second
/// (which also updated the row) must fail to commit.
async fn stale_snapshot_cannot_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let mut first = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut second = s.begin_snapshot().await.map_err(|e| e.to_string())?;

    s.update_tracking(&mut first, &id, 2, move_to(3))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(first).await.map_err(|e| e.to_string())?;

    let second_result = match s.update_tracking(&mut second, &id, 2, move_to(3)).await {
        Ok(_) => s.commit_snapshot(second).await,
        Err(e) => {
            let _ = s.abort_snapshot(second).await;
            Err(e)
        }
    };
    match second_result {
        Err(StorageError::ConcurrentConflict { .. }) => {}
        Err(e) => return Err(format!("expected ConcurrentConflict, got {e}")),
        Ok(()) => return Err("stale snapshot committed".to_string()),
    }

    let rec = s.get_tracking(&id).await.map_err(|e| e.to_string())?;
    if rec.version != 1 {
        return Err(format!("expected a single applied update, version {}", rec.version));
    }
    Ok(())
}

/// A snapshot reads one row for update and writes another. If the row it read
/// is moved by a committed snapshot in between, its commit must conflict.
async fn moved_read_row_blocks_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let read_id = seed_tracking(&s, "SJ-1", 2).await?;
    let write_id = seed_tracking(&s, "SJ-2", 2).await?;

    let mut reader = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.get_tracking_for_update(&mut reader, &read_id)
        .await
        .map_err(|e| e.to_string())?;
    s.update_tracking(&mut reader, &write_id, 2, move_to(3))
        .await
        .map_err(|e| e.to_string())?;

    let mut mover = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.update_tracking(&mut mover, &read_id, 2, move_to(3))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(mover).await.map_err(|e| e.to_string())?;

    match s.commit_snapshot(reader).await {
        Err(StorageError::ConcurrentConflict { tracking_id, .. }) if tracking_id == read_id => {}
        Err(e) => return Err(format!("expected ConcurrentConflict on {read_id}, got {e}")),
        Ok(()) => return Err("snapshot committed over a moved read row".to_string()),
    }

    let untouched = s.get_tracking(&write_id).await.map_err(|e| e.to_string())?;
    if untouched.current_checkpoint != 2 {
        return Err(format!(
            "write from the conflicting snapshot leaked: checkpoint {}",
            untouched.current_checkpoint
        ));
    }
    Ok(())
}
