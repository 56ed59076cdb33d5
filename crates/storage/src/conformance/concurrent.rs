use std::future::Future;
use std::sync::Arc;

use super::{move_to, new_tracking, seed_tracking, TestResult};
use crate::{CustodyStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_advance_exactly_one_wins",
            concurrent_advance_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_entry_exactly_one_wins",
            concurrent_entry_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_advance_different_rows_all_succeed",
            concurrent_advance_different_rows_all_succeed(factory).await,
        ),
    ]
}

/// N tasks race to accept the same shipment at checkpoint 2. Exactly one
/// commit succeeds; the rest observe a conflict either at the conditional
/// update or at commit.
async fn concurrent_advance_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let id = seed_tracking(storage.as_ref(), "SJ-1", 2).await?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            match s.update_tracking(&mut snap, &id, 2, move_to(3)).await {
                Ok(_) => match s.commit_snapshot(snap).await {
                    Ok(()) => Ok(true),
                    Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                    Err(e) => Err(e),
                },
                Err(StorageError::ConcurrentConflict { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    let rec = storage.get_tracking(&id).await.map_err(|e| e.to_string())?;
    if rec.version != 1 || rec.current_checkpoint != 3 {
        return Err(format!(
            "expected checkpoint 3 at version 1, got {} at {}",
            rec.current_checkpoint, rec.version
        ));
    }
    Ok(())
}

/// N tasks race to enter the same external reference into the pipeline.
async fn concurrent_entry_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            match s.insert_tracking(&mut snap, new_tracking("SJ-1", 2)).await {
                Ok(_) => match s.commit_snapshot(snap).await {
                    Ok(()) => Ok(true),
                    Err(StorageError::AlreadyTracked { .. }) => Ok(false),
                    Err(e) => Err(e),
                },
                Err(StorageError::AlreadyTracked { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    Ok(())
}

async fn concurrent_advance_different_rows_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let mut ids = Vec::new();
    for i in 0..N {
        ids.push(seed_tracking(storage.as_ref(), &format!("SJ-{i}"), 2).await?);
    }

    let mut handles = Vec::new();
    for id in ids.clone() {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.update_tracking(&mut snap, &id, 2, move_to(3)).await?;
            s.commit_snapshot(snap).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
    }

    for id in &ids {
        let rec = storage.get_tracking(id).await.map_err(|e| e.to_string())?;
        if rec.current_checkpoint != 3 {
            return Err(format!("{id} stuck at {}", rec.current_checkpoint));
        }
    }
    Ok(())
}
