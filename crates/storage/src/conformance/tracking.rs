use std::future::Future;

use super::{new_tracking, seed_tracking, TestResult};
use crate::record::TrackingFilter;
use crate::{CustodyStorage, StorageError};

pub(super) async fn run_tracking_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "tracking",
            "insert_starts_at_version_0",
            insert_starts_at_version_0(factory).await,
        ),
        TestResult::from_result(
            "tracking",
            "insert_assigns_distinct_ids",
            insert_assigns_distinct_ids(factory).await,
        ),
        TestResult::from_result(
            "tracking",
            "duplicate_external_ref_rejected",
            duplicate_external_ref_rejected(factory).await,
        ),
        TestResult::from_result(
            "tracking",
            "find_by_external_ref",
            find_by_external_ref(factory).await,
        ),
        TestResult::from_result(
            "tracking",
            "get_missing_returns_not_found",
            get_missing_returns_not_found(factory).await,
        ),
        TestResult::from_result(
            "tracking",
            "list_filters_half_open_ranges",
            list_filters_half_open_ranges(factory).await,
        ),
        TestResult::from_result(
            "tracking",
            "delete_removes_row",
            delete_removes_row(factory).await,
        ),
    ]
}

async fn insert_starts_at_version_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let rec = s.get_tracking(&id).await.map_err(|e| e.to_string())?;
    if rec.version != 0 {
        return Err(format!("expected version 0, got {}", rec.version));
    }
    if rec.current_checkpoint != 2 {
        return Err(format!("expected checkpoint 2, got {}", rec.current_checkpoint));
    }
    if rec.cancel_requested {
        return Err("new row must not be cancel-pending".to_string());
    }
    Ok(())
}

async fn insert_assigns_distinct_ids<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed_tracking(&s, "SJ-1", 2).await?;
    let b = seed_tracking(&s, "SJ-2", 2).await?;
    if a == b {
        return Err(format!("both rows got tracking id {a}"));
    }
    Ok(())
}

/// A second live row for an already-tracked external reference is rejected.
async fn duplicate_external_ref_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_tracking(&s, "SJ-1", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.insert_tracking(&mut snap, new_tracking("SJ-1", 2)).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyTracked { external_ref }) if external_ref == "SJ-1" => Ok(()),
        Err(e) => Err(format!("expected AlreadyTracked, got {e}")),
        Ok(_) => Err("expected AlreadyTracked, insert succeeded".to_string()),
    }
}

async fn find_by_external_ref<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-7", 2).await?;

    let found = s.find_tracking("SJ-7").await.map_err(|e| e.to_string())?;
    match found {
        Some(rec) if rec.tracking_id == id => {}
        other => return Err(format!("expected row {id}, got {other:?}")),
    }
    let missing = s.find_tracking("SJ-8").await.map_err(|e| e.to_string())?;
    if missing.is_some() {
        return Err("unexpected row for untracked reference".to_string());
    }
    Ok(())
}

async fn get_missing_returns_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_tracking("nope").await {
        Err(StorageError::TrackingNotFound { .. }) => Ok(()),
        Err(e) => Err(format!("expected TrackingNotFound, got {e}")),
        Ok(_) => Err("expected TrackingNotFound, got a row".to_string()),
    }
}

async fn list_filters_half_open_ranges<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_tracking(&s, "SJ-2", 2).await?;
    seed_tracking(&s, "SJ-3", 3).await?;
    seed_tracking(&s, "SJ-4", 4).await?;

    let rows = s
        .list_tracking(&TrackingFilter::ranges(vec![2..4]))
        .await
        .map_err(|e| e.to_string())?;
    let mut refs: Vec<_> = rows.iter().map(|r| r.external_ref.as_str()).collect();
    refs.sort();
    if refs != ["SJ-2", "SJ-3"] {
        return Err(format!("expected [SJ-2, SJ-3], got {refs:?}"));
    }

    let all = s
        .list_tracking(&TrackingFilter::default())
        .await
        .map_err(|e| e.to_string())?;
    if all.len() != 3 {
        return Err(format!("expected 3 rows unfiltered, got {}", all.len()));
    }
    Ok(())
}

async fn delete_removes_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.delete_tracking(&mut snap, &id)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if s.find_tracking("SJ-1").await.map_err(|e| e.to_string())?.is_some() {
        return Err("row still present after delete".to_string());
    }
    // The external reference can enter the pipeline again.
    seed_tracking(&s, "SJ-1", 2).await?;
    Ok(())
}
