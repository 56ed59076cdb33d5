use std::future::Future;

use super::{new_event, seed_tracking, TestResult};
use crate::record::EventType;
use crate::CustodyStorage;

pub(super) async fn run_event_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "event",
            "event_ids_are_increasing",
            event_ids_are_increasing(factory).await,
        ),
        TestResult::from_result(
            "event",
            "delete_latest_targets_newest_of_type",
            delete_latest_targets_newest_of_type(factory).await,
        ),
        TestResult::from_result(
            "event",
            "delete_latest_without_match_is_none",
            delete_latest_without_match_is_none(factory).await,
        ),
        TestResult::from_result(
            "event",
            "delete_events_scoped_to_tracking_row",
            delete_events_scoped_to_tracking_row(factory).await,
        ),
    ]
}

async fn event_ids_are_increasing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let a = s
        .append_event(&mut snap, new_event(&id, EventType::Handover, 2))
        .await
        .map_err(|e| e.to_string())?;
    let b = s
        .append_event(&mut snap, new_event(&id, EventType::Acceptance, 2))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if b.event_id <= a.event_id {
        return Err(format!("event ids not increasing: {} then {}", a.event_id, b.event_id));
    }
    let listed = s.list_events(&id).await.map_err(|e| e.to_string())?;
    let ids: Vec<_> = listed.iter().map(|e| e.event_id).collect();
    if ids != [a.event_id, b.event_id] {
        return Err(format!("list_events out of order: {ids:?}"));
    }
    Ok(())
}

/// Two HANDOVER events and one ACCEPTANCE between them; deleting the latest
/// HANDOVER removes only the second HANDOVER.
async fn delete_latest_targets_newest_of_type<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let first = s
        .append_event(&mut snap, new_event(&id, EventType::Handover, 2))
        .await
        .map_err(|e| e.to_string())?;
    let acceptance = s
        .append_event(&mut snap, new_event(&id, EventType::Acceptance, 2))
        .await
        .map_err(|e| e.to_string())?;
    let second = s
        .append_event(&mut snap, new_event(&id, EventType::Handover, 4))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let removed = s
        .delete_latest_event(&mut snap, &id, EventType::Handover)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if removed.as_ref().map(|e| e.event_id) != Some(second.event_id) {
        return Err(format!("expected to remove {}, removed {removed:?}", second.event_id));
    }
    let remaining: Vec<_> = s
        .list_events(&id)
        .await
        .map_err(|e| e.to_string())?
        .iter()
        .map(|e| e.event_id)
        .collect();
    if remaining != [first.event_id, acceptance.event_id] {
        return Err(format!("unexpected remaining events {remaining:?}"));
    }
    Ok(())
}

async fn delete_latest_without_match_is_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.append_event(&mut snap, new_event(&id, EventType::Acceptance, 2))
        .await
        .map_err(|e| e.to_string())?;
    let removed = s
        .delete_latest_event(&mut snap, &id, EventType::Handover)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if removed.is_some() {
        return Err(format!("expected None, removed {removed:?}"));
    }
    Ok(())
}

async fn delete_events_scoped_to_tracking_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed_tracking(&s, "SJ-1", 2).await?;
    let b = seed_tracking(&s, "SJ-2", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    for id in [&a, &a, &b] {
        s.append_event(&mut snap, new_event(id, EventType::Handover, 2))
            .await
            .map_err(|e| e.to_string())?;
    }
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let removed = s
        .delete_events(&mut snap, &a)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if removed.len() != 2 {
        return Err(format!("expected 2 removed events, got {}", removed.len()));
    }
    if !s.list_events(&a).await.map_err(|e| e.to_string())?.is_empty() {
        return Err("events for deleted row remain".to_string());
    }
    if s.list_events(&b).await.map_err(|e| e.to_string())?.len() != 1 {
        return Err("events for another row were removed".to_string());
    }
    Ok(())
}
