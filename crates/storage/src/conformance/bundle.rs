use std::future::Future;

use super::{new_bundle, seed_tracking, TestResult};
use crate::record::document_number;
use crate::{CustodyStorage, StorageError};

pub(super) async fn run_bundle_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "bundle",
            "document_numbers_are_sequential",
            document_numbers_are_sequential(factory).await,
        ),
        TestResult::from_result(
            "bundle",
            "duplicate_membership_rejected",
            duplicate_membership_rejected(factory).await,
        ),
        TestResult::from_result(
            "bundle",
            "membership_requires_bundle",
            membership_requires_bundle(factory).await,
        ),
        TestResult::from_result(
            "bundle",
            "bundles_containing_spans_stages",
            bundles_containing_spans_stages(factory).await,
        ),
        TestResult::from_result(
            "bundle",
            "mark_received_is_idempotent",
            mark_received_is_idempotent(factory).await,
        ),
        TestResult::from_result(
            "bundle",
            "list_bundles_by_checkpoint",
            list_bundles_by_checkpoint(factory).await,
        ),
        TestResult::from_result(
            "bundle",
            "attach_document_keeps_first_reference",
            attach_document_keeps_first_reference(factory).await,
        ),
    ]
}

async fn document_numbers_are_sequential<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let first = s
        .insert_bundle(&mut snap, new_bundle(2))
        .await
        .map_err(|e| e.to_string())?;
    let second = s
        .insert_bundle(&mut snap, new_bundle(2))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if first.document_number != document_number(1) {
        return Err(format!("expected HG000001, got {}", first.document_number));
    }
    if second.document_number != document_number(2) {
        return Err(format!("expected HG000002, got {}", second.document_number));
    }
    if first.received_at.is_some() || first.attachment_ref.is_some() {
        return Err("new bundle must be unreceived and unattached".to_string());
    }
    Ok(())
}

async fn duplicate_membership_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let bundle = s
        .insert_bundle(&mut snap, new_bundle(2))
        .await
        .map_err(|e| e.to_string())?;
    s.insert_membership(&mut snap, &bundle.bundle_id, &id)
        .await
        .map_err(|e| e.to_string())?;
    let again = s.insert_membership(&mut snap, &bundle.bundle_id, &id).await;
    let _ = s.abort_snapshot(snap).await;

    match again {
        Err(StorageError::DuplicateMembership { .. }) => Ok(()),
        Err(e) => Err(format!("expected DuplicateMembership, got {e}")),
        Ok(()) => Err("duplicate membership accepted".to_string()),
    }
}

async fn membership_requires_bundle<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s.insert_membership(&mut snap, "no-such-bundle", &id).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::BundleNotFound { .. }) => Ok(()),
        Err(e) => Err(format!("expected BundleNotFound, got {e}")),
        Ok(()) => Err("membership without bundle accepted".to_string()),
    }
}

/// A shipment transiting two stages belongs to two bundles; the first link
/// survives the second.
async fn bundles_containing_spans_stages<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_tracking(&s, "SJ-1", 2).await?;

    for checkpoint in [2, 4] {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        let bundle = s
            .insert_bundle(&mut snap, new_bundle(checkpoint))
            .await
            .map_err(|e| e.to_string())?;
        s.insert_membership(&mut snap, &bundle.bundle_id, &id)
            .await
            .map_err(|e| e.to_string())?;
        s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    }

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let bundles = s
        .bundles_containing(&mut snap, &id)
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    let mut checkpoints: Vec<_> = bundles.iter().map(|b| b.created_at_checkpoint).collect();
    checkpoints.sort();
    if checkpoints != [2, 4] {
        return Err(format!("expected bundles at [2, 4], got {checkpoints:?}"));
    }
    Ok(())
}

async fn mark_received_is_idempotent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let bundle = s
        .insert_bundle(&mut snap, new_bundle(2))
        .await
        .map_err(|e| e.to_string())?;
    let first = s
        .mark_bundle_received(&mut snap, &bundle.bundle_id, "hub-1", "2025-01-02T00:00:00Z")
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let second = s
        .mark_bundle_received(&mut snap, &bundle.bundle_id, "hub-2", "2025-01-03T00:00:00Z")
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if !first || second {
        return Err(format!("expected (true, false), got ({first}, {second})"));
    }
    let rec = s
        .get_bundle(&bundle.bundle_id)
        .await
        .map_err(|e| e.to_string())?;
    if rec.received_at.as_deref() != Some("2025-01-02T00:00:00Z")
        || rec.received_by.as_deref() != Some("hub-1")
    {
        return Err(format!(
            "receipt overwritten: {:?} by {:?}",
            rec.received_at, rec.received_by
        ));
    }
    Ok(())
}

async fn list_bundles_by_checkpoint<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    for checkpoint in [2, 4, 6] {
        s.insert_bundle(&mut snap, new_bundle(checkpoint))
            .await
            .map_err(|e| e.to_string())?;
    }
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let listed = s.list_bundles(&[2, 6]).await.map_err(|e| e.to_string())?;
    let checkpoints: Vec<_> = listed.iter().map(|b| b.created_at_checkpoint).collect();
    if checkpoints != [2, 6] {
        return Err(format!("expected [2, 6], got {checkpoints:?}"));
    }
    let all = s.list_bundles(&[]).await.map_err(|e| e.to_string())?;
    if all.len() != 3 {
        return Err(format!("expected 3 bundles, got {}", all.len()));
    }
    Ok(())
}

async fn attach_document_keeps_first_reference<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: CustodyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let bundle = s
        .insert_bundle(&mut snap, new_bundle(2))
        .await
        .map_err(|e| e.to_string())?;
    s.mark_bundle_received(&mut snap, &bundle.bundle_id, "hub-1", "2025-01-02T00:00:00Z")
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let pending = s
        .list_unattached_bundles()
        .await
        .map_err(|e| e.to_string())?;
    if pending.len() != 1 {
        return Err(format!("expected 1 unattached bundle, got {}", pending.len()));
    }

    let first = s
        .attach_document(&bundle.bundle_id, "docs/HG000001.pdf")
        .await
        .map_err(|e| e.to_string())?;
    let second = s
        .attach_document(&bundle.bundle_id, "docs/other.pdf")
        .await
        .map_err(|e| e.to_string())?;
    if !first || second {
        return Err(format!("expected (true, false), got ({first}, {second})"));
    }
    let rec = s
        .get_bundle(&bundle.bundle_id)
        .await
        .map_err(|e| e.to_string())?;
    if rec.attachment_ref.as_deref() != Some("docs/HG000001.pdf") {
        return Err(format!("unexpected attachment {:?}", rec.attachment_ref));
    }
    if !s
        .list_unattached_bundles()
        .await
        .map_err(|e| e.to_string())?
        .is_empty()
    {
        return Err("attached bundle still listed as unattached".to_string());
    }
    match s.attach_document("missing", "x").await {
        Err(StorageError::BundleNotFound { .. }) => Ok(()),
        Err(e) => Err(format!("expected BundleNotFound, got {e}")),
        Ok(_) => Err("attached to a missing bundle".to_string()),
    }
}
