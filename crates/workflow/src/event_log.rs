//! Transition event log.
//!
//! Events are appended inside the transition's snapshot, after all tracking
//! rows of the batch have been written. Only the cancellation compensator
//! deletes events; every deletion is emitted as an `info` trace carrying the
//! full event so the forensic trail survives in the log stream.

use std::collections::HashMap;

use custody_storage::{Checkpoint, CustodyStorage, EventRecord, EventType, NewEvent, StorageError};

use crate::actor::ActorUser;
use crate::stage::Stage;

/// Append one event for `stage`'s actor pair.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record<S: CustodyStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    tracking_id: &str,
    event_type: EventType,
    stage: &Stage,
    checkpoint: Checkpoint,
    actor: &ActorUser,
    occurred_at: &str,
) -> Result<EventRecord, StorageError> {
    storage
        .append_event(
            snapshot,
            NewEvent {
                tracking_id: tracking_id.to_string(),
                event_type,
                from_actor: stage.from_actor.as_str().to_string(),
                to_actor: stage.acting_actor.as_str().to_string(),
                checkpoint,
                actor_user: actor.user_id.clone(),
                occurred_at: occurred_at.to_string(),
            },
        )
        .await
}

pub(crate) fn log_deleted(events: &[EventRecord], reason: &str) {
    for e in events {
        tracing::info!(
            event_id = e.event_id,
            tracking_id = %e.tracking_id,
            event_type = %e.event_type,
            from_actor = %e.from_actor,
            to_actor = %e.to_actor,
            checkpoint = e.checkpoint,
            actor_user = %e.actor_user,
            occurred_at = %e.occurred_at,
            reason,
            "deleted transition event"
        );
    }
}

/// Latest event per `(event_type, from_actor, to_actor)`, in log order.
pub fn progress(events: &[EventRecord]) -> Vec<EventRecord> {
    let mut latest: HashMap<(EventType, &str, &str), &EventRecord> = HashMap::new();
    for e in events {
        let key = (e.event_type, e.from_actor.as_str(), e.to_actor.as_str());
        match latest.get(&key) {
            Some(seen) if seen.event_id > e.event_id => {}
            _ => {
                latest.insert(key, e);
            }
        }
    }
    let mut out: Vec<EventRecord> = latest.into_values().cloned().collect();
    out.sort_by_key(|e| e.event_id);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64, event_type: EventType, from: &str, to: &str, cp: Checkpoint) -> EventRecord {
        EventRecord {
            event_id: id,
            tracking_id: "TRK000001".into(),
            event_type,
            from_actor: from.into(),
            to_actor: to.into(),
            checkpoint: cp,
            actor_user: "u".into(),
            occurred_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn progress_keeps_latest_per_actor_pair() {
        let events = vec![
            event(1, EventType::Handover, "delivery", "hub", 2),
            event(2, EventType::Acceptance, "delivery", "hub", 3),
            event(3, EventType::Handover, "hub", "driver", 4),
            event(7, EventType::Handover, "delivery", "hub", 2),
        ];
        let ids: Vec<u64> = progress(&events).iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![2, 3, 7]);
    }

    #[test]
    fn progress_ignores_input_order() {
        let events = vec![
            event(5, EventType::Acceptance, "delivery", "hub", 3),
            event(4, EventType::Acceptance, "delivery", "hub", 3),
        ];
        let out = progress(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_id, 5);
    }

    #[test]
    fn progress_of_empty_history_is_empty() {
        assert!(progress(&[]).is_empty());
    }
}
