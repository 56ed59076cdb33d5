//! In-memory `CustodyStorage` backend.
//!
//! Committed state lives behind a single mutex. A snapshot takes a private
//! copy of the tables at `begin_snapshot`, applies its writes to that copy,
//! and remembers which tracking rows it touched together with the version it
//! first saw. Rows read for update are remembered the same way. On
//! `commit_snapshot` both sets are re-validated against the committed tables
//! and the write set is published only if none changed, so two snapshots
//! racing on the same row produce exactly one winner, and a decision taken
//! from rows another snapshot has since moved is retried.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{
    document_number, BundleRecord, Checkpoint, EventRecord, EventType, MembershipRecord,
    NewBundle, NewEvent, NewTracking, TrackingFilter, TrackingRecord, TrackingUpdate,
};
use crate::traits::CustodyStorage;

#[derive(Debug, Clone, Default)]
struct Tables {
    tracking: BTreeMap<String, TrackingRecord>,
    bundles: BTreeMap<String, BundleRecord>,
    memberships: Vec<MembershipRecord>,
    events: Vec<EventRecord>,
}

impl Tables {
    fn live_row_for(&self, external_ref: &str) -> Option<&TrackingRecord> {
        self.tracking
            .values()
            .find(|r| r.external_ref == external_ref)
    }
}

#[derive(Debug, Default)]
struct Sequences {
    tracking: AtomicU64,
    bundle: AtomicU64,
    event: AtomicU64,
}

impl Sequences {
    fn next(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Process-local storage backend. Cloning shares the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
    sequences: Arc<Sequences>,
}

/// An open transaction against [`MemoryStorage`].
pub struct MemorySnapshot {
    view: Tables,
    /// Tracking rows written by this snapshot, with the row as it stood when
    /// the snapshot began (`None` for rows inserted by this snapshot).
    tracking_base: HashMap<String, Option<TrackingRecord>>,
    /// Versions of rows read for update but not written.
    tracking_read: HashMap<String, i64>,
    bundles_written: HashSet<String>,
    base_memberships: usize,
    new_events: HashSet<u64>,
    deleted_events: HashSet<u64>,
}

impl MemorySnapshot {
    fn touch_tracking(&mut self, tracking_id: &str) {
        if !self.tracking_base.contains_key(tracking_id) {
            let base = self.view.tracking.get(tracking_id).cloned();
            self.tracking_base.insert(tracking_id.to_string(), base);
        }
    }

    fn note_read(&mut self, row: &TrackingRecord) {
        if !self.tracking_base.contains_key(&row.tracking_id) {
            self.tracking_read
                .entry(row.tracking_id.clone())
                .or_insert(row.version);
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))
    }

    fn validate(tables: &Tables, snapshot: &MemorySnapshot) -> Result<(), StorageError> {
        for (tracking_id, base) in &snapshot.tracking_base {
            let committed = tables.tracking.get(tracking_id);
            match (base, committed) {
                (Some(base), Some(current)) if base.version == current.version => {}
                (None, None) => {
                    if let Some(row) = snapshot.view.tracking.get(tracking_id) {
                        if tables.live_row_for(&row.external_ref).is_some() {
                            return Err(StorageError::AlreadyTracked {
                                external_ref: row.external_ref.clone(),
                            });
                        }
                    }
                }
                (base, _) => {
                    return Err(StorageError::ConcurrentConflict {
                        tracking_id: tracking_id.clone(),
                        expected_checkpoint: base
                            .as_ref()
                            .map(|b| b.current_checkpoint)
                            .unwrap_or_default(),
                    });
                }
            }
        }
        for (tracking_id, version) in &snapshot.tracking_read {
            if snapshot.tracking_base.contains_key(tracking_id) {
                continue;
            }
            let current = tables.tracking.get(tracking_id);
            if current.map(|r| r.version) != Some(*version) {
                let expected_checkpoint = snapshot
                    .view
                    .tracking
                    .get(tracking_id)
                    .map(|r| r.current_checkpoint)
                    .unwrap_or_default();
                return Err(StorageError::ConcurrentConflict {
                    tracking_id: tracking_id.clone(),
                    expected_checkpoint,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CustodyStorage for MemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        let view = self.lock()?.clone();
        let base_memberships = view.memberships.len();
        Ok(MemorySnapshot {
            view,
            tracking_base: HashMap::new(),
            tracking_read: HashMap::new(),
            bundles_written: HashSet::new(),
            base_memberships,
            new_events: HashSet::new(),
            deleted_events: HashSet::new(),
        })
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        Self::validate(&tables, &snapshot)?;

        let MemorySnapshot {
            view,
            tracking_base,
            bundles_written,
            base_memberships,
            new_events,
            deleted_events,
            ..
        } = snapshot;

        for tracking_id in tracking_base.keys() {
            match view.tracking.get(tracking_id) {
                Some(row) => {
                    tables.tracking.insert(tracking_id.clone(), row.clone());
                }
                None => {
                    tables.tracking.remove(tracking_id);
                }
            }
        }

        for bundle_id in &bundles_written {
            let Some(bundle) = view.bundles.get(bundle_id) else {
                continue;
            };
            let mut bundle = bundle.clone();
            if let Some(existing) = tables.bundles.get(bundle_id) {
                // First receipt wins; attachments arrive outside snapshots.
                if existing.received_at.is_some() {
                    bundle.received_at = existing.received_at.clone();
                    bundle.received_by = existing.received_by.clone();
                }
                if bundle.attachment_ref.is_none() {
                    bundle.attachment_ref = existing.attachment_ref.clone();
                }
            }
            tables.bundles.insert(bundle_id.clone(), bundle);
        }

        tables
            .memberships
            .extend(view.memberships.into_iter().skip(base_memberships));

        tables
            .events
            .retain(|e| !deleted_events.contains(&e.event_id));
        tables.events.extend(
            view.events
                .into_iter()
                .filter(|e| new_events.contains(&e.event_id)),
        );
        tables.events.sort_by_key(|e| e.event_id);

        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: MemorySnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert_tracking(
        &self,
        snapshot: &mut MemorySnapshot,
        record: NewTracking,
    ) -> Result<TrackingRecord, StorageError> {
        if snapshot.view.live_row_for(&record.external_ref).is_some() {
            return Err(StorageError::AlreadyTracked {
                external_ref: record.external_ref,
            });
        }
        let tracking_id = format!("TRK{:06}", Sequences::next(&self.sequences.tracking));
        snapshot.touch_tracking(&tracking_id);
        let row = TrackingRecord {
            tracking_id: tracking_id.clone(),
            external_ref: record.external_ref,
            current_checkpoint: record.checkpoint,
            cancel_requested: false,
            assignment: record.assignment,
            updated_at: record.created_at,
            updated_by: record.created_by,
            version: 0,
        };
        snapshot.view.tracking.insert(tracking_id, row.clone());
        Ok(row)
    }

    async fn get_tracking_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        tracking_id: &str,
    ) -> Result<TrackingRecord, StorageError> {
        let row = snapshot
            .view
            .tracking
            .get(tracking_id)
            .cloned()
            .ok_or_else(|| StorageError::TrackingNotFound {
                tracking_id: tracking_id.to_string(),
            })?;
        snapshot.note_read(&row);
        Ok(row)
    }

    async fn find_tracking_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        external_ref: &str,
    ) -> Result<Option<TrackingRecord>, StorageError> {
        let row = snapshot.view.live_row_for(external_ref).cloned();
        if let Some(row) = &row {
            snapshot.note_read(row);
        }
        Ok(row)
    }

    async fn update_tracking(
        &self,
        snapshot: &mut MemorySnapshot,
        tracking_id: &str,
        expected_checkpoint: Checkpoint,
        update: TrackingUpdate,
    ) -> Result<TrackingRecord, StorageError> {
        let current = snapshot
            .view
            .tracking
            .get(tracking_id)
            .ok_or_else(|| StorageError::TrackingNotFound {
                tracking_id: tracking_id.to_string(),
            })?;
        if current.current_checkpoint != expected_checkpoint {
            return Err(StorageError::ConcurrentConflict {
                tracking_id: tracking_id.to_string(),
                expected_checkpoint,
            });
        }
        snapshot.touch_tracking(tracking_id);
        let row = snapshot
            .view
            .tracking
            .get_mut(tracking_id)
            .ok_or_else(|| StorageError::TrackingNotFound {
                tracking_id: tracking_id.to_string(),
            })?;
        row.current_checkpoint = update.checkpoint;
        row.cancel_requested = update.cancel_requested;
        if update.assignment.is_some() {
            row.assignment = update.assignment;
        }
        row.updated_at = update.updated_at;
        row.updated_by = update.updated_by;
        row.version += 1;
        Ok(row.clone())
    }

    async fn delete_tracking(
        &self,
        snapshot: &mut MemorySnapshot,
        tracking_id: &str,
    ) -> Result<(), StorageError> {
        if !snapshot.view.tracking.contains_key(tracking_id) {
            return Err(StorageError::TrackingNotFound {
                tracking_id: tracking_id.to_string(),
            });
        }
        snapshot.touch_tracking(tracking_id);
        snapshot.view.tracking.remove(tracking_id);
        Ok(())
    }

    async fn insert_bundle(
        &self,
        snapshot: &mut MemorySnapshot,
        bundle: NewBundle,
    ) -> Result<BundleRecord, StorageError> {
        let seq = Sequences::next(&self.sequences.bundle);
        let record = BundleRecord {
            bundle_id: format!("bundle-{}", seq),
            document_number: document_number(seq),
            created_at_checkpoint: bundle.created_at_checkpoint,
            created_at: bundle.created_at,
            created_by: bundle.created_by,
            received_at: None,
            received_by: None,
            attachment_ref: None,
        };
        snapshot.bundles_written.insert(record.bundle_id.clone());
        snapshot
            .view
            .bundles
            .insert(record.bundle_id.clone(), record.clone());
        Ok(record)
    }

    async fn insert_membership(
        &self,
        snapshot: &mut MemorySnapshot,
        bundle_id: &str,
        tracking_id: &str,
    ) -> Result<(), StorageError> {
        if !snapshot.view.bundles.contains_key(bundle_id) {
            return Err(StorageError::BundleNotFound {
                bundle_id: bundle_id.to_string(),
            });
        }
        if !snapshot.view.tracking.contains_key(tracking_id) {
            return Err(StorageError::TrackingNotFound {
                tracking_id: tracking_id.to_string(),
            });
        }
        if snapshot
            .view
            .memberships
            .iter()
            .any(|m| m.bundle_id == bundle_id && m.tracking_id == tracking_id)
        {
            return Err(StorageError::DuplicateMembership {
                bundle_id: bundle_id.to_string(),
                tracking_id: tracking_id.to_string(),
            });
        }
        snapshot.view.memberships.push(MembershipRecord {
            bundle_id: bundle_id.to_string(),
            tracking_id: tracking_id.to_string(),
        });
        Ok(())
    }

    async fn get_bundle_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        bundle_id: &str,
    ) -> Result<BundleRecord, StorageError> {
        snapshot
            .view
            .bundles
            .get(bundle_id)
            .cloned()
            .ok_or_else(|| StorageError::BundleNotFound {
                bundle_id: bundle_id.to_string(),
            })
    }

    async fn bundle_member_ids(
        &self,
        snapshot: &mut MemorySnapshot,
        bundle_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        if !snapshot.view.bundles.contains_key(bundle_id) {
            return Err(StorageError::BundleNotFound {
                bundle_id: bundle_id.to_string(),
            });
        }
        Ok(snapshot
            .view
            .memberships
            .iter()
            .filter(|m| m.bundle_id == bundle_id)
            .map(|m| m.tracking_id.clone())
            .collect())
    }

    async fn bundles_containing(
        &self,
        snapshot: &mut MemorySnapshot,
        tracking_id: &str,
    ) -> Result<Vec<BundleRecord>, StorageError> {
        let view = &snapshot.view;
        Ok(view
            .memberships
            .iter()
            .filter(|m| m.tracking_id == tracking_id)
            .filter_map(|m| view.bundles.get(&m.bundle_id).cloned())
            .collect())
    }

    async fn mark_bundle_received(
        &self,
        snapshot: &mut MemorySnapshot,
        bundle_id: &str,
        received_by: &str,
        received_at: &str,
    ) -> Result<bool, StorageError> {
        let bundle = snapshot.view.bundles.get_mut(bundle_id).ok_or_else(|| {
            StorageError::BundleNotFound {
                bundle_id: bundle_id.to_string(),
            }
        })?;
        if bundle.received_at.is_some() {
            return Ok(false);
        }
        bundle.received_at = Some(received_at.to_string());
        bundle.received_by = Some(received_by.to_string());
        snapshot.bundles_written.insert(bundle_id.to_string());
        Ok(true)
    }

    async fn append_event(
        &self,
        snapshot: &mut MemorySnapshot,
        event: NewEvent,
    ) -> Result<EventRecord, StorageError> {
        let record = EventRecord {
            event_id: Sequences::next(&self.sequences.event),
            tracking_id: event.tracking_id,
            event_type: event.event_type,
            from_actor: event.from_actor,
            to_actor: event.to_actor,
            checkpoint: event.checkpoint,
            actor_user: event.actor_user,
            occurred_at: event.occurred_at,
        };
        snapshot.new_events.insert(record.event_id);
        snapshot.view.events.push(record.clone());
        Ok(record)
    }

    async fn delete_events(
        &self,
        snapshot: &mut MemorySnapshot,
        tracking_id: &str,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut snapshot.view.events)
            .into_iter()
            .partition(|e| e.tracking_id == tracking_id);
        snapshot.view.events = kept;
        for e in &removed {
            if !snapshot.new_events.remove(&e.event_id) {
                snapshot.deleted_events.insert(e.event_id);
            }
        }
        Ok(removed)
    }

    async fn delete_latest_event(
        &self,
        snapshot: &mut MemorySnapshot,
        tracking_id: &str,
        event_type: EventType,
    ) -> Result<Option<EventRecord>, StorageError> {
        let latest = snapshot
            .view
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.tracking_id == tracking_id && e.event_type == event_type)
            .max_by_key(|(_, e)| e.event_id)
            .map(|(idx, _)| idx);
        let Some(idx) = latest else {
            return Ok(None);
        };
        let removed = snapshot.view.events.remove(idx);
        if !snapshot.new_events.remove(&removed.event_id) {
            snapshot.deleted_events.insert(removed.event_id);
        }
        Ok(Some(removed))
    }

    async fn get_tracking(&self, tracking_id: &str) -> Result<TrackingRecord, StorageError> {
        self.lock()?
            .tracking
            .get(tracking_id)
            .cloned()
            .ok_or_else(|| StorageError::TrackingNotFound {
                tracking_id: tracking_id.to_string(),
            })
    }

    async fn find_tracking(
        &self,
        external_ref: &str,
    ) -> Result<Option<TrackingRecord>, StorageError> {
        Ok(self.lock()?.live_row_for(external_ref).cloned())
    }

    async fn list_tracking(
        &self,
        filter: &TrackingFilter,
    ) -> Result<Vec<TrackingRecord>, StorageError> {
        Ok(self
            .lock()?
            .tracking
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get_bundle(&self, bundle_id: &str) -> Result<BundleRecord, StorageError> {
        self.lock()?
            .bundles
            .get(bundle_id)
            .cloned()
            .ok_or_else(|| StorageError::BundleNotFound {
                bundle_id: bundle_id.to_string(),
            })
    }

    async fn list_bundles(
        &self,
        checkpoints: &[Checkpoint],
    ) -> Result<Vec<BundleRecord>, StorageError> {
        let mut bundles: Vec<BundleRecord> = self
            .lock()?
            .bundles
            .values()
            .filter(|b| checkpoints.is_empty() || checkpoints.contains(&b.created_at_checkpoint))
            .cloned()
            .collect();
        bundles.sort_by(|a, b| a.document_number.cmp(&b.document_number));
        Ok(bundles)
    }

    async fn list_bundle_members(&self, bundle_id: &str) -> Result<Vec<String>, StorageError> {
        let tables = self.lock()?;
        if !tables.bundles.contains_key(bundle_id) {
            return Err(StorageError::BundleNotFound {
                bundle_id: bundle_id.to_string(),
            });
        }
        Ok(tables
            .memberships
            .iter()
            .filter(|m| m.bundle_id == bundle_id)
            .map(|m| m.tracking_id.clone())
            .collect())
    }

    async fn list_unattached_bundles(&self) -> Result<Vec<BundleRecord>, StorageError> {
        Ok(self
            .lock()?
            .bundles
            .values()
            .filter(|b| b.is_received() && b.attachment_ref.is_none())
            .cloned()
            .collect())
    }

    async fn list_events(&self, tracking_id: &str) -> Result<Vec<EventRecord>, StorageError> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.tracking_id == tracking_id)
            .cloned()
            .collect())
    }

    async fn attach_document(
        &self,
        bundle_id: &str,
        attachment_ref: &str,
    ) -> Result<bool, StorageError> {
        let mut tables = self.lock()?;
        let bundle =
            tables
                .bundles
                .get_mut(bundle_id)
                .ok_or_else(|| StorageError::BundleNotFound {
                    bundle_id: bundle_id.to_string(),
                })?;
        if bundle.attachment_ref.is_some() {
            return Ok(false);
        }
        bundle.attachment_ref = Some(attachment_ref.to_string());
        Ok(true)
    }
}
