//! Declarative stage table.
//!
//! Each checkpoint of the custody pipeline is described by one [`Stage`]:
//! who acts there, who handed the shipment over, and which checkpoint comes
//! next. The table drives every transition; there is no per-checkpoint code.
//!
//! Checkpoints alternate between two kinds:
//! - `pending`: handed over by `from_actor`, awaiting acceptance by `acting_actor`
//! - `held`: accepted and held by `acting_actor`, awaiting the next handover

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use custody_storage::Checkpoint;
use serde::{Deserialize, Serialize};

use crate::actor::Actor;
use crate::error::WorkflowError;

/// Synthetic checkpoint of a shipment that has not entered the pipeline.
pub const UNTRACKED_CHECKPOINT: Checkpoint = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Pending,
    Held,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub checkpoint: Checkpoint,
    pub kind: StageKind,
    #[serde(rename = "from")]
    pub from_actor: Actor,
    #[serde(rename = "acting")]
    pub acting_actor: Actor,
    #[serde(default)]
    pub next: Option<Checkpoint>,
    /// Handing over into this stage requires a courier/vehicle assignment.
    #[serde(default)]
    pub captures_assignment: bool,
}

impl Stage {
    fn new(
        checkpoint: Checkpoint,
        kind: StageKind,
        from_actor: Actor,
        acting_actor: Actor,
        next: Option<Checkpoint>,
    ) -> Self {
        Stage {
            checkpoint,
            kind,
            from_actor,
            acting_actor,
            next,
            captures_assignment: false,
        }
    }
}

/// Reasons a stage list does not form a valid linear pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageTableError {
    #[error("stage table is empty")]
    Empty,
    #[error("checkpoint {0} is defined more than once")]
    DuplicateCheckpoint(Checkpoint),
    #[error("checkpoint {0} is reserved for shipments that have not entered the pipeline")]
    ReservedCheckpoint(Checkpoint),
    #[error("checkpoint {0} is out of range; the largest usable checkpoint is {max}", max = Checkpoint::MAX - 1)]
    CheckpointOutOfRange(Checkpoint),
    #[error("checkpoint {checkpoint} points to unknown next checkpoint {next}")]
    UnknownNext {
        checkpoint: Checkpoint,
        next: Checkpoint,
    },
    #[error("checkpoint {checkpoint} must advance to a higher checkpoint, not {next}")]
    NotIncreasing {
        checkpoint: Checkpoint,
        next: Checkpoint,
    },
    #[error("checkpoint {next} is the next stage of both {first} and {second}")]
    Branch {
        next: Checkpoint,
        first: Checkpoint,
        second: Checkpoint,
    },
    #[error("pipeline has several entry stages: {0:?}")]
    MultipleEntries(Vec<Checkpoint>),
    #[error("checkpoints {0:?} are not reachable from the entry stage")]
    Unreachable(Vec<Checkpoint>),
    #[error("entry stage {0} must be a pending (handover) stage")]
    EntryNotPending(Checkpoint),
    #[error("stage {checkpoint} ({kind:?}) must be followed by the opposite kind")]
    BrokenAlternation {
        checkpoint: Checkpoint,
        kind: StageKind,
    },
    #[error("pending stage {0} has no next stage")]
    PendingWithoutNext(Checkpoint),
    #[error("stage {0} captures an assignment but is not a pending stage")]
    AssignmentOnHeld(Checkpoint),
    #[error("re-entry checkpoint {0} is not a held stage of the table")]
    InvalidReentry(Checkpoint),
}

/// A validated linear chain of stages.
#[derive(Debug, Clone)]
pub struct StageTable {
    stages: BTreeMap<Checkpoint, Stage>,
    previous: HashMap<Checkpoint, Checkpoint>,
    entry: Checkpoint,
    reentry: Option<Checkpoint>,
}

impl StageTable {
    /// Build a table, checking that the stages form one linear chain with
    /// increasing checkpoints that alternates pending and held stages.
    pub fn new(stages: Vec<Stage>) -> Result<Self, StageTableError> {
        if stages.is_empty() {
            return Err(StageTableError::Empty);
        }

        let mut by_checkpoint = BTreeMap::new();
        for stage in stages {
            if stage.checkpoint == UNTRACKED_CHECKPOINT {
                return Err(StageTableError::ReservedCheckpoint(stage.checkpoint));
            }
            if stage.checkpoint == Checkpoint::MAX {
                return Err(StageTableError::CheckpointOutOfRange(stage.checkpoint));
            }
            if stage.captures_assignment && stage.kind != StageKind::Pending {
                return Err(StageTableError::AssignmentOnHeld(stage.checkpoint));
            }
            let checkpoint = stage.checkpoint;
            if by_checkpoint.insert(checkpoint, stage).is_some() {
                return Err(StageTableError::DuplicateCheckpoint(checkpoint));
            }
        }

        let mut previous = HashMap::new();
        for stage in by_checkpoint.values() {
            let Some(next) = stage.next else {
                if stage.kind == StageKind::Pending {
                    return Err(StageTableError::PendingWithoutNext(stage.checkpoint));
                }
                continue;
            };
            let Some(next_stage) = by_checkpoint.get(&next) else {
                return Err(StageTableError::UnknownNext {
                    checkpoint: stage.checkpoint,
                    next,
                });
            };
            if next <= stage.checkpoint {
                return Err(StageTableError::NotIncreasing {
                    checkpoint: stage.checkpoint,
                    next,
                });
            }
            if next_stage.kind == stage.kind {
                return Err(StageTableError::BrokenAlternation {
                    checkpoint: stage.checkpoint,
                    kind: stage.kind,
                });
            }
            if let Some(first) = previous.insert(next, stage.checkpoint) {
                return Err(StageTableError::Branch {
                    next,
                    first,
                    second: stage.checkpoint,
                });
            }
        }

        let entries: Vec<Checkpoint> = by_checkpoint
            .keys()
            .copied()
            .filter(|cp| !previous.contains_key(cp))
            .collect();
        // Strictly increasing `next` rules out cycles, so there is at least one entry.
        if entries.len() > 1 {
            return Err(StageTableError::MultipleEntries(entries));
        }
        let entry = entries[0];
        if by_checkpoint[&entry].kind != StageKind::Pending {
            return Err(StageTableError::EntryNotPending(entry));
        }

        let mut reached = HashSet::new();
        let mut cursor = Some(entry);
        while let Some(cp) = cursor {
            reached.insert(cp);
            cursor = by_checkpoint.get(&cp).and_then(|s| s.next);
        }
        let unreachable: Vec<Checkpoint> = by_checkpoint
            .keys()
            .copied()
            .filter(|cp| !reached.contains(cp))
            .collect();
        if !unreachable.is_empty() {
            return Err(StageTableError::Unreachable(unreachable));
        }

        Ok(StageTable {
            stages: by_checkpoint,
            previous,
            entry,
            reentry: None,
        })
    }

    /// Name a held checkpoint whose shipments may be handed over to the entry
    /// stage again ("returned to entry").
    pub fn with_reentry(mut self, checkpoint: Checkpoint) -> Result<Self, StageTableError> {
        match self.stages.get(&checkpoint) {
            Some(stage) if stage.kind == StageKind::Held => {
                self.reentry = Some(checkpoint);
                Ok(self)
            }
            _ => Err(StageTableError::InvalidReentry(checkpoint)),
        }
    }

    /// The delivery → hub → driver → hub → delivery → marketing → finance
    /// pipeline.
    pub fn default_pipeline() -> Self {
        use Actor::*;
        use StageKind::*;

        let mut stages = vec![
            Stage::new(2, Pending, Delivery, Hub, Some(3)),
            Stage::new(3, Held, Delivery, Hub, Some(4)),
            Stage::new(4, Pending, Hub, Driver, Some(5)),
            Stage::new(5, Held, Hub, Driver, Some(6)),
            Stage::new(6, Pending, Driver, Hub, Some(7)),
            Stage::new(7, Held, Driver, Hub, Some(8)),
            Stage::new(8, Pending, Hub, Delivery, Some(9)),
            Stage::new(9, Held, Hub, Delivery, Some(10)),
            Stage::new(10, Pending, Delivery, Marketing, Some(11)),
            Stage::new(11, Held, Delivery, Marketing, Some(12)),
            Stage::new(12, Pending, Marketing, Finance, Some(13)),
            Stage::new(13, Held, Marketing, Finance, None),
        ];
        stages[2].captures_assignment = true;

        Self::new(stages).expect("default pipeline is a valid linear chain")
    }

    /// Look up the stage for a checkpoint.
    pub fn stage_for(&self, checkpoint: Checkpoint) -> Result<&Stage, WorkflowError> {
        self.stages
            .get(&checkpoint)
            .ok_or_else(|| WorkflowError::InvalidCheckpoint {
                checkpoint,
                reason: "no such stage".to_string(),
            })
    }

    /// The checkpoint whose `next` is `checkpoint`, or `None` at the entry stage.
    pub fn previous_checkpoint_of(&self, checkpoint: Checkpoint) -> Option<Checkpoint> {
        self.previous.get(&checkpoint).copied()
    }

    pub fn entry_checkpoint(&self) -> Checkpoint {
        self.entry
    }

    pub fn reentry_checkpoint(&self) -> Option<Checkpoint> {
        self.reentry
    }

    /// Stages in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values()
    }

    /// Half-open checkpoint ranges in which `actor` is the acting party,
    /// i.e. the shipments waiting on that actor to accept or hand over.
    pub fn outstanding_ranges(&self, actor: Actor) -> Vec<Range<Checkpoint>> {
        let mut ranges: Vec<Range<Checkpoint>> = Vec::new();
        let mut open: Option<Range<Checkpoint>> = None;
        for stage in self.stages.values() {
            if stage.acting_actor == actor {
                open = Some(match open {
                    Some(range) => range.start..stage.checkpoint + 1,
                    None => stage.checkpoint..stage.checkpoint + 1,
                });
            } else if let Some(range) = open.take() {
                ranges.push(range);
            }
        }
        ranges.extend(open);
        ranges
    }
}

impl Default for StageTable {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(cp: Checkpoint, kind: StageKind, next: Option<Checkpoint>) -> Stage {
        Stage::new(cp, kind, Actor::Delivery, Actor::Hub, next)
    }

    #[test]
    fn default_pipeline_lookups() {
        let table = StageTable::default_pipeline();
        assert_eq!(table.entry_checkpoint(), 2);
        assert_eq!(table.previous_checkpoint_of(2), None);
        assert_eq!(table.previous_checkpoint_of(5), Some(4));
        let stage = table.stage_for(4).unwrap();
        assert_eq!(stage.from_actor, Actor::Hub);
        assert_eq!(stage.acting_actor, Actor::Driver);
        assert!(stage.captures_assignment);
        assert_eq!(table.stage_for(13).unwrap().next, None);
    }

    #[test]
    fn unknown_checkpoint_is_invalid() {
        let table = StageTable::default_pipeline();
        assert!(matches!(
            table.stage_for(42),
            Err(WorkflowError::InvalidCheckpoint { checkpoint: 42, .. })
        ));
        assert!(table.stage_for(UNTRACKED_CHECKPOINT).is_err());
    }

    #[test]
    fn outstanding_ranges_collapse_contiguous_stages() {
        let table = StageTable::default_pipeline();
        assert_eq!(table.outstanding_ranges(Actor::Hub), vec![2..4, 6..8]);
        assert_eq!(table.outstanding_ranges(Actor::Driver), vec![4..6]);
        assert_eq!(table.outstanding_ranges(Actor::Finance), vec![12..14]);
    }

    #[test]
    fn rejects_branches() {
        let err = StageTable::new(vec![
            stage(2, StageKind::Pending, Some(3)),
            stage(3, StageKind::Held, None),
            stage(4, StageKind::Pending, Some(3)),
        ])
        .unwrap_err();
        assert!(matches!(err, StageTableError::Branch { next: 3, .. }));
    }

    #[test]
    fn rejects_decreasing_next() {
        let err = StageTable::new(vec![
            stage(4, StageKind::Pending, Some(3)),
            stage(3, StageKind::Held, None),
        ])
        .unwrap_err();
        assert_eq!(err, StageTableError::NotIncreasing { checkpoint: 4, next: 3 });
    }

    #[test]
    fn rejects_disconnected_stages() {
        let err = StageTable::new(vec![
            stage(2, StageKind::Pending, Some(3)),
            stage(3, StageKind::Held, None),
            stage(6, StageKind::Pending, Some(7)),
            stage(7, StageKind::Held, None),
        ])
        .unwrap_err();
        assert_eq!(err, StageTableError::MultipleEntries(vec![2, 6]));
    }

    #[test]
    fn rejects_last_representable_checkpoint() {
        let stages = vec![
            stage(2, StageKind::Pending, Some(Checkpoint::MAX)),
            stage(Checkpoint::MAX, StageKind::Held, None),
        ];
        assert_eq!(
            StageTable::new(stages).unwrap_err(),
            StageTableError::CheckpointOutOfRange(Checkpoint::MAX)
        );

        let table = StageTable::new(vec![
            stage(2, StageKind::Pending, Some(Checkpoint::MAX - 1)),
            stage(Checkpoint::MAX - 1, StageKind::Held, None),
        ])
        .unwrap();
        assert_eq!(
            table.outstanding_ranges(Actor::Hub),
            vec![2..Checkpoint::MAX]
        );
    }

    #[test]
    fn rejects_reserved_and_held_entry() {
        assert_eq!(
            StageTable::new(vec![stage(1, StageKind::Pending, None)]).unwrap_err(),
            StageTableError::ReservedCheckpoint(1)
        );
        assert_eq!(
            StageTable::new(vec![stage(2, StageKind::Held, None)]).unwrap_err(),
            StageTableError::EntryNotPending(2)
        );
        assert_eq!(
            StageTable::new(vec![stage(2, StageKind::Pending, None)]).unwrap_err(),
            StageTableError::PendingWithoutNext(2)
        );
    }

    #[test]
    fn reentry_must_be_held() {
        assert!(StageTable::default_pipeline().with_reentry(9).is_ok());
        assert_eq!(
            StageTable::default_pipeline().with_reentry(8).unwrap_err(),
            StageTableError::InvalidReentry(8)
        );
    }

    #[test]
    fn stages_deserialize_from_toml_shape() {
        let json = serde_json::json!({
            "checkpoint": 4, "kind": "pending", "from": "hub", "acting": "driver",
            "next": 5, "captures_assignment": true
        });
        let stage: Stage = serde_json::from_value(json).unwrap();
        assert_eq!(stage.from_actor, Actor::Hub);
        assert!(stage.captures_assignment);
    }
}
