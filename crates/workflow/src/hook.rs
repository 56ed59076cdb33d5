//! Per-stage hooks.
//!
//! Checkpoint-specific behavior (transport assignment today, geolocation
//! capture later) is attached to stages as hooks instead of being branched
//! on inside the transition engine. A hook inspects the handover before any
//! write and returns a [`StagePatch`] of extra fields to store on each
//! tracking row.

use std::collections::HashMap;
use std::sync::Arc;

use custody_storage::{Assignment, Checkpoint};

use crate::actor::ActorUser;
use crate::error::WorkflowError;
use crate::stage::{Stage, StageTable};

/// What a hook sees of a handover about to be applied.
#[derive(Debug)]
pub struct HandoverContext<'a> {
    pub stage: &'a Stage,
    pub actor: &'a ActorUser,
    pub external_refs: &'a [String],
    pub assignment: Option<&'a Assignment>,
}

/// Extra row fields contributed by hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagePatch {
    pub assignment: Option<Assignment>,
}

impl StagePatch {
    fn merge(&mut self, other: StagePatch) {
        if other.assignment.is_some() {
            self.assignment = other.assignment;
        }
    }
}

pub trait StageHook: Send + Sync {
    fn name(&self) -> &str;

    /// Validate the handover and contribute row fields. An error rejects
    /// the whole batch.
    fn before_handover(&self, ctx: &HandoverContext<'_>) -> Result<StagePatch, WorkflowError>;
}

/// Requires a courier and vehicle on handover and records them on the rows.
#[derive(Debug, Default)]
pub struct AssignmentHook;

impl StageHook for AssignmentHook {
    fn name(&self) -> &str {
        "assignment"
    }

    fn before_handover(&self, ctx: &HandoverContext<'_>) -> Result<StagePatch, WorkflowError> {
        match ctx.assignment {
            Some(a) if !a.courier.trim().is_empty() && !a.vehicle.trim().is_empty() => {
                Ok(StagePatch {
                    assignment: Some(a.clone()),
                })
            }
            _ => Err(WorkflowError::AssignmentRequired {
                checkpoint: ctx.stage.checkpoint,
            }),
        }
    }
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<Checkpoint, Vec<Arc<dyn StageHook>>>,
}

impl HookRegistry {
    /// Registry with the built-in hooks the table asks for.
    pub fn for_table(table: &StageTable) -> Self {
        let mut registry = HookRegistry::default();
        for stage in table.stages().filter(|s| s.captures_assignment) {
            registry.register(stage.checkpoint, Arc::new(AssignmentHook));
        }
        registry
    }

    pub fn register(&mut self, checkpoint: Checkpoint, hook: Arc<dyn StageHook>) {
        self.hooks.entry(checkpoint).or_default().push(hook);
    }

    pub fn hook_names(&self, checkpoint: Checkpoint) -> Vec<&str> {
        self.hooks
            .get(&checkpoint)
            .map(|hooks| hooks.iter().map(|h| h.name()).collect())
            .unwrap_or_default()
    }

    /// Run every hook of the target stage in registration order.
    pub fn prepare(&self, ctx: &HandoverContext<'_>) -> Result<StagePatch, WorkflowError> {
        let mut patch = StagePatch::default();
        if let Some(hooks) = self.hooks.get(&ctx.stage.checkpoint) {
            for hook in hooks {
                patch.merge(hook.before_handover(ctx)?);
            }
        }
        Ok(patch)
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut checkpoints: Vec<_> = self.hooks.keys().collect();
        checkpoints.sort();
        f.debug_struct("HookRegistry")
            .field("checkpoints", &checkpoints)
            .finish()
    }
}
