// Copyright 2023 Oxide Computer Company

use std::sync::Arc;
use std::time::Instant;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::info;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::catalog::EventType;
use crate::driver;
use crate::hook::{
    CompareKind, HookAction, HookKey, HookKind, HookSpec, MonitorState,
    MonitorSubstate,
};
use crate::waiter::wait_for_event;
use crate::OrchestratorContext;
use spareway_common::{precondition_bail, Poller, PollOutcome, Result, SpareError};

/*
 * The ordered checkpoints of a copy workflow.  `NotApplicable` sorts
 * first so a fresh context (nothing reached yet) precedes every real
 * checkpoint; it is never a legal advance target.
 *
 *   Requested -> Started -> SourceMarkedEol -> DestSwapInStart
 *     -> DestSwapInComplete -> ModeSetToMirror -> MetadataRebuildStart
 *     -> MetadataRebuildComplete -> UserRebuildStart
 *     -> DesiredPercentageRebuilt -> UserRebuildComplete
 *     -> InitiateCopyCompleteJob -> ModeSetToPassThru
 *     -> SourceSwapOutStart -> SourceSwapOutComplete -> OperationComplete
 */
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CopyState {
    NotApplicable,
    Requested,
    Started,
    SourceMarkedEol,
    DestSwapInStart,
    DestSwapInComplete,
    ModeSetToMirror,
    MetadataRebuildStart,
    MetadataRebuildComplete,
    UserRebuildStart,
    DesiredPercentageRebuilt,
    UserRebuildComplete,
    InitiateCopyCompleteJob,
    ModeSetToPassThru,
    SourceSwapOutStart,
    SourceSwapOutComplete,
    OperationComplete,
}

impl CopyState {
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    pub fn from_ordinal(ord: u8) -> Option<CopyState> {
        CopyState::iter().nth(ord as usize)
    }

    pub fn next(&self) -> Option<CopyState> {
        Self::from_ordinal(self.ordinal() + 1)
    }

    pub fn prev(&self) -> Option<CopyState> {
        self.ordinal().checked_sub(1).and_then(Self::from_ordinal)
    }
}

impl std::fmt::Display for CopyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How `advance_to` treats the target checkpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdvanceMode {
    /// Walk every intervening checkpoint and confirm each transition.
    Run,
    /// Arm a pause hook at the transition into the target, then run up to
    /// but not past it.
    PauseAndWait,
    /// Confirm a previously requested pause actually fired, then disarm.
    ValidateOnly,
}

/// The controller-side instrumentation point guarding the transition into
/// a checkpoint.  `UserRebuildComplete` deliberately shares its point with
/// the private rebuild guard; the controller cannot tell them apart.
pub fn pause_point(cs: CopyState) -> (MonitorState, MonitorSubstate) {
    use CopyState::*;
    match cs {
        NotApplicable | Requested => {
            (MonitorState::Sparing, MonitorSubstate::Requested)
        }
        Started => (MonitorState::Sparing, MonitorSubstate::Started),
        SourceMarkedEol => (MonitorState::Sparing, MonitorSubstate::EolSet),
        DestSwapInStart => (MonitorState::SwapIn, MonitorSubstate::Start),
        DestSwapInComplete => {
            (MonitorState::SwapIn, MonitorSubstate::Complete)
        }
        ModeSetToMirror => {
            (MonitorState::Mirror, MonitorSubstate::MirrorSet)
        }
        MetadataRebuildStart => {
            (MonitorState::Rebuild, MonitorSubstate::MetadataStart)
        }
        MetadataRebuildComplete => {
            (MonitorState::Rebuild, MonitorSubstate::MetadataComplete)
        }
        UserRebuildStart => (MonitorState::Rebuild, MonitorSubstate::Entry),
        DesiredPercentageRebuilt => {
            (MonitorState::Rebuild, MonitorSubstate::Checkpoint)
        }
        UserRebuildComplete => {
            (MonitorState::Rebuild, MonitorSubstate::Complete)
        }
        InitiateCopyCompleteJob => {
            (MonitorState::CopyComplete, MonitorSubstate::Initiate)
        }
        ModeSetToPassThru => {
            (MonitorState::CopyComplete, MonitorSubstate::PassThruSet)
        }
        SourceSwapOutStart => (MonitorState::SwapOut, MonitorSubstate::Start),
        SourceSwapOutComplete => {
            (MonitorState::SwapOut, MonitorSubstate::Complete)
        }
        OperationComplete => (MonitorState::Sparing, MonitorSubstate::Done),
    }
}

/// Absolute rebuild-progress value for a percentage pause: `pct` percent
/// of the usable capacity (rounded up per percent), offset to the edge's
/// checkpoint base.
pub fn rebuild_threshold(capacity: u64, pct: u8, edge_offset: u64) -> u64 {
    capacity.div_ceil(100) * u64::from(pct) + edge_offset
}

/// Shape of the private rebuild-guard hook for `obj`.
pub fn rebuild_guard_spec(obj: crate::ObjectId) -> HookSpec {
    let (state, substate) = pause_point(CopyState::UserRebuildComplete);
    HookSpec {
        object: obj,
        state,
        substate,
        val1: 0,
        val2: 0,
        compare: CompareKind::Equal,
        action: HookAction::Pause,
    }
}

/*
 * Drive the batch to `target`.  Every mode checks legality first (an
 * illegal operation/checkpoint combination must fail before any
 * controller call is made); `Run` then walks checkpoint by checkpoint,
 * confirming each transition before recording it in `ctx.current`.
 */
pub fn advance_to(
    ctx: &mut OrchestratorContext,
    target: CopyState,
    mode: AdvanceMode,
) -> Result<()> {
    if target == CopyState::NotApplicable {
        precondition_bail!("no checkpoint requested");
    }
    if target == CopyState::SourceMarkedEol && !ctx.op.has_eol_phase() {
        precondition_bail!(
            "checkpoint {} is illegal for a {}",
            target,
            ctx.op
        );
    }

    match mode {
        AdvanceMode::Run => run_to(ctx, target),
        AdvanceMode::PauseAndWait => {
            arm_pause_hooks(ctx, target)?;
            // A pause at the first checkpoint still needs the workflow
            // kicked off; the hooks are armed, so it cannot run past.
            if !ctx.started {
                driver::initiate(ctx)?;
            }
            // prev() exists for everything but NotApplicable, rejected
            // above.
            run_to(ctx, target.prev().unwrap())
        }
        AdvanceMode::ValidateOnly => confirm_pause(ctx, target),
    }
}

/// Fall-through semantics as literal iteration: reaching checkpoint K
/// implies every checkpoint below K was confirmed on the way.
fn run_to(ctx: &mut OrchestratorContext, target: CopyState) -> Result<()> {
    while ctx.current < target {
        let next = ctx.current.next().unwrap();
        run_checkpoint(ctx, next)?;
        ctx.current = next;
        info!(ctx.log, "batch reached checkpoint {}", next);
    }
    Ok(())
}

fn run_checkpoint(
    ctx: &mut OrchestratorContext,
    cs: CopyState,
) -> Result<()> {
    use CopyState::*;
    let position = ctx.position;
    match cs {
        NotApplicable => Ok(()),
        Requested => {
            if !ctx.started {
                driver::initiate(ctx)?;
            }
            Ok(())
        }
        // Acceptance of the request is implied by initiate() succeeding.
        Started => Ok(()),
        SourceMarkedEol => {
            if !ctx.op.has_eol_phase() {
                return Ok(());
            }
            wait_for_event(ctx, position, EventType::SourceEdgeEol)?;
            driver::conclude_injection(ctx)
        }
        DestSwapInStart | DestSwapInComplete => {
            wait_for_event(ctx, position, EventType::SwapIn)?;
            Ok(())
        }
        ModeSetToMirror => {
            wait_for_event(ctx, position, EventType::MirrorMode)?;
            Ok(())
        }
        MetadataRebuildStart => {
            wait_for_event(ctx, position, EventType::MetadataRebuildStart)?;
            Ok(())
        }
        MetadataRebuildComplete | UserRebuildStart => {
            wait_for_event(ctx, position, EventType::CopyStart)?;
            Ok(())
        }
        // Pause-only checkpoint; nothing to confirm when running past.
        DesiredPercentageRebuilt => Ok(()),
        UserRebuildComplete => {
            wait_for_event(ctx, position, EventType::RebuildHook)?;
            wait_for_event(ctx, position, EventType::CopyComplete)?;
            Ok(())
        }
        InitiateCopyCompleteJob => {
            wait_for_event(ctx, position, EventType::CopyCompleteInitiated)?;
            Ok(())
        }
        ModeSetToPassThru | SourceSwapOutStart => {
            wait_for_event(ctx, position, EventType::SwapOut)?;
            Ok(())
        }
        SourceSwapOutComplete => {
            wait_for_event(ctx, position, EventType::SwapOutComplete)?;
            Ok(())
        }
        OperationComplete => {
            wait_for_event(ctx, position, EventType::CopyComplete)?;
            Ok(())
        }
    }
}

fn arm_pause_hooks(
    ctx: &mut OrchestratorContext,
    target: CopyState,
) -> Result<()> {
    let mirror = ctx.mirror_to_peer();
    let c = Arc::clone(&ctx.controller);
    let pct = ctx.settings.driver.rebuild_pct;

    for i in 0..ctx.batch.len() {
        let (id, enabled, src) = {
            let rg = &ctx.batch[i];
            (
                rg.id,
                rg.enabled,
                rg.source_disk.map(|s| s.edge).unwrap_or(0),
            )
        };
        if !enabled {
            continue;
        }
        let obj = c.copy_object(id, ctx.position)?;

        let spec = if target == CopyState::DesiredPercentageRebuilt {
            let dst = 1 - src;
            let capacity = c.usable_capacity(obj)?;
            let offset = c.checkpoint_offset(obj, dst)?;
            let (state, substate) = pause_point(target);
            HookSpec {
                object: obj,
                state,
                substate,
                val1: rebuild_threshold(capacity, pct, offset),
                val2: 0,
                compare: CompareKind::GreaterThan,
                action: HookAction::Pause,
            }
        } else {
            let (state, substate) = pause_point(target);
            HookSpec {
                object: obj,
                state,
                substate,
                val1: 0,
                val2: 0,
                compare: CompareKind::Equal,
                action: HookAction::Pause,
            }
        };

        ctx.hooks.arm(
            &*c,
            HookKey {
                rg: id,
                kind: HookKind::Checkpoint(target),
            },
            spec,
            mirror,
        )?;

        // The controller cannot distinguish "paused before the rebuild
        // completes" from "paused right before source swap-out", so those
        // targets get the private guard armed in parallel.
        if matches!(
            target,
            CopyState::UserRebuildComplete | CopyState::SourceSwapOutStart
        ) {
            let gkey = HookKey {
                rg: id,
                kind: HookKind::RebuildGuard,
            };
            if !ctx.hooks.is_armed(&gkey) {
                ctx.hooks.arm(&*c, gkey, rebuild_guard_spec(obj), mirror)?;
            }
        }
    }
    Ok(())
}

/// Wait for every raid group's pause hook at `target` to fire, then
/// disarm and record the batch as having reached `target`.
fn confirm_pause(
    ctx: &mut OrchestratorContext,
    target: CopyState,
) -> Result<()> {
    let c = Arc::clone(&ctx.controller);
    let mirror = ctx.mirror_to_peer();

    let keys: Vec<(uuid::Uuid, HookKey)> = ctx
        .batch
        .iter()
        .filter(|rg| rg.enabled)
        .map(|rg| {
            (
                rg.id,
                HookKey {
                    rg: rg.id,
                    kind: HookKind::Checkpoint(target),
                },
            )
        })
        .collect();

    let poller = Poller::new(
        ctx.settings.wait.retries,
        ctx.settings.wait.hook_interval(),
    );
    let start = Instant::now();
    let mut done = vec![false; keys.len()];
    let hooks = &ctx.hooks;
    let outcome = poller.run(|_round| {
        for (i, (_, key)) in keys.iter().enumerate() {
            if !done[i] && hooks.check_hit(&*c, key)? {
                done[i] = true;
            }
        }
        Ok(done.iter().all(|d| *d))
    })?;

    if let PollOutcome::TimedOut { .. } = outcome {
        let incomplete: Vec<uuid::Uuid> = keys
            .iter()
            .zip(done.iter())
            .filter(|(_, d)| !**d)
            .map(|((id, _), _)| *id)
            .collect();
        return Err(SpareError::Timeout {
            event: format!("pause hook at {}", target),
            elapsed: start.elapsed(),
            incomplete,
        });
    }

    for (_, key) in &keys {
        ctx.hooks.disarm(&*c, key, mirror, ctx.restart_survival)?;
    }

    // A confirmed pause at or past the rebuild-complete point also
    // confirms the rebuild itself, so the private guard has done its job.
    if target >= CopyState::UserRebuildComplete {
        for (id, _) in &keys {
            let gkey = HookKey {
                rg: *id,
                kind: HookKind::RebuildGuard,
            };
            if ctx.hooks.is_armed(&gkey) {
                ctx.hooks.disarm(&*c, &gkey, mirror, ctx.restart_survival)?;
            }
        }
    }

    ctx.current = target;
    Ok(())
}
