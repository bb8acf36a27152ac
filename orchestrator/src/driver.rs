// Copyright 2023 Oxide Computer Company

use std::sync::Arc;

use slog::{info, warn};

use crate::catalog::EventType;
use crate::checkpoint::{rebuild_guard_spec, CopyState};
use crate::controller::CommandStatus;
use crate::hook::{HookKey, HookKind};
use crate::waiter::wait_for_event;
use crate::{
    CopyOperationType, DriveLocation, OrchestratorContext, SourceDisk,
    MAX_BATCH, REBUILD_GUARD_BATCH,
};
use spareway_common::{precondition_bail, Result, SpareError};

/*
 * Start a proactive copy for `position` across the batch: inject protocol
 * errors on every source drive until the controller marks the edge EOL
 * and begins sparing, then stop injection, re-enable the deferred command
 * queue, and confirm the destination swapped in.
 *
 * `opcode` selects which SCSI command the injection records target; it is
 * overridden by `DriverSettings::forced_eol_opcode` when that is set.
 */
pub fn start_proactive(
    ctx: &mut OrchestratorContext,
    position: usize,
    opcode: u8,
) -> Result<()> {
    if ctx.op != CopyOperationType::ProactiveCopy {
        precondition_bail!("start_proactive on a {} batch", ctx.op);
    }
    ctx.position = position;
    ctx.scsi_opcode = opcode;

    initiate(ctx)?;
    wait_for_event(ctx, position, EventType::SourceEdgeEol)?;
    conclude_injection(ctx)?;
    wait_for_event(ctx, position, EventType::SwapIn)?;

    if ctx.current < CopyState::DestSwapInComplete {
        ctx.current = CopyState::DestSwapInComplete;
    }
    Ok(())
}

/// Start a user-initiated copy for `position` across the batch and
/// confirm the destination swapped in.
pub fn start_user_copy(
    ctx: &mut OrchestratorContext,
    position: usize,
) -> Result<()> {
    if ctx.op != CopyOperationType::UserCopy {
        precondition_bail!("start_user_copy on a {} batch", ctx.op);
    }
    ctx.position = position;

    initiate(ctx)?;
    wait_for_event(ctx, position, EventType::SwapIn)?;

    if ctx.current < CopyState::DestSwapInComplete {
        ctx.current = CopyState::DestSwapInComplete;
    }
    Ok(())
}

/// Like `start_user_copy`, but every raid group copies to an explicitly
/// chosen destination drive; `destinations` is parallel to the batch.
pub fn start_user_copy_to(
    ctx: &mut OrchestratorContext,
    position: usize,
    destinations: &[DriveLocation],
) -> Result<()> {
    if ctx.op != CopyOperationType::UserCopyTo {
        precondition_bail!("start_user_copy_to on a {} batch", ctx.op);
    }
    ctx.position = position;
    ctx.destinations = destinations.to_vec();

    initiate(ctx)?;
    wait_for_event(ctx, position, EventType::SwapIn)?;

    if ctx.current < CopyState::DestSwapInComplete {
        ctx.current = CopyState::DestSwapInComplete;
    }
    Ok(())
}

/*
 * The common kickoff: precondition checks, per-group bookkeeping, the
 * optional rebuild guard for big batches, and the operation-specific
 * start (injection or an explicit copy command).  No waiting happens
 * here; the caller decides which events to confirm afterwards.
 */
pub(crate) fn initiate(ctx: &mut OrchestratorContext) -> Result<()> {
    if ctx.started {
        precondition_bail!("copy workflow already started for this batch");
    }
    if !ctx.controller.environment_supported() {
        precondition_bail!(
            "execution environment does not support copy workflows"
        );
    }
    if ctx.batch.is_empty() {
        precondition_bail!("empty batch");
    }
    if ctx.batch.len() > MAX_BATCH {
        precondition_bail!(
            "batch of {} exceeds the {} raid group maximum",
            ctx.batch.len(),
            MAX_BATCH
        );
    }
    if ctx.op == CopyOperationType::UserCopyTo
        && ctx.destinations.len() != ctx.batch.len()
    {
        precondition_bail!(
            "{} destinations for a batch of {}",
            ctx.destinations.len(),
            ctx.batch.len()
        );
    }

    let c = Arc::clone(&ctx.controller);
    let mirror = ctx.mirror_to_peer();
    let arm_guard = ctx.batch.len() > REBUILD_GUARD_BATCH;
    if arm_guard {
        // A big batch takes long enough to rebuild that the early
        // finishers would run to completion before the test looks at
        // them; the guard holds everyone at the rebuild-complete point.
        warn!(
            ctx.log,
            "batch of {} exceeds {}, arming rebuild guards",
            ctx.batch.len(),
            REBUILD_GUARD_BATCH
        );
    }

    for i in 0..ctx.batch.len() {
        let (id, enabled, already) = {
            let rg = &ctx.batch[i];
            (rg.id, rg.enabled, rg.source_disk.is_some())
        };
        if !enabled {
            continue;
        }
        if already {
            precondition_bail!(
                "rg {} position {} already has a copy in flight",
                id,
                ctx.position
            );
        }

        ctx.needs_spare.insert(id);

        let obj = c.copy_object(id, ctx.position)?;
        let st = c.copy_status(obj)?;
        let src = st
            .mode
            .mirror_source()
            .or(st.mode.sole_edge())
            .unwrap_or(0);
        let location = c.drive_info(obj, src)?.location;
        ctx.batch[i].source_disk = Some(SourceDisk { location, edge: src });

        if arm_guard {
            let gkey = HookKey {
                rg: id,
                kind: HookKind::RebuildGuard,
            };
            if !ctx.hooks.is_armed(&gkey) {
                ctx.hooks.arm(&*c, gkey, rebuild_guard_spec(obj), mirror)?;
            }
        }

        match ctx.op {
            CopyOperationType::ProactiveCopy => {
                let opcode = ctx
                    .settings
                    .driver
                    .forced_eol_opcode
                    .unwrap_or(ctx.scsi_opcode);
                c.start_error_injection(obj, src, opcode)?;
                if ctx.settings.driver.issue_io {
                    c.issue_synthetic_io(obj)?;
                }
            }
            CopyOperationType::UserCopy => {
                accept(id, c.start_user_copy(obj)?)?;
            }
            CopyOperationType::UserCopyTo => {
                let dest = ctx.destinations[i];
                accept(id, c.start_user_copy_to(obj, dest)?)?;
            }
        }
        info!(
            ctx.log,
            "rg {} position {}: {} started from {}",
            id,
            ctx.position,
            ctx.op,
            location
        );
    }

    ctx.started = true;
    if ctx.current < CopyState::Requested {
        ctx.current = CopyState::Requested;
    }
    Ok(())
}

/// Once every source edge reports EOL, stop the injection records and let
/// the controller's deferred command queue drain again.
pub(crate) fn conclude_injection(
    ctx: &mut OrchestratorContext,
) -> Result<()> {
    let c = Arc::clone(&ctx.controller);
    for rg in &ctx.batch {
        if !rg.enabled {
            continue;
        }
        let Some(source) = rg.source_disk else {
            continue;
        };
        let obj = c.copy_object(rg.id, ctx.position)?;
        c.stop_error_injection(obj, source.edge)?;
    }
    c.enable_deferred_queue()
}

fn accept(id: uuid::Uuid, status: CommandStatus) -> Result<()> {
    if status != CommandStatus::Accepted {
        return Err(SpareError::CommandFailed(format!(
            "rg {}: copy command not accepted: {:?}",
            id, status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimController;
    use spareway_common::WaitSettings;

    fn quiet_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_ctx(
        sim: &Arc<SimController>,
        count: usize,
        op: CopyOperationType,
    ) -> OrchestratorContext {
        let batch = sim.sim_batch(count, 5);
        let mut ctx = OrchestratorContext::new(
            Arc::clone(sim) as Arc<dyn crate::SpareController>,
            batch,
            op,
            1,
            quiet_log(),
        );
        ctx.settings.wait = WaitSettings {
            retries: 500,
            interval_ms: 0,
            hook_interval_ms: 0,
        };
        ctx
    }

    #[test]
    fn proactive_start_marks_both_sources_eol() {
        let sim = Arc::new(SimController::new());
        let mut ctx =
            test_ctx(&sim, 2, CopyOperationType::ProactiveCopy);

        start_proactive(&mut ctx, 1, 0x2a).unwrap();

        for rg in &ctx.batch {
            assert!(sim.eol_set(rg.id, 1));
            let source = rg.source_disk.expect("source disk recorded");
            assert_eq!(source.edge, 0);
            assert!(ctx.needs_spare.contains(&rg.id));
        }
        assert_eq!(ctx.current, CopyState::DestSwapInComplete);
    }

    #[test]
    fn forced_opcode_overrides_the_caller() {
        let sim = Arc::new(SimController::new());
        let mut ctx =
            test_ctx(&sim, 1, CopyOperationType::ProactiveCopy);
        let rg = ctx.batch[0].id;

        start_proactive(&mut ctx, 1, 0x99).unwrap();
        assert_eq!(sim.injected_opcode(rg, 1), Some(0x2a));
    }

    #[test]
    fn clearing_the_workaround_restores_the_caller_opcode() {
        let sim = Arc::new(SimController::new());
        let mut ctx =
            test_ctx(&sim, 1, CopyOperationType::ProactiveCopy);
        ctx.settings.driver.forced_eol_opcode = None;
        let rg = ctx.batch[0].id;

        start_proactive(&mut ctx, 1, 0x99).unwrap();
        assert_eq!(sim.injected_opcode(rg, 1), Some(0x99));
    }

    #[test]
    fn double_use_of_a_position_is_fatal() {
        let sim = Arc::new(SimController::new());
        let mut ctx =
            test_ctx(&sim, 1, CopyOperationType::ProactiveCopy);

        start_proactive(&mut ctx, 1, 0x2a).unwrap();
        // A fresh start attempt against the same bookkeeping must trip
        // on the recorded source disk.
        ctx.started = false;
        match start_proactive(&mut ctx, 1, 0x2a) {
            Err(SpareError::Precondition(msg)) => {
                assert!(msg.contains("already has a copy in flight"));
            }
            x => panic!("expected precondition failure, got {:?}", x),
        }
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let sim = Arc::new(SimController::new());
        let mut ctx = test_ctx(
            &sim,
            MAX_BATCH + 1,
            CopyOperationType::ProactiveCopy,
        );
        match start_proactive(&mut ctx, 1, 0x2a) {
            Err(SpareError::Precondition(_)) => {}
            x => panic!("expected precondition failure, got {:?}", x),
        }
    }

    #[test]
    fn unsupported_environment_is_rejected() {
        let sim = Arc::new(SimController::new());
        sim.set_env_supported(false);
        let mut ctx =
            test_ctx(&sim, 1, CopyOperationType::ProactiveCopy);
        match start_proactive(&mut ctx, 1, 0x2a) {
            Err(SpareError::Precondition(_)) => {}
            x => panic!("expected precondition failure, got {:?}", x),
        }
    }

    #[test]
    fn refused_user_copy_propagates_as_command_failure() {
        let sim = Arc::new(SimController::new());
        sim.refuse_user_copy();
        let mut ctx = test_ctx(&sim, 1, CopyOperationType::UserCopy);
        match start_user_copy(&mut ctx, 1) {
            Err(SpareError::CommandFailed(_)) => {}
            x => panic!("expected command failure, got {:?}", x),
        }
    }

    #[test]
    fn user_copy_to_needs_a_destination_per_group() {
        let sim = Arc::new(SimController::new());
        let mut ctx = test_ctx(&sim, 2, CopyOperationType::UserCopyTo);
        let one = vec![DriveLocation {
            bus: 9,
            enclosure: 0,
            slot: 0,
        }];
        match start_user_copy_to(&mut ctx, 1, &one) {
            Err(SpareError::Precondition(_)) => {}
            x => panic!("expected precondition failure, got {:?}", x),
        }
    }

    #[test]
    fn large_batch_arms_a_guard_per_group() {
        let sim = Arc::new(SimController::new());
        let mut ctx = test_ctx(
            &sim,
            REBUILD_GUARD_BATCH + 1,
            CopyOperationType::UserCopy,
        );
        start_user_copy(&mut ctx, 1).unwrap();
        for rg in &ctx.batch {
            assert!(ctx.hooks.is_armed(&HookKey {
                rg: rg.id,
                kind: HookKind::RebuildGuard,
            }));
        }
    }
}
