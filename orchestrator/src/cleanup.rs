// Copyright 2023 Oxide Computer Company

use std::sync::Arc;

use slog::info;

use crate::catalog::EventType;
use crate::checkpoint::CopyState;
use crate::controller::CHECKPOINT_END;
use crate::hook::{HookKey, HookKind};
use crate::waiter::wait_for_event;
use crate::OrchestratorContext;
use spareway_common::{precondition_bail, Result};

/*
 * Put the batch back in service after a copy workflow, however far it
 * got.  Leftover pause hooks are disarmed first (an armed hook keeps the
 * controller's workflow frozen, and nothing below can complete while it
 * is), then the remaining transitions are confirmed, pulled drives are
 * reinserted, and the proactive EOL mark is cleared from the old source.
 * Bookkeeping is reset last so a fresh workflow can start on the same
 * context.
 */
/// Leftover hooks come down private rebuild guard first, then the
/// checkpoint hooks in checkpoint order.
fn disarm_order(mut keys: Vec<HookKey>) -> Vec<HookKey> {
    keys.sort_by_key(|k| match k.kind {
        HookKind::RebuildGuard => (0, CopyState::NotApplicable),
        HookKind::Checkpoint(cs) => (1, cs),
    });
    keys
}

pub fn finish(ctx: &mut OrchestratorContext) -> Result<()> {
    if !ctx.started {
        precondition_bail!("no copy workflow to clean up");
    }
    let c = Arc::clone(&ctx.controller);
    let mirror = ctx.mirror_to_peer();
    let position = ctx.position;

    for key in disarm_order(ctx.hooks.armed_keys()) {
        ctx.hooks.disarm(&*c, &key, mirror, ctx.restart_survival)?;
    }

    wait_for_event(ctx, position, EventType::SwapOutComplete)?;

    // The swap-out normally marks the old source fully rebuilt on its
    // way down; confirm separately when any group has not gotten there.
    let mut source_unmarked = false;
    for rg in &ctx.batch {
        if !rg.enabled {
            continue;
        }
        let Some(source) = rg.source_disk else {
            continue;
        };
        let obj = c.copy_object(rg.id, position)?;
        let st = c.copy_status(obj)?;
        if st.checkpoint[source.edge as usize] != CHECKPOINT_END {
            source_unmarked = true;
        }
    }
    if source_unmarked {
        wait_for_event(ctx, position, EventType::SourceMarkedNr)?;
    }

    let mut any_removed = false;
    for rg in &ctx.batch {
        if !rg.enabled || rg.removed.is_empty() {
            continue;
        }
        let Some(source) = rg.source_disk else {
            continue;
        };
        any_removed = true;
        let obj = c.copy_object(rg.id, position)?;
        c.reinsert_drive(obj, source.edge)?;
    }
    if any_removed {
        wait_for_event(ctx, position, EventType::ReinsertFailedDrives)?;
        for rg in ctx.batch.iter_mut() {
            rg.removed.clear();
        }
    }

    // A proactive copy leaves the old source marked EOL; clear it so the
    // drive can be spared again.
    if ctx.op.has_eol_phase() {
        for rg in &ctx.batch {
            if !rg.enabled {
                continue;
            }
            let Some(source) = rg.source_disk else {
                continue;
            };
            let obj = c.copy_object(rg.id, position)?;
            c.clear_eol(obj, source.edge)?;
        }
    }

    // The position is now served by whichever drive the workflow left
    // behind the sole connected edge; record that as the new mapping.
    for i in 0..ctx.batch.len() {
        if !ctx.batch[i].enabled {
            continue;
        }
        let id = ctx.batch[i].id;
        let obj = c.copy_object(id, position)?;
        let st = c.copy_status(obj)?;
        if let Some(edge) = st.mode.sole_edge() {
            let loc = c.drive_info(obj, edge)?.location;
            ctx.batch[i].disks[position] = loc;
        }
        ctx.batch[i].source_disk = None;
        ctx.needs_spare.remove(&id);
    }

    if !ctx.restart_survival {
        ctx.hooks.clear_all(&*c);
    }
    ctx.started = false;
    ctx.current = CopyState::NotApplicable;
    info!(ctx.log, "batch cleanup complete");
    Ok(())
}
