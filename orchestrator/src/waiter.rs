// Copyright 2023 Oxide Computer Company

use std::sync::Arc;
use std::time::Instant;

use slog::{error, info};
use uuid::Uuid;

use crate::catalog::{EventInfo, EventType};
use crate::controller::{ConfigMode, LifecycleState, CHECKPOINT_END};
use crate::hook::{HookKey, HookKind};
use crate::{OrchestratorContext, RaidGroup};
use spareway_common::{
    precondition_bail, PollOutcome, Poller, Result, SpareError,
};

/*
 * Resolve which edge index plays source and which destination for an
 * event.  Before the copy completes these are simply the recorded source
 * and its complement.  Once the object reverts to pass-through the sole
 * connected edge (the old destination) reports as the source, so the
 * post-completion events evaluate with the indices swapped.
 */
pub fn expected_roles(event: EventType, original_source: u32) -> (u32, u32) {
    if event.flips_roles() {
        (1 - original_source, original_source)
    } else {
        (original_source, 1 - original_source)
    }
}

/*
 * Poll until every enabled raid group in the batch satisfies the
 * predicate for `event` at `position`, or the retry budget runs out.
 * Returns the number of poll rounds that elapsed before the last group
 * completed (zero when everything was already satisfied).
 *
 * Hook-counter events use the shorter poll interval; everything else the
 * standard one.  A timeout names every group that never completed and is
 * fatal to the calling workflow step.
 */
pub fn wait_for_event(
    ctx: &mut OrchestratorContext,
    position: usize,
    event: EventType,
) -> Result<u32> {
    let name = EventInfo::for_event(event).name;
    let interval = if event.hook_paced() {
        ctx.settings.wait.hook_interval()
    } else {
        ctx.settings.wait.interval()
    };
    let poller = Poller::new(ctx.settings.wait.retries, interval);

    let n = ctx.batch.len();
    let mut done: Vec<bool> =
        ctx.batch.iter().map(|rg| !rg.enabled).collect();
    let start = Instant::now();

    let outcome = poller.run(|_round| {
        for ix in 0..n {
            if done[ix] {
                continue;
            }
            if satisfied(ctx, ix, position, event)? {
                done[ix] = true;
                info!(
                    ctx.log,
                    "rg {} satisfied \"{}\"", ctx.batch[ix].id, name
                );
            }
        }
        Ok(done.iter().all(|d| *d))
    })?;

    match outcome {
        PollOutcome::Satisfied { rounds } => Ok(rounds),
        PollOutcome::TimedOut { .. } => {
            let elapsed = start.elapsed();
            let incomplete: Vec<Uuid> = ctx
                .batch
                .iter()
                .zip(done.iter())
                .filter(|(_, d)| !**d)
                .map(|(rg, _)| rg.id)
                .collect();
            for id in &incomplete {
                error!(
                    ctx.log,
                    "rg {} never reported \"{}\" after {:?}",
                    id,
                    name,
                    elapsed
                );
            }
            Err(SpareError::Timeout {
                event: name.to_string(),
                elapsed,
                incomplete,
            })
        }
    }
}

/// Evaluate the event predicate for one raid group, performing the
/// event's required side effect when it first holds.
fn satisfied(
    ctx: &mut OrchestratorContext,
    ix: usize,
    position: usize,
    event: EventType,
) -> Result<bool> {
    let c = Arc::clone(&ctx.controller);
    let (id, hint) = {
        let rg = &ctx.batch[ix];
        (rg.id, rg.source_disk.map(|s| s.edge).unwrap_or(0))
    };
    let obj = c.copy_object(id, position)?;
    let (src, dst) = expected_roles(event, hint);

    match event {
        EventType::SourceEdgeEol => Ok(c.edge_status(obj, src)?.eol),
        EventType::SwapIn => Ok(c.edge_status(obj, dst)?.enabled),
        EventType::MirrorMode => {
            let st = c.copy_status(obj)?;
            if st.mode != ConfigMode::mirror_for_source(src) {
                return Ok(false);
            }
            consume_spare(&mut ctx.batch[ix]);
            Ok(true)
        }
        EventType::MetadataRebuildStart => {
            let st = c.copy_status(obj)?;
            if !st.mode.is_mirror() || st.rebuild_logging[dst as usize] {
                return Ok(false);
            }
            if c.chunks_needing_rebuild(obj, dst)? == 0 {
                precondition_bail!(
                    "rg {}: no destination chunks marked needing rebuild",
                    id
                );
            }
            Ok(true)
        }
        EventType::RebuildHook => {
            let key = HookKey {
                rg: id,
                kind: HookKind::RebuildGuard,
            };
            // No guard armed, nothing to wait for.
            if !ctx.hooks.is_armed(&key) {
                return Ok(true);
            }
            if !ctx.hooks.check_hit(&*c, &key)? {
                return Ok(false);
            }
            let mirror = ctx.mirror_to_peer();
            let rs = ctx.restart_survival;
            ctx.hooks.disarm(&*c, &key, mirror, rs)?;
            Ok(true)
        }
        EventType::CopyStart => {
            Ok(c.copy_status(obj)?.checkpoint[dst as usize] != 0)
        }
        EventType::CopyComplete => {
            let st = c.copy_status(obj)?;
            // With flipped roles `src` is the copied-to edge.
            Ok(st.copy_complete
                || st.checkpoint[src as usize] == CHECKPOINT_END)
        }
        EventType::CopyCompleteInitiated => {
            let st = c.copy_status(obj)?;
            Ok(st.copy_complete && st.request_in_progress)
        }
        EventType::SwapOut => {
            let st = c.copy_status(obj)?;
            if st.mode == ConfigMode::pass_thru_for_edge(src)
                || st.lifecycle != LifecycleState::Ready
            {
                ctx.needs_spare.remove(&id);
                Ok(true)
            } else {
                Ok(false)
            }
        }
        EventType::SwapOutComplete => {
            let st = c.copy_status(obj)?;
            if st.mode == ConfigMode::pass_thru_for_edge(src)
                && !st.request_in_progress
            {
                ctx.needs_spare.remove(&id);
                Ok(true)
            } else {
                Ok(false)
            }
        }
        EventType::SourceMarkedNr => {
            Ok(c.copy_status(obj)?.checkpoint[src as usize]
                == CHECKPOINT_END)
        }
        EventType::ReinsertFailedDrives => {
            let st = c.copy_status(obj)?;
            if !st.mode.is_pass_thru() {
                return Ok(false);
            }
            let di = c.drive_info(obj, src)?;
            if !di.present
                || di.faulted
                || di.lifecycle != LifecycleState::Ready
            {
                return Ok(false);
            }
            // The position is now served by the sole connected edge;
            // refresh the recorded device mapping to match.
            let serving = st.mode.sole_edge().unwrap_or(src);
            let loc = c.drive_info(obj, serving)?.location;
            ctx.batch[ix].disks[position] = loc;
            Ok(true)
        }
    }
}

fn consume_spare(rg: &mut RaidGroup) {
    for s in rg.spares.iter_mut() {
        if !s.consumed {
            s.consumed = true;
            break;
        }
    }
}
