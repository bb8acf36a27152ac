// Copyright 2023 Oxide Computer Company

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use slog::info;
use strum::IntoEnumIterator;

use spareway::{
    advance_to, build_logger, checkpoint::pause_point, finish,
    AdvanceMode, CopyOperationType, CopyState, DriveLocation, EventInfo,
    EventType, OrchestratorContext, Settings, SpareController,
};
use spareway::sim::SimController;
use spareway_common::read_json_maybe;

/// swtest  Sparing Workflow TEST runner
#[derive(Debug, Parser)]
#[clap(name = "swtest", term_width = 80)]
#[clap(about = "Drive copy workflows against a simulated controller", long_about = None)]
struct Args {
    #[clap(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// List the ordered checkpoints and their instrumentation points.
    Checkpoints,
    /// List the observable workflow events.
    Events,
    /// Run a copy workflow on a simulated batch.
    Run {
        /// Operation: proactive, user, or user-to
        #[clap(long, default_value = "proactive", action)]
        op: String,

        /// Raid groups in the batch
        #[clap(long, default_value = "1", action)]
        count: usize,

        /// Drives per raid group
        #[clap(long, default_value = "5", action)]
        width: usize,

        /// Position under copy within each raid group
        #[clap(long, default_value = "1", action)]
        position: usize,

        /// Checkpoint to drive the batch to
        #[clap(long, default_value = "operation_complete", action)]
        target: String,

        /// Pause at the target with a hook and validate the pause fired,
        /// instead of running through it
        #[clap(long, action)]
        pause: bool,

        /// SCSI opcode for proactive EOL error injection
        #[clap(long, default_value = "42", action)]
        opcode: u8,

        /// Settings file (JSON); defaults apply when absent
        #[clap(long, action)]
        settings: Option<PathBuf>,

        /// Leave the batch where the run ends instead of cleaning up
        #[clap(long, action)]
        skip_cleanup: bool,
    },
}

fn parse_checkpoint(name: &str) -> Result<CopyState> {
    if let Ok(ord) = name.parse::<u8>() {
        return CopyState::from_ordinal(ord)
            .ok_or_else(|| anyhow!("checkpoint ordinal {ord} out of range"));
    }
    CopyState::iter()
        .find(|cs| {
            let debug = format!("{:?}", cs);
            debug.eq_ignore_ascii_case(name)
                || snake(&debug).eq_ignore_ascii_case(name)
        })
        .ok_or_else(|| anyhow!("unknown checkpoint {name:?}"))
}

fn parse_op(name: &str) -> Result<CopyOperationType> {
    Ok(match name {
        "proactive" => CopyOperationType::ProactiveCopy,
        "user" => CopyOperationType::UserCopy,
        "user-to" => CopyOperationType::UserCopyTo,
        x => bail!("unknown operation {x:?}"),
    })
}

fn snake(debug: &str) -> String {
    let mut out = String::new();
    for (i, c) in debug.chars().enumerate() {
        if c.is_ascii_uppercase() && i != 0 {
            out.push('_');
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.action {
        Action::Checkpoints => {
            println!("{:>3} {:26} {}", "ORD", "CHECKPOINT", "PAUSE POINT");
            for cs in CopyState::iter().skip(1) {
                let (state, substate) = pause_point(cs);
                println!(
                    "{:>3} {:26} {:?}/{:?}",
                    cs.ordinal(),
                    snake(&format!("{:?}", cs)),
                    state,
                    substate,
                );
            }
            Ok(())
        }
        Action::Events => {
            for ord in 0..12 {
                let ei = EventInfo::from_ordinal(ord)?;
                println!("{:>3} {}", ord, ei.name);
            }
            Ok(())
        }
        Action::Run {
            op,
            count,
            width,
            position,
            target,
            pause,
            opcode,
            settings,
            skip_cleanup,
        } => {
            let op = parse_op(&op)?;
            let target = parse_checkpoint(&target)?;
            if position >= width {
                bail!("position {position} out of range for width {width}");
            }
            run(
                op,
                count,
                width,
                position,
                target,
                pause,
                opcode,
                settings,
                skip_cleanup,
            )
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    op: CopyOperationType,
    count: usize,
    width: usize,
    position: usize,
    target: CopyState,
    pause: bool,
    opcode: u8,
    settings: Option<PathBuf>,
    skip_cleanup: bool,
) -> Result<()> {
    let log = build_logger();

    let sim = Arc::new(SimController::new());
    let batch = sim.sim_batch(count, width);
    let mut ctx = OrchestratorContext::new(
        Arc::clone(&sim) as Arc<dyn SpareController>,
        batch,
        op,
        position,
        log.clone(),
    );
    if let Some(file) = &settings {
        ctx.settings = read_json_maybe::<_, Settings>(file)
            .with_context(|| format!("reading settings {file:?}"))?
            .ok_or_else(|| anyhow!("settings file {file:?} not found"))?;
    }
    ctx.scsi_opcode = opcode;
    if op == CopyOperationType::UserCopyTo {
        // Send each group's copy to its second spare, leaving the first
        // for the controller's own choosing.
        ctx.destinations = ctx
            .batch
            .iter()
            .map(|rg| {
                rg.spares
                    .get(1)
                    .map(|s| s.location)
                    .ok_or_else(|| anyhow!("rg {} has no spares", rg.id))
            })
            .collect::<Result<Vec<DriveLocation>>>()?;
    }

    info!(
        log,
        "{} on {} raid group(s), position {}, target {:?}",
        op,
        count,
        position,
        target
    );

    if pause {
        advance_to(&mut ctx, target, AdvanceMode::PauseAndWait)?;
        info!(log, "pause hooks armed, validating");
        advance_to(&mut ctx, target, AdvanceMode::ValidateOnly)?;
        info!(log, "batch paused and validated at {:?}", ctx.current);
        for rg in &ctx.batch {
            println!(
                "rg {} paused at {:?}, phase {:?}",
                rg.id,
                ctx.current,
                sim.phase_of(rg.id, position)
            );
        }
    } else {
        advance_to(&mut ctx, target, AdvanceMode::Run)?;
        info!(log, "batch ran to {:?}", ctx.current);
    }

    if skip_cleanup {
        info!(log, "leaving the batch as it lies");
        return Ok(());
    }

    finish(&mut ctx)?;
    for rg in &ctx.batch {
        let consumed =
            rg.spares.iter().filter(|s| s.consumed).count();
        println!(
            "rg {} position {} now on {}, {} spare(s) consumed",
            rg.id, position, rg.disks[position], consumed
        );
    }
    check_events_confirmed(&ctx)?;
    Ok(())
}

/// Paranoia after cleanup: nothing should still be armed or waiting.
fn check_events_confirmed(ctx: &OrchestratorContext) -> Result<()> {
    if ctx.hooks.armed_count() != 0 {
        bail!("{} hook(s) survived cleanup", ctx.hooks.armed_count());
    }
    if !ctx.needs_spare.is_empty() {
        bail!("{} raid group(s) still awaiting spares", ctx.needs_spare.len());
    }
    // An event ordinal round-trip, so a stale catalog shows up in CI.
    for ev in [EventType::SourceEdgeEol, EventType::ReinsertFailedDrives] {
        let ei = EventInfo::for_event(ev);
        if ei.event != ev {
            bail!("event catalog misaligned at {}", ei.name);
        }
    }
    Ok(())
}
