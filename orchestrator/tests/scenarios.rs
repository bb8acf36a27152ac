// Copyright 2023 Oxide Computer Company
//! End-to-end workflow scenarios against the simulated controller.

use std::sync::Arc;

use strum::IntoEnumIterator;

use spareway::sim::SimController;
use spareway::{
    advance_to, finish, start_proactive, AdvanceMode, CopyOperationType,
    CopyState, DriveLocation, Node, OrchestratorContext, SpareController,
    SpareError, WaitSettings,
};

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
        Arc::clone(sim) as Arc<dyn SpareController>,
        batch,
        op,
        1,
        quiet_log(),
    );
    ctx.settings.wait = WaitSettings {
        retries: 2000,
        interval_ms: 0,
        hook_interval_ms: 0,
    };
    if op == CopyOperationType::UserCopyTo {
        ctx.destinations = ctx
            .batch
            .iter()
            .map(|rg| rg.spares[1].location)
            .collect();
    }
    ctx
}

/*
 * Every operation can pause at every checkpoint that is legal for it, and
 * validating the pause leaves the batch at exactly that checkpoint with
 * nothing still armed.
 */
#[test]
fn every_legal_checkpoint_pauses_and_validates() {
    let ops = [
        CopyOperationType::ProactiveCopy,
        CopyOperationType::UserCopy,
        CopyOperationType::UserCopyTo,
    ];
    for op in ops {
        for target in CopyState::iter().skip(1) {
            let sim = Arc::new(SimController::new());
            let mut ctx = test_ctx(&sim, 1, op);

            let armed =
                advance_to(&mut ctx, target, AdvanceMode::PauseAndWait);
            if target == CopyState::SourceMarkedEol && !op.has_eol_phase()
            {
                match armed {
                    Err(SpareError::Precondition(_)) => continue,
                    x => panic!(
                        "{} at {:?}: expected precondition, got {:?}",
                        op, target, x
                    ),
                }
            }
            armed.unwrap_or_else(|e| {
                panic!("{} pause at {:?} failed: {:?}", op, target, e)
            });

            advance_to(&mut ctx, target, AdvanceMode::ValidateOnly)
                .unwrap_or_else(|e| {
                    panic!(
                        "{} validate at {:?} failed: {:?}",
                        op, target, e
                    )
                });

            assert_eq!(ctx.current, target, "{} at {:?}", op, target);
            assert_eq!(
                ctx.hooks.armed_count(),
                0,
                "{} at {:?} left hooks armed",
                op,
                target
            );
        }
    }
}

#[test]
fn not_applicable_is_never_a_target() {
    let sim = Arc::new(SimController::new());
    let mut ctx = test_ctx(&sim, 1, CopyOperationType::ProactiveCopy);
    for mode in [
        AdvanceMode::Run,
        AdvanceMode::PauseAndWait,
        AdvanceMode::ValidateOnly,
    ] {
        match advance_to(&mut ctx, CopyState::NotApplicable, mode) {
            Err(SpareError::Precondition(_)) => {}
            x => panic!("expected precondition failure, got {:?}", x),
        }
    }
}

/// The illegal operation/checkpoint pairing must be refused before the
/// controller hears anything about it.
#[test]
fn eol_checkpoint_for_user_copy_issues_no_commands() {
    let sim = Arc::new(SimController::new());
    let mut ctx = test_ctx(&sim, 2, CopyOperationType::UserCopyTo);
    match advance_to(
        &mut ctx,
        CopyState::SourceMarkedEol,
        AdvanceMode::Run,
    ) {
        Err(SpareError::Precondition(_)) => {}
        x => panic!("expected precondition failure, got {:?}", x),
    }
    assert_eq!(sim.commands_issued(), 0);
    assert!(!ctx.started);
}

/*
 * Pausing right before the user rebuild must not depend on the user
 * rebuild making progress: the hook blocks entry into that phase, so the
 * preceding metadata-complete confirmation has to be observable on its
 * own.
 */
#[test]
fn pause_at_user_rebuild_entry_holds_before_any_slice() {
    let sim = Arc::new(SimController::new());
    let mut ctx = test_ctx(&sim, 1, CopyOperationType::ProactiveCopy);
    let rg = ctx.batch[0].id;

    advance_to(
        &mut ctx,
        CopyState::UserRebuildStart,
        AdvanceMode::PauseAndWait,
    )
    .unwrap();
    advance_to(
        &mut ctx,
        CopyState::UserRebuildStart,
        AdvanceMode::ValidateOnly,
    )
    .unwrap();

    assert_eq!(ctx.current, CopyState::UserRebuildStart);
    // The destination checkpoint sits at the start of the user area; no
    // user-data slice was copied while paused.
    assert_eq!(
        sim.peek_checkpoint(rg, 1, 1),
        spareway::sim::USER_AREA_START
    );

    finish(&mut ctx).unwrap();
    assert_eq!(sim.phase_of(rg, 1), CopyState::OperationComplete);
}

/// A percentage pause holds the rebuild one slice past the threshold.
#[test]
fn percentage_pause_holds_at_half_rebuilt() {
    let sim = Arc::new(SimController::new());
    let mut ctx = test_ctx(&sim, 1, CopyOperationType::ProactiveCopy);
    let rg = ctx.batch[0].id;

    advance_to(
        &mut ctx,
        CopyState::DesiredPercentageRebuilt,
        AdvanceMode::PauseAndWait,
    )
    .unwrap();
    advance_to(
        &mut ctx,
        CopyState::DesiredPercentageRebuilt,
        AdvanceMode::ValidateOnly,
    )
    .unwrap();

    // Threshold for 50% of 800 chunks is 400; the hook fires on the
    // first slice past it.
    assert_eq!(sim.peek_checkpoint(rg, 1, 1), 500);
    assert_eq!(ctx.current, CopyState::DesiredPercentageRebuilt);

    finish(&mut ctx).unwrap();
    assert_eq!(sim.phase_of(rg, 1), CopyState::OperationComplete);
}

/// Full proactive batch: inject, run to the end, clean up, and every
/// group ends up mapped to its spare with the EOL mark gone.
#[test]
fn proactive_batch_end_to_end() {
    let sim = Arc::new(SimController::new());
    let mut ctx = test_ctx(&sim, 2, CopyOperationType::ProactiveCopy);

    start_proactive(&mut ctx, 1, 0x2a).unwrap();
    advance_to(&mut ctx, CopyState::OperationComplete, AdvanceMode::Run)
        .unwrap();
    finish(&mut ctx).unwrap();

    for (i, rg) in ctx.batch.iter().enumerate() {
        assert!(!sim.eol_set(rg.id, 1));
        assert_eq!(
            rg.disks[1],
            DriveLocation {
                bus: 0,
                enclosure: i as u32,
                slot: 5
            }
        );
        assert_eq!(
            rg.spares.iter().filter(|s| s.consumed).count(),
            1
        );
        assert!(rg.source_disk.is_none());
    }
    assert!(ctx.needs_spare.is_empty());
    assert_eq!(ctx.current, CopyState::NotApplicable);
}

/// An explicit destination ends up behind the position when the copy is
/// done.
#[test]
fn user_copy_to_lands_on_the_chosen_drive() {
    let sim = Arc::new(SimController::new());
    let mut ctx = test_ctx(&sim, 1, CopyOperationType::UserCopyTo);
    let dest = ctx.destinations[0];

    advance_to(&mut ctx, CopyState::OperationComplete, AdvanceMode::Run)
        .unwrap();
    finish(&mut ctx).unwrap();

    assert_eq!(ctx.batch[0].disks[1], dest);
}

/// Dual-node, restart-surviving runs mirror every hook to the peer and
/// take them down from both sides.
#[test]
fn mirrored_hooks_come_and_go_on_both_nodes() {
    let sim = Arc::new(SimController::new());
    let mut ctx = test_ctx(&sim, 1, CopyOperationType::ProactiveCopy);
    ctx.dual_node = true;
    ctx.restart_survival = true;
    sim.set_peer_reachable(true);

    advance_to(
        &mut ctx,
        CopyState::ModeSetToMirror,
        AdvanceMode::PauseAndWait,
    )
    .unwrap();
    assert_eq!(sim.hook_count_on(Node::A), 1);
    assert_eq!(sim.hook_count_on(Node::B), 1);
    assert_eq!(sim.addressed_node(), Node::A);

    advance_to(
        &mut ctx,
        CopyState::ModeSetToMirror,
        AdvanceMode::ValidateOnly,
    )
    .unwrap();
    assert_eq!(sim.hook_count_on(Node::A), 0);
    assert_eq!(sim.hook_count_on(Node::B), 0);
    assert_eq!(ctx.hooks.armed_count(), 0);
}

/// Single-node restart survival keeps the disarmed record so a resumed
/// process can finish the cleanup.
#[test]
fn restart_survival_retains_hook_records() {
    let sim = Arc::new(SimController::new());
    let mut ctx = test_ctx(&sim, 1, CopyOperationType::ProactiveCopy);
    ctx.restart_survival = true;

    advance_to(
        &mut ctx,
        CopyState::ModeSetToMirror,
        AdvanceMode::PauseAndWait,
    )
    .unwrap();
    advance_to(
        &mut ctx,
        CopyState::ModeSetToMirror,
        AdvanceMode::ValidateOnly,
    )
    .unwrap();

    // Gone from the controller, still on the books.
    assert_eq!(sim.hook_count_on(Node::A), 0);
    assert_eq!(ctx.hooks.armed_count(), 1);

    // The resumed process finds the record and retires it.
    let keys = ctx.hooks.armed_keys();
    for key in keys {
        ctx.hooks
            .disarm(&*ctx.controller.clone(), &key, false, false)
            .unwrap();
    }
    assert_eq!(ctx.hooks.armed_count(), 0);
}

/// Reuse of a context after cleanup: a second workflow on the same batch
/// starts from scratch and completes.
#[test]
fn context_is_reusable_after_finish() {
    let sim = Arc::new(SimController::new());
    let mut ctx = test_ctx(&sim, 1, CopyOperationType::UserCopy);

    advance_to(&mut ctx, CopyState::OperationComplete, AdvanceMode::Run)
        .unwrap();
    finish(&mut ctx).unwrap();
    // First pass lands on the first spare.
    assert_eq!(
        ctx.batch[0].disks[1],
        DriveLocation {
            bus: 0,
            enclosure: 0,
            slot: 5
        }
    );

    advance_to(&mut ctx, CopyState::OperationComplete, AdvanceMode::Run)
        .unwrap();
    finish(&mut ctx).unwrap();
    assert_eq!(ctx.current, CopyState::NotApplicable);
    assert!(!ctx.started);
    // The second pass copies off that spare onto the next one.
    assert_eq!(
        ctx.batch[0].disks[1],
        DriveLocation {
            bus: 0,
            enclosure: 0,
            slot: 6
        }
    );
}
