// Copyright 2023 Oxide Computer Company
//! Orchestration of controller-side disk sparing and copy workflows.
//!
//! The workflows themselves (proactive sparing, user-initiated copy, copy
//! to an explicit destination) execute inside the storage controller; this
//! crate drives them from outside for a batch of raid groups: start the
//! operation, walk the ordered checkpoint list, optionally pause at a
//! checkpoint by arming an instrumentation hook, confirm each transition
//! by bounded polling of derived status, and put the world back together
//! afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use uuid::Uuid;

pub mod catalog;
pub mod checkpoint;
pub mod cleanup;
pub mod controller;
pub mod driver;
pub mod hook;
pub mod sim;
pub mod waiter;

pub use catalog::{EventInfo, EventType};
pub use checkpoint::{advance_to, AdvanceMode, CopyState};
pub use cleanup::finish;
pub use controller::{
    CommandStatus, ConfigMode, CopyStatus, DriveInfo, EdgeInfo,
    LifecycleState, Node, ObjectId, SpareController, CHECKPOINT_END,
};
pub use driver::{start_proactive, start_user_copy, start_user_copy_to};
pub use hook::{HookKey, HookKind, HookRegistry, HookSpec};
pub use spareway_common::{
    build_logger, Result, SpareError, WaitSettings,
};
pub use waiter::wait_for_event;

/// Most raid groups one batch may drive at once.
pub const MAX_BATCH: usize = 16;

/// Above this batch size the driver arms the private rebuild-guard hook so
/// the whole batch cannot run to completion before the test looks at it.
pub const REBUILD_GUARD_BATCH: usize = 4;

/// Physical location of a drive.
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
)]
pub struct DriveLocation {
    pub bus: u32,
    pub enclosure: u32,
    pub slot: u32,
}

impl std::fmt::Display for DriveLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.bus, self.enclosure, self.slot)
    }
}

/// One entry in a raid group's extra/spare pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpareSlot {
    pub location: DriveLocation,
    pub consumed: bool,
}

/// Which drive a position is being copied from, remembered from workflow
/// start until cleanup so it can be restored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDisk {
    pub location: DriveLocation,
    pub edge: u32,
}

/*
 * One raid group under test.  Configuration loading creates these; this
 * crate only mutates the device-location bookkeeping as workflows run.
 */
#[derive(Debug, Clone)]
pub struct RaidGroup {
    pub id: Uuid,
    pub enabled: bool,
    pub width: usize,
    /// Device location per position.
    pub disks: Vec<DriveLocation>,
    /// Extra/spare pool.
    pub spares: Vec<SpareSlot>,
    /// Positions whose drive has been physically pulled by the test.
    pub removed: BTreeSet<usize>,
    pub source_disk: Option<SourceDisk>,
}

impl RaidGroup {
    pub fn new(id: Uuid, disks: Vec<DriveLocation>) -> Self {
        RaidGroup {
            id,
            enabled: true,
            width: disks.len(),
            disks,
            spares: Vec::new(),
            removed: BTreeSet::new(),
            source_disk: None,
        }
    }
}

/// Which controller command starts the workflow, and which checkpoints
/// are legal for it.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CopyOperationType {
    ProactiveCopy,
    UserCopy,
    UserCopyTo,
}

impl CopyOperationType {
    /// Only proactive sparing marks the source EOL; the user-initiated
    /// operations have no EOL phase at all.
    pub fn has_eol_phase(&self) -> bool {
        matches!(self, CopyOperationType::ProactiveCopy)
    }
}

impl std::fmt::Display for CopyOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyOperationType::ProactiveCopy => write!(f, "proactive copy"),
            CopyOperationType::UserCopy => write!(f, "user copy"),
            CopyOperationType::UserCopyTo => {
                write!(f, "user copy to destination")
            }
        }
    }
}

/*
 * Knobs for the workflow driver.  `forced_eol_opcode` preserves a known
 * workaround: the original harness overrode the caller's requested SCSI
 * opcode with a fixed value while a controller defect was outstanding.
 * Clearing it to None restores the caller's opcode.
 */
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default)]
pub struct DriverSettings {
    /// When set, error injection always uses this opcode instead of the
    /// one the caller asked for.
    pub forced_eol_opcode: Option<u8>,
    /// Issue synthetic I/O after starting injection to force the fault
    /// path promptly.
    pub issue_io: bool,
    /// Rebuild percentage for `DesiredPercentageRebuilt` pauses.
    pub rebuild_pct: u8,
}

impl Default for DriverSettings {
    fn default() -> Self {
        DriverSettings {
            forced_eol_opcode: Some(0x2a),
            issue_io: true,
            rebuild_pct: 50,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
    Default,
)]
#[serde(default)]
pub struct Settings {
    pub wait: WaitSettings,
    pub driver: DriverSettings,
}

/*
 * All run state for one batch, threaded explicitly through every call.
 * Nothing in this crate lives in module-level statics; a test run owns
 * its context and two runs never share one.
 */
pub struct OrchestratorContext {
    pub controller: Arc<dyn SpareController>,
    pub batch: Vec<RaidGroup>,
    pub hooks: HookRegistry,
    /// Raid groups whose position is currently awaiting (or consuming) a
    /// spare; emptied again as swap-out events are observed.
    pub needs_spare: BTreeSet<Uuid>,
    /// Checkpoint the whole batch has reached.  Advanced monotonically;
    /// only a fresh start rewinds it.
    pub current: CopyState,
    pub op: CopyOperationType,
    /// The position under copy within every raid group of the batch.
    pub position: usize,
    /// Caller-requested opcode for EOL error injection.
    pub scsi_opcode: u8,
    /// Explicit destinations, parallel to `batch`; `UserCopyTo` only.
    pub destinations: Vec<DriveLocation>,
    pub started: bool,
    pub dual_node: bool,
    pub restart_survival: bool,
    pub settings: Settings,
    pub log: Logger,
}

impl OrchestratorContext {
    pub fn new(
        controller: Arc<dyn SpareController>,
        batch: Vec<RaidGroup>,
        op: CopyOperationType,
        position: usize,
        log: Logger,
    ) -> Self {
        OrchestratorContext {
            controller,
            batch,
            hooks: HookRegistry::new(),
            needs_spare: BTreeSet::new(),
            current: CopyState::NotApplicable,
            op,
            position,
            scsi_opcode: 0x2a,
            destinations: Vec::new(),
            started: false,
            dual_node: false,
            restart_survival: false,
            settings: Settings::default(),
            log,
        }
    }

    /// Hooks are mirrored to the peer only when all three hold: the test
    /// spans both nodes, it must survive a node restart, and the peer is
    /// reachable right now.
    pub fn mirror_to_peer(&self) -> bool {
        self.dual_node
            && self.restart_survival
            && self.controller.peer_reachable()
    }

    pub fn rg_ids(&self) -> Vec<Uuid> {
        self.batch.iter().map(|rg| rg.id).collect()
    }
}
