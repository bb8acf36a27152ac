// Copyright 2023 Oxide Computer Company

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hook::HookSpec;
use crate::DriveLocation;
use spareway_common::Result;

/// Identity of a controller-side object (the virtual drive performing the
/// copy for one raid group position).
pub type ObjectId = u64;

/// Rebuild checkpoint value meaning "nothing left to rebuild".
pub const CHECKPOINT_END: u64 = u64::MAX;

/// Which of the two redundant controller nodes subsequent calls address.
#[derive(
    Debug,
    Copy,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    #[default]
    A,
    B,
}

impl Node {
    pub fn other(&self) -> Node {
        match self {
            Node::A => Node::B,
            Node::B => Node::A,
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::A => write!(f, "A"),
            Node::B => write!(f, "B"),
        }
    }
}

/*
 * The connection topology of a copying virtual drive.  A mirror has both
 * edges connected and names the edge being copied from; pass-through has a
 * single connected edge.  Once a copy completes the object reverts to
 * pass-through on what used to be the destination, which is why event
 * predicates sometimes evaluate roles with the edges swapped.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMode {
    PassThruFirstEdge,
    PassThruSecondEdge,
    MirrorFirstEdge,
    MirrorSecondEdge,
    Unknown,
}

impl ConfigMode {
    pub fn mirror_for_source(src: u32) -> ConfigMode {
        if src == 0 {
            ConfigMode::MirrorFirstEdge
        } else {
            ConfigMode::MirrorSecondEdge
        }
    }

    pub fn pass_thru_for_edge(edge: u32) -> ConfigMode {
        if edge == 0 {
            ConfigMode::PassThruFirstEdge
        } else {
            ConfigMode::PassThruSecondEdge
        }
    }

    pub fn is_mirror(&self) -> bool {
        matches!(
            self,
            ConfigMode::MirrorFirstEdge | ConfigMode::MirrorSecondEdge
        )
    }

    pub fn is_pass_thru(&self) -> bool {
        matches!(
            self,
            ConfigMode::PassThruFirstEdge | ConfigMode::PassThruSecondEdge
        )
    }

    /// For pass-through, the one connected edge.
    pub fn sole_edge(&self) -> Option<u32> {
        match self {
            ConfigMode::PassThruFirstEdge => Some(0),
            ConfigMode::PassThruSecondEdge => Some(1),
            _ => None,
        }
    }

    /// For mirror, the edge being copied from.
    pub fn mirror_source(&self) -> Option<u32> {
        match self {
            ConfigMode::MirrorFirstEdge => Some(0),
            ConfigMode::MirrorSecondEdge => Some(1),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Ready,
    Activate,
    Fail,
    Offline,
}

/// One edge of a copying virtual drive, as the controller reports it.
#[derive(Debug, Copy, Clone)]
pub struct EdgeInfo {
    pub enabled: bool,
    pub eol: bool,
}

/// Live status of a copying virtual drive.
#[derive(Debug, Copy, Clone)]
pub struct CopyStatus {
    pub mode: ConfigMode,
    pub lifecycle: LifecycleState,
    pub copy_complete: bool,
    pub request_in_progress: bool,
    /// Rebuild checkpoint per edge; `CHECKPOINT_END` means fully rebuilt.
    pub checkpoint: [u64; 2],
    /// Rebuild logging per edge; cleared when metadata rebuild begins.
    pub rebuild_logging: [bool; 2],
}

/// The physical drive behind one edge.
#[derive(Debug, Copy, Clone)]
pub struct DriveInfo {
    pub location: DriveLocation,
    pub present: bool,
    pub faulted: bool,
    pub lifecycle: LifecycleState,
}

/// Controller response to a user-copy command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Accepted,
    Busy,
    Refused,
}

/*
 * Everything this orchestrator needs from the storage controller.  The
 * workflows themselves run on the other side of this trait; we only query
 * status, issue commands, and manage instrumentation hooks.  A simulated
 * implementation lives in `sim.rs`; production wires this to the real
 * controller transport.
 */
pub trait SpareController {
    // Status queries.
    fn copy_object(&self, rg: Uuid, position: usize) -> Result<ObjectId>;
    fn copy_status(&self, obj: ObjectId) -> Result<CopyStatus>;
    fn edge_status(&self, obj: ObjectId, edge: u32) -> Result<EdgeInfo>;
    fn drive_info(&self, obj: ObjectId, edge: u32) -> Result<DriveInfo>;
    fn usable_capacity(&self, obj: ObjectId) -> Result<u64>;
    fn checkpoint_offset(&self, obj: ObjectId, edge: u32) -> Result<u64>;
    fn chunks_needing_rebuild(&self, obj: ObjectId, edge: u32)
        -> Result<u64>;

    // Commands.
    fn start_error_injection(
        &self,
        obj: ObjectId,
        edge: u32,
        opcode: u8,
    ) -> Result<()>;
    fn stop_error_injection(&self, obj: ObjectId, edge: u32) -> Result<()>;
    fn issue_synthetic_io(&self, obj: ObjectId) -> Result<()>;
    fn enable_deferred_queue(&self) -> Result<()>;
    fn start_user_copy(&self, obj: ObjectId) -> Result<CommandStatus>;
    fn start_user_copy_to(
        &self,
        obj: ObjectId,
        dest: DriveLocation,
    ) -> Result<CommandStatus>;
    fn clear_eol(&self, obj: ObjectId, edge: u32) -> Result<()>;
    fn reinsert_drive(&self, obj: ObjectId, edge: u32) -> Result<()>;

    // Instrumentation.
    fn add_hook(&self, spec: &HookSpec) -> Result<()>;
    fn remove_hook(&self, spec: &HookSpec) -> Result<()>;
    fn hook_hits(&self, spec: &HookSpec) -> Result<u64>;

    // Node context.
    fn addressed_node(&self) -> Node;
    fn set_addressed_node(&self, node: Node);
    fn peer_reachable(&self) -> bool;

    // Environment.
    fn environment_supported(&self) -> bool;
}

/// Run `f` with the controller addressing `node`, restoring the previously
/// addressed node on every exit path, including errors.
pub fn with_node<T, F>(
    controller: &dyn SpareController,
    node: Node,
    f: F,
) -> Result<T>
where
    F: FnOnce(&dyn SpareController) -> Result<T>,
{
    let saved = controller.addressed_node();
    controller.set_addressed_node(node);
    let res = f(controller);
    controller.set_addressed_node(saved);
    res
}
