// Copyright 2023 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::checkpoint::{pause_point, CopyState};
use crate::controller::{
    CommandStatus, ConfigMode, CopyStatus, DriveInfo, EdgeInfo,
    LifecycleState, Node, ObjectId, SpareController, CHECKPOINT_END,
};
use crate::hook::{CompareKind, HookAction, HookSpec, MonitorState,
    MonitorSubstate};
use crate::{DriveLocation, RaidGroup, SpareSlot};
use spareway_common::{precondition_bail, Result, SpareError};

/// Usable capacity, in rebuild chunks, of every simulated object.
pub const SIM_CAPACITY: u64 = 800;

/// Rebuild progress per poll while the rebuild band is active.
pub const REBUILD_STEP: u64 = 100;

/// Destination checkpoint once the metadata region is rebuilt; the user
/// area starts here.  Making metadata completion move the checkpoint is
/// what lets the outside world observe it without the user rebuild
/// having run a single slice.
pub const USER_AREA_START: u64 = REBUILD_STEP;

/*
 * A deterministic stand-in for the storage controller.  State machines in
 * the real controller run on their own clock; here an active object takes
 * exactly one step per status poll (`copy_status`, `edge_status`, or
 * `hook_hits`), so every wait in the orchestrator is what actually drives
 * the simulated workflow forward.  Pause hooks block the step they guard
 * and count a hit, exactly like the controller's scheduler
 * instrumentation.
 *
 * Objects that have no operation running never step, which is what lets
 * timeout paths be tested without waiting on wall-clock time.
 */
pub struct SimController {
    inner: Mutex<SimInner>,
}

#[derive(Default)]
struct SimInner {
    rgs: BTreeMap<Uuid, SimRg>,
    objects: Vec<SimObject>,
    index: BTreeMap<(Uuid, usize), ObjectId>,
    hooks: Vec<SimHook>,
    addressed: Node,
    peer_reachable: bool,
    env_supported: bool,
    refuse_user_copy: bool,
    refuse_hooks_on_b: bool,
    /// Command-surface calls made so far; status queries do not count.
    commands: u64,
}

struct SimRg {
    disks: Vec<DriveLocation>,
    spares: Vec<DriveLocation>,
    next_spare: usize,
}

#[derive(Clone)]
struct SimHook {
    node: Node,
    spec: HookSpec,
    hits: u64,
}

#[derive(Copy, Clone)]
struct SimEdge {
    enabled: bool,
    eol: bool,
}

struct SimObject {
    rg: Uuid,
    position: usize,
    src: u32,
    mode: ConfigMode,
    lifecycle: LifecycleState,
    copy_complete: bool,
    request_in_progress: bool,
    checkpoint: [u64; 2],
    rebuild_logging: [bool; 2],
    edges: [SimEdge; 2],
    drives: [Option<DriveInfo>; 2],
    injected: Option<(u32, u8)>,
    injecting: bool,
    explicit_dest: Option<DriveLocation>,
    active: bool,
    phase: CopyState,
}

impl SimInner {
    fn object_id(&mut self, rg: Uuid, position: usize) -> Result<ObjectId> {
        if let Some(id) = self.index.get(&(rg, position)) {
            return Ok(*id);
        }
        let Some(info) = self.rgs.get(&rg) else {
            precondition_bail!("unknown raid group {}", rg);
        };
        let Some(loc) = info.disks.get(position) else {
            precondition_bail!(
                "position {} out of range for raid group {}",
                position,
                rg
            );
        };

        let id = self.objects.len() as ObjectId;
        self.objects.push(SimObject {
            rg,
            position,
            src: 0,
            mode: ConfigMode::PassThruFirstEdge,
            lifecycle: LifecycleState::Ready,
            copy_complete: false,
            request_in_progress: false,
            checkpoint: [0, 0],
            rebuild_logging: [false, false],
            edges: [
                SimEdge {
                    enabled: true,
                    eol: false,
                },
                SimEdge {
                    enabled: false,
                    eol: false,
                },
            ],
            drives: [
                Some(DriveInfo {
                    location: *loc,
                    present: true,
                    faulted: false,
                    lifecycle: LifecycleState::Ready,
                }),
                None,
            ],
            injected: None,
            injecting: false,
            explicit_dest: None,
            active: false,
            phase: CopyState::NotApplicable,
        });
        self.index.insert((rg, position), id);
        Ok(id)
    }

    fn object(&self, id: ObjectId) -> Result<&SimObject> {
        let Some(o) = self.objects.get(id as usize) else {
            precondition_bail!("no such object {}", id);
        };
        Ok(o)
    }

    fn object_mut(&mut self, id: ObjectId) -> Result<&mut SimObject> {
        let Some(o) = self.objects.get_mut(id as usize) else {
            precondition_bail!("no such object {}", id);
        };
        Ok(o)
    }

    // Activation only marks the operation live; the workflow enters its
    // first checkpoint through a normal (gated) step, so a pause hook at
    // the request point can catch it.  Starting over on an object that
    // already finished a copy treats the surviving edge as the new
    // source.
    fn activate(&mut self, id: ObjectId) {
        let o = &mut self.objects[id as usize];
        if o.active && o.phase == CopyState::OperationComplete {
            let src = o.mode.sole_edge().unwrap_or(0);
            let dst = (1 - src) as usize;
            o.src = src;
            o.phase = CopyState::NotApplicable;
            o.copy_complete = false;
            o.request_in_progress = false;
            o.checkpoint = [0, 0];
            o.rebuild_logging = [false, false];
            o.edges[dst] = SimEdge {
                enabled: false,
                eol: false,
            };
            o.drives[dst] = None;
            o.explicit_dest = None;
            o.injected = None;
        }
        o.active = true;
    }

    fn matching_hooks(
        &self,
        obj: ObjectId,
        state: MonitorState,
        substate: MonitorSubstate,
        compare: CompareKind,
    ) -> Vec<usize> {
        self.hooks
            .iter()
            .enumerate()
            .filter(|(_, h)| {
                h.spec.object == obj
                    && h.spec.state == state
                    && h.spec.substate == substate
                    && h.spec.compare == compare
                    && h.spec.action == HookAction::Pause
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn count_blocked(&mut self, gate: &[usize]) {
        for &h in gate {
            if self.hooks[h].hits == 0 {
                self.hooks[h].hits = 1;
            }
        }
    }

    /*
     * One step of an active object's workflow: either a slice of rebuild
     * progress while the rebuild band runs, or one checkpoint transition.
     * A pause hook at the guarded point blocks the step and records the
     * hit; the workflow stays put until the hook is removed.
     */
    fn step(&mut self, id: ObjectId) {
        let ix = id as usize;
        if ix >= self.objects.len() {
            return;
        }
        let (active, phase, src) = {
            let o = &self.objects[ix];
            (o.active, o.phase, o.src)
        };
        if !active || phase == CopyState::OperationComplete {
            return;
        }
        let dst = (1 - src) as usize;

        if phase == CopyState::UserRebuildStart
            && self.objects[ix].checkpoint[dst] < SIM_CAPACITY
        {
            let cp = self.objects[ix].checkpoint[dst];
            let gate = self.matching_hooks(
                id,
                MonitorState::Rebuild,
                MonitorSubstate::Checkpoint,
                CompareKind::GreaterThan,
            );
            if gate.iter().any(|&h| cp > self.hooks[h].spec.val1) {
                self.count_blocked(&gate);
                return;
            }
            self.objects[ix].checkpoint[dst] =
                (cp + REBUILD_STEP).min(SIM_CAPACITY);
            return;
        }

        let Some(next) = phase.next() else {
            return;
        };
        let (state, substate) = pause_point(next);
        let gate =
            self.matching_hooks(id, state, substate, CompareKind::Equal);
        if !gate.is_empty() {
            self.count_blocked(&gate);
            return;
        }

        if self.transition(ix, next) {
            self.objects[ix].phase = next;
        }
    }

    /// Apply the side effects of entering `next`.  Returns false when the
    /// transition cannot happen yet (no spare to swap in), in which case
    /// the phase stays put.
    fn transition(&mut self, ix: usize, next: CopyState) -> bool {
        let (rg, src, injecting, explicit_dest) = {
            let o = &self.objects[ix];
            (o.rg, o.src as usize, o.injecting, o.explicit_dest)
        };
        let dst = 1 - src;

        match next {
            CopyState::SourceMarkedEol => {
                if injecting {
                    self.objects[ix].edges[src].eol = true;
                }
            }
            CopyState::DestSwapInStart => {
                let location = match explicit_dest {
                    Some(loc) => loc,
                    None => {
                        // Next unconsumed spare of the owning raid group;
                        // the last one is reused once the pool runs dry.
                        let info = self.rgs.get_mut(&rg).unwrap();
                        let slot = info.next_spare;
                        let Some(&loc) =
                            info.spares.get(slot).or_else(|| info.spares.last())
                        else {
                            // No spare pool at all; the swap-in never
                            // happens.
                            return false;
                        };
                        info.next_spare += 1;
                        loc
                    }
                };
                let o = &mut self.objects[ix];
                o.drives[dst] = Some(DriveInfo {
                    location,
                    present: true,
                    faulted: false,
                    lifecycle: LifecycleState::Ready,
                });
                o.edges[dst] = SimEdge {
                    enabled: true,
                    eol: false,
                };
                o.checkpoint[dst] = 0;
                o.rebuild_logging[dst] = true;
            }
            CopyState::ModeSetToMirror => {
                self.objects[ix].mode =
                    ConfigMode::mirror_for_source(src as u32);
            }
            CopyState::MetadataRebuildStart => {
                self.objects[ix].rebuild_logging[dst] = false;
            }
            CopyState::MetadataRebuildComplete => {
                self.objects[ix].checkpoint[dst] = USER_AREA_START;
            }
            CopyState::UserRebuildComplete => {
                self.objects[ix].checkpoint[dst] = CHECKPOINT_END;
            }
            CopyState::InitiateCopyCompleteJob => {
                let o = &mut self.objects[ix];
                o.copy_complete = true;
                o.request_in_progress = true;
            }
            CopyState::ModeSetToPassThru => {
                self.objects[ix].mode =
                    ConfigMode::pass_thru_for_edge(dst as u32);
            }
            CopyState::SourceSwapOutComplete => {
                let o = &mut self.objects[ix];
                o.request_in_progress = false;
                o.checkpoint[src] = CHECKPOINT_END;
                o.edges[src].enabled = false;
            }
            CopyState::OperationComplete => {
                let o = &mut self.objects[ix];
                if o.checkpoint[src] != CHECKPOINT_END {
                    o.checkpoint[src] = CHECKPOINT_END;
                }
            }
            _ => {}
        }
        true
    }
}

impl SimController {
    pub fn new() -> Self {
        SimController {
            inner: Mutex::new(SimInner {
                peer_reachable: true,
                env_supported: true,
                ..Default::default()
            }),
        }
    }

    /// Fabricate `count` raid groups of `width` drives plus two spares
    /// each, register them with the simulator, and return them ready to
    /// go into a batch.
    pub fn sim_batch(&self, count: usize, width: usize) -> Vec<RaidGroup> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let id = Uuid::new_v4();
            let disks: Vec<DriveLocation> = (0..width)
                .map(|j| DriveLocation {
                    bus: 0,
                    enclosure: i as u32,
                    slot: j as u32,
                })
                .collect();
            let spares: Vec<DriveLocation> = (0..2)
                .map(|k| DriveLocation {
                    bus: 0,
                    enclosure: i as u32,
                    slot: (width + k) as u32,
                })
                .collect();
            inner.rgs.insert(
                id,
                SimRg {
                    disks: disks.clone(),
                    spares: spares.clone(),
                    next_spare: 0,
                },
            );
            let mut rg = RaidGroup::new(id, disks);
            rg.spares = spares
                .into_iter()
                .map(|location| SpareSlot {
                    location,
                    consumed: false,
                })
                .collect();
            out.push(rg);
        }
        out
    }

    /// Mark the source edge EOL directly, as if the drive degraded on its
    /// own, without starting any operation.
    pub fn force_eol(&self, rg: Uuid, position: usize) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.object_id(rg, position).unwrap();
        let src = inner.objects[id as usize].src as usize;
        inner.objects[id as usize].edges[src].eol = true;
    }

    pub fn eol_set(&self, rg: Uuid, position: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.object_id(rg, position).unwrap();
        let src = inner.objects[id as usize].src as usize;
        inner.objects[id as usize].edges[src].eol
    }

    /// Pull the source drive: not present, faulted, failed lifecycle.
    pub fn remove_source_drive(&self, rg: Uuid, position: usize) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.object_id(rg, position).unwrap();
        let src = inner.objects[id as usize].src as usize;
        if let Some(d) = inner.objects[id as usize].drives[src].as_mut() {
            d.present = false;
            d.faulted = true;
            d.lifecycle = LifecycleState::Fail;
        }
    }

    pub fn phase_of(&self, rg: Uuid, position: usize) -> CopyState {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.object_id(rg, position).unwrap();
        inner.objects[id as usize].phase
    }

    /// Rebuild checkpoint without stepping the workflow.
    pub fn peek_checkpoint(
        &self,
        rg: Uuid,
        position: usize,
        edge: u32,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.object_id(rg, position).unwrap();
        inner.objects[id as usize].checkpoint[edge as usize]
    }

    pub fn injected_opcode(&self, rg: Uuid, position: usize) -> Option<u8> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.object_id(rg, position).unwrap();
        inner.objects[id as usize].injected.map(|(_, op)| op)
    }

    pub fn hook_count_on(&self, node: Node) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.hooks.iter().filter(|h| h.node == node).count()
    }

    pub fn set_peer_reachable(&self, reachable: bool) {
        self.inner.lock().unwrap().peer_reachable = reachable;
    }

    pub fn set_env_supported(&self, supported: bool) {
        self.inner.lock().unwrap().env_supported = supported;
    }

    pub fn refuse_user_copy(&self) {
        self.inner.lock().unwrap().refuse_user_copy = true;
    }

    /// Make hook registration fail on node B, as a rejecting or
    /// unreachable peer would.
    pub fn refuse_hooks_on_b(&self) {
        self.inner.lock().unwrap().refuse_hooks_on_b = true;
    }

    pub fn commands_issued(&self) -> u64 {
        self.inner.lock().unwrap().commands
    }
}

impl Default for SimController {
    fn default() -> Self {
        Self::new()
    }
}

impl SpareController for SimController {
    fn copy_object(&self, rg: Uuid, position: usize) -> Result<ObjectId> {
        self.inner.lock().unwrap().object_id(rg, position)
    }

    fn copy_status(&self, obj: ObjectId) -> Result<CopyStatus> {
        let mut inner = self.inner.lock().unwrap();
        inner.step(obj);
        let o = inner.object(obj)?;
        Ok(CopyStatus {
            mode: o.mode,
            lifecycle: o.lifecycle,
            copy_complete: o.copy_complete,
            request_in_progress: o.request_in_progress,
            checkpoint: o.checkpoint,
            rebuild_logging: o.rebuild_logging,
        })
    }

    fn edge_status(&self, obj: ObjectId, edge: u32) -> Result<EdgeInfo> {
        let mut inner = self.inner.lock().unwrap();
        inner.step(obj);
        let o = inner.object(obj)?;
        let e = o.edges[edge as usize];
        Ok(EdgeInfo {
            enabled: e.enabled,
            eol: e.eol,
        })
    }

    fn drive_info(&self, obj: ObjectId, edge: u32) -> Result<DriveInfo> {
        let inner = self.inner.lock().unwrap();
        let o = inner.object(obj)?;
        Ok(o.drives[edge as usize].unwrap_or(DriveInfo {
            location: DriveLocation {
                bus: 0,
                enclosure: 0,
                slot: 0,
            },
            present: false,
            faulted: false,
            lifecycle: LifecycleState::Offline,
        }))
    }

    fn usable_capacity(&self, obj: ObjectId) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        inner.object(obj)?;
        Ok(SIM_CAPACITY)
    }

    fn checkpoint_offset(&self, obj: ObjectId, _edge: u32) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        inner.object(obj)?;
        Ok(0)
    }

    fn chunks_needing_rebuild(
        &self,
        obj: ObjectId,
        edge: u32,
    ) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        let o = inner.object(obj)?;
        let cp = o.checkpoint[edge as usize];
        if cp == CHECKPOINT_END {
            Ok(0)
        } else {
            Ok(SIM_CAPACITY.saturating_sub(cp))
        }
    }

    fn start_error_injection(
        &self,
        obj: ObjectId,
        edge: u32,
        opcode: u8,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands += 1;
        inner.object(obj)?;
        inner.activate(obj);
        let o = inner.object_mut(obj)?;
        o.injected = Some((edge, opcode));
        o.injecting = true;
        // The injected errors push the drive over its EOL threshold.
        o.edges[edge as usize].eol = true;
        Ok(())
    }

    fn stop_error_injection(&self, obj: ObjectId, _edge: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands += 1;
        inner.object_mut(obj)?.injecting = false;
        Ok(())
    }

    fn issue_synthetic_io(&self, obj: ObjectId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands += 1;
        inner.object(obj)?;
        Ok(())
    }

    fn enable_deferred_queue(&self) -> Result<()> {
        self.inner.lock().unwrap().commands += 1;
        Ok(())
    }

    fn start_user_copy(&self, obj: ObjectId) -> Result<CommandStatus> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands += 1;
        inner.object(obj)?;
        if inner.refuse_user_copy {
            return Ok(CommandStatus::Refused);
        }
        inner.activate(obj);
        Ok(CommandStatus::Accepted)
    }

    fn start_user_copy_to(
        &self,
        obj: ObjectId,
        dest: DriveLocation,
    ) -> Result<CommandStatus> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands += 1;
        inner.object(obj)?;
        if inner.refuse_user_copy {
            return Ok(CommandStatus::Refused);
        }
        inner.activate(obj);
        inner.object_mut(obj)?.explicit_dest = Some(dest);
        Ok(CommandStatus::Accepted)
    }

    fn clear_eol(&self, obj: ObjectId, edge: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands += 1;
        inner.object_mut(obj)?.edges[edge as usize].eol = false;
        Ok(())
    }

    fn reinsert_drive(&self, obj: ObjectId, edge: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands += 1;
        let o = inner.object_mut(obj)?;
        if let Some(d) = o.drives[edge as usize].as_mut() {
            d.present = true;
            d.faulted = false;
            d.lifecycle = LifecycleState::Ready;
        }
        Ok(())
    }

    fn add_hook(&self, spec: &HookSpec) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.addressed;
        if node == Node::B && inner.refuse_hooks_on_b {
            return Err(SpareError::CommandFailed(
                "peer rejected the hook".to_string(),
            ));
        }
        inner.hooks.push(SimHook {
            node,
            spec: spec.clone(),
            hits: 0,
        });
        Ok(())
    }

    fn remove_hook(&self, spec: &HookSpec) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.addressed;
        let Some(pos) = inner
            .hooks
            .iter()
            .position(|h| h.node == node && h.spec == *spec)
        else {
            precondition_bail!(
                "no hook at {:?}/{:?} for object {} on node {}",
                spec.state,
                spec.substate,
                spec.object,
                node
            );
        };
        inner.hooks.remove(pos);
        Ok(())
    }

    fn hook_hits(&self, spec: &HookSpec) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.step(spec.object);
        let node = inner.addressed;
        let Some(h) = inner
            .hooks
            .iter()
            .find(|h| h.node == node && h.spec == *spec)
        else {
            precondition_bail!(
                "no hook at {:?}/{:?} for object {} on node {}",
                spec.state,
                spec.substate,
                spec.object,
                node
            );
        };
        Ok(h.hits)
    }

    fn addressed_node(&self) -> Node {
        self.inner.lock().unwrap().addressed
    }

    fn set_addressed_node(&self, node: Node) {
        self.inner.lock().unwrap().addressed = node;
    }

    fn peer_reachable(&self) -> bool {
        self.inner.lock().unwrap().peer_reachable
    }

    fn environment_supported(&self) -> bool {
        self.inner.lock().unwrap().env_supported
    }
}
