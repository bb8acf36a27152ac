// Copyright 2023 Oxide Computer Company

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::CopyState;
use crate::controller::{with_node, ObjectId, SpareController};
use spareway_common::{precondition_bail, Result};

/*
 * Instrumentation points are named by a (monitor state, substate) pair,
 * matching how the controller's own scheduler identifies them.  Two
 * checkpoints deliberately share the (Rebuild, Complete) point; the hook
 * registry keeps them apart by key, the controller cannot.
 */
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Sparing,
    SwapIn,
    Mirror,
    Rebuild,
    CopyComplete,
    SwapOut,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MonitorSubstate {
    Requested,
    Started,
    EolSet,
    Start,
    Complete,
    MirrorSet,
    MetadataStart,
    MetadataComplete,
    Entry,
    Checkpoint,
    Initiate,
    PassThruSet,
    Done,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareKind {
    Equal,
    GreaterThan,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    /// Halt the workflow at the instrumentation point.
    Pause,
    /// Log each pass through the point, do not halt.
    Log,
    /// Count passes only.
    Count,
}

/// What gets registered with the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    pub object: ObjectId,
    pub state: MonitorState,
    pub substate: MonitorSubstate,
    pub val1: u64,
    pub val2: u64,
    pub compare: CompareKind,
    pub action: HookAction,
}

/*
 * One hook per (raid group, kind).  `RebuildGuard` is the private
 * rebuild-complete hook armed alongside any user-visible hook whenever
 * sparing begins, so a fast workflow cannot race past the point a test
 * wants to inspect.
 */
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Checkpoint(CopyState),
    RebuildGuard,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HookKey {
    pub rg: Uuid,
    pub kind: HookKind,
}

#[derive(Debug, Clone)]
struct ArmedHook {
    spec: HookSpec,
    mirrored: bool,
    /// Unregistered from this node's controller, but the record is kept so
    /// a resumed process can finish clearing it after a node restart.
    retained: bool,
}

#[derive(Debug, Default)]
pub struct HookRegistry {
    armed: BTreeMap<HookKey, ArmedHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self, key: &HookKey) -> bool {
        self.armed.contains_key(key)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    pub fn spec(&self, key: &HookKey) -> Option<&HookSpec> {
        self.armed.get(key).map(|a| &a.spec)
    }

    /// Every armed key, in key order.
    pub fn armed_keys(&self) -> Vec<HookKey> {
        self.armed.keys().copied().collect()
    }

    /// Register `spec` with the controller on the addressed node, and on
    /// the peer as well when `mirror_to_peer` is set.  Finding the key
    /// already armed is a caller bug and leaves the existing hook alone.
    pub fn arm(
        &mut self,
        controller: &dyn SpareController,
        key: HookKey,
        spec: HookSpec,
        mirror_to_peer: bool,
    ) -> Result<()> {
        if self.armed.contains_key(&key) {
            precondition_bail!(
                "hook already set for rg {} kind {:?}",
                key.rg,
                key.kind
            );
        }

        controller.add_hook(&spec)?;
        if mirror_to_peer {
            let peer = controller.addressed_node().other();
            if let Err(e) = with_node(controller, peer, |c| c.add_hook(&spec))
            {
                // Half a mirrored hook must not stay registered on this
                // node; it would be invisible to every later disarm.
                let _ = controller.remove_hook(&spec);
                return Err(e);
            }
        }

        self.armed.insert(
            key,
            ArmedHook {
                spec,
                mirrored: mirror_to_peer,
                retained: false,
            },
        );
        Ok(())
    }

    /// Has the controller counted at least one pass through this hook?
    pub fn check_hit(
        &self,
        controller: &dyn SpareController,
        key: &HookKey,
    ) -> Result<bool> {
        let Some(armed) = self.armed.get(key) else {
            precondition_bail!(
                "check_hit on idle hook for rg {} kind {:?}",
                key.rg,
                key.kind
            );
        };
        Ok(controller.hook_hits(&armed.spec)? > 0)
    }

    /// Unregister the hook from the controller (and the peer when it was
    /// mirrored).  With `restart_survival` and no mirroring the local
    /// record is kept in the table so the post-restart process can still
    /// find it; a second disarm finishes the job.
    pub fn disarm(
        &mut self,
        controller: &dyn SpareController,
        key: &HookKey,
        mirror_to_peer: bool,
        restart_survival: bool,
    ) -> Result<()> {
        let Some(armed) = self.armed.get_mut(key) else {
            precondition_bail!(
                "disarm of idle hook for rg {} kind {:?}",
                key.rg,
                key.kind
            );
        };

        if !armed.retained {
            controller.remove_hook(&armed.spec)?;
        }
        if mirror_to_peer && armed.mirrored {
            let spec = armed.spec.clone();
            let peer = controller.addressed_node().other();
            with_node(controller, peer, |c| c.remove_hook(&spec))?;
        }

        if restart_survival && !mirror_to_peer {
            armed.retained = true;
        } else {
            self.armed.remove(key);
        }
        Ok(())
    }

    /// Safety net at the end of a run: unregister whatever is still armed
    /// and drop every record.  Individual removal failures are ignored; a
    /// hook that is already gone is exactly what we want.
    pub fn clear_all(&mut self, controller: &dyn SpareController) {
        for armed in self.armed.values() {
            if !armed.retained {
                let _ = controller.remove_hook(&armed.spec);
            }
        }
        self.armed.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::Node;
    use crate::sim::SimController;
    use spareway_common::SpareError;

    fn spec_for(obj: ObjectId) -> HookSpec {
        HookSpec {
            object: obj,
            state: MonitorState::Rebuild,
            substate: MonitorSubstate::Complete,
            val1: 0,
            val2: 0,
            compare: CompareKind::Equal,
            action: HookAction::Pause,
        }
    }

    fn key_for(rg: Uuid) -> HookKey {
        HookKey {
            rg,
            kind: HookKind::RebuildGuard,
        }
    }

    #[test]
    fn arm_and_disarm() {
        let sim = SimController::new();
        let mut rgs = sim.sim_batch(1, 5);
        let rg = rgs.remove(0);
        let obj = sim.copy_object(rg.id, 1).unwrap();

        let mut reg = HookRegistry::new();
        let key = key_for(rg.id);
        reg.arm(&sim, key, spec_for(obj), false).unwrap();
        assert!(reg.is_armed(&key));
        assert_eq!(sim.hook_count_on(Node::A), 1);
        assert_eq!(sim.hook_count_on(Node::B), 0);

        assert!(!reg.check_hit(&sim, &key).unwrap());

        reg.disarm(&sim, &key, false, false).unwrap();
        assert!(!reg.is_armed(&key));
        assert_eq!(sim.hook_count_on(Node::A), 0);
    }

    #[test]
    fn arm_twice_fails_and_keeps_the_original() {
        let sim = SimController::new();
        let mut rgs = sim.sim_batch(1, 5);
        let rg = rgs.remove(0);
        let obj = sim.copy_object(rg.id, 1).unwrap();

        let mut reg = HookRegistry::new();
        let key = key_for(rg.id);
        let spec = spec_for(obj);
        reg.arm(&sim, key, spec.clone(), false).unwrap();

        let mut other = spec.clone();
        other.substate = MonitorSubstate::Entry;
        match reg.arm(&sim, key, other, false) {
            Err(SpareError::Precondition(_)) => {}
            x => panic!("expected precondition failure, got {:?}", x),
        }
        // Original spec untouched, still a single controller-side hook.
        assert_eq!(reg.spec(&key), Some(&spec));
        assert_eq!(sim.hook_count_on(Node::A), 1);
    }

    #[test]
    fn disarm_idle_fails() {
        let sim = SimController::new();
        let mut reg = HookRegistry::new();
        let key = key_for(Uuid::new_v4());
        match reg.disarm(&sim, &key, false, false) {
            Err(SpareError::Precondition(_)) => {}
            x => panic!("expected precondition failure, got {:?}", x),
        }
    }

    #[test]
    fn mirrored_arm_registers_on_the_peer() {
        let sim = SimController::new();
        let mut rgs = sim.sim_batch(1, 5);
        let rg = rgs.remove(0);
        let obj = sim.copy_object(rg.id, 1).unwrap();

        let mut reg = HookRegistry::new();
        let key = key_for(rg.id);
        reg.arm(&sim, key, spec_for(obj), true).unwrap();
        assert_eq!(sim.hook_count_on(Node::A), 1);
        assert_eq!(sim.hook_count_on(Node::B), 1);
        // The addressed node is back where it started.
        assert_eq!(sim.addressed_node(), Node::A);

        reg.disarm(&sim, &key, true, true).unwrap();
        assert_eq!(sim.hook_count_on(Node::A), 0);
        assert_eq!(sim.hook_count_on(Node::B), 0);
        assert!(!reg.is_armed(&key));
    }

    #[test]
    fn failed_mirror_unregisters_the_local_hook() {
        let sim = SimController::new();
        let mut rgs = sim.sim_batch(1, 5);
        let rg = rgs.remove(0);
        let obj = sim.copy_object(rg.id, 1).unwrap();
        sim.refuse_hooks_on_b();

        let mut reg = HookRegistry::new();
        let key = key_for(rg.id);
        match reg.arm(&sim, key, spec_for(obj), true) {
            Err(SpareError::CommandFailed(_)) => {}
            x => panic!("expected command failure, got {:?}", x),
        }
        // Neither side keeps the hook and the key stays idle, so a
        // later arm is not shadowed by a leaked registration.
        assert_eq!(sim.hook_count_on(Node::A), 0);
        assert_eq!(sim.hook_count_on(Node::B), 0);
        assert!(!reg.is_armed(&key));
        assert_eq!(sim.addressed_node(), Node::A);
    }

    #[test]
    fn restart_survival_disarm_retains_the_record() {
        let sim = SimController::new();
        let mut rgs = sim.sim_batch(1, 5);
        let rg = rgs.remove(0);
        let obj = sim.copy_object(rg.id, 1).unwrap();

        let mut reg = HookRegistry::new();
        let key = key_for(rg.id);
        reg.arm(&sim, key, spec_for(obj), false).unwrap();

        reg.disarm(&sim, &key, false, true).unwrap();
        // Controller-side hook is gone, but the record survives for the
        // resumed process.
        assert_eq!(sim.hook_count_on(Node::A), 0);
        assert!(reg.is_armed(&key));

        // The resumed process finishes the job.
        reg.disarm(&sim, &key, false, false).unwrap();
        assert!(!reg.is_armed(&key));
    }

    #[test]
    fn clear_all_empties_the_table() {
        let sim = SimController::new();
        let rgs = sim.sim_batch(2, 5);
        let mut reg = HookRegistry::new();
        for rg in &rgs {
            let obj = sim.copy_object(rg.id, 1).unwrap();
            reg.arm(&sim, key_for(rg.id), spec_for(obj), false).unwrap();
        }
        assert_eq!(reg.armed_count(), 2);
        assert_eq!(sim.hook_count_on(Node::A), 2);

        reg.clear_all(&sim);
        assert_eq!(reg.armed_count(), 0);
        assert_eq!(sim.hook_count_on(Node::A), 0);
    }
}
