//! Tracked addresses and the memory edits that arm and disarm them.
//!
//! A tracker is either a software breakpoint (a trap byte written over the
//! first instruction byte) or an inline hook (a jump into a self-removing
//! trampoline). Trackers live in a [`TrackerSet`] arena and are addressed by
//! [`TrackerId`]. Removal leaves a tombstone so ids stay stable.

use crate::config::PoolSettings;
use crate::error::{HookError, TracepinError};
use crate::pool::{PoolId, PoolSet};
use crate::target::{Address, ProcessMemory};
use crate::trampoline::{self, Form, NEAR_THRESHOLD, PROLOGUE_SNAPSHOT_LEN, TRAMPOLINE_MAX_LEN};
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;

/// `int3`
pub const TRAP_BYTE: u8 = 0xCC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TrackerId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInfo {
    pub original_byte: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInfo {
    pub pool: PoolId,
    pub trampoline: Address,
    pub form: Form,
    /// Prologue bytes the jump overwrites.
    pub replaced: Vec<u8>,
    pub jump: Vec<u8>,
    pub hit_offset: usize,
}

impl HookInfo {
    pub fn hit_address(&self) -> Address {
        self.trampoline + self.hit_offset as Address
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerKind {
    Removed,
    Breakpoint(BreakpointInfo),
    Hook(HookInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracker {
    pub address: Address,
    pub kind: TrackerKind,
    pub enabled: bool,
    pub hit: bool,
}

/// Which trackers a filter pass removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterMode {
    /// Drop trackers that were hit.
    Executed,
    /// Drop enabled trackers that were not hit.
    NotExecuted,
}

impl FilterMode {
    /// Trackers that were never enabled survive `NotExecuted`.
    pub fn removes(self, tracker: &Tracker) -> bool {
        match self {
            FilterMode::Executed => tracker.hit,
            FilterMode::NotExecuted => !tracker.hit && tracker.enabled,
        }
    }
}

impl Tracker {
    pub fn is_live(&self) -> bool {
        !matches!(self.kind, TrackerKind::Removed)
    }

    pub fn is_breakpoint(&self) -> bool {
        matches!(self.kind, TrackerKind::Breakpoint(_))
    }

    /// Writes the instrumentation into the target. The caller checks debugger
    /// availability for breakpoints first.
    pub fn enable(&mut self, process: &dyn ProcessMemory) -> Result<(), TracepinError> {
        match &self.kind {
            TrackerKind::Removed => return Err(TracepinError::TrackerNotFound(self.address)),
            TrackerKind::Breakpoint(_) => process
                .write_flush(self.address, &[TRAP_BYTE])
                .map_err(TracepinError::MemoryWrite)?,
            TrackerKind::Hook(hook) => {
                process
                    .write_flush(hook.hit_address(), &[0])
                    .map_err(TracepinError::MemoryWrite)?;
                process
                    .write_flush(self.address, &hook.jump)
                    .map_err(TracepinError::MemoryWrite)?;
            }
        }
        self.enabled = true;
        debug!("Enabled tracker at {:#x}", self.address);
        Ok(())
    }

    /// Puts a breakpoint's original byte back. Hooks are only marked disabled:
    /// an armed hook removes itself the next time it runs.
    pub fn disable(&mut self, process: &dyn ProcessMemory) {
        self.restore_breakpoint_byte(process);
        self.enabled = false;
        debug!("Disabled tracker at {:#x}", self.address);
    }

    /// Turns the tracker into a tombstone.
    pub fn release(&mut self, process: Option<&dyn ProcessMemory>) {
        if let Some(process) = process {
            self.restore_breakpoint_byte(process);
        }
        self.kind = TrackerKind::Removed;
        self.enabled = false;
        self.hit = false;
    }

    fn restore_breakpoint_byte(&self, process: &dyn ProcessMemory) {
        if let TrackerKind::Breakpoint(bp) = &self.kind {
            if let Err(e) = process.write_flush(self.address, &[bp.original_byte]) {
                warn!(
                    "Failed to restore original byte at {:#x}: {e}",
                    self.address
                );
            }
        }
    }

    /// Reads the hook's hit byte. A set byte means the trampoline ran and the
    /// prologue is already restored, so the hook is no longer armed.
    pub fn poll_hook(&mut self, process: &dyn ProcessMemory) -> Result<bool, TracepinError> {
        let TrackerKind::Hook(hook) = &self.kind else {
            return Ok(false);
        };
        let hit = process
            .read_byte(hook.hit_address())
            .map_err(TracepinError::MemoryRead)?
            != 0;
        if hit {
            self.hit = true;
            self.enabled = false;
        }
        Ok(hit)
    }
}

/// Reads the byte a breakpoint at `address` would replace.
pub fn breakpoint_at(
    process: &dyn ProcessMemory,
    address: Address,
) -> Result<TrackerKind, TracepinError> {
    let original_byte = process
        .read_byte(address)
        .map_err(TracepinError::MemoryRead)?;
    Ok(TrackerKind::Breakpoint(BreakpointInfo { original_byte }))
}

/// Places and writes a trampoline for `address`, a function of `function_len` bytes.
///
/// Pool space is only consumed once the trampoline is in the target.
pub fn hook_at(
    process: &dyn ProcessMemory,
    pools: &mut PoolSet,
    address: Address,
    function_len: u32,
    settings: &PoolSettings,
) -> Result<TrackerKind, HookError> {
    let shortest = Form::Near.jump_len() as u32;
    if function_len < shortest {
        return Err(HookError::FunctionTooShort {
            declared: function_len,
            required: shortest,
        });
    }

    let pool_id = pools.find_or_create(
        process,
        address,
        TRAMPOLINE_MAX_LEN as u64,
        NEAR_THRESHOLD,
        settings,
    )?;
    let slot = pools
        .get(pool_id)
        .map(|pool| pool.cursor)
        .ok_or(HookError::PoolExhausted)?;

    let form = Form::select(address, slot);
    let required = form.jump_len() as u32;
    if function_len < required {
        return Err(HookError::FunctionTooShort {
            declared: function_len,
            required,
        });
    }

    let snapshot_len = match form {
        Form::Near => form.jump_len(),
        Form::Far => PROLOGUE_SNAPSHOT_LEN,
    };
    let mut prologue = [0u8; PROLOGUE_SNAPSHOT_LEN];
    process.read(address, &mut prologue[..snapshot_len])?;

    let t = trampoline::synthesize(address, slot, &prologue);
    process.write_flush(t.address, &t.code)?;
    // The trampoline writes back the whole snapshot, not just the jump.
    process.protect_executable(address, snapshot_len)?;
    pools.bump(pool_id, t.code.len() as u64);
    debug!(
        "Placed {:?} trampoline for {address:#x} at {:#x}",
        t.form, t.address
    );

    Ok(TrackerKind::Hook(HookInfo {
        pool: pool_id,
        trampoline: t.address,
        form: t.form,
        replaced: t.replaced,
        jump: t.jump,
        hit_offset: t.hit_offset,
    }))
}

/// A read-only view of one live tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerInfo {
    pub address: Address,
    pub kind: TrackerInfoKind,
    pub enabled: bool,
    pub hit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum TrackerInfoKind {
    Breakpoint {
        original_byte: u8,
    },
    Hook {
        trampoline: Address,
        form: Form,
        replaced: Vec<u8>,
        hit_offset: usize,
    },
}

impl TrackerInfo {
    fn from_tracker(tracker: &Tracker) -> Option<Self> {
        let kind = match &tracker.kind {
            TrackerKind::Removed => return None,
            TrackerKind::Breakpoint(bp) => TrackerInfoKind::Breakpoint {
                original_byte: bp.original_byte,
            },
            TrackerKind::Hook(hook) => TrackerInfoKind::Hook {
                trampoline: hook.trampoline,
                form: hook.form,
                replaced: hook.replaced.clone(),
                hit_offset: hook.hit_offset,
            },
        };
        Some(Self {
            address: tracker.address,
            kind,
            enabled: tracker.enabled,
            hit: tracker.hit,
        })
    }
}

/// Arena of trackers with an index of live addresses.
#[derive(Debug, Default)]
pub struct TrackerSet {
    trackers: Vec<Tracker>,
    by_address: HashMap<Address, TrackerId>,
}

impl TrackerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a disabled, unhit tracker. Fails if a live tracker already covers `address`.
    pub fn insert(&mut self, address: Address, kind: TrackerKind) -> Result<TrackerId, TracepinError> {
        if self.by_address.contains_key(&address) {
            return Err(TracepinError::TrackerAlreadyExists(address));
        }
        let id = TrackerId(self.trackers.len());
        self.trackers.push(Tracker {
            address,
            kind,
            enabled: false,
            hit: false,
        });
        self.by_address.insert(address, id);
        Ok(id)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.by_address.contains_key(&address)
    }

    pub fn find(&self, address: Address) -> Option<TrackerId> {
        self.by_address.get(&address).copied()
    }

    pub fn get(&self, id: TrackerId) -> Option<&Tracker> {
        self.trackers.get(id.0)
    }

    pub fn get_mut(&mut self, id: TrackerId) -> Option<&mut Tracker> {
        self.trackers.get_mut(id.0)
    }

    /// Live tracker at `address`.
    pub fn lookup_mut(&mut self, address: Address) -> Result<&mut Tracker, TracepinError> {
        let id = self
            .find(address)
            .ok_or(TracepinError::TrackerNotFound(address))?;
        self.trackers
            .get_mut(id.0)
            .ok_or(TracepinError::TrackerNotFound(address))
    }

    /// Tombstones the tracker at `address`, restoring a breakpoint's byte if `process` is given.
    pub fn remove(
        &mut self,
        address: Address,
        process: Option<&dyn ProcessMemory>,
    ) -> Result<(), TracepinError> {
        let id = self
            .by_address
            .remove(&address)
            .ok_or(TracepinError::TrackerNotFound(address))?;
        if let Some(tracker) = self.trackers.get_mut(id.0) {
            tracker.release(process);
        }
        debug!("Removed tracker at {address:#x}");
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = TrackerId> + '_ {
        self.iter_live().map(|(id, _)| id)
    }

    /// Live trackers in insertion order.
    pub fn iter_live(&self) -> impl Iterator<Item = (TrackerId, &Tracker)> {
        self.trackers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_live())
            .map(|(i, t)| (TrackerId(i), t))
    }

    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut Tracker> {
        self.trackers.iter_mut().filter(|t| t.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.by_address.len()
    }

    pub fn reset_hits(&mut self) {
        for tracker in &mut self.trackers {
            tracker.hit = false;
        }
    }

    /// Removes every tracker `mode` selects and clears the hit flag on the
    /// rest. Returns how many were removed.
    pub fn filter(&mut self, mode: FilterMode, process: Option<&dyn ProcessMemory>) -> usize {
        let mut removed = 0;
        for tracker in self.trackers.iter_mut().filter(|t| t.is_live()) {
            if mode.removes(tracker) {
                self.by_address.remove(&tracker.address);
                tracker.release(process);
                removed += 1;
            } else {
                tracker.hit = false;
            }
        }
        debug!("Filter {mode:?} removed {removed} trackers");
        removed
    }

    pub fn snapshot(&self) -> Vec<TrackerInfo> {
        self.trackers
            .iter()
            .filter_map(TrackerInfo::from_tracker)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Execution, MAIN_TID, Protection, SimulatedTarget};
    use crate::target::TargetAccess;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const PID: u32 = 11;
    const CODE: Address = 0x1_4000_0000;
    const PROLOGUE: [u8; 16] = [
        0x48, 0x89, 0x5C, 0x24, 0x08, 0x57, 0x48, 0x83, 0xEC, 0x20, 0x8B, 0xD9, 0x33, 0xC0, 0x90,
        0xC3,
    ];

    fn setup() -> (SimulatedTarget, Box<dyn ProcessMemory>) {
        let sim = SimulatedTarget::new();
        sim.spawn(PID);
        sim.map(PID, CODE, 0x10000, Protection::ReadExecute).unwrap();
        sim.poke(PID, CODE, &PROLOGUE).unwrap();
        let handle = sim.open(PID).unwrap();
        (sim, handle)
    }

    fn breakpoint(original_byte: u8) -> TrackerKind {
        TrackerKind::Breakpoint(BreakpointInfo { original_byte })
    }

    #[test]
    fn insert_rejects_duplicate_live_address() {
        let mut set = TrackerSet::new();
        set.insert(0x1000, breakpoint(0x90)).unwrap();
        assert_eq!(
            set.insert(0x1000, breakpoint(0x90)),
            Err(TracepinError::TrackerAlreadyExists(0x1000))
        );
        set.remove(0x1000, None).unwrap();
        let id = set.insert(0x1000, breakpoint(0x90)).unwrap();
        assert_eq!(id, TrackerId(1));
        assert_eq!(set.get(TrackerId(0)).unwrap().kind, TrackerKind::Removed);
    }

    #[test]
    fn random_add_remove_keeps_addresses_unique() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x7ACE);
        let mut set = TrackerSet::new();
        for _ in 0..2000 {
            let address = 0x1000 + rng.random_range(0..32u64);
            if rng.random_bool(0.6) {
                let expected_dup = set.contains(address);
                let result = set.insert(address, breakpoint(0));
                assert_eq!(result.is_err(), expected_dup);
            } else {
                let present = set.contains(address);
                assert_eq!(set.remove(address, None).is_ok(), present);
            }
            let mut seen = std::collections::HashSet::new();
            for (_, tracker) in set.iter_live() {
                assert!(seen.insert(tracker.address), "duplicate {:#x}", tracker.address);
            }
            assert_eq!(seen.len(), set.live_count());
        }
    }

    #[test]
    fn breakpoint_restores_every_original_byte() {
        let (sim, handle) = setup();
        for value in 0..=255u8 {
            let address = CODE + 0x100 + value as Address;
            sim.poke(PID, address, &[value]).unwrap();
            let mut set = TrackerSet::new();
            set.insert(address, breakpoint_at(handle.as_ref(), address).unwrap())
                .unwrap();
            set.lookup_mut(address).unwrap().enable(handle.as_ref()).unwrap();
            assert_eq!(sim.peek(PID, address, 1).unwrap(), vec![TRAP_BYTE]);
            set.remove(address, Some(handle.as_ref())).unwrap();
            assert_eq!(sim.peek(PID, address, 1).unwrap(), vec![value]);
        }
    }

    /// 0xA hit, 0xB enabled but not hit, 0xC never enabled.
    fn stepped_set() -> TrackerSet {
        let mut set = TrackerSet::new();
        for address in [0xA, 0xB, 0xC] {
            set.insert(address, breakpoint(0)).unwrap();
        }
        set.lookup_mut(0xA).unwrap().hit = true;
        set.lookup_mut(0xB).unwrap().enabled = true;
        set
    }

    #[test]
    fn filter_executed_drops_hit_trackers() {
        let mut set = stepped_set();
        assert_eq!(set.filter(FilterMode::Executed, None), 1);
        assert!(!set.contains(0xA));
        assert!(set.contains(0xB) && set.contains(0xC));
    }

    #[test]
    fn filter_not_executed_spares_never_enabled() {
        let mut set = stepped_set();
        assert_eq!(set.filter(FilterMode::NotExecuted, None), 1);
        assert!(!set.contains(0xB));
        assert!(set.contains(0xA) && set.contains(0xC));
        assert!(set.iter_live().all(|(_, t)| !t.hit));
    }

    #[test]
    fn hook_rejects_short_functions() {
        let (_sim, handle) = setup();
        let mut pools = PoolSet::new();
        let err = hook_at(handle.as_ref(), &mut pools, CODE, 4, &PoolSettings::default())
            .unwrap_err();
        assert_eq!(
            err,
            HookError::FunctionTooShort {
                declared: 4,
                required: 5
            }
        );
        assert!(pools.is_empty());
    }

    #[test]
    fn far_form_requires_fourteen_bytes() {
        let (sim, handle) = setup();
        sim.set_displaced_allocations(Some(0x7000_0000_0000));
        let mut pools = PoolSet::new();
        let err = hook_at(handle.as_ref(), &mut pools, CODE, 8, &PoolSettings::default())
            .unwrap_err();
        assert_eq!(
            err,
            HookError::FunctionTooShort {
                declared: 8,
                required: 14
            }
        );
        // The far pool exists but nothing was carved from it.
        let (_, pool) = pools.iter().next().unwrap();
        assert_eq!(pool.cursor, pool.base);
        assert_eq!(sim.peek(PID, CODE, 16).unwrap(), PROLOGUE.to_vec());
    }

    fn run_hook(form_expected: Form, sim: SimulatedTarget, handle: Box<dyn ProcessMemory>) {
        let mut pools = PoolSet::new();
        let kind = hook_at(handle.as_ref(), &mut pools, CODE, 16, &PoolSettings::default()).unwrap();
        let mut set = TrackerSet::new();
        set.insert(CODE, kind).unwrap();
        let tracker = set.lookup_mut(CODE).unwrap();
        let TrackerKind::Hook(hook) = &tracker.kind else {
            panic!("expected hook");
        };
        assert_eq!(hook.form, form_expected);
        let trampoline = hook.trampoline;

        tracker.enable(handle.as_ref()).unwrap();
        let jump_len = form_expected.jump_len();
        assert_ne!(sim.peek(PID, CODE, jump_len).unwrap(), PROLOGUE[..jump_len].to_vec());
        assert!(!tracker.poll_hook(handle.as_ref()).unwrap());

        let outcome = sim.execute(PID, MAIN_TID, CODE).unwrap();
        assert_eq!(outcome, Execution::Hooked { trampoline });
        assert_eq!(sim.peek(PID, CODE, 16).unwrap(), PROLOGUE.to_vec());

        assert!(tracker.poll_hook(handle.as_ref()).unwrap());
        assert!(tracker.hit);
        assert!(!tracker.enabled);

        // Re-arming clears the hit byte and writes the jump again.
        tracker.enable(handle.as_ref()).unwrap();
        assert!(!tracker.poll_hook(handle.as_ref()).unwrap());
        assert_eq!(sim.execute(PID, MAIN_TID, CODE).unwrap(), Execution::Hooked { trampoline });
    }

    #[test]
    fn near_hook_runs_and_restores_prologue() {
        let (sim, handle) = setup();
        run_hook(Form::Near, sim, handle);
    }

    #[test]
    fn far_hook_runs_and_restores_prologue() {
        let (sim, handle) = setup();
        // Near placement lands out of reach, so the hook goes to a far pool.
        sim.set_displaced_allocations(Some(0x7000_0000_0000));
        run_hook(Form::Far, sim, handle);
    }

    #[test]
    fn far_hook_restores_prologue_across_page_end() {
        let (sim, handle) = setup();
        let entry = CODE + 0x1000 - 15;
        sim.poke(PID, entry, &PROLOGUE).unwrap();
        sim.set_displaced_allocations(Some(0x7000_0000_0000));

        let mut pools = PoolSet::new();
        let kind = hook_at(handle.as_ref(), &mut pools, entry, 32, &PoolSettings::default()).unwrap();
        let mut set = TrackerSet::new();
        set.insert(entry, kind).unwrap();
        let tracker = set.lookup_mut(entry).unwrap();
        let TrackerKind::Hook(hook) = &tracker.kind else {
            panic!("expected hook");
        };
        assert_eq!(hook.form, Form::Far);
        let trampoline = hook.trampoline;

        tracker.enable(handle.as_ref()).unwrap();
        assert_eq!(
            sim.execute(PID, MAIN_TID, entry).unwrap(),
            Execution::Hooked { trampoline }
        );
        assert_eq!(sim.peek(PID, entry, 16).unwrap(), PROLOGUE.to_vec());
        assert!(tracker.poll_hook(handle.as_ref()).unwrap());
    }

    #[test]
    fn hook_writes_are_flushed() {
        for displaced in [None, Some(0x7000_0000_0000)] {
            let (sim, handle) = setup();
            sim.set_displaced_allocations(displaced);
            let mut pools = PoolSet::new();
            let kind =
                hook_at(handle.as_ref(), &mut pools, CODE, 16, &PoolSettings::default()).unwrap();
            let TrackerKind::Hook(hook) = &kind else {
                panic!("expected hook");
            };
            let code_flush = (hook.trampoline, hook.form.trampoline_len());
            let jump_flush = (CODE, hook.jump.len());
            let hit_flush = (hook.hit_address(), 1);
            assert!(sim.flushes(PID).contains(&code_flush));
            assert!(!sim.flushes(PID).contains(&jump_flush));

            let mut set = TrackerSet::new();
            set.insert(CODE, kind).unwrap();
            set.lookup_mut(CODE).unwrap().enable(handle.as_ref()).unwrap();
            let flushes = sim.flushes(PID);
            assert!(flushes.contains(&jump_flush));
            assert!(flushes.contains(&hit_flush));
        }
    }

    #[test]
    fn breakpoint_writes_are_flushed() {
        let (sim, handle) = setup();
        let address = CODE + 0x40;
        let count = |sim: &SimulatedTarget| {
            sim.flushes(PID)
                .iter()
                .filter(|&&f| f == (address, 1))
                .count()
        };
        let mut set = TrackerSet::new();
        set.insert(address, breakpoint_at(handle.as_ref(), address).unwrap())
            .unwrap();
        assert_eq!(count(&sim), 0);

        let tracker = set.lookup_mut(address).unwrap();
        tracker.enable(handle.as_ref()).unwrap();
        assert_eq!(count(&sim), 1);
        tracker.disable(handle.as_ref());
        assert_eq!(count(&sim), 2);

        // The debugger-side restore after a hit flushes too.
        sim.restore_breakpoint(PID, MAIN_TID, address, 0x90).unwrap();
        assert_eq!(count(&sim), 3);
        assert_eq!(sim.thread_rip(PID, MAIN_TID).unwrap(), address);
    }

    #[test]
    fn disabling_hook_leaves_jump_in_place() {
        let (sim, handle) = setup();
        let mut pools = PoolSet::new();
        let kind = hook_at(handle.as_ref(), &mut pools, CODE, 16, &PoolSettings::default()).unwrap();
        let mut set = TrackerSet::new();
        set.insert(CODE, kind).unwrap();
        let tracker = set.lookup_mut(CODE).unwrap();
        tracker.enable(handle.as_ref()).unwrap();
        let armed = sim.peek(PID, CODE, 5).unwrap();

        tracker.disable(handle.as_ref());
        assert!(!tracker.enabled);
        assert_eq!(sim.peek(PID, CODE, 5).unwrap(), armed);

        set.remove(CODE, Some(handle.as_ref())).unwrap();
        assert_eq!(sim.peek(PID, CODE, 5).unwrap(), armed);
    }
}
