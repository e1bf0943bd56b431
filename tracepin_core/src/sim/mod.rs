//! An in-memory stand-in for a debuggable 64-bit process.
//!
//! [`SimulatedTarget`] implements [`TargetAccess`] over a set of fake
//! processes, each with a sparse paged address space, threads, and a debug
//! event queue that behaves like a real debugging facility: a trap raised by
//! [`SimulatedTarget::execute`] blocks the executing thread until the attached
//! debugger continues the event, and the debugger's `wait_event` blocks until
//! something happens. Hooked entries are run through a small interpreter (see
//! [`cpu`]) so trampolines execute exactly as written.

mod cpu;

use crate::target::{
    Address, DebugEvent, DebugEventKind, MemoryRegion, Pid, ProcessMemory, RegionState, Resume,
    TargetAccess, TargetError, Tid,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const PAGE_SIZE: u64 = 0x1000;
pub const DEFAULT_GRANULARITY: u64 = 0x10000;
pub const DEFAULT_MIN_ADDRESS: Address = 0x1_0000;
pub const DEFAULT_MAX_ADDRESS: Address = 0x7FFF_FFFE_FFFF;

/// Where the thread injected by [`TargetAccess::debug_break`] traps.
pub const DEBUG_BREAK_ADDRESS: Address = 0x7FFF_FFFE_0000;
/// Thread id of the injected break thread.
pub const DEBUG_BREAK_TID: Tid = 0xFFFF;
/// Thread every simulated process starts with.
pub const MAIN_TID: Tid = 1;

/// How long a trapped thread waits for the debugger before giving up.
const TRAP_RESUME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

impl Protection {
    fn writable(self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::ReadWriteExecute)
    }

    fn executable(self) -> bool {
        matches!(self, Protection::ReadExecute | Protection::ReadWriteExecute)
    }
}

/// Who is debugging a simulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// Attached through [`TargetAccess::attach`].
    Session,
    /// Attached by someone else, see [`SimulatedTarget::attach_foreign`].
    Foreign,
}

/// What happened when a simulated thread reached an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// No instrumentation at the address; the original code ran.
    Plain,
    /// A hook jump ran its trampoline and control came back to the restored entry.
    Hooked { trampoline: Address },
    /// A trap was handled by the session's debugger and the thread resumed.
    /// `rewound` tells whether the debugger put the thread back onto the address.
    Trapped { resume: Resume, rewound: bool },
    /// A trap was queued for a foreign debugger; nobody waited for it.
    Pending,
    /// The debugger detached before continuing the trap.
    Detached,
    /// A trap with no debugger attached killed the process.
    Crashed,
}

struct Region {
    base: Address,
    size: u64,
    committed: bool,
    bytes: Vec<u8>,
    protection: Vec<Protection>,
}

impl Region {
    fn end(&self) -> Address {
        self.base + self.size
    }

    fn contains(&self, address: Address, len: u64) -> bool {
        address >= self.base && address.saturating_add(len) <= self.end()
    }

    fn page_protection(&self, address: Address) -> Protection {
        self.protection[((address - self.base) / PAGE_SIZE) as usize]
    }
}

#[derive(Default)]
struct Thread {
    rip: Address,
    rax: u64,
}

struct Process {
    alive: bool,
    is_64bit: bool,
    regions: BTreeMap<Address, Region>,
    threads: BTreeMap<Tid, Thread>,
    attachment: Option<Attachment>,
    queue: VecDeque<(u64, DebugEvent)>,
    next_seq: u64,
    delivered: Option<u64>,
    resumed: HashMap<u64, Resume>,
    flushes: Vec<(Address, usize)>,
}

impl Process {
    fn new(is_64bit: bool) -> Self {
        let mut threads = BTreeMap::new();
        threads.insert(MAIN_TID, Thread::default());
        Self {
            alive: true,
            is_64bit,
            regions: BTreeMap::new(),
            threads,
            attachment: None,
            queue: VecDeque::new(),
            next_seq: 0,
            delivered: None,
            resumed: HashMap::new(),
            flushes: Vec::new(),
        }
    }

    fn region(&self, address: Address, len: u64) -> Option<&Region> {
        let (_, region) = self.regions.range(..=address).next_back()?;
        (region.committed && region.contains(address, len)).then_some(region)
    }

    fn region_mut(&mut self, address: Address, len: u64) -> Option<&mut Region> {
        let (_, region) = self.regions.range_mut(..=address).next_back()?;
        (region.committed && region.contains(address, len)).then_some(region)
    }

    fn overlaps(&self, base: Address, size: u64) -> bool {
        let end = base + size;
        if let Some((_, prev)) = self.regions.range(..base).next_back() {
            if prev.end() > base {
                return true;
            }
        }
        self.regions.range(base..end).next().is_some()
    }

    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), TargetError> {
        let len = buf.len();
        let region = self
            .region(address, len as u64)
            .ok_or(TargetError::Read { address, len })?;
        let offset = (address - region.base) as usize;
        buf.copy_from_slice(&region.bytes[offset..offset + len]);
        Ok(())
    }

    fn write(&mut self, address: Address, data: &[u8]) -> Result<(), TargetError> {
        let len = data.len();
        let region = self
            .region_mut(address, len as u64)
            .ok_or(TargetError::Write { address, len })?;
        let offset = (address - region.base) as usize;
        region.bytes[offset..offset + len].copy_from_slice(data);
        Ok(())
    }

    fn push_event(&mut self, tid: Tid, pid: Pid, kind: DebugEventKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back((seq, DebugEvent { pid, tid, kind }));
        seq
    }

    fn insert_region(&mut self, base: Address, size: u64, committed: bool, protection: Protection) {
        let pages = (size / PAGE_SIZE) as usize;
        self.regions.insert(
            base,
            Region {
                base,
                size,
                committed,
                bytes: vec![0; if committed { size as usize } else { 0 }],
                protection: vec![protection; pages],
            },
        );
    }
}

struct SimState {
    processes: HashMap<Pid, Process>,
    privileged: bool,
    debugger_query_fails: bool,
    debug_break_fails: bool,
    debug_break_swallowed: bool,
    /// Hinted allocations land here instead, simulating another thread grabbing the hinted region.
    displaced_allocations: Option<Address>,
}

struct Shared {
    state: Mutex<SimState>,
    changed: Condvar,
    granularity: u64,
    min_address: Address,
    max_address: Address,
}

/// A set of simulated processes. Cloning shares the same processes.
#[derive(Clone)]
pub struct SimulatedTarget {
    shared: Arc<Shared>,
}

impl Default for SimulatedTarget {
    fn default() -> Self {
        Self::new()
    }
}

fn align_down(value: u64, alignment: u64) -> u64 {
    value - value % alignment
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

impl SimulatedTarget {
    pub fn new() -> Self {
        Self::with_layout(DEFAULT_GRANULARITY, DEFAULT_MIN_ADDRESS, DEFAULT_MAX_ADDRESS)
    }

    pub fn with_layout(granularity: u64, min_address: Address, max_address: Address) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    processes: HashMap::new(),
                    privileged: true,
                    debugger_query_fails: false,
                    debug_break_fails: false,
                    debug_break_swallowed: false,
                    displaced_allocations: None,
                }),
                changed: Condvar::new(),
                granularity,
                min_address,
                max_address,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_process<T>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut Process) -> Result<T, TargetError>,
    ) -> Result<T, TargetError> {
        let mut state = self.lock();
        let process = state
            .processes
            .get_mut(&pid)
            .ok_or(TargetError::ProcessNotFound(pid))?;
        f(process)
    }

    fn with_live_process<T>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut Process) -> Result<T, TargetError>,
    ) -> Result<T, TargetError> {
        self.with_process(pid, |process| {
            if !process.alive {
                return Err(TargetError::ProcessNotFound(pid));
            }
            f(process)
        })
    }

    /// Starts a 64-bit process with one thread and an empty address space.
    pub fn spawn(&self, pid: Pid) {
        self.lock().processes.insert(pid, Process::new(true));
    }

    pub fn spawn_32bit(&self, pid: Pid) {
        self.lock().processes.insert(pid, Process::new(false));
    }

    /// Commits `size` bytes at page-aligned `base`.
    pub fn map(
        &self,
        pid: Pid,
        base: Address,
        size: u64,
        protection: Protection,
    ) -> Result<(), TargetError> {
        let size = align_up(size, PAGE_SIZE);
        self.with_live_process(pid, |process| {
            if base % PAGE_SIZE != 0 || process.overlaps(base, size) {
                return Err(TargetError::Alloc { size });
            }
            process.insert_region(base, size, true, protection);
            Ok(())
        })
    }

    /// Reserves `size` bytes at `base` without committing them.
    pub fn reserve(&self, pid: Pid, base: Address, size: u64) -> Result<(), TargetError> {
        let size = align_up(size, PAGE_SIZE);
        self.with_live_process(pid, |process| {
            if base % PAGE_SIZE != 0 || process.overlaps(base, size) {
                return Err(TargetError::Alloc { size });
            }
            process.insert_region(base, size, false, Protection::ReadOnly);
            Ok(())
        })
    }

    /// Writes memory regardless of page protection, like a loader would.
    pub fn poke(&self, pid: Pid, address: Address, data: &[u8]) -> Result<(), TargetError> {
        self.with_process(pid, |process| process.write(address, data))
    }

    pub fn peek(&self, pid: Pid, address: Address, len: usize) -> Result<Vec<u8>, TargetError> {
        self.with_process(pid, |process| {
            let mut buf = vec![0; len];
            process.read(address, &mut buf)?;
            Ok(buf)
        })
    }

    pub fn thread_rip(&self, pid: Pid, tid: Tid) -> Result<Address, TargetError> {
        self.with_process(pid, |process| {
            process
                .threads
                .get(&tid)
                .map(|thread| thread.rip)
                .ok_or(TargetError::ThreadNotFound { pid, tid })
        })
    }

    /// Every instruction-cache flush issued against `pid`, in order.
    pub fn flushes(&self, pid: Pid) -> Vec<(Address, usize)> {
        self.with_process(pid, |process| Ok(process.flushes.clone()))
            .unwrap_or_default()
    }

    /// Bases of all reservations in `pid`.
    pub fn region_bases(&self, pid: Pid) -> Vec<Address> {
        self.with_process(pid, |process| Ok(process.regions.keys().copied().collect()))
            .unwrap_or_default()
    }

    pub fn attachment(&self, pid: Pid) -> Option<Attachment> {
        self.with_process(pid, |process| Ok(process.attachment))
            .ok()
            .flatten()
    }

    /// Terminates the process. An attached debugger receives an exit event.
    pub fn kill(&self, pid: Pid, exit_code: u32) {
        let mut state = self.lock();
        if let Some(process) = state.processes.get_mut(&pid) {
            process.alive = false;
            if process.attachment.is_some() {
                process.push_event(MAIN_TID, pid, DebugEventKind::ExitProcess { exit_code });
            }
        }
        self.shared.changed.notify_all();
    }

    /// Attaches a debugger that is not a session's debug loop.
    pub fn attach_foreign(&self, pid: Pid) -> Result<(), TargetError> {
        self.with_live_process(pid, |process| {
            if process.attachment.is_some() {
                return Err(TargetError::Debugger("already being debugged".to_string()));
            }
            process.attachment = Some(Attachment::Foreign);
            Ok(())
        })
    }

    pub fn detach_foreign(&self, pid: Pid) -> Result<(), TargetError> {
        self.detach(pid)
    }

    pub fn set_privileged(&self, privileged: bool) {
        self.lock().privileged = privileged;
    }

    pub fn set_debugger_query_fails(&self, fails: bool) {
        self.lock().debugger_query_fails = fails;
    }

    /// Makes [`TargetAccess::debug_break`] return an error.
    pub fn set_debug_break_fails(&self, fails: bool) {
        self.lock().debug_break_fails = fails;
    }

    /// Makes [`TargetAccess::debug_break`] succeed without raising an event.
    pub fn set_debug_break_swallowed(&self, swallowed: bool) {
        self.lock().debug_break_swallowed = swallowed;
    }

    pub fn set_displaced_allocations(&self, at: Option<Address>) {
        self.lock().displaced_allocations = at;
    }

    /// Runs thread `tid` of `pid` at `address`.
    ///
    /// A trap byte raises a breakpoint event. With the session's debugger
    /// attached this blocks until the event is continued; with a foreign
    /// debugger it returns [`Execution::Pending`]; with none the process dies.
    /// A hook jump runs its trampoline to completion.
    pub fn execute(&self, pid: Pid, tid: Tid, address: Address) -> Result<Execution, TargetError> {
        let mut state = self.lock();
        let process = state
            .processes
            .get_mut(&pid)
            .filter(|process| process.alive)
            .ok_or(TargetError::ProcessNotFound(pid))?;
        process.threads.entry(tid).or_default().rip = address;

        let first = match process.region(address, 1) {
            Some(region) if region.page_protection(address).executable() => {
                region.bytes[(address - region.base) as usize]
            }
            _ => return Err(TargetError::Fault(address)),
        };

        if first == crate::tracker::TRAP_BYTE {
            return self.raise_trap(state, pid, tid, address);
        }
        if cpu::is_hook_jump(process, address) {
            let trampoline = cpu::run_hooked_entry(process, tid, address)?;
            return Ok(Execution::Hooked { trampoline });
        }
        Ok(Execution::Plain)
    }

    fn raise_trap(
        &self,
        mut state: MutexGuard<'_, SimState>,
        pid: Pid,
        tid: Tid,
        address: Address,
    ) -> Result<Execution, TargetError> {
        let process = state
            .processes
            .get_mut(&pid)
            .ok_or(TargetError::ProcessNotFound(pid))?;
        if let Some(thread) = process.threads.get_mut(&tid) {
            thread.rip = address + 1;
        }
        let seq = match process.attachment {
            None => {
                process.alive = false;
                return Ok(Execution::Crashed);
            }
            Some(Attachment::Foreign) => {
                process.push_event(tid, pid, DebugEventKind::Breakpoint { address });
                self.shared.changed.notify_all();
                return Ok(Execution::Pending);
            }
            Some(Attachment::Session) => {
                process.push_event(tid, pid, DebugEventKind::Breakpoint { address })
            }
        };
        self.shared.changed.notify_all();

        let deadline = Instant::now() + TRAP_RESUME_TIMEOUT;
        loop {
            let process = state
                .processes
                .get_mut(&pid)
                .ok_or(TargetError::ProcessNotFound(pid))?;
            if let Some(resume) = process.resumed.remove(&seq) {
                let rewound = process
                    .threads
                    .get(&tid)
                    .is_some_and(|thread| thread.rip == address);
                return Ok(Execution::Trapped { resume, rewound });
            }
            if process.attachment.is_none() {
                return Ok(Execution::Detached);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TargetError::Debugger(format!(
                    "breakpoint at {address:#x} was never continued"
                )));
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl TargetAccess for SimulatedTarget {
    fn check_privileges(&self) -> bool {
        self.lock().privileged
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.lock()
            .processes
            .get(&pid)
            .is_some_and(|process| process.alive)
    }

    fn is_64bit(&self, pid: Pid) -> Result<bool, TargetError> {
        self.with_live_process(pid, |process| Ok(process.is_64bit))
    }

    fn debugger_present(&self, pid: Pid) -> Result<bool, TargetError> {
        if self.lock().debugger_query_fails {
            return Err(TargetError::Debugger("debugger query refused".to_string()));
        }
        self.with_live_process(pid, |process| Ok(process.attachment.is_some()))
    }

    fn open(&self, pid: Pid) -> Result<Box<dyn ProcessMemory>, TargetError> {
        self.with_live_process(pid, |_| Ok(()))?;
        Ok(Box::new(SimProcessHandle {
            target: self.clone(),
            pid,
        }))
    }

    fn attach(&self, pid: Pid) -> Result<(), TargetError> {
        self.with_live_process(pid, |process| {
            if process.attachment.is_some() {
                return Err(TargetError::Debugger("already being debugged".to_string()));
            }
            process.attachment = Some(Attachment::Session);
            process.push_event(MAIN_TID, pid, DebugEventKind::CreateProcess);
            let bases: Vec<Address> = process.regions.keys().copied().collect();
            for base in bases {
                process.push_event(MAIN_TID, pid, DebugEventKind::LoadModule { base });
            }
            Ok(())
        })?;
        self.shared.changed.notify_all();
        Ok(())
    }

    fn detach(&self, pid: Pid) -> Result<(), TargetError> {
        self.with_process(pid, |process| {
            if process.attachment.is_none() {
                return Err(TargetError::Debugger("not being debugged".to_string()));
            }
            process.attachment = None;
            process.queue.clear();
            process.delivered = None;
            Ok(())
        })?;
        self.shared.changed.notify_all();
        Ok(())
    }

    fn wait_event(&self, pid: Pid) -> Result<DebugEvent, TargetError> {
        let mut state = self.lock();
        loop {
            let process = state
                .processes
                .get_mut(&pid)
                .ok_or(TargetError::ProcessNotFound(pid))?;
            if process.attachment.is_none() {
                return Err(TargetError::Debugger("not being debugged".to_string()));
            }
            if let Some((seq, event)) = process.queue.pop_front() {
                process.delivered = Some(seq);
                return Ok(event);
            }
            if !process.alive {
                return Err(TargetError::ProcessNotFound(pid));
            }
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn continue_event(&self, event: &DebugEvent, resume: Resume) -> Result<(), TargetError> {
        self.with_process(event.pid, |process| {
            let seq = process
                .delivered
                .take()
                .ok_or_else(|| TargetError::Debugger("no event to continue".to_string()))?;
            process.resumed.insert(seq, resume);
            Ok(())
        })?;
        self.shared.changed.notify_all();
        Ok(())
    }

    fn restore_breakpoint(
        &self,
        pid: Pid,
        tid: Tid,
        address: Address,
        original: u8,
    ) -> Result<(), TargetError> {
        self.with_live_process(pid, |process| {
            let thread = process
                .threads
                .get_mut(&tid)
                .ok_or(TargetError::ThreadNotFound { pid, tid })?;
            thread.rip = address;
            process.write(address, &[original])?;
            process.flushes.push((address, 1));
            Ok(())
        })
    }

    fn debug_break(&self, pid: Pid) -> Result<(), TargetError> {
        {
            let mut state = self.lock();
            if state.debug_break_fails {
                return Err(TargetError::Debugger("break-in refused".to_string()));
            }
            let swallowed = state.debug_break_swallowed;
            let process = state
                .processes
                .get_mut(&pid)
                .filter(|process| process.alive)
                .ok_or(TargetError::ProcessNotFound(pid))?;
            if process.attachment.is_none() {
                return Err(TargetError::Debugger("not being debugged".to_string()));
            }
            if !swallowed {
                process.push_event(
                    DEBUG_BREAK_TID,
                    pid,
                    DebugEventKind::Breakpoint {
                        address: DEBUG_BREAK_ADDRESS,
                    },
                );
            }
        }
        self.shared.changed.notify_all();
        Ok(())
    }
}

/// An open handle onto one simulated process.
struct SimProcessHandle {
    target: SimulatedTarget,
    pid: Pid,
}

impl ProcessMemory for SimProcessHandle {
    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), TargetError> {
        self.target
            .with_live_process(self.pid, |process| process.read(address, buf))
    }

    fn write(&self, address: Address, data: &[u8]) -> Result<(), TargetError> {
        self.target
            .with_live_process(self.pid, |process| process.write(address, data))
    }

    fn flush_instruction_cache(&self, address: Address, len: usize) -> Result<(), TargetError> {
        self.target.with_live_process(self.pid, |process| {
            process.flushes.push((address, len));
            Ok(())
        })
    }

    fn protect_executable(&self, address: Address, len: usize) -> Result<(), TargetError> {
        self.target.with_live_process(self.pid, |process| {
            let region = process
                .region_mut(address, len as u64)
                .ok_or(TargetError::Protect { address, len })?;
            let first = (align_down(address, PAGE_SIZE) - region.base) / PAGE_SIZE;
            let last = (align_up(address + len as u64, PAGE_SIZE) - region.base) / PAGE_SIZE;
            for page in first..last {
                region.protection[page as usize] = Protection::ReadWriteExecute;
            }
            Ok(())
        })
    }

    fn alloc_executable(&self, at: Option<Address>, size: u64) -> Result<Address, TargetError> {
        let granularity = self.target.shared.granularity;
        let (min, max) = self.address_range();
        let size = align_up(size.max(1), PAGE_SIZE);
        let mut state = self.target.lock();
        let displaced = state.displaced_allocations;
        let process = state
            .processes
            .get_mut(&self.pid)
            .filter(|process| process.alive)
            .ok_or(TargetError::ProcessNotFound(self.pid))?;

        let base = match at {
            Some(hint) => {
                let base = align_down(displaced.unwrap_or(hint), granularity);
                if base < min || base + size - 1 > max || process.overlaps(base, size) {
                    return Err(TargetError::Alloc { size });
                }
                base
            }
            None => {
                let mut candidate = align_up(min, granularity);
                for region in process.regions.values() {
                    if candidate + size <= region.base {
                        break;
                    }
                    candidate = candidate.max(align_up(region.end(), granularity));
                }
                if candidate + size - 1 > max {
                    return Err(TargetError::Alloc { size });
                }
                candidate
            }
        };
        process.insert_region(base, size, true, Protection::ReadWriteExecute);
        Ok(base)
    }

    fn free(&self, base: Address) -> Result<(), TargetError> {
        self.target.with_live_process(self.pid, |process| {
            process
                .regions
                .remove(&base)
                .map(|_| ())
                .ok_or(TargetError::Free(base))
        })
    }

    fn query_region(&self, address: Address) -> Option<MemoryRegion> {
        let (min, max) = self.address_range();
        if address < min || address > max {
            return None;
        }
        let state = self.target.lock();
        let process = state.processes.get(&self.pid).filter(|p| p.alive)?;
        if let Some((_, region)) = process.regions.range(..=address).next_back() {
            if region.contains(address, 1) {
                return Some(MemoryRegion {
                    base: region.base,
                    size: region.size,
                    allocation_base: region.base,
                    state: if region.committed {
                        RegionState::Committed
                    } else {
                        RegionState::Reserved
                    },
                });
            }
        }
        let base = align_down(address, PAGE_SIZE);
        let end = process
            .regions
            .range(address..)
            .next()
            .map_or(max + 1, |(start, _)| *start);
        Some(MemoryRegion {
            base,
            size: end - base,
            allocation_base: base,
            state: RegionState::Free,
        })
    }

    fn allocation_granularity(&self) -> u64 {
        self.target.shared.granularity
    }

    fn address_range(&self) -> (Address, Address) {
        (self.target.shared.min_address, self.target.shared.max_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const PID: Pid = 42;

    fn target_with_code() -> SimulatedTarget {
        let sim = SimulatedTarget::new();
        sim.spawn(PID);
        sim.map(PID, 0x40_0000, 0x2000, Protection::ReadExecute)
            .unwrap();
        sim
    }

    #[test]
    fn memory_round_trips_through_handle() {
        let sim = target_with_code();
        let handle = sim.open(PID).unwrap();
        handle.write(0x40_0010, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        handle.read(0x40_0010, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert!(handle.read(0x50_0000, &mut buf).is_err());
    }

    #[test]
    fn query_reports_free_gaps_and_reservations() {
        let sim = target_with_code();
        sim.reserve(PID, 0x60_0000, 0x1000).unwrap();
        let handle = sim.open(PID).unwrap();

        let code = handle.query_region(0x40_1000).unwrap();
        assert_eq!(code.state, RegionState::Committed);
        assert_eq!(code.base, 0x40_0000);

        let gap = handle.query_region(0x50_0123).unwrap();
        assert_eq!(gap.state, RegionState::Free);
        assert_eq!(gap.base, 0x50_0000);
        assert_eq!(gap.base + gap.size, 0x60_0000);

        let reserved = handle.query_region(0x60_0000).unwrap();
        assert_eq!(reserved.state, RegionState::Reserved);

        assert!(handle.query_region(0x100).is_none());
    }

    #[test]
    fn hinted_allocation_aligns_to_granularity() {
        let sim = target_with_code();
        let handle = sim.open(PID).unwrap();
        let base = handle.alloc_executable(Some(0x80_1234), 64).unwrap();
        assert_eq!(base, 0x80_0000);
        assert!(handle.alloc_executable(Some(0x80_0000), 64).is_err());
        handle.free(base).unwrap();
        assert!(handle.free(base).is_err());
    }

    #[test]
    fn unhinted_allocation_takes_lowest_gap() {
        let sim = target_with_code();
        let handle = sim.open(PID).unwrap();
        let base = handle.alloc_executable(None, 0x1000).unwrap();
        assert_eq!(base, DEFAULT_MIN_ADDRESS);
        let next = handle.alloc_executable(None, 0x1000).unwrap();
        assert_eq!(next, DEFAULT_MIN_ADDRESS + DEFAULT_GRANULARITY);
    }

    #[test]
    fn trap_without_debugger_crashes_process() {
        let sim = target_with_code();
        sim.poke(PID, 0x40_0000, &[0xCC]).unwrap();
        assert_eq!(sim.execute(PID, MAIN_TID, 0x40_0000).unwrap(), Execution::Crashed);
        assert!(!sim.is_alive(PID));
    }

    #[test]
    fn trap_blocks_until_debugger_continues() {
        let sim = target_with_code();
        sim.poke(PID, 0x40_0000, &[0x55]).unwrap();
        sim.attach(PID).unwrap();
        // Drain attach events.
        for _ in 0..2 {
            let event = sim.wait_event(PID).unwrap();
            sim.continue_event(&event, Resume::Handled).unwrap();
        }
        sim.poke(PID, 0x40_0000, &[0xCC]).unwrap();

        let runner = sim.clone();
        let worker = thread::spawn(move || runner.execute(PID, MAIN_TID, 0x40_0000));

        let event = sim.wait_event(PID).unwrap();
        assert_eq!(
            event.kind,
            DebugEventKind::Breakpoint {
                address: 0x40_0000
            }
        );
        sim.restore_breakpoint(PID, event.tid, 0x40_0000, 0x55)
            .unwrap();
        sim.continue_event(&event, Resume::Handled).unwrap();

        let outcome = worker.join().unwrap().unwrap();
        assert_eq!(
            outcome,
            Execution::Trapped {
                resume: Resume::Handled,
                rewound: true
            }
        );
        assert_eq!(sim.peek(PID, 0x40_0000, 1).unwrap(), vec![0x55]);
    }

    #[test]
    fn kill_delivers_exit_event_to_debugger() {
        let sim = target_with_code();
        sim.attach(PID).unwrap();
        sim.kill(PID, 3);
        let mut last = None;
        while let Ok(event) = sim.wait_event(PID) {
            sim.continue_event(&event, Resume::Handled).unwrap();
            last = Some(event.kind);
        }
        assert_eq!(last, Some(DebugEventKind::ExitProcess { exit_code: 3 }));
    }

    #[test]
    fn debug_break_wakes_waiter() {
        let sim = target_with_code();
        sim.attach(PID).unwrap();
        for _ in 0..2 {
            let event = sim.wait_event(PID).unwrap();
            sim.continue_event(&event, Resume::Handled).unwrap();
        }
        let waiter = sim.clone();
        let handle = thread::spawn(move || waiter.wait_event(PID));
        sim.debug_break(PID).unwrap();
        let event = handle.join().unwrap().unwrap();
        assert_eq!(event.tid, DEBUG_BREAK_TID);
    }
}
