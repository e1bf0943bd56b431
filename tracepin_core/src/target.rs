//! The capability set the engine needs from the operating system.
//!
//! Nothing in this crate talks to a real kernel. Everything that touches a
//! foreign process goes through [`TargetAccess`] (process-level operations and
//! the debug-event channel) or [`ProcessMemory`] (an open handle to one
//! process's address space). [`crate::sim::SimulatedTarget`] is the
//! in-tree implementation.

use std::fmt;
use thiserror::Error;

/// An address in the target process.
pub type Address = u64;
/// Process identifier.
pub type Pid = u32;
/// Thread identifier.
pub type Tid = u32;

/// Errors reported by the target-access primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// The process does not exist, has exited, or cannot be opened.
    #[error("Process {0} not found or not accessible")]
    ProcessNotFound(Pid),

    /// The thread does not exist in the process.
    #[error("Thread {tid} not found in process {pid}")]
    ThreadNotFound { pid: Pid, tid: Tid },

    /// A memory read touched an unmapped or uncommitted range.
    #[error("Failed to read {len} bytes at {address:#x}")]
    Read { address: Address, len: usize },

    /// A memory write touched an unmapped or uncommitted range.
    #[error("Failed to write {len} bytes at {address:#x}")]
    Write { address: Address, len: usize },

    /// Changing page protection failed.
    #[error("Failed to change protection of {len} bytes at {address:#x}")]
    Protect { address: Address, len: usize },

    /// No executable region of the requested size could be reserved.
    #[error("Failed to allocate {size} executable bytes")]
    Alloc { size: u64 },

    /// Releasing a region failed.
    #[error("Failed to free region at {0:#x}")]
    Free(Address),

    /// The debugging facility refused an attach, detach, wait or continue.
    #[error("Debugger operation failed: {0}")]
    Debugger(String),

    /// The target executed something it could not.
    #[error("Target faulted at {0:#x}")]
    Fault(Address),
}

/// State of a virtual-memory region as reported by [`ProcessMemory::query_region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Free,
    Reserved,
    Committed,
}

/// A run of pages sharing one state, starting at the queried page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: Address,
    pub size: u64,
    /// Base of the reservation this region belongs to. Equal to `base` for free regions.
    pub allocation_base: Address,
    pub state: RegionState,
}

/// What happened in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEventKind {
    /// A trap instruction executed. `address` is the address of the trap byte.
    Breakpoint { address: Address },
    /// Any other exception; left for the target's own handlers.
    Exception { code: u32, address: Address },
    CreateProcess,
    CreateThread,
    ExitThread,
    LoadModule { base: Address },
    UnloadModule { base: Address },
    OutputString,
    ExitProcess { exit_code: u32 },
}

/// A debug event, as delivered to the attached debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEvent {
    pub pid: Pid,
    pub tid: Tid,
    pub kind: DebugEventKind,
}

impl fmt::Display for DebugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (pid {}, tid {})", self.kind, self.pid, self.tid)
    }
}

/// How a debug event is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The debugger dealt with it; the target continues.
    Handled,
    /// Pass the exception on to the target's own handlers.
    NotHandled,
}

/// An open handle to a target's address space. Dropping it releases the handle.
pub trait ProcessMemory: Send {
    fn read(&self, address: Address, buf: &mut [u8]) -> Result<(), TargetError>;

    fn write(&self, address: Address, data: &[u8]) -> Result<(), TargetError>;

    fn flush_instruction_cache(&self, address: Address, len: usize) -> Result<(), TargetError>;

    /// Makes `len` bytes at `address` readable, writable and executable.
    fn protect_executable(&self, address: Address, len: usize) -> Result<(), TargetError>;

    /// Reserves and commits an executable region of `size` bytes, at `at` if given.
    /// The returned address is the region base.
    fn alloc_executable(&self, at: Option<Address>, size: u64) -> Result<Address, TargetError>;

    fn free(&self, base: Address) -> Result<(), TargetError>;

    /// Describes the region containing `address`, or `None` outside the application range.
    fn query_region(&self, address: Address) -> Option<MemoryRegion>;

    /// Granularity at which reservations are aligned.
    fn allocation_granularity(&self) -> u64;

    /// Lowest and highest addresses available to applications.
    fn address_range(&self) -> (Address, Address);

    /// Writes code and synchronizes the instruction cache before it can run.
    fn write_flush(&self, address: Address, data: &[u8]) -> Result<(), TargetError> {
        self.write(address, data)?;
        self.flush_instruction_cache(address, data.len())
    }

    fn read_byte(&self, address: Address) -> Result<u8, TargetError> {
        let mut byte = [0u8; 1];
        self.read(address, &mut byte)?;
        Ok(byte[0])
    }
}

/// Process-level primitives and the debug-event channel.
///
/// `attach`, `wait_event`, `continue_event` and `detach` for a given process are
/// always called from the same thread, the one running the debug loop.
pub trait TargetAccess: Send + Sync {
    /// Whether the caller may debug other processes.
    fn check_privileges(&self) -> bool;

    fn is_alive(&self, pid: Pid) -> bool;

    fn is_64bit(&self, pid: Pid) -> Result<bool, TargetError>;

    /// Whether any debugger, ours or someone else's, is attached to `pid`.
    fn debugger_present(&self, pid: Pid) -> Result<bool, TargetError>;

    fn open(&self, pid: Pid) -> Result<Box<dyn ProcessMemory>, TargetError>;

    fn attach(&self, pid: Pid) -> Result<(), TargetError>;

    fn detach(&self, pid: Pid) -> Result<(), TargetError>;

    /// Blocks until the next debug event for `pid`.
    fn wait_event(&self, pid: Pid) -> Result<DebugEvent, TargetError>;

    fn continue_event(&self, event: &DebugEvent, resume: Resume) -> Result<(), TargetError>;

    /// Rewinds `tid` onto the trap at `address` and puts `original` back, so the
    /// thread re-executes the real instruction once resumed.
    fn restore_breakpoint(
        &self,
        pid: Pid,
        tid: Tid,
        address: Address,
        original: u8,
    ) -> Result<(), TargetError>;

    /// Forces a breakpoint event in `pid`, waking a debugger blocked in `wait_event`.
    fn debug_break(&self, pid: Pid) -> Result<(), TargetError>;
}
