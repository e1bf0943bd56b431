use crate::target::{Address, Pid, TargetError};
use thiserror::Error;

/// Reasons an inline hook could not be created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// The declared function is shorter than the jump that would overwrite it.
    #[error("Function length {declared} is shorter than the {required}-byte jump")]
    FunctionTooShort { declared: u32, required: u32 },

    /// No pool with room for a trampoline exists and none could be allocated.
    #[error("No trampoline pool space available")]
    PoolExhausted,

    /// Reading the prologue or writing the trampoline failed.
    #[error("Target memory access failed: {0}")]
    Memory(#[from] TargetError),
}

/// Every failure a session operation can report.
///
/// Each variant maps onto exactly one [`Status`] code through [`TracepinError::status`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TracepinError {
    /// The handle does not name a live session.
    #[error("Invalid session handle")]
    InvalidHandle,

    /// The caller lacks the privileges to debug other processes.
    #[error("Insufficient privileges to debug other processes")]
    InsufficientPrivileges,

    /// The session directory is at capacity.
    #[error("Session directory is full ({capacity} sessions)")]
    DirectoryFull { capacity: usize },

    #[error("No target process set")]
    TargetNotSet,

    #[error("Target process already set")]
    TargetAlreadySet,

    /// The target does not exist or is not alive.
    #[error("Process {0} is not a valid target")]
    InvalidTarget(Pid),

    #[error("Process {0} is not a 64-bit process")]
    TargetNot64Bit(Pid),

    /// The target exited. Sticky for the rest of the session.
    #[error("Target process died")]
    TargetDied,

    /// A handle to the target process could not be acquired.
    #[error("Failed to open target process: {0}")]
    ProcessHandle(#[source] TargetError),

    #[error("Debug loop is already running")]
    DebugLoopAlreadyRunning,

    #[error("Debug loop is already stopped")]
    DebugLoopAlreadyStopped,

    /// The running loop belongs to an external debugger and cannot be stopped here.
    #[error("Debug loop is owned by a foreign debugger")]
    DebugLoopForeign,

    /// A foreign-debugger notification arrived while no foreign debugger is registered.
    #[error("No foreign debugger is registered")]
    ForeignDebuggerNotAttached,

    /// A foreign-debugger notification arrived while the foreign loop is stopped.
    #[error("Foreign debug loop is stopped")]
    ForeignDebugLoopStopped,

    /// Another debugger is attached, so the owned loop cannot start.
    #[error("A debugger is already attached to the target")]
    DebuggerAlreadyAttached,

    /// The caller claims to run a debugger, but none is attached.
    #[error("No debugger attached to the target")]
    DebuggerNotFound,

    /// The caller claims to run a debugger while the owned loop runs.
    #[error("The owned debug loop is running")]
    OwnedLoopRunning,

    /// The caller claims to have stopped their debugger, but it is still attached.
    #[error("The foreign debugger is still attached")]
    ForeignDebuggerStillAttached,

    #[error("Debug loop override request is inconsistent with the current state")]
    InconsistentOverride,

    #[error("Cannot determine whether a debugger is attached: {0}")]
    CannotCheckDebugger(#[source] TargetError),

    #[error("Failed to start the debug loop thread: {0}")]
    DebugThreadStart(String),

    #[error("Failed to attach to the target: {0}")]
    DebuggerAttach(#[source] TargetError),

    #[error("Failed to force a debug break: {0}")]
    DebugBreakFailed(#[source] TargetError),

    /// The loop thread did not exit within both timeouts.
    #[error("Debug loop did not stop in time")]
    DebugLoopStopFailed,

    #[error("A tracker already exists at {0:#x}")]
    TrackerAlreadyExists(Address),

    #[error("No tracker at {0:#x}")]
    TrackerNotFound(Address),

    /// Breakpoints need a running debug loop to catch their trap.
    #[error("Cannot enable a breakpoint without an active debugger")]
    NoActiveDebugger,

    #[error("Failed to create hook: {0}")]
    HookCreate(#[from] HookError),

    #[error("A step is already active")]
    StepAlreadyActive,

    #[error("No step is active")]
    StepNotActive,

    /// The operation is not allowed while a step is active.
    #[error("Operation not allowed while a step is active")]
    StepActive,

    #[error("Failed to read target memory: {0}")]
    MemoryRead(#[source] TargetError),

    #[error("Failed to write target memory: {0}")]
    MemoryWrite(#[source] TargetError),
}

/// Stable numeric status codes, one per error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    InvalidHandle = 1,
    InsufficientPrivileges = 2,
    DirectoryFull = 3,
    TargetNotSet = 10,
    TargetAlreadySet = 11,
    InvalidTarget = 12,
    TargetNot64Bit = 13,
    TargetDied = 14,
    ProcessHandle = 15,
    DebugLoopAlreadyRunning = 20,
    DebugLoopAlreadyStopped = 21,
    DebugLoopForeign = 22,
    ForeignDebuggerNotAttached = 23,
    ForeignDebugLoopStopped = 24,
    DebuggerAlreadyAttached = 25,
    DebuggerNotFound = 26,
    OwnedLoopRunning = 27,
    ForeignDebuggerStillAttached = 28,
    InconsistentOverride = 29,
    CannotCheckDebugger = 30,
    DebugThreadStart = 31,
    DebuggerAttach = 32,
    DebugBreakFailed = 33,
    DebugLoopStopFailed = 34,
    TrackerAlreadyExists = 40,
    TrackerNotFound = 41,
    NoActiveDebugger = 42,
    HookCreate = 43,
    StepAlreadyActive = 50,
    StepNotActive = 51,
    StepActive = 52,
    MemoryRead = 60,
    MemoryWrite = 61,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TracepinError {
    pub fn status(&self) -> Status {
        match self {
            TracepinError::InvalidHandle => Status::InvalidHandle,
            TracepinError::InsufficientPrivileges => Status::InsufficientPrivileges,
            TracepinError::DirectoryFull { .. } => Status::DirectoryFull,
            TracepinError::TargetNotSet => Status::TargetNotSet,
            TracepinError::TargetAlreadySet => Status::TargetAlreadySet,
            TracepinError::InvalidTarget(_) => Status::InvalidTarget,
            TracepinError::TargetNot64Bit(_) => Status::TargetNot64Bit,
            TracepinError::TargetDied => Status::TargetDied,
            TracepinError::ProcessHandle(_) => Status::ProcessHandle,
            TracepinError::DebugLoopAlreadyRunning => Status::DebugLoopAlreadyRunning,
            TracepinError::DebugLoopAlreadyStopped => Status::DebugLoopAlreadyStopped,
            TracepinError::DebugLoopForeign => Status::DebugLoopForeign,
            TracepinError::ForeignDebuggerNotAttached => Status::ForeignDebuggerNotAttached,
            TracepinError::ForeignDebugLoopStopped => Status::ForeignDebugLoopStopped,
            TracepinError::DebuggerAlreadyAttached => Status::DebuggerAlreadyAttached,
            TracepinError::DebuggerNotFound => Status::DebuggerNotFound,
            TracepinError::OwnedLoopRunning => Status::OwnedLoopRunning,
            TracepinError::ForeignDebuggerStillAttached => Status::ForeignDebuggerStillAttached,
            TracepinError::InconsistentOverride => Status::InconsistentOverride,
            TracepinError::CannotCheckDebugger(_) => Status::CannotCheckDebugger,
            TracepinError::DebugThreadStart(_) => Status::DebugThreadStart,
            TracepinError::DebuggerAttach(_) => Status::DebuggerAttach,
            TracepinError::DebugBreakFailed(_) => Status::DebugBreakFailed,
            TracepinError::DebugLoopStopFailed => Status::DebugLoopStopFailed,
            TracepinError::TrackerAlreadyExists(_) => Status::TrackerAlreadyExists,
            TracepinError::TrackerNotFound(_) => Status::TrackerNotFound,
            TracepinError::NoActiveDebugger => Status::NoActiveDebugger,
            TracepinError::HookCreate(_) => Status::HookCreate,
            TracepinError::StepAlreadyActive => Status::StepAlreadyActive,
            TracepinError::StepNotActive => Status::StepNotActive,
            TracepinError::StepActive => Status::StepActive,
            TracepinError::MemoryRead(_) => Status::MemoryRead,
            TracepinError::MemoryWrite(_) => Status::MemoryWrite,
        }
    }
}

/// Collapses an operation result into its status code.
pub fn status_of<T>(result: &Result<T, TracepinError>) -> Status {
    match result {
        Ok(_) => Status::Success,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_distinct_per_category() {
        assert_eq!(Status::Success.code(), 0);
        assert_eq!(TracepinError::InvalidHandle.status().code(), 1);
        assert_eq!(
            TracepinError::HookCreate(HookError::PoolExhausted).status(),
            Status::HookCreate
        );
        assert_eq!(
            TracepinError::MemoryRead(TargetError::Read {
                address: 0x1000,
                len: 1
            })
            .status(),
            Status::MemoryRead
        );
    }

    #[test]
    fn status_of_maps_results() {
        let ok: Result<(), TracepinError> = Ok(());
        let err: Result<(), TracepinError> = Err(TracepinError::NoActiveDebugger);
        assert_eq!(status_of(&ok), Status::Success);
        assert_eq!(status_of(&err), Status::NoActiveDebugger);
    }

    #[test]
    fn hook_error_messages_carry_lengths() {
        let err = HookError::FunctionTooShort {
            declared: 3,
            required: 5,
        };
        let msg = TracepinError::from(err).to_string();
        assert!(msg.contains("length 3"), "unexpected message: {msg}");
        assert!(msg.contains("5-byte"), "unexpected message: {msg}");
    }
}
