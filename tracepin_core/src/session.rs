//! One instrumentation context bound to one target process.
//!
//! A [`Session`] owns the trackers and trampoline pools for its target, the
//! optional debug loop, and the step state. All of it sits behind a single
//! mutex shared with the loop thread. The lock is never held while waiting on
//! the loop.

use crate::config::TracepinConfig;
use crate::debug_loop::{self, LoopHandle, override_decision};
use crate::error::TracepinError;
use crate::pool::PoolSet;
use crate::target::{Address, Pid, ProcessMemory, TargetAccess, Tid};
use crate::tracker::{self, FilterMode, TrackerInfo, TrackerSet};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Everything a session and its loop thread share.
#[derive(Debug, Default)]
pub struct SessionState {
    pub target: Option<Pid>,
    pub trackers: TrackerSet,
    pub pools: PoolSet,
    /// A debugger, ours or foreign, is servicing the target.
    pub loop_running: bool,
    /// The running debugger is someone else's.
    pub loop_foreign: bool,
    pub step_active: bool,
    /// A step ended and its hits have not been consumed yet.
    pub pending_reset: bool,
    /// A stop of the owned loop is in progress or failed.
    pub stop_requested: bool,
    /// Sticky.
    pub target_died: bool,
    pub(crate) debug_loop: Option<LoopHandle>,
}

pub(crate) fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Session {
    access: Arc<dyn TargetAccess>,
    config: TracepinConfig,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn new(access: Arc<dyn TargetAccess>, config: TracepinConfig) -> Self {
        Self {
            access,
            config,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        lock_state(&self.state)
    }

    fn open(&self, pid: Pid) -> Result<Box<dyn ProcessMemory>, TracepinError> {
        self.access.open(pid).map_err(TracepinError::ProcessHandle)
    }

    /// Detects target death and tears down loop bookkeeping the first time.
    ///
    /// Once dead, always dead: the session forgets its target, an owned loop
    /// thread is joined, and every target-dependent operation reports
    /// [`TracepinError::TargetDied`].
    fn check_dead(&self, st: &mut SessionState) -> bool {
        if !st.target_died {
            match st.target {
                Some(pid) if !self.access.is_alive(pid) => st.target_died = true,
                _ => return false,
            }
        }
        if let Some(pid) = st.target.take() {
            info!("Target process {pid} died");
        }
        if let Some(handle) = st.debug_loop.take() {
            handle.reap();
        }
        st.loop_running = false;
        st.loop_foreign = false;
        st.pending_reset = false;
        st.step_active = false;
        st.stop_requested = false;
        true
    }

    fn live_target(&self, st: &mut SessionState) -> Result<Pid, TracepinError> {
        if self.check_dead(st) {
            return Err(TracepinError::TargetDied);
        }
        st.target.ok_or(TracepinError::TargetNotSet)
    }

    pub fn target(&self) -> Option<Pid> {
        self.lock().target
    }

    pub fn set_target(&self, pid: Pid) -> Result<(), TracepinError> {
        let mut st = self.lock();
        if self.check_dead(&mut st) {
            return Err(TracepinError::TargetDied);
        }
        if st.target.is_some() {
            return Err(TracepinError::TargetAlreadySet);
        }
        if !self.access.is_alive(pid) {
            return Err(TracepinError::InvalidTarget(pid));
        }
        match self.access.is_64bit(pid) {
            Ok(true) => {}
            Ok(false) => return Err(TracepinError::TargetNot64Bit(pid)),
            Err(_) => return Err(TracepinError::InvalidTarget(pid)),
        }
        st.target = Some(pid);
        info!("Session target set to process {pid}");
        Ok(())
    }

    pub fn debug_loop_start(&self) -> Result<(), TracepinError> {
        let mut st = self.lock();
        if st.loop_running || st.loop_foreign {
            return Err(TracepinError::DebugLoopAlreadyRunning);
        }
        let pid = self.live_target(&mut st)?;
        if !self.access.is_alive(pid) {
            return Err(TracepinError::InvalidTarget(pid));
        }
        let present = self
            .access
            .debugger_present(pid)
            .map_err(TracepinError::CannotCheckDebugger)?;
        if present {
            return Err(TracepinError::DebuggerAlreadyAttached);
        }

        // The loop thread attaches without touching the state, so holding the lock here is safe.
        let handle = debug_loop::spawn(
            Arc::clone(&self.access),
            Arc::clone(&self.state),
            pid,
            self.config.debug_loop.break_timeout(),
        )?;
        st.debug_loop = Some(handle);
        st.loop_running = true;
        st.loop_foreign = false;
        st.stop_requested = false;
        info!("Debug loop started for process {pid}");
        Ok(())
    }

    pub fn debug_loop_stop(&self) -> Result<(), TracepinError> {
        let mut st = self.lock();
        if self.check_dead(&mut st) {
            return Err(TracepinError::TargetDied);
        }
        if !st.loop_running {
            return Err(TracepinError::DebugLoopAlreadyStopped);
        }
        if st.loop_foreign {
            return Err(TracepinError::DebugLoopForeign);
        }
        let pid = st.target.ok_or(TracepinError::TargetNotSet)?;

        let armed = st
            .trackers
            .iter_live()
            .any(|(_, t)| t.is_breakpoint() && t.enabled);
        if armed {
            let process = self.open(pid)?;
            for tracker in st.trackers.iter_live_mut() {
                if tracker.is_breakpoint() && tracker.enabled {
                    tracker.disable(process.as_ref());
                }
            }
        }

        st.stop_requested = true;
        let Some(handle) = st.debug_loop.take() else {
            st.loop_running = false;
            st.stop_requested = false;
            return Ok(());
        };
        drop(st);

        let outcome = handle.stop(self.access.as_ref(), pid, &self.config.debug_loop);
        let mut st = self.lock();
        match outcome {
            Ok(exit) => {
                handle.join();
                st.loop_running = false;
                st.stop_requested = false;
                info!("Debug loop for process {pid} stopped ({exit:?})");
                Ok(())
            }
            Err(e) => {
                warn!("Failed to stop debug loop for process {pid}: {e}");
                st.debug_loop = Some(handle);
                Err(e)
            }
        }
    }

    /// Lets an external debugger stand in for the owned loop, or hands back
    /// after it is gone. `running` is the caller's claim about its debugger.
    pub fn debug_loop_override(&self, running: bool) -> Result<(), TracepinError> {
        let mut st = self.lock();
        let pid = self.live_target(&mut st)?;
        let present = self
            .access
            .debugger_present(pid)
            .map_err(TracepinError::CannotCheckDebugger)?;
        let (foreign, loop_running) =
            override_decision(present, st.loop_foreign, st.loop_running, running)?;
        st.loop_foreign = foreign;
        st.loop_running = loop_running;
        info!("Foreign debugger for process {pid}: running={loop_running}");
        Ok(())
    }

    /// Breakpoint notification from a foreign debugger.
    ///
    /// Returns `false` if the address is not one of this session's
    /// breakpoints. Otherwise the original byte is restored and `tid` is
    /// rewound onto it before returning `true`.
    pub fn notify_breakpoint(&self, tid: Tid, address: Address) -> Result<bool, TracepinError> {
        let mut st = self.lock();
        if !st.loop_foreign {
            return Err(TracepinError::ForeignDebuggerNotAttached);
        }
        if !st.loop_running {
            return Err(TracepinError::ForeignDebugLoopStopped);
        }
        let pid = st.target.ok_or(TracepinError::TargetNotSet)?;
        let Some(original) = debug_loop::dispatch_breakpoint(&mut st, address) else {
            return Ok(false);
        };
        self.access
            .restore_breakpoint(pid, tid, address, original)
            .map_err(TracepinError::MemoryWrite)?;
        Ok(true)
    }

    pub fn add_breakpoint(&self, address: Address) -> Result<(), TracepinError> {
        let mut st = self.lock();
        let pid = self.live_target(&mut st)?;
        if st.trackers.contains(address) {
            return Err(TracepinError::TrackerAlreadyExists(address));
        }
        let process = self.open(pid)?;
        let kind = tracker::breakpoint_at(process.as_ref(), address)?;
        st.trackers.insert(address, kind)?;
        debug!("Added breakpoint at {address:#x}");
        Ok(())
    }

    /// Adds an inline hook over a function of `function_len` bytes at `address`.
    pub fn add_hook(&self, address: Address, function_len: u32) -> Result<(), TracepinError> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let pid = self.live_target(st)?;
        if st.trackers.contains(address) {
            return Err(TracepinError::TrackerAlreadyExists(address));
        }
        let process = self.open(pid)?;
        let kind = tracker::hook_at(
            process.as_ref(),
            &mut st.pools,
            address,
            function_len,
            &self.config.pool,
        )?;
        st.trackers.insert(address, kind)?;
        debug!("Added hook at {address:#x}");
        Ok(())
    }

    pub fn remove(&self, address: Address) -> Result<(), TracepinError> {
        let mut st = self.lock();
        let pid = self.live_target(&mut st)?;
        if !st.trackers.contains(address) {
            return Err(TracepinError::TrackerNotFound(address));
        }
        let process = self.open(pid)?;
        st.trackers.remove(address, Some(process.as_ref()))
    }

    /// Arms one tracker. Breakpoints need a running debugger that is not being stopped.
    pub fn enable(&self, address: Address) -> Result<(), TracepinError> {
        let mut st = self.lock();
        let pid = self.live_target(&mut st)?;
        let debugger_ready = st.loop_running && !st.stop_requested;
        let tracker = st.trackers.lookup_mut(address)?;
        if tracker.enabled {
            return Ok(());
        }
        if tracker.is_breakpoint() && !debugger_ready {
            return Err(TracepinError::NoActiveDebugger);
        }
        let process = self.open(pid)?;
        tracker.enable(process.as_ref())
    }

    pub fn disable(&self, address: Address) -> Result<(), TracepinError> {
        let mut st = self.lock();
        let pid = self.live_target(&mut st)?;
        let tracker = st.trackers.lookup_mut(address)?;
        if !tracker.enabled {
            return Ok(());
        }
        let process = self.open(pid)?;
        tracker.disable(process.as_ref());
        Ok(())
    }

    /// Arms every disarmed tracker. Breakpoints are skipped without a
    /// debugger, in which case the rest are still armed and the call reports
    /// [`TracepinError::NoActiveDebugger`].
    pub fn enable_all(&self) -> Result<(), TracepinError> {
        let mut st = self.lock();
        let pid = self.live_target(&mut st)?;
        let debugger_ready = st.loop_running && !st.stop_requested;
        let process = self.open(pid)?;
        let mut skipped = false;
        let mut first_error = None;
        for tracker in st.trackers.iter_live_mut() {
            if tracker.enabled {
                continue;
            }
            if tracker.is_breakpoint() && !debugger_ready {
                skipped = true;
                continue;
            }
            if let Err(e) = tracker.enable(process.as_ref()) {
                warn!("Failed to enable tracker at {:#x}: {e}", tracker.address);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if skipped {
            return Err(TracepinError::NoActiveDebugger);
        }
        Ok(())
    }

    pub fn disable_all(&self) -> Result<(), TracepinError> {
        let mut st = self.lock();
        if st.step_active {
            return Err(TracepinError::StepActive);
        }
        let pid = self.live_target(&mut st)?;
        let process = self.open(pid)?;
        for tracker in st.trackers.iter_live_mut().filter(|t| t.enabled) {
            tracker.disable(process.as_ref());
        }
        Ok(())
    }

    /// Live trackers in insertion order.
    pub fn trackers(&self) -> Vec<TrackerInfo> {
        self.lock().trackers.snapshot()
    }

    pub fn step_begin(&self) -> Result<(), TracepinError> {
        let mut st = self.lock();
        if st.step_active {
            return Err(TracepinError::StepAlreadyActive);
        }
        if self.check_dead(&mut st) {
            return Err(TracepinError::TargetDied);
        }
        if st.pending_reset {
            st.trackers.reset_hits();
        }
        st.pending_reset = false;
        st.step_active = true;
        debug!("Step started");
        Ok(())
    }

    /// Closes the step and collects hook hits. Breakpoint hits were booked by
    /// the debugger as they happened.
    pub fn step_end(&self) -> Result<(), TracepinError> {
        let mut st = self.lock();
        if self.check_dead(&mut st) {
            return Err(TracepinError::TargetDied);
        }
        if !st.step_active {
            return Err(TracepinError::StepNotActive);
        }
        st.step_active = false;
        st.pending_reset = true;

        let pid = st.target.ok_or(TracepinError::TargetNotSet)?;
        let process = self.open(pid)?;
        let mut first_error = None;
        for tracker in st.trackers.iter_live_mut().filter(|t| t.enabled) {
            if let Err(e) = tracker.poll_hook(process.as_ref()) {
                warn!("Failed to read hit byte of hook at {:#x}: {e}", tracker.address);
                first_error.get_or_insert(e);
            }
        }
        debug!("Step ended");
        first_error.map_or(Ok(()), Err)
    }

    pub fn reset(&self) -> Result<(), TracepinError> {
        let mut st = self.lock();
        if st.step_active {
            return Err(TracepinError::StepActive);
        }
        st.trackers.reset_hits();
        st.pending_reset = false;
        Ok(())
    }

    /// Removes the trackers that ran during the last step. Returns how many.
    pub fn filter_executed(&self) -> Result<usize, TracepinError> {
        self.filter(FilterMode::Executed)
    }

    /// Removes the armed trackers that did not run during the last step. Returns how many.
    pub fn filter_not_executed(&self) -> Result<usize, TracepinError> {
        self.filter(FilterMode::NotExecuted)
    }

    fn filter(&self, mode: FilterMode) -> Result<usize, TracepinError> {
        let mut st = self.lock();
        if st.step_active {
            return Err(TracepinError::StepActive);
        }
        let process = st.target.and_then(|pid| self.access.open(pid).ok());
        let removed = st.trackers.filter(mode, process.as_deref());
        st.pending_reset = false;
        Ok(removed)
    }

    /// Disarms everything and stops an owned loop. On a stop failure the
    /// session is left as it was, minus the disarming.
    pub fn shutdown(&self) -> Result<(), TracepinError> {
        if let Err(e) = self.disable_all() {
            debug!("Disabling trackers during shutdown failed: {e}");
        }
        let owned_loop = {
            let st = self.lock();
            st.loop_running && !st.loop_foreign
        };
        if owned_loop {
            match self.debug_loop_stop() {
                Ok(()) | Err(TracepinError::TargetDied) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
