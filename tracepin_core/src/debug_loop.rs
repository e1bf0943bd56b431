//! The debugger thread a session runs against its target.
//!
//! [`spawn`] starts a thread that attaches to the target and turns debug
//! events into tracker bookkeeping until it is told to stop or the target
//! exits. The session talks to it over two channels: [`LoopCommand`]s go in,
//! [`LoopReport`]s come out. Stopping is bounded, see [`LoopHandle::stop`].

use crate::config::DebugLoopSettings;
use crate::error::TracepinError;
use crate::session::{SessionState, lock_state};
use crate::target::{Address, DebugEvent, DebugEventKind, Pid, Resume, TargetAccess, TargetError};
use crate::tracker::TrackerKind;
use log::{debug, error, info, trace, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCommand {
    Stop,
}

/// Why the loop thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    TargetDied,
    /// The debugging facility failed underneath the loop.
    Failed(TargetError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopReport {
    Attached,
    AttachFailed(TargetError),
    Exited(LoopExit),
}

/// The session's end of a running loop thread.
#[derive(Debug)]
pub struct LoopHandle {
    thread: JoinHandle<()>,
    commands: Sender<LoopCommand>,
    reports: Receiver<LoopReport>,
}

/// Starts the loop thread for `pid` and waits up to `attach_timeout` for it to attach.
pub fn spawn(
    access: Arc<dyn TargetAccess>,
    state: Arc<Mutex<SessionState>>,
    pid: Pid,
    attach_timeout: Duration,
) -> Result<LoopHandle, TracepinError> {
    let (command_tx, command_rx) = mpsc::channel();
    let (report_tx, report_rx) = mpsc::channel();

    let thread = thread::Builder::new()
        .name(format!("tracepin-debug-{pid}"))
        .spawn(move || run(access.as_ref(), &state, pid, &command_rx, &report_tx))
        .map_err(|e| TracepinError::DebugThreadStart(e.to_string()))?;

    let handle = LoopHandle {
        thread,
        commands: command_tx,
        reports: report_rx,
    };
    let report = handle.reports.recv_timeout(attach_timeout);
    match report {
        Ok(LoopReport::Attached) => Ok(handle),
        Ok(LoopReport::AttachFailed(e)) => {
            handle.join();
            Err(TracepinError::DebuggerAttach(e))
        }
        Ok(LoopReport::Exited(_)) | Err(RecvTimeoutError::Disconnected) => {
            handle.join();
            Err(TracepinError::DebuggerAttach(TargetError::Debugger(
                "debug loop exited before attaching".to_string(),
            )))
        }
        Err(RecvTimeoutError::Timeout) => {
            // The thread exits on its next event once it sees the stop.
            let _ = handle.commands.send(LoopCommand::Stop);
            Err(TracepinError::DebuggerAttach(TargetError::Debugger(format!(
                "no attach confirmation within {attach_timeout:?}"
            ))))
        }
    }
}

impl LoopHandle {
    /// Asks the loop to exit and waits for it.
    ///
    /// The first wait covers a loop that is between events. If it is blocked
    /// waiting for one, a forced break in the target wakes it and a second,
    /// longer wait follows.
    pub fn stop(
        &self,
        access: &dyn TargetAccess,
        pid: Pid,
        settings: &DebugLoopSettings,
    ) -> Result<LoopExit, TracepinError> {
        let _ = self.commands.send(LoopCommand::Stop);
        if let Some(exit) = self.wait_exit(settings.stop_timeout()) {
            return Ok(exit);
        }

        warn!(
            "Debug loop for process {pid} still running after {:?}; forcing a break",
            settings.stop_timeout()
        );
        access
            .debug_break(pid)
            .map_err(TracepinError::DebugBreakFailed)?;
        self.wait_exit(settings.break_timeout())
            .ok_or(TracepinError::DebugLoopStopFailed)
    }

    fn wait_exit(&self, timeout: Duration) -> Option<LoopExit> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.reports.recv_timeout(remaining) {
                Ok(LoopReport::Exited(exit)) => return Some(exit),
                Ok(_) => continue,
                Err(RecvTimeoutError::Disconnected) => return Some(LoopExit::Stopped),
                Err(RecvTimeoutError::Timeout) => return None,
            }
        }
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("Debug loop thread panicked");
        }
    }

    /// Joins a loop whose target died. Callable with the session lock held:
    /// a thread that has not finished yet may still be waiting for that lock,
    /// so it is joined from a helper thread instead. Returns whether the join
    /// happened inline.
    pub fn reap(self) -> bool {
        let _ = self.commands.send(LoopCommand::Stop);
        if self.thread.is_finished() {
            self.join();
            return true;
        }
        let spawned = thread::Builder::new()
            .name("tracepin-reap".to_string())
            .spawn(move || self.join());
        if let Err(e) = spawned {
            warn!("Failed to spawn reaper for debug loop: {e}");
        }
        false
    }
}

fn run(
    access: &dyn TargetAccess,
    state: &Mutex<SessionState>,
    pid: Pid,
    commands: &Receiver<LoopCommand>,
    reports: &Sender<LoopReport>,
) {
    if let Err(e) = access.attach(pid) {
        warn!("Failed to attach to process {pid}: {e}");
        let _ = reports.send(LoopReport::AttachFailed(e));
        return;
    }
    info!("Attached to process {pid}");
    let _ = reports.send(LoopReport::Attached);

    let exit = event_loop(access, state, pid, commands);
    if exit != LoopExit::TargetDied {
        if let Err(e) = access.detach(pid) {
            warn!("Failed to detach from process {pid}: {e}");
        }
    }
    if let LoopExit::Failed(e) = &exit {
        error!("Debug loop for process {pid} failed: {e}");
        lock_state(state).loop_running = false;
    }
    info!("Debug loop for process {pid} exited: {exit:?}");
    let _ = reports.send(LoopReport::Exited(exit));
}

fn event_loop(
    access: &dyn TargetAccess,
    state: &Mutex<SessionState>,
    pid: Pid,
    commands: &Receiver<LoopCommand>,
) -> LoopExit {
    loop {
        match commands.try_recv() {
            Ok(LoopCommand::Stop) | Err(TryRecvError::Disconnected) => return LoopExit::Stopped,
            Err(TryRecvError::Empty) => {}
        }

        let event = match access.wait_event(pid) {
            Ok(event) => event,
            Err(e) => {
                if access.is_alive(pid) {
                    return LoopExit::Failed(e);
                }
                mark_target_died(state);
                return LoopExit::TargetDied;
            }
        };
        trace!("Debug event: {event}");

        let (resume, died) = handle_event(access, state, &event);
        if let Err(e) = access.continue_event(&event, resume) {
            warn!("Failed to continue {event}: {e}");
        }
        if died {
            return LoopExit::TargetDied;
        }
    }
}

fn mark_target_died(state: &Mutex<SessionState>) {
    let mut st = lock_state(state);
    st.target_died = true;
    st.loop_running = false;
}

/// Returns how to resume `event` and whether the target exited.
fn handle_event(
    access: &dyn TargetAccess,
    state: &Mutex<SessionState>,
    event: &DebugEvent,
) -> (Resume, bool) {
    match event.kind {
        DebugEventKind::Breakpoint { address } => {
            let mut st = lock_state(state);
            if let Some(original) = dispatch_breakpoint(&mut st, address) {
                if let Err(e) = access.restore_breakpoint(event.pid, event.tid, address, original) {
                    warn!("Failed to restore breakpoint at {address:#x}: {e}");
                }
            }
            (Resume::Handled, false)
        }
        DebugEventKind::Exception { code, address } => {
            debug!("Passing exception {code:#x} at {address:#x} to the target");
            (Resume::NotHandled, false)
        }
        DebugEventKind::ExitProcess { exit_code } => {
            info!("Process {} exited with code {exit_code}", event.pid);
            mark_target_died(state);
            (Resume::Handled, true)
        }
        _ => (Resume::Handled, false),
    }
}

/// Books a breakpoint hit at `address`.
///
/// Returns the byte to put back if the breakpoint is ours, `None` otherwise.
/// The tracker is disabled either way; it is marked hit only inside a step.
pub fn dispatch_breakpoint(state: &mut SessionState, address: Address) -> Option<u8> {
    let step_active = state.step_active;
    let id = state.trackers.find(address)?;
    let tracker = state.trackers.get_mut(id)?;
    let TrackerKind::Breakpoint(bp) = &tracker.kind else {
        return None;
    };
    let original = bp.original_byte;
    if step_active {
        tracker.hit = true;
    }
    tracker.enabled = false;
    trace!("Breakpoint hit at {address:#x} (in step: {step_active})");
    Some(original)
}

/// Resolves a foreign-debugger override request.
///
/// Takes whether any debugger is attached, the current foreign and running
/// flags, and whether the caller says its debugger is running. Returns the
/// new `(foreign, running)` flags.
pub fn override_decision(
    present: bool,
    foreign: bool,
    running: bool,
    requested: bool,
) -> Result<(bool, bool), TracepinError> {
    match (present, foreign, running, requested) {
        (false, true, true, false) => Ok((false, false)),
        (true, false, false, true) => Ok((true, true)),
        (false, _, _, true) => Err(TracepinError::DebuggerNotFound),
        (true, false, true, true) => Err(TracepinError::OwnedLoopRunning),
        (true, true, true, false) => Err(TracepinError::ForeignDebuggerStillAttached),
        _ => Err(TracepinError::InconsistentOverride),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedTarget;
    use crate::tracker::BreakpointInfo;

    const PID: Pid = 31;

    #[test]
    fn override_table() {
        use TracepinError::*;
        let cases = [
            ((false, true, true, false), Ok((false, false))),
            ((true, false, false, true), Ok((true, true))),
            ((false, false, false, true), Err(DebuggerNotFound)),
            ((false, true, true, true), Err(DebuggerNotFound)),
            ((false, false, true, true), Err(DebuggerNotFound)),
            ((true, false, true, true), Err(OwnedLoopRunning)),
            ((true, true, true, false), Err(ForeignDebuggerStillAttached)),
            ((false, false, false, false), Err(InconsistentOverride)),
            ((true, false, false, false), Err(InconsistentOverride)),
            ((true, true, true, true), Err(InconsistentOverride)),
            ((false, false, true, false), Err(InconsistentOverride)),
        ];
        for ((present, foreign, running, requested), expected) in cases {
            assert_eq!(
                override_decision(present, foreign, running, requested),
                expected,
                "present={present} foreign={foreign} running={running} requested={requested}"
            );
        }
    }

    #[test]
    fn dispatch_marks_hit_only_inside_step() {
        let mut state = SessionState::default();
        state
            .trackers
            .insert(
                0x4000,
                TrackerKind::Breakpoint(BreakpointInfo { original_byte: 0x55 }),
            )
            .unwrap();
        let id = state.trackers.find(0x4000).unwrap();
        state.trackers.get_mut(id).unwrap().enabled = true;

        assert_eq!(dispatch_breakpoint(&mut state, 0x4000), Some(0x55));
        let tracker = state.trackers.get(id).unwrap();
        assert!(!tracker.enabled);
        assert!(!tracker.hit);

        state.step_active = true;
        assert_eq!(dispatch_breakpoint(&mut state, 0x4000), Some(0x55));
        assert!(state.trackers.get(id).unwrap().hit);

        assert_eq!(dispatch_breakpoint(&mut state, 0x5000), None);
    }

    #[test]
    fn reap_joins_loop_after_target_exit() {
        let sim = SimulatedTarget::new();
        sim.spawn(PID);
        let state = Arc::new(Mutex::new(SessionState::default()));
        let handle = spawn(
            Arc::new(sim.clone()),
            Arc::clone(&state),
            PID,
            Duration::from_secs(1),
        )
        .unwrap();

        sim.kill(PID, 0);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.reap());
        assert!(lock_state(&state).target_died);
        assert!(!lock_state(&state).loop_running);
    }
}
