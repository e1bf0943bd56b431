//! The bounded set of live sessions and the handles that name them.

use crate::config::TracepinConfig;
use crate::error::TracepinError;
use crate::session::Session;
use crate::target::{Address, Pid, TargetAccess, Tid};
use crate::tracker::TrackerInfo;
use log::info;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// Opaque name of a session. A handle outlives its session only as an invalid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionHandle {
    slot: u32,
    generation: u32,
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}.{}", self.slot, self.generation)
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    session: Option<Arc<Session>>,
}

pub struct SessionDirectory {
    access: Arc<dyn TargetAccess>,
    config: TracepinConfig,
    slots: Mutex<Vec<Slot>>,
}

static GLOBAL: OnceLock<SessionDirectory> = OnceLock::new();

impl SessionDirectory {
    pub fn new(access: Arc<dyn TargetAccess>, config: TracepinConfig) -> Self {
        let slots = (0..config.directory.capacity)
            .map(|_| Slot::default())
            .collect();
        Self {
            access,
            config,
            slots: Mutex::new(slots),
        }
    }

    /// Installs the process-wide directory. Later calls return the one already installed.
    pub fn install_global(
        access: Arc<dyn TargetAccess>,
        config: TracepinConfig,
    ) -> &'static SessionDirectory {
        GLOBAL.get_or_init(|| SessionDirectory::new(access, config))
    }

    pub fn global() -> Option<&'static SessionDirectory> {
        GLOBAL.get()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.config.directory.capacity
    }

    pub fn len(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.session.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn create(&self) -> Result<SessionHandle, TracepinError> {
        if !self.access.check_privileges() {
            return Err(TracepinError::InsufficientPrivileges);
        }
        let mut slots = self.slots();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.session.is_none())
            .ok_or(TracepinError::DirectoryFull {
                capacity: self.config.directory.capacity,
            })?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.session = Some(Arc::new(Session::new(
            Arc::clone(&self.access),
            self.config.clone(),
        )));
        let handle = SessionHandle {
            slot: index as u32,
            generation: slot.generation,
        };
        info!("Created {handle}");
        Ok(handle)
    }

    /// Looks up a live session. The directory lock is released before the session is used.
    pub fn session(&self, handle: SessionHandle) -> Result<Arc<Session>, TracepinError> {
        self.slots()
            .get(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.clone())
            .ok_or(TracepinError::InvalidHandle)
    }

    /// Shuts the session down and frees its slot. If an owned loop cannot be
    /// stopped the session stays registered.
    pub fn destroy(&self, handle: SessionHandle) -> Result<(), TracepinError> {
        let session = self.session(handle)?;
        session.shutdown()?;
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(handle.slot as usize) {
            if slot.generation == handle.generation
                && slot
                    .session
                    .as_ref()
                    .is_some_and(|s| Arc::ptr_eq(s, &session))
            {
                slot.session = None;
            }
        }
        info!("Destroyed {handle}");
        Ok(())
    }

    /// Destroys every session. Returns the first failure; sessions that fail stay registered.
    pub fn shutdown(&self) -> Result<(), TracepinError> {
        let handles: Vec<SessionHandle> = self
            .slots()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.session.is_some())
            .map(|(i, slot)| SessionHandle {
                slot: i as u32,
                generation: slot.generation,
            })
            .collect();
        let mut first_error = None;
        for handle in handles {
            if let Err(e) = self.destroy(handle) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn set_target(&self, handle: SessionHandle, pid: Pid) -> Result<(), TracepinError> {
        self.session(handle)?.set_target(pid)
    }

    pub fn debug_loop_start(&self, handle: SessionHandle) -> Result<(), TracepinError> {
        self.session(handle)?.debug_loop_start()
    }

    pub fn debug_loop_stop(&self, handle: SessionHandle) -> Result<(), TracepinError> {
        self.session(handle)?.debug_loop_stop()
    }

    pub fn debug_loop_override(
        &self,
        handle: SessionHandle,
        running: bool,
    ) -> Result<(), TracepinError> {
        self.session(handle)?.debug_loop_override(running)
    }

    pub fn notify_breakpoint(
        &self,
        handle: SessionHandle,
        tid: Tid,
        address: Address,
    ) -> Result<bool, TracepinError> {
        self.session(handle)?.notify_breakpoint(tid, address)
    }

    pub fn add_breakpoint(&self, handle: SessionHandle, address: Address) -> Result<(), TracepinError> {
        self.session(handle)?.add_breakpoint(address)
    }

    pub fn add_hook(
        &self,
        handle: SessionHandle,
        address: Address,
        function_len: u32,
    ) -> Result<(), TracepinError> {
        self.session(handle)?.add_hook(address, function_len)
    }

    pub fn remove(&self, handle: SessionHandle, address: Address) -> Result<(), TracepinError> {
        self.session(handle)?.remove(address)
    }

    pub fn enable(&self, handle: SessionHandle, address: Address) -> Result<(), TracepinError> {
        self.session(handle)?.enable(address)
    }

    pub fn disable(&self, handle: SessionHandle, address: Address) -> Result<(), TracepinError> {
        self.session(handle)?.disable(address)
    }

    pub fn enable_all(&self, handle: SessionHandle) -> Result<(), TracepinError> {
        self.session(handle)?.enable_all()
    }

    pub fn disable_all(&self, handle: SessionHandle) -> Result<(), TracepinError> {
        self.session(handle)?.disable_all()
    }

    pub fn trackers(&self, handle: SessionHandle) -> Result<Vec<TrackerInfo>, TracepinError> {
        Ok(self.session(handle)?.trackers())
    }

    pub fn step_begin(&self, handle: SessionHandle) -> Result<(), TracepinError> {
        self.session(handle)?.step_begin()
    }

    pub fn step_end(&self, handle: SessionHandle) -> Result<(), TracepinError> {
        self.session(handle)?.step_end()
    }

    pub fn reset(&self, handle: SessionHandle) -> Result<(), TracepinError> {
        self.session(handle)?.reset()
    }

    pub fn filter_executed(&self, handle: SessionHandle) -> Result<usize, TracepinError> {
        self.session(handle)?.filter_executed()
    }

    pub fn filter_not_executed(&self, handle: SessionHandle) -> Result<usize, TracepinError> {
        self.session(handle)?.filter_not_executed()
    }
}
