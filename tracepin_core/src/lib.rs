pub mod config;
pub mod debug_loop;
pub mod directory;
pub mod error;
pub mod pool;
pub mod session;
pub mod sim;
pub mod target;
pub mod trampoline;
pub mod tracker;

pub use config::{ConfigError, TracepinConfig};
pub use directory::{SessionDirectory, SessionHandle};
pub use error::{HookError, Status, TracepinError, status_of};
pub use session::Session;
pub use sim::SimulatedTarget;
pub use target::{Address, Pid, ProcessMemory, TargetAccess, TargetError, Tid};
pub use trampoline::Form;
pub use tracker::{FilterMode, TrackerInfo, TrackerInfoKind};
