//! displot: display-number allocation for concurrent X servers.
//!
//! Each build host gets a [`SlotAllocator`] handing out display numbers in a
//! configured range. Numbers whose server failed to start are blacklisted
//! until the range runs dry. [`SessionManager`] ties allocation to a
//! [`DisplayLauncher`] with launch retries and teardown.

pub mod cleanup;
pub mod config;
pub mod launcher;
pub mod persist;
pub mod registry;
pub mod session;
pub mod slot;
mod version;

pub use cleanup::CleanupTracker;
pub use config::{CommandCheck, ConfigError, DisplayConfig, check_command_line};
pub use launcher::{CommandLauncher, DisplayHandle, DisplayLauncher, LaunchError};
pub use persist::{PersistError, PersistedState, StateFile, StateLock, StateSink};
pub use registry::{RegistryError, SessionRegistry};
pub use session::{
    DisplaySession, HostInfo, SessionError, SessionManager, SkipReason, acquire_and_start,
};
pub use slot::{AllocError, Slot, SlotAllocator, SlotState};
pub use version::DISPLOT_VERSION;
