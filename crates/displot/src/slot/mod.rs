//! Display slot allocation.
//!
//! A slot moves through a small state machine:
//! - `Free` → `Allocated` via `SlotAllocator::allocate()`
//! - `Allocated` → `Free` via `free()`
//! - `Allocated` → `Blacklisted` via `blacklist()`
//! - `Blacklisted` → `Free`: only when the whole pool is saturated and the next
//!   `allocate()` clears the blacklist (amnesty). There is no per-slot amnesty.

mod allocator;
mod state;

pub use allocator::{AllocError, SlotAllocator};
pub use state::SlotState;

/// A display number handed out by a [`SlotAllocator`].
pub type Slot = u32;
