//! Tracks hosts that already ran the one-shot stale-server clean up.

use std::collections::HashSet;
use std::sync::Mutex;

/// Host names whose clean up has run. Guarded by its own lock, independent of
/// any allocator.
#[derive(Debug, Default)]
pub struct CleanupTracker {
    hosts: Mutex<HashSet<String>>,
}

impl CleanupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `host`. Returns `true` only the first time a host is seen.
    pub fn mark(&self, host: &str) -> bool {
        let mut hosts = match self.hosts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        hosts.insert(host.to_string())
    }

    pub fn contains(&self, host: &str) -> bool {
        match self.hosts.lock() {
            Ok(guard) => guard.contains(host),
            Err(poisoned) => poisoned.into_inner().contains(host),
        }
    }

    /// Drop a decommissioned host so a returning host is cleaned again.
    pub fn forget(&self, host: &str) -> bool {
        match self.hosts.lock() {
            Ok(mut guard) => guard.remove(host),
            Err(poisoned) => poisoned.into_inner().remove(host),
        }
    }
}
