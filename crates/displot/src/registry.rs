//! Per-host allocator registry.
//!
//! Owns one [`SlotAllocator`] per host name, creates them lazily, and persists
//! all of them as the [`StateSink`] each allocator reports to. Several
//! registries, in this process or others, may share one [`StateFile`]: every
//! mutation re-reads the file under its lock before applying and saving.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;

use crate::persist::{PersistError, StateFile, StateSink};
use crate::slot::{AllocError, Slot, SlotAllocator, SlotState};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

pub struct SessionRegistry {
    allocators: DashMap<String, Arc<SlotAllocator>>,
    min: Slot,
    max: Slot,
    store: Option<StateFile>,
    /// Serializes transactions within this process; the file lock covers
    /// other processes.
    save_lock: Mutex<()>,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    /// Registry without durable storage.
    pub fn in_memory(min: Slot, max: Slot) -> Result<Arc<Self>, RegistryError> {
        validate(min, max)?;
        Ok(Self::build(min, max, None, BTreeMap::new()))
    }

    /// Load every host's allocator from `store`.
    ///
    /// A missing file starts empty. An unreadable one is moved aside and also
    /// starts empty. Persisted hosts whose range differs from `[min, max]` are
    /// moved onto the configured range; entries outside it are dropped. Each
    /// allocator has its persistence owner attached before this returns.
    pub fn load(store: StateFile, min: Slot, max: Slot) -> Result<Arc<Self>, RegistryError> {
        validate(min, max)?;

        let mut hosts = {
            let _lock = match store.lock() {
                Ok(lock) => Some(lock),
                Err(e) => {
                    tracing::warn!(error = %e, "Reading allocator state without the file lock");
                    None
                }
            };
            store
                .read_or_quarantine()
                .map(|doc| doc.hosts)
                .unwrap_or_default()
        };
        for (host, state) in hosts.iter_mut() {
            fit_range(host, state, min, max);
        }
        tracing::debug!(
            path = %store.path().display(),
            hosts = hosts.len(),
            "Loaded allocator state"
        );

        Ok(Self::build(min, max, Some(store), hosts))
    }

    fn build(
        min: Slot,
        max: Slot,
        store: Option<StateFile>,
        hosts: BTreeMap<String, SlotState>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<SessionRegistry>| {
            let allocators = DashMap::new();
            for (host, state) in hosts {
                let allocator = SlotAllocator::from_valid_state(state);
                allocator.attach(this.clone());
                allocators.insert(host, Arc::new(allocator));
            }
            Self {
                allocators,
                min,
                max,
                store,
                save_lock: Mutex::new(()),
                this: this.clone(),
            }
        })
    }

    pub fn range(&self) -> (Slot, Slot) {
        (self.min, self.max)
    }

    /// The allocator for `host`, created on first use.
    pub fn get(&self, host: &str) -> Arc<SlotAllocator> {
        if let Some(allocator) = self.allocators.get(host) {
            return Arc::clone(allocator.value());
        }
        self.insert(host, SlotState::empty(self.min, self.max))
    }

    fn insert(&self, host: &str, state: SlotState) -> Arc<SlotAllocator> {
        let entry = self.allocators.entry(host.to_string()).or_insert_with(|| {
            tracing::debug!(%host, min = self.min, max = self.max, "Creating slot allocator");
            let allocator = SlotAllocator::from_valid_state(state);
            allocator.attach(self.this.clone());
            Arc::new(allocator)
        });
        Arc::clone(entry.value())
    }

    pub fn contains(&self, host: &str) -> bool {
        self.allocators.contains_key(host)
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.allocators.iter().map(|e| e.key().clone()).collect();
        hosts.sort();
        hosts
    }

    /// Current state of every host, keyed by host name.
    pub fn snapshot(&self) -> BTreeMap<String, SlotState> {
        self.allocators
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }

    /// Pull in the state file and write it back with this registry's view.
    pub fn sync(&self) -> Result<(), PersistError> {
        self.transact(&mut || {})
    }

    /// Adopt what other writers saved. Hosts only known here are kept.
    fn refresh(&self, hosts: BTreeMap<String, SlotState>) {
        for (host, mut state) in hosts {
            fit_range(&host, &mut state, self.min, self.max);
            let existing = self.allocators.get(&host).map(|e| Arc::clone(e.value()));
            match existing {
                Some(allocator) => allocator.restore(state),
                None => {
                    self.insert(&host, state);
                }
            }
        }
    }
}

impl StateSink for SessionRegistry {
    fn transact(&self, mutate: &mut dyn FnMut()) -> Result<(), PersistError> {
        let Some(store) = &self.store else {
            mutate();
            return Ok(());
        };
        let _guard = match self.save_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _lock = store.lock()?;

        if let Some(document) = store.read_or_quarantine() {
            self.refresh(document.hosts);
        }
        mutate();
        store.write(self.snapshot())
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("store", &self.store.as_ref().map(StateFile::path))
            .field("hosts", &self.hosts())
            .finish()
    }
}

/// Move `state` onto `[min, max]`, repairing overlapping sets.
fn fit_range(host: &str, state: &mut SlotState, min: Slot, max: Slot) {
    let (old_min, old_max) = (state.min, state.max);
    let dropped = state.rebase(min, max);
    if (old_min, old_max) != (min, max) {
        tracing::warn!(
            %host,
            old_min,
            old_max,
            dropped,
            min,
            max,
            "Display range changed since last save, rebasing host state"
        );
    } else if dropped > 0 {
        tracing::warn!(%host, dropped, "Discarded inconsistent slot entries");
    }
}

fn validate(min: Slot, max: Slot) -> Result<(), AllocError> {
    if min > max {
        return Err(AllocError::InvalidRange { min, max });
    }
    Ok(())
}
