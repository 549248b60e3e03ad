//! Display sessions - allocation, launch retries, and teardown.
//!
//! Flow:
//! 1. Decide whether the host wants a display at all
//! 2. Run the one-shot host clean up if configured
//! 3. Allocate a display number and launch the server on it
//! 4. On launch failure: blacklist the number and retry with a new one
//! 5. At teardown: stop the server, free the number

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use crate::cleanup::CleanupTracker;
use crate::config::{DisplayConfig, NO_DISPLAY_LABEL};
use crate::launcher::{DisplayLauncher, LaunchError};
use crate::registry::SessionRegistry;
use crate::slot::{AllocError, Slot, SlotAllocator};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("display server failed to start after {} attempt(s) (displays tried: {attempts:?}): {source}", .attempts.len())]
    LaunchFailed {
        attempts: Vec<Slot>,
        #[source]
        source: LaunchError,
    },

    #[error("display server command cannot run: {0}")]
    Command(#[source] LaunchError),
}

/// Allocate a display and launch on it, retrying on launch failure.
///
/// A display whose launch failed is blacklisted, never freed: the failed
/// server may have left lock files or listeners behind. Allocation failures
/// are returned immediately; `max_retries` only counts launch failures.
/// A command that cannot run at all frees its display and is not retried.
pub async fn acquire_and_start<H, F, Fut>(
    allocator: &SlotAllocator,
    mut launch: F,
    max_retries: u32,
) -> Result<(Slot, H), SessionError>
where
    F: FnMut(Slot) -> Fut,
    Fut: Future<Output = Result<H, LaunchError>>,
{
    let mut attempts = Vec::new();
    let mut remaining = max_retries;

    loop {
        let slot = allocator.allocate()?;
        attempts.push(slot);

        let error = match launch(slot).await {
            Ok(handle) => return Ok((slot, handle)),
            Err(error) => error,
        };

        if error.is_configuration_error() {
            tracing::error!(slot, error = %error, "Display server command cannot run, releasing display");
            allocator.free(slot);
            return Err(SessionError::Command(error));
        }

        tracing::warn!(
            slot,
            error = %error,
            remaining,
            "Display server failed to start, blacklisting display"
        );
        if let Err(e) = allocator.blacklist(slot) {
            tracing::error!(slot, error = %e, "Failed to blacklist display");
        }

        if remaining == 0 {
            return Err(SessionError::LaunchFailed {
                attempts,
                source: error,
            });
        }
        remaining -= 1;
    }
}

/// What the session manager needs to know about a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    pub labels: BTreeSet<String>,
    /// Display setup disabled for this host by an administrator.
    pub display_disabled: bool,
    pub is_unix: bool,
}

impl HostInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeSet::new(),
            display_disabled: false,
            is_unix: cfg!(unix),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn with_display_disabled(mut self, disabled: bool) -> Self {
        self.display_disabled = disabled;
        self
    }

    pub fn with_unix(mut self, is_unix: bool) -> Self {
        self.is_unix = is_unix;
        self
    }

    pub fn skip_reason(&self, config: &DisplayConfig) -> Option<SkipReason> {
        if self.labels.contains(NO_DISPLAY_LABEL) {
            Some(SkipReason::Label)
        } else if self.display_disabled {
            Some(SkipReason::Disabled)
        } else if config.skip_on_windows && !self.is_unix {
            Some(SkipReason::NonUnix)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Host carries the `noxvnc` label.
    Label,
    Disabled,
    NonUnix,
}

/// A started display server holding an allocated display number.
///
/// Call [`teardown`](Self::teardown) when done; dropping the session leaves
/// the display allocated.
pub struct DisplaySession<H> {
    host: String,
    slot: Slot,
    handle: Option<H>,
    allocator: Arc<SlotAllocator>,
}

impl<H> DisplaySession<H> {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Value for the `DISPLAY` environment variable.
    pub fn display(&self) -> String {
        format!(":{}", self.slot)
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    /// Stop the server and free the display.
    ///
    /// The display is freed even when stopping fails; the stop error is
    /// still returned.
    pub async fn teardown<L>(mut self, launcher: &L) -> Result<(), LaunchError>
    where
        L: DisplayLauncher<Handle = H> + ?Sized,
    {
        let stopped = match self.handle.take() {
            Some(handle) => launcher.stop(handle).await,
            None => Ok(()),
        };
        if let Err(e) = &stopped {
            tracing::warn!(host = %self.host, slot = self.slot, error = %e, "Failed to stop display server");
        }
        self.allocator.free(self.slot);
        stopped
    }
}

impl<H> Drop for DisplaySession<H> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            tracing::error!(
                host = %self.host,
                slot = self.slot,
                "Display session dropped without teardown - display stays allocated"
            );
        }
    }
}

impl<H> std::fmt::Debug for DisplaySession<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplaySession")
            .field("host", &self.host)
            .field("slot", &self.slot)
            .field("active", &self.handle.is_some())
            .finish()
    }
}

/// Starts display sessions for hosts, one allocator per host.
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    config: DisplayConfig,
    cleaned_up: CleanupTracker,
}

impl SessionManager {
    pub fn new(registry: Arc<SessionRegistry>, config: DisplayConfig) -> Self {
        Self {
            registry,
            config,
            cleaned_up: CleanupTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.config
    }

    pub fn cleanup_tracker(&self) -> &CleanupTracker {
        &self.cleaned_up
    }

    /// Forget a host that left the pool, so it is cleaned up again if it
    /// returns. Its display state is kept.
    pub fn decommission_host(&self, host: &str) -> bool {
        let forgotten = self.cleaned_up.forget(host);
        tracing::info!(%host, forgotten, "Host decommissioned");
        forgotten
    }

    /// Start a display for `host`. Returns `Ok(None)` when the host opts out.
    pub async fn start<L>(
        &self,
        host: &HostInfo,
        launcher: &L,
    ) -> Result<Option<DisplaySession<L::Handle>>, SessionError>
    where
        L: DisplayLauncher + ?Sized,
    {
        if let Some(reason) = host.skip_reason(&self.config) {
            tracing::info!(host = %host.name, ?reason, "Skipping display setup");
            return Ok(None);
        }

        if self.config.clean_up && self.cleaned_up.mark(&host.name) {
            tracing::info!(host = %host.name, "Cleaning up stale display servers");
            if let Err(e) = launcher.clean_up_host().await {
                tracing::warn!(host = %host.name, error = %e, "Host clean up failed");
            }
        }

        let allocator = self.registry.get(&host.name);
        let (slot, handle) = acquire_and_start(
            &allocator,
            |slot| launcher.launch(slot),
            self.config.retries,
        )
        .await?;

        tracing::info!(host = %host.name, slot, "Display server started");
        Ok(Some(DisplaySession {
            host: host.name.clone(),
            slot,
            handle: Some(handle),
            allocator,
        }))
    }
}
