//! Handle registry
//!
//! Holds the currently active role instance behind a read/write lock
//! together with the deployed/dropped flags. Message processing borrows
//! the instance through [`HandleRegistry::acquire`], which returns a
//! cloneable RAII [`RoleHandle`]: the handle shares ownership of the
//! instance, so a borrow taken before a concurrent teardown stays valid
//! until the last handle drops, and the borrower count falls back to
//! zero on its own.
//!
//! The lock is held only for flag reads and flips, never across I/O or
//! the quiescence wait.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::role::RoleInstance;
use crate::{NodeError, Result};

/// Interval of the teardown sleep-poll loops. Teardown is a rare,
/// human-timescale operation, so polling is acceptable here.
pub(crate) const QUIESCE_POLL: Duration = Duration::from_millis(10);

/// Lifecycle state of a hosted role, for logs and diagnostics.
///
/// The availability gate itself is the pair of flags guarded by the
/// registry lock; this enum only names the phase in between flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Absent,
    Deploying,
    Deployed,
    Dropping,
    Dropped,
}

struct RegistryInner {
    instance: Option<Arc<dyn RoleInstance>>,
    deployed: bool,
    dropped: bool,
    state: RoleState,
}

/// Registry for one role's active instance.
pub struct HandleRegistry {
    role: String,
    inner: RwLock<RegistryInner>,
    borrowers: Arc<AtomicUsize>,
}

impl HandleRegistry {
    pub fn new(role: &str) -> Self {
        Self {
            role: role.to_string(),
            inner: RwLock::new(RegistryInner {
                instance: None,
                deployed: false,
                dropped: false,
                state: RoleState::Absent,
            }),
            borrowers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Borrow the active instance.
    ///
    /// Never blocks beyond the read lock. Fails with
    /// [`NodeError::Unavailable`] when the role is not deployed or has
    /// been dropped.
    pub fn acquire(&self) -> Result<RoleHandle> {
        let inner = self.inner.read();
        if inner.deployed && !inner.dropped {
            if let Some(instance) = inner.instance.clone() {
                let count = self.borrowers.fetch_add(1, Ordering::AcqRel) + 1;
                log::trace!("{}: acquired handle, borrowers={}", self.role, count);
                return Ok(RoleHandle {
                    instance,
                    borrowers: Arc::clone(&self.borrowers),
                });
            }
        }
        Err(NodeError::Unavailable)
    }

    /// Install a freshly opened instance and mark the role deployed.
    pub fn install(&self, instance: Arc<dyn RoleInstance>) {
        let mut inner = self.inner.write();
        inner.instance = Some(instance);
        inner.deployed = true;
        inner.state = RoleState::Deployed;
    }

    /// Durably-recorded drop in progress; new acquires start failing.
    pub fn mark_dropped(&self) {
        let mut inner = self.inner.write();
        inner.dropped = true;
        inner.state = RoleState::Dropping;
    }

    /// Revert [`mark_dropped`](Self::mark_dropped) after a failed
    /// persist; the role becomes acquirable again.
    pub fn clear_dropped(&self) {
        let mut inner = self.inner.write();
        inner.dropped = false;
        inner.state = RoleState::Deployed;
    }

    /// Make the role unreachable to new acquires and take the instance
    /// out of the registry. Existing handles stay valid; the caller
    /// must [`await_quiescent`](Self::await_quiescent) before freeing
    /// anything the instance owns.
    pub fn begin_teardown(&self) -> Option<Arc<dyn RoleInstance>> {
        let mut inner = self.inner.write();
        inner.deployed = false;
        inner.instance.take()
    }

    pub fn set_state(&self, state: RoleState) {
        self.inner.write().state = state;
    }

    pub fn state(&self) -> RoleState {
        self.inner.read().state
    }

    pub fn is_deployed(&self) -> bool {
        self.inner.read().deployed
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.read().dropped
    }

    /// Number of handles currently outstanding.
    pub fn borrower_count(&self) -> usize {
        self.borrowers.load(Ordering::Acquire)
    }

    /// Block until no handles remain outstanding.
    ///
    /// Sleep-poll loop outside the lock; callers must have released
    /// their own handle first or this never returns.
    pub fn await_quiescent(&self) {
        let mut waited = Duration::ZERO;
        loop {
            let count = self.borrower_count();
            if count == 0 {
                return;
            }
            if waited.as_millis() % 1000 == 0 {
                log::debug!(
                    "{}: waiting for {} in-flight borrowers",
                    self.role,
                    count
                );
            }
            std::thread::sleep(QUIESCE_POLL);
            waited += QUIESCE_POLL;
        }
    }
}

/// Borrowed reference to the active role instance.
///
/// Shares ownership of the instance, so it remains usable even if the
/// registry is torn down concurrently. Dropping (or cloning) the handle
/// keeps the registry's borrower count accurate.
pub struct RoleHandle {
    instance: Arc<dyn RoleInstance>,
    borrowers: Arc<AtomicUsize>,
}

impl Deref for RoleHandle {
    type Target = dyn RoleInstance;

    fn deref(&self) -> &Self::Target {
        &*self.instance
    }
}

impl Clone for RoleHandle {
    fn clone(&self) -> Self {
        self.borrowers.fetch_add(1, Ordering::AcqRel);
        Self {
            instance: Arc::clone(&self.instance),
            borrowers: Arc::clone(&self.borrowers),
        }
    }
}

impl Drop for RoleHandle {
    fn drop(&mut self) {
        self.borrowers.fetch_sub(1, Ordering::AcqRel);
    }
}
