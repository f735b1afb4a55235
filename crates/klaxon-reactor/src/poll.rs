//! Poll registry: watched descriptors and their four-stage callbacks.
//!
//! Entries are shared (`Rc`) between the registry and the loop's per-wake
//! snapshots. Removal marks an entry dead instead of invalidating snapshots,
//! which is what makes re-entrant `remove_poll` from inside a callback safe:
//! the stage code re-checks liveness before every invocation.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::poll::PollFlags;
use tracing::warn;

use crate::error::{ReactorError, Result};
use crate::handles::{HandlePool, PollHandle};

/// How `remove_poll` treats the underlying descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// Drop only the registration; the caller keeps the descriptor open.
    KeepDescriptor,
    /// Drop the registration and close the descriptor; ownership had been
    /// transferred to the registry.
    CloseDescriptor,
}

type PrepareFn = Box<dyn FnMut(PollHandle)>;
type FiredFn = Box<dyn FnMut(PollHandle, PollFlags)>;
type CheckFn = Box<dyn FnMut(PollHandle) -> bool>;
type DispatchFn = Box<dyn FnMut(PollHandle) -> bool>;

/// The four optional stage callbacks of one registration.
///
/// - `prepare` runs before every blocking wait.
/// - `fired` runs once per wake in which the descriptor was ready.
/// - `check` decides whether dispatch is still needed; a registration
///   without one never dispatches.
/// - `dispatch` is called repeatedly while it returns `true` ("more data").
#[derive(Default)]
pub struct PollCallbacks {
    pub(crate) prepare: Option<PrepareFn>,
    pub(crate) fired: Option<FiredFn>,
    pub(crate) check: Option<CheckFn>,
    pub(crate) dispatch: Option<DispatchFn>,
}

impl PollCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_prepare(mut self, f: impl FnMut(PollHandle) + 'static) -> Self {
        self.prepare = Some(Box::new(f));
        self
    }

    pub fn on_fired(mut self, f: impl FnMut(PollHandle, PollFlags) + 'static) -> Self {
        self.fired = Some(Box::new(f));
        self
    }

    pub fn on_check(mut self, f: impl FnMut(PollHandle) -> bool + 'static) -> Self {
        self.check = Some(Box::new(f));
        self
    }

    pub fn on_dispatch(mut self, f: impl FnMut(PollHandle) -> bool + 'static) -> Self {
        self.dispatch = Some(Box::new(f));
        self
    }
}

pub(crate) struct PollEntry {
    pub handle: PollHandle,
    pub fd: RawFd,
    pub interest: Cell<PollFlags>,
    pub last_readiness: Cell<PollFlags>,
    pub alive: Cell<bool>,
    pub callbacks: RefCell<PollCallbacks>,
}

pub(crate) struct PollRegistry {
    pool: HandlePool,
    entries: Vec<Rc<PollEntry>>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self {
            pool: HandlePool::new(),
            entries: Vec::new(),
        }
    }

    pub fn add(
        &mut self,
        fd: RawFd,
        interest: PollFlags,
        callbacks: PollCallbacks,
    ) -> Result<PollHandle> {
        if !fd_is_open(fd) {
            return Err(ReactorError::NotFound {
                what: format!("descriptor {fd}"),
            });
        }
        if self.entries.iter().any(|e| e.fd == fd) {
            return Err(ReactorError::AlreadyExists { fd });
        }
        let handle = PollHandle(self.pool.next()?);
        self.entries.push(Rc::new(PollEntry {
            handle,
            fd,
            interest: Cell::new(interest),
            last_readiness: Cell::new(PollFlags::empty()),
            alive: Cell::new(true),
            callbacks: RefCell::new(callbacks),
        }));
        Ok(handle)
    }

    pub fn update_interest(&mut self, handle: PollHandle, interest: PollFlags) -> Result<()> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.handle == handle)
            .ok_or_else(|| ReactorError::unknown_handle("poll", handle.0))?;
        entry.interest.set(interest);
        entry.last_readiness.set(PollFlags::empty());
        Ok(())
    }

    pub fn remove(&mut self, handle: PollHandle, mode: RemoveMode) -> Result<()> {
        let at = self
            .entries
            .iter()
            .position(|e| e.handle == handle)
            .ok_or_else(|| ReactorError::unknown_handle("poll", handle.0))?;
        let entry = self.entries.remove(at);
        entry.alive.set(false);
        self.pool.release(handle.0);
        if mode == RemoveMode::CloseDescriptor {
            if let Err(e) = nix::unistd::close(entry.fd) {
                warn!(fd = entry.fd, error = %e, "closing removed descriptor failed");
            }
        }
        Ok(())
    }

    /// Stable per-wake snapshot; holders must re-check `alive` before every
    /// callback invocation.
    pub fn snapshot(&self) -> Vec<Rc<PollEntry>> {
        self.entries.clone()
    }
}

/// The check the registry runs before accepting a descriptor: anything but
/// EBADF counts as open (access errors still mean the fd exists).
fn fd_is_open(fd: RawFd) -> bool {
    !matches!(fcntl(fd, FcntlArg::F_GETFL), Err(Errno::EBADF))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_fds() -> (std::os::unix::io::OwnedFd, std::os::unix::io::OwnedFd) {
        nix::unistd::pipe().expect("pipe")
    }

    #[test]
    fn test_closed_descriptor_is_rejected() {
        let mut reg = PollRegistry::new();
        // A descriptor number far beyond any open file.
        assert!(matches!(
            reg.add(999_999, PollFlags::POLLIN, PollCallbacks::new()),
            Err(ReactorError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_descriptor_is_rejected() {
        use std::os::unix::io::AsRawFd;
        let mut reg = PollRegistry::new();
        let (r, _w) = pipe_fds();
        reg.add(r.as_raw_fd(), PollFlags::POLLIN, PollCallbacks::new())
            .unwrap();
        assert!(matches!(
            reg.add(r.as_raw_fd(), PollFlags::POLLIN, PollCallbacks::new()),
            Err(ReactorError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_removal_frees_the_descriptor_slot_and_handle() {
        use std::os::unix::io::AsRawFd;
        let mut reg = PollRegistry::new();
        let (r, _w) = pipe_fds();
        let h = reg
            .add(r.as_raw_fd(), PollFlags::POLLIN, PollCallbacks::new())
            .unwrap();
        let snapshot = reg.snapshot();
        reg.remove(h, RemoveMode::KeepDescriptor).unwrap();
        // Snapshots observe the removal through the liveness flag.
        assert!(!snapshot[0].alive.get());
        assert!(matches!(
            reg.update_interest(h, PollFlags::POLLOUT),
            Err(ReactorError::NotFound { .. })
        ));
        // Same descriptor can be registered again.
        reg.add(r.as_raw_fd(), PollFlags::POLLIN, PollCallbacks::new())
            .unwrap();
    }

    #[test]
    fn test_update_interest_clears_last_readiness() {
        use std::os::unix::io::AsRawFd;
        let mut reg = PollRegistry::new();
        let (r, _w) = pipe_fds();
        let h = reg
            .add(r.as_raw_fd(), PollFlags::POLLIN, PollCallbacks::new())
            .unwrap();
        let entry = Rc::clone(&reg.snapshot()[0]);
        entry.last_readiness.set(PollFlags::POLLIN);
        reg.update_interest(h, PollFlags::POLLIN | PollFlags::POLLOUT)
            .unwrap();
        assert_eq!(entry.last_readiness.get(), PollFlags::empty());
        assert_eq!(entry.interest.get(), PollFlags::POLLIN | PollFlags::POLLOUT);
    }
}
