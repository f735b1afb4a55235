//! Signal listener roster and the metadata handed to listeners.
//!
//! The interception mechanics (blocked mask, signal descriptor, fan-out
//! draining) live in the reactor, which surfaces the descriptor through the
//! ordinary poll path; this module only owns who gets told.

use std::cell::RefCell;
use std::rc::Rc;

use nix::sys::signal::Signal;
use nix::sys::signalfd::siginfo;

use crate::error::{ReactorError, Result};
use crate::handles::{HandlePool, SignalHandle};

/// What the kernel reported alongside an intercepted signal.
#[derive(Debug, Clone, Copy)]
pub struct SignalInfo {
    pub signal: Signal,
    /// Sending process, zero when the kernel reports none.
    pub pid: u32,
    /// Real user id of the sender.
    pub uid: u32,
}

impl SignalInfo {
    pub(crate) fn from_raw(raw: &siginfo) -> Option<Self> {
        let signal = Signal::try_from(raw.ssi_signo as i32).ok()?;
        Some(Self {
            signal,
            pid: raw.ssi_pid,
            uid: raw.ssi_uid,
        })
    }
}

pub(crate) type SignalCallback = Rc<RefCell<dyn FnMut(SignalHandle, &SignalInfo)>>;

struct SignalListener {
    handle: SignalHandle,
    callback: SignalCallback,
}

/// Registered listeners; every intercepted signal is fanned out to all of
/// them.
pub(crate) struct SignalRoster {
    pool: HandlePool,
    listeners: Vec<SignalListener>,
}

impl SignalRoster {
    pub fn new() -> Self {
        Self {
            pool: HandlePool::new(),
            listeners: Vec::new(),
        }
    }

    pub fn add(&mut self, callback: SignalCallback) -> Result<SignalHandle> {
        let handle = SignalHandle(self.pool.next()?);
        self.listeners.push(SignalListener { handle, callback });
        Ok(handle)
    }

    pub fn remove(&mut self, handle: SignalHandle) -> Result<()> {
        let at = self
            .listeners
            .iter()
            .position(|l| l.handle == handle)
            .ok_or_else(|| ReactorError::unknown_handle("signal", handle.0))?;
        self.listeners.remove(at);
        self.pool.release(handle.0);
        Ok(())
    }

    pub fn is_live(&self, handle: SignalHandle) -> bool {
        self.listeners.iter().any(|l| l.handle == handle)
    }

    /// Per-signal fan-out snapshot; the caller re-checks liveness before
    /// each invocation so a listener removed mid-fan-out stays silent.
    pub fn snapshot(&self) -> Vec<(SignalHandle, SignalCallback)> {
        self.listeners
            .iter()
            .map(|l| (l.handle, Rc::clone(&l.callback)))
            .collect()
    }
}
