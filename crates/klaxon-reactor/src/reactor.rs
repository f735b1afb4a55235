//! The main loop driver.
//!
//! One thread, one blocking `ppoll`. Each iteration runs the prepare stage,
//! rebuilds the wait-set if registrations changed, applies timer drift
//! correction, then blocks until a descriptor is ready or the smallest
//! countdown elapses. Readiness flows through the four-stage protocol
//! (fired, check, dispatch); timeouts flow into timer expiry.
//!
//! Registrations are safe to mutate from inside any callback: stages iterate
//! per-wake snapshots and re-check entry liveness before every invocation,
//! so structural changes only take effect on the next wake.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use tracing::{debug, error, warn};

use crate::error::{ReactorError, Result};
use crate::handles::{PollHandle, SignalHandle, TimerHandle};
use crate::poll::{PollCallbacks, PollEntry, PollRegistry, RemoveMode};
use crate::signals::{SignalInfo, SignalRoster};
use crate::timer::TimerRegistry;

/// Wakeup protocol on the internal eventfd: ordinary wakeups add 1, shutdown
/// adds this sentinel. A drained counter at or above it stops the loop.
const STOP_SENTINEL: u64 = u64::MAX >> 1;

/// The single-threaded event reactor.
///
/// Cloning is cheap and shares the same instance; clones are how callbacks
/// capture the reactor to register and deregister from inside the loop. The
/// type is deliberately not `Send` — only [`Waker`] crosses threads.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

struct Inner {
    polls: RefCell<PollRegistry>,
    timers: RefCell<TimerRegistry>,
    signal_roster: Rc<RefCell<SignalRoster>>,
    signal_mask: RefCell<SigSet>,
    signal_fd: RefCell<Option<Rc<RefCell<SignalFd>>>>,
    wake_fd: Arc<OwnedFd>,
    /// Registrations changed; rebuild the wait-set before the next block.
    dirty: Cell<bool>,
    running: Cell<bool>,
    /// Shared with the wakeup descriptor's fired callback.
    stopping: Rc<Cell<bool>>,
    /// Monotonic sample the next drift correction subtracts from.
    wake_ref: Cell<Instant>,
    wait_set: RefCell<Vec<PollFd<'static>>>,
    wait_entries: RefCell<Vec<Rc<PollEntry>>>,
}

impl Reactor {
    /// Create a reactor with its wakeup channel armed.
    ///
    /// Fails with [`ReactorError::Fatal`] if the channel cannot be created
    /// or registered; there is no half-initialized instance to misuse.
    pub fn new() -> Result<Self> {
        let wake_fd = Arc::new(new_eventfd().map_err(ReactorError::fatal)?);
        let reactor = Reactor {
            inner: Rc::new(Inner {
                polls: RefCell::new(PollRegistry::new()),
                timers: RefCell::new(TimerRegistry::new()),
                signal_roster: Rc::new(RefCell::new(SignalRoster::new())),
                signal_mask: RefCell::new(SigSet::empty()),
                signal_fd: RefCell::new(None),
                wake_fd,
                dirty: Cell::new(false),
                running: Cell::new(false),
                stopping: Rc::new(Cell::new(false)),
                wake_ref: Cell::new(Instant::now()),
                wait_set: RefCell::new(Vec::new()),
                wait_entries: RefCell::new(Vec::new()),
            }),
        };

        let drain = {
            let wake = Arc::clone(&reactor.inner.wake_fd);
            let stopping = Rc::clone(&reactor.inner.stopping);
            move |_: PollHandle, _: PollFlags| match read_counter(wake.as_raw_fd()) {
                Ok(total) if total >= STOP_SENTINEL => stopping.set(true),
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {}
                Err(e) => warn!(error = %e, "wakeup channel read failed"),
            }
        };
        let wake_raw = reactor.inner.wake_fd.as_raw_fd();
        reactor
            .add_poll(
                wake_raw,
                PollFlags::POLLIN,
                PollCallbacks::new().on_fired(drain),
            )
            .map_err(|e| ReactorError::fatal(io::Error::other(e.to_string())))?;
        Ok(reactor)
    }

    /// Thread-safe handle for waking or stopping the loop from elsewhere.
    pub fn waker(&self) -> Waker {
        Waker {
            fd: Arc::clone(&self.inner.wake_fd),
        }
    }

    /// Non-owning handle for callbacks that live inside a registration.
    /// A callback capturing the reactor itself would keep the instance
    /// alive through its own registry; the weak form breaks that knot.
    pub fn downgrade(&self) -> WeakReactor {
        WeakReactor {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // ---- poll registry ----------------------------------------------------

    /// Watch `fd` for `interest` and drive `callbacks` through the dispatch
    /// stages. The descriptor stays owned by the caller unless removal later
    /// says otherwise.
    pub fn add_poll(
        &self,
        fd: RawFd,
        interest: PollFlags,
        callbacks: PollCallbacks,
    ) -> Result<PollHandle> {
        let handle = self.inner.polls.borrow_mut().add(fd, interest, callbacks)?;
        self.inner.dirty.set(true);
        debug!(%handle, fd, ?interest, "descriptor registered");
        Ok(handle)
    }

    /// Replace the readiness conditions being waited for.
    pub fn update_interest(&self, handle: PollHandle, interest: PollFlags) -> Result<()> {
        self.inner
            .polls
            .borrow_mut()
            .update_interest(handle, interest)?;
        self.inner.dirty.set(true);
        Ok(())
    }

    /// Deregister a descriptor. Safe to call from any callback, including
    /// the entry's own: the entry stops firing immediately and disappears
    /// from the wait-set before the next block.
    pub fn remove_poll(&self, handle: PollHandle, mode: RemoveMode) -> Result<()> {
        self.inner.polls.borrow_mut().remove(handle, mode)?;
        self.inner.dirty.set(true);
        debug!(%handle, "descriptor deregistered");
        Ok(())
    }

    // ---- timer registry ---------------------------------------------------

    /// Arm a countdown. A repeating timer re-arms itself to `interval` on
    /// every expiry; a one-shot stays registered but disarmed after firing.
    pub fn add_timer(
        &self,
        interval: Duration,
        repeats: bool,
        callback: impl FnMut(TimerHandle) + 'static,
    ) -> Result<TimerHandle> {
        let skew = self.running_skew();
        let handle = self.inner.timers.borrow_mut().add(
            interval,
            repeats,
            Rc::new(RefCell::new(callback)),
            skew,
        )?;
        debug!(%handle, ?interval, repeats, "timer registered");
        Ok(handle)
    }

    /// Replace the countdown and configured interval; renews a stopped
    /// timer under its existing handle.
    pub fn update_timer(&self, handle: TimerHandle, interval: Duration) -> Result<()> {
        let skew = self.running_skew();
        self.inner.timers.borrow_mut().update(handle, interval, skew)
    }

    /// Re-arm to the configured interval; renews a stopped timer.
    pub fn restart_timer(&self, handle: TimerHandle) -> Result<()> {
        let skew = self.running_skew();
        self.inner.timers.borrow_mut().restart(handle, skew)
    }

    /// Disarm without forgetting the configuration.
    pub fn stop_timer(&self, handle: TimerHandle) -> Result<()> {
        self.inner.timers.borrow_mut().stop(handle)
    }

    /// Destroy the timer and release its handle.
    pub fn remove_timer(&self, handle: TimerHandle) -> Result<()> {
        self.inner.timers.borrow_mut().remove(handle)
    }

    // ---- signal bridge ----------------------------------------------------

    /// Intercept `signals` and surface them through the polling mechanism.
    /// Repeated calls accumulate into one signal descriptor whose mask is
    /// the union of everything requested so far.
    ///
    /// Blocks the signals on the calling thread; call it on the thread that
    /// runs [`start`](Self::start).
    pub fn listen_to(&self, signals: &[Signal]) -> Result<()> {
        if signals.is_empty() {
            return Err(ReactorError::NotPossible {
                reason: "empty signal set".into(),
            });
        }
        let mut mask = *self.inner.signal_mask.borrow();
        for signal in signals {
            mask.add(*signal);
        }
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).map_err(|e| {
            ReactorError::NotPossible {
                reason: format!("blocking signals: {e}"),
            }
        })?;

        let existing = self.inner.signal_fd.borrow().clone();
        match existing {
            Some(sfd) => {
                sfd.borrow_mut()
                    .set_mask(&mask)
                    .map_err(|e| ReactorError::NotPossible {
                        reason: format!("updating signal descriptor: {e}"),
                    })?;
            }
            None => {
                let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
                    .map_err(|e| ReactorError::NotPossible {
                        reason: format!("creating signal descriptor: {e}"),
                    })?;
                let raw = sfd.as_raw_fd();
                let sfd = Rc::new(RefCell::new(sfd));
                let drain = {
                    let reader = Rc::clone(&sfd);
                    let roster = Rc::clone(&self.inner.signal_roster);
                    move |_: PollHandle, _: PollFlags| fan_out_signals(&reader, &roster)
                };
                self.add_poll(
                    raw,
                    PollFlags::POLLIN,
                    PollCallbacks::new().on_fired(drain),
                )
                .map_err(|e| ReactorError::NotPossible {
                    reason: format!("registering signal descriptor: {e}"),
                })?;
                *self.inner.signal_fd.borrow_mut() = Some(sfd);
            }
        }
        *self.inner.signal_mask.borrow_mut() = mask;
        debug!(added = signals.len(), "signal interception updated");
        Ok(())
    }

    /// Register a listener invoked for every intercepted signal.
    pub fn add_signal_handler(
        &self,
        callback: impl FnMut(SignalHandle, &SignalInfo) + 'static,
    ) -> Result<SignalHandle> {
        let handle = self
            .inner
            .signal_roster
            .borrow_mut()
            .add(Rc::new(RefCell::new(callback)))?;
        debug!(%handle, "signal listener registered");
        Ok(handle)
    }

    pub fn remove_signal_handler(&self, handle: SignalHandle) -> Result<()> {
        self.inner.signal_roster.borrow_mut().remove(handle)
    }

    // ---- loop lifecycle ---------------------------------------------------

    /// Run the loop until stopped. Blocks the calling thread; returns `Ok`
    /// on an orderly stop and [`ReactorError::Fatal`] if the wait primitive
    /// fails unrecoverably.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.get() {
            return Err(ReactorError::fatal(io::Error::other(
                "loop is already running",
            )));
        }
        // Residue in the wakeup counter belongs to the previous run.
        let _ = read_counter(self.inner.wake_fd.as_raw_fd());
        self.inner.running.set(true);
        self.inner.stopping.set(false);
        self.inner.dirty.set(true);
        self.inner.wake_ref.set(Instant::now());
        debug!("loop entered");
        let outcome = self.run();
        // An exit requested through the waker skips stop(); settle here
        // so time spent blocked in the final wait still counts down.
        self.settle_countdowns();
        self.inner.running.set(false);
        debug!("loop left");
        outcome
    }

    /// Leave the loop after the current iteration. Armed countdowns are
    /// frozen at their current remaining time, so a later [`start`]
    /// resumes them instead of firing everything at once.
    ///
    /// [`start`]: Self::start
    pub fn stop(&self) {
        if !self.inner.running.get() {
            return;
        }
        self.inner.stopping.set(true);
        self.settle_countdowns();
    }

    /// [`stop`](Self::stop) plus an immediate wakeup of a blocked wait, so
    /// shutdown does not linger until the next natural event.
    pub fn exit_now(&self) {
        self.stop();
        if let Err(e) = write_counter(self.inner.wake_fd.as_raw_fd(), STOP_SENTINEL) {
            warn!(error = %e, "wakeup channel write failed");
        }
    }

    // ---- loop internals ---------------------------------------------------

    fn run(&self) -> Result<()> {
        while !self.inner.stopping.get() {
            self.run_prepare_stage();
            if self.inner.dirty.get() {
                self.rebuild_wait_set();
                self.inner.dirty.set(false);
            }
            self.expire_timers();
            if self.inner.stopping.get() {
                break;
            }
            let timeout = self
                .inner
                .timers
                .borrow()
                .next_deadline()
                .map(TimeSpec::from_duration);
            let ready = {
                let mut wait_set = self.inner.wait_set.borrow_mut();
                match ppoll(&mut wait_set, timeout, None) {
                    Ok(n) => n,
                    // A foreign (unintercepted) signal; retry the wait.
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        error!(error = %e, "multiplexed wait failed");
                        return Err(ReactorError::fatal(e.into()));
                    }
                }
            };
            if ready > 0 {
                let fired = self.collect_ready();
                self.run_fired_check_dispatch(&fired);
            } else {
                self.expire_timers();
            }
        }
        Ok(())
    }

    /// Charge armed countdowns for the time elapsed since the last
    /// correction sample, and move the sample to now.
    fn settle_countdowns(&self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.inner.wake_ref.get());
        self.inner.wake_ref.set(now);
        self.inner.timers.borrow_mut().correct(elapsed);
    }

    /// Time the running loop has consumed since its last correction sample;
    /// a countdown registered mid-iteration gets it added so the next
    /// correction does not eat into the requested interval.
    fn running_skew(&self) -> Duration {
        if self.inner.running.get() {
            self.inner.wake_ref.get().elapsed()
        } else {
            Duration::ZERO
        }
    }

    fn run_prepare_stage(&self) {
        let snapshot = self.inner.polls.borrow().snapshot();
        for entry in snapshot {
            if !entry.alive.get() {
                continue;
            }
            let mut cbs = entry.callbacks.borrow_mut();
            if let Some(prepare) = cbs.prepare.as_mut() {
                guard("prepare", entry.handle.raw(), (), || prepare(entry.handle));
            }
        }
    }

    fn rebuild_wait_set(&self) {
        let entries = self.inner.polls.borrow().snapshot();
        let mut wait_set = self.inner.wait_set.borrow_mut();
        let mut wait_entries = self.inner.wait_entries.borrow_mut();
        wait_set.clear();
        wait_entries.clear();
        for entry in entries {
            if !entry.alive.get() {
                continue;
            }
            // Registrants keep their descriptors open for the lifetime of
            // the registration, and any removal marks the set dirty, so the
            // borrowed slot never survives into the next wait.
            let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
            wait_set.push(PollFd::new(fd, entry.interest.get()));
            wait_entries.push(entry);
        }
    }

    /// Drift-correct all countdowns and fire the overdue ones in ascending
    /// order.
    fn expire_timers(&self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.inner.wake_ref.get());
        self.inner.wake_ref.set(now);
        let due = {
            let mut timers = self.inner.timers.borrow_mut();
            timers.correct(elapsed);
            timers.collect_due()
        };
        for (handle, callback) in due {
            // An earlier callback in this batch may have removed it.
            if !self.inner.timers.borrow().is_registered(handle) {
                continue;
            }
            guard("timer", handle.raw(), (), || {
                (callback.borrow_mut())(handle)
            });
        }
    }

    fn collect_ready(&self) -> Vec<Rc<PollEntry>> {
        let wait_set = self.inner.wait_set.borrow();
        let wait_entries = self.inner.wait_entries.borrow();
        let mut fired = Vec::new();
        for (slot, entry) in wait_set.iter().zip(wait_entries.iter()) {
            let revents = slot.revents().unwrap_or_else(PollFlags::empty);
            let observed = revents & entry.interest.get();
            if !observed.is_empty() && entry.alive.get() {
                entry.last_readiness.set(observed);
                fired.push(Rc::clone(entry));
            }
        }
        fired
    }

    /// Readiness stages: fired once each, check filters, then each
    /// surviving descriptor's dispatch drains to completion before the
    /// next one starts.
    fn run_fired_check_dispatch(&self, ready: &[Rc<PollEntry>]) {
        for entry in ready {
            if !entry.alive.get() {
                continue;
            }
            let readiness = entry.last_readiness.get();
            let mut cbs = entry.callbacks.borrow_mut();
            if let Some(fired) = cbs.fired.as_mut() {
                guard("fired", entry.handle.raw(), (), || {
                    fired(entry.handle, readiness)
                });
            }
        }

        let mut pending: Vec<&Rc<PollEntry>> = Vec::with_capacity(ready.len());
        for entry in ready {
            if !entry.alive.get() {
                continue;
            }
            let mut cbs = entry.callbacks.borrow_mut();
            let wants = match cbs.check.as_mut() {
                Some(check) => guard("check", entry.handle.raw(), false, || check(entry.handle)),
                None => false,
            };
            drop(cbs);
            if wants {
                pending.push(entry);
            }
        }

        for entry in pending {
            loop {
                if !entry.alive.get() {
                    break;
                }
                let mut cbs = entry.callbacks.borrow_mut();
                let Some(dispatch) = cbs.dispatch.as_mut() else {
                    break;
                };
                let more = guard("dispatch", entry.handle.raw(), false, || {
                    dispatch(entry.handle)
                });
                drop(cbs);
                if !more {
                    break;
                }
            }
        }

        for entry in ready {
            entry.last_readiness.set(PollFlags::empty());
        }
    }
}

/// Fired callback body of the signal descriptor: read every pending signal
/// and fan it out to the current listeners, re-checking liveness so a
/// listener removed mid-fan-out stays silent.
fn fan_out_signals(reader: &Rc<RefCell<SignalFd>>, roster: &Rc<RefCell<SignalRoster>>) {
    loop {
        let next = reader.borrow_mut().read_signal();
        match next {
            Ok(Some(raw)) => {
                let Some(info) = SignalInfo::from_raw(&raw) else {
                    warn!(signo = raw.ssi_signo, "unrecognized signal read");
                    continue;
                };
                let listeners = roster.borrow().snapshot();
                for (handle, callback) in listeners {
                    if !roster.borrow().is_live(handle) {
                        continue;
                    }
                    guard("signal", handle.raw(), (), || {
                        (callback.borrow_mut())(handle, &info)
                    });
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "signal descriptor read failed");
                break;
            }
        }
    }
}

/// Run a registrant callback, containing panics so one misbehaving
/// registrant cannot take the loop down. No registry borrow is held while a
/// callback runs, so unwinding cannot leave one half-mutated.
pub(crate) fn guard<R>(stage: &'static str, handle: u16, fallback: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("opaque panic payload");
            error!(stage, handle, "callback panicked: {msg}");
            fallback
        }
    }
}

/// Weak counterpart of [`Reactor`], for state owned by the reactor's own
/// registrations.
#[derive(Clone)]
pub struct WeakReactor {
    inner: Weak<Inner>,
}

impl WeakReactor {
    /// The reactor, if any strong handle to it still exists.
    pub fn upgrade(&self) -> Option<Reactor> {
        self.inner.upgrade().map(|inner| Reactor { inner })
    }
}

/// Thread-safe wakeup/shutdown handle for a loop that may be blocked in its
/// wait call on another thread.
#[derive(Clone)]
pub struct Waker {
    fd: Arc<OwnedFd>,
}

impl Waker {
    /// Unblock a pending wait without stopping the loop.
    pub fn wake(&self) -> io::Result<()> {
        write_counter(self.fd.as_raw_fd(), 1)
    }

    /// Request the loop to stop and unblock a pending wait.
    pub fn exit(&self) -> io::Result<()> {
        write_counter(self.fd.as_raw_fd(), STOP_SENTINEL)
    }
}

/// Non-blocking close-on-exec eventfd used as the wakeup channel.
fn new_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Add `value` to the eventfd counter. A saturated counter (EAGAIN) already
/// holds at least a stop sentinel, so the write counts as delivered.
fn write_counter(fd: RawFd, value: u64) -> io::Result<()> {
    let buf = value.to_ne_bytes();
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Drain the eventfd counter, returning the accumulated value.
fn read_counter(fd: RawFd) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u64::from_ne_bytes(buf))
}
