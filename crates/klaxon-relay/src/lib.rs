//! # klaxon-relay
//!
//! Cross-thread call relay for the Klaxon reactor.
//!
//! The reactor itself never leaves its thread; the relay is how everything
//! else gets work onto it. Senders push boxed closures onto a channel and
//! write one byte into a non-blocking pipe whose read end is registered
//! with the reactor. On the reactor side the pipe's dispatch stages drain
//! the channel and execute the closures in send order, one per dispatch
//! call, so a burst of cross-thread calls shares the loop fairly with
//! every other event source.
//!
//! ```no_run
//! use klaxon_reactor::Reactor;
//! use klaxon_relay::Relay;
//!
//! let reactor = Reactor::new()?;
//! let relay = Relay::new(&reactor)?;
//! let handle = relay.handle();
//! std::thread::spawn(move || {
//!     handle.call(|| println!("runs on the reactor thread")).unwrap();
//! });
//! reactor.start()?;
//! # Ok::<(), klaxon_relay::RelayError>(())
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use thiserror::Error;
use tracing::{debug, warn};

use klaxon_reactor::{PollCallbacks, PollFlags, PollHandle, Reactor, ReactorError, RemoveMode};

pub type Result<T> = std::result::Result<T, RelayError>;

/// A closure shuttled onto the reactor thread.
type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The reactor-side endpoint is gone; the closure was not queued.
    #[error("relay is closed")]
    Closed,

    /// A synchronous call from the reactor thread itself can never
    /// complete, because the thread that would execute it is the one
    /// blocked waiting.
    #[error("synchronous relay call from the loop thread would deadlock")]
    WouldDeadlock,

    #[error("relay pipe setup failed: {0}")]
    Setup(#[from] io::Error),

    #[error("relay registration failed: {0}")]
    Register(#[from] ReactorError),
}

/// Endpoint shared by every [`RelayHandle`]. Keeping the pipe's read end
/// alive here means a sender can never hit a closed pipe, even after the
/// [`Relay`] itself is gone; late wake bytes just sit in the pipe.
struct Shared {
    sender: Sender<Job>,
    wake_tx: OwnedFd,
    _wake_rx_keepalive: Arc<OwnedFd>,
    loop_thread: ThreadId,
}

/// The reactor-side end of the relay. Construct it on the reactor's thread
/// and keep it alive for as long as cross-thread calls should be served;
/// dropping it deregisters the pipe and closes the channel.
pub struct Relay {
    reactor: Reactor,
    registration: PollHandle,
    shared: Arc<Shared>,
}

impl Relay {
    pub fn new(reactor: &Reactor) -> Result<Self> {
        let (rx_fd, tx_fd) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let rx_fd = Arc::new(rx_fd);
        let (sender, receiver) = unbounded::<Job>();
        let ready: Rc<RefCell<VecDeque<Job>>> = Rc::new(RefCell::new(VecDeque::new()));

        let callbacks = PollCallbacks::new()
            .on_fired({
                let rx_fd = Arc::clone(&rx_fd);
                let ready = Rc::clone(&ready);
                move |_, _| {
                    drain_pipe(rx_fd.as_raw_fd());
                    take_queued(&receiver, &ready);
                }
            })
            .on_check({
                let ready = Rc::clone(&ready);
                move |_| !ready.borrow().is_empty()
            })
            .on_dispatch({
                let ready = Rc::clone(&ready);
                move |_| {
                    let job = ready.borrow_mut().pop_front();
                    if let Some(job) = job {
                        job();
                    }
                    !ready.borrow().is_empty()
                }
            });

        let registration = reactor.add_poll(rx_fd.as_raw_fd(), PollFlags::POLLIN, callbacks)?;
        debug!(%registration, "relay pipe registered");
        Ok(Relay {
            reactor: reactor.clone(),
            registration,
            shared: Arc::new(Shared {
                sender,
                wake_tx: tx_fd,
                _wake_rx_keepalive: rx_fd,
                loop_thread: thread::current().id(),
            }),
        })
    }

    /// A sender usable from any thread.
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Err(e) = self
            .reactor
            .remove_poll(self.registration, RemoveMode::KeepDescriptor)
        {
            debug!(error = %e, "relay pipe was already deregistered");
        }
    }
}

/// Sending side of the relay. Cheap to clone and safe to hand to any
/// thread; all closures end up on the one reactor thread, in send order.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<Shared>,
}

impl RelayHandle {
    /// Queue a closure for execution on the reactor thread and return
    /// without waiting for it.
    pub fn call(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.shared
            .sender
            .send(Box::new(f))
            .map_err(|_| RelayError::Closed)?;
        self.wake_loop();
        Ok(())
    }

    /// Run a closure on the reactor thread and block until its result is
    /// back. Refused on the reactor thread itself, where blocking would
    /// wait on work only this thread could perform.
    pub fn call_sync<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if thread::current().id() == self.shared.loop_thread {
            return Err(RelayError::WouldDeadlock);
        }
        let (result_tx, result_rx) = bounded(1);
        self.call(move || {
            let _ = result_tx.send(f());
        })?;
        // A dropped relay discards queued closures; the hung-up channel is
        // how this caller learns its closure will never run.
        result_rx.recv().map_err(|_| RelayError::Closed)
    }

    /// One byte per queued closure. The pipe only has to be non-empty to
    /// wake the loop, so a full pipe (EAGAIN) already does the job.
    fn wake_loop(&self) {
        let buf = [0u8; 1];
        let n = unsafe {
            libc::write(
                self.shared.wake_tx.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn!(error = %err, "relay wake write failed");
            }
        }
    }
}

fn drain_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn!(error = %err, "relay pipe read failed");
            }
            break;
        }
        if (n as usize) < buf.len() {
            break;
        }
    }
}

fn take_queued(receiver: &Receiver<Job>, ready: &Rc<RefCell<VecDeque<Job>>>) {
    let mut ready = ready.borrow_mut();
    while let Ok(job) = receiver.try_recv() {
        ready.push_back(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_call_sync_runs_on_loop_thread_and_returns_value() {
        let reactor = Reactor::new().unwrap();
        let relay = Relay::new(&reactor).unwrap();
        let handle = relay.handle();
        let waker = reactor.waker();
        let loop_thread = thread::current().id();

        let t = thread::spawn(move || {
            let ran_on = handle.call_sync(|| thread::current().id()).unwrap();
            waker.exit().unwrap();
            ran_on
        });

        reactor.start().unwrap();
        assert_eq!(t.join().unwrap(), loop_thread);
    }

    #[test]
    fn test_calls_execute_in_send_order() {
        let reactor = Reactor::new().unwrap();
        let relay = Relay::new(&reactor).unwrap();
        let handle = relay.handle();
        let waker = reactor.waker();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        let t = thread::spawn(move || {
            for i in 0..100u32 {
                let log = Arc::clone(&log);
                handle.call(move || log.lock().unwrap().push(i)).unwrap();
            }
            // Barrier: once this returns, all hundred ran.
            handle.call_sync(|| ()).unwrap();
            waker.exit().unwrap();
        });

        reactor.start().unwrap();
        t.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_burst_of_calls_all_run() {
        let reactor = Reactor::new().unwrap();
        let relay = Relay::new(&reactor).unwrap();
        let handle = relay.handle();
        let waker = reactor.waker();
        let ran = Arc::new(AtomicU32::new(0));

        let t = thread::spawn(move || {
            for _ in 0..10 {
                let ran = Arc::clone(&ran);
                handle
                    .call(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
            let ran = handle.call_sync(move || ran.load(Ordering::SeqCst)).unwrap();
            waker.exit().unwrap();
            ran
        });

        reactor.start().unwrap();
        assert_eq!(t.join().unwrap(), 10);
    }

    #[test]
    fn test_call_sync_refused_on_loop_thread() {
        let reactor = Reactor::new().unwrap();
        let relay = Relay::new(&reactor).unwrap();
        let handle = relay.handle();
        let verdict = Rc::new(RefCell::new(None));

        let r = reactor.clone();
        let v = Rc::clone(&verdict);
        reactor
            .add_timer(Duration::from_millis(10), false, move |_| {
                *v.borrow_mut() = Some(handle.call_sync(|| ()));
                r.stop();
            })
            .unwrap();

        reactor.start().unwrap();
        assert!(matches!(
            verdict.borrow().as_ref().unwrap(),
            Err(RelayError::WouldDeadlock)
        ));
    }

    #[test]
    fn test_calls_fail_closed_after_relay_drop() {
        let reactor = Reactor::new().unwrap();
        let relay = Relay::new(&reactor).unwrap();
        let handle = relay.handle();
        drop(relay);

        assert!(matches!(handle.call(|| {}), Err(RelayError::Closed)));
        // From another thread, so the refusal is closure, not deadlock.
        let t = thread::spawn(move || handle.call_sync(|| 7));
        assert!(matches!(t.join().unwrap(), Err(RelayError::Closed)));
    }
}
