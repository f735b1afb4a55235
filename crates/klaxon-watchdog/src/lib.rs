//! # klaxon-watchdog
//!
//! Keep-alive reporting to a supervising process manager.
//!
//! Supervisors in the systemd mold hand a service two environment
//! variables: `NOTIFY_SOCKET`, a datagram socket taking `KEY=VALUE`
//! state lines, and `WATCHDOG_USEC`, the window within which the service
//! must check in or be restarted. The watchdog arms one repeating reactor
//! timer at **half** that window and sends `WATCHDOG=1` on every expiry,
//! so a wedged loop stops checking in and gets restarted.
//!
//! Everything here is advisory: a missing supervisor disables the
//! watchdog, and send failures are logged, never escalated.

use std::env;
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use klaxon_reactor::{Reactor, ReactorError, TimerHandle};

pub type Result<T> = std::result::Result<T, WatchdogError>;

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("invalid notify address {addr:?}: {source}")]
    Address { addr: String, source: io::Error },

    #[error("keep-alive timer registration failed: {0}")]
    Timer(#[from] ReactorError),
}

/// Sender for supervisor state lines (`READY=1`, `WATCHDOG=1`, ...).
pub struct SdNotifier {
    socket: UnixDatagram,
    dest: SocketAddr,
}

impl SdNotifier {
    /// Notifier for the socket named by `NOTIFY_SOCKET`, if any.
    pub fn from_env() -> Option<Self> {
        let addr = env::var("NOTIFY_SOCKET").ok()?;
        match Self::to_address(&addr) {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                warn!(error = %e, "supervisor notifications disabled");
                None
            }
        }
    }

    /// Notifier for an explicit socket address. A leading `@` selects the
    /// abstract namespace, anything else is a filesystem path.
    pub fn to_address(addr: &str) -> Result<Self> {
        let map_err = |source| WatchdogError::Address {
            addr: addr.to_string(),
            source,
        };
        let dest = if let Some(name) = addr.strip_prefix('@') {
            SocketAddr::from_abstract_name(name.as_bytes()).map_err(map_err)?
        } else {
            SocketAddr::from_pathname(addr).map_err(map_err)?
        };
        let socket = UnixDatagram::unbound().map_err(map_err)?;
        // State lines must never stall the loop behind a slow supervisor.
        socket.set_nonblocking(true).map_err(map_err)?;
        Ok(SdNotifier { socket, dest })
    }

    /// Send one state line. Short sends cannot happen on a datagram
    /// socket; any error is the caller's to log.
    pub fn notify(&self, state: &str) -> io::Result<()> {
        self.socket.send_to_addr(state.as_bytes(), &self.dest)?;
        Ok(())
    }
}

/// The supervision keep-alive. Build it [`from_env`](Watchdog::from_env)
/// in the daemon and [`with_parts`](Watchdog::with_parts) in tests, then
/// [`arm`](Watchdog::arm) it on the reactor that must prove liveness.
pub struct Watchdog {
    keepalive: Option<Duration>,
    notifier: Option<Rc<SdNotifier>>,
    armed: Option<(Reactor, TimerHandle)>,
}

impl Watchdog {
    /// Configuration from `WATCHDOG_USEC` and `NOTIFY_SOCKET`. Either one
    /// missing (or unusable) disables the keep-alive without failing.
    pub fn from_env() -> Self {
        let keepalive = keepalive_from_usec(env::var("WATCHDOG_USEC").ok().as_deref());
        Watchdog {
            keepalive,
            notifier: SdNotifier::from_env().map(Rc::new),
            armed: None,
        }
    }

    /// Explicit configuration, bypassing the process environment.
    pub fn with_parts(keepalive: Option<Duration>, notifier: Option<SdNotifier>) -> Self {
        Watchdog {
            keepalive,
            notifier: notifier.map(Rc::new),
            armed: None,
        }
    }

    /// Register the repeating keep-alive timer. A watchdog without an
    /// interval or without a notifier arms nothing and succeeds. Re-arming
    /// replaces the previous timer.
    pub fn arm(&mut self, reactor: &Reactor) -> Result<()> {
        self.disarm();
        let (Some(keepalive), Some(notifier)) = (self.keepalive, self.notifier.clone()) else {
            debug!("supervision keep-alive disabled");
            return Ok(());
        };
        let timer = reactor.add_timer(keepalive, true, move |_| {
            if let Err(e) = notifier.notify("WATCHDOG=1") {
                warn!(error = %e, "keep-alive send failed");
            }
        })?;
        info!(interval_ms = keepalive.as_millis() as u64, "keep-alive armed");
        self.armed = Some((reactor.clone(), timer));
        Ok(())
    }

    /// Tell the supervisor startup is complete.
    pub fn announce_ready(&self) {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify("READY=1") {
                warn!(error = %e, "ready announcement failed");
            }
        }
    }

    /// Deregister the keep-alive timer, if armed.
    pub fn disarm(&mut self) {
        if let Some((reactor, timer)) = self.armed.take() {
            let _ = reactor.remove_timer(timer);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Half the supervisor's `WATCHDOG_USEC` window, or `None` when the value
/// is absent, zero, or not a number.
fn keepalive_from_usec(usec: Option<&str>) -> Option<Duration> {
    let raw = usec?.trim();
    match raw.parse::<u64>() {
        Ok(0) => None,
        Ok(usec) => Some(Duration::from_micros(usec) / 2),
        Err(_) => {
            warn!(value = raw, "unusable WATCHDOG_USEC ignored");
            None
        }
    }
}
