//! Line-oriented control endpoint.
//!
//! A Unix listener socket owned by the reactor: the listener's readiness
//! callback accepts clients, and every accepted connection becomes its own
//! registration with the full stage set. Requests are newline-terminated
//! UTF-8 commands, answered one per dispatch call so a chatty client
//! shares the loop with everything else.
//!
//! Replies that do not fit the kernel's send buffer are parked per
//! connection and flushed when the socket reports writable; the writable
//! interest is raised only while something is parked.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use klaxon_reactor::{
    PollCallbacks, PollFlags, PollHandle, Reactor, ReactorError, RemoveMode, WeakReactor,
};

use crate::config::ControlConfig;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket {path:?}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    #[error("control client setup failed: {0}")]
    Client(#[from] io::Error),

    #[error("control registration failed: {0}")]
    Register(#[from] ReactorError),
}

/// Facts the `status` command reports, shared by all connections.
struct ControlState {
    started: Instant,
    connections: Cell<usize>,
}

/// The bound control endpoint. Dropping it deregisters the listener and
/// removes the socket file; connections already accepted live on until
/// they disconnect.
pub struct ControlSocket {
    reactor: Reactor,
    registration: PollHandle,
    path: PathBuf,
}

impl ControlSocket {
    /// Bind the listener (replacing a stale socket file) and register it.
    pub fn bind(reactor: &Reactor, config: &ControlConfig) -> Result<Self, ControlError> {
        let path = config.socket.clone();
        let bind_err = |source| ControlError::Bind {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(bind_err)?;
            }
        }
        // Remove stale socket file from a previous unclean shutdown.
        if path.exists() {
            fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let listener_fd = listener.as_raw_fd();

        let state = Rc::new(ControlState {
            started: Instant::now(),
            connections: Cell::new(0),
        });
        let weak = reactor.downgrade();
        let max_line = config.max_line;
        let accept_all = move |_, _| loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = register_client(&weak, stream, &state, max_line) {
                        warn!(error = %e, "control client rejected");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    break;
                }
            }
        };

        let registration = reactor.add_poll(
            listener_fd,
            PollFlags::POLLIN,
            PollCallbacks::new().on_fired(accept_all),
        )?;
        info!(path = %path.display(), "Listening for control connections");
        Ok(ControlSocket {
            reactor: reactor.clone(),
            registration,
            path,
        })
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Err(e) = self
            .reactor
            .remove_poll(self.registration, RemoveMode::KeepDescriptor)
        {
            debug!(error = %e, "control listener already deregistered");
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(error = %e, "control socket file not removed");
            }
        }
        debug!("control socket closed");
    }
}

/// One accepted client. Shared by the connection's three stage callbacks.
struct Connection {
    stream: RefCell<UnixStream>,
    inbound: RefCell<Vec<u8>>,
    requests: RefCell<VecDeque<String>>,
    outbound: RefCell<Vec<u8>>,
    interest: Cell<PollFlags>,
    handle: Cell<Option<PollHandle>>,
    reactor: WeakReactor,
    state: Rc<ControlState>,
    max_line: usize,
}

fn register_client(
    reactor: &WeakReactor,
    stream: UnixStream,
    state: &Rc<ControlState>,
    max_line: usize,
) -> Result<(), ControlError> {
    let Some(strong) = reactor.upgrade() else {
        return Ok(());
    };
    stream.set_nonblocking(true)?;

    let conn = Rc::new(Connection {
        stream: RefCell::new(stream),
        inbound: RefCell::new(Vec::new()),
        requests: RefCell::new(VecDeque::new()),
        outbound: RefCell::new(Vec::new()),
        interest: Cell::new(PollFlags::POLLIN),
        handle: Cell::new(None),
        reactor: reactor.clone(),
        state: Rc::clone(state),
        max_line,
    });

    let callbacks = PollCallbacks::new()
        .on_fired({
            let conn = Rc::clone(&conn);
            move |_, readiness| {
                if readiness.contains(PollFlags::POLLOUT) {
                    conn.flush_outbound();
                }
                if readiness.contains(PollFlags::POLLIN) {
                    conn.read_incoming();
                }
            }
        })
        .on_check({
            let conn = Rc::clone(&conn);
            move |_| !conn.requests.borrow().is_empty()
        })
        .on_dispatch({
            let conn = Rc::clone(&conn);
            move |_| {
                let next = conn.requests.borrow_mut().pop_front();
                if let Some(line) = next {
                    conn.serve(&line);
                }
                !conn.requests.borrow().is_empty()
            }
        });

    let fd = conn.stream.borrow().as_raw_fd();
    let handle = strong.add_poll(fd, PollFlags::POLLIN, callbacks)?;
    conn.handle.set(Some(handle));
    state.connections.set(state.connections.get() + 1);
    debug!(%handle, "control client connected");
    Ok(())
}

impl Connection {
    fn read_incoming(self: &Rc<Self>) {
        let mut buf = [0u8; 1024];
        loop {
            let read = self.stream.borrow_mut().read(&mut buf);
            match read {
                Ok(0) => {
                    self.close();
                    return;
                }
                Ok(n) => {
                    if !self.ingest(&buf[..n]) {
                        warn!(limit = self.max_line, "control request line too long");
                        self.close();
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "control client read failed");
                    self.close();
                    return;
                }
            }
        }
    }

    /// Append raw bytes and peel off complete lines. False means the
    /// client blew the line-length limit and must go.
    fn ingest(&self, bytes: &[u8]) -> bool {
        let mut inbound = self.inbound.borrow_mut();
        inbound.extend_from_slice(bytes);
        let mut requests = self.requests.borrow_mut();
        while let Some(pos) = inbound.iter().position(|&b| b == b'\n') {
            if pos > self.max_line {
                return false;
            }
            let line: Vec<u8> = inbound.drain(..=pos).collect();
            let line = line.strip_suffix(b"\n").unwrap_or(&line);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            requests.push_back(String::from_utf8_lossy(line).into_owned());
        }
        inbound.len() <= self.max_line
    }

    fn serve(&self, line: &str) {
        match line.trim() {
            // Blank lines are tolerated, not answered.
            "" => {}
            "ping" => self.respond(b"pong\n"),
            "status" => {
                let reply = format!(
                    "klaxond {} up {}s connections {}\n",
                    env!("CARGO_PKG_VERSION"),
                    self.state.started.elapsed().as_secs(),
                    self.state.connections.get(),
                );
                self.respond(reply.as_bytes());
            }
            "stop" => {
                self.respond(b"bye\n");
                if let Some(reactor) = self.reactor.upgrade() {
                    info!("stop requested over control socket");
                    reactor.stop();
                }
            }
            unknown => {
                debug!(command = unknown, "unknown control command");
                self.respond(b"err unknown command\n");
            }
        }
    }

    fn respond(&self, reply: &[u8]) {
        self.outbound.borrow_mut().extend_from_slice(reply);
        self.flush_outbound();
    }

    /// Write parked output until done or the kernel pushes back; writable
    /// interest tracks whether anything is still parked.
    fn flush_outbound(&self) {
        loop {
            let written = {
                let outbound = self.outbound.borrow();
                if outbound.is_empty() {
                    break;
                }
                match self.stream.borrow_mut().write(&outbound) {
                    Ok(0) => None,
                    Ok(n) => Some(n),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => Some(0),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "control client write failed");
                        None
                    }
                }
            };
            match written {
                None => {
                    self.close();
                    return;
                }
                Some(0) => {
                    self.want_write(true);
                    return;
                }
                Some(n) => {
                    self.outbound.borrow_mut().drain(..n);
                }
            }
        }
        self.want_write(false);
    }

    fn want_write(&self, on: bool) {
        let desired = if on {
            PollFlags::POLLIN | PollFlags::POLLOUT
        } else {
            PollFlags::POLLIN
        };
        if self.interest.get() == desired {
            return;
        }
        let (Some(handle), Some(reactor)) = (self.handle.get(), self.reactor.upgrade()) else {
            return;
        };
        if reactor.update_interest(handle, desired).is_ok() {
            self.interest.set(desired);
        }
    }

    /// Deregister this connection; its descriptor closes when the last
    /// stage callback lets go of it.
    fn close(&self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.state
            .connections
            .set(self.state.connections.get().saturating_sub(1));
        if let Some(reactor) = self.reactor.upgrade() {
            if let Err(e) = reactor.remove_poll(handle, RemoveMode::KeepDescriptor) {
                debug!(error = %e, "control connection already deregistered");
            }
        }
        debug!("control client disconnected");
    }
}
