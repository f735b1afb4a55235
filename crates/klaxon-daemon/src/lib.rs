//! # klaxon-daemon
//!
//! Composition root for `klaxond`, the Klaxon audio-routing daemon
//! scaffold.
//!
//! ## Startup sequence
//!
//! 1. Build the reactor (fails hard if the wakeup channel cannot exist)
//! 2. Bind the control socket and register it
//! 3. Arm the supervision watchdog, if a supervisor provided one
//! 4. Intercept the shutdown signals
//! 5. Announce readiness and enter the loop
//!
//! Everything after that happens inside reactor callbacks; the loop exits
//! on SIGINT/SIGTERM/SIGHUP/SIGQUIT or a `stop` control command, and the
//! daemon tears down in reverse order.

pub mod config;
pub mod control;

use anyhow::Context;
use tracing::info;

use klaxon_reactor::{Reactor, Signal};
use klaxon_watchdog::Watchdog;

pub use config::Config;
use control::ControlSocket;

/// Run the daemon until a shutdown signal or control command stops it.
pub fn run_daemon(config: Config) -> anyhow::Result<()> {
    let reactor = Reactor::new().context("Failed to set up the event loop")?;

    let control =
        ControlSocket::bind(&reactor, &config.control).context("Failed to bind control socket")?;

    let mut watchdog = Watchdog::from_env();
    watchdog
        .arm(&reactor)
        .context("Failed to arm supervision watchdog")?;

    install_shutdown_signals(&reactor).context("Failed to intercept shutdown signals")?;

    watchdog.announce_ready();
    info!("klaxond entering its loop");
    reactor.start().context("Event loop failed")?;
    info!("klaxond loop left, shutting down");

    drop(control);
    Ok(())
}

/// One handler for the four conventional terminate-me signals; each logs
/// and forces the loop out of its wait.
fn install_shutdown_signals(reactor: &Reactor) -> klaxon_reactor::Result<()> {
    reactor.listen_to(&[
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGQUIT,
    ])?;
    let r = reactor.clone();
    reactor.add_signal_handler(move |_, delivery| {
        info!(signal = %delivery.signal, "shutdown signal received");
        r.exit_now();
    })?;
    Ok(())
}
