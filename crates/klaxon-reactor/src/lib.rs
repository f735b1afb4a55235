//! # klaxon-reactor
//!
//! Single-threaded event reactor for the Klaxon audio daemon.
//!
//! One call to [`Reactor::start`] multiplexes every registered event source
//! over a single blocking wait: file descriptors, drift-corrected interval
//! timers, and Unix signals bridged into the same descriptor set.
//!
//! ## Dispatch stages
//!
//! Descriptor readiness flows through up to four per-registration stages:
//!
//! ```text
//! prepare  — every registration, every iteration, before the wait
//! fired    — readiness observed (requested conditions only)
//! check    — "do you want dispatch?"; absent means no
//! dispatch — repeated while it returns true, one descriptor at a time
//! ```
//!
//! ## Re-entrancy
//!
//! Every registration call is legal from inside any callback, including a
//! callback removing its own registration. Structural changes are applied
//! to the wait-set at the top of the next iteration; a removed
//! registration is never invoked again, even later in the same iteration.
//!
//! ## Threading
//!
//! A [`Reactor`] lives and dies on one thread. The only cross-thread
//! surface is [`Waker`], which can nudge or stop a blocked loop from
//! anywhere.
//!
//! ```no_run
//! use std::time::Duration;
//! use klaxon_reactor::Reactor;
//!
//! let reactor = Reactor::new()?;
//! let r = reactor.clone();
//! reactor.add_timer(Duration::from_secs(1), false, move |_| r.stop())?;
//! reactor.start()?;
//! # Ok::<(), klaxon_reactor::ReactorError>(())
//! ```

mod error;
mod handles;
mod poll;
mod reactor;
mod signals;
mod timer;

pub use error::{ReactorError, Result};
pub use handles::{PollHandle, SignalHandle, TimerHandle, HANDLE_LIMIT};
pub use poll::{PollCallbacks, RemoveMode};
pub use reactor::{Reactor, Waker, WeakReactor};
pub use signals::SignalInfo;

// Callers express descriptor interest and signal choices in the same
// types the wait primitives use.
pub use nix::poll::PollFlags;
pub use nix::sys::signal::Signal;
