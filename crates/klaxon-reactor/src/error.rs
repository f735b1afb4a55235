//! Error taxonomy of the reactor's registration surface.
//!
//! Registry-level failures are ordinary values the caller is expected to
//! check; only `Fatal` means the reactor instance cannot (or can no longer)
//! run.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReactorError>;

#[derive(Debug, Error)]
pub enum ReactorError {
    /// The handle or descriptor is unknown to the registry addressed.
    #[error("no such registration: {what}")]
    NotFound { what: String },

    /// The descriptor already has a live registration.
    #[error("descriptor {fd} is already registered")]
    AlreadyExists { fd: RawFd },

    /// Every identifier in the registry's pool is live.
    #[error("handle pool exhausted ({limit} identifiers)")]
    Exhausted { limit: u16 },

    /// Timers must have a non-zero interval.
    #[error("timer interval must be non-zero")]
    ZeroInterval,

    /// The OS rejected a signal or resource setup request.
    #[error("setup not possible: {reason}")]
    NotPossible { reason: String },

    /// The wakeup channel could not be established, or the wait primitive
    /// failed in a way the loop cannot recover from.
    #[error("reactor cannot run: {source}")]
    Fatal {
        #[source]
        source: io::Error,
    },
}

impl ReactorError {
    pub(crate) fn unknown_handle(kind: &str, handle: u16) -> Self {
        ReactorError::NotFound {
            what: format!("{kind} handle {handle}"),
        }
    }

    pub(crate) fn fatal(source: io::Error) -> Self {
        ReactorError::Fatal { source }
    }
}
