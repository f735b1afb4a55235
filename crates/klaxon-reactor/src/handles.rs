//! Identifier pools for the three registries.
//!
//! Handles are small non-zero integers issued from a wrapping counter. Each
//! registry owns an independent pool, so running one out of identifiers does
//! not affect the others.

use std::collections::HashSet;
use std::fmt;

use crate::error::{ReactorError, Result};

/// One past the largest identifier a pool will issue.
pub const HANDLE_LIMIT: u16 = i16::MAX as u16;

/// Identifier of a watched descriptor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollHandle(pub(crate) u16);

impl PollHandle {
    /// The raw identifier value, mainly useful for logging.
    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PollHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poll#{}", self.0)
    }
}

/// Identifier of a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub(crate) u16);

impl TimerHandle {
    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Identifier of a signal listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandle(pub(crate) u16);

impl SignalHandle {
    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SignalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signal#{}", self.0)
    }
}

/// Issues identifiers in 1..limit, skipping ones still live and wrapping at
/// the limit. Zero is never issued.
#[derive(Debug)]
pub(crate) struct HandlePool {
    last: u16,
    limit: u16,
    live: HashSet<u16>,
}

impl HandlePool {
    pub fn new() -> Self {
        Self::with_limit(HANDLE_LIMIT)
    }

    pub fn with_limit(limit: u16) -> Self {
        debug_assert!(limit >= 2);
        Self {
            last: 0,
            limit,
            live: HashSet::new(),
        }
    }

    /// Issue the next free identifier and mark it live. Fails once the scan
    /// comes full circle without finding a free one.
    pub fn next(&mut self) -> Result<u16> {
        let start = self.last;
        loop {
            self.last += 1;
            if self.last == self.limit {
                self.last = 1;
            }
            if self.last == start {
                return Err(ReactorError::Exhausted { limit: self.limit });
            }
            if !self.live.contains(&self.last) {
                self.live.insert(self.last);
                return Ok(self.last);
            }
        }
    }

    /// Return an identifier to the free state. Returns whether it was live.
    pub fn release(&mut self, id: u16) -> bool {
        self.live.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issues_sequential_ids_from_one() {
        let mut pool = HandlePool::new();
        assert_eq!(pool.next().unwrap(), 1);
        assert_eq!(pool.next().unwrap(), 2);
        assert_eq!(pool.next().unwrap(), 3);
    }

    #[test]
    fn test_released_ids_are_reused_after_wraparound() {
        let mut pool = HandlePool::with_limit(4);
        assert_eq!(pool.next().unwrap(), 1);
        assert_eq!(pool.next().unwrap(), 2);
        assert_eq!(pool.next().unwrap(), 3);
        assert!(pool.release(2));
        // Counter sits at 3; the scan wraps past the limit and lands on the
        // only free identifier.
        assert_eq!(pool.next().unwrap(), 2);
    }

    #[test]
    fn test_full_pool_reports_exhausted() {
        let mut pool = HandlePool::with_limit(4);
        for _ in 0..3 {
            pool.next().unwrap();
        }
        assert!(matches!(
            pool.next(),
            Err(ReactorError::Exhausted { limit: 4 })
        ));
    }

    #[test]
    fn test_live_ids_are_skipped_not_reissued() {
        let mut pool = HandlePool::with_limit(6);
        let first: Vec<u16> = (0..5).map(|_| pool.next().unwrap()).collect();
        assert_eq!(first, vec![1, 2, 3, 4, 5]);
        pool.release(1);
        pool.release(4);
        // 2, 3 and 5 stay live; only the released ones come back.
        assert_eq!(pool.next().unwrap(), 1);
        assert_eq!(pool.next().unwrap(), 4);
        assert!(matches!(pool.next(), Err(ReactorError::Exhausted { .. })));
    }

    #[test]
    fn test_pools_are_independent() {
        let mut a = HandlePool::new();
        let mut b = HandlePool::new();
        assert_eq!(a.next().unwrap(), 1);
        assert_eq!(b.next().unwrap(), 1);
    }

    #[test]
    fn test_release_of_unknown_id_is_a_noop() {
        let mut pool = HandlePool::new();
        assert!(!pool.release(7));
    }
}
