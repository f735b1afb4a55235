//! Timer registry: relative countdowns with drift correction.
//!
//! No absolute deadlines are stored. Every armed entry carries a `remaining`
//! duration; once per loop iteration the whole list is corrected by the wall
//! time actually elapsed since the previous correction sample, and every
//! entry that reaches zero fires. Stopping a timer removes it from the armed
//! list but keeps its configuration, so `restart`/`update` can renew it
//! under the same handle.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{ReactorError, Result};
use crate::handles::{HandlePool, TimerHandle};

pub(crate) type TimerCallback = Rc<RefCell<dyn FnMut(TimerHandle)>>;

/// Configured timer; survives `stop`.
struct TimerSpec {
    handle: TimerHandle,
    interval: Duration,
    repeats: bool,
    callback: TimerCallback,
}

/// One armed countdown. The armed list is kept sorted ascending by
/// `remaining`, ties in insertion order.
struct Armed {
    handle: TimerHandle,
    remaining: Duration,
}

pub(crate) struct TimerRegistry {
    pool: HandlePool,
    specs: Vec<TimerSpec>,
    armed: Vec<Armed>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            pool: HandlePool::new(),
            specs: Vec::new(),
            armed: Vec::new(),
        }
    }

    /// Register and arm a new timer. `skew` is the wall time the running
    /// loop has already consumed since its last correction sample; adding it
    /// keeps a timer registered mid-iteration relative to "now" instead of
    /// the sample point.
    pub fn add(
        &mut self,
        interval: Duration,
        repeats: bool,
        callback: TimerCallback,
        skew: Duration,
    ) -> Result<TimerHandle> {
        if interval.is_zero() {
            return Err(ReactorError::ZeroInterval);
        }
        let handle = TimerHandle(self.pool.next()?);
        self.specs.push(TimerSpec {
            handle,
            interval,
            repeats,
            callback,
        });
        self.arm(handle, interval + skew);
        Ok(handle)
    }

    /// Replace the countdown (and the configured interval) and re-arm,
    /// renewing the timer if it is currently stopped.
    pub fn update(&mut self, handle: TimerHandle, interval: Duration, skew: Duration) -> Result<()> {
        let spec = self
            .specs
            .iter_mut()
            .find(|s| s.handle == handle)
            .ok_or_else(|| ReactorError::unknown_handle("timer", handle.0))?;
        spec.interval = interval;
        self.rearm(handle, interval + skew);
        Ok(())
    }

    /// Re-arm to the configured interval, renewing a stopped timer.
    pub fn restart(&mut self, handle: TimerHandle, skew: Duration) -> Result<()> {
        let interval = self
            .specs
            .iter()
            .find(|s| s.handle == handle)
            .map(|s| s.interval)
            .ok_or_else(|| ReactorError::unknown_handle("timer", handle.0))?;
        self.rearm(handle, interval + skew);
        Ok(())
    }

    /// Disarm without forgetting the configuration.
    pub fn stop(&mut self, handle: TimerHandle) -> Result<()> {
        let at = self
            .armed
            .iter()
            .position(|a| a.handle == handle)
            .ok_or_else(|| ReactorError::unknown_handle("armed timer", handle.0))?;
        self.armed.remove(at);
        Ok(())
    }

    /// Destroy the timer entirely and release its handle.
    pub fn remove(&mut self, handle: TimerHandle) -> Result<()> {
        let at = self
            .specs
            .iter()
            .position(|s| s.handle == handle)
            .ok_or_else(|| ReactorError::unknown_handle("timer", handle.0))?;
        self.specs.remove(at);
        self.armed.retain(|a| a.handle != handle);
        self.pool.release(handle.0);
        Ok(())
    }

    pub fn is_registered(&self, handle: TimerHandle) -> bool {
        self.specs.iter().any(|s| s.handle == handle)
    }

    /// Smallest armed countdown; the loop's next wake deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.armed.first().map(|a| a.remaining)
    }

    /// Subtract elapsed wall time from every armed countdown. Order is
    /// preserved, so the list stays sorted.
    pub fn correct(&mut self, elapsed: Duration) {
        for armed in &mut self.armed {
            armed.remaining = armed.remaining.saturating_sub(elapsed);
        }
    }

    /// Collect every due entry in ascending order. Repeating entries are
    /// re-armed to their configured interval before any callback runs, so a
    /// callback stopping its own handle observes the already-rescheduled
    /// state.
    pub fn collect_due(&mut self) -> Vec<(TimerHandle, TimerCallback)> {
        let upto = self
            .armed
            .iter()
            .position(|a| !a.remaining.is_zero())
            .unwrap_or(self.armed.len());
        if upto == 0 {
            return Vec::new();
        }
        let expired: Vec<Armed> = self.armed.drain(..upto).collect();
        let mut due = Vec::with_capacity(expired.len());
        for entry in expired {
            let Some(spec) = self.specs.iter().find(|s| s.handle == entry.handle) else {
                continue;
            };
            let (repeats, interval) = (spec.repeats, spec.interval);
            let callback = Rc::clone(&spec.callback);
            if repeats {
                self.arm(entry.handle, interval);
            }
            due.push((entry.handle, callback));
        }
        due
    }

    fn arm(&mut self, handle: TimerHandle, remaining: Duration) {
        let at = self.armed.partition_point(|a| a.remaining <= remaining);
        self.armed.insert(at, Armed { handle, remaining });
    }

    fn rearm(&mut self, handle: TimerHandle, remaining: Duration) {
        self.armed.retain(|a| a.handle != handle);
        self.arm(handle, remaining);
    }
}
