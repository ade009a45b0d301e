//! Physical clock implementations

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cadence_core::{Instant, Interval, NSEC_PER_MSEC};
use parking_lot::Mutex;

/// Source of physical time in nanoseconds since the epoch
pub trait PhysicalClock: Send + Sync {
    fn now(&self) -> Instant;
}

impl<C: PhysicalClock + ?Sized> PhysicalClock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Wall clock of the host
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now(&self) -> Instant {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos().min(i64::MAX as u128) as Instant,
            // Host clock set before 1970
            Err(e) => -(e.duration().as_nanos().min(i64::MAX as u128) as Instant),
        }
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        ManualClock {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Instant) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Interval) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl PhysicalClock for ManualClock {
    fn now(&self) -> Instant {
        self.now.load(Ordering::SeqCst)
    }
}

struct OffsetState {
    /// Offset currently applied to readings
    offset: Interval,
    /// Offset the clock converges toward
    target: Interval,
    /// Last reading handed out
    last: Instant,
}

/// Physical clock corrected by a clock-synchronization offset.
///
/// Adjustments made with [`SyncedClock::adjust`] are slewed in: each reading
/// moves the applied offset 10% of the remaining error toward the target,
/// bounded by `max_step`. Readings never decrease.
pub struct SyncedClock<C> {
    inner: C,
    max_step: Interval,
    state: Mutex<OffsetState>,
}

impl<C: PhysicalClock> SyncedClock<C> {
    pub fn new(inner: C) -> Self {
        Self::with_max_step(inner, NSEC_PER_MSEC)
    }

    pub fn with_max_step(inner: C, max_step: Interval) -> Self {
        SyncedClock {
            inner,
            max_step: max_step.max(1),
            state: Mutex::new(OffsetState {
                offset: 0,
                target: 0,
                last: Instant::MIN,
            }),
        }
    }

    /// Shift the target offset; readings converge to it gradually
    pub fn adjust(&self, delta: Interval) {
        let mut state = self.state.lock();
        state.target = state.target.saturating_add(delta);
    }

    /// Shift the offset at once (startup synchronization)
    pub fn adjust_immediately(&self, delta: Interval) {
        let mut state = self.state.lock();
        state.target = state.target.saturating_add(delta);
        state.offset = state.target;
    }

    /// Offset currently applied
    pub fn offset(&self) -> Interval {
        self.state.lock().offset
    }

    pub fn target_offset(&self) -> Interval {
        self.state.lock().target
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: PhysicalClock> PhysicalClock for SyncedClock<C> {
    fn now(&self) -> Instant {
        let raw = self.inner.now();
        let mut state = self.state.lock();

        let error = state.target - state.offset;
        if error != 0 {
            // Proportional correction (10% of error, clamped), exact when small
            let step = if error.abs() <= 10 { error } else { error / 10 };
            state.offset += step.clamp(-self.max_step, self.max_step);
        }

        let reading = raw.saturating_add(state.offset).max(state.last);
        state.last = reading;
        reading
    }
}
