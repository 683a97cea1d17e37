//! The hybrid-logical clock is an external collaborator; this crate only
//! needs two things from it: a monotonically non-decreasing nanosecond
//! timestamp, and the tolerance it is willing to drift from true cluster
//! time. [`Clock`] is the seam; [`SystemClock`] is the production default.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of monotonically non-decreasing nanosecond timestamps that
/// also advertises how far it tolerates drifting from true cluster time.
pub trait Clock: Send + Sync {
    /// Current local time, nanoseconds since the Unix epoch.
    fn now_nanos(&self) -> i64;

    /// How far this node's clock is allowed to disagree with the cluster
    /// before the node's assumptions about linearisability break down.
    fn max_offset(&self) -> Duration;
}

/// Production clock backed by `SystemTime`.
pub struct SystemClock {
    max_offset: Duration,
    last_nanos: AtomicI64,
}

impl SystemClock {
    pub fn new(max_offset: Duration) -> Self {
        Self {
            max_offset,
            last_nanos: AtomicI64::new(0),
        }
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch");
        let observed = d.as_nanos() as i64;
        // SystemTime is not guaranteed monotonic (an NTP step can move it
        // backward); clamp against the last value handed out so callers
        // never see time run backward, per the `Clock` trait's
        // monotonic-non-decreasing contract.
        self.last_nanos.fetch_max(observed, Ordering::SeqCst).max(observed)
    }

    fn max_offset(&self) -> Duration {
        self.max_offset
    }
}

/// Deterministic clock for tests: starts at a fixed nanosecond value and
/// advances by a configurable step every time `now_nanos` is read, so
/// tests can script exact round-trip timings (spec scenario: "client
/// clock advancing from t=10 in increments of 1ns per read").
pub struct FakeClock {
    nanos: AtomicI64,
    step_nanos: AtomicI64,
    max_offset: Duration,
}

impl FakeClock {
    pub fn new(start_nanos: i64, max_offset: Duration) -> Arc<Self> {
        Arc::new(Self {
            nanos: AtomicI64::new(start_nanos),
            step_nanos: AtomicI64::new(1),
            max_offset,
        })
    }

    /// Change how much each subsequent `now_nanos()` read advances the
    /// clock. Used to simulate a sudden RTT blowup.
    pub fn set_step_nanos(&self, step: i64) {
        self.step_nanos.store(step, Ordering::SeqCst);
    }

    /// Snap the clock to a fixed value (used to model a server with a
    /// clock that never advances).
    pub fn set_fixed(&self, value: i64) {
        self.nanos.store(value, Ordering::SeqCst);
        self.step_nanos.store(0, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_nanos(&self) -> i64 {
        let step = self.step_nanos.load(Ordering::SeqCst);
        self.nanos.fetch_add(step, Ordering::SeqCst) + step
    }

    fn max_offset(&self) -> Duration {
        self.max_offset
    }
}
