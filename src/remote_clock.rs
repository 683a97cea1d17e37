//! Remote-clock monitor (component C): the latest offset sample per peer
//! address, with TTL-based eviction and a quorum-based safety gate.
//!
//! Grounded on the teacher's `runtime::DynamicConfig` pattern of
//! lock-free reads over a value that a single background writer
//! replaces wholesale (`ArcSwap`) — generalised here to one `ArcSwap`
//! cell per peer address inside a `DashMap`, since unlike `DynamicConfig`
//! there is no single shared value but one per key.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::error::Error;

/// An immutable clock-offset measurement for one peer, produced by a
/// single heartbeat round trip (spec §3, §4.4).
#[derive(Debug, Clone, Copy)]
pub struct OffsetSample {
    /// Signed nanosecond displacement of the peer's clock relative to
    /// ours: positive means the peer is ahead.
    pub offset_nanos: i64,
    /// Half-width of the interval the true offset is known to lie in.
    pub uncertainty_nanos: i64,
    /// Local time the sample was taken, nanoseconds.
    pub measured_at_nanos: i64,
}

impl OffsetSample {
    fn is_expired(&self, now_nanos: i64, ttl: Duration) -> bool {
        let ttl_nanos = ttl.as_nanos() as i64;
        now_nanos.saturating_sub(self.measured_at_nanos) > ttl_nanos
    }
}

/// Below this many live samples, quorum is meaningless and
/// `verify_clock_offset` always returns `Ok` (spec §4.6: "a monitor with
/// fewer than, say, three live samples returns Ok unconditionally").
const MIN_QUORUM_SAMPLES: usize = 3;

/// Per-peer offset samples plus the quorum gate over them.
///
/// One entry is born per address on its first successful heartbeat
/// (spec invariant 5) and is mutated only by that peer's owning
/// heartbeat loop (spec §5: "one writer"); reads never block behind a
/// write thanks to `ArcSwap`.
pub struct RemoteClockMonitor {
    samples: DashMap<String, Arc<ArcSwap<OffsetSample>>>,
    offset_ttl: Duration,
}

impl RemoteClockMonitor {
    pub fn new(offset_ttl: Duration) -> Self {
        Self {
            samples: DashMap::new(),
            offset_ttl,
        }
    }

    /// Replace (or create) the sample for `addr`.
    pub fn record(&self, addr: &str, sample: OffsetSample) {
        match self.samples.get(addr) {
            Some(cell) => cell.store(Arc::new(sample)),
            None => {
                self.samples
                    .insert(addr.to_string(), Arc::new(ArcSwap::new(Arc::new(sample))));
            }
        }
    }

    /// The current sample for `addr`, or `None` if there is none or it
    /// has expired (expired entries are evicted lazily here, per §4.6).
    pub fn get(&self, addr: &str, clock: &dyn Clock) -> Option<OffsetSample> {
        let now = clock.now_nanos();
        let expired = match self.samples.get(addr) {
            Some(cell) => {
                let sample = **cell.load();
                if sample.is_expired(now, self.offset_ttl) {
                    true
                } else {
                    return Some(sample);
                }
            }
            None => return None,
        };
        if expired {
            self.samples.remove(addr);
        }
        None
    }

    /// All live (non-expired) samples, evicting expired entries along
    /// the way.
    fn live_samples(&self, clock: &dyn Clock) -> Vec<OffsetSample> {
        let now = clock.now_nanos();
        let mut expired = Vec::new();
        let mut live = Vec::new();
        for entry in self.samples.iter() {
            let sample = **entry.value().load();
            if sample.is_expired(now, self.offset_ttl) {
                expired.push(entry.key().clone());
            } else {
                live.push(sample);
            }
        }
        for addr in expired {
            self.samples.remove(&addr);
        }
        live
    }

    /// The quorum gate (spec §4.6): fatal if strictly more than half of
    /// the live samples exceed `MaxOffset` once their uncertainty is
    /// accounted for. Below [`MIN_QUORUM_SAMPLES`] live samples, always
    /// `Ok` — quorum is meaningless that small.
    pub fn verify_clock_offset(&self, clock: &dyn Clock) -> Result<(), Error> {
        let live = self.live_samples(clock);
        if live.len() < MIN_QUORUM_SAMPLES {
            return Ok(());
        }

        let max_offset_nanos = clock.max_offset().as_nanos() as i64;
        let offenders = live
            .iter()
            .filter(|s| s.offset_nanos.abs() + s.uncertainty_nanos > max_offset_nanos)
            .count();

        if offenders * 2 > live.len() {
            return Err(Error::OffsetAnomaly {
                offending: offenders,
                live: live.len(),
            });
        }
        Ok(())
    }
}
