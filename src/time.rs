/// Virtual time for the resource scheduler.
///
/// Represents a logical timestamp with no dependency on `std::time`.
/// Time advances only when the resource scheduler finds every resource
/// idle, never from wall-clock observation. One tick is one
/// nanosecond-equivalent of simulated time.

use std::sync::atomic::{AtomicU64, Ordering};

/// A logical tick in simulation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VirtualTime(u64);

impl VirtualTime {
    /// The zero-point of simulation time.
    pub const ZERO: VirtualTime = VirtualTime(0);

    /// Create a new `VirtualTime` from a raw tick value.
    #[inline]
    pub fn new(ticks: u64) -> Self {
        VirtualTime(ticks)
    }

    /// Return the raw tick value.
    #[inline]
    pub fn ticks(self) -> u64 {
        self.0
    }

    /// Advance time by `delta` ticks.
    /// Returns `None` on overflow (should never happen in practice).
    #[inline]
    pub fn advance(self, delta: u64) -> Option<VirtualTime> {
        self.0.checked_add(delta).map(VirtualTime)
    }

    /// The absolute time `delay` ticks after `self`, saturating at the end
    /// of representable time.
    #[inline]
    pub fn plus(self, delay: u64) -> VirtualTime {
        VirtualTime(self.0.saturating_add(delay))
    }

    /// Returns `true` if `self` is strictly before `other`.
    #[inline]
    pub fn is_before(self, other: VirtualTime) -> bool {
        self.0 < other.0
    }

    /// Returns the duration (in ticks) between two points in time.
    /// Returns `None` if `other` is after `self`.
    #[inline]
    pub fn duration_since(self, other: VirtualTime) -> Option<u64> {
        self.0.checked_sub(other.0)
    }
}

impl std::fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T={}", self.0)
    }
}

// ── Virtual Clock ─────────────────────────────────────────────────────

/// The single "now" of a simulation run.
///
/// Shared by every resource and context of one `SimulationState`. Only the
/// resource scheduler advances it in real-time mode; the counter never
/// decreases except through an explicit `reset` between runs.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: AtomicU64,
}

impl VirtualClock {
    /// A clock reading `T=0`.
    pub fn new() -> Self {
        VirtualClock {
            now: AtomicU64::new(0),
        }
    }

    /// Current virtual time.
    #[inline]
    pub fn now(&self) -> VirtualTime {
        VirtualTime(self.now.load(Ordering::SeqCst))
    }

    /// Move the clock forward by `delta` ticks and return the new time.
    ///
    /// Saturates instead of wrapping, so the clock stays monotonic even at
    /// the end of representable time.
    pub fn advance(&self, delta: u64) -> VirtualTime {
        let prev = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.saturating_add(delta))
            })
            .unwrap_or_else(|t| t);
        VirtualTime(prev.saturating_add(delta))
    }

    /// Back to `T=0`. Only valid between runs.
    pub fn reset(&self) {
        self.now.store(0, Ordering::SeqCst);
    }
}
