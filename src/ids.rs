//! Identifiers for threads, resources, messages and simulated objects.
//!
//! Every identifier is a newtype around `u64` so thread ids, message ids
//! and CPU numbers cannot be confused at compile time. Ids that must be
//! unique within a run are minted by an [`IdGen`] owned by the
//! `SimulationState`, never by a global static.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw integer.
            #[inline]
            pub const fn new(raw: u64) -> Self {
                $name(raw)
            }

            /// Return the underlying integer.
            #[inline]
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Stable numeric identity of an execution context.
    ThreadId,
    "T"
);
id_type!(
    /// A processing resource. `CpuId(0)` is the virtual CPU.
    CpuId,
    "CPU"
);
id_type!(
    /// A transport resource. `BusId(0)` is the virtual bus.
    BusId,
    "BUS"
);
id_type!(
    /// A message packet; strictly increasing within a run.
    MessageId,
    "M"
);
id_type!(
    /// A deployed simulated object instance.
    ObjectRef,
    "O"
);

impl CpuId {
    /// The zero-overhead CPU hosting system-level contexts.
    pub const VIRTUAL: CpuId = CpuId(0);

    /// Whether this is the virtual CPU.
    pub fn is_virtual(self) -> bool {
        self == Self::VIRTUAL
    }
}

impl BusId {
    /// The zero-overhead bus connecting every CPU.
    pub const VIRTUAL: BusId = BusId(0);

    /// Whether this is the virtual bus.
    pub fn is_virtual(self) -> bool {
        self == Self::VIRTUAL
    }
}

/// The resource an execution context lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceId {
    Cpu(CpuId),
    Bus(BusId),
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceId::Cpu(id) => write!(f, "{}", id),
            ResourceId::Bus(id) => write!(f, "{}", id),
        }
    }
}

// ── Id Generator ─────────────────────────────────────────────────────

/// Strictly-increasing id generator, safe to share between contexts.
///
/// Each `SimulationState` owns one generator per id space. `reset` is
/// only called between runs, so ids are never reused within a run.
#[derive(Debug)]
pub struct IdGen {
    start: u64,
    next: AtomicU64,
}

impl IdGen {
    /// Create a generator whose first id is `start`.
    pub fn starting_at(start: u64) -> Self {
        IdGen {
            start,
            next: AtomicU64::new(start),
        }
    }

    /// Mint the next raw id.
    pub fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Peek at the next id without consuming it.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Restart from the initial value.
    pub fn reset(&self) {
        self.next.store(self.start, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_gen_monotonic() {
        let gen = IdGen::starting_at(1);
        let a = gen.next_raw();
        let b = gen.next_raw();
        let c = gen.next_raw();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(gen.peek(), 4);
    }

    #[test]
    fn test_id_gen_reset() {
        let gen = IdGen::starting_at(5);
        gen.next_raw();
        gen.next_raw();
        gen.reset();
        assert_eq!(gen.next_raw(), 5);
    }

    #[test]
    fn test_display() {
        assert_eq!(ThreadId::new(3).to_string(), "T3");
        assert_eq!(CpuId::new(1).to_string(), "CPU1");
        assert_eq!(ResourceId::Bus(BusId::new(2)).to_string(), "BUS2");
        assert_eq!(MessageId::new(9).to_string(), "M9");
    }

    #[test]
    fn test_virtual_ids() {
        assert!(CpuId::VIRTUAL.is_virtual());
        assert!(!CpuId::new(1).is_virtual());
        assert!(BusId::new(0).is_virtual());
    }
}
