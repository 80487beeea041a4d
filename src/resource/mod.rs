//! Resources: the things contexts run on.
//!
//! # Module structure
//!
//! | Sub-module | Contents |
//! |---|---|
//! | [`cpu`] | [`CpuResource`]: swaps one context in per reschedule |
//! | [`bus`] | [`BusResource`]: FIFO message queue plus its driver context |
//! | [`message`] | [`MessagePacket`], [`RequestPacket`], [`ResponsePacket`], [`ResponseCell`] |
//! | [`topology`] | [`Topology`]: all resources and the deployed objects |

pub mod bus;
pub mod cpu;
pub mod message;
pub mod topology;

use std::sync::Arc;

use crate::ids::{ResourceId, ThreadId};
use crate::simulation::SimulationState;
use crate::thread::{ExecutionContext, Signal};
use crate::time::VirtualTime;

pub use bus::BusResource;
pub use cpu::CpuResource;
pub use message::{MessagePacket, RequestPacket, ResponseCell, ResponsePacket};
pub use topology::{ClassDef, DeployedObject, OperationFn, Topology};

/// How far the clock may move before a resource has something to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimumTimestep {
    /// A context is running; time must not move under it.
    Busy,
    /// The earliest pending wake-up is this many ticks away.
    After(u64),
    /// Nothing on this resource will ever wake by itself.
    Never,
}

impl MinimumTimestep {
    /// Combine two resources' answers: busy wins, then the nearer wake-up.
    pub fn min(self, other: MinimumTimestep) -> MinimumTimestep {
        use MinimumTimestep::*;
        match (self, other) {
            (Busy, _) | (_, Busy) => Busy,
            (After(a), After(b)) => After(a.min(b)),
            (After(a), Never) | (Never, After(a)) => After(a),
            (Never, Never) => Never,
        }
    }
}

impl From<Option<u64>> for MinimumTimestep {
    fn from(delay: Option<u64>) -> Self {
        delay.map_or(MinimumTimestep::Never, MinimumTimestep::After)
    }
}

/// A processing or transport resource, as the resource scheduler sees it.
pub trait Resource: Send + Sync {
    fn id(&self) -> ResourceId;

    fn name(&self) -> &str;

    /// Register a new context with this resource's policy.
    fn register(&self, ctx: Arc<ExecutionContext>, priority: u64);

    fn unregister(&self, id: ThreadId);

    /// Let the next context run one slice. Returns `true` if the resource
    /// made progress, `false` if it is idle until time moves.
    fn reschedule(&self, sim: &SimulationState) -> bool;

    fn minimum_timestep(&self, now: VirtualTime) -> MinimumTimestep;

    /// The clock moved to `now`; wake whatever is due.
    fn advance(&self, now: VirtualTime);

    /// Post `signal` to every registered context.
    fn signal_all(&self, signal: Signal);

    /// Number of registered contexts.
    fn thread_count(&self) -> usize;

    /// One-line human-readable snapshot.
    fn status(&self) -> String;

    /// Drop all per-run state.
    fn reset(&self);
}
