//! # rtsched — Real-Time Resource Scheduler
//!
//! A virtual-clock kernel for running models of distributed real-time
//! systems. Logical threads are native threads parked on a rendezvous;
//! exactly one of them moves at a time, when the resource it lives on
//! grants it a slice. Every scheduling effect is written to an RT event
//! log, so two runs of the same system produce identical logs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │           ResourceScheduler           │ ← round-robin over resources
//! │  ┌──────────────┐  ┌──────────────┐  │
//! │  │ CpuResource   │  │ BusResource   │  │ ← FCFS / fixed-priority
//! │  │  ┌─────────┐ │  │  ┌─────────┐ │  │
//! │  │  │ Context │ │  │  │ Driver  │ │  │ ← parked native threads
//! │  │  └─────────┘ │  │  └─────────┘ │  │
//! │  └──────────────┘  └──────────────┘  │
//! │  ┌────────────────────────────────┐  │
//! │  │ SimulationState                 │  │ ← clock, ids, registry
//! │  │  VirtualClock · EventLog        │  │ ← RT event records
//! │  └────────────────────────────────┘  │
//! └──────────────────────────────────────┘
//! ```

pub mod config;
pub mod dsl;
pub mod error;
pub mod event;
pub mod eventlog;
pub mod ids;
pub mod policy;
pub mod resource;
pub mod scheduler;
pub mod simulation;
pub mod thread;
pub mod time;
pub mod value;

// Re-exports for convenience.
pub use config::{BusConfig, CpuConfig, PolicyKind, RtSettings, SystemConfig};
pub use dsl::{System, SystemBuilder};
pub use error::{ExecError, ExecResult, Location, RuntimeError, SchedError, SchedResult};
pub use event::{LogRecord, LogValue, RtEvent};
pub use eventlog::{logs_match, EventLog, LogSink, NullSink};
pub use ids::{BusId, CpuId, MessageId, ObjectRef, ResourceId, ThreadId};
pub use resource::{ClassDef, Topology};
pub use scheduler::ResourceScheduler;
pub use simulation::SimulationState;
pub use thread::{ControlQueue, Initializer, ObjectCall, PeriodicSpec, RunState, Signal, SimMutex, ThreadScope};
pub use time::{VirtualClock, VirtualTime};
pub use value::Value;
