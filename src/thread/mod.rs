//! Execution contexts: the unit of concurrency.
//!
//! Each context wraps one logical thread of the modelled system and is
//! backed by a parked native thread that only proceeds when its resource
//! grants it a slice. Payload bodies never block a native thread on their
//! own; every suspension goes through the context's rendezvous.
//!
//! # Module structure
//!
//! | Sub-module | Contents |
//! |---|---|
//! | [`state`] | [`RunState`], [`Signal`], [`PayloadKind`] |
//! | [`context`] | [`ExecutionContext`] state machine |
//! | [`payload`] | [`ThreadPayload`] variants and their bodies |
//! | [`scope`] | [`ThreadScope`] handle for payload bodies |
//! | [`sync`] | [`ControlQueue`], [`SimMutex`] |

pub mod context;
pub mod payload;
pub mod scope;
pub mod state;
pub mod sync;

// Flat re-exports so callers can use `rtsched::thread::RunState` etc.
pub use context::ExecutionContext;
pub use payload::{InitFn, Initializer, MainBody, ObjectCall, PeriodicSpec, ReplyTo, ThreadPayload};
pub use scope::ThreadScope;
pub use state::{PayloadKind, RunState, Signal};
pub use sync::{ControlQueue, SimMutex};

#[cfg(test)]
mod tests;
