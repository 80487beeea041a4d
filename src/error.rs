//! Structured error types for the resource scheduler.
//!
//! Two channels are kept apart:
//!
//! - [`ExecError`] flows through payload bodies. `Unwind` is control flow
//!   (a context is being torn down by a signal) and is propagated with `?`
//!   like any early return; `Runtime` is a genuine payload failure.
//! - [`SchedError`] is what the caller of a run sees: deadlock, payload
//!   failure with location context, init failure, or a setup mistake.

use thiserror::Error;

use crate::ids::{BusId, CpuId, ObjectRef, ThreadId};
use crate::thread::Signal;
use crate::time::VirtualTime;

/// A point in a payload body, reported by `step` and attached to failures.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    pub name: String,
    pub line: u32,
}

impl Location {
    pub fn new(name: impl Into<String>, line: u32) -> Self {
        Location {
            name: name.into(),
            line,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.line)
    }
}

// ── Payload errors ───────────────────────────────────────────────────

/// What went wrong inside a payload body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum RuntimeErrorKind {
    /// An ordinary failure raised by the modelled program.
    Failure,
    /// A value was read before its initializer ran. Retried during init.
    NotYetVisible,
    /// Misuse of the scheduler (unknown object, missing bus link, panic).
    Internal,
}

/// A genuine payload failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}{}", .location.as_ref().map(|l| format!(" at {}", l)).unwrap_or_default())]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub location: Option<Location>,
}

impl RuntimeError {
    pub fn failure(message: impl Into<String>) -> Self {
        RuntimeError {
            kind: RuntimeErrorKind::Failure,
            message: message.into(),
            location: None,
        }
    }

    pub fn not_yet_visible(message: impl Into<String>) -> Self {
        RuntimeError {
            kind: RuntimeErrorKind::NotYetVisible,
            message: message.into(),
            location: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RuntimeError {
            kind: RuntimeErrorKind::Internal,
            message: message.into(),
            location: None,
        }
    }

    /// Attach a location unless one is already present.
    pub fn at(mut self, location: Location) -> Self {
        if self.location.is_none() {
            self.location = Some(location);
        }
        self
    }
}

/// The error channel of payload bodies and suspension points.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    /// The context was told to unwind; propagate with `?` and do nothing else.
    #[error("context unwound by {0} signal")]
    Unwind(Signal),

    /// A payload failure.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ExecError {
    pub fn failure(message: impl Into<String>) -> Self {
        ExecError::Runtime(RuntimeError::failure(message))
    }

    pub fn is_unwind(&self) -> bool {
        matches!(self, ExecError::Unwind(_))
    }
}

/// Result type of payload bodies and suspension points.
pub type ExecResult<T> = Result<T, ExecError>;

// ── Run-level errors ─────────────────────────────────────────────────

/// The top-level error type of a scheduler run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedError {
    /// No resource could make progress and no timer was pending.
    #[error("DEADLOCK detected at {time}")]
    Deadlock { time: VirtualTime },

    /// A payload body failed; `resource` names where it was running.
    #[error("{thread} on {resource} failed: {error}")]
    PayloadFailure {
        thread: ThreadId,
        resource: String,
        #[source]
        error: RuntimeError,
    },

    /// Global initialization could not complete.
    #[error("initialization failed: {0}")]
    InitFailure(RuntimeError),

    /// The distinguished context unwound without a deadlock or failure.
    #[error("main context unwound by {0} signal")]
    Unwound(Signal),

    /// A context was used on a resource of the wrong kind.
    #[error("{thread} requires a {expected} resource")]
    WrongResource {
        thread: ThreadId,
        expected: &'static str,
    },

    #[error("unknown CPU {0}")]
    UnknownCpu(CpuId),

    #[error("unknown bus {0}")]
    UnknownBus(BusId),

    #[error("unknown object {0}")]
    UnknownObject(ObjectRef),

    /// Two CPUs that must exchange a message share no bus.
    #[error("no bus connects {from} and {to}")]
    NoRoute { from: CpuId, to: CpuId },

    #[error("unknown class {0}")]
    UnknownClass(String),

    /// `start` was called twice on the same context.
    #[error("{0} was already started")]
    AlreadyStarted(ThreadId),

    /// A topology or settings problem found at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The native thread backing a context could not be created.
    #[error("failed to spawn native thread: {0}")]
    Spawn(String),
}

impl From<SchedError> for ExecError {
    fn from(e: SchedError) -> Self {
        ExecError::Runtime(RuntimeError::internal(e.to_string()))
    }
}

/// Convenience alias for `Result<T, SchedError>`.
pub type SchedResult<T> = Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_display() {
        let e = SchedError::Deadlock {
            time: VirtualTime::new(40),
        };
        assert_eq!(e.to_string(), "DEADLOCK detected at T=40");
    }

    #[test]
    fn test_runtime_error_location() {
        let e = RuntimeError::failure("division by zero").at(Location::new("A`op", 12));
        assert_eq!(e.to_string(), "division by zero at A`op:12");
        // A second location does not overwrite the first.
        let e = e.at(Location::new("B`other", 3));
        assert_eq!(e.location, Some(Location::new("A`op", 12)));
    }

    #[test]
    fn test_payload_failure_display() {
        let e = SchedError::PayloadFailure {
            thread: ThreadId::new(4),
            resource: "cpu1".into(),
            error: RuntimeError::failure("boom"),
        };
        assert_eq!(e.to_string(), "T4 on cpu1 failed: boom");
    }

    #[test]
    fn test_exec_error_from_runtime() {
        let e: ExecError = RuntimeError::internal("bad").into();
        assert!(!e.is_unwind());
        assert!(ExecError::Unwind(Signal::Terminate).is_unwind());
    }

    #[test]
    fn test_error_is_std_error() {
        let e: Box<dyn std::error::Error> = Box::new(SchedError::UnknownCpu(CpuId::new(9)));
        assert_eq!(e.to_string(), "unknown CPU CPU9");
    }
}
