//! Run states and control signals of an execution context.

/// Where a context is in its lifecycle.
///
/// `Created → Runnable ⇄ Running → {Waiting, Locking, Alarm, Timestep}
/// → Runnable → … → Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum RunState {
    /// Registered, native thread not yet parked.
    Created,
    /// Eligible for selection by the policy.
    Runnable,
    /// Executing its slice.
    Running,
    /// Blocked on a control queue.
    Waiting,
    /// Blocked on a mutex.
    Locking,
    /// Blocked until an absolute wake time.
    Alarm,
    /// Blocked until a computed duration has elapsed.
    Timestep,
    /// Terminal.
    Complete,
}

impl RunState {
    /// States that a control queue may release back to `Runnable`.
    pub fn is_blocked_on_sync(self) -> bool {
        matches!(self, RunState::Waiting | RunState::Locking)
    }

    /// States that only the passage of time can release.
    pub fn is_timed(self) -> bool {
        matches!(self, RunState::Alarm | RunState::Timestep)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Created => "CREATED",
            RunState::Runnable => "RUNNABLE",
            RunState::Running => "RUNNING",
            RunState::Waiting => "WAITING",
            RunState::Locking => "LOCKING",
            RunState::Alarm => "ALARM",
            RunState::Timestep => "TIMESTEP",
            RunState::Complete => "COMPLETE",
        };
        write!(f, "{}", s)
    }
}

/// Asynchronous control request posted to a context from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Signal {
    /// Unwind to `Complete` at the next safe point.
    Terminate,
    /// Stop taking slices; another context failed.
    Suspend,
    /// Unwind after a global deadlock was reported.
    Deadlocked,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Signal::Terminate => "TERMINATE",
            Signal::Suspend => "SUSPEND",
            Signal::Deadlocked => "DEADLOCKED",
        };
        write!(f, "{}", s)
    }
}

/// Which payload variant a context runs. Kept on the context after the
/// payload itself has moved into the native thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Main,
    Init,
    Object,
    Bus,
}

impl PayloadKind {
    /// Main and Init own the run result; their failures are not fatal to
    /// other contexts, they simply end the run.
    pub fn owns_result(self) -> bool {
        matches!(self, PayloadKind::Main | PayloadKind::Init)
    }
}
