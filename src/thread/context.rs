//! `ExecutionContext`: one schedulable logical thread.
//!
//! Every context is backed by a native thread that is parked on the
//! context's condition variable except while the owning resource has
//! granted it a slice. The scheduler side (`runslice`) and the context
//! side (`suspend_until_running`) rendezvous through `RunState` changes
//! made under the context lock:
//!
//! ```text
//!   scheduler                         context thread
//!   ─────────                         ──────────────
//!   runslice(n)
//!     state = RUNNING, notify   ──►   wakes in suspend_until_running
//!     wait while RUNNING              runs until step()/duration()/...
//!                               ◄──   state = RUNNABLE|TIMESTEP|..., notify
//!   returns                           waits while != RUNNING
//! ```
//!
//! At most one of the two sides is ever unparked, which is what keeps a
//! resource down to a single active context.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use log::{debug, trace};

use crate::error::{ExecError, ExecResult, Location, SchedError, SchedResult};
use crate::event::{RtEvent, ThreadTag};
use crate::ids::{ObjectRef, ResourceId, ThreadId};
use crate::simulation::SimulationState;
use crate::time::VirtualTime;
use crate::value::Value;

use super::payload::{self, ThreadPayload};
use super::state::{PayloadKind, RunState, Signal};
use super::sync::{lock_or_recover, wait_or_recover};

/// Mutable part of a context, guarded by the context lock.
#[derive(Debug)]
struct ContextInner {
    state: RunState,
    signal: Option<Signal>,
    /// Set once the context must unwind at its next scheduling opportunity.
    stopping: bool,
    /// Set by SUSPEND, cleared by `resume`. Policies skip the context.
    suspended: bool,
    steps: u64,
    timeslice: u64,
    /// Absolute end of the current TIMESTEP.
    timestep_end: Option<VirtualTime>,
    /// Absolute wake time of the current ALARM.
    alarm_wake: Option<VirtualTime>,
    /// The context should have been swapped in by this time.
    swap_in_by: Option<VirtualTime>,
    /// Depth of nested `cycles`/`duration` blocks.
    outer_timestep: u32,
    location: Option<Location>,
    outcome: Option<ExecResult<Value>>,
}

/// A schedulable logical thread of the modelled system.
#[derive(Debug)]
pub struct ExecutionContext {
    id: ThreadId,
    resource: ResourceId,
    objref: Option<ObjectRef>,
    clnm: Option<String>,
    kind: PayloadKind,
    periodic: bool,
    inner: Mutex<ContextInner>,
    cond: Condvar,
}

impl ExecutionContext {
    pub(crate) fn new(
        id: ThreadId,
        resource: ResourceId,
        objref: Option<ObjectRef>,
        clnm: Option<String>,
        kind: PayloadKind,
        periodic: bool,
    ) -> Self {
        ExecutionContext {
            id,
            resource,
            objref,
            clnm,
            kind,
            periodic,
            inner: Mutex::new(ContextInner {
                state: RunState::Created,
                signal: None,
                stopping: false,
                suspended: false,
                steps: 0,
                timeslice: 0,
                timestep_end: None,
                alarm_wake: None,
                swap_in_by: None,
                outer_timestep: 0,
                location: None,
                outcome: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Create a context for `payload`, register it with `resource`, and
    /// start its native thread.
    ///
    /// Returns once the native thread is parked and the context is
    /// RUNNABLE. Bus payloads must live on a bus; everything else on a CPU.
    pub fn spawn(
        sim: &Arc<SimulationState>,
        resource: ResourceId,
        objref: Option<ObjectRef>,
        clnm: Option<String>,
        payload: ThreadPayload,
        priority: u64,
    ) -> SchedResult<Arc<ExecutionContext>> {
        let id = ThreadId::new(sim.threads.next_raw());
        let kind = payload.kind();
        match (kind, resource) {
            (PayloadKind::Bus, ResourceId::Bus(_)) => {}
            (PayloadKind::Bus, ResourceId::Cpu(_)) => {
                return Err(SchedError::WrongResource {
                    thread: id,
                    expected: "bus",
                })
            }
            (_, ResourceId::Bus(_)) => {
                return Err(SchedError::WrongResource {
                    thread: id,
                    expected: "CPU",
                })
            }
            _ => {}
        }

        let ctx = Arc::new(ExecutionContext::new(
            id,
            resource,
            objref,
            clnm,
            kind,
            payload.is_periodic(),
        ));
        sim.topology.resource(resource)?.register(ctx.clone(), priority);
        sim.add_context(ctx.clone());

        if let Err(e) = ctx.start(sim, payload) {
            sim.forget_context(&ctx);
            return Err(e);
        }
        Ok(ctx)
    }

    /// Spawn the native thread and wait until it has parked itself.
    fn start(self: &Arc<Self>, sim: &Arc<SimulationState>, payload: ThreadPayload) -> SchedResult<()> {
        if self.state() != RunState::Created {
            return Err(SchedError::AlreadyStarted(self.id));
        }

        let thread_sim = Arc::clone(sim);
        let thread_ctx = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("rtsched-{}", self.id))
            .spawn(move || payload::thread_main(thread_sim, thread_ctx, payload))
            .map_err(|e| SchedError::Spawn(e.to_string()))?;
        sim.add_handle(handle);

        let mut inner = self.lock();
        while inner.state == RunState::Created {
            inner = wait_or_recover(&self.cond, inner);
        }
        drop(inner);

        if let ResourceId::Cpu(cpu) = self.resource {
            sim.log(RtEvent::ThreadCreate {
                thread: self.tag(),
                period: self.periodic,
                cpu,
            });
        }
        debug!("{} started on {}", self.id, self.resource);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ContextInner> {
        lock_or_recover(&self.inner)
    }

    // ── Identity ──────────────────────────────────────────────────

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn objref(&self) -> Option<ObjectRef> {
        self.objref
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    /// Identity as it appears in swap records.
    pub fn tag(&self) -> ThreadTag {
        ThreadTag {
            id: self.id,
            objref: self.objref,
            clnm: self.clnm.clone(),
        }
    }

    // ── State ─────────────────────────────────────────────────────

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    pub fn is_complete(&self) -> bool {
        self.state() == RunState::Complete
    }

    /// Steps executed in the current slice.
    pub fn steps(&self) -> u64 {
        self.lock().steps
    }

    /// Slice granted by the last `runslice`.
    pub fn timeslice(&self) -> u64 {
        self.lock().timeslice
    }

    /// The wake-up time while in ALARM or TIMESTEP, otherwise `None`.
    pub fn wake_time(&self) -> Option<VirtualTime> {
        let inner = self.lock();
        match inner.state {
            RunState::Alarm => inner.alarm_wake,
            RunState::Timestep => inner.timestep_end,
            _ => None,
        }
    }

    /// Last location reported through `step`.
    pub fn location(&self) -> Option<Location> {
        self.lock().location.clone()
    }

    // ── Scheduler side ────────────────────────────────────────────

    /// Grant a slice of `slice` steps and block until the context yields
    /// or completes.
    pub fn runslice(&self, slice: u64) {
        let mut inner = self.lock();
        if inner.state == RunState::Complete {
            return;
        }
        inner.timeslice = slice;
        inner.state = RunState::Running;
        trace!("{} granted slice {}", self.id, slice);
        self.cond.notify_all();
        while inner.state == RunState::Running {
            inner = wait_or_recover(&self.cond, inner);
        }
    }

    /// Post an asynchronous signal. The context reacts at its next safe
    /// point; a parked context is woken to do so.
    ///
    /// SUSPEND takes effect at once: policies stop selecting the context
    /// until `resume` is called.
    pub fn set_signal(&self, signal: Signal) {
        let mut inner = self.lock();
        if inner.state == RunState::Complete {
            return;
        }
        match signal {
            Signal::Suspend => inner.suspended = true,
            sig => inner.signal = Some(sig),
        }
        self.cond.notify_all();
    }

    /// Lift a SUSPEND. Returns `false` if the context was not suspended.
    pub fn resume(&self) -> bool {
        let mut inner = self.lock();
        if !inner.suspended {
            return false;
        }
        inner.suspended = false;
        self.cond.notify_all();
        true
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// RUNNABLE and not suspended: what a policy may select.
    pub fn is_selectable(&self) -> bool {
        let inner = self.lock();
        inner.state == RunState::Runnable && !inner.suspended
    }

    /// Mark the context to unwind at its next scheduling opportunity.
    ///
    /// Returns `true` the first time and `false` on every later call.
    pub fn stop_thread(&self) -> bool {
        let mut inner = self.lock();
        if inner.stopping {
            return false;
        }
        inner.stopping = true;
        true
    }

    /// Release a context blocked on a control queue.
    pub fn release(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_blocked_on_sync() {
            inner.state = RunState::Runnable;
            true
        } else {
            false
        }
    }

    /// Make an ALARM or TIMESTEP context runnable if its time has come.
    pub fn wake_if_due(&self, now: VirtualTime) -> bool {
        let mut inner = self.lock();
        let due = match inner.state {
            RunState::Alarm => inner.alarm_wake.map_or(true, |t| t <= now),
            RunState::Timestep => inner.timestep_end.map_or(true, |t| t <= now),
            _ => false,
        };
        if due {
            if inner.state == RunState::Alarm {
                inner.alarm_wake = None;
            }
            inner.state = RunState::Runnable;
        }
        due
    }

    /// Consume the swap-in deadline, if one is set.
    pub fn take_swap_in_by(&self) -> Option<VirtualTime> {
        self.lock().swap_in_by.take()
    }

    /// Block until the context has reached COMPLETE.
    pub fn wait_complete(&self) {
        let mut inner = self.lock();
        while inner.state != RunState::Complete {
            inner = wait_or_recover(&self.cond, inner);
        }
    }

    /// Take the body's result once the context has completed.
    pub fn take_outcome(&self) -> Option<ExecResult<Value>> {
        self.lock().outcome.take()
    }

    // ── Context side ──────────────────────────────────────────────

    /// Enter `new_state` and park until granted RUNNING again.
    ///
    /// Signals are handled while parked: TERMINATE and DEADLOCKED unwind.
    /// A grant that reaches a suspended context bounces straight back as
    /// RUNNABLE; policies do not select suspended contexts.
    pub(crate) fn suspend_until_running(&self, new_state: RunState) -> ExecResult<()> {
        let mut inner = self.lock();
        inner.state = new_state;
        self.cond.notify_all();
        loop {
            Self::take_signal(&mut inner)?;
            if inner.state == RunState::Running {
                if !inner.suspended {
                    return Ok(());
                }
                inner.state = RunState::Runnable;
                self.cond.notify_all();
            }
            inner = wait_or_recover(&self.cond, inner);
        }
    }

    /// Handle a pending signal at a step boundary.
    pub(crate) fn check_signals(&self) -> ExecResult<()> {
        let suspended = {
            let mut inner = self.lock();
            Self::take_signal(&mut inner)?;
            inner.suspended
        };
        if suspended {
            self.suspend_until_running(RunState::Runnable)?;
        }
        Ok(())
    }

    fn take_signal(inner: &mut ContextInner) -> ExecResult<()> {
        // Only TERMINATE and DEADLOCKED are ever queued here.
        if let Some(sig) = inner.signal.take() {
            inner.stopping = true;
            return Err(ExecError::Unwind(sig));
        }
        if inner.stopping {
            return Err(ExecError::Unwind(Signal::Terminate));
        }
        Ok(())
    }

    /// Count one step and return the new total for this slice.
    pub(crate) fn count_step(&self, location: Location) -> u64 {
        let mut inner = self.lock();
        inner.location = Some(location);
        inner.steps += 1;
        inner.steps
    }

    /// Whether the slice budget is used up. Never inside a timed block.
    pub(crate) fn slice_exhausted(&self) -> bool {
        let inner = self.lock();
        inner.outer_timestep == 0 && inner.steps >= inner.timeslice
    }

    pub(crate) fn reset_steps(&self) {
        self.lock().steps = 0;
    }

    pub(crate) fn in_outer_timestep(&self) -> bool {
        self.lock().outer_timestep > 0
    }

    pub(crate) fn enter_outer_timestep(&self) {
        self.lock().outer_timestep += 1;
    }

    pub(crate) fn exit_outer_timestep(&self) {
        let mut inner = self.lock();
        inner.outer_timestep = inner.outer_timestep.saturating_sub(1);
    }

    pub(crate) fn set_timestep_end(&self, end: Option<VirtualTime>) {
        self.lock().timestep_end = end;
    }

    pub(crate) fn set_alarm(&self, wake_at: VirtualTime) {
        let mut inner = self.lock();
        inner.alarm_wake = Some(wake_at);
        inner.swap_in_by = Some(wake_at);
    }

    /// Record the outcome and enter COMPLETE. Wakes a waiting `runslice`.
    pub(crate) fn complete(&self, outcome: ExecResult<Value>) {
        let mut inner = self.lock();
        inner.outcome = Some(outcome);
        inner.state = RunState::Complete;
        inner.timestep_end = None;
        inner.alarm_wake = None;
        self.cond.notify_all();
    }

    /// Force a state without any rendezvous. Only for driving policies in
    /// tests without native threads.
    #[cfg(test)]
    pub(crate) fn force_state(&self, state: RunState) {
        self.lock().state = state;
    }

    #[cfg(test)]
    pub(crate) fn force_wake(&self, state: RunState, at: VirtualTime) {
        let mut inner = self.lock();
        inner.state = state;
        match state {
            RunState::Alarm => inner.alarm_wake = Some(at),
            _ => inner.timestep_end = Some(at),
        }
    }
}
