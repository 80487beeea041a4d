//! `ThreadScope`: what a payload body sees of the scheduler.
//!
//! Every suspension point a body can reach goes through here, and each
//! returns `ExecResult` so an unwind signal propagates with `?`.

use std::sync::Arc;

use log::trace;

use crate::error::{ExecError, ExecResult, Location, SchedError};
use crate::event::RtEvent;
use crate::ids::{CpuId, ObjectRef, ResourceId, ThreadId};
use crate::resource::{RequestPacket, ResponseCell};
use crate::simulation::SimulationState;
use crate::time::VirtualTime;
use crate::value::Value;

use super::context::ExecutionContext;
use super::payload::ObjectCall;
use super::state::RunState;

/// Handle passed to every payload body.
pub struct ThreadScope {
    sim: Arc<SimulationState>,
    ctx: Arc<ExecutionContext>,
}

impl ThreadScope {
    pub(crate) fn new(sim: Arc<SimulationState>, ctx: Arc<ExecutionContext>) -> Self {
        ThreadScope { sim, ctx }
    }

    pub fn id(&self) -> ThreadId {
        self.ctx.id()
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    pub fn simulation(&self) -> &Arc<SimulationState> {
        &self.sim
    }

    /// Current virtual time.
    pub fn now(&self) -> VirtualTime {
        self.sim.clock.now()
    }

    /// The CPU this context runs on.
    pub fn cpu(&self) -> ExecResult<CpuId> {
        match self.ctx.resource() {
            ResourceId::Cpu(cpu) => Ok(cpu),
            ResourceId::Bus(_) => Err(SchedError::WrongResource {
                thread: self.id(),
                expected: "CPU",
            }
            .into()),
        }
    }

    // ── Time ──────────────────────────────────────────────────────

    /// Reach a step boundary.
    ///
    /// Charges one step of simulated time and yields once the slice
    /// budget is used up, unless inside a timed block.
    ///
    /// In real-time mode a step on a real CPU costs `step_cycles` and
    /// waits them out in TIMESTEP. Otherwise the clock moves by
    /// `nominal_step` right here, logged as its own `TimeAdvance`.
    pub fn step(&self, location: Location) -> ExecResult<()> {
        self.ctx.check_signals()?;
        self.ctx.count_step(location);

        let settings = &self.sim.settings;
        if settings.realtime {
            if let ResourceId::Cpu(cpu) = self.ctx.resource() {
                if !cpu.is_virtual() {
                    let pause = self.sim.topology.cpu(cpu)?.cycles_duration(settings.step_cycles);
                    self.duration(pause)?;
                }
            }
        } else if settings.nominal_step > 0 {
            self.sim.clock.advance(settings.nominal_step);
            self.sim.log(RtEvent::TimeAdvance {
                delta: settings.nominal_step,
            });
        }

        if self.ctx.slice_exhausted() {
            self.ctx.reset_steps();
            trace!("{} slice exhausted", self.id());
            self.ctx.suspend_until_running(RunState::Runnable)?;
        }
        Ok(())
    }

    /// Give up the rest of the slice.
    pub fn yield_now(&self) -> ExecResult<()> {
        self.ctx.reset_steps();
        self.ctx.suspend_until_running(RunState::Runnable)
    }

    /// Block in TIMESTEP until `pause` ticks have passed.
    ///
    /// The resource scheduler may wake the context early to re-check, so
    /// the remaining time is recomputed from the clock on every wake.
    /// A no-op inside a timed block, which charges its time at the end.
    pub fn duration(&self, pause: u64) -> ExecResult<()> {
        if pause == 0 || self.ctx.in_outer_timestep() {
            return Ok(());
        }
        let end = self.now().plus(pause);
        loop {
            self.ctx.set_timestep_end(Some(end));
            self.ctx.suspend_until_running(RunState::Timestep)?;
            let remaining = end.duration_since(self.now()).unwrap_or(0);
            if remaining == 0 {
                break;
            }
        }
        self.ctx.set_timestep_end(None);
        Ok(())
    }

    /// Block in ALARM until the clock reaches `wake_at`.
    pub fn alarm(&self, wake_at: VirtualTime) -> ExecResult<()> {
        if wake_at <= self.now() {
            return Ok(());
        }
        self.ctx.set_alarm(wake_at);
        self.ctx.suspend_until_running(RunState::Alarm)
    }

    /// Run `f` as one uninterruptible block, then charge `n` cycles of
    /// this CPU's time.
    pub fn cycles<T, F>(&self, n: u64, f: F) -> ExecResult<T>
    where
        F: FnOnce(&ThreadScope) -> ExecResult<T>,
    {
        let pause = self.sim.topology.cpu(self.cpu()?)?.cycles_duration(n);
        self.timed_block(pause, f)
    }

    /// Run `f` as one uninterruptible block, then charge `pause` ticks.
    pub fn duration_block<T, F>(&self, pause: u64, f: F) -> ExecResult<T>
    where
        F: FnOnce(&ThreadScope) -> ExecResult<T>,
    {
        self.timed_block(pause, f)
    }

    fn timed_block<T, F>(&self, pause: u64, f: F) -> ExecResult<T>
    where
        F: FnOnce(&ThreadScope) -> ExecResult<T>,
    {
        self.ctx.enter_outer_timestep();
        let result = f(self);
        self.ctx.exit_outer_timestep();
        let value = result?;
        self.duration(pause)?;
        Ok(value)
    }

    // ── Calls ─────────────────────────────────────────────────────

    /// Call `op` on `target` and wait for its result.
    ///
    /// A co-resident target runs inline in this context. Otherwise the
    /// request crosses the linking bus, a new context runs the operation
    /// on the target's CPU, and this context waits for the response. A
    /// remote failure is raised here.
    pub fn call(&self, target: ObjectRef, op: &str, args: Vec<Value>) -> ExecResult<Value> {
        let topology = &self.sim.topology;
        let object = topology.object(target)?;
        let operation = object.operation(op)?;
        let here = self.cpu()?;

        if object.cpu == here {
            trace!("{} calls {}`{} inline", self.id(), object.class_name(), op);
            return operation(self, &args);
        }

        let bus = topology.bus_between(here, object.cpu)?;
        let cell = ResponseCell::new();
        let request = RequestPacket {
            id: self.sim.next_message_id(),
            bus,
            from: here,
            to: object.cpu,
            caller: self.id(),
            target,
            operation: op.to_string(),
            args,
            reply: Some(Arc::clone(&cell)),
        };
        topology.bus(bus)?.transmit(&self.sim, request);

        let response = cell.wait(self)?;
        response.map_err(ExecError::Runtime)
    }

    /// Start `call` as a new context on its object's CPU. No message is
    /// sent; this is how periodic threads are started.
    pub fn start(&self, call: ObjectCall) -> ExecResult<ThreadId> {
        let ctx = self.sim.topology.spawn_object_thread(&self.sim, call)?;
        Ok(ctx.id())
    }

    /// Start `op` on `target` in a new context without waiting.
    pub fn call_async(&self, target: ObjectRef, op: &str, args: Vec<Value>) -> ExecResult<()> {
        let topology = &self.sim.topology;
        let object = topology.object(target)?;
        object.operation(op)?;
        let here = self.cpu()?;

        if object.cpu == here {
            let call = ObjectCall::new(target, op, args);
            topology.spawn_object_thread(&self.sim, call)?;
            return Ok(());
        }

        let bus = topology.bus_between(here, object.cpu)?;
        let request = RequestPacket {
            id: self.sim.next_message_id(),
            bus,
            from: here,
            to: object.cpu,
            caller: self.id(),
            target,
            operation: op.to_string(),
            args,
            reply: None,
        };
        topology.bus(bus)?.transmit(&self.sim, request);
        Ok(())
    }
}
