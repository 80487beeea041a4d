/// The resource scheduler: top-level driver of a run.
///
/// Each round services every resource once, in registration order (CPUs
/// by id, then buses by id). When a whole round makes no progress the
/// clock moves forward by the smallest timestep any resource reports, and
/// if no resource can ever wake again the run is deadlocked.
///
/// The scheduler runs on the caller's native thread. Contexts only run
/// inside a resource's `runslice`, so at most one native thread executes
/// payload code at any moment.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{ExecError, SchedError, SchedResult};
use crate::event::RtEvent;
use crate::ids::{ResourceId, ThreadId};
use crate::resource::MinimumTimestep;
use crate::simulation::SimulationState;
use crate::thread::{ExecutionContext, PayloadKind, Signal, ThreadPayload};
use crate::value::Value;

pub struct ResourceScheduler {
    sim: Arc<SimulationState>,
}

impl ResourceScheduler {
    pub fn new(sim: Arc<SimulationState>) -> Self {
        ResourceScheduler { sim }
    }

    pub fn simulation(&self) -> &Arc<SimulationState> {
        &self.sim
    }

    /// Run until `main` completes, a fatal failure is recorded, or the
    /// system deadlocks.
    ///
    /// Every other context is terminated and joined before this returns,
    /// whatever the outcome.
    pub fn start(&self, main: &Arc<ExecutionContext>) -> SchedResult<Value> {
        info!("scheduler starting with {} as main", main.id());
        let outcome = self
            .spawn_bus_drivers()
            .and_then(|()| self.run_loop(main));
        self.shutdown();
        outcome?;
        self.result_of(main)
    }

    /// One driver context per bus.
    fn spawn_bus_drivers(&self) -> SchedResult<()> {
        for bus in self.sim.topology.buses() {
            ExecutionContext::spawn(
                &self.sim,
                ResourceId::Bus(bus.bus_id()),
                None,
                None,
                ThreadPayload::Bus(bus.bus_id()),
                0,
            )?;
        }
        Ok(())
    }

    fn run_loop(&self, main: &Arc<ExecutionContext>) -> SchedResult<()> {
        let resources = self.sim.topology.resources();
        loop {
            if self.sim.has_fatal() || main.is_complete() {
                return Ok(());
            }

            let mut progressed = false;
            for resource in &resources {
                if self.sim.has_fatal() {
                    return Ok(());
                }
                progressed |= resource.reschedule(&self.sim);
            }
            if progressed {
                continue;
            }

            let now = self.sim.clock.now();
            let step = resources
                .iter()
                .fold(MinimumTimestep::Never, |acc, r| acc.min(r.minimum_timestep(now)));
            match step {
                MinimumTimestep::Busy => continue,
                MinimumTimestep::After(delta) => {
                    let now = self.sim.clock.advance(delta);
                    if delta > 0 {
                        debug!("clock advanced by {} to {}", delta, now);
                        self.sim.log(RtEvent::TimeAdvance { delta });
                    }
                    for resource in &resources {
                        resource.advance(now);
                    }
                }
                MinimumTimestep::Never => {
                    warn!("DEADLOCK detected at {}", now);
                    self.sim.signal_all(Signal::Deadlocked);
                    main.wait_complete();
                    return Err(SchedError::Deadlock { time: now });
                }
            }
        }
    }

    /// Terminate whatever is still alive, join every native thread and
    /// clear per-run resource state.
    fn shutdown(&self) {
        let live = self.sim.context_count();
        if live > 0 {
            debug!("terminating {} remaining contexts", live);
        }
        self.sim.signal_all(Signal::Terminate);
        self.sim.join_threads();
        self.sim.topology.reset();
    }

    fn result_of(&self, main: &ExecutionContext) -> SchedResult<Value> {
        if let Some(fatal) = self.sim.take_fatal() {
            return Err(SchedError::PayloadFailure {
                thread: fatal.thread,
                resource: fatal.resource,
                error: fatal.error,
            });
        }
        match main.take_outcome() {
            Some(Ok(value)) => Ok(value),
            Some(Err(ExecError::Runtime(error))) if main.kind() == PayloadKind::Init => {
                Err(SchedError::InitFailure(error))
            }
            Some(Err(ExecError::Runtime(error))) => Err(SchedError::PayloadFailure {
                thread: main.id(),
                resource: self.sim.topology.resource_name(main.resource()),
                error,
            }),
            Some(Err(ExecError::Unwind(signal))) => Err(SchedError::Unwound(signal)),
            None => Err(SchedError::Unwound(Signal::Terminate)),
        }
    }

    /// One line per resource.
    pub fn status(&self) -> Vec<String> {
        self.sim
            .topology
            .resources()
            .iter()
            .map(|r| r.status())
            .collect()
    }

    /// The context currently swapped in on each CPU, in CPU order.
    pub fn swapped_in(&self) -> Vec<Option<ThreadId>> {
        self.sim.topology.cpus().iter().map(|c| c.swapped_in()).collect()
    }
}
