/// Processing resource.
///
/// A CPU swaps exactly one context in at a time and grants it slices
/// through `runslice`. While the swapped-in context is in TIMESTEP the
/// CPU is busy for that long and nothing else may run on it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;

use crate::config::{CpuConfig, PolicyKind, RtSettings};
use crate::event::RtEvent;
use crate::ids::{CpuId, ResourceId, ThreadId};
use crate::policy::{FcfsPolicy, FixedPriorityPolicy, SchedulingPolicy};
use crate::simulation::SimulationState;
use crate::thread::sync::lock_or_recover;
use crate::thread::{ExecutionContext, RunState, Signal};
use crate::time::VirtualTime;

use super::{MinimumTimestep, Resource};

const NANOS_PER_SEC: u128 = 1_000_000_000;

pub struct CpuResource {
    id: CpuId,
    name: String,
    speed_hz: u64,
    policy_kind: PolicyKind,
    policy: Mutex<Box<dyn SchedulingPolicy>>,
    swapped_in: Mutex<Option<Arc<ExecutionContext>>>,
    /// Per-operation priorities, keyed by "Class`op".
    priorities: BTreeMap<String, u64>,
}

impl CpuResource {
    /// A configured CPU. Jitter is seeded from the run seed mixed with the
    /// CPU number, so each CPU draws its own reproducible sequence.
    pub fn new(id: CpuId, config: &CpuConfig, settings: &RtSettings) -> Self {
        let policy: Box<dyn SchedulingPolicy> = match config.policy {
            PolicyKind::Fcfs => Box::new(FcfsPolicy::new(settings.fcfs_timeslice)),
            PolicyKind::FixedPriority => Box::new(FixedPriorityPolicy::new(
                settings.fcfs_timeslice,
                settings.jitter,
                settings.seed ^ id.raw().wrapping_mul(0x9E37_79B9_7F4A_7C15),
            )),
        };
        CpuResource {
            id,
            name: config.name.clone(),
            speed_hz: config.speed_hz,
            policy_kind: config.policy,
            policy: Mutex::new(policy),
            swapped_in: Mutex::new(None),
            priorities: BTreeMap::new(),
        }
    }

    /// The zero-overhead CPU hosting system contexts.
    pub fn virtual_cpu(settings: &RtSettings) -> Self {
        CpuResource {
            id: CpuId::VIRTUAL,
            name: "vCPU".to_string(),
            speed_hz: 0,
            policy_kind: PolicyKind::Fcfs,
            policy: Mutex::new(Box::new(FcfsPolicy::new(settings.virtual_timeslice))),
            swapped_in: Mutex::new(None),
            priorities: BTreeMap::new(),
        }
    }

    pub fn with_priorities(mut self, priorities: BTreeMap<String, u64>) -> Self {
        self.priorities = priorities;
        self
    }

    pub fn cpu_id(&self) -> CpuId {
        self.id
    }

    pub fn speed_hz(&self) -> u64 {
        self.speed_hz
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.policy_kind
    }

    /// Virtual time taken by `cycles` instruction cycles. Zero on the
    /// virtual CPU.
    pub fn cycles_duration(&self, cycles: u64) -> u64 {
        if self.id.is_virtual() || self.speed_hz == 0 {
            return 0;
        }
        let ticks = cycles as u128 * NANOS_PER_SEC / self.speed_hz as u128;
        ticks.min(u64::MAX as u128) as u64
    }

    /// Priority for a context running `op` of `class` here; 0 if unset.
    pub fn priority_of(&self, class: &str, op: &str) -> u64 {
        self.priorities
            .get(&format!("{}`{}", class, op))
            .copied()
            .unwrap_or(0)
    }

    /// The context currently holding this CPU.
    pub fn swapped_in(&self) -> Option<ThreadId> {
        self.current().as_ref().map(|c| c.id())
    }

    pub fn has_priorities(&self) -> bool {
        self.policy().has_priorities()
    }

    fn policy(&self) -> MutexGuard<'_, Box<dyn SchedulingPolicy>> {
        lock_or_recover(&self.policy)
    }

    fn current(&self) -> Option<Arc<ExecutionContext>> {
        lock_or_recover(&self.swapped_in).clone()
    }

    /// The swapped-in context completed: swap it out and log its death.
    fn retire(&self, sim: &SimulationState, ctx: &ExecutionContext) {
        sim.log(RtEvent::ThreadSwapOut {
            thread: ctx.tag(),
            cpu: self.id,
            overhead: 0,
        });
        sim.log(RtEvent::ThreadKill {
            id: ctx.id(),
            cpu: self.id,
        });
        *lock_or_recover(&self.swapped_in) = None;
    }

    /// Ask the policy for the context of the next slice.
    fn select(&self) -> Option<(Arc<ExecutionContext>, u64)> {
        let mut policy = self.policy();
        if !policy.reschedule() {
            return None;
        }
        let slice = policy.timeslice();
        policy.thread().map(|t| (t, slice))
    }
}

impl Resource for CpuResource {
    fn id(&self) -> ResourceId {
        ResourceId::Cpu(self.id)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, ctx: Arc<ExecutionContext>, priority: u64) {
        self.policy().register(ctx, priority);
    }

    fn unregister(&self, id: ThreadId) {
        self.policy().unregister(id);
    }

    fn reschedule(&self, sim: &SimulationState) -> bool {
        if let Some(cur) = self.current() {
            match cur.state() {
                RunState::Timestep => return false,
                RunState::Complete => self.retire(sim, &cur),
                _ => {}
            }
        }

        let current = self.current();
        let Some((best, slice)) = self.select() else {
            return false;
        };

        let deadline = best.take_swap_in_by();
        if current.as_ref().map(|c| c.id()) != Some(best.id()) {
            if let Some(old) = &current {
                sim.log(RtEvent::ThreadSwapOut {
                    thread: old.tag(),
                    cpu: self.id,
                    overhead: 0,
                });
            }
            let now = sim.clock.now();
            let delay = deadline
                .and_then(|d| now.duration_since(d))
                .filter(|d| *d > 0);
            match delay {
                Some(delay) => sim.log(RtEvent::DelayedThreadSwapIn {
                    thread: best.tag(),
                    delay,
                    cpu: self.id,
                    overhead: 0,
                }),
                None => sim.log(RtEvent::ThreadSwapIn {
                    thread: best.tag(),
                    cpu: self.id,
                    overhead: 0,
                }),
            }
            // A context swapped back in starts a fresh slice.
            best.reset_steps();
            *lock_or_recover(&self.swapped_in) = Some(Arc::clone(&best));
        }

        trace!("{} runs {} for {} steps", self.name, best.id(), slice);
        best.runslice(slice);

        match best.state() {
            RunState::Complete => {
                self.retire(sim, &best);
                true
            }
            RunState::Timestep => false,
            _ => true,
        }
    }

    fn minimum_timestep(&self, now: VirtualTime) -> MinimumTimestep {
        if self
            .current()
            .is_some_and(|c| c.state() == RunState::Running)
        {
            return MinimumTimestep::Busy;
        }
        self.policy().time_to_next_alarm(now).into()
    }

    fn advance(&self, now: VirtualTime) {
        self.policy().advance(now);
    }

    fn signal_all(&self, signal: Signal) {
        let threads = self.policy().threads();
        for t in threads {
            t.set_signal(signal);
        }
    }

    fn thread_count(&self) -> usize {
        self.policy().threads().len()
    }

    fn status(&self) -> String {
        let running = self
            .swapped_in()
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        format!(
            "{} {} ({} Hz) swapped-in={} {}",
            self.id,
            self.name,
            self.speed_hz,
            running,
            self.policy().status()
        )
    }

    fn reset(&self) {
        self.policy().reset();
        *lock_or_recover(&self.swapped_in) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(speed: u64) -> CpuResource {
        CpuResource::new(
            CpuId::new(1),
            &CpuConfig::new("cpu1", speed, PolicyKind::Fcfs),
            &RtSettings::default(),
        )
    }

    #[test]
    fn test_cycles_duration() {
        assert_eq!(cpu(1_000_000_000).cycles_duration(2), 2);
        assert_eq!(cpu(1_000_000).cycles_duration(3), 3_000);
        assert_eq!(cpu(3).cycles_duration(1), 333_333_333);
    }

    #[test]
    fn test_virtual_cpu_is_free() {
        let v = CpuResource::virtual_cpu(&RtSettings::default());
        assert_eq!(v.cycles_duration(1_000_000), 0);
        assert_eq!(v.name(), "vCPU");
    }

    #[test]
    fn test_priority_lookup() {
        let mut prios = BTreeMap::new();
        prios.insert("Sensor`read".to_string(), 7);
        let c = cpu(1_000_000).with_priorities(prios);
        assert_eq!(c.priority_of("Sensor", "read"), 7);
        assert_eq!(c.priority_of("Sensor", "write"), 0);
    }

    #[test]
    fn test_idle_cpu() {
        let c = cpu(1_000_000);
        assert_eq!(c.minimum_timestep(VirtualTime::ZERO), MinimumTimestep::Never);
        assert_eq!(c.thread_count(), 0);
        assert!(c.status().contains("swapped-in=-"));
    }
}
