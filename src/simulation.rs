/// Shared state of one simulation run.
///
/// Everything a context or resource needs to reach the rest of the run
/// lives here: the clock, the id generators, the topology, the log sink,
/// the registry of live contexts and the fatal-failure slot. It is
/// shared as `Arc<SimulationState>` by the scheduler and every
/// `ThreadScope`; contexts themselves never hold it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::config::RtSettings;
use crate::error::RuntimeError;
use crate::event::RtEvent;
use crate::eventlog::LogSink;
use crate::ids::{IdGen, MessageId, ResourceId, ThreadId};
use crate::resource::Topology;
use crate::thread::sync::lock_or_recover;
use crate::thread::{ExecutionContext, Signal};
use crate::time::VirtualClock;

/// The first failure of a context that had no caller to report to.
#[derive(Debug, Clone, PartialEq)]
pub struct Fatal {
    pub thread: ThreadId,
    /// Name of the resource it was running on.
    pub resource: String,
    pub error: RuntimeError,
}

pub struct SimulationState {
    pub clock: VirtualClock,
    pub threads: IdGen,
    pub messages: IdGen,
    pub settings: RtSettings,
    pub topology: Topology,
    sink: Arc<dyn LogSink>,
    contexts: Mutex<BTreeMap<ThreadId, Arc<ExecutionContext>>>,
    fatal: Mutex<Option<Fatal>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SimulationState {
    pub fn new(settings: RtSettings, topology: Topology, sink: Arc<dyn LogSink>) -> Self {
        SimulationState {
            clock: VirtualClock::new(),
            threads: IdGen::starting_at(1),
            messages: IdGen::starting_at(1),
            settings,
            topology,
            sink,
            contexts: Mutex::new(BTreeMap::new()),
            fatal: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Write one event stamped with the current time.
    pub fn log(&self, event: RtEvent) {
        self.sink.record(&event, self.clock.now());
    }

    pub fn next_message_id(&self) -> MessageId {
        MessageId::new(self.messages.next_raw())
    }

    // ── Context registry ──────────────────────────────────────────

    fn registry(&self) -> MutexGuard<'_, BTreeMap<ThreadId, Arc<ExecutionContext>>> {
        lock_or_recover(&self.contexts)
    }

    pub(crate) fn add_context(&self, ctx: Arc<ExecutionContext>) {
        self.registry().insert(ctx.id(), ctx);
    }

    pub(crate) fn remove_context(&self, id: ThreadId) {
        self.registry().remove(&id);
    }

    /// Undo a registration whose native thread never started.
    pub(crate) fn forget_context(&self, ctx: &ExecutionContext) {
        if let Ok(resource) = self.topology.resource(ctx.resource()) {
            resource.unregister(ctx.id());
        }
        self.remove_context(ctx.id());
    }

    /// Live contexts in id order.
    pub fn contexts(&self) -> Vec<Arc<ExecutionContext>> {
        self.registry().values().cloned().collect()
    }

    pub fn context_count(&self) -> usize {
        self.registry().len()
    }

    // ── Failures and signals ──────────────────────────────────────

    /// Remember a fatal failure. Only the first one is kept.
    pub(crate) fn record_fatal(&self, thread: ThreadId, resource: ResourceId, error: RuntimeError) {
        let mut slot = lock_or_recover(&self.fatal);
        if slot.is_some() {
            debug!("{} failed after the run was already failing: {}", thread, error);
            return;
        }
        *slot = Some(Fatal {
            thread,
            resource: self.topology.resource_name(resource),
            error,
        });
    }

    pub fn fatal(&self) -> Option<Fatal> {
        lock_or_recover(&self.fatal).clone()
    }

    pub fn has_fatal(&self) -> bool {
        lock_or_recover(&self.fatal).is_some()
    }

    pub fn take_fatal(&self) -> Option<Fatal> {
        lock_or_recover(&self.fatal).take()
    }

    /// Post SUSPEND to every live context except `except`.
    pub(crate) fn suspend_others(&self, except: ThreadId) {
        for ctx in self.contexts() {
            if ctx.id() != except {
                ctx.set_signal(Signal::Suspend);
            }
        }
    }

    /// Post `signal` to every live context.
    pub fn signal_all(&self, signal: Signal) {
        for ctx in self.contexts() {
            ctx.set_signal(signal);
        }
    }

    // ── Native threads ────────────────────────────────────────────

    pub(crate) fn add_handle(&self, handle: JoinHandle<()>) {
        lock_or_recover(&self.handles).push(handle);
    }

    /// Join every native thread started so far, including any started
    /// while joining.
    pub fn join_threads(&self) {
        loop {
            let handles: Vec<_> = lock_or_recover(&self.handles).drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    warn!("a context thread panicked outside its payload");
                }
            }
        }
    }

    /// Back to the state right after construction. Only valid once every
    /// context has completed and been joined.
    pub fn reset(&self) {
        self.clock.reset();
        self.threads.reset();
        self.messages.reset();
        self.registry().clear();
        *lock_or_recover(&self.fatal) = None;
        self.topology.reset();
        self.sink.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::eventlog::EventLog;
    use crate::ids::CpuId;

    fn state(log: Arc<EventLog>) -> SimulationState {
        let config = SystemConfig::default();
        let topology = Topology::from_config(&config, &BTreeMap::new(), Vec::new()).unwrap();
        SimulationState::new(config.settings, topology, log)
    }

    #[test]
    fn test_log_is_stamped_with_clock() {
        let log = Arc::new(EventLog::new());
        let sim = state(log.clone());
        sim.clock.advance(7);
        sim.log(RtEvent::TimeAdvance { delta: 7 });
        assert_eq!(log.lines(), vec!["TimeAdvance -> delta: 7 time: 7"]);
    }

    #[test]
    fn test_message_ids_increase() {
        let sim = state(Arc::new(EventLog::new()));
        assert_eq!(sim.next_message_id(), MessageId::new(1));
        assert_eq!(sim.next_message_id(), MessageId::new(2));
    }

    #[test]
    fn test_first_fatal_wins() {
        let sim = state(Arc::new(EventLog::new()));
        let cpu = ResourceId::Cpu(CpuId::VIRTUAL);
        sim.record_fatal(ThreadId::new(3), cpu, RuntimeError::failure("first"));
        sim.record_fatal(ThreadId::new(4), cpu, RuntimeError::failure("second"));
        let fatal = sim.fatal().unwrap();
        assert_eq!(fatal.thread, ThreadId::new(3));
        assert_eq!(fatal.resource, "vCPU");
        assert_eq!(fatal.error.message, "first");
        assert!(sim.take_fatal().is_some());
        assert!(!sim.has_fatal());
    }

    #[test]
    fn test_reset() {
        let log = Arc::new(EventLog::new());
        let sim = state(log.clone());
        sim.clock.advance(5);
        sim.threads.next_raw();
        sim.next_message_id();
        sim.log(RtEvent::TimeAdvance { delta: 5 });
        sim.record_fatal(ThreadId::new(1), ResourceId::Cpu(CpuId::VIRTUAL), RuntimeError::failure("x"));

        sim.reset();
        assert_eq!(sim.clock.now().ticks(), 0);
        assert_eq!(sim.threads.peek(), 1);
        assert_eq!(sim.next_message_id(), MessageId::new(1));
        assert!(!sim.has_fatal());
        assert!(log.is_empty());
        assert_eq!(sim.context_count(), 0);
    }
}
