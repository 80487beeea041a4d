/// Fluent builder DSL for system setup and runs.
///
/// Hides the boilerplate of building a topology, deploying objects and
/// wiring a log sink, and gives a `System` facade that runs the init and
/// main contexts to completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use crate::config::{BusConfig, CpuConfig, PolicyKind, RtSettings, SystemConfig};
use crate::error::{ExecResult, SchedError, SchedResult};
use crate::eventlog::{EventLog, LogSink};
use crate::ids::{CpuId, ObjectRef, ResourceId};
use crate::resource::{ClassDef, Topology};
use crate::scheduler::ResourceScheduler;
use crate::simulation::SimulationState;
use crate::thread::{ExecutionContext, Initializer, ThreadPayload, ThreadScope};
use crate::time::VirtualTime;
use crate::value::Value;

// ── SystemBuilder ─────────────────────────────────────────────────────

/// Fluent builder for a `System`.
///
/// # Example
/// ```rust
/// use rtsched::dsl::SystemBuilder;
/// use rtsched::config::PolicyKind;
/// use rtsched::resource::ClassDef;
/// use rtsched::value::Value;
///
/// let system = SystemBuilder::new()
///     .cpu("cpu1", 1_000_000, PolicyKind::Fcfs)
///     .class(ClassDef::new("Sensor").operation("read", |_, _| Ok(Value::Int(7))))
///     .object("Sensor", "cpu1")
///     .build()
///     .unwrap();
/// let sensor = system.objects_of("Sensor")[0];
/// let value = system
///     .run_main(move |scope| scope.call(sensor, "read", vec![]))
///     .unwrap();
/// assert_eq!(value, Value::Int(7));
/// ```
pub struct SystemBuilder {
    config: SystemConfig,
    priorities: BTreeMap<String, BTreeMap<String, u64>>,
    classes: BTreeMap<String, Arc<ClassDef>>,
    objects: Vec<(String, String)>,
    initializers: Vec<Initializer>,
    sink: Option<Arc<dyn LogSink>>,
}

impl SystemBuilder {
    pub fn new() -> Self {
        SystemBuilder {
            config: SystemConfig::default(),
            priorities: BTreeMap::new(),
            classes: BTreeMap::new(),
            objects: Vec::new(),
            initializers: Vec::new(),
            sink: None,
        }
    }

    /// Start from a parsed or hand-built configuration.
    pub fn from_config(config: SystemConfig) -> Self {
        SystemBuilder {
            config,
            ..SystemBuilder::new()
        }
    }

    // ── Settings ──────────────────────────────────────────────

    pub fn settings(mut self, settings: RtSettings) -> Self {
        self.config.settings = settings;
        self
    }

    /// Switch cycle accounting on or off.
    pub fn realtime(mut self, on: bool) -> Self {
        self.config.settings.realtime = on;
        self
    }

    /// Steps per slice on FCFS CPUs and buses.
    pub fn timeslice(mut self, steps: u64) -> Self {
        self.config.settings.fcfs_timeslice = steps;
        self
    }

    /// Fixed-priority slice jitter and the seed it is drawn from.
    pub fn jitter(mut self, amplitude: u64, seed: u64) -> Self {
        self.config.settings.jitter = amplitude;
        self.config.settings.seed = seed;
        self
    }

    // ── Topology ──────────────────────────────────────────────

    pub fn cpu(mut self, name: &str, speed_hz: u64, policy: PolicyKind) -> Self {
        self.config.cpus.push(CpuConfig::new(name, speed_hz, policy));
        self
    }

    pub fn bus(mut self, name: &str, speed: u64, cpus: &[&str]) -> Self {
        self.config.buses.push(BusConfig::new(name, speed, cpus));
        self
    }

    /// Priority of contexts running `key` ("Class`op") on `cpu`.
    pub fn priority(mut self, cpu: &str, key: &str, priority: u64) -> Self {
        self.priorities
            .entry(cpu.to_string())
            .or_default()
            .insert(key.to_string(), priority);
        self
    }

    // ── Objects ───────────────────────────────────────────────

    pub fn class(mut self, class: ClassDef) -> Self {
        self.classes.insert(class.name().to_string(), Arc::new(class));
        self
    }

    /// Deploy an instance of `class` on `cpu`. Object references are
    /// numbered from 1 in deployment order.
    pub fn object(mut self, class: &str, cpu: &str) -> Self {
        self.objects.push((class.to_string(), cpu.to_string()));
        self
    }

    pub fn initializer(mut self, init: Initializer) -> Self {
        self.initializers.push(init);
        self
    }

    /// Send records to `sink` instead of an in-memory `EventLog`.
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    // ── Build ─────────────────────────────────────────────────

    pub fn build(self) -> SchedResult<System> {
        let objects = self
            .objects
            .iter()
            .map(|(class, cpu)| {
                self.classes
                    .get(class)
                    .cloned()
                    .map(|c| (c, cpu.clone()))
                    .ok_or_else(|| SchedError::UnknownClass(class.clone()))
            })
            .collect::<SchedResult<Vec<_>>>()?;
        let topology = Topology::from_config(&self.config, &self.priorities, objects)?;

        let (sink, log): (Arc<dyn LogSink>, Option<Arc<EventLog>>) = match self.sink {
            Some(sink) => (sink, None),
            None => {
                let log = Arc::new(EventLog::new());
                (log.clone(), Some(log))
            }
        };

        let sim = Arc::new(SimulationState::new(self.config.settings, topology, sink));
        let system = System {
            sim,
            initializers: self.initializers,
            log,
        };
        system.declare();
        Ok(system)
    }
}

impl Default for SystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ── System ────────────────────────────────────────────────────────────

/// A built system, ready to run.
pub struct System {
    sim: Arc<SimulationState>,
    initializers: Vec<Initializer>,
    log: Option<Arc<EventLog>>,
}

impl System {
    fn declare(&self) {
        for event in self.sim.topology.declarations() {
            self.sim.log(event);
        }
    }

    fn spawn_system(&self, payload: ThreadPayload) -> SchedResult<Arc<ExecutionContext>> {
        ExecutionContext::spawn(&self.sim, ResourceId::Cpu(CpuId::VIRTUAL), None, None, payload, 0)
    }

    /// Run every initializer in one Init context.
    pub fn run_init(&self) -> SchedResult<()> {
        if self.initializers.is_empty() {
            return Ok(());
        }
        let ctx = self.spawn_system(ThreadPayload::Init(self.initializers.clone()))?;
        ResourceScheduler::new(Arc::clone(&self.sim)).start(&ctx)?;
        Ok(())
    }

    /// Run `body` as the main context until it completes, fails, or the
    /// system deadlocks.
    pub fn run_main<F>(&self, body: F) -> SchedResult<Value>
    where
        F: FnOnce(&ThreadScope) -> ExecResult<Value> + Send + 'static,
    {
        let ctx = self.spawn_system(ThreadPayload::main(body))?;
        let result = ResourceScheduler::new(Arc::clone(&self.sim)).start(&ctx);
        info!("run finished at {}", self.now());
        result
    }

    /// Initialize, then run `body`.
    pub fn run<F>(&self, body: F) -> SchedResult<Value>
    where
        F: FnOnce(&ThreadScope) -> ExecResult<Value> + Send + 'static,
    {
        self.run_init()?;
        self.run_main(body)
    }

    /// One line per resource.
    pub fn status(&self) -> String {
        ResourceScheduler::new(Arc::clone(&self.sim)).status().join("\n")
    }

    /// Back to time zero with fresh ids and an empty log, then re-declare
    /// the topology.
    pub fn reset(&self) {
        self.sim.reset();
        self.declare();
    }

    pub fn now(&self) -> VirtualTime {
        self.sim.clock.now()
    }

    pub fn objects_of(&self, class: &str) -> Vec<ObjectRef> {
        self.sim.topology.objects_of(class)
    }

    pub fn simulation(&self) -> &Arc<SimulationState> {
        &self.sim
    }

    /// The in-memory log, unless a custom sink was installed.
    pub fn event_log(&self) -> Option<&Arc<EventLog>> {
        self.log.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> ClassDef {
        ClassDef::new("Echo").operation("echo", |_, args| Ok(args.first().cloned().unwrap_or_default()))
    }

    #[test]
    fn test_build_logs_declarations() {
        let system = SystemBuilder::new()
            .cpu("cpu1", 1_000_000, PolicyKind::Fcfs)
            .class(echo())
            .object("Echo", "cpu1")
            .build()
            .unwrap();
        let log = system.event_log().unwrap();
        let names: Vec<_> = log.records().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["CPUdecl", "CPUdecl", "BUSdecl", "DeployObj"]);
        assert_eq!(system.objects_of("Echo"), vec![ObjectRef::new(1)]);
    }

    #[test]
    fn test_unknown_class() {
        let err = SystemBuilder::new()
            .cpu("cpu1", 1_000_000, PolicyKind::Fcfs)
            .object("Ghost", "cpu1")
            .build()
            .err()
            .unwrap();
        assert_eq!(err, SchedError::UnknownClass("Ghost".into()));
    }

    #[test]
    fn test_unknown_cpu_in_deployment() {
        let result = SystemBuilder::new().class(echo()).object("Echo", "cpu9").build();
        assert!(matches!(result, Err(SchedError::Config(_))));
    }

    #[test]
    fn test_reset_redeclares() {
        let system = SystemBuilder::new()
            .cpu("cpu1", 1_000_000, PolicyKind::Fcfs)
            .build()
            .unwrap();
        let before = system.event_log().unwrap().lines();
        system.run_main(|_| Ok(Value::Nil)).unwrap();
        system.reset();
        assert_eq!(system.event_log().unwrap().lines(), before);
        assert_eq!(system.now(), VirtualTime::ZERO);
    }

    #[test]
    fn test_custom_sink() {
        let system = SystemBuilder::new()
            .sink(Arc::new(crate::eventlog::NullSink))
            .build()
            .unwrap();
        assert!(system.event_log().is_none());
        assert_eq!(system.run_main(|_| Ok(Value::Int(1))).unwrap(), Value::Int(1));
    }
}
