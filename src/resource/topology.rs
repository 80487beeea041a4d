//! The system under simulation: resources and deployed objects.
//!
//! Built once from a `SystemConfig` and immutable afterwards. CPU ids and
//! bus ids are indices into the resource vectors; index 0 is the virtual
//! CPU or bus.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::SystemConfig;
use crate::error::{ExecResult, RuntimeError, SchedError, SchedResult};
use crate::event::RtEvent;
use crate::ids::{BusId, CpuId, ObjectRef, ResourceId};
use crate::simulation::SimulationState;
use crate::thread::{ExecutionContext, ObjectCall, ThreadPayload, ThreadScope};
use crate::value::Value;

use super::{BusResource, CpuResource, Resource};

/// An operation body. Receives the running context and the arguments.
pub type OperationFn = Arc<dyn Fn(&ThreadScope, &[Value]) -> ExecResult<Value> + Send + Sync>;

/// A class: a name and its operations.
#[derive(Clone)]
pub struct ClassDef {
    name: String,
    operations: BTreeMap<String, OperationFn>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        ClassDef {
            name: name.into(),
            operations: BTreeMap::new(),
        }
    }

    /// Add an operation.
    pub fn operation<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&ThreadScope, &[Value]) -> ExecResult<Value> + Send + Sync + 'static,
    {
        self.operations.insert(name.into(), Arc::new(body));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation_names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An object instance and the CPU it is deployed on.
#[derive(Debug, Clone)]
pub struct DeployedObject {
    pub objref: ObjectRef,
    pub class: Arc<ClassDef>,
    pub cpu: CpuId,
}

impl DeployedObject {
    pub fn class_name(&self) -> &str {
        self.class.name()
    }

    pub fn operation(&self, op: &str) -> Result<OperationFn, RuntimeError> {
        self.class.operations.get(op).cloned().ok_or_else(|| {
            RuntimeError::internal(format!("class {} has no operation {}", self.class.name, op))
        })
    }
}

pub struct Topology {
    cpus: Vec<Arc<CpuResource>>,
    buses: Vec<Arc<BusResource>>,
    objects: BTreeMap<ObjectRef, DeployedObject>,
}

impl Topology {
    /// Build resources from a validated configuration.
    ///
    /// `priorities` maps CPU name to "Class`op" priorities. The virtual bus
    /// gets id 0 and connects every CPU, the virtual one included.
    pub fn from_config(
        config: &SystemConfig,
        priorities: &BTreeMap<String, BTreeMap<String, u64>>,
        objects: Vec<(Arc<ClassDef>, String)>,
    ) -> SchedResult<Self> {
        config.validate()?;
        let settings = &config.settings;

        let mut cpus = vec![Arc::new(CpuResource::virtual_cpu(settings))];
        let mut cpu_ids = BTreeMap::new();
        cpu_ids.insert("vCPU".to_string(), CpuId::VIRTUAL);
        for (i, c) in config.cpus.iter().enumerate() {
            let id = CpuId::new(i as u64 + 1);
            let cpu = CpuResource::new(id, c, settings)
                .with_priorities(priorities.get(&c.name).cloned().unwrap_or_default());
            cpu_ids.insert(c.name.clone(), id);
            cpus.push(Arc::new(cpu));
        }
        if let Some(unknown) = priorities.keys().find(|name| !cpu_ids.contains_key(*name)) {
            return Err(SchedError::Config(format!("priority set for unknown CPU {}", unknown)));
        }

        let all: BTreeSet<CpuId> = cpu_ids.values().copied().collect();
        let mut buses = vec![Arc::new(BusResource::virtual_bus(all, settings.fcfs_timeslice))];
        for (i, b) in config.buses.iter().enumerate() {
            let members = b
                .cpus
                .iter()
                .map(|name| {
                    cpu_ids
                        .get(name)
                        .copied()
                        .ok_or_else(|| SchedError::Config(format!("unknown CPU {}", name)))
                })
                .collect::<SchedResult<BTreeSet<_>>>()?;
            buses.push(Arc::new(BusResource::new(
                BusId::new(i as u64 + 1),
                b.name.clone(),
                b.speed,
                members,
                settings.fcfs_timeslice,
            )));
        }

        let mut deployed = BTreeMap::new();
        for (i, (class, cpu_name)) in objects.into_iter().enumerate() {
            let cpu = cpu_ids
                .get(&cpu_name)
                .copied()
                .ok_or_else(|| SchedError::Config(format!("unknown CPU {}", cpu_name)))?;
            let objref = ObjectRef::new(i as u64 + 1);
            deployed.insert(objref, DeployedObject { objref, class, cpu });
        }

        Ok(Topology {
            cpus,
            buses,
            objects: deployed,
        })
    }

    // ── Lookup ────────────────────────────────────────────────────

    pub fn cpu(&self, id: CpuId) -> SchedResult<&Arc<CpuResource>> {
        self.cpus
            .get(id.raw() as usize)
            .ok_or(SchedError::UnknownCpu(id))
    }

    pub fn cpu_named(&self, name: &str) -> Option<CpuId> {
        self.cpus
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.cpu_id())
    }

    pub fn bus(&self, id: BusId) -> SchedResult<&Arc<BusResource>> {
        self.buses
            .get(id.raw() as usize)
            .ok_or(SchedError::UnknownBus(id))
    }

    pub fn cpus(&self) -> &[Arc<CpuResource>] {
        &self.cpus
    }

    pub fn buses(&self) -> &[Arc<BusResource>] {
        &self.buses
    }

    pub fn resource(&self, id: ResourceId) -> SchedResult<&dyn Resource> {
        match id {
            ResourceId::Cpu(cpu) => Ok(self.cpu(cpu)?.as_ref()),
            ResourceId::Bus(bus) => Ok(self.bus(bus)?.as_ref()),
        }
    }

    /// Every resource in service order: CPUs, then buses.
    pub fn resources(&self) -> Vec<&dyn Resource> {
        let cpus = self.cpus.iter().map(|c| c.as_ref() as &dyn Resource);
        let buses = self.buses.iter().map(|b| b.as_ref() as &dyn Resource);
        cpus.chain(buses).collect()
    }

    pub fn resource_name(&self, id: ResourceId) -> String {
        self.resource(id)
            .map_or_else(|_| id.to_string(), |r| r.name().to_string())
    }

    pub fn object(&self, objref: ObjectRef) -> SchedResult<&DeployedObject> {
        self.objects
            .get(&objref)
            .ok_or(SchedError::UnknownObject(objref))
    }

    /// Deployed instances of `class`, in deployment order.
    pub fn objects_of(&self, class: &str) -> Vec<ObjectRef> {
        self.objects
            .values()
            .filter(|o| o.class_name() == class)
            .map(|o| o.objref)
            .collect()
    }

    /// The bus to use from `from` to `to`: a configured bus if one links
    /// them, otherwise the virtual bus.
    pub fn bus_between(&self, from: CpuId, to: CpuId) -> SchedResult<BusId> {
        let real = self.buses.iter().skip(1).find(|b| b.links(from, to));
        real.or_else(|| self.buses.first().filter(|b| b.links(from, to)))
            .map(|b| b.bus_id())
            .ok_or(SchedError::NoRoute { from, to })
    }

    // ── Contexts ──────────────────────────────────────────────────

    /// Start a context running `call` on its object's CPU.
    pub fn spawn_object_thread(
        &self,
        sim: &Arc<SimulationState>,
        call: ObjectCall,
    ) -> SchedResult<Arc<ExecutionContext>> {
        let object = self.object(call.object)?;
        let priority = self
            .cpu(object.cpu)?
            .priority_of(object.class_name(), &call.operation);
        ExecutionContext::spawn(
            sim,
            ResourceId::Cpu(object.cpu),
            Some(object.objref),
            Some(object.class_name().to_string()),
            ThreadPayload::Object(call),
            priority,
        )
    }

    /// Declaration records for the start of a log.
    pub fn declarations(&self) -> Vec<RtEvent> {
        let mut events = Vec::new();
        for cpu in &self.cpus {
            events.push(RtEvent::CpuDecl {
                cpu: cpu.cpu_id(),
                name: cpu.name().to_string(),
                expl: !cpu.cpu_id().is_virtual(),
            });
        }
        for bus in &self.buses {
            events.push(RtEvent::BusDecl {
                bus: bus.bus_id(),
                name: bus.name().to_string(),
                topo: bus.cpus(),
            });
        }
        for obj in self.objects.values() {
            events.push(RtEvent::DeployObj {
                objref: obj.objref,
                clnm: obj.class_name().to_string(),
                cpu: obj.cpu,
            });
        }
        events
    }

    pub fn reset(&self) {
        for r in self.resources() {
            r.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, CpuConfig, PolicyKind};

    fn topology() -> Topology {
        let config = SystemConfig {
            cpus: vec![
                CpuConfig::new("cpu1", 1_000_000, PolicyKind::Fcfs),
                CpuConfig::new("cpu2", 1_000_000, PolicyKind::FixedPriority),
                CpuConfig::new("cpu3", 1_000_000, PolicyKind::Fcfs),
            ],
            buses: vec![BusConfig::new("bus1", 1000, &["cpu1", "cpu2"])],
            ..Default::default()
        };
        let sensor = Arc::new(ClassDef::new("Sensor").operation("read", |_, _| Ok(Value::Int(1))));
        let mut prios = BTreeMap::new();
        prios.insert("cpu2".to_string(), BTreeMap::from([("Sensor`read".to_string(), 4)]));
        Topology::from_config(
            &config,
            &prios,
            vec![(sensor.clone(), "cpu1".into()), (sensor, "cpu2".into())],
        )
        .unwrap()
    }

    #[test]
    fn test_ids_follow_declaration_order() {
        let t = topology();
        assert_eq!(t.cpu_named("vCPU"), Some(CpuId::VIRTUAL));
        assert_eq!(t.cpu_named("cpu2"), Some(CpuId::new(2)));
        assert_eq!(t.bus(BusId::new(1)).unwrap().name(), "bus1");
        assert_eq!(t.objects_of("Sensor"), vec![ObjectRef::new(1), ObjectRef::new(2)]);
        assert_eq!(t.resources().len(), 6);
    }

    #[test]
    fn test_bus_between_prefers_configured_bus() {
        let t = topology();
        assert_eq!(t.bus_between(CpuId::new(1), CpuId::new(2)).unwrap(), BusId::new(1));
        assert_eq!(t.bus_between(CpuId::new(1), CpuId::new(3)).unwrap(), BusId::VIRTUAL);
        assert_eq!(t.bus_between(CpuId::VIRTUAL, CpuId::new(2)).unwrap(), BusId::VIRTUAL);
    }

    #[test]
    fn test_unknown_lookups() {
        let t = topology();
        assert!(matches!(t.cpu(CpuId::new(9)), Err(SchedError::UnknownCpu(_))));
        assert!(matches!(t.object(ObjectRef::new(9)), Err(SchedError::UnknownObject(_))));
        let obj = t.object(ObjectRef::new(1)).unwrap();
        assert!(obj.operation("write").is_err());
    }

    #[test]
    fn test_priorities_reach_cpu() {
        let t = topology();
        assert_eq!(t.cpu(CpuId::new(2)).unwrap().priority_of("Sensor", "read"), 4);
        assert_eq!(t.cpu(CpuId::new(1)).unwrap().priority_of("Sensor", "read"), 0);
    }

    #[test]
    fn test_declarations() {
        let t = topology();
        let names: Vec<_> = t.declarations().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["CPUdecl", "CPUdecl", "CPUdecl", "CPUdecl", "BUSdecl", "BUSdecl", "DeployObj", "DeployObj"]
        );
    }
}
