/// Transport resource.
///
/// A bus owns a FIFO of in-flight packets and one driver context that
/// drains it: activate the head packet, spend its transmission time, then
/// dispatch it. Requests become new object contexts on the target CPU;
/// responses fill the caller's `ResponseCell`.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;

use crate::error::ExecResult;
use crate::event::RtEvent;
use crate::ids::{BusId, CpuId, ResourceId, ThreadId};
use crate::policy::{FcfsPolicy, SchedulingPolicy};
use crate::simulation::SimulationState;
use crate::thread::sync::lock_or_recover;
use crate::thread::{ControlQueue, ExecutionContext, ObjectCall, ReplyTo, RunState, Signal, ThreadScope};
use crate::time::VirtualTime;
use crate::value::Value;

use super::message::{MessagePacket, RequestPacket, ResponsePacket};
use super::{MinimumTimestep, Resource};

const NANOS_PER_SEC: u128 = 1_000_000_000;

pub struct BusResource {
    id: BusId,
    name: String,
    /// Bytes per second.
    speed: u64,
    cpus: BTreeSet<CpuId>,
    policy: Mutex<Box<dyn SchedulingPolicy>>,
    queue: Mutex<VecDeque<MessagePacket>>,
    arrivals: ControlQueue,
}

impl BusResource {
    pub fn new(id: BusId, name: impl Into<String>, speed: u64, cpus: BTreeSet<CpuId>, slice: u64) -> Self {
        BusResource {
            id,
            name: name.into(),
            speed,
            cpus,
            policy: Mutex::new(Box::new(FcfsPolicy::new(slice))),
            queue: Mutex::new(VecDeque::new()),
            arrivals: ControlQueue::new(),
        }
    }

    /// The zero-overhead bus connecting every CPU.
    pub fn virtual_bus(cpus: BTreeSet<CpuId>, slice: u64) -> Self {
        BusResource::new(BusId::VIRTUAL, "vBUS", 0, cpus, slice)
    }

    pub fn bus_id(&self) -> BusId {
        self.id
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }

    /// Connected CPUs, in id order.
    pub fn cpus(&self) -> Vec<CpuId> {
        self.cpus.iter().copied().collect()
    }

    /// Whether this bus connects two distinct CPUs.
    pub fn links(&self, from: CpuId, to: CpuId) -> bool {
        from != to && self.cpus.contains(&from) && self.cpus.contains(&to)
    }

    /// Time to move `bytes` across this bus. Zero on the virtual bus.
    pub fn transmission_time(&self, bytes: u64) -> u64 {
        if self.id.is_virtual() || self.speed == 0 {
            return 0;
        }
        let ticks = bytes as u128 * NANOS_PER_SEC / self.speed as u128;
        ticks.min(u64::MAX as u128) as u64
    }

    /// Packets waiting for the driver.
    pub fn queue_len(&self) -> usize {
        self.queue().len()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<MessagePacket>> {
        lock_or_recover(&self.queue)
    }

    fn policy(&self) -> MutexGuard<'_, Box<dyn SchedulingPolicy>> {
        lock_or_recover(&self.policy)
    }

    fn enqueue(&self, packet: MessagePacket) {
        self.queue().push_back(packet);
        self.arrivals.signal();
    }

    /// Send a request towards its target's CPU.
    pub fn transmit(&self, sim: &SimulationState, request: RequestPacket) {
        sim.log(RtEvent::MessageRequest {
            bus: self.id,
            from_cpu: request.from,
            to_cpu: request.to,
            msg: request.id,
            caller: request.caller,
            opname: request.operation.clone(),
            objref: request.target,
            size: request.size(),
        });
        self.enqueue(MessagePacket::Request(request));
    }

    /// Send a response back to a waiting caller.
    pub fn reply(&self, sim: &SimulationState, response: ResponsePacket) {
        sim.log(RtEvent::ReplyRequest {
            bus: self.id,
            from_cpu: response.from,
            to_cpu: response.to,
            msg: response.id,
            orig_msg: response.request,
            caller: response.caller,
            callee: response.callee,
            size: response.size(),
        });
        self.enqueue(MessagePacket::Response(response));
    }

    /// Body of the driver context. Runs until the context is unwound.
    pub(crate) fn drive(&self, scope: &ThreadScope) -> ExecResult<Value> {
        let sim = scope.simulation();
        loop {
            self.arrivals.wait_until(scope, || self.queue_len() > 0)?;
            let Some(packet) = self.queue().pop_front() else {
                continue;
            };

            let msg = packet.id();
            sim.log(RtEvent::MessageActivate { msg });
            scope.duration(self.transmission_time(packet.size()))?;
            sim.log(RtEvent::MessageCompleted { msg });
            trace!("{} delivered {}", self.name, msg);

            match packet {
                MessagePacket::Request(request) => {
                    let mut call = ObjectCall::new(request.target, request.operation, request.args);
                    if let Some(cell) = request.reply {
                        call = call.reply_to(ReplyTo {
                            bus: self.id,
                            caller_cpu: request.from,
                            caller: request.caller,
                            request: request.id,
                            cell,
                        });
                    }
                    sim.topology.spawn_object_thread(sim, call)?;
                }
                MessagePacket::Response(response) => response.cell.deposit(response.result),
            }
        }
    }
}

impl Resource for BusResource {
    fn id(&self) -> ResourceId {
        ResourceId::Bus(self.id)
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

    fn reschedule(&self, _sim: &SimulationState) -> bool {
        let selected = {
            let mut policy = self.policy();
            if policy.reschedule() {
                let slice = policy.timeslice();
                policy.thread().map(|t| (t, slice))
            } else {
                None
            }
        };
        let Some((driver, slice)) = selected else {
            return false;
        };
        driver.runslice(slice);
        driver.state() != RunState::Timestep
    }

    fn minimum_timestep(&self, now: VirtualTime) -> MinimumTimestep {
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
        format!(
            "{} {} ({} B/s) queued={} {}",
            self.id,
            self.name,
            self.speed,
            self.queue_len(),
            self.policy().status()
        )
    }

    fn reset(&self) {
        self.policy().reset();
        self.queue().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpus(ids: &[u64]) -> BTreeSet<CpuId> {
        ids.iter().map(|i| CpuId::new(*i)).collect()
    }

    #[test]
    fn test_links() {
        let bus = BusResource::new(BusId::new(1), "bus1", 1000, cpus(&[1, 2]), 10);
        assert!(bus.links(CpuId::new(1), CpuId::new(2)));
        assert!(bus.links(CpuId::new(2), CpuId::new(1)));
        assert!(!bus.links(CpuId::new(1), CpuId::new(1)));
        assert!(!bus.links(CpuId::new(1), CpuId::new(3)));
    }

    #[test]
    fn test_transmission_time() {
        let bus = BusResource::new(BusId::new(1), "bus1", 1_000_000, cpus(&[1, 2]), 10);
        assert_eq!(bus.transmission_time(8), 8_000);
        let vbus = BusResource::virtual_bus(cpus(&[0, 1, 2]), 10);
        assert_eq!(vbus.transmission_time(1 << 20), 0);
        assert!(vbus.links(CpuId::new(0), CpuId::new(2)));
    }

    #[test]
    fn test_idle_bus_status() {
        let bus = BusResource::new(BusId::new(1), "bus1", 100, cpus(&[1, 2]), 10);
        assert_eq!(bus.queue_len(), 0);
        assert!(bus.status().contains("queued=0"));
        assert_eq!(bus.minimum_timestep(VirtualTime::ZERO), MinimumTimestep::Never);
    }
}
