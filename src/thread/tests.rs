//! Context state-machine tests. The test thread plays the resource: it
//! grants slices with `runslice` and moves the clock by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::*;
use crate::config::{PolicyKind, RtSettings};
use crate::dsl::SystemBuilder;
use crate::error::{ExecError, Location, RuntimeErrorKind, SchedError};
use crate::ids::{BusId, CpuId, ResourceId};
use crate::resource::Resource;
use crate::simulation::SimulationState;
use crate::time::VirtualTime;
use crate::value::Value;

fn sim_with(settings: RtSettings) -> Arc<SimulationState> {
    let system = SystemBuilder::new()
        .settings(settings)
        .cpu("cpu1", 1_000_000, PolicyKind::Fcfs)
        .build()
        .unwrap();
    Arc::clone(system.simulation())
}

fn sim() -> Arc<SimulationState> {
    sim_with(RtSettings::default())
}

fn spawn_on<F>(sim: &Arc<SimulationState>, cpu: u64, body: F) -> Arc<ExecutionContext>
where
    F: FnOnce(&ThreadScope) -> crate::error::ExecResult<Value> + Send + 'static,
{
    ExecutionContext::spawn(
        sim,
        ResourceId::Cpu(CpuId::new(cpu)),
        None,
        None,
        ThreadPayload::main(body),
        0,
    )
    .unwrap()
}

fn loc(line: u32) -> Location {
    Location::new("test", line)
}

// ── Rendezvous ────────────────────────────────────────────────────────

#[test]
fn test_spawn_parks_runnable() {
    let sim = sim();
    let ctx = spawn_on(&sim, 0, |_| Ok(Value::Nil));
    assert_eq!(ctx.state(), RunState::Runnable);
    assert_eq!(sim.context_count(), 1);
    ctx.runslice(10);
    sim.join_threads();
}

#[test]
fn test_runslice_until_yield_then_complete() {
    let sim = sim();
    let ctx = spawn_on(&sim, 0, |scope| {
        scope.yield_now()?;
        Ok(Value::Int(5))
    });

    ctx.runslice(10);
    assert_eq!(ctx.state(), RunState::Runnable);

    ctx.runslice(10);
    assert!(ctx.is_complete());
    assert_eq!(ctx.take_outcome(), Some(Ok(Value::Int(5))));
    assert_eq!(sim.context_count(), 0);
    sim.join_threads();
}

#[test]
fn test_completion_unregisters() {
    let sim = sim();
    let ctx = spawn_on(&sim, 1, |_| Ok(Value::Nil));
    let cpu = sim.topology.resource(ResourceId::Cpu(CpuId::new(1))).unwrap();
    assert_eq!(cpu.thread_count(), 1);
    ctx.runslice(1);
    assert!(ctx.is_complete());
    assert_eq!(cpu.thread_count(), 0);
    assert!(sim.contexts().is_empty());
    sim.join_threads();
}

#[test]
fn test_bus_payload_needs_bus() {
    let sim = sim();
    let err = ExecutionContext::spawn(
        &sim,
        ResourceId::Cpu(CpuId::VIRTUAL),
        None,
        None,
        ThreadPayload::Bus(BusId::VIRTUAL),
        0,
    )
    .err()
    .unwrap();
    assert!(matches!(err, SchedError::WrongResource { expected: "bus", .. }));
    assert_eq!(sim.context_count(), 0);
}

// ── Time accounting ───────────────────────────────────────────────────

#[test]
fn test_step_charges_cycles_as_timestep() {
    let sim = sim();
    let ctx = spawn_on(&sim, 1, |scope| {
        scope.step(loc(1))?;
        Ok(Value::Nil)
    });

    ctx.runslice(10);
    assert_eq!(ctx.state(), RunState::Timestep);
    // 2 cycles at 1 MHz.
    assert_eq!(ctx.wake_time(), Some(VirtualTime::new(2_000)));
    assert!(!ctx.wake_if_due(sim.clock.now()));

    let now = sim.clock.advance(2_000);
    assert!(ctx.wake_if_due(now));
    assert_eq!(ctx.steps(), 1);
    ctx.runslice(10);
    assert!(ctx.is_complete());
    assert_eq!(ctx.location(), Some(loc(1)));
    sim.join_threads();
}

#[test]
fn test_slice_exhaustion_yields() {
    let sim = sim_with(RtSettings {
        realtime: false,
        ..RtSettings::default()
    });
    let ctx = spawn_on(&sim, 1, |scope| {
        for line in 0..3 {
            scope.step(loc(line))?;
        }
        Ok(Value::Nil)
    });

    ctx.runslice(2);
    assert_eq!(ctx.state(), RunState::Runnable);
    assert_eq!(ctx.steps(), 0);
    assert_eq!(sim.clock.now(), VirtualTime::new(2));

    ctx.runslice(2);
    assert!(ctx.is_complete());
    assert_eq!(sim.clock.now(), VirtualTime::new(3));
    sim.join_threads();
}

#[test]
fn test_timed_block_steps_are_free() {
    let sim = sim();
    let ctx = spawn_on(&sim, 1, |scope| {
        scope.duration_block(500, |s| {
            for line in 0..20 {
                s.step(loc(line))?;
            }
            Ok(())
        })?;
        Ok(Value::Nil)
    });

    // Twenty steps inside the block never exhaust a slice of 1.
    ctx.runslice(1);
    assert_eq!(ctx.state(), RunState::Timestep);
    assert_eq!(ctx.wake_time(), Some(VirtualTime::new(500)));
    let now = sim.clock.advance(500);
    ctx.wake_if_due(now);
    ctx.runslice(1);
    assert!(ctx.is_complete());
    sim.join_threads();
}

#[test]
fn test_alarm_sets_swap_in_deadline() {
    let sim = sim();
    let ctx = spawn_on(&sim, 1, |scope| {
        scope.alarm(VirtualTime::new(50))?;
        Ok(Value::Nil)
    });

    ctx.runslice(10);
    assert_eq!(ctx.state(), RunState::Alarm);
    assert_eq!(ctx.wake_time(), Some(VirtualTime::new(50)));
    assert!(!ctx.wake_if_due(VirtualTime::new(49)));
    assert!(ctx.wake_if_due(VirtualTime::new(50)));
    assert_eq!(ctx.take_swap_in_by(), Some(VirtualTime::new(50)));
    assert_eq!(ctx.take_swap_in_by(), None);
    ctx.runslice(10);
    assert!(ctx.is_complete());
    sim.join_threads();
}

// ── Signals ───────────────────────────────────────────────────────────

#[test]
fn test_terminate_unwinds_parked_context() {
    let sim = sim();
    let ctx = spawn_on(&sim, 0, |scope| loop {
        scope.yield_now()?;
    });
    ctx.runslice(10);
    ctx.set_signal(Signal::Terminate);
    ctx.wait_complete();
    assert_eq!(ctx.take_outcome(), Some(Err(ExecError::Unwind(Signal::Terminate))));
    sim.join_threads();
}

#[test]
fn test_stop_thread_is_idempotent() {
    let sim = sim();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let ctx = spawn_on(&sim, 0, move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(Value::Nil)
    });

    assert!(ctx.stop_thread());
    assert!(!ctx.stop_thread());

    ctx.runslice(10);
    assert!(ctx.is_complete());
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(ctx.take_outcome(), Some(Err(ExecError::Unwind(Signal::Terminate))));
    sim.join_threads();
}

#[test]
fn test_suspend_bounces_grants() {
    let sim = sim();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let ctx = spawn_on(&sim, 0, move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(Value::Nil)
    });

    ctx.set_signal(Signal::Suspend);
    ctx.runslice(10);
    assert_eq!(ctx.state(), RunState::Runnable);
    assert!(!ran.load(Ordering::SeqCst));

    ctx.set_signal(Signal::Terminate);
    ctx.wait_complete();
    assert!(!ran.load(Ordering::SeqCst));
    sim.join_threads();
}

#[test]
fn test_resume_lifts_suspend() {
    let sim = sim();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let ctx = spawn_on(&sim, 0, move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(Value::Nil)
    });

    ctx.set_signal(Signal::Suspend);
    assert!(ctx.is_suspended());
    assert!(!ctx.is_selectable());
    ctx.runslice(10);
    assert!(!ran.load(Ordering::SeqCst));

    assert!(ctx.resume());
    assert!(ctx.is_selectable());
    ctx.runslice(10);
    assert!(ctx.is_complete());
    assert!(ran.load(Ordering::SeqCst));
    sim.join_threads();
}

#[test]
fn test_deadlocked_signal() {
    let sim = sim();
    let queue = Arc::new(ControlQueue::new());
    let q = queue.clone();
    let ctx = spawn_on(&sim, 0, move |scope| {
        q.wait_until(scope, || false)?;
        Ok(Value::Nil)
    });
    ctx.runslice(10);
    assert_eq!(ctx.state(), RunState::Waiting);

    ctx.set_signal(Signal::Deadlocked);
    ctx.wait_complete();
    assert_eq!(ctx.take_outcome(), Some(Err(ExecError::Unwind(Signal::Deadlocked))));
    // An unwound waiter leaves the queue.
    assert!(queue.is_empty());
    sim.join_threads();
}

#[test]
fn test_panic_becomes_internal_failure() {
    let sim = sim();
    let ctx = spawn_on(&sim, 0, |_| panic!("boom"));
    ctx.runslice(10);
    match ctx.take_outcome() {
        Some(Err(ExecError::Runtime(e))) => {
            assert_eq!(e.kind, RuntimeErrorKind::Internal);
            assert!(e.message.contains("boom"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    // Main owns its result; the run is not failed.
    assert!(!sim.has_fatal());
    sim.join_threads();
}

// ── Synchronization ───────────────────────────────────────────────────

#[test]
fn test_control_queue_release() {
    let sim = sim();
    let queue = Arc::new(ControlQueue::new());
    let ready = Arc::new(AtomicBool::new(false));
    let (q, r) = (queue.clone(), ready.clone());
    let ctx = spawn_on(&sim, 0, move |scope| {
        q.wait_until(scope, || r.load(Ordering::SeqCst))?;
        Ok(Value::Bool(true))
    });

    ctx.runslice(10);
    assert_eq!(ctx.state(), RunState::Waiting);
    assert_eq!(queue.len(), 1);

    // A spurious signal re-parks the waiter.
    assert_eq!(queue.signal(), 1);
    ctx.runslice(10);
    assert_eq!(ctx.state(), RunState::Waiting);

    ready.store(true, Ordering::SeqCst);
    assert_eq!(queue.signal(), 1);
    assert_eq!(ctx.state(), RunState::Runnable);
    ctx.runslice(10);
    assert_eq!(ctx.take_outcome(), Some(Ok(Value::Bool(true))));
    sim.join_threads();
}

#[test]
fn test_sim_mutex_contention() {
    let sim = sim();
    let mutex = Arc::new(SimMutex::new());

    let m = mutex.clone();
    let a = spawn_on(&sim, 0, move |scope| {
        m.lock(scope)?;
        scope.yield_now()?;
        m.unlock(scope)?;
        Ok(Value::Nil)
    });
    let m = mutex.clone();
    let b = spawn_on(&sim, 0, move |scope| {
        m.lock(scope)?;
        m.unlock(scope)?;
        Ok(Value::Nil)
    });

    a.runslice(10);
    assert_eq!(mutex.owner(), Some(a.id()));
    b.runslice(10);
    assert_eq!(b.state(), RunState::Locking);

    a.runslice(10);
    assert!(a.is_complete());
    assert_eq!(b.state(), RunState::Runnable);

    b.runslice(10);
    assert!(b.is_complete());
    assert_eq!(mutex.owner(), None);
    sim.join_threads();
}

#[test]
fn test_sim_mutex_misuse() {
    let sim = sim();
    let mutex = Arc::new(SimMutex::new());
    let m = mutex.clone();
    let ctx = spawn_on(&sim, 0, move |scope| {
        m.lock(scope)?;
        m.lock(scope)?;
        Ok(Value::Nil)
    });
    ctx.runslice(10);
    assert!(matches!(ctx.take_outcome(), Some(Err(ExecError::Runtime(_)))));

    let m = mutex.clone();
    let other = spawn_on(&sim, 0, move |scope| {
        m.unlock(scope)?;
        Ok(Value::Nil)
    });
    other.runslice(10);
    assert!(matches!(other.take_outcome(), Some(Err(ExecError::Runtime(_)))));
    sim.join_threads();
}
