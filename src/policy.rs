/// Scheduling policies.
///
/// A policy is pure decision logic over the contexts registered on one
/// resource: pick the next RUNNABLE context and say how long its slice
/// is. It never blocks and never touches the clock; the resource holds
/// the policy lock only while deciding, never across a `runslice`.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

use crate::ids::ThreadId;
use crate::thread::ExecutionContext;
use crate::time::VirtualTime;

// ── Trait ─────────────────────────────────────────────────────────────

/// Selection logic of one resource.
pub trait SchedulingPolicy: Send {
    /// Add a context. `priority` is ignored by policies without priorities;
    /// 0 means "use the default slice".
    fn register(&mut self, ctx: Arc<ExecutionContext>, priority: u64);

    fn unregister(&mut self, id: ThreadId);

    /// Select the best RUNNABLE, unsuspended context. Returns `false` if
    /// there is none.
    fn reschedule(&mut self) -> bool;

    /// The selection of the last successful `reschedule`.
    fn thread(&self) -> Option<Arc<ExecutionContext>>;

    /// Slice, in steps, for the current selection.
    fn timeslice(&self) -> u64;

    /// Ticks until the earliest ALARM or TIMESTEP context can wake.
    fn time_to_next_alarm(&self, now: VirtualTime) -> Option<u64> {
        self.threads()
            .iter()
            .filter_map(|t| t.wake_time())
            .map(|at| at.duration_since(now).unwrap_or(0))
            .min()
    }

    /// Make every context whose wake time has come RUNNABLE again.
    fn advance(&self, now: VirtualTime) {
        for t in self.threads() {
            if t.state().is_timed() {
                t.wake_if_due(now);
            }
        }
    }

    fn has_priorities(&self) -> bool;

    /// One-line human-readable state.
    fn status(&self) -> String;

    /// Every registered context, in queue order.
    fn threads(&self) -> Vec<Arc<ExecutionContext>>;

    /// Forget everything; used between runs.
    fn reset(&mut self);
}

fn describe(threads: &[Arc<ExecutionContext>]) -> String {
    threads
        .iter()
        .map(|t| format!("{}:{}", t.id(), t.state()))
        .collect::<Vec<_>>()
        .join(" ")
}

// ── FCFS ──────────────────────────────────────────────────────────────

/// First-come-first-served: the first RUNNABLE context in queue order is
/// chosen and rotated to the back.
pub struct FcfsPolicy {
    threads: Vec<Arc<ExecutionContext>>,
    best: Option<Arc<ExecutionContext>>,
    slice: u64,
}

impl FcfsPolicy {
    pub fn new(slice: u64) -> Self {
        FcfsPolicy {
            threads: Vec::new(),
            best: None,
            slice,
        }
    }
}

impl SchedulingPolicy for FcfsPolicy {
    fn register(&mut self, ctx: Arc<ExecutionContext>, _priority: u64) {
        self.threads.push(ctx);
    }

    fn unregister(&mut self, id: ThreadId) {
        self.threads.retain(|t| t.id() != id);
        if self.best.as_ref().is_some_and(|b| b.id() == id) {
            self.best = None;
        }
    }

    fn reschedule(&mut self) -> bool {
        self.best = None;
        let Some(pos) = self
            .threads
            .iter()
            .position(|t| t.is_selectable())
        else {
            return false;
        };
        let chosen = self.threads.remove(pos);
        self.threads.push(Arc::clone(&chosen));
        self.best = Some(chosen);
        true
    }

    fn thread(&self) -> Option<Arc<ExecutionContext>> {
        self.best.clone()
    }

    fn timeslice(&self) -> u64 {
        self.slice
    }

    fn has_priorities(&self) -> bool {
        false
    }

    fn status(&self) -> String {
        format!("FCFS slice={} [{}]", self.slice, describe(&self.threads))
    }

    fn threads(&self) -> Vec<Arc<ExecutionContext>> {
        self.threads.clone()
    }

    fn reset(&mut self) {
        self.threads.clear();
        self.best = None;
    }
}

// ── Fixed priority ────────────────────────────────────────────────────

/// Highest priority RUNNABLE context first; equal priorities go by queue
/// order, and the chosen context moves to the back of the queue.
///
/// The slice is the context's priority (or the default slice for
/// priority 0), perturbed by up to `±jitter` steps and never below 1.
/// Jitter draws from a generator seeded per run, so traces replay
/// exactly; it only changes slice lengths, never the selection.
pub struct FixedPriorityPolicy {
    /// Contexts with their priorities, in queue order.
    threads: Vec<(Arc<ExecutionContext>, u64)>,
    /// Current selection and its granted slice.
    best: Option<(Arc<ExecutionContext>, u64)>,
    default_slice: u64,
    jitter: u64,
    seed: u64,
    rng: Pcg64Mcg,
}

impl FixedPriorityPolicy {
    pub fn new(default_slice: u64, jitter: u64, seed: u64) -> Self {
        FixedPriorityPolicy {
            threads: Vec::new(),
            best: None,
            default_slice,
            jitter,
            seed,
            rng: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    fn jittered(&mut self, slice: u64) -> u64 {
        if self.jitter == 0 {
            return slice;
        }
        let j = self.jitter.min(i64::MAX as u64) as i64;
        let delta = self.rng.gen_range(-j..=j);
        let slice = (slice.min(i64::MAX as u64) as i64).saturating_add(delta);
        slice.max(1) as u64
    }

    /// Priority of a registered context.
    pub fn priority_of(&self, id: ThreadId) -> Option<u64> {
        self.threads
            .iter()
            .find(|(t, _)| t.id() == id)
            .map(|(_, p)| *p)
    }
}

impl SchedulingPolicy for FixedPriorityPolicy {
    fn register(&mut self, ctx: Arc<ExecutionContext>, priority: u64) {
        self.threads.push((ctx, priority));
    }

    fn unregister(&mut self, id: ThreadId) {
        self.threads.retain(|(t, _)| t.id() != id);
        if self.best.as_ref().is_some_and(|(b, _)| b.id() == id) {
            self.best = None;
        }
    }

    fn reschedule(&mut self) -> bool {
        self.best = None;
        let mut pick: Option<(usize, u64)> = None;
        for (i, (t, prio)) in self.threads.iter().enumerate() {
            if !t.is_selectable() {
                continue;
            }
            if pick.map_or(true, |(_, best)| *prio > best) {
                pick = Some((i, *prio));
            }
        }
        let Some((pos, prio)) = pick else {
            return false;
        };
        let chosen = self.threads.remove(pos);
        self.threads.push(chosen.clone());
        let slice = self.jittered(if prio > 0 { prio } else { self.default_slice });
        self.best = Some((chosen.0, slice));
        true
    }

    fn thread(&self) -> Option<Arc<ExecutionContext>> {
        self.best.as_ref().map(|(t, _)| Arc::clone(t))
    }

    fn timeslice(&self) -> u64 {
        self.best.as_ref().map_or(self.default_slice, |(_, slice)| *slice)
    }

    fn has_priorities(&self) -> bool {
        true
    }

    fn status(&self) -> String {
        let threads: Vec<_> = self.threads.iter().map(|(t, _)| Arc::clone(t)).collect();
        format!(
            "FP slice={} jitter={} [{}]",
            self.default_slice,
            self.jitter,
            describe(&threads)
        )
    }

    fn threads(&self) -> Vec<Arc<ExecutionContext>> {
        self.threads.iter().map(|(t, _)| Arc::clone(t)).collect()
    }

    fn reset(&mut self) {
        self.threads.clear();
        self.best = None;
        self.rng = Pcg64Mcg::seed_from_u64(self.seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{CpuId, ResourceId};
    use crate::thread::{PayloadKind, RunState, Signal};
    use proptest::prelude::*;

    fn ctx(id: u64) -> Arc<ExecutionContext> {
        let c = ExecutionContext::new(
            ThreadId::new(id),
            ResourceId::Cpu(CpuId::new(1)),
            None,
            None,
            PayloadKind::Object,
            false,
        );
        c.force_state(RunState::Runnable);
        Arc::new(c)
    }

    fn pick(policy: &mut dyn SchedulingPolicy) -> Option<u64> {
        if policy.reschedule() {
            policy.thread().map(|t| t.id().raw())
        } else {
            None
        }
    }

    #[test]
    fn test_suspended_contexts_are_skipped() {
        let mut fcfs = FcfsPolicy::new(10);
        let mut fp = FixedPriorityPolicy::new(10, 0, 0);
        let low = ctx(1);
        let high = ctx(2);
        fcfs.register(low.clone(), 0);
        fcfs.register(high.clone(), 0);
        fp.register(low.clone(), 1);
        fp.register(high.clone(), 9);

        high.set_signal(Signal::Suspend);
        assert_eq!(pick(&mut fcfs), Some(1));
        assert_eq!(pick(&mut fcfs), Some(1));
        assert_eq!(pick(&mut fp), Some(1));

        low.set_signal(Signal::Suspend);
        assert_eq!(pick(&mut fcfs), None);
        assert_eq!(pick(&mut fp), None);

        assert!(high.resume());
        assert!(!high.resume());
        assert_eq!(pick(&mut fp), Some(2));
    }

    #[test]
    fn test_fcfs_rotation() {
        let mut p = FcfsPolicy::new(10);
        let threads: Vec<_> = (1..=3).map(ctx).collect();
        for t in &threads {
            p.register(t.clone(), 0);
        }
        let order: Vec<_> = (0..6).filter_map(|_| pick(&mut p)).collect();
        assert_eq!(order, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(p.timeslice(), 10);
        assert!(!p.has_priorities());
    }

    #[test]
    fn test_fcfs_skips_blocked() {
        let mut p = FcfsPolicy::new(10);
        let threads: Vec<_> = (1..=3).map(ctx).collect();
        for t in &threads {
            p.register(t.clone(), 0);
        }
        threads[0].force_state(RunState::Waiting);
        assert_eq!(pick(&mut p), Some(2));
        // T1 becomes runnable again; it is now ahead of T3 and T2.
        threads[0].force_state(RunState::Runnable);
        assert_eq!(pick(&mut p), Some(1));
        assert_eq!(pick(&mut p), Some(3));
    }

    #[test]
    fn test_fcfs_nothing_runnable() {
        let mut p = FcfsPolicy::new(10);
        let t = ctx(1);
        t.force_state(RunState::Waiting);
        p.register(t, 0);
        assert!(!p.reschedule());
        assert!(p.thread().is_none());
    }

    #[test]
    fn test_unregister() {
        let mut p = FcfsPolicy::new(10);
        p.register(ctx(1), 0);
        p.register(ctx(2), 0);
        assert_eq!(pick(&mut p), Some(1));
        p.unregister(ThreadId::new(1));
        assert!(p.thread().is_none());
        assert_eq!(p.threads().len(), 1);
    }

    #[test]
    fn test_priority_selection() {
        let mut p = FixedPriorityPolicy::new(10, 0, 0);
        p.register(ctx(1), 5);
        p.register(ctx(2), 9);
        p.register(ctx(3), 9);
        // Highest priority wins; equal priorities alternate by queue order.
        let order: Vec<_> = (0..4).filter_map(|_| pick(&mut p)).collect();
        assert_eq!(order, vec![2, 3, 2, 3]);
        assert_eq!(p.timeslice(), 9);
        assert!(p.has_priorities());
        assert_eq!(p.priority_of(ThreadId::new(1)), Some(5));
    }

    #[test]
    fn test_priority_zero_uses_default_slice() {
        let mut p = FixedPriorityPolicy::new(7, 0, 0);
        p.register(ctx(1), 0);
        assert_eq!(pick(&mut p), Some(1));
        assert_eq!(p.timeslice(), 7);
    }

    #[test]
    fn test_jitter_is_seeded() {
        let slices = |seed| {
            let mut p = FixedPriorityPolicy::new(10, 4, seed);
            p.register(ctx(1), 0);
            (0..20)
                .map(|_| {
                    p.reschedule();
                    p.timeslice()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(slices(42), slices(42));
    }

    #[test]
    fn test_time_to_next_alarm_and_advance() {
        let mut p = FcfsPolicy::new(10);
        let a = ctx(1);
        let b = ctx(2);
        a.force_wake(RunState::Alarm, VirtualTime::new(50));
        b.force_wake(RunState::Timestep, VirtualTime::new(30));
        p.register(a.clone(), 0);
        p.register(b.clone(), 0);

        assert_eq!(p.time_to_next_alarm(VirtualTime::new(10)), Some(20));
        p.advance(VirtualTime::new(30));
        assert_eq!(b.state(), RunState::Runnable);
        assert_eq!(a.state(), RunState::Alarm);
        assert_eq!(p.time_to_next_alarm(VirtualTime::new(30)), Some(20));
        p.advance(VirtualTime::new(50));
        assert_eq!(a.state(), RunState::Runnable);
        assert_eq!(p.time_to_next_alarm(VirtualTime::new(50)), None);
    }

    proptest! {
        #[test]
        fn prop_jitter_keeps_selection_and_positive_slice(
            hi in 1u64..50,
            lo in 0u64..50,
            jitter in 0u64..100,
            seed in any::<u64>(),
        ) {
            prop_assume!(hi > lo);
            let mut p = FixedPriorityPolicy::new(5, jitter, seed);
            p.register(ctx(1), lo);
            p.register(ctx(2), hi);
            for _ in 0..10 {
                prop_assert_eq!(pick(&mut p), Some(2));
                let slice = p.timeslice();
                prop_assert!(slice >= 1);
                prop_assert!(slice <= hi + jitter);
            }
        }
    }
}
