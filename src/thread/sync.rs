//! Synchronization primitives for payload bodies.
//!
//! These never block a native thread directly. A blocked context parks
//! in WAITING or LOCKING through its own rendezvous, so the scheduler
//! still sees it and can detect deadlock when nobody will ever release it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::{ExecResult, RuntimeError};
use crate::ids::ThreadId;

use super::context::ExecutionContext;
use super::scope::ThreadScope;
use super::state::RunState;

/// Lock a mutex, recovering the data if another thread panicked while
/// holding it. Context state stays consistent across a payload panic
/// because every critical section is a handful of field writes.
#[inline]
pub(crate) fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

#[inline]
pub(crate) fn wait_or_recover<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match cond.wait(guard) {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

// ── ControlQueue ──────────────────────────────────────────────────────

/// A set of contexts blocked until someone calls `signal`.
#[derive(Debug, Default)]
pub struct ControlQueue {
    waiters: Mutex<Vec<Arc<ExecutionContext>>>,
}

impl ControlQueue {
    pub fn new() -> Self {
        ControlQueue {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Block `ctx` in `state` (WAITING or LOCKING) until signalled.
    pub fn join(&self, ctx: &Arc<ExecutionContext>, state: RunState) -> ExecResult<()> {
        lock_or_recover(&self.waiters).push(Arc::clone(ctx));
        let result = ctx.suspend_until_running(state);
        if result.is_err() {
            lock_or_recover(&self.waiters).retain(|w| w.id() != ctx.id());
        }
        result
    }

    /// Make every waiter runnable again. Returns how many were released.
    pub fn signal(&self) -> usize {
        let waiters: Vec<_> = lock_or_recover(&self.waiters).drain(..).collect();
        waiters.iter().filter(|w| w.release()).count()
    }

    /// Block the calling context until `pred` holds, re-checking after
    /// every signal.
    pub fn wait_until<F>(&self, scope: &ThreadScope, mut pred: F) -> ExecResult<()>
    where
        F: FnMut() -> bool,
    {
        while !pred() {
            self.join(scope.context(), RunState::Waiting)?;
        }
        Ok(())
    }

    /// Number of blocked contexts.
    pub fn len(&self) -> usize {
        lock_or_recover(&self.waiters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── SimMutex ──────────────────────────────────────────────────────────

/// A mutex between contexts. Contenders park in LOCKING.
#[derive(Debug, Default)]
pub struct SimMutex {
    owner: Mutex<Option<ThreadId>>,
    queue: ControlQueue,
}

impl SimMutex {
    pub fn new() -> Self {
        SimMutex::default()
    }

    pub fn lock(&self, scope: &ThreadScope) -> ExecResult<()> {
        let me = scope.id();
        loop {
            {
                let mut owner = lock_or_recover(&self.owner);
                match *owner {
                    None => {
                        *owner = Some(me);
                        return Ok(());
                    }
                    Some(holder) if holder == me => {
                        return Err(RuntimeError::failure(format!("{} already holds the mutex", me)).into());
                    }
                    Some(_) => {}
                }
            }
            self.queue.join(scope.context(), RunState::Locking)?;
        }
    }

    pub fn unlock(&self, scope: &ThreadScope) -> ExecResult<()> {
        let mut owner = lock_or_recover(&self.owner);
        if *owner != Some(scope.id()) {
            return Err(RuntimeError::failure(format!("{} does not hold the mutex", scope.id())).into());
        }
        *owner = None;
        drop(owner);
        self.queue.signal();
        Ok(())
    }

    /// The current holder.
    pub fn owner(&self) -> Option<ThreadId> {
        *lock_or_recover(&self.owner)
    }
}
