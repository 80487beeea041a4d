//! Payload variants and the body each one runs.
//!
//! One `ExecutionContext` struct carries the state machine; what the
//! native thread actually executes is chosen by the `ThreadPayload` tag.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{ExecError, ExecResult, RuntimeError, RuntimeErrorKind};
use crate::ids::{BusId, CpuId, MessageId, ObjectRef, ThreadId};
use crate::resource::{ResponseCell, ResponsePacket};
use crate::simulation::SimulationState;
use crate::value::Value;

use super::context::ExecutionContext;
use super::scope::ThreadScope;
use super::state::{PayloadKind, RunState};

/// Body of the distinguished main context.
pub type MainBody = Box<dyn FnOnce(&ThreadScope) -> ExecResult<Value> + Send>;

/// One global initializer.
pub type InitFn = Arc<dyn Fn(&ThreadScope) -> ExecResult<()> + Send + Sync>;

/// A named initializer, retried while forward references resolve.
#[derive(Clone)]
pub struct Initializer {
    pub name: String,
    body: InitFn,
}

impl Initializer {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&ThreadScope) -> ExecResult<()> + Send + Sync + 'static,
    {
        Initializer {
            name: name.into(),
            body: Arc::new(body),
        }
    }
}

/// Release pattern of a periodic object thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PeriodicSpec {
    /// Ticks between releases.
    pub period: u64,
    /// Ticks before the first release.
    pub offset: u64,
    /// Number of releases; `None` runs until the run ends.
    pub runs: Option<u64>,
}

/// Where to send the result of a remote synchronous call.
pub struct ReplyTo {
    pub bus: BusId,
    pub caller_cpu: CpuId,
    pub caller: ThreadId,
    pub request: MessageId,
    pub cell: Arc<ResponseCell>,
}

/// An operation to run on a deployed object.
pub struct ObjectCall {
    pub object: ObjectRef,
    pub operation: String,
    pub args: Vec<Value>,
    pub reply: Option<ReplyTo>,
    pub periodic: Option<PeriodicSpec>,
}

impl ObjectCall {
    pub fn new(object: ObjectRef, operation: impl Into<String>, args: Vec<Value>) -> Self {
        ObjectCall {
            object,
            operation: operation.into(),
            args,
            reply: None,
            periodic: None,
        }
    }

    pub fn periodic(mut self, spec: PeriodicSpec) -> Self {
        self.periodic = Some(spec);
        self
    }

    pub(crate) fn reply_to(mut self, reply: ReplyTo) -> Self {
        self.reply = Some(reply);
        self
    }
}

/// What a context executes.
pub enum ThreadPayload {
    Main(MainBody),
    Init(Vec<Initializer>),
    Object(ObjectCall),
    Bus(BusId),
}

impl ThreadPayload {
    pub fn main<F>(body: F) -> Self
    where
        F: FnOnce(&ThreadScope) -> ExecResult<Value> + Send + 'static,
    {
        ThreadPayload::Main(Box::new(body))
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            ThreadPayload::Main(_) => PayloadKind::Main,
            ThreadPayload::Init(_) => PayloadKind::Init,
            ThreadPayload::Object(_) => PayloadKind::Object,
            ThreadPayload::Bus(_) => PayloadKind::Bus,
        }
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, ThreadPayload::Object(call) if call.periodic.is_some())
    }

    fn run(self, scope: &ThreadScope) -> ExecResult<Value> {
        match self {
            ThreadPayload::Main(body) => body(scope),
            ThreadPayload::Init(initializers) => run_initializers(scope, initializers),
            ThreadPayload::Object(call) => run_object(scope, call),
            ThreadPayload::Bus(bus) => scope.simulation().topology.bus(bus)?.drive(scope),
        }
    }
}

// ── Bodies ────────────────────────────────────────────────────────────

/// Run every initializer, retrying the failed ones while the failing set
/// keeps shrinking. Once it stops shrinking, the first failure that is
/// not a forward reference wins.
fn run_initializers(scope: &ThreadScope, initializers: Vec<Initializer>) -> ExecResult<Value> {
    let mut pending = initializers;
    loop {
        let attempted = pending.len();
        let mut failed = Vec::new();
        let mut errors = Vec::new();

        for init in pending {
            match (init.body)(scope) {
                Ok(()) => {}
                Err(ExecError::Runtime(e)) => {
                    debug!("initializer {} failed: {}", init.name, e);
                    failed.push(init);
                    errors.push(e);
                }
                Err(unwind) => return Err(unwind),
            }
        }

        if failed.is_empty() {
            return Ok(Value::Nil);
        }
        if failed.len() < attempted {
            pending = failed;
            continue;
        }

        let pick = errors
            .iter()
            .position(|e| e.kind != RuntimeErrorKind::NotYetVisible)
            .unwrap_or(0);
        let error = errors
            .into_iter()
            .nth(pick)
            .unwrap_or_else(|| RuntimeError::internal("initialization failed"));
        return Err(error.into());
    }
}

fn run_object(scope: &ThreadScope, call: ObjectCall) -> ExecResult<Value> {
    let sim = scope.simulation();
    let operation = sim.topology.object(call.object)?.operation(&call.operation)?;

    let result = match call.periodic {
        None => operation(scope, &call.args),
        Some(spec) => {
            let mut release = scope.now().plus(spec.offset);
            let mut done = 0u64;
            loop {
                if spec.runs.is_some_and(|runs| done >= runs) {
                    break Ok(Value::Nil);
                }
                scope.alarm(release)?;
                if let Err(e) = operation(scope, &call.args) {
                    break Err(e);
                }
                done += 1;
                release = release.plus(spec.period);
            }
        }
    };

    let Some(reply) = call.reply else {
        return result;
    };
    let result = match result {
        Ok(value) => Ok(value),
        Err(ExecError::Runtime(e)) => Err(match scope.context().location() {
            Some(loc) => e.at(loc),
            None => e,
        }),
        Err(unwind) => return Err(unwind),
    };

    let value = result.as_ref().map(Value::clone).unwrap_or_default();
    let response = ResponsePacket {
        id: sim.next_message_id(),
        bus: reply.bus,
        from: scope.cpu()?,
        to: reply.caller_cpu,
        caller: reply.caller,
        callee: scope.id(),
        request: reply.request,
        result,
        cell: reply.cell,
    };
    sim.topology.bus(reply.bus)?.reply(sim, response);
    Ok(value)
}

// ── Native thread entry ───────────────────────────────────────────────

pub(crate) fn thread_main(sim: Arc<SimulationState>, ctx: Arc<ExecutionContext>, payload: ThreadPayload) {
    let scope = ThreadScope::new(Arc::clone(&sim), Arc::clone(&ctx));
    let result = ctx.suspend_until_running(RunState::Runnable).and_then(|()| {
        panic::catch_unwind(AssertUnwindSafe(|| payload.run(&scope)))
            .unwrap_or_else(|panic| Err(RuntimeError::internal(panic_message(panic.as_ref())).into()))
    });
    finish(&sim, &ctx, result);
}

/// Tear a context down after its body returned.
///
/// A failure outside Main/Init is fatal to the run: it is recorded in the
/// fatal slot and every other context is suspended. The resource notices
/// COMPLETE when its `runslice` returns.
fn finish(sim: &SimulationState, ctx: &ExecutionContext, result: ExecResult<Value>) {
    let result = match result {
        Err(ExecError::Runtime(e)) => {
            let e = match ctx.location() {
                Some(loc) => e.at(loc),
                None => e,
            };
            if !ctx.kind().owns_result() {
                warn!("{} failed on {}: {}", ctx.id(), ctx.resource(), e);
                sim.record_fatal(ctx.id(), ctx.resource(), e.clone());
                sim.suspend_others(ctx.id());
            }
            Err(ExecError::Runtime(e))
        }
        Err(ExecError::Unwind(sig)) => {
            debug!("{} unwound by {}", ctx.id(), sig);
            Err(ExecError::Unwind(sig))
        }
        ok => ok,
    };

    if let Ok(resource) = sim.topology.resource(ctx.resource()) {
        resource.unregister(ctx.id());
    }
    sim.remove_context(ctx.id());
    ctx.complete(result);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic in payload body".to_string()
    }
}
