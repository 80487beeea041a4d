//! Message packets carried by buses.

use std::sync::{Arc, Mutex};

use crate::error::{ExecResult, RuntimeError};
use crate::ids::{BusId, CpuId, MessageId, ObjectRef, ThreadId};
use crate::thread::sync::lock_or_recover;
use crate::thread::{ControlQueue, ThreadScope};
use crate::value::{args_size, Value};

/// Single-slot handoff between a remote callee and its waiting caller.
#[derive(Debug, Default)]
pub struct ResponseCell {
    slot: Mutex<Option<Result<Value, RuntimeError>>>,
    arrival: ControlQueue,
}

impl ResponseCell {
    pub fn new() -> Arc<Self> {
        Arc::new(ResponseCell::default())
    }

    /// Fill the slot and release the caller.
    pub fn deposit(&self, result: Result<Value, RuntimeError>) {
        *lock_or_recover(&self.slot) = Some(result);
        self.arrival.signal();
    }

    pub fn is_filled(&self) -> bool {
        lock_or_recover(&self.slot).is_some()
    }

    /// Park the calling context in WAITING until a result is deposited.
    pub fn wait(&self, scope: &ThreadScope) -> ExecResult<Result<Value, RuntimeError>> {
        self.arrival.wait_until(scope, || self.is_filled())?;
        Ok(lock_or_recover(&self.slot)
            .take()
            .unwrap_or_else(|| Err(RuntimeError::internal("response slot emptied"))))
    }
}

/// A call travelling to the CPU of its target object.
#[derive(Debug)]
pub struct RequestPacket {
    pub id: MessageId,
    pub bus: BusId,
    pub from: CpuId,
    pub to: CpuId,
    pub caller: ThreadId,
    pub target: ObjectRef,
    pub operation: String,
    pub args: Vec<Value>,
    /// `None` for one-way requests.
    pub reply: Option<Arc<ResponseCell>>,
}

impl RequestPacket {
    pub fn size(&self) -> u64 {
        args_size(&self.args)
    }
}

/// The result of a synchronous request on its way back.
#[derive(Debug)]
pub struct ResponsePacket {
    pub id: MessageId,
    pub bus: BusId,
    pub from: CpuId,
    pub to: CpuId,
    pub caller: ThreadId,
    pub callee: ThreadId,
    /// The request this answers.
    pub request: MessageId,
    pub result: Result<Value, RuntimeError>,
    pub cell: Arc<ResponseCell>,
}

impl ResponsePacket {
    pub fn size(&self) -> u64 {
        match &self.result {
            Ok(v) => v.size_bytes(),
            Err(e) => e.message.len() as u64,
        }
    }
}

#[derive(Debug)]
pub enum MessagePacket {
    Request(RequestPacket),
    Response(ResponsePacket),
}

impl MessagePacket {
    pub fn id(&self) -> MessageId {
        match self {
            MessagePacket::Request(r) => r.id,
            MessagePacket::Response(r) => r.id,
        }
    }

    /// Bytes on the wire.
    pub fn size(&self) -> u64 {
        match self {
            MessagePacket::Request(r) => r.size(),
            MessagePacket::Response(r) => r.size(),
        }
    }
}
