//! The pipelined read/write engine sitting between the memory device's
//! message queues and its [`super::Memory`] backing store.
//!
//! Grounded in `original_source/accelerators/nio/nio_mem_piped.py`: a
//! request advances through a fixed number of latency stages before its
//! response is sent. If the final stage's response can't be sent (the
//! destination's queue is full), the whole pipeline freezes in place for
//! that tick rather than dropping or reordering anything.

use std::collections::VecDeque;

use crate::clock::Clock;
use crate::device::DeviceId;
use crate::error::{MemoryError, RouterError};
use crate::message::{Message, MessageId, MessageKind};
use crate::router::MessageRouter;

use super::Memory;

/// A single slot in the pipeline: either empty or holding an in-flight
/// request.
#[derive(Debug, Clone)]
struct PipelineStage<T> {
    slot: Option<T>,
}

impl<T> PipelineStage<T> {
    fn empty() -> Self {
        Self { slot: None }
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Read {
        addr: u64,
        source: DeviceId,
        message_id: MessageId,
        seq_num: u32,
    },
    Write {
        addr: u64,
        content: u32,
        source: DeviceId,
        message_id: MessageId,
        seq_num: u32,
    },
}

/// Wraps [`Memory`] with a fixed-depth latency pipeline and a memory-side
/// device identity for sending responses.
pub struct PipelinedMemory {
    memory: Memory,
    device_id: DeviceId,
    stages: VecDeque<PipelineStage<PendingOp>>,
    /// Set when the final stage's response couldn't be sent; on the next
    /// tick only the final stage is retried and nothing advances.
    stalled: bool,
    stalled_cycles: u64,
}

impl PipelinedMemory {
    pub fn new(memory: Memory, device_id: DeviceId, depth: usize) -> Self {
        assert!(depth >= 1, "a pipeline needs at least one stage");
        Self {
            memory,
            device_id,
            stages: (0..depth).map(|_| PipelineStage::empty()).collect(),
            stalled: false,
            stalled_cycles: 0,
        }
    }

    pub fn stalled_cycles(&self) -> u64 {
        self.stalled_cycles
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Accepts one incoming `MemRead`/`MemWrite` message, places it at the
    /// head of the pipeline. Any other message kind is a programming error.
    fn admit(&mut self, message: Message) -> PendingOp {
        match message.kind {
            MessageKind::MemRead { addr } => PendingOp::Read {
                addr,
                source: message.source,
                message_id: message.message_id,
                seq_num: message.seq_num,
            },
            MessageKind::MemWrite { addr, content } => PendingOp::Write {
                addr,
                content,
                source: message.source,
                message_id: message.message_id,
                seq_num: message.seq_num,
            },
            other => panic!("memory pipeline cannot admit {other:?}"),
        }
    }

    /// Executes the op that just reached the final stage against the
    /// backing store and produces its response message. Fatal memory errors
    /// (out-of-bounds, uninitialized read) propagate, not a stall.
    fn execute(&mut self, op: &PendingOp, clock: &Clock) -> Result<Message, MemoryError> {
        match *op {
            PendingOp::Read {
                addr,
                source,
                message_id,
                seq_num,
            } => {
                let content = self.memory.peek(addr, clock.current())?;
                Ok(Message::new(
                    MessageKind::MemReadDone { addr, content },
                    self.device_id,
                    source,
                    message_id,
                    seq_num,
                ))
            }
            PendingOp::Write {
                addr,
                content,
                source,
                message_id,
                seq_num,
            } => {
                self.memory.poke(addr, content, clock.current())?;
                Ok(Message::new(
                    MessageKind::MemWriteDone,
                    self.device_id,
                    source,
                    message_id,
                    seq_num,
                ))
            }
        }
    }

    /// Advances the pipeline by one tick.
    ///
    /// `incoming` is the next request to admit, if the router has one ready
    /// for this device and the pipeline isn't currently stalled. Returns
    /// `Ok(true)` if progress was made, `Ok(false)` if the tick was consumed
    /// entirely retrying a stalled response send.
    pub fn tick(
        &mut self,
        incoming: Option<Message>,
        router: &mut MessageRouter,
        clock: &Clock,
    ) -> Result<bool, RouterError> {
        let depth = self.stages.len();
        let last = depth - 1;

        if self.stalled {
            if let Some(op) = self.stages[last].slot.clone() {
                let response = self
                    .execute(&op, clock)
                    .expect("an op that previously executed cleanly cannot newly fault");
                if router.send(response, clock)? {
                    self.stages[last].slot = None;
                    self.stalled = false;
                } else {
                    self.stalled_cycles += 1;
                    return Ok(false);
                }
            } else {
                self.stalled = false;
            }
        }

        if let Some(op) = self.stages[last].slot.take() {
            // A bad address reaching here means the reference operator that
            // emitted the request is broken, not a transient fault -- fatal.
            let response = self
                .execute(&op, clock)
                .expect("reference operators only address memory they mapped themselves");
            if router.send(response, clock)? {
                // slot already cleared above
            } else {
                self.stages[last].slot = Some(op);
                self.stalled = true;
                self.stalled_cycles += 1;
                return Ok(false);
            }
        }

        for i in (1..depth).rev() {
            self.stages[i].slot = self.stages[i - 1].slot.take();
        }
        self.stages[0].slot = incoming.map(|m| self.admit(m));

        Ok(true)
    }
}
