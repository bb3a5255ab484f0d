//! The processing element: a 3-stage pipeline (Idle, Exec, Ackn) executing
//! one [`PeCommand`] at a time against a private accumulator.
//!
//! Grounded in `original_source/accelerators/nio/nio_pe.pipelined.py`. `Mac`
//! accumulates into the running total, `Cmac` clears the accumulator before
//! multiplying (the first term of a dot product), `Clear` zeroes it
//! explicitly; every other operator is a pure function of its two operands
//! and never touches the accumulator. Mirrors the admit/shift/stall
//! discipline of [`crate::memory::pipeline::PipelinedMemory`]: a command
//! admitted this tick reaches the final (Ackn) stage two ticks later, where
//! it is executed and its response sent in the same tick.

use std::collections::VecDeque;

use crate::clock::Clock;
use crate::device::{Device, DeviceId};
use crate::error::RouterError;
use crate::message::{bits_to_float, float_to_bits, Message, MessageId, MessageKind, Operator, PeCommand};
use crate::router::MessageRouter;

fn execute(op: Operator, op1: f32, op2: f32, accumulator: &mut f32) -> f32 {
    match op {
        Operator::Add => op1 + op2,
        Operator::Sub => op1 - op2,
        Operator::Mul => op1 * op2,
        Operator::Div => op1 / op2,
        Operator::Max => op1.max(op2),
        Operator::Min => op1.min(op2),
        Operator::Pow => op1.powf(op2),
        Operator::Mac => {
            *accumulator += op1 * op2;
            *accumulator
        }
        Operator::Cmac => {
            *accumulator = op1 * op2;
            *accumulator
        }
        Operator::Clear => {
            *accumulator = 0.0;
            *accumulator
        }
        Operator::Dot => panic!("Dot is a tile-level operation, never dispatched to a PE directly"),
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingCmd {
    cmd: PeCommand,
    source: DeviceId,
    message_id: MessageId,
    seq_num: u32,
}

/// A single processing element, identified by `device_id` on the shared
/// router.
pub struct Pe {
    device_id: DeviceId,
    accumulator: f32,
    stages: VecDeque<Option<PendingCmd>>,
    stalled: bool,
    stalled_cycles: u64,
}

impl Pe {
    /// `depth` is the number of pipeline stages before Ackn (2, matching
    /// Idle and Exec); exposed for tests that want to probe latency, but
    /// every PE in a running system uses the standard depth of 2.
    pub fn with_depth(device_id: DeviceId, depth: usize) -> Self {
        assert!(depth >= 1, "a PE pipeline needs at least one stage before Ackn");
        Self {
            device_id,
            accumulator: 0.0,
            stages: (0..depth).map(|_| None).collect(),
            stalled: false,
            stalled_cycles: 0,
        }
    }

    pub fn new(device_id: DeviceId) -> Self {
        Self::with_depth(device_id, 2)
    }

    pub fn accumulator_bits(&self) -> u32 {
        float_to_bits(self.accumulator)
    }

    fn respond(&mut self, pending: &PendingCmd) -> Message {
        let op1 = bits_to_float(pending.cmd.op1);
        let op2 = bits_to_float(pending.cmd.op2);
        let result = execute(pending.cmd.operation, op1, op2, &mut self.accumulator);
        Message::new(
            MessageKind::PeDone { result: float_to_bits(result) },
            self.device_id,
            pending.source,
            pending.message_id,
            pending.seq_num,
        )
    }

    /// Advances the pipeline by one tick. `incoming` is a `PeCmd` message
    /// for this device, if the caller has one ready. Returns `Ok(true)` if
    /// any stage advanced.
    pub fn tick(
        &mut self,
        incoming: Option<Message>,
        router: &mut MessageRouter,
        clock: &Clock,
    ) -> Result<bool, RouterError> {
        let last = self.stages.len() - 1;

        if self.stalled {
            let pending = self.stages[last].expect("stalled PE must hold a pending response");
            let response = self.respond(&pending);
            if router.send(response, clock)? {
                self.stages[last] = None;
                self.stalled = false;
            } else {
                self.stalled_cycles += 1;
                return Ok(false);
            }
        }

        if let Some(pending) = self.stages[last].take() {
            let response = self.respond(&pending);
            if router.send(response, clock)? {
                // slot already cleared
            } else {
                self.stages[last] = Some(pending);
                self.stalled = true;
                self.stalled_cycles += 1;
                return Ok(false);
            }
        }

        for i in (1..self.stages.len()).rev() {
            self.stages[i] = self.stages[i - 1].take();
        }
        self.stages[0] = match incoming.map(|m| (m.source, m.message_id, m.seq_num, m.kind)) {
            Some((source, message_id, seq_num, MessageKind::PeCmd(cmd))) => Some(PendingCmd {
                cmd,
                source,
                message_id,
                seq_num,
            }),
            Some((_, _, _, other)) => panic!("PE cannot admit {other:?}"),
            None => None,
        };

        Ok(true)
    }
}

impl Device for Pe {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn stalled_cycles(&self) -> u64 {
        self.stalled_cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DType;

    fn cmd(operation: Operator, op1: f32, op2: f32) -> PeCommand {
        PeCommand {
            operation,
            dtype: DType::Fp32,
            op1: float_to_bits(op1),
            op2: float_to_bits(op2),
            op3: None,
        }
    }

    fn setup() -> (Pe, MessageRouter, DeviceId, DeviceId) {
        let mut router = MessageRouter::new();
        let pe_id = router.add_connection(4);
        let tile_id = router.add_connection(4);
        (Pe::new(pe_id), router, pe_id, tile_id)
    }

    #[test]
    fn add_takes_three_ticks_to_produce_a_response() {
        let (mut pe, mut router, pe_id, tile_id) = setup();
        let clock = Clock::new();
        let msg = Message::new(
            MessageKind::PeCmd(cmd(Operator::Add, 2.0, 3.0)),
            tile_id,
            pe_id,
            MessageId(0),
            0,
        );
        pe.tick(Some(msg), &mut router, &clock).unwrap();
        assert!(router.fetch(tile_id, &clock).unwrap().is_none());
        pe.tick(None, &mut router, &clock).unwrap();
        assert!(router.fetch(tile_id, &clock).unwrap().is_none());
        pe.tick(None, &mut router, &clock).unwrap();
        let resp = router.fetch(tile_id, &clock).unwrap().unwrap();
        assert_eq!(resp.kind, MessageKind::PeDone { result: float_to_bits(5.0) });
    }

    #[test]
    fn cmac_then_mac_accumulates_a_dot_product() {
        let (mut pe, mut router, pe_id, tile_id) = setup();
        let clock = Clock::new();

        let m1 = Message::new(
            MessageKind::PeCmd(cmd(Operator::Cmac, 2.0, 3.0)), // 6
            tile_id,
            pe_id,
            MessageId(0),
            0,
        );
        let m2 = Message::new(
            MessageKind::PeCmd(cmd(Operator::Mac, 4.0, 5.0)), // +20 = 26
            tile_id,
            pe_id,
            MessageId(1),
            0,
        );

        pe.tick(Some(m1), &mut router, &clock).unwrap();
        pe.tick(Some(m2), &mut router, &clock).unwrap();
        pe.tick(None, &mut router, &clock).unwrap();
        let first = router.fetch(tile_id, &clock).unwrap().unwrap();
        assert_eq!(first.kind, MessageKind::PeDone { result: float_to_bits(6.0) });

        pe.tick(None, &mut router, &clock).unwrap();
        let second = router.fetch(tile_id, &clock).unwrap().unwrap();
        assert_eq!(second.kind, MessageKind::PeDone { result: float_to_bits(26.0) });
    }

    #[test]
    fn clear_zeroes_the_accumulator() {
        let (mut pe, mut router, pe_id, tile_id) = setup();
        let clock = Clock::new();
        let m1 = Message::new(
            MessageKind::PeCmd(cmd(Operator::Cmac, 2.0, 3.0)),
            tile_id,
            pe_id,
            MessageId(0),
            0,
        );
        let m2 = Message::new(
            MessageKind::PeCmd(cmd(Operator::Clear, 0.0, 0.0)),
            tile_id,
            pe_id,
            MessageId(1),
            0,
        );
        pe.tick(Some(m1), &mut router, &clock).unwrap();
        pe.tick(Some(m2), &mut router, &clock).unwrap();
        pe.tick(None, &mut router, &clock).unwrap();
        router.fetch(tile_id, &clock).unwrap();
        pe.tick(None, &mut router, &clock).unwrap();
        let resp = router.fetch(tile_id, &clock).unwrap().unwrap();
        assert_eq!(resp.kind, MessageKind::PeDone { result: float_to_bits(0.0) });
    }

    #[test]
    fn stall_on_full_downstream_queue_is_retried() {
        let (mut pe, mut router, pe_id, tile_id) = setup();
        let clock = Clock::new();
        let msg = Message::new(
            MessageKind::PeCmd(cmd(Operator::Add, 1.0, 1.0)),
            tile_id,
            pe_id,
            MessageId(0),
            0,
        );
        pe.tick(Some(msg), &mut router, &clock).unwrap();
        pe.tick(None, &mut router, &clock).unwrap();

        for i in 0..4 {
            router
                .send(
                    Message::new(MessageKind::PeDone { result: 0 }, pe_id, tile_id, MessageId(50 + i), 0),
                    &clock,
                )
                .unwrap();
        }

        let progressed = pe.tick(None, &mut router, &clock).unwrap();
        assert!(!progressed);
        assert_eq!(pe.stalled_cycles(), 1);

        for _ in 0..4 {
            router.fetch(tile_id, &clock).unwrap();
        }
        assert!(pe.tick(None, &mut router, &clock).unwrap());
    }
}
