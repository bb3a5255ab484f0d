//! The tile state machine: IDLE -> FETCH -> SEND_READS -> DISPATCH_TO_PE ->
//! WRITE_BACK -> SEND_ACK -> IDLE.
//!
//! Grounded in `original_source/accelerators/nio/nio_tile.py`. A tile owns
//! one input [`Cache`] and drives exactly one PE; it issues memory reads
//! sequentially (one outstanding request at a time) rather than all at once,
//! which keeps correlation tracking to a single in-flight key instead of a
//! map, and lets every fetch go through the cache-first lookup the same way.

use crate::cache::Cache;
use crate::clock::Clock;
use crate::device::{Device, DeviceId};
use crate::error::TileError;
use crate::message::{
    bits_to_float, float_to_bits, Message, MessageId, MessageIdGen, MessageKind, Operand, Operator,
    PeCommand, TileCommand, TileOperation,
};
use crate::router::MessageRouter;

/// A single accumulator-PE instruction a tile schedules while dispatching one
/// `TileCmd`. `Dot` lowers to one `Cmac` (clears and multiplies the first
/// pair) followed by a `Mac` per remaining pair; an optional bias lowers to
/// one more `Mac` against the literal `1.0`.
fn lower_to_pe_program(op: &TileOperation, dtype: crate::message::DType) -> Vec<(Operator, Operand, Operand)> {
    match op {
        TileOperation::Binary { op, op1, op2 } => vec![((*op).into(), *op1, *op2)],
        TileOperation::Dot { row_addrs, col_addrs, bias } => {
            let mut program = Vec::with_capacity(row_addrs.len() + 1);
            for (i, (r, c)) in row_addrs.iter().zip(col_addrs.iter()).enumerate() {
                let op = if i == 0 { Operator::Cmac } else { Operator::Mac };
                program.push((op, Operand::Addr(*r), Operand::Addr(*c)));
            }
            if let Some(bias_addr) = bias {
                program.push((
                    Operator::Mac,
                    Operand::Addr(*bias_addr),
                    Operand::Inline(float_to_bits(1.0)),
                ));
            }
            let _ = dtype;
            program
        }
    }
}

fn operand_addr(operand: &Operand) -> Option<u64> {
    match operand {
        Operand::Addr(a) => Some(*a),
        Operand::Inline(_) => None,
    }
}

struct ActiveCommand {
    host_source: DeviceId,
    message_id: MessageId,
    seq_num: u32,
    res_addr: u64,
    program: Vec<(Operator, Operand, Operand)>,
}

enum Stage {
    Idle,
    /// Reading operands still missing from cache, one at a time.
    /// `pc` indexes the program instruction under resolution, `side`
    /// selects which of its two operands (0 or 1) is outstanding. `req_id`
    /// is `None` until the read request has actually been sent.
    SendRead { pc: usize, side: u8, req_id: Option<MessageId> },
    /// All operands resolved; dispatching PE instructions one at a time.
    DispatchPe { pc: usize, req_id: Option<MessageId> },
    WriteBack { result: u32, req_id: Option<MessageId> },
    SendAck,
}

/// A tile: one cache, one PE, driving the fetch/dispatch/writeback cycle for
/// one `TileCmd` at a time.
pub struct Tile {
    tile_id: DeviceId,
    shared_id: DeviceId,
    mem_id: DeviceId,
    pe_id: DeviceId,
    cache: Cache,
    id_gen: MessageIdGen,
    active: Option<ActiveCommand>,
    stage: Stage,
    stalled_cycles: u64,
}

impl Tile {
    pub fn new(tile_id: DeviceId, shared_id: DeviceId, mem_id: DeviceId, pe_id: DeviceId, cache_entries: usize) -> Self {
        Self {
            tile_id,
            shared_id,
            mem_id,
            pe_id,
            cache: Cache::new(cache_entries),
            id_gen: MessageIdGen::new(),
            active: None,
            stage: Stage::Idle,
            stalled_cycles: 0,
        }
    }

    fn resolve(&self, operand: &Operand) -> Option<u32> {
        match operand {
            Operand::Inline(bits) => Some(*bits),
            Operand::Addr(addr) => self.cache.lookup(*addr),
        }
    }

    /// Finds the first (pc, side) pair whose operand is an unresolved
    /// address. Scans every instruction's first operand before any second
    /// operand -- for a `Dot` program this reads all `row_addrs` before any
    /// `col_addrs`, matching the documented DOT fetch order; for a `Binary`
    /// program (one instruction) it has no visible effect. `None` means
    /// every operand across the whole program is already resolvable.
    fn next_missing(&self, program: &[(Operator, Operand, Operand)]) -> Option<(usize, u8)> {
        for (pc, (_, op1, _)) in program.iter().enumerate() {
            if operand_addr(op1).is_some() && self.resolve(op1).is_none() {
                return Some((pc, 0));
            }
        }
        for (pc, (_, _, op2)) in program.iter().enumerate() {
            if operand_addr(op2).is_some() && self.resolve(op2).is_none() {
                return Some((pc, 1));
            }
        }
        None
    }

    fn advance_after_reads_resolved(&mut self) {
        self.stage = Stage::DispatchPe { pc: 0, req_id: None };
    }

    /// Accepts a freshly fetched `TileCmd`, entering FETCH.
    fn admit(&mut self, message: Message) {
        let cmd: TileCommand = match message.kind {
            MessageKind::TileCmd(cmd) => cmd,
            other => panic!("tile cannot admit {other:?}"),
        };
        let program = lower_to_pe_program(&cmd.op, cmd.dtype);
        self.active = Some(ActiveCommand {
            host_source: message.source,
            message_id: message.message_id,
            seq_num: message.seq_num,
            res_addr: cmd.res_addr,
            program,
        });
        match self.next_missing(&self.active.as_ref().unwrap().program) {
            Some((pc, side)) => {
                self.stage = Stage::SendRead { pc, side, req_id: None };
            }
            None => self.advance_after_reads_resolved(),
        }
    }

    /// Advances the tile's state machine by one tick.
    ///
    /// `tile_cmd`: a `TileCmd` for this tile, if the control-plane router has
    /// one ready (only consulted while `Idle`).
    /// `shared_msg`: a response (`MemReadDone`/`MemWriteDone`/`PeDone`)
    /// addressed to this tile's shared-plane identity, if ready.
    pub fn tick(
        &mut self,
        tile_cmd: Option<Message>,
        shared_msg: Option<Message>,
        tile_router: &mut MessageRouter,
        shared_router: &mut MessageRouter,
        clock: &Clock,
    ) -> Result<bool, TileError> {
        if matches!(self.stage, Stage::Idle) {
            if let Some(msg) = tile_cmd {
                self.admit(msg);
            } else {
                return Ok(false);
            }
        }

        match &mut self.stage {
            Stage::Idle => unreachable!("admit always leaves SendRead or DispatchPe"),
            Stage::SendRead { pc, side, req_id } => {
                let active = self.active.as_ref().expect("SendRead requires an active command");
                let (_, op1, op2) = &active.program[*pc];
                let operand = if *side == 0 { op1 } else { op2 };
                let addr = operand_addr(operand).expect("SendRead only targets address operands");

                if req_id.is_none() {
                    let id = self.id_gen.next();
                    let request = Message::new(
                        MessageKind::MemRead { addr },
                        self.shared_id,
                        self.mem_id,
                        id,
                        0,
                    );
                    if shared_router
                        .send(request, clock)
                        .expect("tile only ever addresses devices the system registered")
                    {
                        *req_id = Some(id);
                    } else {
                        self.stalled_cycles += 1;
                        return Ok(false);
                    }
                    return Ok(true);
                }

                if let Some(msg) = shared_msg {
                    let expected = req_id.expect("request already sent");
                    match msg.kind {
                        MessageKind::MemReadDone { addr: got_addr, content } if msg.message_id == expected => {
                            self.cache.install(got_addr, content);
                            match self.next_missing(&self.active.as_ref().unwrap().program) {
                                Some((pc, side)) => {
                                    self.stage = Stage::SendRead { pc, side, req_id: None };
                                }
                                None => self.advance_after_reads_resolved(),
                            }
                            return Ok(true);
                        }
                        _ => {
                            return Err(TileError::CorrelationMismatch {
                                message_id: msg.message_id,
                                seq_num: msg.seq_num,
                            });
                        }
                    }
                }
                Ok(false)
            }
            Stage::DispatchPe { pc, req_id } => {
                let active = self.active.as_ref().expect("DispatchPe requires an active command");
                let (operation, op1, op2) = active.program[*pc];

                if req_id.is_none() {
                    let op1_bits = self.resolve(&op1).expect("all operands resolved before dispatch");
                    let op2_bits = self.resolve(&op2).expect("all operands resolved before dispatch");
                    let id = self.id_gen.next();
                    let cmd = PeCommand {
                        operation,
                        dtype: crate::message::DType::Fp32,
                        op1: op1_bits,
                        op2: op2_bits,
                        op3: None,
                    };
                    let request = Message::new(MessageKind::PeCmd(cmd), self.shared_id, self.pe_id, id, 0);
                    if shared_router
                        .send(request, clock)
                        .expect("tile only ever addresses devices the system registered")
                    {
                        *req_id = Some(id);
                    } else {
                        self.stalled_cycles += 1;
                        return Ok(false);
                    }
                    return Ok(true);
                }

                if let Some(msg) = shared_msg {
                    let expected = req_id.expect("request already sent");
                    match msg.kind {
                        MessageKind::PeDone { result } if msg.message_id == expected => {
                            let next_pc = *pc + 1;
                            let program_len = active.program.len();
                            if next_pc < program_len {
                                self.stage = Stage::DispatchPe { pc: next_pc, req_id: None };
                            } else {
                                self.stage = Stage::WriteBack { result, req_id: None };
                            }
                            return Ok(true);
                        }
                        _ => {
                            return Err(TileError::CorrelationMismatch {
                                message_id: msg.message_id,
                                seq_num: msg.seq_num,
                            });
                        }
                    }
                }
                Ok(false)
            }
            Stage::WriteBack { result, req_id } => {
                let active = self.active.as_ref().expect("WriteBack requires an active command");
                if req_id.is_none() {
                    let id = self.id_gen.next();
                    let request = Message::new(
                        MessageKind::MemWrite { addr: active.res_addr, content: *result },
                        self.shared_id,
                        self.mem_id,
                        id,
                        0,
                    );
                    if shared_router
                        .send(request, clock)
                        .expect("tile only ever addresses devices the system registered")
                    {
                        *req_id = Some(id);
                    } else {
                        self.stalled_cycles += 1;
                        return Ok(false);
                    }
                    return Ok(true);
                }
                if let Some(msg) = shared_msg {
                    let expected = req_id.expect("request already sent");
                    match msg.kind {
                        MessageKind::MemWriteDone if msg.message_id == expected => {
                            self.stage = Stage::SendAck;
                            return Ok(true);
                        }
                        _ => {
                            return Err(TileError::CorrelationMismatch {
                                message_id: msg.message_id,
                                seq_num: msg.seq_num,
                            });
                        }
                    }
                }
                Ok(false)
            }
            Stage::SendAck => {
                let active = self.active.take().expect("SendAck requires an active command");
                let ack = Message::new(
                    MessageKind::TileDone,
                    self.tile_id,
                    active.host_source,
                    active.message_id,
                    active.seq_num,
                );
                if tile_router
                    .send(ack, clock)
                    .expect("tile only ever addresses devices the system registered")
                {
                    self.stage = Stage::Idle;
                    Ok(true)
                } else {
                    self.active = Some(active);
                    self.stalled_cycles += 1;
                    Ok(false)
                }
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.stage, Stage::Idle) && self.active.is_none()
    }

    pub fn shared_id(&self) -> DeviceId {
        self.shared_id
    }
}

impl Device for Tile {
    fn device_id(&self) -> DeviceId {
        self.tile_id
    }

    fn stalled_cycles(&self) -> u64 {
        self.stalled_cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BinaryOperator, DType};

    struct Harness {
        tile_router: MessageRouter,
        shared_router: MessageRouter,
        tile: Tile,
        host_id: DeviceId,
        mem_id: DeviceId,
        pe_id: DeviceId,
        tile_id: DeviceId,
    }

    impl Harness {
        fn new() -> Self {
            let mut tile_router = MessageRouter::new();
            let mut shared_router = MessageRouter::new();
            let host_id = tile_router.add_connection(8);
            let tile_id = tile_router.add_connection(8);
            let mem_id = shared_router.add_connection(8);
            let pe_id = shared_router.add_connection(8);
            let tile_shared_id = shared_router.add_connection(8);
            let tile = Tile::new(tile_id, tile_shared_id, mem_id, pe_id, 4);
            Self {
                tile_router,
                shared_router,
                tile,
                host_id,
                mem_id,
                pe_id,
                tile_id,
            }
        }

        fn clock(&self) -> Clock {
            Clock::new()
        }
    }

    #[test]
    fn binary_add_with_inline_operands_round_trips() {
        let mut h = Harness::new();
        let clock = h.clock();
        let cmd = Message::new(
            MessageKind::TileCmd(TileCommand {
                res_addr: 0,
                dtype: DType::Fp32,
                op: TileOperation::Binary {
                    op: BinaryOperator::Add,
                    op1: Operand::Inline(float_to_bits(2.0)),
                    op2: Operand::Inline(float_to_bits(3.0)),
                },
            }),
            h.host_id,
            h.tile_id,
            MessageId(0),
            0,
        );
        h.tile_router.send(cmd, &clock).unwrap();

        // IDLE -> admits, straight to DispatchPe (no reads needed)
        let fetched = h.tile_router.fetch(h.tile_id, &clock).unwrap();
        h.tile
            .tick(fetched, None, &mut h.tile_router, &mut h.shared_router, &clock)
            .unwrap();

        // DispatchPe sends a PeCmd
        h.tile
            .tick(None, None, &mut h.tile_router, &mut h.shared_router, &clock)
            .unwrap();
        let pe_req = h.shared_router.fetch(h.pe_id, &clock).unwrap().unwrap();
        let (req_id, seq) = (pe_req.message_id, pe_req.seq_num);
        match pe_req.kind {
            MessageKind::PeCmd(c) => {
                assert_eq!(c.operation, Operator::Add);
                assert_eq!(bits_to_float(c.op1), 2.0);
                assert_eq!(bits_to_float(c.op2), 3.0);
            }
            _ => panic!("expected PeCmd"),
        }

        let pe_done = Message::new(
            MessageKind::PeDone { result: float_to_bits(5.0) },
            h.pe_id,
            h.tile.shared_id(),
            req_id,
            seq,
        );
        h.shared_router.send(pe_done, &clock).unwrap();
        let fetched_resp = h.shared_router.fetch(h.tile.shared_id(), &clock).unwrap();
        h.tile
            .tick(None, fetched_resp, &mut h.tile_router, &mut h.shared_router, &clock)
            .unwrap();

        // WriteBack sends a MemWrite of the result
        h.tile
            .tick(None, None, &mut h.tile_router, &mut h.shared_router, &clock)
            .unwrap();
        let mem_req = h.shared_router.fetch(h.mem_id, &clock).unwrap().unwrap();
        match mem_req.kind {
            MessageKind::MemWrite { addr, content } => {
                assert_eq!(addr, 0);
                assert_eq!(bits_to_float(content), 5.0);
            }
            _ => panic!("expected MemWrite"),
        }
        let mem_done = Message::new(
            MessageKind::MemWriteDone,
            h.mem_id,
            h.tile.shared_id(),
            mem_req.message_id,
            mem_req.seq_num,
        );
        h.shared_router.send(mem_done, &clock).unwrap();
        let fetched_resp = h.shared_router.fetch(h.tile.shared_id(), &clock).unwrap();
        h.tile
            .tick(None, fetched_resp, &mut h.tile_router, &mut h.shared_router, &clock)
            .unwrap();

        // SendAck
        h.tile
            .tick(None, None, &mut h.tile_router, &mut h.shared_router, &clock)
            .unwrap();
        let ack = h.tile_router.fetch(h.host_id, &clock).unwrap().unwrap();
        assert_eq!(ack.kind, MessageKind::TileDone);
        assert!(h.tile.is_idle());
    }

    #[test]
    fn dot_reads_all_row_addrs_before_any_col_addr() {
        let mut h = Harness::new();
        let clock = h.clock();
        let cmd = Message::new(
            MessageKind::TileCmd(TileCommand {
                res_addr: 10,
                dtype: DType::Fp32,
                op: TileOperation::Dot {
                    row_addrs: vec![0, 1],
                    col_addrs: vec![2, 3],
                    bias: None,
                },
            }),
            h.host_id,
            h.tile_id,
            MessageId(0),
            0,
        );
        h.tile_router.send(cmd, &clock).unwrap();
        let fetched = h.tile_router.fetch(h.tile_id, &clock).unwrap();
        h.tile
            .tick(fetched, None, &mut h.tile_router, &mut h.shared_router, &clock)
            .unwrap();

        let mut observed_addrs = Vec::new();
        for content in [10u32, 20, 30, 40] {
            h.tile
                .tick(None, None, &mut h.tile_router, &mut h.shared_router, &clock)
                .unwrap();
            let req = h.shared_router.fetch(h.mem_id, &clock).unwrap().unwrap();
            let addr = match req.kind {
                MessageKind::MemRead { addr } => addr,
                _ => panic!("expected MemRead"),
            };
            observed_addrs.push(addr);

            let done = Message::new(
                MessageKind::MemReadDone { addr, content },
                h.mem_id,
                h.tile.shared_id(),
                req.message_id,
                req.seq_num,
            );
            h.shared_router.send(done, &clock).unwrap();
            let resp = h.shared_router.fetch(h.tile.shared_id(), &clock).unwrap();
            h.tile
                .tick(None, resp, &mut h.tile_router, &mut h.shared_router, &clock)
                .unwrap();
        }

        assert_eq!(observed_addrs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn unresolved_addr_operand_triggers_a_memory_read_before_dispatch() {
        let mut h = Harness::new();
        let clock = h.clock();
        let cmd = Message::new(
            MessageKind::TileCmd(TileCommand {
                res_addr: 8,
                dtype: DType::Fp32,
                op: TileOperation::Binary {
                    op: BinaryOperator::Mul,
                    op1: Operand::Addr(4),
                    op2: Operand::Inline(float_to_bits(2.0)),
                },
            }),
            h.host_id,
            h.tile_id,
            MessageId(1),
            0,
        );
        h.tile_router.send(cmd, &clock).unwrap();
        let fetched = h.tile_router.fetch(h.tile_id, &clock).unwrap();
        h.tile
            .tick(fetched, None, &mut h.tile_router, &mut h.shared_router, &clock)
            .unwrap();

        // SendRead issues a MemRead for addr 4
        h.tile
            .tick(None, None, &mut h.tile_router, &mut h.shared_router, &clock)
            .unwrap();
        let mem_req = h.shared_router.fetch(h.mem_id, &clock).unwrap().unwrap();
        assert_eq!(mem_req.kind, MessageKind::MemRead { addr: 4 });
    }
}
