//! The top-level simulation driver.
//!
//! Owns the clock, both routers, the pipelined memory, and the tile/PE grid;
//! advances them all in the fixed per-tick visiting order: memory, then
//! tiles row-major, then each tile's PE. Grounded in
//! `original_source/accelerators/nio/nio.py`'s `Nio` (a `System` subclass):
//! `forward()` is this module's [`AcceleratorSystem::run_layer`].

use std::collections::VecDeque;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::AcceleratorConfig;
use crate::device::{Device, DeviceId};
use crate::memory::allocator::BitmapAllocator;
use crate::memory::memory_map::MemoryMap;
use crate::memory::pipeline::PipelinedMemory;
use crate::memory::Memory;
use crate::message::{Message, MessageId, MessageIdGen, MessageKind, TileCommand};
use crate::pe::Pe;
use crate::router::MessageRouter;
use crate::tile::Tile;

/// Summary statistics from one [`AcceleratorSystem::run_layer`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerReport {
    pub cycles: u64,
    pub stalled_cycles: u64,
}

/// The whole simulated accelerator: a tile-row x tile-col grid of
/// (`Tile`, `Pe`) pairs, a pipelined memory, and the two routers connecting
/// them.
pub struct AcceleratorSystem {
    clock: Clock,
    tile_router: MessageRouter,
    shared_router: MessageRouter,
    memory: PipelinedMemory,
    tiles: Vec<Vec<Tile>>,
    pes: Vec<Vec<Pe>>,
    host_id: DeviceId,
    mem_id: DeviceId,
    host_id_gen: MessageIdGen,
    pub allocator: BitmapAllocator,
    pub memory_map: MemoryMap,
}

impl AcceleratorSystem {
    pub fn new(config: &AcceleratorConfig) -> Self {
        let mut tile_router = MessageRouter::new();
        let mut shared_router = MessageRouter::new();

        let host_id = tile_router.add_connection(64);
        let mem_id = shared_router.add_connection(64);

        let num_cells = config.memory_words.unwrap_or(1 << 16);
        let memory = Memory::new(num_cells, 4, config.log_memory_trace);
        let pipelined_memory = PipelinedMemory::new(
            memory,
            mem_id,
            config.memory_pipeline_depth.unwrap_or(2),
        );

        let mut tiles = Vec::with_capacity(config.num_tile_rows);
        let mut pes = Vec::with_capacity(config.num_tile_rows);
        for _ in 0..config.num_tile_rows {
            let mut tile_row = Vec::with_capacity(config.num_tile_cols);
            let mut pe_row = Vec::with_capacity(config.num_tile_cols);
            for _ in 0..config.num_tile_cols {
                let tile_id = tile_router.add_connection(8);
                let tile_shared_id = shared_router.add_connection(8);
                let pe_id = shared_router.add_connection(1);
                tile_row.push(Tile::new(tile_id, tile_shared_id, mem_id, pe_id, 16));
                pe_row.push(Pe::new(pe_id));
            }
            tiles.push(tile_row);
            pes.push(pe_row);
        }

        Self {
            clock: Clock::new(),
            tile_router,
            shared_router,
            memory: pipelined_memory,
            tiles,
            pes,
            host_id,
            mem_id,
            host_id_gen: MessageIdGen::new(),
            allocator: BitmapAllocator::new(num_cells as u64 * 4, 4).expect("valid arena"),
            memory_map: MemoryMap::new(),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn memory(&self) -> &Memory {
        self.memory.memory()
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        self.memory.memory_mut()
    }

    pub fn host_id(&self) -> DeviceId {
        self.host_id
    }

    pub fn tile_device_id(&self, row: usize, col: usize) -> DeviceId {
        self.tiles[row][col].device_id()
    }

    /// Advances every device by exactly one cycle, in the fixed order:
    /// memory, then tiles row-major, then each tile's PE.
    fn tick(&mut self) {
        let mem_incoming = self.shared_router.fetch(self.mem_id, &self.clock).expect("memory is registered");
        self.memory
            .tick(mem_incoming, &mut self.shared_router, &self.clock)
            .expect("memory device is registered on the shared router");

        for row in 0..self.tiles.len() {
            for col in 0..self.tiles[row].len() {
                let tile_id = self.tiles[row][col].device_id();
                let shared_id = self.tiles[row][col].shared_id();
                let tile_cmd = self.tile_router.fetch(tile_id, &self.clock).expect("tile is registered");
                let shared_msg = self
                    .shared_router
                    .fetch(shared_id, &self.clock)
                    .expect("tile is registered on the shared router");
                match self.tiles[row][col].tick(
                    tile_cmd,
                    shared_msg,
                    &mut self.tile_router,
                    &mut self.shared_router,
                    &self.clock,
                ) {
                    Ok(_) => {}
                    Err(e) => panic!("tile ({row}, {col}) faulted: {e}"),
                }
            }
        }

        for row in 0..self.pes.len() {
            for col in 0..self.pes[row].len() {
                let pe_id = self.pes[row][col].device_id();
                let incoming = self.shared_router.fetch(pe_id, &self.clock).expect("pe is registered");
                self.pes[row][col]
                    .tick(incoming, &mut self.shared_router, &self.clock)
                    .expect("pe is registered on the shared router");
            }
        }

        self.clock.advance();
    }

    fn total_stalled_cycles(&self) -> u64 {
        let mut total = self.memory.stalled_cycles();
        for row in &self.tiles {
            for tile in row {
                total += tile.stalled_cycles();
            }
        }
        for row in &self.pes {
            for pe in row {
                total += pe.stalled_cycles();
            }
        }
        total
    }

    /// Submits one `TileCmd` per `(row, col, command)` triple and runs the
    /// clock until every one of them has been acknowledged with `TileDone`.
    /// Mirrors `Nio.forward`'s layer-driving loop.
    pub fn run_layer(&mut self, commands: Vec<((usize, usize), TileCommand)>) -> LayerReport {
        let start_cycle = self.clock.current();
        let total = commands.len();
        let mut pending: VecDeque<(DeviceId, MessageId, TileCommand)> = commands
            .into_iter()
            .map(|((row, col), cmd)| {
                let target = self.tile_device_id(row, col);
                (target, self.host_id_gen.next(), cmd)
            })
            .collect();
        let mut completed = 0usize;

        info!(total, "starting layer");

        while completed < total {
            // Drain as many queued commands as the per-tile queues will
            // accept this tick, so every idle tile can receive one in the
            // same cycle instead of admitting at most one command per tick.
            while let Some((target, message_id, cmd)) = pending.pop_front() {
                let msg = Message::new(
                    MessageKind::TileCmd(cmd.clone()),
                    self.host_id,
                    target,
                    message_id,
                    0,
                );
                if self
                    .tile_router
                    .send(msg, &self.clock)
                    .expect("tile target is always registered")
                {
                    continue;
                }
                pending.push_front((target, message_id, cmd));
                break;
            }

            self.tick();

            while let Some(done) = self
                .tile_router
                .fetch(self.host_id, &self.clock)
                .expect("host is registered")
            {
                if matches!(done.kind, MessageKind::TileDone) {
                    completed += 1;
                }
            }

            if self.total_stalled_cycles() > 0 && self.clock.current() % 64 == 0 {
                warn!(cycle = self.clock.current(), "layer still draining stalls");
            }
        }

        let report = LayerReport {
            cycles: self.clock.current() - start_cycle,
            stalled_cycles: self.total_stalled_cycles(),
        };
        info!(cycles = report.cycles, stalled = report.stalled_cycles, "layer complete");
        report
    }
}
