//! Reference operators: the handful of built-in compute graphs the host can
//! lower onto the tile grid without a full neural-network-graph compiler.
//!
//! Every operator maps its host-side [`ndarray::ArrayD<f32>`] operands into
//! device memory, compiles itself to a flat list of per-tile `TileCmd`s
//! (round-robin across the tile grid), and unmaps its output back out once
//! the layer finishes. Grounded in `original_source/operators/*.py`, whose
//! `FlexNode` base class has the same three-method shape.

pub mod conv2d;
pub mod elementwise;
pub mod gemm;
pub mod matmul;
pub mod relu;
pub mod reshape;

use ndarray::ArrayD;

use crate::error::MemoryMapError;
use crate::memory::memory_map::TensorHandle;
use crate::message::TileCommand;
use crate::system::AcceleratorSystem;

/// An operator capable of running on the tile grid.
pub trait FlexNode {
    fn op_name(&self) -> &'static str;

    /// Allocates device memory for every operand and writes operand
    /// contents in. Must run before `compile`.
    fn map(&mut self, system: &mut AcceleratorSystem) -> Result<(), MemoryMapError>;

    /// Produces the flat list of `(tile, command)` pairs this operator
    /// lowers to, round-robining across the `rows x cols` tile grid. Must
    /// run after `map`, since it resolves operand addresses through
    /// `system.memory_map`.
    fn compile(&self, system: &AcceleratorSystem, rows: usize, cols: usize) -> Vec<((usize, usize), TileCommand)>;

    /// Reads the output tensor back out of device memory and releases every
    /// operand's mapping. Must run after the layer that `compile`'s
    /// commands were submitted in has completed.
    fn unmap(&mut self, system: &mut AcceleratorSystem) -> Result<ArrayD<f32>, MemoryMapError>;
}

/// Assigns tiles round-robin, row-major, to `count` independent units of
/// work. Shared by every reference operator's `compile`.
pub(crate) fn round_robin_tiles(count: usize, rows: usize, cols: usize) -> Vec<(usize, usize)> {
    let total = rows * cols;
    (0..count)
        .map(|i| {
            let slot = i % total;
            (slot / cols, slot % cols)
        })
        .collect()
}

pub(crate) fn read_back(
    system: &mut AcceleratorSystem,
    handle: TensorHandle,
    len: usize,
) -> Result<Vec<f32>, MemoryMapError> {
    let base = system.memory_map.lookup(handle)?;
    let mut out = Vec::with_capacity(len);
    let clock_cycle = system.clock().current();
    for i in 0..len {
        let bits = system
            .memory_mut()
            .peek(base + i as u64 * 4, clock_cycle)
            .expect("operator reads back only addresses it mapped and wrote");
        out.push(f32::from_bits(bits));
    }
    Ok(out)
}

pub(crate) fn write_in(
    system: &mut AcceleratorSystem,
    handle: TensorHandle,
    data: &[f32],
) -> Result<(), MemoryMapError> {
    let base = system.memory_map.lookup(handle)?;
    let clock_cycle = system.clock().current();
    for (i, &v) in data.iter().enumerate() {
        system
            .memory_mut()
            .poke(base + i as u64 * 4, v.to_bits(), clock_cycle)
            .expect("operator writes only addresses it just allocated");
    }
    Ok(())
}
