//! ReLU: one `TileCmd` per element, `Max` against an inlined `0.0`.
//!
//! Grounded in `original_source/operators/relu.py`.

use ndarray::ArrayD;

use super::{read_back, round_robin_tiles, write_in, FlexNode};
use crate::error::MemoryMapError;
use crate::memory::memory_map::TensorHandle;
use crate::message::{BinaryOperator, DType, Operand, TileCommand, TileOperation};
use crate::system::AcceleratorSystem;

pub struct Relu {
    input: ArrayD<f32>,
    in_handle: TensorHandle,
    out_handle: TensorHandle,
}

impl Relu {
    pub fn new(input: ArrayD<f32>, handle_base: u64) -> Self {
        Self {
            input,
            in_handle: TensorHandle(handle_base),
            out_handle: TensorHandle(handle_base + 1),
        }
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }
}

impl FlexNode for Relu {
    fn op_name(&self) -> &'static str {
        "relu"
    }

    fn map(&mut self, system: &mut AcceleratorSystem) -> Result<(), MemoryMapError> {
        let len = self.len();
        system.memory_map.map(self.in_handle, len, &mut system.allocator)?;
        system.memory_map.map(self.out_handle, len, &mut system.allocator)?;
        write_in(system, self.in_handle, self.input.as_slice().expect("contiguous"))
    }

    fn compile(&self, system: &AcceleratorSystem, rows: usize, cols: usize) -> Vec<((usize, usize), TileCommand)> {
        let len = self.len();
        let tiles = round_robin_tiles(len, rows, cols);
        (0..len)
            .map(|i| {
                let cmd = TileCommand {
                    res_addr: system.memory_map.element_addr(self.out_handle, i).expect("mapped"),
                    dtype: DType::Fp32,
                    op: TileOperation::Binary {
                        op: BinaryOperator::Max,
                        op1: Operand::Addr(system.memory_map.element_addr(self.in_handle, i).expect("mapped")),
                        op2: Operand::Inline(0.0f32.to_bits()),
                    },
                };
                (tiles[i], cmd)
            })
            .collect()
    }

    fn unmap(&mut self, system: &mut AcceleratorSystem) -> Result<ArrayD<f32>, MemoryMapError> {
        let len = self.len();
        let flat = read_back(system, self.out_handle, len)?;
        system.memory_map.unmap(self.in_handle, &mut system.allocator)?;
        system.memory_map.unmap(self.out_handle, &mut system.allocator)?;
        Ok(ArrayD::from_shape_vec(self.input.shape(), flat).expect("compile emits exactly len elements"))
    }
}
