//! Elementwise binary arithmetic: Add/Sub/Mul/Div/Max/Min over two
//! identically-shaped tensors, one `TileCmd` per output element.
//!
//! Grounded in `original_source/operators/arithemetic.py`.

use ndarray::ArrayD;

use super::{read_back, round_robin_tiles, write_in, FlexNode};
use crate::error::MemoryMapError;
use crate::memory::memory_map::TensorHandle;
use crate::message::{BinaryOperator, DType, Operand, TileCommand, TileOperation};
use crate::system::AcceleratorSystem;

pub struct ElementWise {
    op: BinaryOperator,
    lhs: ArrayD<f32>,
    rhs: ArrayD<f32>,
    lhs_handle: TensorHandle,
    rhs_handle: TensorHandle,
    out_handle: TensorHandle,
}

impl ElementWise {
    pub fn new(op: BinaryOperator, lhs: ArrayD<f32>, rhs: ArrayD<f32>, handle_base: u64) -> Self {
        assert_eq!(lhs.shape(), rhs.shape(), "elementwise operands must share a shape");
        Self {
            op,
            lhs,
            rhs,
            lhs_handle: TensorHandle(handle_base),
            rhs_handle: TensorHandle(handle_base + 1),
            out_handle: TensorHandle(handle_base + 2),
        }
    }

    pub fn len(&self) -> usize {
        self.lhs.len()
    }

    pub fn shape(&self) -> &[usize] {
        self.lhs.shape()
    }
}

impl FlexNode for ElementWise {
    fn op_name(&self) -> &'static str {
        "elementwise"
    }

    fn map(&mut self, system: &mut AcceleratorSystem) -> Result<(), MemoryMapError> {
        let len = self.len();
        system.memory_map.map(self.lhs_handle, len, &mut system.allocator)?;
        system.memory_map.map(self.rhs_handle, len, &mut system.allocator)?;
        system.memory_map.map(self.out_handle, len, &mut system.allocator)?;
        write_in(system, self.lhs_handle, self.lhs.as_slice().expect("contiguous"))?;
        write_in(system, self.rhs_handle, self.rhs.as_slice().expect("contiguous"))?;
        Ok(())
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
                        op: self.op,
                        op1: Operand::Addr(system.memory_map.element_addr(self.lhs_handle, i).expect("mapped")),
                        op2: Operand::Addr(system.memory_map.element_addr(self.rhs_handle, i).expect("mapped")),
                    },
                };
                (tiles[i], cmd)
            })
            .collect()
    }

    fn unmap(&mut self, system: &mut AcceleratorSystem) -> Result<ArrayD<f32>, MemoryMapError> {
        let len = self.len();
        let flat = read_back(system, self.out_handle, len)?;
        system.memory_map.unmap(self.lhs_handle, &mut system.allocator)?;
        system.memory_map.unmap(self.rhs_handle, &mut system.allocator)?;
        system.memory_map.unmap(self.out_handle, &mut system.allocator)?;
        Ok(ArrayD::from_shape_vec(self.lhs.shape(), flat).expect("compile emits exactly len elements"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    #[should_panic(expected = "must share a shape")]
    fn mismatched_operand_shapes_is_a_programming_error() {
        ElementWise::new(BinaryOperator::Add, arr1(&[1.0, 2.0]).into_dyn(), arr1(&[1.0, 2.0, 3.0]).into_dyn(), 0);
    }

    #[test]
    fn len_and_shape_reflect_the_operands() {
        let ew = ElementWise::new(BinaryOperator::Sub, arr1(&[1.0, 2.0, 3.0]).into_dyn(), arr1(&[1.0, 1.0, 1.0]).into_dyn(), 0);
        assert_eq!(ew.len(), 3);
        assert_eq!(ew.shape(), &[3]);
    }
}
