//! Dense matrix multiply: one `Dot` `TileCmd` per output element.
//!
//! Grounded in `original_source/operators/gemm.py`'s plain-matmul path (no
//! alpha/beta/bias/transpose — see [`super::gemm::Gemm`] for the general
//! form).

use ndarray::{Array2, ArrayD};

use super::{read_back, round_robin_tiles, write_in, FlexNode};
use crate::error::MemoryMapError;
use crate::memory::memory_map::TensorHandle;
use crate::message::{DType, TileCommand, TileOperation};
use crate::system::AcceleratorSystem;

pub struct MatMul {
    lhs: Array2<f32>,
    rhs: Array2<f32>,
    lhs_handle: TensorHandle,
    rhs_handle: TensorHandle,
    out_handle: TensorHandle,
}

impl MatMul {
    pub fn new(lhs: Array2<f32>, rhs: Array2<f32>, handle_base: u64) -> Self {
        assert_eq!(lhs.ncols(), rhs.nrows(), "matmul inner dimensions must match");
        Self {
            lhs,
            rhs,
            lhs_handle: TensorHandle(handle_base),
            rhs_handle: TensorHandle(handle_base + 1),
            out_handle: TensorHandle(handle_base + 2),
        }
    }

    fn out_shape(&self) -> (usize, usize) {
        (self.lhs.nrows(), self.rhs.ncols())
    }
}

impl FlexNode for MatMul {
    fn op_name(&self) -> &'static str {
        "matmul"
    }

    fn map(&mut self, system: &mut AcceleratorSystem) -> Result<(), MemoryMapError> {
        system.memory_map.map(self.lhs_handle, self.lhs.len(), &mut system.allocator)?;
        system.memory_map.map(self.rhs_handle, self.rhs.len(), &mut system.allocator)?;
        let (m, n) = self.out_shape();
        system.memory_map.map(self.out_handle, m * n, &mut system.allocator)?;
        write_in(system, self.lhs_handle, self.lhs.as_standard_layout().as_slice().unwrap())?;
        write_in(system, self.rhs_handle, self.rhs.as_standard_layout().as_slice().unwrap())?;
        Ok(())
    }

    fn compile(&self, system: &AcceleratorSystem, rows: usize, cols: usize) -> Vec<((usize, usize), TileCommand)> {
        let (m, n) = self.out_shape();
        let k = self.lhs.ncols();
        let tiles = round_robin_tiles(m * n, rows, cols);

        let mut commands = Vec::with_capacity(m * n);
        for out_row in 0..m {
            for out_col in 0..n {
                let row_addrs: Vec<u64> = (0..k)
                    .map(|i| {
                        system
                            .memory_map
                            .element_addr(self.lhs_handle, out_row * k + i)
                            .expect("mapped")
                    })
                    .collect();
                let col_addrs: Vec<u64> = (0..k)
                    .map(|i| {
                        system
                            .memory_map
                            .element_addr(self.rhs_handle, i * n + out_col)
                            .expect("mapped")
                    })
                    .collect();
                let res_addr = system
                    .memory_map
                    .element_addr(self.out_handle, out_row * n + out_col)
                    .expect("mapped");
                let cmd = TileCommand {
                    res_addr,
                    dtype: DType::Fp32,
                    op: TileOperation::Dot { row_addrs, col_addrs, bias: None },
                };
                commands.push((tiles[out_row * n + out_col], cmd));
            }
        }
        commands
    }

    fn unmap(&mut self, system: &mut AcceleratorSystem) -> Result<ArrayD<f32>, MemoryMapError> {
        let (m, n) = self.out_shape();
        let flat = read_back(system, self.out_handle, m * n)?;
        system.memory_map.unmap(self.lhs_handle, &mut system.allocator)?;
        system.memory_map.unmap(self.rhs_handle, &mut system.allocator)?;
        system.memory_map.unmap(self.out_handle, &mut system.allocator)?;
        Ok(Array2::from_shape_vec((m, n), flat).expect("compile emits exactly m*n elements").into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    #[should_panic(expected = "inner dimensions must match")]
    fn mismatched_inner_dimensions_is_a_programming_error() {
        MatMul::new(array![[1.0, 2.0]], array![[1.0], [2.0], [3.0]], 0);
    }

    #[test]
    fn out_shape_is_lhs_rows_by_rhs_cols() {
        let m = MatMul::new(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]], array![[1.0, 0.0], [0.0, 1.0]], 0);
        assert_eq!(m.out_shape(), (3, 2));
    }
}
