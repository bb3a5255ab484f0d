//! General matrix multiply: `alpha * op(A) @ op(B) + beta * C`, where `op` is
//! an optional transpose.
//!
//! Grounded in `original_source/operators/gemm.py`. The tile grid only ever
//! executes a plain dot-product-plus-bias ([`crate::message::TileOperation::Dot`]),
//! so `alpha`/`beta`/transposition are folded in host-side before mapping:
//! `alpha * op(A) @ op(B) == (alpha * op(A)) @ op(B)`, and the bias term the
//! tile adds is literally `1.0 * bias_addr`, so staging `beta * C` into the
//! bias tensor reproduces `beta * C` exactly without a new PE instruction.

use ndarray::{Array2, ArrayD};

use super::{read_back, round_robin_tiles, write_in, FlexNode};
use crate::error::MemoryMapError;
use crate::memory::memory_map::TensorHandle;
use crate::message::{DType, TileCommand, TileOperation};
use crate::system::AcceleratorSystem;

pub struct Gemm {
    a: Array2<f32>,
    b: Array2<f32>,
    bias: Option<Array2<f32>>,
    a_handle: TensorHandle,
    b_handle: TensorHandle,
    bias_handle: Option<TensorHandle>,
    out_handle: TensorHandle,
}

impl Gemm {
    /// `a` and `b` are given un-transposed; `trans_a`/`trans_b` are applied
    /// here before anything is mapped. `bias`, if given, must already be
    /// shaped `(a.rows, b.cols)`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        a: Array2<f32>,
        b: Array2<f32>,
        alpha: f32,
        beta: f32,
        trans_a: bool,
        trans_b: bool,
        bias: Option<Array2<f32>>,
        handle_base: u64,
    ) -> Self {
        let a = if trans_a { a.t().to_owned() } else { a };
        let b = if trans_b { b.t().to_owned() } else { b };
        assert_eq!(a.ncols(), b.nrows(), "gemm inner dimensions must match");
        let a = a.mapv(|v| v * alpha);
        let bias = bias.map(|c| {
            assert_eq!(c.nrows(), a.nrows(), "bias rows must match output rows");
            assert_eq!(c.ncols(), b.ncols(), "bias cols must match output cols");
            c.mapv(|v| v * beta)
        });
        let bias_handle = bias.as_ref().map(|_| TensorHandle(handle_base + 2));
        Self {
            a,
            b,
            bias,
            a_handle: TensorHandle(handle_base),
            b_handle: TensorHandle(handle_base + 1),
            bias_handle,
            out_handle: TensorHandle(handle_base + 3),
        }
    }

    fn out_shape(&self) -> (usize, usize) {
        (self.a.nrows(), self.b.ncols())
    }
}

impl FlexNode for Gemm {
    fn op_name(&self) -> &'static str {
        "gemm"
    }

    fn map(&mut self, system: &mut AcceleratorSystem) -> Result<(), MemoryMapError> {
        system.memory_map.map(self.a_handle, self.a.len(), &mut system.allocator)?;
        system.memory_map.map(self.b_handle, self.b.len(), &mut system.allocator)?;
        let (m, n) = self.out_shape();
        system.memory_map.map(self.out_handle, m * n, &mut system.allocator)?;
        write_in(system, self.a_handle, self.a.as_standard_layout().as_slice().unwrap())?;
        write_in(system, self.b_handle, self.b.as_standard_layout().as_slice().unwrap())?;
        if let (Some(handle), Some(bias)) = (self.bias_handle, &self.bias) {
            system.memory_map.map(handle, bias.len(), &mut system.allocator)?;
            write_in(system, handle, bias.as_standard_layout().as_slice().unwrap())?;
        }
        Ok(())
    }

    fn compile(&self, system: &AcceleratorSystem, rows: usize, cols: usize) -> Vec<((usize, usize), TileCommand)> {
        let (m, n) = self.out_shape();
        let k = self.a.ncols();
        let tiles = round_robin_tiles(m * n, rows, cols);

        let mut commands = Vec::with_capacity(m * n);
        for out_row in 0..m {
            for out_col in 0..n {
                let row_addrs: Vec<u64> = (0..k)
                    .map(|i| system.memory_map.element_addr(self.a_handle, out_row * k + i).expect("mapped"))
                    .collect();
                let col_addrs: Vec<u64> = (0..k)
                    .map(|i| system.memory_map.element_addr(self.b_handle, i * n + out_col).expect("mapped"))
                    .collect();
                let bias = self
                    .bias_handle
                    .map(|h| system.memory_map.element_addr(h, out_row * n + out_col).expect("mapped"));
                let res_addr = system
                    .memory_map
                    .element_addr(self.out_handle, out_row * n + out_col)
                    .expect("mapped");
                let cmd = TileCommand {
                    res_addr,
                    dtype: DType::Fp32,
                    op: TileOperation::Dot { row_addrs, col_addrs, bias },
                };
                commands.push((tiles[out_row * n + out_col], cmd));
            }
        }
        commands
    }

    fn unmap(&mut self, system: &mut AcceleratorSystem) -> Result<ArrayD<f32>, MemoryMapError> {
        let (m, n) = self.out_shape();
        let flat = read_back(system, self.out_handle, m * n)?;
        system.memory_map.unmap(self.a_handle, &mut system.allocator)?;
        system.memory_map.unmap(self.b_handle, &mut system.allocator)?;
        if let Some(handle) = self.bias_handle {
            system.memory_map.unmap(handle, &mut system.allocator)?;
        }
        system.memory_map.unmap(self.out_handle, &mut system.allocator)?;
        Ok(Array2::from_shape_vec((m, n), flat).expect("compile emits exactly m*n elements").into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn alpha_scales_the_lhs_before_mapping() {
        let a = array![[1.0_f32, 2.0], [3.0, 4.0]];
        let b = array![[1.0_f32, 0.0], [0.0, 1.0]];
        let gemm = Gemm::new(a, b, 2.0, 1.0, false, false, None, 0);
        assert_eq!(gemm.a, array![[2.0, 4.0], [6.0, 8.0]]);
    }

    #[test]
    fn beta_scales_the_bias_before_mapping() {
        let a = array![[1.0_f32, 0.0], [0.0, 1.0]];
        let b = array![[1.0_f32, 0.0], [0.0, 1.0]];
        let bias = array![[10.0_f32, 20.0], [30.0, 40.0]];
        let gemm = Gemm::new(a, b, 1.0, 0.5, false, false, Some(bias), 0);
        assert_eq!(gemm.bias, Some(array![[5.0, 10.0], [15.0, 20.0]]));
    }

    #[test]
    fn trans_a_transposes_before_the_dimension_check() {
        let a = array![[1.0_f32, 2.0], [3.0, 4.0], [5.0, 6.0]]; // 3x2, transposed to 2x3
        let b = Array2::<f32>::zeros((3, 4));
        let gemm = Gemm::new(a, b, 1.0, 1.0, true, false, None, 0);
        assert_eq!(gemm.out_shape(), (2, 4));
    }

    #[test]
    #[should_panic(expected = "inner dimensions must match")]
    fn mismatched_inner_dimensions_is_a_programming_error() {
        let a = array![[1.0_f32, 2.0]];
        let b = array![[1.0_f32, 2.0]];
        let _ = Gemm::new(a, b, 1.0, 1.0, false, false, None, 0);
    }
}
