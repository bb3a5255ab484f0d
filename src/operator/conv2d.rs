//! 2-D convolution, NCHW layout, single group: one `Dot` `TileCmd` per
//! `(batch, out_channel, out_row, out_col)` output element, gathering the
//! receptive field and kernel weights as address lists.
//!
//! Grounded in `original_source/operators/conv.py`. That source supports
//! `auto_pad`/explicit `pads`/dilation/groups; `Dot`'s address lists have no
//! inline-zero operand to stand in for a padded-out position, so this only
//! implements the "valid" padding case (`pads` all zero, dilation 1, group
//! 1) — padded/grouped/dilated convolution is left for a future operator
//! that lowers to more than a single `Dot` per output.

use itertools::iproduct;
use ndarray::{Array4, ArrayD};

use super::{read_back, round_robin_tiles, write_in, FlexNode};
use crate::error::MemoryMapError;
use crate::memory::memory_map::TensorHandle;
use crate::message::{DType, TileCommand, TileOperation};
use crate::system::AcceleratorSystem;

pub struct Conv2d {
    /// `(batch, in_channels, height, width)`.
    input: Array4<f32>,
    /// `(out_channels, in_channels, kernel_h, kernel_w)`.
    weight: Array4<f32>,
    bias: Option<Vec<f32>>,
    stride: (usize, usize),
    input_handle: TensorHandle,
    weight_handle: TensorHandle,
    bias_handle: Option<TensorHandle>,
    out_handle: TensorHandle,
}

impl Conv2d {
    pub fn new(input: Array4<f32>, weight: Array4<f32>, bias: Option<Vec<f32>>, stride: (usize, usize), handle_base: u64) -> Self {
        assert_eq!(input.shape()[1], weight.shape()[1], "input and kernel channel counts must match");
        if let Some(b) = &bias {
            assert_eq!(b.len(), weight.shape()[0], "bias length must match out_channels");
        }
        assert!(stride.0 > 0 && stride.1 > 0, "stride must be positive");
        let bias_handle = bias.as_ref().map(|_| TensorHandle(handle_base + 2));
        Self {
            input,
            weight,
            bias,
            stride,
            input_handle: TensorHandle(handle_base),
            weight_handle: TensorHandle(handle_base + 1),
            bias_handle,
            out_handle: TensorHandle(handle_base + 3),
        }
    }

    /// `(batch, out_channels, out_h, out_w)`, valid padding.
    fn out_shape(&self) -> (usize, usize, usize, usize) {
        let (n, _, h, w) = self.input.dim();
        let (out_c, _, kh, kw) = self.weight.dim();
        let out_h = (h - kh) / self.stride.0 + 1;
        let out_w = (w - kw) / self.stride.1 + 1;
        (n, out_c, out_h, out_w)
    }
}

impl FlexNode for Conv2d {
    fn op_name(&self) -> &'static str {
        "conv2d"
    }

    fn map(&mut self, system: &mut AcceleratorSystem) -> Result<(), MemoryMapError> {
        system.memory_map.map(self.input_handle, self.input.len(), &mut system.allocator)?;
        system.memory_map.map(self.weight_handle, self.weight.len(), &mut system.allocator)?;
        let (n, out_c, out_h, out_w) = self.out_shape();
        system.memory_map.map(self.out_handle, n * out_c * out_h * out_w, &mut system.allocator)?;
        write_in(system, self.input_handle, self.input.as_standard_layout().as_slice().unwrap())?;
        write_in(system, self.weight_handle, self.weight.as_standard_layout().as_slice().unwrap())?;
        if let (Some(handle), Some(bias)) = (self.bias_handle, &self.bias) {
            system.memory_map.map(handle, bias.len(), &mut system.allocator)?;
            write_in(system, handle, bias)?;
        }
        Ok(())
    }

    fn compile(&self, system: &AcceleratorSystem, rows: usize, cols: usize) -> Vec<((usize, usize), TileCommand)> {
        let (n, out_c, out_h, out_w) = self.out_shape();
        let (_, in_c, in_h, in_w) = self.input.dim();
        let (_, _, kh, kw) = self.weight.dim();
        let count = n * out_c * out_h * out_w;
        let tiles = round_robin_tiles(count, rows, cols);

        let input_index = |b: usize, c: usize, y: usize, x: usize| ((b * in_c + c) * in_h + y) * in_w + x;
        let weight_index = |oc: usize, c: usize, y: usize, x: usize| ((oc * in_c + c) * kh + y) * kw + x;

        let mut commands = Vec::with_capacity(count);
        for (idx, (b, oc, oy, ox)) in iproduct!(0..n, 0..out_c, 0..out_h, 0..out_w).enumerate() {
            let mut row_addrs = Vec::with_capacity(in_c * kh * kw);
            let mut col_addrs = Vec::with_capacity(in_c * kh * kw);
            for (c, ky, kx) in iproduct!(0..in_c, 0..kh, 0..kw) {
                let iy = oy * self.stride.0 + ky;
                let ix = ox * self.stride.1 + kx;
                row_addrs.push(
                    system
                        .memory_map
                        .element_addr(self.input_handle, input_index(b, c, iy, ix))
                        .expect("mapped"),
                );
                col_addrs.push(
                    system
                        .memory_map
                        .element_addr(self.weight_handle, weight_index(oc, c, ky, kx))
                        .expect("mapped"),
                );
            }
            let bias = self.bias_handle.map(|h| system.memory_map.element_addr(h, oc).expect("mapped"));
            let res_addr = system.memory_map.element_addr(self.out_handle, idx).expect("mapped");
            let cmd = TileCommand {
                res_addr,
                dtype: DType::Fp32,
                op: TileOperation::Dot { row_addrs, col_addrs, bias },
            };
            commands.push((tiles[idx], cmd));
        }
        commands
    }

    fn unmap(&mut self, system: &mut AcceleratorSystem) -> Result<ArrayD<f32>, MemoryMapError> {
        let (n, out_c, out_h, out_w) = self.out_shape();
        let flat = read_back(system, self.out_handle, n * out_c * out_h * out_w)?;
        system.memory_map.unmap(self.input_handle, &mut system.allocator)?;
        system.memory_map.unmap(self.weight_handle, &mut system.allocator)?;
        if let Some(handle) = self.bias_handle {
            system.memory_map.unmap(handle, &mut system.allocator)?;
        }
        system.memory_map.unmap(self.out_handle, &mut system.allocator)?;
        Ok(Array4::from_shape_vec((n, out_c, out_h, out_w), flat)
            .expect("compile emits exactly n*out_c*out_h*out_w elements")
            .into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_mode_output_shape_has_no_padding() {
        let input = Array4::<f32>::zeros((1, 1, 4, 4));
        let weight = Array4::<f32>::zeros((2, 1, 3, 3));
        let conv = Conv2d::new(input, weight, None, (1, 1), 0);
        assert_eq!(conv.out_shape(), (1, 2, 2, 2));
    }

    #[test]
    fn stride_two_halves_the_spatial_output() {
        let input = Array4::<f32>::zeros((1, 1, 5, 5));
        let weight = Array4::<f32>::zeros((1, 1, 3, 3));
        let conv = Conv2d::new(input, weight, None, (2, 2), 0);
        assert_eq!(conv.out_shape(), (1, 1, 2, 2));
    }

    #[test]
    #[should_panic(expected = "channel counts must match")]
    fn mismatched_channels_is_a_programming_error() {
        let input = Array4::<f32>::zeros((1, 3, 4, 4));
        let weight = Array4::<f32>::zeros((2, 1, 3, 3));
        let _ = Conv2d::new(input, weight, None, (1, 1), 0);
    }

    #[test]
    fn one_by_one_kernel_degenerates_to_a_per_pixel_dot() {
        let input = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0_f32, 2.0, 3.0, 4.0]).unwrap();
        let weight = Array4::<f32>::from_elem((1, 1, 1, 1), 2.0);
        let conv = Conv2d::new(input, weight, None, (1, 1), 0);
        assert_eq!(conv.out_shape(), (1, 1, 2, 2));
    }
}
