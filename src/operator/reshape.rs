//! Shape-only operators: `Reshape`/`Transpose`/`Squeeze` never touch device
//! memory or the tile grid, they just relabel the host-side tensor.
//!
//! Grounded in `original_source/operators/reshape.py`, `transpose.py` and
//! `squeeze.py`, whose `map`/`unmap`/`compile` are all no-ops; the actual
//! reshape happens directly on the host array.

use ndarray::ArrayD;

use super::FlexNode;
use crate::error::MemoryMapError;
use crate::message::TileCommand;
use crate::system::AcceleratorSystem;

pub struct Reshape {
    input: ArrayD<f32>,
    target_shape: Vec<usize>,
}

impl Reshape {
    pub fn new(input: ArrayD<f32>, target_shape: Vec<usize>) -> Self {
        Self { input, target_shape }
    }
}

impl FlexNode for Reshape {
    fn op_name(&self) -> &'static str {
        "reshape"
    }

    fn map(&mut self, _system: &mut AcceleratorSystem) -> Result<(), MemoryMapError> {
        Ok(())
    }

    fn compile(&self, _system: &AcceleratorSystem, _rows: usize, _cols: usize) -> Vec<((usize, usize), TileCommand)> {
        Vec::new()
    }

    fn unmap(&mut self, _system: &mut AcceleratorSystem) -> Result<ArrayD<f32>, MemoryMapError> {
        Ok(self
            .input
            .clone()
            .into_shape_with_order(self.target_shape.clone())
            .expect("reshape target must hold the same number of elements"))
    }
}

pub struct Transpose {
    input: ArrayD<f32>,
    axes: Vec<usize>,
}

impl Transpose {
    /// `axes` is a permutation of `0..input.ndim()`; an empty slice reverses
    /// all axes, matching ONNX `Transpose`'s default.
    pub fn new(input: ArrayD<f32>, axes: Vec<usize>) -> Self {
        let axes = if axes.is_empty() { (0..input.ndim()).rev().collect() } else { axes };
        Self { input, axes }
    }
}

impl FlexNode for Transpose {
    fn op_name(&self) -> &'static str {
        "transpose"
    }

    fn map(&mut self, _system: &mut AcceleratorSystem) -> Result<(), MemoryMapError> {
        Ok(())
    }

    fn compile(&self, _system: &AcceleratorSystem, _rows: usize, _cols: usize) -> Vec<((usize, usize), TileCommand)> {
        Vec::new()
    }

    fn unmap(&mut self, _system: &mut AcceleratorSystem) -> Result<ArrayD<f32>, MemoryMapError> {
        Ok(self.input.clone().permuted_axes(self.axes.clone()))
    }
}

pub struct Squeeze {
    input: ArrayD<f32>,
    axes: Vec<usize>,
}

impl Squeeze {
    /// `axes` names the size-1 dimensions to drop; empty drops every size-1
    /// dimension, matching ONNX `Squeeze`'s default.
    pub fn new(input: ArrayD<f32>, axes: Vec<usize>) -> Self {
        Self { input, axes }
    }
}

impl FlexNode for Squeeze {
    fn op_name(&self) -> &'static str {
        "squeeze"
    }

    fn map(&mut self, _system: &mut AcceleratorSystem) -> Result<(), MemoryMapError> {
        Ok(())
    }

    fn compile(&self, _system: &AcceleratorSystem, _rows: usize, _cols: usize) -> Vec<((usize, usize), TileCommand)> {
        Vec::new()
    }

    fn unmap(&mut self, _system: &mut AcceleratorSystem) -> Result<ArrayD<f32>, MemoryMapError> {
        let shape: Vec<usize> = if self.axes.is_empty() {
            self.input.shape().iter().copied().filter(|&d| d != 1).collect()
        } else {
            self.input
                .shape()
                .iter()
                .enumerate()
                .filter(|(i, &d)| !(self.axes.contains(i) && d == 1))
                .map(|(_, &d)| d)
                .collect()
        };
        Ok(self.input.clone().into_shape_with_order(shape).expect("squeezed axes must all be size 1"))
    }
}
