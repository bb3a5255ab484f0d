//! Maps host-side tensors onto addresses in the simulated off-chip memory.
//!
//! Grounded in `original_source/core/memory_map.py`'s `MemoryMapper`, which
//! keys its map by `id(array)` (Python object identity). Rust has no stable
//! analogue to `id()` for arbitrary values, so callers mint an opaque
//! [`TensorHandle`] up front and use it as the map key instead -- the same
//! "a tensor maps to exactly one base address" contract, expressed with a
//! value the type system can track.

use std::collections::HashMap;

use crate::error::MemoryMapError;
use crate::memory::allocator::BitmapAllocator;
use crate::message::{bits_to_float, float_to_bits};

/// An opaque identity for a host-side tensor that has been (or is about to
/// be) mapped into device memory. Mint one per logical tensor with
/// [`TensorHandle::new`]; never reuse a handle across independently mapped
/// tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle(pub u64);

/// Tracks which tensors are resident in memory and where.
pub struct MemoryMap {
    base_addr: HashMap<TensorHandle, u64>,
    len: HashMap<TensorHandle, usize>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self {
            base_addr: HashMap::new(),
            len: HashMap::new(),
        }
    }

    pub fn is_mapped(&self, handle: TensorHandle) -> bool {
        self.base_addr.contains_key(&handle)
    }

    /// Allocates `num_elements` f32 cells for `handle` and records the
    /// mapping. Fatal if `handle` is already mapped.
    pub fn map(
        &mut self,
        handle: TensorHandle,
        num_elements: usize,
        allocator: &mut BitmapAllocator,
    ) -> Result<u64, MemoryMapError> {
        if self.is_mapped(handle) {
            return Err(MemoryMapError::DoubleMap);
        }
        let word_bytes = allocator.grain_bytes().max(4);
        let addr = allocator
            .alloc(num_elements as u64 * word_bytes)
            .ok_or(MemoryMapError::OutOfMemory)?;
        self.base_addr.insert(handle, addr);
        self.len.insert(handle, num_elements);
        Ok(addr)
    }

    /// Releases `handle`'s mapping, freeing its underlying allocation.
    pub fn unmap(
        &mut self,
        handle: TensorHandle,
        allocator: &mut BitmapAllocator,
    ) -> Result<(), MemoryMapError> {
        let addr = self
            .base_addr
            .remove(&handle)
            .ok_or(MemoryMapError::NotMapped)?;
        self.len.remove(&handle);
        allocator
            .free(addr)
            .map_err(|_| MemoryMapError::NotMapped)?;
        Ok(())
    }

    /// The base address `handle` was mapped to.
    pub fn lookup(&self, handle: TensorHandle) -> Result<u64, MemoryMapError> {
        self.base_addr.get(&handle).copied().ok_or(MemoryMapError::NotMapped)
    }

    /// The address of element `index` within `handle`'s tensor.
    pub fn element_addr(&self, handle: TensorHandle, index: usize) -> Result<u64, MemoryMapError> {
        let base = self.lookup(handle)?;
        Ok(base + index as u64 * 4)
    }

    /// Encodes a host-side `&[f32]` slice into the bit patterns
    /// [`crate::memory::Memory`] stores, in element order.
    pub fn sys2mem(data: &[f32]) -> Vec<u32> {
        data.iter().map(|&v| float_to_bits(v)).collect()
    }

    /// The inverse of [`MemoryMap::sys2mem`].
    pub fn mem2sys(data: &[u32]) -> Vec<f32> {
        data.iter().map(|&b| bits_to_float(b)).collect()
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}
