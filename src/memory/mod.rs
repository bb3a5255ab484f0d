//! The off-chip memory subsystem: backing store, bitmap allocator, tensor
//! memory map, and the pipelined read/write engine that sits on the device
//! router.

pub mod allocator;
pub mod memory_map;
pub mod pipeline;

use tracing::debug;

use crate::error::MemoryError;

/// The linear backing store.
///
/// Every cell starts as the "unread" sentinel (`None`): `peek`ing an
/// uninitialized cell is a fatal programming error — a simulator bug,
/// never a transient fault. Grounded in `original_source/core/memory.py`.
pub struct Memory {
    cells: Vec<Option<u32>>,
    word_bytes: usize,
    transaction_log: Option<Vec<String>>,
}

impl Memory {
    pub fn new(num_cells: usize, word_bytes: usize, log_transactions: bool) -> Self {
        assert!(num_cells > 0, "memory must have at least one cell");
        assert!(word_bytes > 0, "word size must be at least one byte");
        Self {
            cells: vec![None; num_cells],
            word_bytes,
            transaction_log: log_transactions.then(Vec::new),
        }
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.cells.len() * self.word_bytes
    }

    fn bounds_check(&self, addr: u64) -> Result<usize, MemoryError> {
        let idx = usize::try_from(addr).unwrap_or(usize::MAX);
        if idx >= self.cells.len() {
            return Err(MemoryError::OutOfBounds {
                addr,
                num_cells: self.cells.len(),
            });
        }
        Ok(idx)
    }

    /// Reads out the contents at `addr`. Fatal if `addr` is out of bounds or
    /// the cell was never written.
    pub fn peek(&mut self, addr: u64, clock_cycle: u64) -> Result<u32, MemoryError> {
        let idx = self.bounds_check(addr)?;
        let content = self.cells[idx].ok_or(MemoryError::UninitializedRead(addr))?;
        if let Some(log) = &mut self.transaction_log {
            log.push(format!("0x{addr:08X} read {clock_cycle}"));
        }
        debug!(addr, clock_cycle, "memory read");
        Ok(content)
    }

    /// Writes `content` to `addr`. Fatal if `addr` is out of bounds.
    pub fn poke(&mut self, addr: u64, content: u32, clock_cycle: u64) -> Result<(), MemoryError> {
        let idx = self.bounds_check(addr)?;
        self.cells[idx] = Some(content);
        if let Some(log) = &mut self.transaction_log {
            log.push(format!("0x{addr:08X} write {clock_cycle}"));
        }
        debug!(addr, clock_cycle, "memory write");
        Ok(())
    }

    /// The recorded `0x%08X (read|write) <cycle>` transaction trace, if
    /// logging was enabled at construction. Persisting it to disk is the
    /// host binary's job, not this module's.
    pub fn transaction_log(&self) -> Option<&[String]> {
        self.transaction_log.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_uninitialized_cell_is_fatal() {
        let mut mem = Memory::new(4, 4, false);
        assert_eq!(mem.peek(0, 0), Err(MemoryError::UninitializedRead(0)));
    }

    #[test]
    fn out_of_bounds_is_fatal() {
        let mut mem = Memory::new(4, 4, false);
        assert_eq!(
            mem.poke(4, 1, 0),
            Err(MemoryError::OutOfBounds {
                addr: 4,
                num_cells: 4
            })
        );
    }

    #[test]
    fn poke_then_peek_round_trips() {
        let mut mem = Memory::new(4, 4, false);
        mem.poke(2, 0xDEADBEEF, 1).unwrap();
        assert_eq!(mem.peek(2, 2).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn transaction_log_format() {
        let mut mem = Memory::new(4, 4, true);
        mem.poke(1, 42, 5).unwrap();
        mem.peek(1, 6).unwrap();
        let log = mem.transaction_log().unwrap();
        assert_eq!(log, &["0x00000001 write 5", "0x00000001 read 6"]);
    }
}
