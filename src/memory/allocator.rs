//! First-fit bitmap allocator over a fixed arena.
//!
//! Grounded in `original_source/core/allocator.py`'s `BitAlloc`: a bitmap of
//! fixed-size grains, one bit per grain, `alloc` scans for the first run of
//! free bits wide enough to hold the request. The source scans MSB-first;
//! that bit order isn't an externally observable invariant, so this scans
//! lowest-address-first instead.

use crate::error::AllocatorError;

/// A bitmap allocator over `arena_bytes` bytes, granted in fixed chunks of
/// `grain_bytes` (must be a power of two).
pub struct BitmapAllocator {
    grain_bytes: u64,
    num_grains: usize,
    /// `true` means the grain is free.
    free: Vec<bool>,
    /// Base address -> number of grains in that live allocation, so `free`
    /// knows how many bits to clear back.
    live: std::collections::HashMap<u64, usize>,
}

impl BitmapAllocator {
    pub fn new(arena_bytes: u64, grain_bytes: u64) -> Result<Self, AllocatorError> {
        if grain_bytes == 0 || !grain_bytes.is_power_of_two() {
            return Err(AllocatorError::InvalidGrain);
        }
        if arena_bytes == 0 || arena_bytes % grain_bytes != 0 {
            return Err(AllocatorError::InvalidArena);
        }
        let num_grains = (arena_bytes / grain_bytes) as usize;
        Ok(Self {
            grain_bytes,
            num_grains,
            free: vec![true; num_grains],
            live: std::collections::HashMap::new(),
        })
    }

    fn grains_needed(&self, nbytes: u64) -> usize {
        let grain = self.grain_bytes;
        ((nbytes + grain - 1) / grain) as usize
    }

    /// Finds the first run of `n` consecutive free grains and returns the
    /// byte address of its start, or `None` if the arena has no such run.
    pub fn alloc(&mut self, nbytes: u64) -> Option<u64> {
        let n = self.grains_needed(nbytes).max(1);
        if n > self.num_grains {
            return None;
        }
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for i in 0..self.num_grains {
            if self.free[i] {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == n {
                    for slot in &mut self.free[run_start..run_start + n] {
                        *slot = false;
                    }
                    let addr = run_start as u64 * self.grain_bytes;
                    self.live.insert(addr, n);
                    return Some(addr);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Releases the allocation starting at `addr`.
    pub fn free(&mut self, addr: u64) -> Result<(), AllocatorError> {
        let n = self
            .live
            .remove(&addr)
            .ok_or(AllocatorError::NotAllocated(addr))?;
        let start = (addr / self.grain_bytes) as usize;
        for slot in &mut self.free[start..start + n] {
            *slot = true;
        }
        Ok(())
    }

    pub fn grain_bytes(&self) -> u64 {
        self.grain_bytes
    }
}

#[cfg(test)]
impl BitmapAllocator {
    fn all_free(&self) -> bool {
        self.free.iter().all(|&f| f)
    }

    fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_non_power_of_two_grain() {
        assert_eq!(
            BitmapAllocator::new(64, 3).unwrap_err(),
            AllocatorError::InvalidGrain
        );
    }

    #[test]
    fn rejects_arena_not_a_multiple_of_grain() {
        assert_eq!(
            BitmapAllocator::new(10, 4).unwrap_err(),
            AllocatorError::InvalidArena
        );
    }

    #[test]
    fn first_fit_returns_lowest_address() {
        let mut a = BitmapAllocator::new(64, 4).unwrap();
        assert_eq!(a.alloc(4), Some(0));
        assert_eq!(a.alloc(4), Some(4));
    }

    #[test]
    fn alloc_rounds_up_to_grain() {
        let mut a = BitmapAllocator::new(64, 4).unwrap();
        let first = a.alloc(1).unwrap();
        let second = a.alloc(4).unwrap();
        assert_eq!(second - first, 4);
    }

    #[test]
    fn exhausted_arena_returns_none() {
        let mut a = BitmapAllocator::new(8, 4).unwrap();
        assert!(a.alloc(4).is_some());
        assert!(a.alloc(4).is_some());
        assert_eq!(a.alloc(4), None);
    }

    #[test]
    fn free_then_realloc_reuses_space() {
        let mut a = BitmapAllocator::new(8, 4).unwrap();
        let first = a.alloc(4).unwrap();
        a.alloc(4).unwrap();
        a.free(first).unwrap();
        assert_eq!(a.alloc(4), Some(first));
    }

    #[test]
    fn freeing_unknown_address_is_an_error() {
        let mut a = BitmapAllocator::new(8, 4).unwrap();
        assert_eq!(a.free(100).unwrap_err(), AllocatorError::NotAllocated(100));
    }

    #[test]
    fn first_fit_skips_small_gaps() {
        let mut a = BitmapAllocator::new(32, 4).unwrap();
        let r0 = a.alloc(4).unwrap(); // grain 0
        let r1 = a.alloc(4).unwrap(); // grain 1
        a.alloc(4).unwrap(); // grain 2
        a.free(r1).unwrap(); // only grain 1 is free now -- too small for 8 bytes
        let big = a.alloc(8).unwrap(); // must skip the 1-grain gap
        assert_eq!(big, r0 + 4 * 3);
    }

    proptest! {
        /// For any interleaving of allocs and frees, once everything is
        /// freed the bitmap is back to all-free and the live-size map is
        /// empty.
        #[test]
        fn all_frees_restores_a_clean_arena(sizes in prop::collection::vec(1u64..=8, 1..12)) {
            let mut a = BitmapAllocator::new(64, 4).unwrap();
            let mut live = Vec::new();
            for size in sizes {
                if let Some(addr) = a.alloc(size) {
                    live.push(addr);
                }
            }
            for addr in live {
                a.free(addr).unwrap();
            }
            prop_assert!(a.all_free());
            prop_assert_eq!(a.live_count(), 0);
        }

        /// No address range `alloc` returns ever overlaps a currently-live
        /// allocation's range.
        #[test]
        fn live_allocations_never_overlap(sizes in prop::collection::vec(1u64..=8, 1..12)) {
            let mut a = BitmapAllocator::new(64, 4).unwrap();
            let mut live_ranges: Vec<(u64, u64)> = Vec::new();
            for size in sizes {
                if let Some(addr) = a.alloc(size) {
                    let len = a.grains_needed(size) as u64 * a.grain_bytes();
                    for &(other_addr, other_len) in &live_ranges {
                        let disjoint = addr + len <= other_addr || other_addr + other_len <= addr;
                        prop_assert!(disjoint, "new allocation overlaps a live one");
                    }
                    live_ranges.push((addr, len));
                }
            }
        }
    }
}
