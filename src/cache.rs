//! A direct-mapped, read-only cache for tile input operands.
//!
//! No write-back, no replacement policy: `install` unconditionally evicts
//! whatever previously lived at an address's slot, deliberately, rather
//! than upgrading to LRU, so lookups stay reproducible across runs.
//! Grounded in `original_source/core/cache.py`.

/// A direct-mapped cache of `num_entries` slots.
pub struct Cache {
    slots: Vec<Option<(u64, u32)>>,
}

impl Cache {
    pub fn new(num_entries: usize) -> Self {
        assert!(num_entries > 0, "a cache must have at least one entry");
        Self {
            slots: vec![None; num_entries],
        }
    }

    fn index(&self, addr: u64) -> usize {
        (addr % self.slots.len() as u64) as usize
    }

    /// Returns the cached content at `addr`, or `None` if the slot is empty
    /// or resident to a different address.
    pub fn lookup(&self, addr: u64) -> Option<u32> {
        match self.slots[self.index(addr)] {
            Some((resident, content)) if resident == addr => Some(content),
            _ => None,
        }
    }

    /// Installs `content` at `addr`'s slot, evicting whatever was there.
    pub fn install(&mut self, addr: u64, content: u32) {
        let idx = self.index(addr);
        self.slots[idx] = Some((addr, content));
    }

    /// Invalidates every line. Called at layer boundaries.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}
