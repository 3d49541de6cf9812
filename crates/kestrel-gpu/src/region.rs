//! First-fit suballocation of byte regions inside one buffer.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::error::{GpuError, Result};

/// A region checked out of a [`RegionAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    /// Byte offset inside the backing buffer. Always aligned.
    pub offset: u64,
    /// Requested size.
    pub size: u64,
    /// Size rounded up to the alignment; what the region actually occupies.
    pub capacity: u64,
}

/// Round `size` up to a power-of-two `alignment`.
///
/// Only for sizes known to be far from `u64::MAX`; see [`checked_align_up`].
#[inline]
pub const fn align_up(size: u64, alignment: u64) -> u64 {
    (size + alignment - 1) & !(alignment - 1)
}

/// Round `size` up to a power-of-two `alignment`, `None` on overflow.
#[inline]
pub const fn checked_align_up(size: u64, alignment: u64) -> Option<u64> {
    match size.checked_add(alignment - 1) {
        Some(padded) => Some(padded & !(alignment - 1)),
        None => None,
    }
}

/// First-fit allocator over `[0, capacity)`.
///
/// Free space is kept sorted by offset; releasing a region merges it with
/// free neighbours on both sides so the free map never holds two adjacent
/// entries.
#[derive(Debug)]
pub struct RegionAllocator {
    capacity: u64,
    alignment: u64,
    /// offset -> length
    free: BTreeMap<u64, u64>,
    /// offset -> region
    used: HashMap<u64, Region>,
    used_bytes: u64,
}

impl RegionAllocator {
    /// Create an allocator. `capacity` is rounded down to `alignment`.
    pub fn new(capacity: u64, alignment: u64) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(GpuError::InvalidState(format!(
                "region alignment {alignment} is not a power of two"
            )));
        }
        let capacity = capacity & !(alignment - 1);
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Ok(Self {
            capacity,
            alignment,
            free,
            used: HashMap::new(),
            used_bytes: 0,
        })
    }

    /// Check out a region of at least `size` bytes.
    ///
    /// Returns `None` when no free range is large enough.
    pub fn allocate(&mut self, size: u64) -> Option<Region> {
        if size > self.capacity {
            return None;
        }
        let needed = checked_align_up(size.max(1), self.alignment)?;
        let (&offset, &len) = self.free.iter().find(|&(_, &len)| len >= needed)?;

        self.free.remove(&offset);
        if len > needed {
            self.free.insert(offset + needed, len - needed);
        }

        let region = Region {
            offset,
            size,
            capacity: needed,
        };
        self.used.insert(offset, region);
        self.used_bytes += needed;
        Some(region)
    }

    /// Return a region.
    ///
    /// Releasing a region that is not checked out is an invariant violation.
    pub fn release(&mut self, region: &Region) -> Result<()> {
        match self.used.get(&region.offset) {
            Some(r) if r == region => {}
            _ => {
                return Err(GpuError::invariant(format!(
                    "release of region at offset {} that is not allocated",
                    region.offset
                )))
            }
        }
        self.used.remove(&region.offset);
        self.used_bytes -= region.capacity;

        let mut offset = region.offset;
        let mut len = region.capacity;

        if let Some(next_len) = self.free.remove(&(offset + len)) {
            len += next_len;
        }
        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        self.free.insert(offset, len);
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Bytes occupied by checked-out regions, alignment padding included.
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn allocation_count(&self) -> usize {
        self.used.len()
    }

    /// Number of disjoint free ranges.
    pub fn free_range_count(&self) -> usize {
        self.free.len()
    }

    /// Largest single allocation that would currently succeed.
    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }
}
