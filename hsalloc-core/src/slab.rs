// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Slab layer: carves 1 MiB buddy blocks into equal-sized cells.
//!
//! Every request at or below [`SLAB_MAX`] lands here. Slabs are grouped by
//! the exact requested size; inside a slab, cells are laid out at a fixed
//! stride (the request size rounded up to a 4 KiB multiple, so every
//! returned address keeps the global 4 KiB alignment).
//!
//! A slab hands out cells from its free list first, then bumps a high-water
//! mark; there is no per-cell probe loop. When the last cell of a slab is
//! freed the slab's 1 MiB range goes straight back to the buddy layer.
//!
//! Slabs are indexed two ways: `cache` maps a request size to the slab bases
//! serving it, `slabs` maps a base address to the slab itself. Because slab
//! bases are 1 MiB aligned, the owning slab of any cell address is
//! `addr & !(SLAB_MAX - 1)` — one mask and one map lookup on the free path.

use crate::buddy::BuddyAllocator;
use crate::config::{MIN_REQUEST, SLAB_MAX};
use crate::error::{AllocError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cell stride for a request: rounded up so cells stay 4 KiB aligned.
#[inline]
fn cell_stride(size: u64) -> u64 {
    size.max(MIN_REQUEST).next_multiple_of(MIN_REQUEST)
}

/// One 1 MiB region dedicated to a single request size.
struct Slab {
    base: u64,
    /// Exact request size this slab serves.
    request_size: u64,
    /// Distance between consecutive cells (`request_size` rounded to 4 KiB).
    stride: u64,
    /// Maximum number of cells.
    capacity: u64,
    /// Cells ever issued; cells past this mark have never been handed out.
    high_water: u64,
    /// Addresses of freed cells available for reuse.
    free_cells: Vec<u64>,
    /// Addresses of live cells.
    allocated: HashSet<u64>,
}

impl Slab {
    fn new(base: u64, request_size: u64) -> Self {
        let stride = cell_stride(request_size);
        Self {
            base,
            request_size,
            stride,
            capacity: SLAB_MAX / stride,
            high_water: 0,
            free_cells: Vec::new(),
            allocated: HashSet::new(),
        }
    }

    fn has_room(&self) -> bool {
        !self.free_cells.is_empty() || self.high_water < self.capacity
    }

    fn take_cell(&mut self) -> u64 {
        let addr = match self.free_cells.pop() {
            Some(addr) => addr,
            None => {
                debug_assert!(self.high_water < self.capacity);
                let addr = self.base + self.high_water * self.stride;
                self.high_water += 1;
                addr
            }
        };
        if !self.allocated.insert(addr) {
            panic!("slab cell {addr:#x} handed out twice");
        }
        addr
    }

    fn cells_used(&self) -> u64 {
        self.allocated.len() as u64
    }
}

#[derive(Default)]
struct SlabInner {
    /// Request size → bases of the slabs serving it.
    cache: HashMap<u64, Vec<u64>>,
    /// Slab base → slab, for O(1) free-site lookup.
    slabs: HashMap<u64, Slab>,
    /// Running total of bytes held from buddy but not occupied by live
    /// cells, so the reporter stays O(1).
    unused: u64,
}

/// Counters kept outside the slab lock.
#[derive(Debug, Default)]
pub struct SlabStats {
    pub cell_allocations: AtomicU64,
    pub cell_frees: AtomicU64,
    pub slabs_created: AtomicU64,
    pub slabs_retired: AtomicU64,
}

impl SlabStats {
    pub fn snapshot(&self) -> SlabStatsSnapshot {
        SlabStatsSnapshot {
            cell_allocations: self.cell_allocations.load(Ordering::Relaxed),
            cell_frees: self.cell_frees.load(Ordering::Relaxed),
            slabs_created: self.slabs_created.load(Ordering::Relaxed),
            slabs_retired: self.slabs_retired.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlabStatsSnapshot {
    pub cell_allocations: u64,
    pub cell_frees: u64,
    pub slabs_created: u64,
    pub slabs_retired: u64,
}

/// Slab allocator backed by a shared buddy allocator.
///
/// The slab lock is held across the nested buddy call (slab → buddy order);
/// the buddy layer never calls back up.
pub struct SlabAllocator {
    buddy: Arc<BuddyAllocator>,
    inner: RwLock<SlabInner>,
    stats: SlabStats,
}

impl SlabAllocator {
    pub fn new(buddy: Arc<BuddyAllocator>) -> Self {
        Self {
            buddy,
            inner: RwLock::new(SlabInner::default()),
            stats: SlabStats::default(),
        }
    }

    /// Allocate one cell of `size` bytes (`size` ≤ [`SLAB_MAX`]).
    ///
    /// Reuses the first slab for `size` with room; otherwise sources a fresh
    /// 1 MiB block from buddy. Propagates `NoSpace` when buddy is exhausted.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        debug_assert!(size <= SLAB_MAX, "slab request {size} above SLAB_MAX");
        let mut inner = self.inner.write();

        let existing = inner.cache.get(&size).and_then(|bases| {
            bases.iter().copied().find(|base| inner.slabs[base].has_room())
        });

        let base = match existing {
            Some(base) => base,
            None => {
                let base = self.buddy.allocate(SLAB_MAX)?;
                inner.slabs.insert(base, Slab::new(base, size));
                inner.cache.entry(size).or_default().push(base);
                inner.unused += SLAB_MAX;
                self.stats.slabs_created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(base, size, "new slab");
                base
            }
        };

        let slab = inner.slabs.get_mut(&base).expect("slab cache out of sync");
        let addr = slab.take_cell();
        let stride = slab.stride;
        inner.unused -= stride;
        drop(inner);

        self.stats.cell_allocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(addr, size, "slab allocate");
        Ok(addr)
    }

    /// Free the cell at `start` that was allocated with exactly `size`.
    ///
    /// `size` MUST equal the size passed to the matching `allocate`; the
    /// lookup is keyed on it. `SlabNotFound` means no slab of that size owns
    /// the address and the caller should retry through buddy.
    pub fn free(&self, start: u64, size: u64) -> Result<()> {
        let base = start & !(SLAB_MAX - 1);
        let mut inner = self.inner.write();

        let Some(slab) = inner.slabs.get_mut(&base) else {
            return Err(AllocError::SlabNotFound(start));
        };
        if slab.request_size != size {
            return Err(AllocError::SlabNotFound(start));
        }
        if (start - base) % slab.stride != 0 {
            return Err(AllocError::InvalidAddress(start));
        }
        if !slab.allocated.remove(&start) {
            return Err(AllocError::BlockNotFound(start));
        }
        slab.free_cells.push(start);

        let retired = slab.cells_used() == 0;
        let stride = slab.stride;
        inner.unused += stride;
        if retired {
            inner.unused -= SLAB_MAX;
            inner.slabs.remove(&base);
            let bases = inner
                .cache
                .get_mut(&size)
                .expect("slab cache out of sync");
            bases.retain(|&b| b != base);
            if bases.is_empty() {
                inner.cache.remove(&size);
            }
            // Return the empty slab's range while still holding the slab
            // lock; buddy sits below us in the lock order.
            self.buddy.free(base, SLAB_MAX)?;
            self.stats.slabs_retired.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(base, size, "slab retired");
        }
        drop(inner);

        self.stats.cell_frees.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(start, size, "slab free");
        Ok(())
    }

    /// Bytes held from buddy but not occupied by live cells, across all
    /// slabs. The dispatcher subtracts this from buddy's used size.
    pub fn unused_bytes(&self) -> u64 {
        self.inner.read().unused
    }

    /// Approximate bytes of slab bookkeeping.
    pub fn memory_overhead(&self) -> u64 {
        let inner = self.inner.read();
        let cells: usize = inner
            .slabs
            .values()
            .map(|s| s.free_cells.len() + s.allocated.len())
            .sum();
        let cache_entries: usize = inner.cache.values().map(Vec::len).sum();
        (inner.slabs.len() * 96 + cells * 8 + cache_entries * 8) as u64
    }

    /// Number of live slabs.
    pub fn slab_count(&self) -> usize {
        self.inner.read().slabs.len()
    }

    pub fn stats(&self) -> &SlabStats {
        &self.stats
    }
}
