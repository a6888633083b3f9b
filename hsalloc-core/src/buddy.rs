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

//! Binary-buddy allocator over the managed address space.
//!
//! Owns `[0, BUDDY_UNIT << max_order)` as a single buddy forest rooted at
//! `max_order`. Every block is a power-of-two multiple of [`BUDDY_UNIT`]
//! (1 MiB), so the buddy of a block at order `k` is found by flipping one
//! address bit: `start ^ (BUDDY_UNIT << k)`.
//!
//! ## Free-set representation
//!
//! Each order keeps its free blocks in a [`FreeSet`]: a stack of addresses
//! for O(1) pop plus an address → slot map for O(1) removal. Coalescing
//! needs removal-by-address (the buddy), allocation needs pop; both stay
//! constant time without any ordered structure.
//!
//! | Operation | Cost |
//! |-----------|------|
//! | allocate  | O(max_order) worst case (split chain) |
//! | free      | O(max_order) worst case (merge chain) |
//! | used_size | O(1) |
//!
//! ## Stray-free detection
//!
//! With `track_allocations` enabled the allocator keeps an address → order
//! map of live blocks and rejects frees of unknown addresses with
//! `BlockNotFound`. With tracking disabled only alignment and range are
//! checked; freeing an address that was never allocated corrupts the free
//! lists, exactly as documented on [`AllocatorConfig`].

use crate::config::{AllocatorConfig, BUDDY_UNIT};
use crate::error::{AllocError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Order `k` such that `BUDDY_UNIT << k` is the smallest block covering
/// `size`. Sizes of 0 or below one unit map to order 0.
#[inline]
pub fn size_to_order(size: u64) -> u32 {
    if size <= BUDDY_UNIT {
        return 0;
    }
    let units = size.div_ceil(BUDDY_UNIT);
    u64::BITS - (units - 1).leading_zeros()
}

/// Block size for a given order.
#[inline]
pub fn order_to_size(order: u32) -> u64 {
    BUDDY_UNIT << order
}

/// Sibling block at the same order.
#[inline]
pub fn buddy_of(start: u64, order: u32) -> u64 {
    start ^ (BUDDY_UNIT << order)
}

// ============================================================================
// Free set
// ============================================================================

/// Free blocks of one order: pop from the top, remove by address.
#[derive(Debug, Default)]
struct FreeSet {
    stack: Vec<u64>,
    index: HashMap<u64, usize>,
}

impl FreeSet {
    fn insert(&mut self, addr: u64) {
        debug_assert!(!self.index.contains_key(&addr), "free set already holds {addr:#x}");
        self.index.insert(addr, self.stack.len());
        self.stack.push(addr);
    }

    fn pop(&mut self) -> Option<u64> {
        let addr = self.stack.pop()?;
        self.index.remove(&addr);
        Some(addr)
    }

    /// Remove a specific address; returns false if it is not free.
    fn remove(&mut self, addr: u64) -> bool {
        let Some(slot) = self.index.remove(&addr) else {
            return false;
        };
        let last = self.stack.pop().expect("index and stack out of sync");
        if slot < self.stack.len() {
            self.stack[slot] = last;
            self.index.insert(last, slot);
        }
        true
    }

    fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    fn len(&self) -> usize {
        self.stack.len()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters kept outside the allocator lock.
#[derive(Debug, Default)]
pub struct BuddyStats {
    pub allocations: AtomicU64,
    pub deallocations: AtomicU64,
    pub splits: AtomicU64,
    pub merges: AtomicU64,
    pub failed_allocations: AtomicU64,
}

impl BuddyStats {
    fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_deallocation(&self) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_splits(&self, n: u64) {
        self.splits.fetch_add(n, Ordering::Relaxed);
    }

    fn record_merges(&self, n: u64) {
        self.merges.fetch_add(n, Ordering::Relaxed);
    }

    fn record_failed_allocation(&self) {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BuddyStatsSnapshot {
        BuddyStatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuddyStatsSnapshot {
    pub allocations: u64,
    pub deallocations: u64,
    pub splits: u64,
    pub merges: u64,
    pub failed_allocations: u64,
}

// ============================================================================
// Allocator
// ============================================================================

struct BuddyInner {
    /// Free sets indexed by order, `0..=max_order`.
    free: Vec<FreeSet>,
    /// Live blocks (address → order); present only when tracking is on.
    allocated: Option<HashMap<u64, u32>>,
    /// Bytes currently handed out, counted at block granularity.
    used: u64,
}

/// Buddy allocator over `[0, BUDDY_UNIT << max_order)`.
pub struct BuddyAllocator {
    inner: RwLock<BuddyInner>,
    max_order: u32,
    total: u64,
    stats: BuddyStats,
}

impl BuddyAllocator {
    /// Create an allocator with one free block at `max_order`, address 0.
    pub fn new(config: &AllocatorConfig) -> Self {
        let max_order = config.max_order;
        let mut free: Vec<FreeSet> = (0..=max_order).map(|_| FreeSet::default()).collect();
        free[max_order as usize].insert(0);

        Self {
            inner: RwLock::new(BuddyInner {
                free,
                allocated: config.track_allocations.then(HashMap::new),
                used: 0,
            }),
            max_order,
            total: config.total_size(),
            stats: BuddyStats::default(),
        }
    }

    /// Allocate a block covering `size` bytes, rounded up to the nearest
    /// power-of-two multiple of [`BUDDY_UNIT`].
    pub fn allocate(&self, size: u64) -> Result<u64> {
        let order = size_to_order(size);
        if order > self.max_order {
            self.stats.record_failed_allocation();
            return Err(AllocError::SizeTooLarge(size));
        }

        let mut inner = self.inner.write();

        let Some(from) = (order..=self.max_order).find(|&k| !inner.free[k as usize].is_empty())
        else {
            drop(inner);
            self.stats.record_failed_allocation();
            return Err(AllocError::NoSpace);
        };

        let start = inner.free[from as usize]
            .pop()
            .expect("non-empty free set yielded nothing");

        // Split down, keeping the lower half at each step.
        let mut k = from;
        while k > order {
            k -= 1;
            inner.free[k as usize].insert(start + order_to_size(k));
        }

        if let Some(allocated) = inner.allocated.as_mut() {
            if allocated.insert(start, order).is_some() {
                panic!("buddy block {start:#x} handed out twice");
            }
        }
        inner.used += order_to_size(order);
        drop(inner);

        self.stats.record_allocation();
        self.stats.record_splits((from - order) as u64);
        tracing::trace!(start, size, order, "buddy allocate");
        Ok(start)
    }

    /// Free the block at `start` whose original request was `size` bytes.
    ///
    /// `size` must equal the size passed to the matching `allocate`; it is
    /// rounded to the same order to locate the block. Coalesces with free
    /// buddies iteratively up to `max_order`.
    pub fn free(&self, start: u64, size: u64) -> Result<()> {
        let order = size_to_order(size);
        if order > self.max_order {
            return Err(AllocError::SizeTooLarge(size));
        }
        let block = order_to_size(order);
        if start % block != 0 || start + block > self.total {
            return Err(AllocError::InvalidAddress(start));
        }

        let mut inner = self.inner.write();

        if let Some(allocated) = inner.allocated.as_mut() {
            match allocated.remove(&start) {
                Some(o) if o == order => {}
                Some(o) => {
                    // Wrong size for a live block: restore and report.
                    allocated.insert(start, o);
                    return Err(AllocError::InvalidAddress(start));
                }
                None => return Err(AllocError::BlockNotFound(start)),
            }
        }

        let mut addr = start;
        let mut k = order;
        while k < self.max_order {
            let buddy = buddy_of(addr, k);
            if !inner.free[k as usize].remove(buddy) {
                break;
            }
            addr = addr.min(buddy);
            k += 1;
        }
        inner.free[k as usize].insert(addr);
        inner.used -= block;
        drop(inner);

        self.stats.record_deallocation();
        self.stats.record_merges((k - order) as u64);
        tracing::trace!(start, size, order, merged_to = k, "buddy free");
        Ok(())
    }

    /// Bytes currently allocated, at block granularity.
    pub fn used_size(&self) -> u64 {
        self.inner.read().used
    }

    /// Total managed bytes.
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Approximate bytes of bookkeeping held by the free sets and the
    /// optional tracking map.
    pub fn memory_overhead(&self) -> u64 {
        let inner = self.inner.read();
        let free_entries: usize = inner.free.iter().map(|s| s.len()).sum();
        let tracked = inner.allocated.as_ref().map_or(0, |m| m.len());
        // Stack slot + index entry per free block; key + order per tracked one.
        (free_entries * (8 + 24) + tracked * 16) as u64
    }

    /// Number of free blocks at each order, lowest first.
    pub fn free_block_counts(&self) -> Vec<(u32, usize)> {
        let inner = self.inner.read();
        (0..=self.max_order)
            .map(|k| (k, inner.free[k as usize].len()))
            .collect()
    }

    pub fn stats(&self) -> &BuddyStats {
        &self.stats
    }
}
