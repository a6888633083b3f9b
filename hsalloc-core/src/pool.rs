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

//! Front-cache pool: pre-reserved blocks that absorb the common
//! allocate/free traffic before it reaches the slab/buddy engine.
//!
//! Three size classes — SMALL (4 KiB–64 KiB), MEDIUM (64 KiB–1 MiB), LARGE
//! (1 MiB–4 MiB) — each a fixed array of slots pre-allocated at
//! construction with sizes drawn uniformly from the class range. Allocation
//! is first-fit over the class (`!in_use && slot.size >= size`), tracked by
//! a per-class free bitmap so used slots are skipped a word at a time;
//! frees look the slot up by address. Anything that misses delegates to the
//! underlying allocator and is counted.
//!
//! ## Size re-classification caveat
//!
//! A hit does not size-match exactly: a 5 KiB request may ride a 64 KiB
//! slot. `free(addr, size)` therefore classifies by the ORIGINAL requested
//! size so it scans the same class the allocation came from. Callers must
//! pass the allocate-time size back, as everywhere else in this crate.
//!
//! ## Known limitation
//!
//! There is no rebalancing between classes: an exhausted class keeps
//! missing (and delegating) even while another class sits idle.

use crate::config::{
    LARGE_CLASS_MAX, MEDIUM_CLASS_MAX, MIN_REQUEST, PoolConfig, SMALL_CLASS_MAX,
};
use crate::error::Result;
use crate::hybrid::HybridAllocator;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CLASS_COUNT: usize = 3;

/// Class index for a request size; `None` is outside the pool's range.
#[inline]
fn class_of(size: u64) -> Option<usize> {
    match size {
        s if s <= SMALL_CLASS_MAX => Some(0),
        s if s <= MEDIUM_CLASS_MAX => Some(1),
        s if s <= LARGE_CLASS_MAX => Some(2),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct PoolSlot {
    addr: u64,
    size: u64,
    in_use: bool,
}

/// One size class: slot array plus a free bitmap and an address index.
///
/// Slot addresses never change after construction, so the address → index
/// map stays valid for the pool's lifetime.
struct SlotClass {
    slots: Vec<PoolSlot>,
    /// Bit set = slot free. One u64 per 64 slots.
    free_words: Vec<u64>,
    addr_index: HashMap<u64, usize>,
}

impl SlotClass {
    fn with_capacity(count: usize) -> Self {
        Self {
            slots: Vec::with_capacity(count),
            free_words: vec![0; count.div_ceil(64)],
            addr_index: HashMap::with_capacity(count),
        }
    }

    fn push(&mut self, addr: u64, size: u64) {
        let idx = self.slots.len();
        self.slots.push(PoolSlot {
            addr,
            size,
            in_use: false,
        });
        self.free_words[idx / 64] |= 1 << (idx % 64);
        self.addr_index.insert(addr, idx);
    }

    /// Lowest-index free slot large enough for `size`.
    fn find_fit(&self, size: u64) -> Option<usize> {
        for (wi, &word) in self.free_words.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let idx = wi * 64 + bits.trailing_zeros() as usize;
                if self.slots[idx].size >= size {
                    return Some(idx);
                }
                bits &= bits - 1;
            }
        }
        None
    }

    fn mark_used(&mut self, idx: usize) {
        self.slots[idx].in_use = true;
        self.free_words[idx / 64] &= !(1 << (idx % 64));
    }

    fn mark_free(&mut self, idx: usize) {
        self.slots[idx].in_use = false;
        self.free_words[idx / 64] |= 1 << (idx % 64);
    }
}

/// Hit/miss counters; relaxed atomics, snapshot on demand.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_allocations: AtomicU64,
    pub pool_hits: AtomicU64,
    pub pool_misses: AtomicU64,
    pub total_frees: AtomicU64,
    pub pool_free_hits: AtomicU64,
    pub pool_free_misses: AtomicU64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
            pool_free_hits: self.pool_free_hits.load(Ordering::Relaxed),
            pool_free_misses: self.pool_free_misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub total_allocations: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub total_frees: u64,
    pub pool_free_hits: u64,
    pub pool_free_misses: u64,
}

/// Front cache over a shared [`HybridAllocator`].
///
/// The pool lock covers only its own slot arrays; it is released before any
/// delegation to the underlying allocator (lock order: pool → slab → buddy).
pub struct MemoryPool {
    allocator: Arc<HybridAllocator>,
    classes: Mutex<[SlotClass; CLASS_COUNT]>,
    stats: PoolStats,
}

impl MemoryPool {
    /// Build the pool, eagerly pre-allocating every slot through
    /// `allocator`. Fails with the allocator's error if the space cannot
    /// hold the configured population.
    pub fn new(allocator: Arc<HybridAllocator>, config: &PoolConfig) -> Result<Self> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let plan: [(usize, u64, u64); CLASS_COUNT] = [
            (config.small_slots, MIN_REQUEST, SMALL_CLASS_MAX),
            (config.medium_slots, SMALL_CLASS_MAX, MEDIUM_CLASS_MAX),
            (config.large_slots, MEDIUM_CLASS_MAX, LARGE_CLASS_MAX),
        ];

        let mut classes = Vec::with_capacity(CLASS_COUNT);
        for (count, lo, hi) in plan {
            let mut class = SlotClass::with_capacity(count);
            for _ in 0..count {
                let size = rng.gen_range(lo..hi);
                let addr = allocator.allocate(size)?;
                class.push(addr, size);
            }
            classes.push(class);
        }
        let classes: [SlotClass; CLASS_COUNT] = classes
            .try_into()
            .unwrap_or_else(|_| unreachable!("exactly three classes built"));

        tracing::debug!(
            small = config.small_slots,
            medium = config.medium_slots,
            large = config.large_slots,
            "pool pre-allocated"
        );

        Ok(Self {
            allocator,
            classes: Mutex::new(classes),
            stats: PoolStats::default(),
        })
    }

    /// Allocate `size` bytes, preferring a pre-reserved slot.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        self.stats.total_allocations.fetch_add(1, Ordering::Relaxed);

        if let Some(ci) = class_of(size) {
            let mut classes = self.classes.lock();
            if let Some(idx) = classes[ci].find_fit(size) {
                classes[ci].mark_used(idx);
                let addr = classes[ci].slots[idx].addr;
                drop(classes);
                self.stats.pool_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(addr);
            }
        }

        self.stats.pool_misses.fetch_add(1, Ordering::Relaxed);
        self.allocator.allocate(size)
    }

    /// Return a range to the pool, or delegate if it is not a pool slot.
    ///
    /// `size` MUST be the size originally requested from
    /// [`allocate`](Self::allocate): it selects the class to search, and on
    /// a delegated miss it is what the engine's own lookup is keyed on.
    pub fn free(&self, addr: u64, size: u64) -> Result<()> {
        self.stats.total_frees.fetch_add(1, Ordering::Relaxed);

        if let Some(ci) = class_of(size) {
            let mut classes = self.classes.lock();
            if let Some(&idx) = classes[ci].addr_index.get(&addr) {
                classes[ci].mark_free(idx);
                drop(classes);
                self.stats.pool_free_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        self.stats.pool_free_misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(addr, size, "pool free miss, delegating");
        self.allocator.free(addr, size)
    }

    /// Release every pre-reserved slot back to the underlying allocator,
    /// using each slot's recorded size regardless of its in-use flag.
    pub fn close(&self) -> Result<()> {
        let mut classes = self.classes.lock();
        for class in classes.iter_mut() {
            for slot in class.slots.drain(..) {
                self.allocator.free(slot.addr, slot.size)?;
            }
            class.free_words.clear();
            class.addr_index.clear();
        }
        drop(classes);

        let stats = self.stats.snapshot();
        tracing::info!(
            allocations = stats.total_allocations,
            hits = stats.pool_hits,
            misses = stats.pool_misses,
            frees = stats.total_frees,
            free_hits = stats.pool_free_hits,
            free_misses = stats.pool_free_misses,
            "pool closed"
        );
        Ok(())
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// The allocator behind this pool.
    pub fn allocator(&self) -> &Arc<HybridAllocator> {
        &self.allocator
    }
}
