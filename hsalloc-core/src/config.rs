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

//! Allocator constants and construction parameters.
//!
//! The defaults describe the production shape: a 1 TiB address space split
//! into 1 MiB buddy units, slabs for everything at or below 1 MiB, and a
//! front-cache pool sized 20,000 / 10,000 / 5,000 slots.

/// Smallest request the public API accepts alignment for (4 KiB).
pub const MIN_REQUEST: u64 = 4 * 1024;

/// Largest request the public API accepts (4 MiB).
pub const MAX_REQUEST: u64 = 4 * 1024 * 1024;

/// Smallest buddy block (1 MiB); order-k blocks are `BUDDY_UNIT << k`.
pub const BUDDY_UNIT: u64 = 1024 * 1024;

/// Requests at or below this size are served by the slab layer (1 MiB).
pub const SLAB_MAX: u64 = 1024 * 1024;

/// Highest buddy order; the root block is `BUDDY_UNIT << MAX_ORDER`.
pub const MAX_ORDER: u32 = 20;

/// Total managed address space: `BUDDY_UNIT << MAX_ORDER` = 1 TiB.
pub const TOTAL_SIZE: u64 = BUDDY_UNIT << MAX_ORDER;

/// Upper bound of the SMALL pool class (64 KiB).
pub const SMALL_CLASS_MAX: u64 = 64 * 1024;
/// Upper bound of the MEDIUM pool class (1 MiB).
pub const MEDIUM_CLASS_MAX: u64 = 1024 * 1024;
/// Upper bound of the LARGE pool class (4 MiB).
pub const LARGE_CLASS_MAX: u64 = 4 * 1024 * 1024;

/// Default SMALL class slot count.
pub const SMALL_POOL_SLOTS: usize = 20_000;
/// Default MEDIUM class slot count.
pub const MEDIUM_POOL_SLOTS: usize = 10_000;
/// Default LARGE class slot count.
pub const LARGE_POOL_SLOTS: usize = 5_000;

/// Construction parameters for the buddy/slab engine.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Highest buddy order; the managed space is `BUDDY_UNIT << max_order`.
    pub max_order: u32,

    /// Keep a map of allocated buddy blocks so stray frees are reported as
    /// `BlockNotFound` instead of corrupting the free lists. Costs one map
    /// insert/remove per buddy operation; production builds turn it off.
    pub track_allocations: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_order: MAX_ORDER,
            track_allocations: cfg!(debug_assertions),
        }
    }
}

impl AllocatorConfig {
    pub fn with_max_order(mut self, max_order: u32) -> Self {
        self.max_order = max_order;
        self
    }

    pub fn with_tracking(mut self, track: bool) -> Self {
        self.track_allocations = track;
        self
    }

    /// Total managed bytes under this configuration.
    pub fn total_size(&self) -> u64 {
        BUDDY_UNIT << self.max_order
    }
}

/// Construction parameters for the front-cache pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// SMALL class slot count (slot sizes drawn from [4 KiB, 64 KiB)).
    pub small_slots: usize,
    /// MEDIUM class slot count (slot sizes drawn from [64 KiB, 1 MiB)).
    pub medium_slots: usize,
    /// LARGE class slot count (slot sizes drawn from [1 MiB, 4 MiB)).
    pub large_slots: usize,
    /// Seed for the slot-size RNG; `None` seeds from entropy. Tests pin this
    /// so pre-allocation is reproducible.
    pub seed: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small_slots: SMALL_POOL_SLOTS,
            medium_slots: MEDIUM_POOL_SLOTS,
            large_slots: LARGE_POOL_SLOTS,
            seed: None,
        }
    }
}

impl PoolConfig {
    pub fn with_slot_counts(mut self, small: usize, medium: usize, large: usize) -> Self {
        self.small_slots = small;
        self.medium_slots = medium;
        self.large_slots = large;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
