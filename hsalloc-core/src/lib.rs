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

//! hsalloc core — hybrid address-range allocation engine
//!
//! Manages a large contiguous logical space (1 TiB by default) and hands out
//! sub-ranges of 4 KiB–4 MiB as numeric offsets; the allocator never touches
//! the underlying bytes, making it suitable for disk-space management.
//!
//! # Architecture
//!
//! ```text
//! caller → MemoryPool → HybridAllocator → SlabAllocator → BuddyAllocator
//!                                       └────────────────→ BuddyAllocator
//! ```
//!
//! - **BuddyAllocator** (`buddy`): owns the full space; splits and coalesces
//!   power-of-two blocks of 1 MiB and up.
//! - **SlabAllocator** (`slab`): carves 1 MiB buddy blocks into equal-sized
//!   cells for requests of 4 KiB–1 MiB; empty slabs return to buddy.
//! - **HybridAllocator** (`hybrid`): routes by size and aggregates stats.
//! - **MemoryPool** (`pool`): eager front cache of pre-reserved blocks in
//!   three size classes; misses delegate downward.
//!
//! # Contract
//!
//! `free(addr, size)` must receive the same `size` the matching
//! `allocate(size)` was called with — routing, slab lookup, and the pool's
//! class selection are all keyed on it.
//!
//! # Example
//!
//! ```rust
//! use hsalloc_core::{AllocatorConfig, HybridAllocator};
//!
//! let alloc = HybridAllocator::new(&AllocatorConfig::default());
//! let addr = alloc.allocate(8192).unwrap();
//! assert_eq!(alloc.used_size(), 8192);
//! alloc.free(addr, 8192).unwrap();
//! assert_eq!(alloc.used_size(), 0);
//! ```

pub mod buddy;
pub mod config;
pub mod error;
pub mod hybrid;
pub mod pool;
pub mod slab;

pub use buddy::{
    buddy_of, order_to_size, size_to_order, BuddyAllocator, BuddyStats, BuddyStatsSnapshot,
};
pub use config::{
    AllocatorConfig, PoolConfig, BUDDY_UNIT, LARGE_CLASS_MAX, LARGE_POOL_SLOTS, MAX_ORDER,
    MAX_REQUEST, MEDIUM_CLASS_MAX, MEDIUM_POOL_SLOTS, MIN_REQUEST, SLAB_MAX, SMALL_CLASS_MAX,
    SMALL_POOL_SLOTS, TOTAL_SIZE,
};
pub use error::{AllocError, Result};
pub use hybrid::{HybridAllocator, HybridStatsSnapshot};
pub use pool::{MemoryPool, PoolStats, PoolStatsSnapshot};
pub use slab::{SlabAllocator, SlabStats, SlabStatsSnapshot};
