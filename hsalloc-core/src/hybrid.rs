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

//! Hybrid dispatcher: the user-facing allocator entry point.
//!
//! Routes requests at or below [`SLAB_MAX`] to the slab layer and everything
//! larger straight to buddy; frees follow the same rule, with a
//! `SlabNotFound` from the slab layer treated as "retry through buddy"
//! rather than an error.

use crate::buddy::{size_to_order, order_to_size, BuddyAllocator, BuddyStatsSnapshot};
use crate::config::{AllocatorConfig, SLAB_MAX};
use crate::error::{AllocError, Result};
use crate::slab::{SlabAllocator, SlabStatsSnapshot};
use serde::Serialize;
use std::sync::Arc;

/// Combined snapshot of both engine layers.
#[derive(Debug, Clone, Serialize)]
pub struct HybridStatsSnapshot {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub overhead_bytes: u64,
    pub slab_count: usize,
    pub buddy: BuddyStatsSnapshot,
    pub slab: SlabStatsSnapshot,
}

/// Two-tier allocator over a single contiguous address space.
///
/// Long-lived; construct once and share via `Arc`. Initial state is one free
/// buddy block at the top order, address 0, and no slabs.
pub struct HybridAllocator {
    buddy: Arc<BuddyAllocator>,
    slab: SlabAllocator,
}

impl HybridAllocator {
    pub fn new(config: &AllocatorConfig) -> Self {
        let buddy = Arc::new(BuddyAllocator::new(config));
        let slab = SlabAllocator::new(Arc::clone(&buddy));
        Self { buddy, slab }
    }

    /// Allocate `size` bytes; returns the start offset of the range.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        if size <= SLAB_MAX {
            self.slab.allocate(size)
        } else {
            self.buddy.allocate(size)
        }
    }

    /// Free a range previously returned by [`allocate`](Self::allocate).
    ///
    /// `size` MUST equal the size passed to the matching `allocate`; both
    /// routing and the slab's cell lookup are keyed on it.
    pub fn free(&self, start: u64, size: u64) -> Result<()> {
        if size <= SLAB_MAX {
            match self.slab.free(start, size) {
                Err(AllocError::SlabNotFound(_)) => self.buddy.free(start, size),
                other => other,
            }
        } else {
            self.buddy.free(start, size)
        }
    }

    /// Bytes currently allocated: buddy's block-granular usage minus the
    /// idle space inside partially filled slabs. Equals the sum of live
    /// request sizes rounded to the owning layer's grain.
    ///
    /// The two layers are read under separate locks, so a slab created or
    /// retired between the reads can skew one sample by up to 1 MiB; the
    /// subtraction saturates rather than underflow in that window.
    pub fn used_size(&self) -> u64 {
        self.buddy.used_size().saturating_sub(self.slab.unused_bytes())
    }

    /// Total managed bytes (`BUDDY_UNIT << max_order`).
    pub fn total_size(&self) -> u64 {
        self.buddy.total_size()
    }

    /// Approximate bytes of allocator bookkeeping across both layers.
    pub fn memory_overhead(&self) -> u64 {
        self.buddy.memory_overhead() + self.slab.memory_overhead()
    }

    /// Smallest grain that will actually back a request of `size` bytes:
    /// the slab cell stride below [`SLAB_MAX`], a power-of-two buddy block
    /// above it. Useful for callers reconciling their own accounting with
    /// [`used_size`](Self::used_size).
    pub fn grain_of(size: u64) -> u64 {
        if size <= SLAB_MAX {
            size.max(crate::config::MIN_REQUEST)
                .next_multiple_of(crate::config::MIN_REQUEST)
        } else {
            order_to_size(size_to_order(size))
        }
    }

    /// Stats snapshot across both layers.
    pub fn stats(&self) -> HybridStatsSnapshot {
        HybridStatsSnapshot {
            used_bytes: self.used_size(),
            total_bytes: self.total_size(),
            overhead_bytes: self.memory_overhead(),
            slab_count: self.slab.slab_count(),
            buddy: self.buddy.stats().snapshot(),
            slab: self.slab.stats().snapshot(),
        }
    }

    /// The backing buddy allocator (shared with the slab layer).
    pub fn buddy(&self) -> &BuddyAllocator {
        &self.buddy
    }

    /// Release engine state. The address space is virtual, so there is
    /// nothing to hand back; this only logs the final accounting.
    pub fn close(&self) {
        tracing::debug!(
            used = self.used_size(),
            overhead = self.memory_overhead(),
            "allocator closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BUDDY_UNIT, MIN_REQUEST};

    fn hybrid_fixture() -> HybridAllocator {
        // 64 MiB space, tracking on.
        HybridAllocator::new(&AllocatorConfig::default().with_max_order(6).with_tracking(true))
    }

    #[test]
    fn test_small_request_routes_to_slab() {
        let alloc = hybrid_fixture();

        let a = alloc.allocate(4096).unwrap();
        assert_eq!(alloc.used_size(), 4096);
        // One slab holds the cell; buddy sees a full unit.
        assert_eq!(alloc.buddy().used_size(), BUDDY_UNIT);

        alloc.free(a, 4096).unwrap();
        assert_eq!(alloc.used_size(), 0);
        assert_eq!(alloc.buddy().used_size(), 0);
    }

    #[test]
    fn test_large_request_routes_to_buddy() {
        let alloc = hybrid_fixture();

        let a = alloc.allocate(2 * BUDDY_UNIT).unwrap();
        assert!(alloc.used_size() >= 2 * BUDDY_UNIT);

        alloc.free(a, 2 * BUDDY_UNIT).unwrap();
        assert_eq!(alloc.used_size(), 0);
    }

    #[test]
    fn test_boundary_request_is_slab() {
        let alloc = hybrid_fixture();

        // Exactly SLAB_MAX still goes through the slab layer: one slab, one cell.
        let a = alloc.allocate(SLAB_MAX).unwrap();
        assert_eq!(alloc.used_size(), SLAB_MAX);
        assert_eq!(alloc.stats().slab_count, 1);
        alloc.free(a, SLAB_MAX).unwrap();
        assert_eq!(alloc.stats().slab_count, 0);
    }

    #[test]
    fn test_mixed_accounting() {
        let alloc = hybrid_fixture();

        let small = alloc.allocate(4096).unwrap();
        let big = alloc.allocate(3 * BUDDY_UNIT).unwrap();

        // 4 KiB cell + 3 MiB rounded to a 4 MiB block.
        assert_eq!(alloc.used_size(), 4096 + 4 * BUDDY_UNIT);

        alloc.free(big, 3 * BUDDY_UNIT).unwrap();
        alloc.free(small, 4096).unwrap();
        assert_eq!(alloc.used_size(), 0);
    }

    #[test]
    fn test_free_unknown_small_address_reports_buddy_error() {
        let alloc = hybrid_fixture();

        // No slab owns it, so the free falls through to buddy, which rejects
        // the misaligned address.
        assert_eq!(
            alloc.free(0xdead_beef, 4096),
            Err(AllocError::InvalidAddress(0xdead_beef))
        );
        // Aligned but never allocated: tracking reports it missing.
        assert_eq!(
            alloc.free(2 * BUDDY_UNIT, 4096),
            Err(AllocError::BlockNotFound(2 * BUDDY_UNIT))
        );
    }

    #[test]
    fn test_size_too_large_rejected() {
        let alloc = hybrid_fixture();
        assert!(matches!(
            alloc.allocate(128 * BUDDY_UNIT),
            Err(AllocError::SizeTooLarge(_))
        ));
    }

    #[test]
    fn test_grain_of() {
        assert_eq!(HybridAllocator::grain_of(1), MIN_REQUEST);
        assert_eq!(HybridAllocator::grain_of(4096), 4096);
        assert_eq!(HybridAllocator::grain_of(5000), 8192);
        assert_eq!(HybridAllocator::grain_of(SLAB_MAX), SLAB_MAX);
        assert_eq!(HybridAllocator::grain_of(SLAB_MAX + 1), 2 * BUDDY_UNIT);
        assert_eq!(HybridAllocator::grain_of(3 * BUDDY_UNIT), 4 * BUDDY_UNIT);
    }
}
