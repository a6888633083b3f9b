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

//! Allocation throughput benchmarks.
//!
//! Run with: `cargo bench -p hsalloc-core --bench bench_alloc`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hsalloc_core::{AllocatorConfig, HybridAllocator, MemoryPool, PoolConfig, BUDDY_UNIT};
use std::sync::Arc;

fn bench_hybrid_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("hybrid_alloc_free");
    group.throughput(Throughput::Elements(1));

    for (label, size) in [
        ("slab_4k", 4 * 1024),
        ("slab_64k", 64 * 1024),
        ("buddy_2m", 2 * BUDDY_UNIT),
    ] {
        let alloc = HybridAllocator::new(
            &AllocatorConfig::default()
                .with_max_order(14)
                .with_tracking(false),
        );
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &size| {
            b.iter(|| {
                let addr = alloc.allocate(black_box(size)).unwrap();
                alloc.free(addr, size).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_pool_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_hit");
    group.throughput(Throughput::Elements(1));

    let alloc = Arc::new(HybridAllocator::new(
        &AllocatorConfig::default()
            .with_max_order(16)
            .with_tracking(false),
    ));
    let pool = MemoryPool::new(
        Arc::clone(&alloc),
        &PoolConfig::default()
            .with_slot_counts(2_000, 1_000, 500)
            .with_seed(42),
    )
    .unwrap();

    group.bench_function("alloc_free_8k", |b| {
        b.iter(|| {
            let addr = pool.allocate(black_box(8 * 1024)).unwrap();
            pool.free(addr, 8 * 1024).unwrap();
        });
    });
    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut group = c.benchmark_group("churn");
    group.throughput(Throughput::Elements(1));

    let alloc = HybridAllocator::new(
        &AllocatorConfig::default()
            .with_max_order(14)
            .with_tracking(false),
    );
    let mut rng = StdRng::seed_from_u64(99);
    let mut handles: Vec<(u64, u64)> = Vec::new();

    // Mixed 70/30 traffic against a partially full space.
    group.bench_function("mixed_70_30", |b| {
        b.iter(|| {
            if handles.is_empty() || rng.gen_bool(0.7) {
                let units = rng.gen_range(1u64..=8192);
                let size = (units * 512).next_multiple_of(4096);
                if let Ok(addr) = alloc.allocate(size) {
                    handles.push((addr, size));
                } else {
                    // Space full: drain half to keep the benchmark moving.
                    for _ in 0..handles.len() / 2 {
                        let idx = rng.gen_range(0..handles.len());
                        let (addr, size) = handles.swap_remove(idx);
                        alloc.free(addr, size).unwrap();
                    }
                }
            } else {
                let idx = rng.gen_range(0..handles.len());
                let (addr, size) = handles.swap_remove(idx);
                alloc.free(addr, size).unwrap();
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_hybrid_cycle, bench_pool_hit, bench_churn);
criterion_main!(benches);
