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

//! Stress workloads for the allocation engine.
//!
//! The same drivers run against the pool directly or through the RPC
//! client, selected by the [`AllocTarget`] implementation:
//!
//! - `basic`: N threads of 70/30 allocate/free traffic with random sizes,
//!   a fixed op budget, and a usage back-off at 90%.
//! - `stress10t` / `stress100t`: iterative fill-until-NoSpace, release a
//!   random 30–50% subset, repeat until the cumulative written volume hits
//!   the target.

use crate::rpc::{AllocClient, RpcError};
use hsalloc_core::{AllocError, HybridAllocator, MemoryPool, MAX_REQUEST, MIN_REQUEST};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TIB: u64 = 1024 * 1024 * 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Alloc/free surface the workloads drive. Errors are stringly typed so the
/// direct and RPC paths report identically.
pub trait AllocTarget: Send + Sync {
    fn allocate(&self, size: u64) -> Result<u64, String>;
    fn free(&self, addr: u64, size: u64) -> Result<(), String>;
    fn used_size(&self) -> u64;
    fn total_size(&self) -> u64;
    fn memory_usage(&self) -> u64;
}

/// Did an allocate fail because the space is full?
pub fn is_no_space(err: &str) -> bool {
    err.contains("no space available")
}

/// Drives the pool (and its engine) in-process.
pub struct DirectTarget {
    pool: Arc<MemoryPool>,
    allocator: Arc<HybridAllocator>,
}

impl DirectTarget {
    pub fn new(pool: Arc<MemoryPool>) -> Self {
        let allocator = Arc::clone(pool.allocator());
        Self { pool, allocator }
    }
}

impl AllocTarget for DirectTarget {
    fn allocate(&self, size: u64) -> Result<u64, String> {
        self.pool.allocate(size).map_err(|e: AllocError| e.to_string())
    }

    fn free(&self, addr: u64, size: u64) -> Result<(), String> {
        self.pool.free(addr, size).map_err(|e| e.to_string())
    }

    fn used_size(&self) -> u64 {
        self.allocator.used_size()
    }

    fn total_size(&self) -> u64 {
        self.allocator.total_size()
    }

    fn memory_usage(&self) -> u64 {
        self.allocator.memory_overhead()
    }
}

/// Drives a remote server over one connection, serialized like the
/// original single-socket client.
pub struct RpcTarget {
    client: Mutex<AllocClient>,
}

impl RpcTarget {
    pub fn new(client: AllocClient) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }

    fn map_err(e: RpcError) -> String {
        match e {
            RpcError::Remote(msg) => msg,
            other => other.to_string(),
        }
    }
}

impl AllocTarget for RpcTarget {
    fn allocate(&self, size: u64) -> Result<u64, String> {
        self.client.lock().allocate(size).map_err(Self::map_err)
    }

    fn free(&self, addr: u64, size: u64) -> Result<(), String> {
        self.client.lock().free(addr, size).map_err(Self::map_err)
    }

    fn used_size(&self) -> u64 {
        self.client.lock().used_size().unwrap_or(0)
    }

    fn total_size(&self) -> u64 {
        self.client.lock().total_size().unwrap_or(0)
    }

    fn memory_usage(&self) -> u64 {
        self.client.lock().memory_usage().unwrap_or(0)
    }
}

/// Random request size: a 512-byte block count rounded up to 4 KiB, ≤ 4 MiB.
pub fn generate_random_size(rng: &mut StdRng) -> u64 {
    let units = rng.gen_range(1..=MAX_REQUEST / 512);
    (units * 512).next_multiple_of(MIN_REQUEST)
}

/// Outcome of a [`run_basic`] run.
#[derive(Debug, Clone)]
pub struct BasicReport {
    pub writes: u64,
    pub frees: u64,
    pub final_usage: f64,
    pub memory_usage: u64,
    pub duration: Duration,
}

/// N threads of 70/30 allocate/free traffic over a shared block table.
pub fn run_basic(target: &dyn AllocTarget, threads: usize, max_ops: u64, seed: u64) -> BasicReport {
    let blocks: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let ops = Arc::new(AtomicU64::new(0));
    let writes = Arc::new(AtomicU64::new(0));
    let frees = Arc::new(AtomicU64::new(0));
    let total_size = target.total_size();
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..threads {
            let blocks = Arc::clone(&blocks);
            let ops = Arc::clone(&ops);
            let writes = Arc::clone(&writes);
            let frees = Arc::clone(&frees);
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed ^ (t as u64) << 32);
                loop {
                    if ops.fetch_add(1, Ordering::Relaxed) >= max_ops {
                        return;
                    }

                    if rng.gen_bool(0.7) {
                        let size = generate_random_size(&mut rng);
                        match target.allocate(size) {
                            Ok(addr) => {
                                blocks.lock().push((addr, size));
                                writes.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) if is_no_space(&e) => {
                                // Back off for good once the space is 90% full.
                                let usage = target.used_size() as f64 / total_size as f64;
                                if usage > 0.9 {
                                    return;
                                }
                            }
                            Err(e) => panic!("allocate failed: {e}"),
                        }
                    } else {
                        let taken = {
                            let mut blocks = blocks.lock();
                            if blocks.is_empty() {
                                None
                            } else {
                                let idx = rng.gen_range(0..blocks.len());
                                Some(blocks.swap_remove(idx))
                            }
                        };
                        if let Some((addr, size)) = taken {
                            if let Err(e) = target.free(addr, size) {
                                panic!("free failed: {e}");
                            }
                            frees.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
    });

    let report = BasicReport {
        writes: writes.load(Ordering::Relaxed),
        frees: frees.load(Ordering::Relaxed),
        final_usage: target.used_size() as f64 / total_size as f64 * 100.0,
        memory_usage: target.memory_usage(),
        duration: start.elapsed(),
    };
    tracing::info!(
        writes = report.writes,
        frees = report.frees,
        usage_pct = report.final_usage,
        overhead_bytes = report.memory_usage,
        duration = ?report.duration,
        "basic workload finished"
    );
    report
}

/// Outcome of a [`run_fill_release`] run.
#[derive(Debug, Clone)]
pub struct FillReport {
    pub iterations: u64,
    pub total_written: u64,
    pub max_usage: f64,
    pub duration: Duration,
}

/// Fill until NoSpace, release a random 30–50% subset, repeat until the
/// cumulative written volume reaches `target_bytes`.
pub fn run_fill_release(target: &dyn AllocTarget, target_bytes: u64, seed: u64) -> FillReport {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut blocks: Vec<(u64, u64)> = Vec::new();
    let mut total_written = 0u64;
    let mut max_usage = 0.0f64;
    let mut iterations = 0u64;
    let total_size = target.total_size();
    let start = Instant::now();

    while total_written < target_bytes {
        iterations += 1;
        let iter_start = Instant::now();

        loop {
            let size = generate_random_size(&mut rng);
            match target.allocate(size) {
                Ok(addr) => {
                    blocks.push((addr, size));
                    total_written += size;
                }
                Err(e) if is_no_space(&e) => break,
                Err(e) => panic!("allocate failed: {e}"),
            }
        }

        let usage = target.used_size() as f64 / total_size as f64 * 100.0;
        let write_rate =
            total_written as f64 / start.elapsed().as_secs_f64() / (1024.0 * 1024.0);
        max_usage = max_usage.max(usage);
        tracing::info!(
            iteration = iterations,
            written_gib = total_written / GIB,
            usage_pct = usage,
            iter_duration = ?iter_start.elapsed(),
            write_mib_s = write_rate,
            "fill phase complete"
        );

        if total_written >= target_bytes {
            break;
        }

        let release_ratio = 0.3 + rng.gen::<f64>() * 0.2;
        let release_count = (blocks.len() as f64 * release_ratio) as usize;
        for _ in 0..release_count {
            if blocks.is_empty() {
                break;
            }
            let idx = rng.gen_range(0..blocks.len());
            let (addr, size) = blocks.swap_remove(idx);
            if let Err(e) = target.free(addr, size) {
                panic!("free failed: {e}");
            }
        }
    }

    let report = FillReport {
        iterations,
        total_written,
        max_usage,
        duration: start.elapsed(),
    };
    tracing::info!(
        iterations = report.iterations,
        written_tib = report.total_written / TIB,
        max_usage_pct = report.max_usage,
        duration = ?report.duration,
        "fill/release workload finished"
    );
    report
}
