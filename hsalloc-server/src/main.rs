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

//! hsalloc stress CLI
//!
//! Drives the allocation engine either in-process or through the TCP
//! wrapper on a loopback server.
//!
//! ## Usage
//!
//! ```bash
//! # 2M ops of 70/30 traffic on 32 threads, in-process
//! hsalloc basic
//!
//! # Same traffic routed through the RPC wrapper
//! hsalloc basic --rpc
//!
//! # Fill/release until 10 TiB (or 100 TiB) has been written
//! hsalloc stress10t
//! hsalloc stress100t --seed 7
//! ```

use clap::{Parser, ValueEnum};
use hsalloc_core::{AllocatorConfig, HybridAllocator, MemoryPool, PoolConfig};
use hsalloc_server::{
    run_basic, run_fill_release, AllocClient, AllocServer, DirectTarget, RpcTarget, ServerConfig,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TIB: u64 = 1024 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// 70/30 allocate/free traffic on 32 threads, 2M ops.
    Basic,
    /// Fill/release cycles until 10 TiB written.
    Stress10t,
    /// Fill/release cycles until 100 TiB written.
    Stress100t,
}

/// hsalloc stress driver
#[derive(Parser, Debug)]
#[command(name = "hsalloc")]
#[command(about = "Hybrid buddy/slab allocator stress driver")]
#[command(version)]
struct Args {
    /// Workload to run
    #[arg(value_enum)]
    mode: Mode,

    /// Route traffic through a loopback RPC server instead of in-process
    #[arg(long)]
    rpc: bool,

    /// Bind address for the loopback server
    #[arg(long, default_value = "127.0.0.1:4810")]
    addr: String,

    /// Seed for workload and pool randomization
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(mode = ?args.mode, rpc = args.rpc, seed = args.seed, "starting");
    tracing::info!("building allocator and pre-allocating pool");

    let allocator = Arc::new(HybridAllocator::new(
        // Production shape: full 1 TiB, no tracking overhead.
        &AllocatorConfig::default().with_tracking(false),
    ));
    let pool = Arc::new(MemoryPool::new(
        Arc::clone(&allocator),
        &PoolConfig::default().with_seed(args.seed),
    )?);

    // Keep the server alive for the whole run when RPC routing is on.
    let server;
    let target: Box<dyn hsalloc_server::AllocTarget> = if args.rpc {
        let s = AllocServer::new(
            Arc::clone(&allocator),
            Arc::clone(&pool),
            ServerConfig::default().with_bind_addr(args.addr.clone()),
        );
        s.start()?;
        let client = AllocClient::connect(s.local_addr().expect("server bound"))?;
        server = Some(s);
        Box::new(RpcTarget::new(client))
    } else {
        server = None;
        Box::new(DirectTarget::new(Arc::clone(&pool)))
    };

    match args.mode {
        Mode::Basic => {
            run_basic(target.as_ref(), 32, 2_000_000, args.seed);
        }
        Mode::Stress10t => {
            run_fill_release(target.as_ref(), 10 * TIB, args.seed);
        }
        Mode::Stress100t => {
            run_fill_release(target.as_ref(), 100 * TIB, args.seed);
        }
    }

    pool.close()?;
    allocator.close();
    if let Some(server) = server {
        server.stop();
    }

    tracing::info!(
        used = allocator.used_size(),
        overhead = allocator.memory_overhead(),
        "done"
    );
    Ok(())
}
