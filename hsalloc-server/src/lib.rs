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

//! hsalloc server layer
//!
//! The synchronous TCP request/reply wrapper around the [`hsalloc_core`]
//! engine, plus the stress workloads the CLI binary drives. The engine does
//! all the real work; this crate is plumbing.

pub mod rpc;
pub mod stress;

pub use rpc::{
    AllocClient, AllocServer, Message, RpcError, ServerConfig, ServerStats, ServerStatsSnapshot,
    StatsPayload,
};
pub use stress::{
    generate_random_size, is_no_space, run_basic, run_fill_release, AllocTarget, BasicReport,
    DirectTarget, FillReport, RpcTarget,
};
