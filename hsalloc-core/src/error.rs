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

//! Error types for hsalloc

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("requested size {0} is too large")]
    SizeTooLarge(u64),

    #[error("no space available")]
    NoSpace,

    #[error("invalid address {0:#x}")]
    InvalidAddress(u64),

    #[error("no allocated block at {0:#x}")]
    BlockNotFound(u64),

    /// Routing signal: the address is not owned by any slab of the given
    /// cell size. The dispatcher retries the free through the buddy layer
    /// instead of surfacing this to the caller.
    #[error("no slab owns address {0:#x}")]
    SlabNotFound(u64),
}

pub type Result<T> = std::result::Result<T, AllocError>;
