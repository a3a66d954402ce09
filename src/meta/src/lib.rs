// Copyright 2026 Bosun Contributors
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

//! The bosun control plane: places workload resource requests on a fleet of
//! agent machines and streams database updates to long-lived subscribers.
//!
//! The two subsystems live side by side:
//! - [`rm`] hosts the per-pool schedulers, the agent informer, and the
//!   [`rm::ResourceManager`] facade that routes requests to pools.
//! - [`stream`] hosts the live subscription engine for streamable entities.

pub mod config;
pub mod error;
pub mod model;
pub mod rm;
pub mod storage;
pub mod stream;

pub use error::{MetaError, MetaResult};
