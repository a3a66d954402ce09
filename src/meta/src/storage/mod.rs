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

//! Persistence seam of the resource pools. Snapshots are written before any
//! allocated event is published; a process restart replays them through the
//! restore path.

use std::sync::Arc;

use async_trait::async_trait;
use bosun_common::id::{AllocationId, JobId};
use rust_decimal::Decimal;

use crate::error::MetaResult;
use crate::rm::message::ContainerResource;

pub mod mem;
pub mod sql;

pub use mem::MemStore;
pub use sql::SqlStore;

/// Durable state the pools own: `resources_state` and `container_snapshots`
/// rows, plus the queue position written back on job moves.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Upserts the state and snapshot rows of one container.
    async fn persist_container(
        &self,
        allocation_id: &AllocationId,
        resource: &ContainerResource,
    ) -> MetaResult<()>;

    /// Loads every container snapshot persisted for an allocation, ordered by
    /// container id.
    async fn load_container_snapshots(
        &self,
        allocation_id: &AllocationId,
    ) -> MetaResult<Vec<ContainerResource>>;

    /// Drops all rows of an allocation once it has fully released.
    async fn remove_allocation(&self, allocation_id: &AllocationId) -> MetaResult<()>;

    async fn update_job_position(&self, job_id: &JobId, position: Decimal) -> MetaResult<()>;
}

pub type SnapshotStoreRef = Arc<dyn SnapshotStore>;
