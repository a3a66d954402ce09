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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bosun_common::id::{AllocationId, JobId};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sea_orm::DbErr;

use super::SnapshotStore;
use crate::error::MetaResult;
use crate::rm::message::ContainerResource;

/// In-memory [`SnapshotStore`] for tests and single-node development. Write
/// failures can be injected to exercise the rollback paths.
#[derive(Default)]
pub struct MemStore {
    containers: Mutex<HashMap<AllocationId, Vec<ContainerResource>>>,
    positions: Mutex<HashMap<JobId, Decimal>>,
    fail_persist: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail until reset.
    pub fn inject_persist_failure(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    pub fn job_position(&self, job_id: &JobId) -> Option<Decimal> {
        self.positions.lock().get(job_id).copied()
    }

    fn check_failpoint(&self) -> MetaResult<()> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(DbErr::Custom("injected persistence failure".to_owned()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemStore {
    async fn persist_container(
        &self,
        allocation_id: &AllocationId,
        resource: &ContainerResource,
    ) -> MetaResult<()> {
        self.check_failpoint()?;
        let mut containers = self.containers.lock();
        let rows = containers.entry(allocation_id.clone()).or_default();
        rows.retain(|row| row.resource_id != resource.resource_id);
        rows.push(resource.clone());
        rows.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        Ok(())
    }

    async fn load_container_snapshots(
        &self,
        allocation_id: &AllocationId,
    ) -> MetaResult<Vec<ContainerResource>> {
        Ok(self
            .containers
            .lock()
            .get(allocation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_allocation(&self, allocation_id: &AllocationId) -> MetaResult<()> {
        self.check_failpoint()?;
        self.containers.lock().remove(allocation_id);
        Ok(())
    }

    async fn update_job_position(&self, job_id: &JobId, position: Decimal) -> MetaResult<()> {
        self.check_failpoint()?;
        self.positions.lock().insert(job_id.clone(), position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bosun_common::id::{AgentId, ContainerId, ResourceId};

    use super::*;
    use crate::error::MetaError;
    use crate::rm::agent::test_utils::cuda_devices;

    fn resource(container: &str) -> ContainerResource {
        let container_id = ContainerId::from(container);
        ContainerResource {
            resource_id: ResourceId::from(&container_id),
            container_id,
            agent_id: AgentId::from("a0"),
            devices: cuda_devices(2),
            started: false,
            exited: false,
        }
    }

    #[tokio::test]
    async fn test_persist_upserts_by_resource_id() {
        let store = MemStore::new();
        let allocation = AllocationId::from("x");
        store.persist_container(&allocation, &resource("c1")).await.unwrap();
        let mut updated = resource("c1");
        updated.started = true;
        store.persist_container(&allocation, &updated).await.unwrap();
        store.persist_container(&allocation, &resource("c0")).await.unwrap();

        let rows = store.load_container_snapshots(&allocation).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].container_id, ContainerId::from("c0"));
        assert!(rows[1].started);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemStore::new();
        store.inject_persist_failure(true);
        let err = store
            .persist_container(&AllocationId::from("x"), &resource("c1"))
            .await
            .unwrap_err();
        assert_matches!(err, MetaError::Persistence(_));
    }
}
