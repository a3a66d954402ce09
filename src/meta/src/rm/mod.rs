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

//! The resource manager: per-pool schedulers behind a routing facade.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bosun_common::id::{AgentId, AllocationId, JobId, ResourceId, TaskId};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ResourcePoolConfig;
use crate::error::{MetaError, MetaResult};
use crate::storage::{MemStore, SnapshotStoreRef};

pub mod agent;
pub mod events;
pub mod fitting;
pub mod group;
pub mod informer;
pub mod message;
pub mod metrics;
pub mod provisioner;
pub mod resource_pool;
pub mod scheduler;
pub mod sort_state;
pub mod task_list;

pub use resource_pool::{ResourcePool, ResourcePoolHandle};

use self::agent::AgentService;
use self::events::EventBus;
use self::group::GroupPriorityChangeRegistry;
use self::informer::{AgentInformer, ClusterClient};
use self::message::{
    AllocateRequest, AllocationSummary, CapacityCheckResponse, LaunchWarning,
    ValidateResourcesResponse,
};
use self::provisioner::InstanceLauncher;

/// Lookup of nodes a task must not land on (log-pattern blocklists live in a
/// collaborator).
#[async_trait]
pub trait BlockedNodeProvider: Send + Sync + 'static {
    async fn blocked_nodes(&self, task_id: &TaskId) -> MetaResult<Vec<AgentId>>;
}

/// Default provider: nothing is blocked.
pub struct NoBlockedNodes;

#[async_trait]
impl BlockedNodeProvider for NoBlockedNodes {
    async fn blocked_nodes(&self, _task_id: &TaskId) -> MetaResult<Vec<AgentId>> {
        Ok(vec![])
    }
}

/// Shared dependencies handed to every pool.
#[derive(Clone)]
pub struct RmEnv {
    pub store: SnapshotStoreRef,
    pub events: EventBus,
    pub agent_service: AgentService,
    pub registry: GroupPriorityChangeRegistry,
    pub blocked_nodes: Arc<dyn BlockedNodeProvider>,
    pub launcher: Option<Arc<dyn InstanceLauncher>>,
}

impl RmEnv {
    pub fn new(store: SnapshotStoreRef) -> Self {
        Self {
            store,
            events: EventBus::new(),
            agent_service: AgentService::new(),
            registry: GroupPriorityChangeRegistry::new(),
            blocked_nodes: Arc::new(NoBlockedNodes),
            launcher: None,
        }
    }

    pub fn for_test() -> Self {
        Self::new(Arc::new(MemStore::new()))
    }

    pub fn for_test_with_store(store: SnapshotStoreRef) -> Self {
        Self::new(store)
    }
}

/// Routes requests to pools and owns their lifecycles. Requests without an
/// explicit pool go to the configured default.
pub struct ResourceManager {
    env: RmEnv,
    pools: HashMap<String, ResourcePoolHandle>,
    default_pool: String,
    pool_tasks: Vec<JoinHandle<()>>,
}

impl ResourceManager {
    pub fn new(
        env: RmEnv,
        configs: Vec<ResourcePoolConfig>,
        default_pool: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> MetaResult<Self> {
        let default_pool = default_pool.into();
        if !configs.iter().any(|c| c.pool_name == default_pool) {
            return Err(MetaError::not_found("resource pool", &default_pool));
        }

        let mut pools = HashMap::new();
        let mut pool_tasks = Vec::with_capacity(configs.len());
        for config in configs {
            let name = config.pool_name.clone();
            let (handle, task) = ResourcePool::spawn(config, &env, shutdown.clone());
            pools.insert(name, handle);
            pool_tasks.push(task);
        }
        Ok(Self {
            env,
            pools,
            default_pool,
            pool_tasks,
        })
    }

    pub fn env(&self) -> &RmEnv {
        &self.env
    }

    pub fn pool(&self, name: &str) -> MetaResult<&ResourcePoolHandle> {
        self.pools
            .get(name)
            .ok_or_else(|| MetaError::not_found("resource pool", name))
    }

    /// Resolves an optional pool name to a handle, defaulting when absent.
    pub fn resolve_pool(&self, name: Option<&str>) -> MetaResult<&ResourcePoolHandle> {
        match name {
            Some(name) => self.pool(name),
            None => self.pool(&self.default_pool),
        }
    }

    /// Spawns the informer that keeps the agent registry in sync with the
    /// cluster substrate and nudges every pool on changes.
    pub fn start_informer(
        &self,
        client: Arc<dyn ClusterClient>,
        done: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let informer = AgentInformer::new(
            client,
            self.env.agent_service.clone(),
            self.pools.values().cloned().collect(),
            done,
        );
        tokio::spawn(informer.run())
    }

    /// Admits a request into its pool, assigning an allocation id when absent.
    pub fn allocate(&self, mut req: AllocateRequest) -> MetaResult<AllocationId> {
        let pool = self.resolve_pool(req.resource_pool.as_deref())?;
        req.resource_pool = Some(pool.pool_name().to_owned());
        let allocation_id = req
            .allocation_id
            .get_or_insert_with(AllocationId::new_random)
            .clone();
        pool.allocate(req)?;
        Ok(allocation_id)
    }

    pub fn resources_released(
        &self,
        resource_pool: Option<&str>,
        allocation_id: AllocationId,
        resource_id: Option<ResourceId>,
    ) -> MetaResult<()> {
        self.resolve_pool(resource_pool)?
            .resources_released(allocation_id, resource_id)
    }

    pub fn set_group_max_slots(
        &self,
        resource_pool: Option<&str>,
        job_id: JobId,
        max_slots: Option<usize>,
    ) -> MetaResult<()> {
        self.resolve_pool(resource_pool)?
            .set_group_max_slots(job_id, max_slots)
    }

    pub fn set_group_weight(
        &self,
        resource_pool: Option<&str>,
        job_id: JobId,
        weight: f64,
    ) -> MetaResult<()> {
        self.resolve_pool(resource_pool)?
            .set_group_weight(job_id, weight)
    }

    pub async fn set_group_priority(
        &self,
        resource_pool: Option<&str>,
        job_id: JobId,
        priority: i32,
    ) -> MetaResult<()> {
        self.resolve_pool(resource_pool)?
            .set_group_priority(job_id, priority)
            .await
    }

    /// Job moves fan out to every pool; the one hosting the job applies it.
    pub async fn move_job(&self, job_id: JobId, anchor: JobId, ahead_of: bool) -> MetaResult<()> {
        for pool in self.pools.values() {
            pool.move_job(job_id.clone(), anchor.clone(), ahead_of)
                .await?;
        }
        Ok(())
    }

    pub fn recover_job_position(
        &self,
        resource_pool: Option<&str>,
        job_id: JobId,
        position: Decimal,
    ) -> MetaResult<()> {
        self.resolve_pool(resource_pool)?
            .recover_job_position(job_id, position)
    }

    pub async fn delete_job(&self, resource_pool: Option<&str>, job_id: JobId) -> MetaResult<()> {
        self.resolve_pool(resource_pool)?.delete_job(job_id).await
    }

    pub async fn get_allocation_summary(
        &self,
        allocation_id: AllocationId,
    ) -> MetaResult<Option<AllocationSummary>> {
        for pool in self.pools.values() {
            if let Some(summary) = pool.get_allocation_summary(allocation_id.clone()).await? {
                return Ok(Some(summary));
            }
        }
        Ok(None)
    }

    pub async fn get_allocation_summaries(
        &self,
    ) -> MetaResult<HashMap<AllocationId, AllocationSummary>> {
        let mut summaries = HashMap::new();
        for pool in self.pools.values() {
            summaries.extend(pool.get_allocation_summaries().await?);
        }
        Ok(summaries)
    }

    pub async fn capacity_check(
        &self,
        resource_pool: Option<&str>,
        slots: usize,
        task_id: Option<TaskId>,
    ) -> MetaResult<CapacityCheckResponse> {
        self.resolve_pool(resource_pool)?
            .capacity_check(slots, task_id)
            .await
    }

    pub async fn validate_resources(
        &self,
        resource_pool: Option<&str>,
        slots: usize,
    ) -> MetaResult<ValidateResourcesResponse> {
        self.resolve_pool(resource_pool)?.validate_resources(slots).await
    }

    /// Soft warnings for a launch response, e.g. when the requested slot count
    /// exceeds what the pool can ever offer.
    pub async fn launch_warnings(
        &self,
        resource_pool: Option<&str>,
        slots: usize,
        task_id: Option<TaskId>,
    ) -> MetaResult<Vec<LaunchWarning>> {
        let response = self.capacity_check(resource_pool, slots, task_id).await?;
        let mut warnings = vec![];
        if response.capacity_exceeded {
            warnings.push(LaunchWarning::CurrentSlotsExceeded);
        }
        Ok(warnings)
    }

    /// Aborts the pool actors without waiting for them.
    pub fn abort(&self) {
        for task in &self.pool_tasks {
            task.abort();
        }
    }
}
