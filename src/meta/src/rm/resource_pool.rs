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

//! The per-pool state machine. Each pool is a single-writer actor: one task
//! owns all mutable state and handles one message at a time, so request
//! admission, scheduling, and release never race. Persistence and agent
//! reservations happen inline; serializing them is what makes the restart
//! semantics tractable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bosun_common::id::{AgentId, AllocationId, ContainerId, JobId, ResourceId, TaskId};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{ResourcePoolConfig, SchedulerKind};
use crate::error::{MetaError, MetaResult};
use crate::rm::agent::{Agent, AgentService, AgentState};
use crate::rm::events::EventBus;
use crate::rm::fitting::find_fits;
use crate::rm::group::{Group, GroupPriorityChangeRegistry, Groups};
use crate::rm::message::{
    AgentSummary, AllocateRequest, Allocation, AllocationSummary, CapacityCheckResponse,
    ContainerResource, FailureKind, ResourceEvent, ResourceSummary, ScalingInfo,
    ValidateResourcesResponse,
};
use crate::rm::metrics::{global_rm_metrics, RmMetrics};
use crate::rm::provisioner::{calculate_desired_new_agent_num, Provisioner};
use crate::rm::scheduler::{make_scheduler, Scheduler, SchedulerContext};
use crate::rm::sort_state::{find_anchor, initialize_queue_position, need_move, JobSortState};
use crate::rm::task_list::TaskList;
use crate::rm::{BlockedNodeProvider, RmEnv};
use crate::storage::SnapshotStoreRef;

/// Rate limit for scheduler action.
pub(crate) const ACTION_COOL_DOWN: Duration = Duration::from_millis(500);

enum PoolMessage {
    Allocate(AllocateRequest),
    ResourcesReleased {
        allocation_id: AllocationId,
        resource_id: Option<ResourceId>,
    },
    SetGroupMaxSlots {
        job_id: JobId,
        max_slots: Option<usize>,
    },
    SetGroupWeight {
        job_id: JobId,
        weight: f64,
    },
    SetGroupPriority {
        job_id: JobId,
        priority: i32,
        resp: Option<oneshot::Sender<MetaResult<()>>>,
    },
    SetAllocationName {
        allocation_id: AllocationId,
        name: String,
    },
    MoveJob {
        job_id: JobId,
        anchor: JobId,
        ahead_of: bool,
        resp: oneshot::Sender<MetaResult<()>>,
    },
    RecoverJobPosition {
        job_id: JobId,
        position: Decimal,
    },
    DeleteJob {
        job_id: JobId,
        resp: oneshot::Sender<MetaResult<()>>,
    },
    GetAllocationSummary {
        allocation_id: AllocationId,
        resp: oneshot::Sender<Option<AllocationSummary>>,
    },
    GetAllocationSummaries {
        resp: oneshot::Sender<HashMap<AllocationId, AllocationSummary>>,
    },
    GetResourceSummary {
        resp: oneshot::Sender<ResourceSummary>,
    },
    CapacityCheck {
        slots: usize,
        task_id: Option<TaskId>,
        resp: oneshot::Sender<MetaResult<CapacityCheckResponse>>,
    },
    ValidateResources {
        slots: usize,
        resp: oneshot::Sender<ValidateResourcesResponse>,
    },
    AgentUpdated,
    JobStopped {
        job_id: JobId,
    },
}

/// Clonable mailbox of one pool. Ask-style calls pair the message with a
/// oneshot; everything else is fire-and-forget into the actor's inbox.
#[derive(Clone)]
pub struct ResourcePoolHandle {
    pool_name: String,
    tx: mpsc::UnboundedSender<PoolMessage>,
}

impl ResourcePoolHandle {
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    fn send(&self, msg: PoolMessage) -> MetaResult<()> {
        self.tx
            .send(msg)
            .map_err(|_| MetaError::Unavailable("resource pool"))
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PoolMessage,
    ) -> MetaResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| MetaError::Unavailable("resource pool"))
    }

    pub fn allocate(&self, req: AllocateRequest) -> MetaResult<()> {
        self.send(PoolMessage::Allocate(req))
    }

    pub fn resources_released(
        &self,
        allocation_id: AllocationId,
        resource_id: Option<ResourceId>,
    ) -> MetaResult<()> {
        self.send(PoolMessage::ResourcesReleased {
            allocation_id,
            resource_id,
        })
    }

    pub fn set_group_max_slots(&self, job_id: JobId, max_slots: Option<usize>) -> MetaResult<()> {
        self.send(PoolMessage::SetGroupMaxSlots { job_id, max_slots })
    }

    pub fn set_group_weight(&self, job_id: JobId, weight: f64) -> MetaResult<()> {
        self.send(PoolMessage::SetGroupWeight { job_id, weight })
    }

    pub async fn set_group_priority(&self, job_id: JobId, priority: i32) -> MetaResult<()> {
        self.ask(|resp| PoolMessage::SetGroupPriority {
            job_id,
            priority,
            resp: Some(resp),
        })
        .await?
    }

    pub fn set_allocation_name(&self, allocation_id: AllocationId, name: String) -> MetaResult<()> {
        self.send(PoolMessage::SetAllocationName {
            allocation_id,
            name,
        })
    }

    pub async fn move_job(&self, job_id: JobId, anchor: JobId, ahead_of: bool) -> MetaResult<()> {
        self.ask(|resp| PoolMessage::MoveJob {
            job_id,
            anchor,
            ahead_of,
            resp,
        })
        .await?
    }

    pub fn recover_job_position(&self, job_id: JobId, position: Decimal) -> MetaResult<()> {
        self.send(PoolMessage::RecoverJobPosition { job_id, position })
    }

    pub async fn delete_job(&self, job_id: JobId) -> MetaResult<()> {
        self.ask(|resp| PoolMessage::DeleteJob { job_id, resp }).await?
    }

    pub async fn get_allocation_summary(
        &self,
        allocation_id: AllocationId,
    ) -> MetaResult<Option<AllocationSummary>> {
        self.ask(|resp| PoolMessage::GetAllocationSummary {
            allocation_id,
            resp,
        })
        .await
    }

    pub async fn get_allocation_summaries(
        &self,
    ) -> MetaResult<HashMap<AllocationId, AllocationSummary>> {
        self.ask(|resp| PoolMessage::GetAllocationSummaries { resp })
            .await
    }

    pub async fn get_resource_summary(&self) -> MetaResult<ResourceSummary> {
        self.ask(|resp| PoolMessage::GetResourceSummary { resp }).await
    }

    pub async fn capacity_check(
        &self,
        slots: usize,
        task_id: Option<TaskId>,
    ) -> MetaResult<CapacityCheckResponse> {
        self.ask(|resp| PoolMessage::CapacityCheck {
            slots,
            task_id,
            resp,
        })
        .await?
    }

    pub async fn validate_resources(&self, slots: usize) -> MetaResult<ValidateResourcesResponse> {
        self.ask(|resp| PoolMessage::ValidateResources { slots, resp })
            .await
    }

    /// Nudges the pool to refresh agent state and reschedule on its next tick.
    pub fn agent_updated(&self) {
        let _ = self.tx.send(PoolMessage::AgentUpdated);
    }

    /// Fired by the group registry when a job's last allocation ends.
    pub fn job_stopped(&self, job_id: &JobId) {
        let _ = self.tx.send(PoolMessage::JobStopped {
            job_id: job_id.clone(),
        });
    }
}

/// The pool actor. Owns the task list, groups, sort state, and the per-tick
/// agent snapshot cache; everything reaches it through [`ResourcePoolHandle`].
pub struct ResourcePool {
    config: ResourcePoolConfig,
    scheduler: Box<dyn Scheduler>,
    slots_per_instance: usize,

    provisioner: Option<Arc<Provisioner>>,
    provisioner_error: Option<String>,

    agent_service: AgentService,
    agent_states_cache: Option<HashMap<AgentId, AgentState>>,
    task_list: TaskList,
    groups: Groups,
    queue_positions: JobSortState,
    scaling_info: ScalingInfo,

    /// Whether any mutation since the last pass may have invalidated prior
    /// decisions.
    reschedule: bool,

    store: SnapshotStoreRef,
    events: EventBus,
    registry: GroupPriorityChangeRegistry,
    blocked_nodes: Arc<dyn BlockedNodeProvider>,
    handle: ResourcePoolHandle,
    metrics: RmMetrics,
}

impl ResourcePool {
    /// Builds the pool and spawns its actor task. The returned handle is the
    /// only way in.
    pub fn spawn(
        config: ResourcePoolConfig,
        env: &RmEnv,
        shutdown: watch::Receiver<bool>,
    ) -> (ResourcePoolHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ResourcePoolHandle {
            pool_name: config.pool_name.clone(),
            tx,
        };

        let provisioner = match (&config.provider, &env.launcher) {
            (Some(provider), Some(launcher)) => Some(Arc::new(Provisioner::new(
                &config.pool_name,
                provider.clone(),
                launcher.clone(),
            ))),
            (Some(_), None) => {
                tracing::warn!(
                    pool = %config.pool_name,
                    "provider configured but no instance launcher available"
                );
                None
            }
            (None, _) => {
                tracing::info!(pool = %config.pool_name, "not enabling provisioner for resource pool");
                None
            }
        };
        let slots_per_instance = provisioner
            .as_ref()
            .map(|p| p.slots_per_instance())
            .unwrap_or(0);

        let pool = ResourcePool {
            scheduler: make_scheduler(&config.scheduler),
            slots_per_instance,
            provisioner,
            provisioner_error: None,
            agent_service: env.agent_service.clone(),
            agent_states_cache: None,
            task_list: TaskList::new(),
            groups: Groups::new(),
            queue_positions: JobSortState::new(),
            scaling_info: ScalingInfo::default(),
            reschedule: false,
            store: env.store.clone(),
            events: env.events.clone(),
            registry: env.registry.clone(),
            blocked_nodes: env.blocked_nodes.clone(),
            handle: handle.clone(),
            metrics: global_rm_metrics().clone(),
            config,
        };
        let join = tokio::spawn(pool.run(rx, shutdown));
        (handle, join)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<PoolMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(ACTION_COOL_DOWN);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
                _ = tick.tick() => self.handle_tick().await,
            }
        }
        tracing::info!(pool = %self.config.pool_name, "resource pool stopped");
    }

    async fn handle_message(&mut self, msg: PoolMessage) {
        // Default to rescheduling after any message; read-only messages opt
        // out below.
        let mut reschedule = true;
        match msg {
            PoolMessage::Allocate(req) => self.allocate_request(req).await,
            PoolMessage::ResourcesReleased {
                allocation_id,
                resource_id,
            } => self.resources_released(&allocation_id, resource_id).await,
            PoolMessage::SetGroupMaxSlots { job_id, max_slots } => {
                self.get_or_create_group(&job_id).max_slots = max_slots;
            }
            PoolMessage::SetGroupWeight { job_id, weight } => {
                self.get_or_create_group(&job_id).weight = weight;
            }
            PoolMessage::SetGroupPriority {
                job_id,
                priority,
                resp,
            } => {
                let result = self.set_group_priority(&job_id, priority);
                if let Some(resp) = resp {
                    let _ = resp.send(result);
                }
            }
            PoolMessage::SetAllocationName {
                allocation_id,
                name,
            } => {
                if let Some(task) = self.task_list.task_by_id_mut(&allocation_id) {
                    task.name = name;
                }
            }
            PoolMessage::MoveJob {
                job_id,
                anchor,
                ahead_of,
                resp,
            } => {
                let result = self.move_job(&job_id, &anchor, ahead_of).await;
                let _ = resp.send(result);
            }
            PoolMessage::RecoverJobPosition { job_id, position } => {
                self.queue_positions.recover_job_position(&job_id, position);
            }
            PoolMessage::DeleteJob { job_id, resp } => {
                // Cleanup arrives back through the registry's delete hooks.
                self.registry.delete(&job_id);
                let _ = resp.send(Ok(()));
            }
            PoolMessage::GetAllocationSummary {
                allocation_id,
                resp,
            } => {
                reschedule = false;
                let _ = resp.send(self.task_list.task_summary(
                    &allocation_id,
                    &self.groups,
                    self.config.scheduler.kind,
                ));
            }
            PoolMessage::GetAllocationSummaries { resp } => {
                reschedule = false;
                let _ = resp.send(
                    self.task_list
                        .task_summaries(&self.groups, self.config.scheduler.kind),
                );
            }
            PoolMessage::GetResourceSummary { resp } => {
                reschedule = false;
                let states = self.agent_service.list_states();
                let _ = resp.send(resource_summary_from_agent_states(&states));
            }
            PoolMessage::CapacityCheck {
                slots,
                task_id,
                resp,
            } => {
                reschedule = false;
                let _ = resp.send(self.capacity_check(slots, task_id).await);
            }
            PoolMessage::ValidateResources { slots, resp } => {
                reschedule = false;
                // Default to fulfillable when the per-instance slot count is
                // unknown.
                let fulfillable =
                    self.slots_per_instance == 0 || slots <= self.slots_per_instance;
                let _ = resp.send(ValidateResourcesResponse { fulfillable });
            }
            PoolMessage::AgentUpdated => {
                // Snapshots are refreshed on the next tick, never in between.
            }
            PoolMessage::JobStopped { job_id } => {
                self.groups.remove(&job_id);
                self.queue_positions.remove(&job_id);
            }
        }
        self.reschedule = self.reschedule || reschedule;
    }

    async fn handle_tick(&mut self) {
        if let Some(provisioner) = &self.provisioner {
            let err = provisioner.launch_error();
            if err != self.provisioner_error {
                self.provisioner_error = err;
                if self.provisioner_error.is_some() {
                    self.reschedule = true;
                }
            }
        }
        if !self.reschedule {
            return;
        }
        tracing::trace!(pool = %self.config.pool_name, "scheduling");
        let started = Instant::now();
        self.agent_states_cache = Some(self.agent_service.list_states());
        // The snapshot cache lives exactly as long as this pass, however the
        // pass ends.
        let mut guard = scopeguard::guard(self, |pool| {
            pool.agent_states_cache = None;
            pool.reschedule = false;
        });
        let this = &mut **guard;

        this.prune_task_list();

        let result = {
            let ctx = SchedulerContext {
                task_list: &this.task_list,
                groups: &this.groups,
                queue_positions: &this.queue_positions,
                agent_states: this
                    .agent_states_cache
                    .as_ref()
                    .expect("cache is set for the duration of the tick"),
                soft_constraint: this.config.scheduler.fitting_policy,
                allow_heterogeneous_fits: this.config.scheduler.allow_heterogeneous_fits,
            };
            this.scheduler.schedule(&ctx)
        };
        if !result.to_allocate.is_empty() || !result.to_release.is_empty() {
            tracing::debug!(
                pool = %this.config.pool_name,
                to_allocate = result.to_allocate.len(),
                to_release = result.to_release.len(),
                "scheduled"
            );
        }
        for allocation_id in &result.to_allocate {
            this.allocate_resources(allocation_id).await;
        }
        for allocation_id in &result.to_release {
            this.release_resource(allocation_id);
        }
        this.send_scaling_info().await;

        let pool = this.config.pool_name.clone();
        this.metrics
            .schedule_pass_count
            .with_label_values(&[&pool])
            .inc();
        this.metrics
            .schedule_pass_duration
            .with_label_values(&[&pool])
            .observe(started.elapsed().as_secs_f64());
        let allocated = this
            .task_list
            .iter()
            .filter(|task| this.task_list.is_scheduled(task.id()))
            .count();
        this.metrics
            .task_queue_allocated
            .with_label_values(&[&pool])
            .set(allocated as i64);
        this.metrics
            .task_queue_pending
            .with_label_values(&[&pool])
            .set((this.task_list.len() - allocated) as i64);
    }

    async fn allocate_request(&mut self, mut req: AllocateRequest) {
        let allocation_id = req
            .allocation_id
            .get_or_insert_with(AllocationId::new_random)
            .clone();
        if req.name.is_empty() {
            req.name = "Unnamed Task".to_owned();
        }
        self.get_or_create_group(&req.job_id);
        tracing::info!(
            pool = %self.config.pool_name,
            name = %req.name,
            allocation_id = %allocation_id,
            restore = req.restore,
            "resources are requested"
        );
        if req.is_user_visible && !self.queue_positions.contains_key(&req.job_id) {
            self.queue_positions.insert(
                req.job_id.clone(),
                initialize_queue_position(req.job_submission_time),
            );
        }

        if req.restore {
            if let Err(err) = self.restore_resources(&req).await {
                tracing::error!(
                    allocation_id = %allocation_id,
                    error = %err,
                    "error restoring resources"
                );
                self.events.publish(
                    &allocation_id,
                    ResourceEvent::Failure {
                        kind: FailureKind::Restore,
                        error: err.to_string(),
                    },
                );
            }
            return;
        }

        if let Err(err) = self.task_list.add_task(req) {
            tracing::warn!(allocation_id = %allocation_id, error = %err, "rejecting request");
            self.events.publish(
                &allocation_id,
                ResourceEvent::InvalidRequest {
                    cause: err.to_string(),
                },
            );
        }
    }

    /// Rebuilds an allocation from its persisted container snapshots. Fails
    /// when any referenced agent is gone; no reservations are attempted
    /// (the substrate reports surviving containers through the informer).
    async fn restore_resources(&mut self, req: &AllocateRequest) -> MetaResult<()> {
        let allocation_id = req.id().clone();
        let snapshots = self.store.load_container_snapshots(&allocation_id).await?;
        if snapshots.is_empty() {
            return Err(MetaError::Restore("0 container snapshots".to_owned()));
        }

        let states = self.agent_service.list_states();
        let mut resources = BTreeMap::new();
        for snapshot in snapshots {
            if !states.contains_key(&snapshot.agent_id) {
                return Err(MetaError::Restore(format!(
                    "can't find restorable agent {}",
                    snapshot.agent_id
                )));
            }
            resources.insert(snapshot.resource_id.clone(), snapshot);
        }

        let allocation = Allocation {
            allocation_id: allocation_id.clone(),
            resource_pool: self.config.pool_name.clone(),
            resources,
            job_submission_time: req.job_submission_time,
            recovered: true,
        };
        self.task_list.add_task(req.clone())?;
        self.task_list
            .add_allocation(allocation_id.clone(), allocation.clone());
        self.events
            .publish(&allocation_id, ResourceEvent::Allocated(allocation));
        Ok(())
    }

    /// Assigns resources for one request the scheduler chose. Every failure
    /// leaves the task list, the allocation table, and the agents exactly as
    /// they were; the request stays queued for the next tick.
    async fn allocate_resources(&mut self, allocation_id: &AllocationId) -> bool {
        let Some(req) = self.task_list.task_by_id(allocation_id).cloned() else {
            return false;
        };
        let cache = self
            .agent_states_cache
            .as_ref()
            .expect("cache is set for the duration of the tick");
        let fits = find_fits(
            &req,
            cache,
            self.config.scheduler.fitting_policy,
            self.config.scheduler.allow_heterogeneous_fits,
        );
        if fits.is_empty() {
            return false;
        }

        let mut reserved: Vec<(Arc<Agent>, ContainerResource)> = Vec::with_capacity(fits.len());
        for fit in &fits {
            let container_id = ContainerId::new_random();
            let Some(agent) = self.agent_service.get(&fit.agent_id) else {
                // Disappearance between snapshot and reserve is a reserve
                // failure.
                tracing::warn!(
                    allocation_id = %allocation_id,
                    agent_id = %fit.agent_id,
                    "agent vanished before reservation"
                );
                rollback_reservations(&reserved);
                return false;
            };
            match agent.allocate_free_devices(
                fit.slots,
                &req.fitting_requirements.blacklist,
                &container_id,
            ) {
                Ok(devices) => {
                    reserved.push((
                        agent.clone(),
                        ContainerResource {
                            resource_id: ResourceId::from(&container_id),
                            container_id,
                            agent_id: agent.id(),
                            devices,
                            started: false,
                            exited: false,
                        },
                    ));
                }
                Err(err) => {
                    tracing::warn!(
                        allocation_id = %allocation_id,
                        error = %err,
                        "failed to allocate request"
                    );
                    rollback_reservations(&reserved);
                    return false;
                }
            }
        }

        for (_, resource) in &reserved {
            if let Err(err) = self.store.persist_container(allocation_id, resource).await {
                tracing::error!(allocation_id = %allocation_id, error = %err, "persistence failure");
                rollback_reservations(&reserved);
                return false;
            }
        }

        let mut resources = BTreeMap::new();
        for (_, resource) in &reserved {
            resources.insert(resource.resource_id.clone(), resource.clone());
        }
        let allocation = Allocation {
            allocation_id: allocation_id.clone(),
            resource_pool: self.config.pool_name.clone(),
            resources,
            job_submission_time: req.job_submission_time,
            recovered: false,
        };
        self.task_list
            .add_allocation(allocation_id.clone(), allocation.clone());
        self.events
            .publish(allocation_id, ResourceEvent::Allocated(allocation));

        let agents: Vec<Arc<Agent>> = reserved.into_iter().map(|(agent, _)| agent).collect();
        self.refresh_agent_state_cache_for(&agents);
        tracing::info!(pool = %self.config.pool_name, name = %req.name, "allocated resources");
        true
    }

    fn release_resource(&self, allocation_id: &AllocationId) {
        tracing::info!(
            allocation_id = %allocation_id,
            "releasing resources taken by allocation (preempted by the scheduler)"
        );
        self.events.publish(
            allocation_id,
            ResourceEvent::ReleaseResources {
                reason: "preempted by the scheduler".to_owned(),
            },
        );
    }

    async fn resources_released(
        &mut self,
        allocation_id: &AllocationId,
        resource_id: Option<ResourceId>,
    ) {
        if self.task_list.task_by_id(allocation_id).is_none() {
            tracing::debug!(
                allocation_id = %allocation_id,
                "ignoring release for task not allocated to pool"
            );
            return;
        }

        match (self.task_list.allocation(allocation_id).cloned(), resource_id) {
            (None, _) => {
                tracing::info!(allocation_id = %allocation_id, "released before allocated");
                self.task_list.remove_task_by_id(allocation_id);
                self.events.publish(allocation_id, ResourceEvent::Released);
            }
            (Some(allocation), Some(resource_id)) => {
                tracing::info!(
                    allocation_id = %allocation_id,
                    resource_id = %resource_id,
                    "incrementally released resources"
                );
                let Some(resource) = allocation.resources.get(&resource_id) else {
                    return;
                };
                if let Some(agent) = self.agent_service.get(&resource.agent_id) {
                    agent.deallocate_container(&resource.container_id);
                }
                if let Some(allocation) = self.task_list.allocation_mut(allocation_id) {
                    allocation.resources.remove(&resource_id);
                }
            }
            (Some(allocation), None) => {
                tracing::info!(allocation_id = %allocation_id, "all resources are released");
                for resource in allocation.resources.values() {
                    if let Some(agent) = self.agent_service.get(&resource.agent_id) {
                        agent.deallocate_container(&resource.container_id);
                    }
                }
                self.task_list.remove_task_by_id(allocation_id);
                if let Err(err) = self.store.remove_allocation(allocation_id).await {
                    tracing::error!(
                        allocation_id = %allocation_id,
                        error = %err,
                        "failed to clear persisted snapshots"
                    );
                }
                self.events.publish(allocation_id, ResourceEvent::Released);
            }
        }
    }

    fn get_or_create_group(&mut self, job_id: &JobId) -> &mut Group {
        if !self.groups.contains_key(job_id) {
            let mut group = Group::new(job_id.clone());
            if self.config.scheduler.kind == SchedulerKind::Priority {
                group.priority = Some(self.config.scheduler.default_priority());
            }
            self.groups.insert(job_id.clone(), group);

            let handle = self.handle.clone();
            let job = job_id.clone();
            self.registry
                .on_delete(job_id.clone(), move || handle.job_stopped(&job));
        }
        self.groups.get_mut(job_id).expect("inserted above")
    }

    fn set_group_priority(&mut self, job_id: &JobId, priority: i32) -> MetaResult<()> {
        if self.config.scheduler.kind != SchedulerKind::Priority {
            return Ok(());
        }
        let group = self.get_or_create_group(job_id);
        if group.priority == Some(priority) {
            return Ok(());
        }
        tracing::info!(job_id = %job_id, priority, "setting priority for group");
        group.priority = Some(priority);

        // A priority change re-seeds the job's queue position from its
        // original submission time.
        match self.task_list.job_submission_time(job_id) {
            Ok(submission_time) => {
                self.queue_positions.insert(
                    job_id.clone(),
                    initialize_queue_position(submission_time),
                );
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "failed to get job submission time");
            }
        }
        Ok(())
    }

    async fn move_job(
        &mut self,
        job_id: &JobId,
        anchor_id: &JobId,
        ahead_of: bool,
    ) -> MetaResult<()> {
        if job_id.as_str().is_empty() || anchor_id.as_str().is_empty() || job_id == anchor_id {
            return Ok(());
        }
        // Job moves fan out to every pool; ignore the ones for jobs we do not
        // host.
        if !self.queue_positions.contains_key(job_id) {
            return Ok(());
        }
        if self.config.scheduler.kind != SchedulerKind::Priority {
            return Err(MetaError::InvalidResourcesRequest(format!(
                "unable to perform operation on resource pool with {} scheduling",
                self.config.scheduler.kind
            )));
        }
        if !self.groups.contains_key(job_id) {
            return Err(MetaError::not_found("job", job_id));
        }
        if !self.queue_positions.contains_key(anchor_id) {
            return Err(MetaError::not_found("job", anchor_id));
        }

        let (needs_priority_change, second_anchor, anchor_priority) =
            find_anchor(job_id, anchor_id, ahead_of, &self.groups, &self.queue_positions);
        if second_anchor.as_str().is_empty() {
            return Err(MetaError::Internal(anyhow::anyhow!(
                "unable to move job {job_id}"
            )));
        }
        if second_anchor == *job_id {
            return Ok(());
        }

        if needs_priority_change {
            let old_priority = self
                .groups
                .get(job_id)
                .and_then(|g| g.priority)
                .unwrap_or_else(|| self.config.scheduler.default_priority());
            self.set_group_priority(job_id, anchor_priority)?;

            match self.registry.load(job_id) {
                Some(changer) => {
                    if let Err(err) = changer(anchor_priority) {
                        let _ = self.set_group_priority(job_id, old_priority);
                        return Err(err);
                    }
                }
                None => {
                    return Err(MetaError::Internal(anyhow::anyhow!(
                        "unable to move job {job_id}: no priority changer registered"
                    )));
                }
            }

            let job_pos = self.queue_positions[job_id];
            let anchor_pos = self.queue_positions[anchor_id];
            let second_pos = self.queue_positions.get(&second_anchor).copied();
            if !need_move(job_pos, anchor_pos, second_pos, ahead_of) {
                return Ok(());
            }
        }

        let position = self
            .queue_positions
            .set_job_position(job_id, anchor_id, &second_anchor)?;
        self.store.update_job_position(job_id, position).await?;
        Ok(())
    }

    async fn capacity_check(
        &self,
        slots: usize,
        task_id: Option<TaskId>,
    ) -> MetaResult<CapacityCheckResponse> {
        let blocked: HashSet<AgentId> = match &task_id {
            Some(task_id) => self
                .blocked_nodes
                .blocked_nodes(task_id)
                .await?
                .into_iter()
                .collect(),
            None => HashSet::new(),
        };
        let states = self.agent_service.list_states();

        let slots_available = match &self.config.provider {
            None => states
                .iter()
                .filter(|(agent_id, _)| !blocked.contains(agent_id))
                .map(|(_, state)| state.num_slots())
                .sum(),
            Some(provider) => {
                let mut total = provider.max_instances * provider.slots_per_instance();
                for (agent_id, state) in &states {
                    if blocked.contains(agent_id) {
                        total = total.saturating_sub(state.num_slots());
                    }
                }
                total
            }
        };

        Ok(CapacityCheckResponse {
            capacity_exceeded: slots_available < slots,
            slots_available,
        })
    }

    /// Fails queued work that can never run while the provisioner cannot grow
    /// the pool, so clients fail fast instead of waiting forever.
    fn prune_task_list(&mut self) {
        let Some(provisioner) = &self.provisioner else {
            return;
        };
        let Some(cause) = self.provisioner_error.clone() else {
            return;
        };
        let slot_count = provisioner.current_slot_count();
        tracing::error!(
            pool = %self.config.pool_name,
            error = %cause,
            slot_count,
            "provisioner in error state"
        );

        let before = self.task_list.len();
        let unsatisfiable: Vec<AllocationId> = self
            .task_list
            .iter()
            .filter(|task| !self.task_list.is_scheduled(task.id()))
            .filter(|task| task.slots_needed > slot_count)
            .map(|task| task.id().clone())
            .collect();
        for allocation_id in unsatisfiable {
            tracing::warn!(allocation_id = %allocation_id, "removing task from list");
            self.task_list.remove_task_by_id(&allocation_id);
            self.events.publish(
                &allocation_id,
                ResourceEvent::InvalidRequest {
                    cause: cause.clone(),
                },
            );
        }
        tracing::warn!(before, after = self.task_list.len(), "pruned task list");
    }

    async fn send_scaling_info(&mut self) {
        let Some(provisioner) = self.provisioner.clone() else {
            return;
        };
        let desired = calculate_desired_new_agent_num(
            &self.task_list,
            &self.groups,
            self.slots_per_instance,
            self.config.max_aux_containers_per_agent,
        );
        let agents = self
            .agent_states_cache
            .as_ref()
            .map(|cache| {
                cache
                    .values()
                    .map(|state| {
                        let name = state.agent_id().into_string();
                        (
                            name.clone(),
                            AgentSummary {
                                name,
                                is_idle: state.idle(),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        if self.scaling_info.update(desired, agents) {
            self.metrics
                .provisioner_desired_instances
                .with_label_values(&[&self.config.pool_name])
                .set(desired as i64);
            provisioner.update_scaling_info(&self.scaling_info).await;
        }
    }

    fn refresh_agent_state_cache_for(&mut self, agents: &[Arc<Agent>]) {
        let Some(cache) = self.agent_states_cache.as_mut() else {
            return;
        };
        for agent in agents {
            cache.insert(agent.id(), agent.state_snapshot());
        }
    }
}

fn rollback_reservations(reserved: &[(Arc<Agent>, ContainerResource)]) {
    for (agent, resource) in reserved {
        agent.deallocate_container(&resource.container_id);
    }
}

fn resource_summary_from_agent_states(
    states: &HashMap<AgentId, AgentState>,
) -> ResourceSummary {
    let mut summary = ResourceSummary {
        num_agents: states.len(),
        ..Default::default()
    };
    for state in states.values() {
        summary.num_total_slots += state.num_slots();
        summary.num_active_slots += state.num_used_slots();
        summary.max_num_aux_containers += state.max_zero_slot_containers;
        summary.num_active_aux_containers += state.zero_slot_containers.len();
    }
    summary
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::config::{PrioritySchedulerConfig, SchedulerConfig};
    use crate::error::MetaError;
    use crate::rm::agent::test_utils::cuda_devices;
    use crate::rm::informer::NodeSummary;
    use crate::rm::provisioner::InstanceLauncher;
    use crate::rm::RmEnv;
    use crate::storage::MemStore;

    fn priority_pool_config(preemption: bool) -> ResourcePoolConfig {
        let mut config = ResourcePoolConfig::new("default");
        config.scheduler = SchedulerConfig {
            kind: SchedulerKind::Priority,
            priority: Some(PrioritySchedulerConfig {
                default_priority: 50,
                preemption,
            }),
            ..Default::default()
        };
        config
    }

    fn add_agent(env: &RmEnv, id: &str, slots: usize) {
        env.agent_service
            .upsert(&NodeSummary::new(id, cuda_devices(slots)));
    }

    fn request(id: &str, job: &str, slots: usize) -> AllocateRequest {
        let mut req = AllocateRequest::new(format!("task-{id}"), job, slots);
        req.allocation_id = Some(AllocationId::from(id));
        req
    }

    async fn expect_event(
        rx: &mut UnboundedReceiver<ResourceEvent>,
        what: &str,
    ) -> ResourceEvent {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .unwrap_or_else(|| panic!("event stream closed waiting for {what}"))
    }

    fn unwrap_allocated(event: ResourceEvent) -> Allocation {
        match event {
            ResourceEvent::Allocated(allocation) => allocation,
            other => panic!("expected an allocated event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_fit() {
        let env = RmEnv::for_test();
        add_agent(&env, "a", 8);
        add_agent(&env, "b", 8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        let req = request("r", "j1", 8);
        let mut events = env.events.subscribe(req.id());
        pool.allocate(req.clone()).unwrap();

        let event = expect_event(&mut events, "allocation").await;
        let allocation = unwrap_allocated(event);
        assert_eq!(allocation.slots(), 8);
        assert!(!allocation.recovered);

        let summaries = pool.get_allocation_summaries().await.unwrap();
        assert!(summaries[req.id()].scheduled);
        assert_eq!(summaries[req.id()].priority, Some(50));

        // One of the two agents is fully reserved.
        let states = env.agent_service.list_states();
        let free: Vec<usize> = states.values().map(|s| s.num_empty_slots()).collect();
        assert!(free.contains(&0) && free.contains(&8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preemption_then_allocation_across_ticks() {
        let env = RmEnv::for_test();
        add_agent(&env, "a", 8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(true), &env, stop_rx);

        let low = request("low", "j1", 8);
        let mut low_events = env.events.subscribe(low.id());
        pool.allocate(low.clone()).unwrap();
        assert_matches!(
            expect_event(&mut low_events, "low allocation").await,
            ResourceEvent::Allocated(_)
        );

        let high = request("high", "j2", 8);
        let mut high_events = env.events.subscribe(high.id());
        pool.allocate(high.clone()).unwrap();
        pool.set_group_priority(JobId::from("j2"), 40).await.unwrap();

        assert_matches!(
            expect_event(&mut low_events, "preemption").await,
            ResourceEvent::ReleaseResources { .. }
        );

        // The allocation gives its resources back; the next tick places the
        // urgent request.
        pool.resources_released(low.id().clone(), None).unwrap();
        assert_matches!(
            expect_event(&mut low_events, "release ack").await,
            ResourceEvent::Released
        );
        assert_matches!(
            expect_event(&mut high_events, "high allocation").await,
            ResourceEvent::Allocated(_)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_success_rebuilds_without_reserving() {
        let env = RmEnv::for_test();
        add_agent(&env, "a", 8);
        add_agent(&env, "b", 8);
        let store = env.store.clone();

        let allocation_id = AllocationId::from("x");
        for (container, agent, devices) in
            [("c-a", "a", 2usize), ("c-b", "b", 4usize)]
        {
            let container_id = ContainerId::from(container);
            store
                .persist_container(
                    &allocation_id,
                    &ContainerResource {
                        resource_id: ResourceId::from(&container_id),
                        container_id,
                        agent_id: AgentId::from(agent),
                        devices: cuda_devices(devices),
                        started: true,
                        exited: false,
                    },
                )
                .await
                .unwrap();
        }

        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        let mut req = request("x", "j1", 6);
        req.restore = true;
        let mut events = env.events.subscribe(&allocation_id);
        pool.allocate(req).unwrap();

        let event = expect_event(&mut events, "restored allocation").await;
        let allocation = unwrap_allocated(event);
        assert!(allocation.recovered);
        assert_eq!(allocation.resources.len(), 2);
        assert_eq!(allocation.slots(), 6);

        // No fresh reservations are attempted.
        let states = env.agent_service.list_states();
        assert!(states.values().all(|s| s.num_empty_slots() == 8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_fails_when_agent_is_gone() {
        let env = RmEnv::for_test();
        add_agent(&env, "a", 8);
        let store = env.store.clone();

        let allocation_id = AllocationId::from("x");
        let container_id = ContainerId::from("c-b");
        store
            .persist_container(
                &allocation_id,
                &ContainerResource {
                    resource_id: ResourceId::from(&container_id),
                    container_id,
                    agent_id: AgentId::from("b"),
                    devices: cuda_devices(4),
                    started: true,
                    exited: false,
                },
            )
            .await
            .unwrap();

        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        let mut req = request("x", "j1", 4);
        req.restore = true;
        let mut events = env.events.subscribe(&allocation_id);
        pool.allocate(req).unwrap();

        let event = expect_event(&mut events, "restore failure").await;
        assert_matches!(
            event,
            ResourceEvent::Failure {
                kind: FailureKind::Restore,
                ..
            }
        );
        assert!(pool.get_allocation_summaries().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_rolls_back() {
        let mem = Arc::new(MemStore::new());
        let env = RmEnv::for_test_with_store(mem.clone());
        add_agent(&env, "a", 8);
        mem.inject_persist_failure(true);

        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        let req = request("r", "j1", 4);
        let mut events = env.events.subscribe(req.id());
        pool.allocate(req.clone()).unwrap();

        // Let a few ticks fail; the reservation must never leak.
        tokio::time::sleep(ACTION_COOL_DOWN * 4).await;
        let summaries = pool.get_allocation_summaries().await.unwrap();
        assert!(!summaries[req.id()].scheduled);
        let states = env.agent_service.list_states();
        assert_eq!(states[&AgentId::from("a")].num_empty_slots(), 8);

        mem.inject_persist_failure(false);
        pool.agent_updated();
        assert_matches!(
            expect_event(&mut events, "allocation after recovery").await,
            ResourceEvent::Allocated(_)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_job_adopts_anchor_priority() {
        let env = RmEnv::for_test();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        // No agents yet, so everything stays queued while we shuffle.
        for (id, job) in [("r1", "j1"), ("r2", "j2"), ("r3", "j3")] {
            pool.allocate(request(id, job, 8)).unwrap();
        }
        pool.set_group_priority(JobId::from("j3"), 40).await.unwrap();
        env.registry
            .add(JobId::from("j1"), Arc::new(|_priority| Ok(())));

        pool.move_job(JobId::from("j1"), JobId::from("j3"), true)
            .await
            .unwrap();

        let summaries = pool.get_allocation_summaries().await.unwrap();
        assert_eq!(summaries[&AllocationId::from("r1")].priority, Some(40));

        // With capacity available, the moved job is placed first.
        let mut r1_events = env.events.subscribe(&AllocationId::from("r1"));
        add_agent(&env, "a", 8);
        pool.agent_updated();
        assert_matches!(
            expect_event(&mut r1_events, "moved job allocation").await,
            ResourceEvent::Allocated(_)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_job_rolls_back_when_changer_rejects() {
        let env = RmEnv::for_test();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        pool.allocate(request("r1", "j1", 8)).unwrap();
        pool.allocate(request("r3", "j3", 8)).unwrap();
        pool.set_group_priority(JobId::from("j3"), 40).await.unwrap();
        env.registry.add(
            JobId::from("j1"),
            Arc::new(|_priority| {
                Err(MetaError::PermissionDenied("cannot change priority".into()))
            }),
        );

        let err = pool
            .move_job(JobId::from("j1"), JobId::from("j3"), true)
            .await
            .unwrap_err();
        assert_matches!(err, MetaError::PermissionDenied(_));

        let summaries = pool.get_allocation_summaries().await.unwrap();
        assert_eq!(summaries[&AllocationId::from("r1")].priority, Some(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_before_allocated() {
        let env = RmEnv::for_test();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        let req = request("r", "j1", 4);
        let mut events = env.events.subscribe(req.id());
        pool.allocate(req.clone()).unwrap();
        pool.resources_released(req.id().clone(), None).unwrap();

        assert_matches!(
            expect_event(&mut events, "release").await,
            ResourceEvent::Released
        );
        assert!(pool.get_allocation_summaries().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_release_frees_one_container() {
        let env = RmEnv::for_test();
        add_agent(&env, "a", 4);
        add_agent(&env, "b", 4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        let req = request("r", "j1", 8);
        let mut events = env.events.subscribe(req.id());
        pool.allocate(req.clone()).unwrap();
        let event = expect_event(&mut events, "allocation").await;
        let allocation = unwrap_allocated(event);
        assert_eq!(allocation.resources.len(), 2);

        let (resource_id, resource) = allocation.resources.iter().next().unwrap();
        pool.resources_released(req.id().clone(), Some(resource_id.clone()))
            .unwrap();

        // The task stays allocated, with the container's agent freed again.
        let summaries = pool.get_allocation_summaries().await.unwrap();
        assert!(summaries[req.id()].scheduled);
        let states = env.agent_service.list_states();
        assert_eq!(states[&resource.agent_id].num_empty_slots(), 4);
    }

    struct FailingLauncher;

    #[async_trait]
    impl InstanceLauncher for FailingLauncher {
        async fn set_desired_instances(&self, _desired: usize) -> MetaResult<usize> {
            Err(MetaError::Provisioner("instance quota exceeded".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioner_error_prunes_unsatisfiable_tasks() {
        let mut env = RmEnv::for_test();
        env.launcher = Some(Arc::new(FailingLauncher));
        let mut config = priority_pool_config(false);
        config.provider = Some(
            serde_json::from_str(r#"{"max_instances": 2, "aws": {"slots_per_instance": 4}}"#)
                .unwrap(),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(config, &env, stop_rx);

        let req = request("r", "j1", 16);
        let mut events = env.events.subscribe(req.id());
        pool.allocate(req.clone()).unwrap();

        assert_matches!(
            expect_event(&mut events, "invalid request").await,
            ResourceEvent::InvalidRequest { .. }
        );
        assert!(pool.get_allocation_summaries().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_and_capacity_check() {
        let env = RmEnv::for_test();
        add_agent(&env, "a", 4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        let response = pool.validate_resources(2).await.unwrap();
        assert!(response.fulfillable);

        let response = pool.capacity_check(4, None).await.unwrap();
        assert!(!response.capacity_exceeded);
        assert_eq!(response.slots_available, 4);

        let response = pool.capacity_check(5, None).await.unwrap();
        assert!(response.capacity_exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_job_drops_group_state() {
        let env = RmEnv::for_test();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (pool, _join) = ResourcePool::spawn(priority_pool_config(false), &env, stop_rx);

        let req = request("r", "j1", 4);
        pool.allocate(req.clone()).unwrap();
        pool.delete_job(JobId::from("j1")).await.unwrap();

        // The group is recreated with defaults if the job ever comes back.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let summary = pool
            .get_allocation_summary(req.id().clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.priority, None);
    }
}
