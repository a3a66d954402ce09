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

//! Scheduling policies. Each variant decides, from the pool's view of one
//! tick, which requests to allocate and which allocations to preempt. Results
//! are deterministic for a fixed `(task list, groups, sort state, snapshot)`.

use std::collections::HashMap;

use bosun_common::id::{AgentId, AllocationId, ContainerId};
use rust_decimal::Decimal;

use crate::config::{SchedulerConfig, SchedulerKind};
use crate::rm::agent::AgentState;
use crate::rm::fitting::{find_fits, SoftConstraint};
use crate::rm::group::Groups;
use crate::rm::message::{AllocateRequest, Allocation};
use crate::rm::sort_state::{initialize_queue_position, JobSortState};
use crate::rm::task_list::TaskList;

pub mod fair_share;
pub mod priority;
pub mod round_robin;

pub use fair_share::FairShareScheduler;
pub use priority::PriorityScheduler;
pub use round_robin::RoundRobinScheduler;

/// Everything a policy may consult. Borrowed from the pool for the duration of
/// one `schedule` call; policies never mutate the pool.
pub struct SchedulerContext<'a> {
    pub task_list: &'a TaskList,
    pub groups: &'a Groups,
    pub queue_positions: &'a JobSortState,
    pub agent_states: &'a HashMap<AgentId, AgentState>,
    pub soft_constraint: SoftConstraint,
    pub allow_heterogeneous_fits: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScheduleResult {
    pub to_allocate: Vec<AllocationId>,
    pub to_release: Vec<AllocationId>,
}

pub trait Scheduler: Send + Sync {
    fn schedule(&mut self, ctx: &SchedulerContext<'_>) -> ScheduleResult;
}

pub fn make_scheduler(config: &SchedulerConfig) -> Box<dyn Scheduler> {
    match config.kind {
        SchedulerKind::FairShare => Box::new(FairShareScheduler),
        SchedulerKind::Priority => Box::new(PriorityScheduler::new(config.preemption_enabled())),
        SchedulerKind::RoundRobin => Box::new(RoundRobinScheduler),
    }
}

/// Ordering key of a task inside its priority band: the job's queue position
/// (seeded from the submission instant for jobs without one), then the
/// allocation id.
pub(crate) fn queue_order_key(
    task: &AllocateRequest,
    positions: &JobSortState,
) -> (Decimal, AllocationId) {
    let position = positions
        .get(&task.job_id)
        .copied()
        .unwrap_or_else(|| initialize_queue_position(task.job_submission_time));
    (position, task.id().clone())
}

/// Commits a fit into the working copy of the snapshot, so later decisions in
/// the same pass observe the reservation. Returns false when no fit exists.
pub(crate) fn simulate_allocate(
    task: &AllocateRequest,
    working: &mut HashMap<AgentId, AgentState>,
    soft_constraint: SoftConstraint,
    allow_heterogeneous_fits: bool,
) -> bool {
    let fits = find_fits(task, working, soft_constraint, allow_heterogeneous_fits);
    if fits.is_empty() {
        return false;
    }
    let container_id = ContainerId::from(format!("planned-{}", task.id()));
    for fit in &fits {
        working
            .get_mut(&fit.agent_id)
            .expect("fit refers to a snapshot agent")
            .allocate_slots(
                fit.slots,
                &task.fitting_requirements.blacklist,
                &container_id,
            )
            .expect("fit verified against the same snapshot");
    }
    true
}

/// Returns an allocation's devices to the working copy of the snapshot.
pub(crate) fn simulate_release(
    allocation: &Allocation,
    working: &mut HashMap<AgentId, AgentState>,
) {
    for resource in allocation.resources.values() {
        if let Some(state) = working.get_mut(&resource.agent_id) {
            state.deallocate_container(&resource.container_id);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use bosun_common::id::{AgentId, AllocationId, JobId, ResourceId};
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::rm::agent::test_utils::cuda_devices;
    use crate::rm::group::Group;
    use crate::rm::message::ContainerResource;

    pub(crate) fn cuda_agent(id: &str, slots: usize) -> AgentState {
        AgentState::new(AgentId::from(id), None, cuda_devices(slots), 10)
    }

    pub(crate) fn snapshot(agents: Vec<AgentState>) -> HashMap<AgentId, AgentState> {
        agents
            .into_iter()
            .map(|state| (state.agent_id(), state))
            .collect()
    }

    pub(crate) fn groups_with_priorities(priorities: &[(&str, i32)]) -> Groups {
        priorities
            .iter()
            .map(|(job, priority)| {
                let id = JobId::from(*job);
                let mut group = Group::new(id.clone());
                group.priority = Some(*priority);
                (id, group)
            })
            .collect()
    }

    pub(crate) fn groups_with_weights(weights: &[(&str, f64)]) -> Groups {
        weights
            .iter()
            .map(|(job, weight)| {
                let id = JobId::from(*job);
                let mut group = Group::new(id.clone());
                group.weight = *weight;
                (id, group)
            })
            .collect()
    }

    /// A context with the default soft constraint and homogeneous fits only.
    pub(crate) fn test_ctx<'a>(
        task_list: &'a TaskList,
        groups: &'a Groups,
        queue_positions: &'a JobSortState,
        agent_states: &'a HashMap<AgentId, AgentState>,
    ) -> SchedulerContext<'a> {
        SchedulerContext {
            task_list,
            groups,
            queue_positions,
            agent_states,
            soft_constraint: SoftConstraint::BestFit,
            allow_heterogeneous_fits: false,
        }
    }

    pub(crate) fn request_at(id: &str, job: &str, slots: usize, secs: i64) -> AllocateRequest {
        let mut req = AllocateRequest::new(format!("task-{id}"), job, slots);
        req.allocation_id = Some(AllocationId::from(id));
        req.job_submission_time = Utc.timestamp_opt(secs, 0).unwrap();
        req
    }

    /// Admits the request and fakes an allocation of `slots` devices on
    /// `agent`, mirroring them as used in the snapshot.
    pub(crate) fn allocate_on(
        task_list: &mut TaskList,
        states: &mut HashMap<AgentId, AgentState>,
        req: &AllocateRequest,
        agent: &str,
        slots: usize,
    ) {
        let agent_id = AgentId::from(agent);
        let container_id = bosun_common::id::ContainerId::new_random();
        let devices = states
            .get_mut(&agent_id)
            .unwrap()
            .allocate_slots(slots, &Default::default(), &container_id)
            .unwrap();
        let resource = ContainerResource {
            resource_id: ResourceId::from(&container_id),
            container_id,
            agent_id,
            devices,
            started: true,
            exited: false,
        };
        let mut resources = std::collections::BTreeMap::new();
        resources.insert(resource.resource_id.clone(), resource);
        task_list.add_task(req.clone()).unwrap();
        task_list.add_allocation(
            req.id().clone(),
            Allocation {
                allocation_id: req.id().clone(),
                resource_pool: "default".to_owned(),
                resources,
                job_submission_time: req.job_submission_time,
                recovered: false,
            },
        );
    }
}
