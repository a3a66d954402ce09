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

//! Requests, responses, and events spoken between the API layer, the resource
//! pools, and allocation watchers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use bosun_common::device::Device;
use bosun_common::id::{AgentId, AllocationId, ContainerId, JobId, ResourceId, SlotId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placement constraints a request may carry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittingRequirements {
    /// All slots must come from a single agent.
    pub single_agent: bool,
    /// Slots to never place on, regardless of availability.
    pub blacklist: HashSet<SlotId>,
}

/// A request for resources, as submitted to a pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocateRequest {
    /// Assigned by the pool on admission when absent. Never reused.
    pub allocation_id: Option<AllocationId>,
    pub task_id: TaskId,
    pub job_id: JobId,
    pub name: String,
    pub slots_needed: usize,
    /// Resolved to the default pool by the resource manager when absent.
    pub resource_pool: Option<String>,
    /// Agent-selection hint; must equal the agent's label to place there.
    pub label: Option<String>,
    pub job_submission_time: DateTime<Utc>,
    pub is_user_visible: bool,
    /// Set when re-submitting an allocation that survived a process restart.
    pub restore: bool,
    pub preemptible: bool,
    pub fitting_requirements: FittingRequirements,
}

impl AllocateRequest {
    pub fn new(task_id: impl Into<TaskId>, job_id: impl Into<JobId>, slots_needed: usize) -> Self {
        Self {
            allocation_id: None,
            task_id: task_id.into(),
            job_id: job_id.into(),
            name: String::new(),
            slots_needed,
            resource_pool: None,
            label: None,
            job_submission_time: Utc::now(),
            is_user_visible: true,
            restore: false,
            preemptible: true,
            fitting_requirements: FittingRequirements::default(),
        }
    }

    /// Id of the allocation. Requests admitted into a pool always have one.
    pub fn id(&self) -> &AllocationId {
        self.allocation_id
            .as_ref()
            .expect("allocation id is assigned on admission")
    }
}

/// One container's worth of placed resources.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResource {
    pub resource_id: ResourceId,
    pub container_id: ContainerId,
    pub agent_id: AgentId,
    pub devices: Vec<Device>,
    pub started: bool,
    pub exited: bool,
}

/// The result of a successful placement: an accepted request plus its
/// containers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub allocation_id: AllocationId,
    pub resource_pool: String,
    pub resources: BTreeMap<ResourceId, ContainerResource>,
    pub job_submission_time: DateTime<Utc>,
    /// True when reconstructed from persisted snapshots after a restart.
    pub recovered: bool,
}

impl Allocation {
    pub fn slots(&self) -> usize {
        self.resources.values().map(|r| r.devices.len()).sum()
    }
}

/// Classifies a [`ResourceEvent::Failure`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Persisted snapshots reference an agent absent from the cluster.
    Restore,
    /// An agent refused a reservation between snapshot and commit.
    Reserve,
    /// A database write failed after agents reserved.
    Persistence,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Restore => f.write_str("restore error"),
            FailureKind::Reserve => f.write_str("reserve error"),
            FailureKind::Persistence => f.write_str("persistence error"),
        }
    }
}

/// Events published on an allocation's stream, observed in publish order.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceEvent {
    Allocated(Allocation),
    /// The scheduler asks the allocation to give its resources back.
    ReleaseResources { reason: String },
    Released,
    Failure { kind: FailureKind, error: String },
    /// The request can never be satisfied; the task was removed from the pool.
    InvalidRequest { cause: String },
}

/// Read-only description of one task known to a pool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllocationSummary {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub job_id: JobId,
    pub name: String,
    pub registered_time: DateTime<Utc>,
    pub resource_pool: String,
    pub slots_needed: usize,
    pub scheduled: bool,
    pub priority: Option<i32>,
}

/// Aggregate view of a pool's agents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSummary {
    pub num_agents: usize,
    pub num_total_slots: usize,
    pub num_active_slots: usize,
    pub max_num_aux_containers: usize,
    pub num_active_aux_containers: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CapacityCheckResponse {
    pub capacity_exceeded: bool,
    pub slots_available: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ValidateResourcesResponse {
    pub fulfillable: bool,
}

/// Soft warnings attached to a launch response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LaunchWarning {
    CurrentSlotsExceeded,
}

/// Idle/busy digest of one agent, handed to the provisioner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSummary {
    pub name: String,
    pub is_idle: bool,
}

/// The autoscaling demand signal computed after each scheduling pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScalingInfo {
    pub desired_new_instances: usize,
    pub agents: HashMap<String, AgentSummary>,
}

impl ScalingInfo {
    /// Overwrites the signal, reporting whether anything changed so unchanged
    /// updates can be suppressed.
    pub fn update(&mut self, desired_new_instances: usize, agents: HashMap<String, AgentSummary>) -> bool {
        let changed =
            self.desired_new_instances != desired_new_instances || self.agents != agents;
        if changed {
            self.desired_new_instances = desired_new_instances;
            self.agents = agents;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use maplit::hashmap;

    use super::*;

    #[test]
    fn test_scaling_info_suppresses_unchanged_updates() {
        let mut info = ScalingInfo::default();
        let agents = hashmap! {
            "a0".to_owned() => AgentSummary { name: "a0".to_owned(), is_idle: true },
        };
        assert!(info.update(2, agents.clone()));
        assert!(!info.update(2, agents.clone()));
        assert!(info.update(3, agents));
    }

    #[test]
    fn test_allocation_slot_count() {
        let mut resources = BTreeMap::new();
        let cid = ContainerId::new_random();
        resources.insert(
            ResourceId::from(&cid),
            ContainerResource {
                resource_id: ResourceId::from(&cid),
                container_id: cid,
                agent_id: AgentId::from("a0"),
                devices: vec![
                    Device::new(0, "brand", "uuid-0", bosun_common::device::DeviceType::Cuda),
                    Device::new(1, "brand", "uuid-1", bosun_common::device::DeviceType::Cuda),
                ],
                started: false,
                exited: false,
            },
        );
        let allocation = Allocation {
            allocation_id: AllocationId::new_random(),
            resource_pool: "default".to_owned(),
            resources,
            job_submission_time: Utc::now(),
            recovered: false,
        };
        assert_eq!(allocation.slots(), 2);
    }
}
