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
use std::sync::Arc;

use async_trait::async_trait;
use bosun_common::id::JobId;
use parking_lot::Mutex;

use crate::config::ProviderConfig;
use crate::error::MetaResult;
use crate::rm::group::Groups;
use crate::rm::message::ScalingInfo;
use crate::rm::task_list::TaskList;

/// Cloud-side instance control (a collaborator; the actual EC2/GCE clients
/// live behind it).
#[async_trait]
pub trait InstanceLauncher: Send + Sync + 'static {
    /// Reconciles the fleet toward `desired` instances and returns the count
    /// currently reachable.
    async fn set_desired_instances(&self, desired: usize) -> MetaResult<usize>;
}

#[derive(Default)]
struct ProvisionerState {
    last_error: Option<String>,
    current_instances: usize,
}

/// Autoscaler attached to one pool. The pool pushes it a scaling signal after
/// each pass; launch failures are remembered so the pool can fail queued work
/// fast instead of letting it wait forever.
pub struct Provisioner {
    pool_name: String,
    config: ProviderConfig,
    launcher: Arc<dyn InstanceLauncher>,
    state: Mutex<ProvisionerState>,
}

impl Provisioner {
    pub fn new(
        pool_name: impl Into<String>,
        config: ProviderConfig,
        launcher: Arc<dyn InstanceLauncher>,
    ) -> Self {
        Self {
            pool_name: pool_name.into(),
            config,
            launcher,
            state: Mutex::new(ProvisionerState::default()),
        }
    }

    pub fn slots_per_instance(&self) -> usize {
        self.config.slots_per_instance()
    }

    /// The error of the most recent launch attempt, if it failed.
    pub fn launch_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Slots reachable through currently-running instances.
    pub fn current_slot_count(&self) -> usize {
        self.state.lock().current_instances * self.slots_per_instance()
    }

    pub async fn update_scaling_info(&self, info: &ScalingInfo) {
        let desired = info.desired_new_instances.min(self.config.max_instances);
        match self.launcher.set_desired_instances(desired).await {
            Ok(current) => {
                let mut state = self.state.lock();
                state.last_error = None;
                state.current_instances = current;
            }
            Err(err) => {
                tracing::error!(
                    pool = %self.pool_name,
                    desired,
                    error = %err,
                    "instance launch failed"
                );
                self.state.lock().last_error = Some(err.to_string());
            }
        }
    }
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Instances wanted to drain the pending queue: slot demand (capped per job by
/// `max_slots`) over the per-instance slot count, against aux-container demand
/// over the per-agent aux cap, whichever is larger.
pub fn calculate_desired_new_agent_num(
    task_list: &TaskList,
    groups: &Groups,
    slots_per_instance: usize,
    max_aux_containers_per_agent: usize,
) -> usize {
    let mut slots_needed = 0usize;
    let mut aux_tasks = 0usize;
    let mut counted_by_job: HashMap<JobId, usize> = HashMap::new();

    for task in task_list.iter() {
        if task_list.is_scheduled(task.id()) {
            continue;
        }
        if task.slots_needed == 0 {
            aux_tasks += 1;
            continue;
        }
        let max_slots = groups
            .get(&task.job_id)
            .and_then(|g| g.max_slots)
            .unwrap_or(usize::MAX);
        let counted = counted_by_job.entry(task.job_id.clone()).or_insert_with(|| {
            task_list.allocated_slots(&task.job_id)
        });
        let budget = max_slots.saturating_sub(*counted);
        let wanted = task.slots_needed.min(budget);
        *counted += wanted;
        slots_needed += wanted;
    }

    let for_slots = if slots_per_instance > 0 {
        div_ceil(slots_needed, slots_per_instance)
    } else {
        0
    };
    let for_aux = if max_aux_containers_per_agent > 0 {
        div_ceil(aux_tasks, max_aux_containers_per_agent)
    } else {
        0
    };
    for_slots.max(for_aux)
}

#[cfg(test)]
mod tests {
    use bosun_common::id::AllocationId;

    use super::*;
    use crate::rm::group::Group;
    use crate::rm::message::AllocateRequest;

    fn pending(id: &str, job: &str, slots: usize) -> AllocateRequest {
        let mut req = AllocateRequest::new(format!("t-{id}"), job, slots);
        req.allocation_id = Some(AllocationId::from(id));
        req
    }

    #[test]
    fn test_desired_agents_round_up() {
        let mut task_list = TaskList::new();
        task_list.add_task(pending("a", "j1", 3)).unwrap();
        task_list.add_task(pending("b", "j2", 2)).unwrap();
        let groups = Groups::new();
        assert_eq!(
            calculate_desired_new_agent_num(&task_list, &groups, 4, 100),
            2
        );
    }

    #[test]
    fn test_max_slots_caps_demand() {
        let mut task_list = TaskList::new();
        task_list.add_task(pending("a", "j1", 8)).unwrap();
        task_list.add_task(pending("b", "j1", 8)).unwrap();
        let mut groups = Groups::new();
        let mut group = Group::new(JobId::from("j1"));
        group.max_slots = Some(8);
        groups.insert(JobId::from("j1"), group);
        assert_eq!(
            calculate_desired_new_agent_num(&task_list, &groups, 4, 100),
            2
        );
    }

    #[test]
    fn test_aux_tasks_count_against_aux_capacity() {
        let mut task_list = TaskList::new();
        for i in 0..5 {
            task_list.add_task(pending(&format!("z{i}"), "j1", 0)).unwrap();
        }
        let groups = Groups::new();
        assert_eq!(
            calculate_desired_new_agent_num(&task_list, &groups, 4, 2),
            3
        );
    }

    #[tokio::test]
    async fn test_provisioner_records_launch_errors() {
        struct FailingLauncher;
        #[async_trait]
        impl InstanceLauncher for FailingLauncher {
            async fn set_desired_instances(&self, _desired: usize) -> MetaResult<usize> {
                Err(crate::error::MetaError::Provisioner("quota exceeded".into()))
            }
        }

        let config: ProviderConfig = serde_json::from_str(
            r#"{"max_instances": 4, "aws": {"slots_per_instance": 4}}"#,
        )
        .unwrap();
        let provisioner = Provisioner::new("default", config, Arc::new(FailingLauncher));
        assert!(provisioner.launch_error().is_none());

        provisioner
            .update_scaling_info(&ScalingInfo {
                desired_new_instances: 2,
                agents: HashMap::new(),
            })
            .await;
        assert!(provisioner.launch_error().is_some());
        assert_eq!(provisioner.current_slot_count(), 0);
    }
}
