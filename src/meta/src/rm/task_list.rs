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

use std::collections::{BTreeMap, HashMap};

use bosun_common::id::{AllocationId, JobId};
use chrono::{DateTime, Utc};

use crate::config::SchedulerKind;
use crate::error::{MetaError, MetaResult};
use crate::rm::group::Groups;
use crate::rm::message::{AllocateRequest, Allocation, AllocationSummary};

/// Ordered registry of the requests a pool knows about, pending and allocated
/// alike. Iteration is by admission order and stable within a tick; the pool
/// actor serializes all mutation.
#[derive(Default)]
pub struct TaskList {
    tasks_by_seq: BTreeMap<u64, AllocateRequest>,
    seq_by_id: HashMap<AllocationId, u64>,
    registered_times: HashMap<AllocationId, DateTime<Utc>>,
    allocations: HashMap<AllocationId, Allocation>,
    next_seq: u64,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks_by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks_by_seq.is_empty()
    }

    /// Admits a task. The request must already carry an allocation id, and the
    /// id must not be present.
    pub fn add_task(&mut self, task: AllocateRequest) -> MetaResult<()> {
        let id = task
            .allocation_id
            .clone()
            .ok_or_else(|| MetaError::InvalidResourcesRequest("missing allocation id".into()))?;
        if self.seq_by_id.contains_key(&id) {
            return Err(MetaError::InvalidResourcesRequest(format!(
                "allocation {id} is already in the pool"
            )));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq_by_id.insert(id.clone(), seq);
        self.registered_times.insert(id, Utc::now());
        self.tasks_by_seq.insert(seq, task);
        Ok(())
    }

    pub fn task_by_id(&self, id: &AllocationId) -> Option<&AllocateRequest> {
        self.seq_by_id
            .get(id)
            .and_then(|seq| self.tasks_by_seq.get(seq))
    }

    pub fn task_by_id_mut(&mut self, id: &AllocationId) -> Option<&mut AllocateRequest> {
        self.seq_by_id
            .get(id)
            .and_then(|seq| self.tasks_by_seq.get_mut(seq))
    }

    /// Removes the task and any allocation it holds.
    pub fn remove_task_by_id(&mut self, id: &AllocationId) -> Option<AllocateRequest> {
        let seq = self.seq_by_id.remove(id)?;
        self.registered_times.remove(id);
        self.allocations.remove(id);
        self.tasks_by_seq.remove(&seq)
    }

    pub fn allocation(&self, id: &AllocationId) -> Option<&Allocation> {
        self.allocations.get(id)
    }

    pub fn allocation_mut(&mut self, id: &AllocationId) -> Option<&mut Allocation> {
        self.allocations.get_mut(id)
    }

    pub fn add_allocation(&mut self, id: AllocationId, allocation: Allocation) {
        self.allocations.insert(id, allocation);
    }

    pub fn remove_allocation(&mut self, id: &AllocationId) -> Option<Allocation> {
        self.allocations.remove(id)
    }

    pub fn is_scheduled(&self, id: &AllocationId) -> bool {
        self.allocations.contains_key(id)
    }

    /// Tasks in admission order.
    pub fn iter(&self) -> impl Iterator<Item = &AllocateRequest> {
        self.tasks_by_seq.values()
    }

    /// Slots currently held by a job's allocations.
    pub fn allocated_slots(&self, job_id: &JobId) -> usize {
        self.iter()
            .filter(|task| task.job_id == *job_id)
            .filter_map(|task| self.allocations.get(task.id()))
            .map(|allocation| allocation.slots())
            .sum()
    }

    /// Submission time of the job's first admitted task.
    pub fn job_submission_time(&self, job_id: &JobId) -> MetaResult<DateTime<Utc>> {
        self.iter()
            .find(|task| task.job_id == *job_id)
            .map(|task| task.job_submission_time)
            .ok_or_else(|| MetaError::not_found("job", job_id))
    }

    pub fn task_summary(
        &self,
        id: &AllocationId,
        groups: &Groups,
        scheduler_kind: SchedulerKind,
    ) -> Option<AllocationSummary> {
        let task = self.task_by_id(id)?;
        let priority = match scheduler_kind {
            SchedulerKind::Priority => groups.get(&task.job_id).and_then(|g| g.priority),
            _ => None,
        };
        Some(AllocationSummary {
            allocation_id: id.clone(),
            task_id: task.task_id.clone(),
            job_id: task.job_id.clone(),
            name: task.name.clone(),
            registered_time: self
                .registered_times
                .get(id)
                .copied()
                .unwrap_or(task.job_submission_time),
            resource_pool: task.resource_pool.clone().unwrap_or_default(),
            slots_needed: task.slots_needed,
            scheduled: self.is_scheduled(id),
            priority,
        })
    }

    pub fn task_summaries(
        &self,
        groups: &Groups,
        scheduler_kind: SchedulerKind,
    ) -> HashMap<AllocationId, AllocationSummary> {
        self.iter()
            .filter_map(|task| {
                let id = task.id();
                self.task_summary(id, groups, scheduler_kind)
                    .map(|summary| (id.clone(), summary))
            })
            .collect()
    }
}
