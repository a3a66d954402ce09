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

use std::collections::{BTreeMap, HashMap, HashSet};

use bosun_common::id::{AllocationId, JobId};
use itertools::Itertools;
use rust_decimal::Decimal;

use super::{
    queue_order_key, simulate_allocate, simulate_release, ScheduleResult, Scheduler,
    SchedulerContext,
};
use crate::rm::message::AllocateRequest;

/// Allocates strictly by priority band (lower value first), by queue position
/// within a band. With preemption enabled, a request that cannot fit may evict
/// less urgent allocations; the evictions are issued this tick and the request
/// is placed on a later tick, once the releases have been observed.
pub struct PriorityScheduler {
    preemption_enabled: bool,
}

impl PriorityScheduler {
    pub fn new(preemption_enabled: bool) -> Self {
        Self {
            preemption_enabled,
        }
    }

    fn priority_of(&self, ctx: &SchedulerContext<'_>, job_id: &JobId) -> i32 {
        ctx.groups.get(job_id).and_then(|g| g.priority).unwrap_or(0)
    }
}

impl Scheduler for PriorityScheduler {
    fn schedule(&mut self, ctx: &SchedulerContext<'_>) -> ScheduleResult {
        let mut working = ctx.agent_states.clone();
        let mut result = ScheduleResult::default();

        let mut pending: BTreeMap<i32, Vec<&AllocateRequest>> = BTreeMap::new();
        for task in ctx.task_list.iter() {
            if !ctx.task_list.is_scheduled(task.id()) {
                pending
                    .entry(self.priority_of(ctx, &task.job_id))
                    .or_default()
                    .push(task);
            }
        }
        for tasks in pending.values_mut() {
            tasks.sort_by_key(|task| queue_order_key(task, ctx.queue_positions));
        }

        // Eviction candidates, least urgent and most recently queued first.
        let victims: Vec<(i32, Decimal, AllocationId)> = ctx
            .task_list
            .iter()
            .filter(|task| ctx.task_list.is_scheduled(task.id()) && task.preemptible)
            .map(|task| {
                let (position, _) = queue_order_key(task, ctx.queue_positions);
                (
                    self.priority_of(ctx, &task.job_id),
                    position,
                    task.id().clone(),
                )
            })
            .sorted_by_key(|(priority, position, id)| (-priority, -position, id.clone()))
            .collect();

        let mut slots_by_job: HashMap<JobId, usize> = HashMap::new();
        for task in ctx.task_list.iter() {
            if let Some(allocation) = ctx.task_list.allocation(task.id()) {
                *slots_by_job.entry(task.job_id.clone()).or_default() += allocation.slots();
            }
        }

        let mut released: HashSet<AllocationId> = HashSet::new();
        for (&priority, tasks) in &pending {
            for task in tasks {
                let max_slots = ctx
                    .groups
                    .get(&task.job_id)
                    .and_then(|g| g.max_slots)
                    .unwrap_or(usize::MAX);
                let used = slots_by_job.get(&task.job_id).copied().unwrap_or(0);
                if used + task.slots_needed > max_slots {
                    continue;
                }

                if simulate_allocate(
                    task,
                    &mut working,
                    ctx.soft_constraint,
                    ctx.allow_heterogeneous_fits,
                ) {
                    *slots_by_job.entry(task.job_id.clone()).or_default() += task.slots_needed;
                    result.to_allocate.push(task.id().clone());
                    continue;
                }
                if !self.preemption_enabled {
                    continue;
                }

                // Simulate evicting less urgent allocations until the task
                // would fit; commit the evictions only if it eventually does.
                let mut sim = working.clone();
                let mut chosen = vec![];
                let mut fits = false;
                for (victim_priority, _, victim_id) in &victims {
                    if *victim_priority <= priority || released.contains(victim_id) {
                        continue;
                    }
                    let Some(allocation) = ctx.task_list.allocation(victim_id) else {
                        continue;
                    };
                    simulate_release(allocation, &mut sim);
                    chosen.push(victim_id.clone());
                    if simulate_allocate(
                        task,
                        &mut sim,
                        ctx.soft_constraint,
                        ctx.allow_heterogeneous_fits,
                    ) {
                        fits = true;
                        break;
                    }
                }
                if fits {
                    released.extend(chosen.iter().cloned());
                    result.to_release.extend(chosen);
                }
            }
        }
        result
    }
}
