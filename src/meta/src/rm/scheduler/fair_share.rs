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

use std::collections::BTreeMap;

use bosun_common::id::JobId;
use itertools::Itertools;

use super::{queue_order_key, simulate_allocate, ScheduleResult, Scheduler, SchedulerContext};

/// Water-fills the pool's slot capacity over the jobs that want it, weighted
/// by group weight and capped by each group's demand, then reconciles every
/// group to its share: under-served groups allocate pending tasks in
/// submission order, over-served groups release their newest allocations.
pub struct FairShareScheduler;

#[derive(Debug)]
struct GroupEntitlement {
    weight: f64,
    demand: usize,
    share: usize,
}

impl FairShareScheduler {
    fn entitlements(ctx: &SchedulerContext<'_>, capacity: usize) -> BTreeMap<JobId, GroupEntitlement> {
        let mut entitlements: BTreeMap<JobId, GroupEntitlement> = BTreeMap::new();
        for task in ctx.task_list.iter() {
            let group = ctx.groups.get(&task.job_id);
            let entry = entitlements
                .entry(task.job_id.clone())
                .or_insert_with(|| GroupEntitlement {
                    weight: group.map(|g| g.weight).unwrap_or(1.0),
                    demand: 0,
                    share: 0,
                });
            entry.demand += task.slots_needed;
        }
        for (job_id, entitlement) in &mut entitlements {
            if let Some(max) = ctx.groups.get(job_id).and_then(|g| g.max_slots) {
                entitlement.demand = entitlement.demand.min(max);
            }
        }

        // Water filling: grant each unfilled group its weighted share of what
        // remains, one round at a time; a final slot-by-slot round clears
        // rounding leftovers.
        let mut remaining = capacity;
        loop {
            let unfilled: Vec<JobId> = entitlements
                .iter()
                .filter(|(_, e)| e.share < e.demand)
                .map(|(job, _)| job.clone())
                .collect();
            if unfilled.is_empty() || remaining == 0 {
                break;
            }
            let total_weight: f64 = unfilled
                .iter()
                .map(|job| entitlements[job].weight)
                .sum();
            let mut progressed = false;
            let pool = remaining;
            for job in &unfilled {
                let entitlement = entitlements.get_mut(job).expect("listed above");
                let fair = ((pool as f64) * entitlement.weight / total_weight).floor() as usize;
                let grant = fair
                    .min(entitlement.demand - entitlement.share)
                    .min(remaining);
                if grant > 0 {
                    entitlement.share += grant;
                    remaining -= grant;
                    progressed = true;
                }
            }
            if !progressed {
                for job in &unfilled {
                    if remaining == 0 {
                        break;
                    }
                    let entitlement = entitlements.get_mut(job).expect("listed above");
                    if entitlement.share < entitlement.demand {
                        entitlement.share += 1;
                        remaining -= 1;
                    }
                }
            }
        }
        entitlements
    }
}

impl Scheduler for FairShareScheduler {
    fn schedule(&mut self, ctx: &SchedulerContext<'_>) -> ScheduleResult {
        let capacity: usize = ctx
            .agent_states
            .values()
            .filter(|state| state.schedulable())
            .map(|state| state.num_slots())
            .sum();
        let entitlements = Self::entitlements(ctx, capacity);

        let mut working = ctx.agent_states.clone();
        let mut result = ScheduleResult::default();

        for (job_id, entitlement) in &entitlements {
            let mut held = ctx.task_list.allocated_slots(job_id);

            if held > entitlement.share {
                // Shed the newest allocations until back inside the share. The
                // slots stay occupied in this tick's snapshot; under-served
                // groups pick them up once the releases have landed.
                let over_held = ctx
                    .task_list
                    .iter()
                    .filter(|task| task.job_id == *job_id && task.preemptible)
                    .filter(|task| ctx.task_list.is_scheduled(task.id()))
                    .sorted_by_key(|task| queue_order_key(task, ctx.queue_positions))
                    .rev();
                for task in over_held {
                    if held <= entitlement.share {
                        break;
                    }
                    let allocation = ctx
                        .task_list
                        .allocation(task.id())
                        .expect("scheduled task has an allocation");
                    held = held.saturating_sub(allocation.slots());
                    result.to_release.push(task.id().clone());
                }
                continue;
            }

            let pending = ctx
                .task_list
                .iter()
                .filter(|task| task.job_id == *job_id)
                .filter(|task| !ctx.task_list.is_scheduled(task.id()))
                .sorted_by_key(|task| queue_order_key(task, ctx.queue_positions));
            for task in pending {
                if held + task.slots_needed > entitlement.share {
                    continue;
                }
                if simulate_allocate(
                    task,
                    &mut working,
                    ctx.soft_constraint,
                    ctx.allow_heterogeneous_fits,
                ) {
                    held += task.slots_needed;
                    result.to_allocate.push(task.id().clone());
                }
            }
        }
        result
    }
}
