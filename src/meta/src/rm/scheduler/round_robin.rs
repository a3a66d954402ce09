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

use itertools::Itertools;

use super::{queue_order_key, simulate_allocate, ScheduleResult, Scheduler, SchedulerContext};

/// Queue-position-ordered FIFO. Never preempts; whatever does not fit stays
/// queued for a later tick.
pub struct RoundRobinScheduler;

impl Scheduler for RoundRobinScheduler {
    fn schedule(&mut self, ctx: &SchedulerContext<'_>) -> ScheduleResult {
        let mut working = ctx.agent_states.clone();
        let mut result = ScheduleResult::default();

        let pending = ctx
            .task_list
            .iter()
            .filter(|task| !ctx.task_list.is_scheduled(task.id()))
            .sorted_by_key(|task| queue_order_key(task, ctx.queue_positions));
        for task in pending {
            if simulate_allocate(
                task,
                &mut working,
                ctx.soft_constraint,
                ctx.allow_heterogeneous_fits,
            ) {
                result.to_allocate.push(task.id().clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use bosun_common::id::AllocationId;

    use super::super::test_utils::*;
    use super::*;
    use crate::rm::group::Groups;
    use crate::rm::sort_state::JobSortState;
    use crate::rm::task_list::TaskList;

    #[test]
    fn test_fifo_by_submission_time() {
        let mut task_list = TaskList::new();
        task_list.add_task(request_at("late", "j1", 4, 200)).unwrap();
        task_list.add_task(request_at("early", "j2", 4, 100)).unwrap();
        task_list.add_task(request_at("big", "j3", 8, 50)).unwrap();
        let groups = Groups::new();
        let positions = JobSortState::new();
        let states = snapshot(vec![cuda_agent("a", 4), cuda_agent("b", 4)]);

        let mut scheduler = RoundRobinScheduler;
        let result = scheduler.schedule(&test_ctx(&task_list, &groups, &positions, &states));
        // The oldest submission spans both agents; nothing is left for the rest.
        assert_eq!(result.to_allocate, vec![AllocationId::from("big")]);
        assert!(result.to_release.is_empty());
    }
}
