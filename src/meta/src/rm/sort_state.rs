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

//! Secondary ordering of user-visible jobs within a priority band.
//!
//! Positions are decimals seeded from the job submission instant; moving a job
//! between two neighbors takes their midpoint, so any number of moves keeps
//! full precision without renumbering the queue.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use bosun_common::id::JobId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{MetaError, MetaResult};
use crate::rm::group::Groups;

/// Synthetic anchor naming the front of the queue.
pub fn head_anchor() -> JobId {
    JobId::from("HEAD")
}

/// Synthetic anchor naming the back of the queue.
pub fn tail_anchor() -> JobId {
    JobId::from("TAIL")
}

/// Gap left when inserting at either end of the queue, in microseconds.
fn boundary_gap() -> Decimal {
    Decimal::from(60_000_000u64)
}

/// The initial queue position of a job: its submission instant in
/// microseconds. Two jobs submitted at the same instant tie-break by job id
/// wherever positions are sorted.
pub fn initialize_queue_position(submission_time: DateTime<Utc>) -> Decimal {
    Decimal::from(submission_time.timestamp_micros())
}

/// Queue positions of the user-visible jobs in one pool.
#[derive(Clone, Debug, Default)]
pub struct JobSortState(HashMap<JobId, Decimal>);

impl JobSortState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `job_id` between `anchor` and `second_anchor`, returning the new
    /// position. The second anchor may be the head/tail sentinel when the
    /// anchor sits at an end of the queue.
    pub fn set_job_position(
        &mut self,
        job_id: &JobId,
        anchor: &JobId,
        second_anchor: &JobId,
    ) -> MetaResult<Decimal> {
        let anchor_pos = *self
            .0
            .get(anchor)
            .ok_or_else(|| MetaError::not_found("job", anchor))?;

        let position = if *second_anchor == head_anchor() {
            anchor_pos - boundary_gap()
        } else if *second_anchor == tail_anchor() {
            anchor_pos + boundary_gap()
        } else {
            let second_pos = *self
                .0
                .get(second_anchor)
                .ok_or_else(|| MetaError::not_found("job", second_anchor))?;
            (anchor_pos + second_pos) / Decimal::TWO
        };

        self.0.insert(job_id.clone(), position);
        Ok(position)
    }

    /// Reinstates a position persisted before a restart.
    pub fn recover_job_position(&mut self, job_id: &JobId, position: Decimal) {
        self.0.insert(job_id.clone(), position);
    }
}

impl Deref for JobSortState {
    type Target = HashMap<JobId, Decimal>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for JobSortState {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Jobs ordered the way the priority scheduler visits them:
/// `(priority, position, job id)`.
pub fn sorted_jobs(positions: &JobSortState, groups: &Groups) -> Vec<JobId> {
    let mut jobs: Vec<_> = positions.keys().cloned().collect();
    jobs.sort_by_key(|job| {
        let priority = groups.get(job).and_then(|g| g.priority).unwrap_or(0);
        let position = positions.get(job).copied().unwrap_or_default();
        (priority, position, job.clone())
    });
    jobs
}

/// Computes what moving `job_id` next to `anchor_id` entails: whether the move
/// requires adopting the anchor's priority, the job on the far side of the
/// anchor ("second anchor", possibly a head/tail sentinel), and the priority
/// to adopt.
pub fn find_anchor(
    job_id: &JobId,
    anchor_id: &JobId,
    ahead_of: bool,
    groups: &Groups,
    positions: &JobSortState,
) -> (bool, JobId, i32) {
    let anchor_priority = groups.get(anchor_id).and_then(|g| g.priority).unwrap_or(0);
    let job_priority = groups.get(job_id).and_then(|g| g.priority).unwrap_or(0);
    let needs_priority_change = job_priority != anchor_priority;

    let sorted = sorted_jobs(positions, groups);
    let mut second_anchor = JobId::default();
    for (i, job) in sorted.iter().enumerate() {
        if job == anchor_id {
            second_anchor = if ahead_of {
                if i == 0 {
                    head_anchor()
                } else {
                    sorted[i - 1].clone()
                }
            } else if i == sorted.len() - 1 {
                tail_anchor()
            } else {
                sorted[i + 1].clone()
            };
        }
    }

    (needs_priority_change, second_anchor, anchor_priority)
}

/// Whether a move is still required, i.e. whether `job` does not already sit
/// on the requested side of `anchor`, inside the gap bounded by the second
/// anchor. A sentinel second anchor bounds nothing.
pub fn need_move(
    job_pos: Decimal,
    anchor_pos: Decimal,
    second_anchor_pos: Option<Decimal>,
    ahead_of: bool,
) -> bool {
    if ahead_of {
        !(job_pos < anchor_pos && second_anchor_pos.map_or(true, |s| job_pos > s))
    } else {
        !(job_pos > anchor_pos && second_anchor_pos.map_or(true, |s| job_pos < s))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::rm::scheduler::test_utils::groups_with_priorities;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn state_with(jobs: &[(&str, i64)]) -> JobSortState {
        let mut state = JobSortState::new();
        for (job, secs) in jobs {
            state.insert(JobId::from(*job), initialize_queue_position(at(*secs)));
        }
        state
    }

    #[test]
    fn test_initial_positions_follow_submission_order() {
        assert!(initialize_queue_position(at(10)) < initialize_queue_position(at(20)));
    }

    #[test]
    fn test_set_job_position_midpoint() {
        let mut state = state_with(&[("j1", 100), ("j2", 200), ("j3", 300)]);
        let pos = state
            .set_job_position(&JobId::from("j3"), &JobId::from("j2"), &JobId::from("j1"))
            .unwrap();
        assert!(pos > state[&JobId::from("j1")]);
        assert!(pos < state[&JobId::from("j2")]);
    }

    #[test]
    fn test_set_job_position_at_head() {
        let mut state = state_with(&[("j1", 100), ("j2", 200)]);
        let pos = state
            .set_job_position(&JobId::from("j2"), &JobId::from("j1"), &head_anchor())
            .unwrap();
        assert!(pos < state[&JobId::from("j1")]);
    }

    #[test]
    fn test_find_anchor_reports_priority_change() {
        let state = state_with(&[("j1", 100), ("j2", 200), ("j3", 300)]);
        let groups = groups_with_priorities(&[("j1", 50), ("j2", 50), ("j3", 40)]);

        // Moving j1 ahead of j3 crosses into priority 40; j3 is the first job
        // of its band, so the far side is the head sentinel.
        let (change, second, priority) = find_anchor(
            &JobId::from("j1"),
            &JobId::from("j3"),
            true,
            &groups,
            &state,
        );
        assert!(change);
        assert_eq!(second, head_anchor());
        assert_eq!(priority, 40);

        // j2 already sits directly behind j1 in the 50 band.
        let (change, second, _) = find_anchor(
            &JobId::from("j2"),
            &JobId::from("j1"),
            false,
            &groups,
            &state,
        );
        assert!(!change);
        assert_eq!(second, JobId::from("j2"));
    }

    #[test]
    fn test_need_move() {
        let (a, b, c) = (Decimal::from(1), Decimal::from(2), Decimal::from(3));
        // j at a, anchor at b, far side open: already ahead.
        assert!(!need_move(a, b, None, true));
        // j at c wants ahead of anchor at b: must move.
        assert!(need_move(c, b, None, true));
        // j at b already between a and c.
        assert!(!need_move(b, c, Some(a), true));
        assert!(!need_move(b, a, Some(c), false));
    }
}
